//! Wasmbox network bridge
//!
//! Guests see one synchronous call: `fetch(url, method, headers, body)`
//! returning `(status, headers, body, error)`. Behind it sit a policy
//! engine (host allowlist plus optional method filter) consulted before
//! any traffic happens, and a mailbox that hands the approved request
//! to an out-of-task backend while the caller suspends.
//!
//! The backend is an explicit adapter trait: the core never probes the
//! ambient platform for an HTTP client.

pub mod bridge;
pub mod policy;

pub use bridge::{FetchBackend, Mailbox, MailboxState, NetBridge};
pub use policy::NetPolicy;

use serde::{Deserialize, Serialize};

/// Network-layer errors. Denials carry the policy reason; everything
/// else is a backend failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("NetworkDenied: {0}")]
    Denied(String),
    #[error("NetworkError: {0}")]
    Error(String),
}

fn default_method() -> String {
    String::from("GET")
}

/// An egress request as guests submit it. The body is base64 so the
/// whole request round-trips through JSON on the host-ABI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        FetchRequest {
            url: url.into(),
            method: default_method(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// The response handed back to a guest. A policy denial is a plain 403
/// with `error` set and no traffic; backend failures use status 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchResponse {
    /// The response produced for a policy denial.
    pub fn denied(reason: impl Into<String>) -> Self {
        FetchResponse {
            status: 403,
            headers: Vec::new(),
            body: String::new(),
            error: Some(reason.into()),
        }
    }

    /// The response produced for a transport/backend failure.
    pub fn failure(message: impl Into<String>) -> Self {
        FetchResponse {
            status: 0,
            headers: Vec::new(),
            body: String::new(),
            error: Some(message.into()),
        }
    }
}
