//! Synchronous-fetch mailbox bridge
//!
//! The guest-visible contract is a plain synchronous call. Internally
//! the bridge parks the request in a mailbox, hands it to an
//! out-of-task backend, and suspends the caller until the state word
//! flips to response-ready (or error). The mailbox has exactly one
//! producer and one consumer; under a single-threaded host the handoff
//! collapses to a direct call, and the contract stays the same.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_channel::oneshot;
use parking_lot::Mutex;

use crate::policy::NetPolicy;
use crate::{FetchRequest, FetchResponse, NetError};

/// Mailbox handoff states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MailboxState {
    Idle = 0,
    RequestReady = 1,
    ResponseReady = 2,
    Error = 3,
}

impl MailboxState {
    fn from_u32(v: u32) -> MailboxState {
        match v {
            1 => MailboxState::RequestReady,
            2 => MailboxState::ResponseReady,
            3 => MailboxState::Error,
            _ => MailboxState::Idle,
        }
    }
}

#[derive(Default)]
struct MailboxSlots {
    request: Option<FetchRequest>,
    response: Option<Result<FetchResponse, NetError>>,
}

/// Single-producer / single-consumer work mailbox with a fixed state
/// word.
pub struct Mailbox {
    state: AtomicU32,
    slots: Mutex<MailboxSlots>,
}

impl Mailbox {
    pub fn new() -> Self {
        Mailbox {
            state: AtomicU32::new(MailboxState::Idle as u32),
            slots: Mutex::new(MailboxSlots::default()),
        }
    }

    pub fn state(&self) -> MailboxState {
        MailboxState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Park a request. Fails when a previous exchange is still in
    /// flight.
    pub fn submit(&self, request: FetchRequest) -> Result<(), NetError> {
        let idle = MailboxState::Idle as u32;
        let ready = MailboxState::RequestReady as u32;
        if self
            .state
            .compare_exchange(idle, ready, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(NetError::Error(String::from("fetch already in flight")));
        }
        self.slots.lock().request = Some(request);
        Ok(())
    }

    /// Consumer side: take the parked request.
    pub fn take_request(&self) -> Option<FetchRequest> {
        self.slots.lock().request.take()
    }

    /// Consumer side: store the outcome and flip the state word.
    pub fn complete(&self, outcome: Result<FetchResponse, NetError>) {
        let next = match &outcome {
            Ok(_) => MailboxState::ResponseReady,
            Err(_) => MailboxState::Error,
        };
        self.slots.lock().response = Some(outcome);
        self.state.store(next as u32, Ordering::Release);
    }

    /// Producer side: collect the outcome and return to idle.
    pub fn take_response(&self) -> Option<Result<FetchResponse, NetError>> {
        let out = self.slots.lock().response.take();
        self.state
            .store(MailboxState::Idle as u32, Ordering::Release);
        out
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Platform adapter performing the actual HTTP exchange. Implementations
/// may block; they run on the blocking pool, never on the event loop.
pub trait FetchBackend: Send + Sync {
    fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, NetError>;
}

/// The bridge owned by a sandbox.
pub struct NetBridge {
    policy: NetPolicy,
    backend: Option<Arc<dyn FetchBackend>>,
    mailbox: Arc<Mailbox>,
}

impl NetBridge {
    pub fn new(policy: NetPolicy, backend: Option<Arc<dyn FetchBackend>>) -> Self {
        NetBridge {
            policy,
            backend,
            mailbox: Arc::new(Mailbox::new()),
        }
    }

    /// The sync-callable fetch contract. Policy denials produce a 403
    /// response without touching the backend; transport failures become
    /// an error field, never a host exception.
    pub async fn fetch(&self, request: FetchRequest) -> FetchResponse {
        if let Err(NetError::Denied(reason)) | Err(NetError::Error(reason)) =
            self.policy.check(&request.url, &request.method)
        {
            log::debug!("fetch denied: {reason}");
            return FetchResponse::denied(reason);
        }
        let Some(backend) = self.backend.clone() else {
            return FetchResponse::failure("no fetch backend configured");
        };

        if let Err(e) = self.mailbox.submit(request) {
            return FetchResponse::failure(e.to_string());
        }
        let mailbox = Arc::clone(&self.mailbox);
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let outcome = match mailbox.take_request() {
                Some(req) => backend.execute(&req),
                None => Err(NetError::Error(String::from("mailbox request vanished"))),
            };
            mailbox.complete(outcome);
            let _ = tx.send(());
        });

        // Suspend until the state word flips.
        let _ = rx.await;
        match self.mailbox.take_response() {
            Some(Ok(response)) => response,
            Some(Err(e)) => FetchResponse::failure(e.to_string()),
            None => FetchResponse::failure("mailbox response vanished"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedBackend {
        calls: AtomicUsize,
        status: u16,
    }

    impl ScriptedBackend {
        fn new(status: u16) -> Arc<Self> {
            Arc::new(ScriptedBackend {
                calls: AtomicUsize::new(0),
                status,
            })
        }
    }

    impl FetchBackend for ScriptedBackend {
        fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchResponse {
                status: self.status,
                headers: vec![(String::from("x-url"), request.url.clone())],
                body: String::new(),
                error: None,
            })
        }
    }

    #[tokio::test]
    async fn test_allowed_fetch_reaches_backend() {
        let backend = ScriptedBackend::new(200);
        let bridge = NetBridge::new(
            NetPolicy::allow_hosts(["api.example.com"]),
            Some(backend.clone() as Arc<dyn FetchBackend>),
        );
        let resp = bridge
            .fetch(FetchRequest::get("https://api.example.com/data"))
            .await;
        assert_eq!(resp.status, 200);
        assert!(resp.error.is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.mailbox.state(), MailboxState::Idle);
    }

    #[tokio::test]
    async fn test_denial_is_403_with_no_traffic() {
        let backend = ScriptedBackend::new(200);
        let bridge = NetBridge::new(
            NetPolicy::deny_all(),
            Some(backend.clone() as Arc<dyn FetchBackend>),
        );
        let resp = bridge
            .fetch(FetchRequest::get("https://api.example.com/data"))
            .await;
        assert_eq!(resp.status, 403);
        assert!(resp.error.as_deref().unwrap().contains("not allowed"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_backend_is_error_field() {
        let bridge = NetBridge::new(NetPolicy::allow_hosts(["*"]), None);
        let resp = bridge.fetch(FetchRequest::get("https://x.dev")).await;
        assert_eq!(resp.status, 0);
        assert!(resp.error.is_some());
    }

    #[test]
    fn test_mailbox_state_machine() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.state(), MailboxState::Idle);
        mailbox.submit(FetchRequest::get("https://a")).unwrap();
        assert_eq!(mailbox.state(), MailboxState::RequestReady);
        // A second submit while in flight is rejected.
        assert!(mailbox.submit(FetchRequest::get("https://b")).is_err());

        let req = mailbox.take_request().unwrap();
        assert_eq!(req.url, "https://a");
        mailbox.complete(Err(NetError::Error(String::from("boom"))));
        assert_eq!(mailbox.state(), MailboxState::Error);
        assert!(mailbox.take_response().unwrap().is_err());
        assert_eq!(mailbox.state(), MailboxState::Idle);
    }
}
