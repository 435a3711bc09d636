//! Egress policy engine
//!
//! Consulted before any network traffic. Hosts are matched exactly,
//! by `*.suffix` wildcard, or by a bare `*` that allows everything;
//! an empty allowlist denies all egress. An optional method filter
//! restricts the verbs on top of the host check.

use crate::NetError;

/// Allowlist-based egress policy.
#[derive(Debug, Clone, Default)]
pub struct NetPolicy {
    allowed_hosts: Vec<String>,
    allowed_methods: Option<Vec<String>>,
}

impl NetPolicy {
    /// The default policy: no egress at all.
    pub fn deny_all() -> Self {
        NetPolicy::default()
    }

    /// Allow the given hosts (exact names or `*.suffix` patterns).
    pub fn allow_hosts(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        NetPolicy {
            allowed_hosts: hosts.into_iter().map(|h| h.into().to_lowercase()).collect(),
            allowed_methods: None,
        }
    }

    /// Restrict the allowed methods (case-insensitive).
    pub fn with_methods(mut self, methods: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_methods = Some(
            methods
                .into_iter()
                .map(|m| m.into().to_uppercase())
                .collect(),
        );
        self
    }

    /// Check a request; the error carries the denial reason.
    pub fn check(&self, url: &str, method: &str) -> Result<(), NetError> {
        let host = host_of(url)
            .ok_or_else(|| NetError::Denied(format!("malformed url: {url}")))?;

        let host_ok = self.allowed_hosts.iter().any(|allowed| {
            if allowed == "*" {
                return true;
            }
            if let Some(suffix) = allowed.strip_prefix("*.") {
                return host == suffix || host.ends_with(&format!(".{suffix}"));
            }
            host == *allowed
        });
        if !host_ok {
            return Err(NetError::Denied(format!("host not allowed: {host}")));
        }

        if let Some(methods) = &self.allowed_methods {
            let method = method.to_uppercase();
            if !methods.iter().any(|m| *m == method) {
                return Err(NetError::Denied(format!("method not allowed: {method}")));
            }
        }
        Ok(())
    }
}

/// Extract the lowercased host from a URL, dropping scheme, userinfo,
/// port, path, query and fragment.
fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r)?;
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .filter(|a| !a.is_empty())?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = host_port.split(':').next().filter(|h| !h.is_empty())?;
    Some(host.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_host_match() {
        let policy = NetPolicy::allow_hosts(["api.example.com"]);
        assert!(policy.check("https://api.example.com/v1", "GET").is_ok());
        assert!(policy.check("https://evil.com/", "GET").is_err());
    }

    #[test]
    fn test_wildcard_suffix() {
        let policy = NetPolicy::allow_hosts(["*.example.com"]);
        assert!(policy.check("https://a.example.com/x", "GET").is_ok());
        assert!(policy.check("https://example.com/x", "GET").is_ok());
        assert!(policy.check("https://badexample.com/x", "GET").is_err());
    }

    #[test]
    fn test_deny_all_by_default() {
        let policy = NetPolicy::deny_all();
        let err = policy.check("https://example.com", "GET").unwrap_err();
        assert!(matches!(err, NetError::Denied(_)));
    }

    #[test]
    fn test_method_filter() {
        let policy = NetPolicy::allow_hosts(["api.example.com"]).with_methods(["GET", "HEAD"]);
        assert!(policy.check("https://api.example.com", "get").is_ok());
        let err = policy.check("https://api.example.com", "POST").unwrap_err();
        assert!(err.to_string().contains("method not allowed"));
    }

    #[test]
    fn test_host_extraction() {
        assert_eq!(host_of("https://Example.COM:8443/p?q#f").unwrap(), "example.com");
        assert_eq!(host_of("http://user:pw@host.io/x").unwrap(), "host.io");
        assert!(host_of("not a url").is_none());
        assert!(host_of("https:///nohost").is_none());
    }

    #[test]
    fn test_star_allows_everything() {
        let policy = NetPolicy::allow_hosts(["*"]);
        assert!(policy.check("https://anything.dev", "DELETE").is_ok());
    }
}
