#![forbid(unsafe_code)]

use std::fmt;
use std::net::IpAddr;

/// Error raised by a hook. The failing request is surfaced to the guest as
/// a 502; the hook's message stays host-side.
#[derive(Debug)]
pub struct HookError(pub String);

impl HookError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook failed: {}", self.0)
    }
}

impl std::error::Error for HookError {}

/// The rewritable view of a request head handed to hooks. Header names
/// keep their original casing; emission preserves order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Absolute URL reconstructed from scheme, Host header, and target.
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for (n, v) in &mut self.headers {
            if n.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.headers.push((name.to_string(), value));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }
}

/// The response view handed to `ResponseHook`; body bytes stream through
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSummary {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Veto point over a fully-reconstructed request head. Runs before the
/// secret scan; can only deny.
pub trait RequestGate: Send + Sync {
    fn is_request_allowed(&self, head: &RequestHead) -> Result<bool, HookError>;
}

/// Veto point over each connect-time (hostname, resolved IP) pair. Runs
/// after the built-in internal-range check; can only deny.
pub trait IpGate: Send + Sync {
    fn is_ip_allowed(&self, hostname: &str, ip: IpAddr) -> Result<bool, HookError>;
}

/// Rewrites the request head before policy checks and replay.
pub trait RequestHeadHook: Send + Sync {
    fn on_request_head(&self, head: &mut RequestHead) -> Result<(), HookError>;
}

/// Rewrites the request with its body fully buffered. Installing this hook
/// is what opts a request into body buffering; it is deliberately a
/// separate trait from [`RequestHeadHook`].
pub trait RequestHook: Send + Sync {
    fn on_request(&self, head: &mut RequestHead, body: &mut Vec<u8>) -> Result<(), HookError>;
}

/// Observes the upstream response head before it is streamed to the guest.
pub trait ResponseHook: Send + Sync {
    fn on_response(&self, response: &ResponseSummary) -> Result<(), HookError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_access_is_case_insensitive_but_preserving() {
        let mut head = RequestHead {
            method: "GET".to_string(),
            url: "https://example.com/".to_string(),
            headers: vec![("X-Custom".to_string(), "a".to_string())],
        };
        assert_eq!(head.header("x-custom"), Some("a"));
        head.set_header("x-CUSTOM", "b");
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers[0].0, "X-Custom");
        assert_eq!(head.header("X-Custom"), Some("b"));
        head.remove_header("X-CUSTOM");
        assert!(head.headers.is_empty());
    }
}
