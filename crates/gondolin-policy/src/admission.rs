#![forbid(unsafe_code)]

use crate::{is_internal_ip, HostPatternSet, IpGate};
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Allow,
    /// Hostname matched no allowed pattern.
    DenyHost,
    /// Resolved IP fell in the internal-range reject list.
    DenyInternalIp,
    /// The caller-supplied IP gate vetoed (or failed).
    DenyGate,
}

impl AdmitDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, AdmitDecision::Allow)
    }
}

/// The single admission check consulted by the DNS stub (NXDOMAIN), the
/// TLS interceptor (handshake refusal), the HTTP interceptor (replay), and
/// optionally the TCP SYN path. Built-in denies always win; the installed
/// gate can only narrow further.
#[derive(Clone)]
pub struct Admission {
    allowed_hosts: HostPatternSet,
    block_internal_ranges: bool,
    ip_gate: Option<Arc<dyn IpGate>>,
}

impl Admission {
    pub fn new(
        allowed_hosts: HostPatternSet,
        block_internal_ranges: bool,
        ip_gate: Option<Arc<dyn IpGate>>,
    ) -> Self {
        Self {
            allowed_hosts,
            block_internal_ranges,
            ip_gate,
        }
    }

    /// Hostname-only check, used where no IP exists yet (DNS stub, SYN to
    /// a synthetic address).
    pub fn admit_host(&self, hostname: &str) -> AdmitDecision {
        if !self.allowed_hosts.allows(hostname) {
            return AdmitDecision::DenyHost;
        }
        AdmitDecision::Allow
    }

    /// Full check over a (hostname, freshly-resolved IP) pair.
    pub fn admit(&self, hostname: &str, ip: IpAddr) -> AdmitDecision {
        if !self.allowed_hosts.allows(hostname) {
            return AdmitDecision::DenyHost;
        }
        if self.block_internal_ranges && is_internal_ip(ip) {
            return AdmitDecision::DenyInternalIp;
        }
        if let Some(gate) = &self.ip_gate {
            // A failing gate denies; it must never widen access.
            match gate.is_ip_allowed(hostname, ip) {
                Ok(true) => {}
                Ok(false) | Err(_) => return AdmitDecision::DenyGate,
            }
        }
        AdmitDecision::Allow
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("allowed_hosts", &self.allowed_hosts)
            .field("block_internal_ranges", &self.block_internal_ranges)
            .field("ip_gate", &self.ip_gate.is_some())
            .finish()
    }
}
