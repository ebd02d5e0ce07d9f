#![forbid(unsafe_code)]

//! Egress policy for the Gondolin sandbox: which hostnames the guest may
//! reach, which resolved IPs are acceptable, which secrets may be injected
//! into which requests, and the hook points the embedding application can
//! install.
//!
//! Policy is read-only after construction; the secret table is populated
//! once at VM build time. All checks here are synchronous and cheap so the
//! network plane can call them on every flow.

mod admission;
mod hooks;
mod hostmatch;
mod ipranges;
mod secrets;

pub use admission::{AdmitDecision, Admission};
pub use hooks::{
    HookError, IpGate, RequestGate, RequestHead, RequestHeadHook, RequestHook, ResponseHook,
    ResponseSummary,
};
pub use hostmatch::{HostPattern, HostPatternSet};
pub use ipranges::is_internal_ip;
pub use secrets::{SecretEntry, SecretSpec, SecretStore, PLACEHOLDER_PREFIX};

use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid host pattern {pattern:?}: {reason}")]
    InvalidHostPattern {
        pattern: String,
        reason: &'static str,
    },
    #[error("duplicate secret name {0:?}")]
    DuplicateSecret(String),
    #[error("secret {0:?} has an empty value")]
    EmptySecretValue(String),
}

/// Hook set installed by the embedding application. Every hook is optional
/// and fallible; a hook error aborts the single request in flight.
#[derive(Clone, Default)]
pub struct Hooks {
    pub request_gate: Option<Arc<dyn RequestGate>>,
    pub ip_gate: Option<Arc<dyn IpGate>>,
    pub on_request_head: Option<Arc<dyn RequestHeadHook>>,
    pub on_request: Option<Arc<dyn RequestHook>>,
    pub on_response: Option<Arc<dyn ResponseHook>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("request_gate", &self.request_gate.is_some())
            .field("ip_gate", &self.ip_gate.is_some())
            .field("on_request_head", &self.on_request_head.is_some())
            .field("on_request", &self.on_request.is_some())
            .field("on_response", &self.on_response.is_some())
            .finish()
    }
}

/// The complete egress policy, shared read-mostly across all flows.
#[derive(Debug, Clone)]
pub struct Policy {
    pub allowed_hosts: HostPatternSet,
    pub block_internal_ranges: bool,
    pub replace_secrets_in_query: bool,
    pub secrets: Arc<SecretStore>,
    pub hooks: Hooks,
}

impl Policy {
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    pub fn admission(&self) -> Admission {
        Admission::new(
            self.allowed_hosts.clone(),
            self.block_internal_ranges,
            self.hooks.ip_gate.clone(),
        )
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allowed_hosts: HostPatternSet::empty(),
            block_internal_ranges: true,
            replace_secrets_in_query: false,
            secrets: Arc::new(SecretStore::empty()),
            hooks: Hooks::default(),
        }
    }
}

#[derive(Default)]
pub struct PolicyBuilder {
    allowed_hosts: Vec<String>,
    block_internal_ranges: Option<bool>,
    replace_secrets_in_query: bool,
    secrets: Vec<SecretSpec>,
    hooks: Hooks,
}

impl PolicyBuilder {
    pub fn allow_host(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_hosts.push(pattern.into());
        self
    }

    pub fn allow_hosts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_hosts.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn block_internal_ranges(mut self, block: bool) -> Self {
        self.block_internal_ranges = Some(block);
        self
    }

    pub fn replace_secrets_in_query(mut self, replace: bool) -> Self {
        self.replace_secrets_in_query = replace;
        self
    }

    pub fn secret(mut self, spec: SecretSpec) -> Self {
        self.secrets.push(spec);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Result<Policy, PolicyError> {
        self.build_with_rng(&mut rand::rngs::OsRng)
    }

    /// Build with a caller-supplied RNG so placeholder minting is
    /// deterministic in tests.
    pub fn build_with_rng(self, rng: &mut dyn rand::RngCore) -> Result<Policy, PolicyError> {
        let allowed_hosts = HostPatternSet::compile(&self.allowed_hosts)?;
        let secrets = SecretStore::mint(self.secrets, rng)?;
        Ok(Policy {
            allowed_hosts,
            block_internal_ranges: self.block_internal_ranges.unwrap_or(true),
            replace_secrets_in_query: self.replace_secrets_in_query,
            secrets: Arc::new(secrets),
            hooks: self.hooks,
        })
    }
}
