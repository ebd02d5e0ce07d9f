#![forbid(unsafe_code)]

use gondolin_intercept::InterceptorConfig;
use gondolin_stack::StackConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Driver configuration. Policy (allowed hosts, secrets, hooks) is
/// supplied separately by the embedding; everything here is plumbing.
#[derive(Debug, Clone, Default)]
pub struct VmNetConfig {
    pub stack: StackConfig,
    pub intercept: InterceptorConfig,

    /// Persist the interception CA at these paths instead of generating
    /// an ephemeral one per process.
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,

    /// Write a pcap of all guest-side frames into this directory.
    pub capture_dir: Option<PathBuf>,

    /// Pin hostnames to addresses, bypassing system DNS.
    pub dns_overrides: HashMap<String, Vec<IpAddr>>,

    /// Override the default upstream request timeout.
    pub upstream_request_timeout: Option<Duration>,
    /// Follow upstream redirects host-side (each hop re-admitted).
    pub follow_redirects: bool,
}

impl VmNetConfig {
    /// Environment overrides, `GONDOLIN_*`, applied on top of defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(dir) = env_var("GONDOLIN_CAPTURE_DIR") {
            cfg.capture_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = env_var("GONDOLIN_CA_CERT") {
            cfg.ca_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_var("GONDOLIN_CA_KEY") {
            cfg.ca_key_path = Some(PathBuf::from(path));
        }
        if let Some(n) = env_parse::<u32>("GONDOLIN_MAX_TCP_CONNECTIONS") {
            cfg.stack.max_tcp_connections = n;
        }
        if let Some(n) = env_parse::<usize>("GONDOLIN_TCP_RECV_BUFFER") {
            cfg.stack.tcp.recv_buffer_bytes = n;
        }
        if let Some(n) = env_parse::<usize>("GONDOLIN_TCP_SEND_BUFFER") {
            cfg.stack.tcp.send_buffer_bytes = n;
        }
        if let Some(ms) = env_parse::<u64>("GONDOLIN_UPSTREAM_TIMEOUT_MS") {
            cfg.upstream_request_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(n) = env_parse::<usize>("GONDOLIN_CERT_CACHE_CAPACITY") {
            cfg.intercept.cert_cache_capacity = n;
        }

        cfg
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}
