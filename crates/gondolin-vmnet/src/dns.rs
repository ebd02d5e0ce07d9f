#![forbid(unsafe_code)]

use gondolin_intercept::{HostResolver, ResolveFuture, SystemResolver};
use std::collections::HashMap;
use std::net::IpAddr;

/// Host-side DNS used for connect-time resolution. A static override map
/// takes precedence over the system resolver; tests and air-gapped
/// deployments pin hostnames there.
#[derive(Debug, Default)]
pub struct HostDns {
    overrides: HashMap<String, Vec<IpAddr>>,
    system: SystemResolver,
}

impl HostDns {
    pub fn new(overrides: HashMap<String, Vec<IpAddr>>) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(name, ips)| (name.trim_end_matches('.').to_ascii_lowercase(), ips))
            .collect();
        Self {
            overrides,
            system: SystemResolver,
        }
    }
}

impl HostResolver for HostDns {
    fn resolve<'a>(&'a self, host: &'a str) -> ResolveFuture<'a> {
        let key = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(ips) = self.overrides.get(&key) {
            let ips = ips.clone();
            return Box::pin(async move { Ok(ips) });
        }
        self.system.resolve(host)
    }
}
