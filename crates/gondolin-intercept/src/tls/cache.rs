#![forbid(unsafe_code)]

use crate::tls::ca::{CertificateAuthority, LeafMaterial};
use crate::InterceptError;
use rustls::ServerConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One cached leaf plus its prebuilt rustls config. Handed out as an
/// `Arc`, so eviction can never invalidate a handshake already holding
/// the entry.
#[derive(Debug)]
pub struct MintedLeaf {
    pub host: String,
    pub material: LeafMaterial,
    pub server_config: Arc<ServerConfig>,
}

/// Bounded SNI -> leaf cache with LRU eviction.
///
/// Callers wrap this in a mutex; every operation here is a quick map
/// lookup, insert, or order bump, keeping the critical section minimal.
#[derive(Debug)]
pub struct CertCache {
    capacity: usize,
    entries: HashMap<String, Arc<MintedLeaf>>,
    /// Least-recently-used order, front = coldest.
    order: VecDeque<String>,
}

impl CertCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached leaf for `host`, re-minting when absent or near expiry.
    pub fn get_or_mint(
        &mut self,
        host: &str,
        ca: &CertificateAuthority,
    ) -> Result<Arc<MintedLeaf>, InterceptError> {
        if let Some(leaf) = self.entries.get(host) {
            if CertificateAuthority::leaf_is_fresh(leaf.material.not_after) {
                let leaf = leaf.clone();
                self.bump(host);
                return Ok(leaf);
            }
            self.remove(host);
        }

        let material = ca.mint_leaf(host)?;
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![material.cert_der.clone()],
                material.key_der.clone_key(),
            )?;
        let leaf = Arc::new(MintedLeaf {
            host: host.to_string(),
            material,
            server_config: Arc::new(server_config),
        });

        self.entries.insert(host.to_string(), leaf.clone());
        self.order.push_back(host.to_string());
        while self.entries.len() > self.capacity {
            let Some(coldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&coldest);
        }
        Ok(leaf)
    }

    fn bump(&mut self, host: &str) {
        if let Some(pos) = self.order.iter().position(|h| h == host) {
            let entry = self.order.remove(pos).unwrap();
            self.order.push_back(entry);
        }
    }

    fn remove(&mut self, host: &str) {
        self.entries.remove(host);
        if let Some(pos) = self.order.iter().position(|h| h == host) {
            self.order.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_lookup_reuses_the_same_leaf() {
        let ca = CertificateAuthority::generate().unwrap();
        let mut cache = CertCache::new(8);
        let a1 = cache.get_or_mint("a.example", &ca).unwrap();
        let a2 = cache.get_or_mint("a.example", &ca).unwrap();
        assert_eq!(a1.material.serial, a2.material.serial);

        let b = cache.get_or_mint("b.example", &ca).unwrap();
        assert_ne!(a1.material.serial, b.material.serial);
    }

    #[test]
    fn eviction_is_lru_and_bounded() {
        let ca = CertificateAuthority::generate().unwrap();
        let mut cache = CertCache::new(2);
        let a = cache.get_or_mint("a.example", &ca).unwrap();
        cache.get_or_mint("b.example", &ca).unwrap();

        // Touch `a` so `b` is the LRU entry when `c` pushes one out.
        cache.get_or_mint("a.example", &ca).unwrap();
        cache.get_or_mint("c.example", &ca).unwrap();
        assert_eq!(cache.len(), 2);

        let a_again = cache.get_or_mint("a.example", &ca).unwrap();
        assert_eq!(a.material.serial, a_again.material.serial, "a survived");
        // `b` was evicted and gets a fresh serial.
        assert!(cache.entries.contains_key("a.example"));
        assert!(cache.entries.contains_key("c.example") || cache.entries.contains_key("b.example"));
    }

    #[test]
    fn evicted_handle_remains_usable() {
        let ca = CertificateAuthority::generate().unwrap();
        let mut cache = CertCache::new(1);
        let a = cache.get_or_mint("a.example", &ca).unwrap();
        cache.get_or_mint("b.example", &ca).unwrap();
        assert_eq!(cache.len(), 1);
        // The Arc handle held across the eviction still carries its config.
        assert!(Arc::strong_count(&a) >= 1);
        let _ = a.server_config.clone();
    }
}
