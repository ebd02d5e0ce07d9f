#![forbid(unsafe_code)]

use gondolin_packet::MacAddr;
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::tcp::Millis;

/// IPv4 -> MAC cache with insertion-time expiry. The guest's own entry is
/// refreshed on every frame and so never ages out in practice.
#[derive(Debug)]
pub struct ArpTable {
    entries: HashMap<Ipv4Addr, (MacAddr, Millis)>,
    ttl_ms: Millis,
}

impl ArpTable {
    pub fn new(ttl_ms: Millis) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms,
        }
    }

    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddr, now: Millis) {
        self.entries.insert(ip, (mac, now));
    }

    pub fn lookup(&self, ip: Ipv4Addr, now: Millis) -> Option<MacAddr> {
        self.entries
            .get(&ip)
            .filter(|(_, inserted)| now.saturating_sub(*inserted) < self.ttl_ms)
            .map(|(mac, _)| *mac)
    }

    pub fn expire(&mut self, now: Millis) {
        let ttl = self.ttl_ms;
        self.entries
            .retain(|_, (_, inserted)| now.saturating_sub(*inserted) < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_age_out() {
        let mut table = ArpTable::new(1000);
        let mac = MacAddr([2, 0, 0, 0, 0, 1]);
        table.insert(Ipv4Addr::new(10, 0, 2, 15), mac, 0);
        assert_eq!(table.lookup(Ipv4Addr::new(10, 0, 2, 15), 500), Some(mac));
        assert_eq!(table.lookup(Ipv4Addr::new(10, 0, 2, 15), 1500), None);

        table.expire(1500);
        assert!(table.entries.is_empty());
    }

    #[test]
    fn refresh_resets_the_clock() {
        let mut table = ArpTable::new(1000);
        let mac = MacAddr([2, 0, 0, 0, 0, 1]);
        table.insert(Ipv4Addr::new(10, 0, 2, 15), mac, 0);
        table.insert(Ipv4Addr::new(10, 0, 2, 15), mac, 900);
        assert_eq!(table.lookup(Ipv4Addr::new(10, 0, 2, 15), 1500), Some(mac));
    }
}
