#![forbid(unsafe_code)]

//! The guest-facing DNS stub.
//!
//! Names never resolve to real addresses here. An allowed name is mapped
//! to a synthetic IPv4 drawn from a private pool and the mapping is held
//! for the VM's lifetime; the host re-resolves the real origin lazily at
//! connect time, which is the DNS-rebinding defence. Names failing the
//! host allowlist answer NXDOMAIN.

use gondolin_packet::{DnsAnswer, DnsQuery, DnsResponseBuilder, DnsResponseCode, DnsType};
use gondolin_policy::Admission;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// First address handed out of the synthetic pool (198.18.0.0/15, the
/// IANA benchmarking range: never publicly routed, not in the internal
/// reject list, and disjoint from the guest subnet).
const POOL_BASE: u32 = u32::from_be_bytes([198, 18, 0, 1]);
const POOL_LAST: u32 = u32::from_be_bytes([198, 19, 255, 254]);

/// Bidirectional hostname <-> synthetic IP map. Bindings live for the VM
/// lifetime and are never reassigned.
#[derive(Debug, Default)]
pub struct NameBindings {
    forward: HashMap<String, Ipv4Addr>,
    reverse: HashMap<Ipv4Addr, String>,
    next: u32,
}

impl NameBindings {
    pub fn new() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
            next: POOL_BASE,
        }
    }

    /// Normalized lookup key: lowercased, no trailing dot.
    fn fold(name: &str) -> String {
        name.trim_end_matches('.').to_ascii_lowercase()
    }

    pub fn lookup(&self, name: &str) -> Option<Ipv4Addr> {
        self.forward.get(&Self::fold(name)).copied()
    }

    pub fn hostname_for(&self, ip: Ipv4Addr) -> Option<&str> {
        self.reverse.get(&ip).map(String::as_str)
    }

    /// Existing binding, or a fresh synthetic IP if the pool has room.
    pub fn bind(&mut self, name: &str) -> Option<Ipv4Addr> {
        let key = Self::fold(name);
        if let Some(ip) = self.forward.get(&key) {
            return Some(*ip);
        }
        if self.next > POOL_LAST {
            return None;
        }
        let ip = Ipv4Addr::from(self.next);
        self.next += 1;
        self.forward.insert(key.clone(), ip);
        self.reverse.insert(ip, key);
        Some(ip)
    }

    pub fn bound_ips(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.reverse.keys().copied()
    }

    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        self.reverse.contains_key(&ip)
    }
}

/// Outcome of one guest query, ready for UDP framing by the stack.
#[derive(Debug, PartialEq, Eq)]
pub struct DnsReply {
    pub payload: Vec<u8>,
    pub dst_port: u16,
}

pub struct DnsStub {
    pub ttl_secs: u32,
}

impl DnsStub {
    /// Answer a guest query. `None` means the datagram was not a
    /// well-formed query and is dropped silently.
    pub fn handle_query(
        &self,
        payload: &[u8],
        src_port: u16,
        bindings: &mut NameBindings,
        admission: &Admission,
    ) -> Option<DnsReply> {
        let query = DnsQuery::parse(payload).ok()?;
        let name = query.question.name.trim_end_matches('.').to_ascii_lowercase();
        let qtype = query.question.qtype;

        let respond = |answer: Option<DnsAnswer>, rcode: DnsResponseCode| {
            DnsResponseBuilder {
                id: query.id,
                recursion_desired: query.recursion_desired,
                question: &query.question,
                answer,
                rcode,
            }
            .serialize()
            .ok()
            .map(|payload| DnsReply {
                payload,
                dst_port: src_port,
            })
        };

        if query.question.qclass != 1 {
            return respond(None, DnsResponseCode::NoError);
        }

        if qtype == DnsType::A as u16 || qtype == DnsType::Aaaa as u16 {
            if !admission.admit_host(&name).is_allowed() {
                return respond(None, DnsResponseCode::NameError);
            }
            // AAAA gets an empty authoritative answer so clients fall back
            // to A; the synthetic pool is IPv4-only.
            if qtype == DnsType::Aaaa as u16 {
                return respond(None, DnsResponseCode::NoError);
            }
            return match bindings.bind(&name) {
                Some(addr) => respond(
                    Some(DnsAnswer {
                        addr,
                        ttl_secs: self.ttl_secs,
                    }),
                    DnsResponseCode::NoError,
                ),
                None => respond(None, DnsResponseCode::ServerFailure),
            };
        }

        // Anything else: empty authoritative NOERROR.
        respond(None, DnsResponseCode::NoError)
    }
}
