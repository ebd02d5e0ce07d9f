#![forbid(unsafe_code)]

use gondolin_packet::Ipv4Packet;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use crate::tcp::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    protocol: u8,
}

#[derive(Debug)]
struct FragBuffer {
    chunks: BTreeMap<usize, Vec<u8>>,
    total_len: Option<usize>,
    bytes: usize,
    created_ms: Millis,
}

/// IPv4 fragment reassembly with a hard size cap per datagram and a
/// timeout for abandoned buffers.
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<FragKey, FragBuffer>,
    max_datagram_bytes: usize,
    timeout_ms: Millis,
}

impl Reassembler {
    pub fn new(max_datagram_bytes: usize, timeout_ms: Millis) -> Self {
        Self {
            buffers: HashMap::new(),
            max_datagram_bytes,
            timeout_ms,
        }
    }

    /// Feed one fragment. Returns the reassembled transport payload once
    /// every piece has arrived; oversized datagrams are discarded whole.
    pub fn push(&mut self, pkt: &Ipv4Packet<'_>, now: Millis) -> Option<Vec<u8>> {
        let key = FragKey {
            src: pkt.src,
            dst: pkt.dst,
            id: pkt.identification,
            protocol: pkt.protocol,
        };
        let offset = pkt.fragment_offset();
        let end = offset + pkt.payload.len();
        if end > self.max_datagram_bytes {
            self.buffers.remove(&key);
            return None;
        }

        let buf = self.buffers.entry(key).or_insert_with(|| FragBuffer {
            chunks: BTreeMap::new(),
            total_len: None,
            bytes: 0,
            created_ms: now,
        });

        if !pkt.more_fragments() {
            buf.total_len = Some(end);
        }
        if let std::collections::btree_map::Entry::Vacant(entry) = buf.chunks.entry(offset) {
            buf.bytes += pkt.payload.len();
            entry.insert(pkt.payload.to_vec());
        }
        if buf.bytes > self.max_datagram_bytes {
            self.buffers.remove(&key);
            return None;
        }

        let total_len = buf.total_len?;
        // Contiguity check from offset zero.
        let mut have = 0usize;
        for (off, chunk) in &buf.chunks {
            if *off > have {
                return None;
            }
            have = have.max(off + chunk.len());
        }
        if have < total_len {
            return None;
        }

        let buf = self.buffers.remove(&key).unwrap();
        let mut out = vec![0u8; total_len];
        for (off, chunk) in buf.chunks {
            let end = (off + chunk.len()).min(total_len);
            out[off..end].copy_from_slice(&chunk[..end - off]);
        }
        Some(out)
    }

    pub fn expire(&mut self, now: Millis) {
        let timeout = self.timeout_ms;
        self.buffers
            .retain(|_, buf| now.saturating_sub(buf.created_ms) < timeout);
    }
}
