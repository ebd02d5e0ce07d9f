#![forbid(unsafe_code)]

//! UDP over IPv4.

use super::checksum::{ones_complement_finish, ones_complement_sum, pseudo_header_checksum_ipv4, transport_checksum};
use super::wire::Reader;
use super::ParseError;
use core::net::Ipv4Addr;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(buf);
        let src_port = r.u16()?;
        let dst_port = r.u16()?;
        let length = r.u16()?;
        let checksum = r.u16()?;
        if usize::from(length) < HEADER_LEN {
            return Err(ParseError::Invalid("UDP length shorter than header"));
        }
        let payload = r.take(usize::from(length) - HEADER_LEN)?;
        Ok(Self {
            src_port,
            dst_port,
            length,
            checksum,
            payload,
        })
    }

    /// Validate the checksum against the pseudo-header. An all-zero
    /// checksum means the sender skipped it (legal for UDP, and what
    /// offloading virtio guests produce), so it passes.
    pub fn checksum_ok(&self, wire: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        if self.checksum == 0 {
            return true;
        }
        let covered = &wire[..usize::from(self.length).min(wire.len())];
        let sum = ones_complement_sum(
            pseudo_header_checksum_ipv4(src, dst, 17, self.length),
            covered,
        );
        ones_complement_finish(sum) == 0
    }
}

/// Build one datagram, endpoints given as `(address, port)` pairs.
pub fn datagram(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u16;
    let mut out = Vec::with_capacity(usize::from(length));
    out.extend_from_slice(&src.1.to_be_bytes());
    out.extend_from_slice(&dst.1.to_be_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(payload);

    let checksum = match transport_checksum(src.0, dst.0, 17, &out) {
        // All-zero is reserved for "no checksum"; transmit its
        // complement instead.
        0 => 0xffff,
        sum => sum,
    };
    out[6..8].copy_from_slice(&checksum.to_be_bytes());
    out
}
