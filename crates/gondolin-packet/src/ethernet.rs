#![forbid(unsafe_code)]

//! Ethernet II framing.
//!
//! Parsing rejects frames whose source address is a group address:
//! nothing legitimate behind a virtio NIC transmits from a multicast or
//! broadcast MAC, and letting one through would poison MAC learning.

use super::wire::Reader;
use super::ParseError;
use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: Self = Self([0xff; 6]);

    pub fn octets(self) -> [u8; 6] {
        self.0
    }

    /// Group bit: multicast and broadcast destinations.
    pub fn is_group(self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub struct EtherType;

impl EtherType {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
}

/// Decoded view of a received frame; borrows the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetFrame<'a> {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    pub const HEADER_LEN: usize = 14;

    pub fn parse(buf: &'a [u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(buf);
        let dst = r.mac()?;
        let src = r.mac()?;
        if src.is_group() {
            return Err(ParseError::Invalid("group-address source MAC"));
        }
        let ethertype = r.u16()?;
        Ok(Self {
            dst,
            src,
            ethertype,
            payload: r.rest(),
        })
    }
}

/// The header of a frame the stack is about to transmit. Kept as an
/// owned value so reply paths can describe the header once and wrap
/// whatever payload each emission needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn wrap(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(EthernetFrame::HEADER_LEN + payload.len());
        frame.extend_from_slice(&self.dst.0);
        frame.extend_from_slice(&self.src.0);
        frame.extend_from_slice(&self.ethertype.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_then_parse_round_trips() {
        let header = EthernetHeader {
            dst: MacAddr::BROADCAST,
            src: MacAddr([2, 0, 0, 0, 0, 1]),
            ethertype: EtherType::ARP,
        };
        let wire = header.wrap(&[9, 8, 7]);
        let frame = EthernetFrame::parse(&wire).unwrap();
        assert_eq!(frame.dst, header.dst);
        assert_eq!(frame.src, header.src);
        assert_eq!(frame.ethertype, EtherType::ARP);
        assert_eq!(frame.payload, &[9, 8, 7]);
    }

    #[test]
    fn short_frame_is_truncated() {
        assert_eq!(EthernetFrame::parse(&[0u8; 13]), Err(ParseError::Truncated));
    }

    #[test]
    fn group_source_mac_is_rejected() {
        let header = EthernetHeader {
            dst: MacAddr([2, 0, 0, 0, 0, 1]),
            src: MacAddr::BROADCAST,
            ethertype: EtherType::IPV4,
        };
        assert!(EthernetFrame::parse(&header.wrap(&[])).is_err());

        let multicast = EthernetHeader {
            dst: MacAddr([2, 0, 0, 0, 0, 1]),
            src: MacAddr([0x01, 0x00, 0x5e, 0, 0, 1]),
            ethertype: EtherType::IPV4,
        };
        assert!(EthernetFrame::parse(&multicast.wrap(&[])).is_err());
    }

    #[test]
    fn mac_formats_as_colon_hex() {
        let mac = MacAddr([0x02, 0xaa, 0xbb, 0x0c, 0x0d, 0x0e]);
        assert_eq!(format!("{mac}"), "02:aa:bb:0c:0d:0e");
    }
}
