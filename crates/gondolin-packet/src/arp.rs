#![forbid(unsafe_code)]

use super::wire::Reader;
use super::{ethernet::MacAddr, ParseError};
use core::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
}

/// An ARP packet for Ethernet/IPv4. Other hardware/protocol types are
/// rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: ArpOperation,
    pub sender_hw: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_hw: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub const LEN: usize = 28;

    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(buf);
        let htype = r.u16()?;
        let ptype = r.u16()?;
        let hlen = r.u8()?;
        let plen = r.u8()?;
        if htype != 1 || ptype != 0x0800 || hlen != 6 || plen != 4 {
            return Err(ParseError::Invalid("not Ethernet/IPv4 ARP"));
        }
        let op = match r.u16()? {
            1 => ArpOperation::Request,
            2 => ArpOperation::Reply,
            _ => return Err(ParseError::Invalid("unknown ARP operation")),
        };
        Ok(Self {
            op,
            sender_hw: r.mac()?,
            sender_ip: r.ipv4()?,
            target_hw: r.mac()?,
            target_ip: r.ipv4()?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&1u16.to_be_bytes()); // htype: Ethernet
        out.extend_from_slice(&0x0800u16.to_be_bytes()); // ptype: IPv4
        out.push(6);
        out.push(4);
        let op = match self.op {
            ArpOperation::Request => 1u16,
            ArpOperation::Reply => 2u16,
        };
        out.extend_from_slice(&op.to_be_bytes());
        out.extend_from_slice(&self.sender_hw.0);
        out.extend_from_slice(&self.sender_ip.octets());
        out.extend_from_slice(&self.target_hw.0);
        out.extend_from_slice(&self.target_ip.octets());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let pkt = ArpPacket {
            op: ArpOperation::Request,
            sender_hw: MacAddr([2, 0, 0, 0, 0, 2]),
            sender_ip: Ipv4Addr::new(10, 0, 2, 15),
            target_hw: MacAddr([0; 6]),
            target_ip: Ipv4Addr::new(10, 0, 2, 2),
        };
        assert_eq!(ArpPacket::parse(&pkt.serialize()), Ok(pkt));
    }

    #[test]
    fn rejects_non_ethernet_ipv4() {
        let mut wire = ArpPacket {
            op: ArpOperation::Reply,
            sender_hw: MacAddr([0; 6]),
            sender_ip: Ipv4Addr::UNSPECIFIED,
            target_hw: MacAddr([0; 6]),
            target_ip: Ipv4Addr::UNSPECIFIED,
        }
        .serialize();
        wire[1] = 6; // htype: IEEE 802
        assert!(ArpPacket::parse(&wire).is_err());
    }
}
