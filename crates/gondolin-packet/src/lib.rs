#![forbid(unsafe_code)]

//! Packet parsing and building for the Gondolin sandbox network plane.
//!
//! Parsers borrow the input byte slice and expose decoded fields without
//! allocating; builders return freshly-allocated `Vec<u8>` wire images.
//! Checksums are computed on serialize and validated on parse where the
//! protocol defines them.

pub mod arp;
pub mod checksum;
pub mod dhcp;
pub mod dns;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod tcp;
pub mod udp;
mod wire;

use core::fmt;

pub use arp::{ArpOperation, ArpPacket};
pub use dhcp::{DhcpMessage, DhcpMessageType, DhcpReplyBuilder};
pub use dns::{DnsAnswer, DnsQuery, DnsQuestion, DnsResponseBuilder, DnsResponseCode, DnsType};
pub use ethernet::{EtherType, EthernetFrame, EthernetHeader, MacAddr};
pub use icmp::IcmpEchoPacket;
pub use ipv4::{Ipv4Packet, Ipv4Protocol};
pub use tcp::{TcpFlags, TcpOptions, TcpSegment};
pub use udp::UdpDatagram;

/// Errors produced by the parsers in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer ended before the full header/payload could be read.
    Truncated,
    /// A field was structurally invalid.
    Invalid(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Truncated => write!(f, "packet truncated"),
            ParseError::Invalid(msg) => write!(f, "malformed packet: {msg}"),
        }
    }
}

impl std::error::Error for ParseError {}
