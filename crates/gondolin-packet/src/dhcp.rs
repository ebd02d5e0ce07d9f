#![forbid(unsafe_code)]

//! DHCPv4 (BOOTP) parsing and reply building, covering the option subset a
//! single-client lease server needs.

use super::{ethernet::MacAddr, ParseError};
use core::net::Ipv4Addr;

pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

pub const DHCP_OPT_SUBNET_MASK: u8 = 1;
pub const DHCP_OPT_ROUTER: u8 = 3;
pub const DHCP_OPT_DNS: u8 = 6;
pub const DHCP_OPT_HOSTNAME: u8 = 12;
pub const DHCP_OPT_MTU: u8 = 26;
pub const DHCP_OPT_BROADCAST: u8 = 28;
pub const DHCP_OPT_REQUESTED_IP: u8 = 50;
pub const DHCP_OPT_LEASE_TIME: u8 = 51;
pub const DHCP_OPT_MESSAGE_TYPE: u8 = 53;
pub const DHCP_OPT_SERVER_ID: u8 = 54;
pub const DHCP_OPT_RENEWAL_T1: u8 = 58;
pub const DHCP_OPT_REBINDING_T2: u8 = 59;
pub const DHCP_OPT_END: u8 = 255;
pub const DHCP_OPT_PAD: u8 = 0;

const BOOTP_FIXED_LEN: usize = 236;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl DhcpMessageType {
    fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }

    fn to_wire(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpClientOptions {
    pub message_type: Option<DhcpMessageType>,
    pub requested_ip: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub chaddr: MacAddr,
    pub options: DhcpClientOptions,
}

impl DhcpMessage {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < BOOTP_FIXED_LEN + 4 {
            return Err(ParseError::Truncated);
        }
        if buf[0] != 1 {
            return Err(ParseError::Invalid("not a BOOTREQUEST"));
        }
        if buf[1] != 1 || buf[2] != 6 {
            return Err(ParseError::Invalid("not an Ethernet client"));
        }
        if buf[BOOTP_FIXED_LEN..BOOTP_FIXED_LEN + 4] != DHCP_MAGIC_COOKIE {
            return Err(ParseError::Invalid("missing DHCP magic cookie"));
        }

        let mut options = DhcpClientOptions::default();
        let mut off = BOOTP_FIXED_LEN + 4;
        while off < buf.len() {
            let code = buf[off];
            if code == DHCP_OPT_END {
                break;
            }
            if code == DHCP_OPT_PAD {
                off += 1;
                continue;
            }
            if off + 1 >= buf.len() {
                return Err(ParseError::Truncated);
            }
            let len = buf[off + 1] as usize;
            let body_start = off + 2;
            if body_start + len > buf.len() {
                return Err(ParseError::Truncated);
            }
            let body = &buf[body_start..body_start + len];
            match code {
                DHCP_OPT_MESSAGE_TYPE if len == 1 => {
                    options.message_type = DhcpMessageType::from_wire(body[0]);
                }
                DHCP_OPT_REQUESTED_IP if len == 4 => {
                    options.requested_ip = Some(Ipv4Addr::new(body[0], body[1], body[2], body[3]));
                }
                DHCP_OPT_SERVER_ID if len == 4 => {
                    options.server_id = Some(Ipv4Addr::new(body[0], body[1], body[2], body[3]));
                }
                _ => {}
            }
            off = body_start + len;
        }

        Ok(Self {
            xid: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            flags: u16::from_be_bytes([buf[10], buf[11]]),
            ciaddr: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            yiaddr: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
            chaddr: MacAddr(buf[28..34].try_into().unwrap()),
            options,
        })
    }
}

/// Builds OFFER/ACK/NAK replies for the single fixed lease.
#[derive(Debug, Clone)]
pub struct DhcpReplyBuilder<'a> {
    pub message_type: DhcpMessageType,
    pub xid: u32,
    pub flags: u16,
    pub client_mac: MacAddr,
    pub your_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub dns_servers: &'a [Ipv4Addr],
    pub hostname: &'a str,
    pub mtu: u16,
    pub lease_time_secs: u32,
}

impl DhcpReplyBuilder<'_> {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; BOOTP_FIXED_LEN];
        out[0] = 2; // op = BOOTREPLY
        out[1] = 1; // htype = Ethernet
        out[2] = 6; // hlen
        out[4..8].copy_from_slice(&self.xid.to_be_bytes());
        out[10..12].copy_from_slice(&self.flags.to_be_bytes());
        out[16..20].copy_from_slice(&self.your_ip.octets()); // yiaddr
        out[20..24].copy_from_slice(&self.server_ip.octets()); // siaddr
        out[28..34].copy_from_slice(&self.client_mac.0); // chaddr

        out.extend_from_slice(&DHCP_MAGIC_COOKIE);
        push_opt(&mut out, DHCP_OPT_MESSAGE_TYPE, &[self.message_type.to_wire()]);
        push_opt(&mut out, DHCP_OPT_SERVER_ID, &self.server_ip.octets());
        push_opt(&mut out, DHCP_OPT_LEASE_TIME, &self.lease_time_secs.to_be_bytes());
        push_opt(
            &mut out,
            DHCP_OPT_RENEWAL_T1,
            &(self.lease_time_secs / 2).to_be_bytes(),
        );
        push_opt(
            &mut out,
            DHCP_OPT_REBINDING_T2,
            &(self.lease_time_secs / 8 * 7).to_be_bytes(),
        );
        push_opt(&mut out, DHCP_OPT_SUBNET_MASK, &self.subnet_mask.octets());
        push_opt(&mut out, DHCP_OPT_ROUTER, &self.router.octets());
        if !self.dns_servers.is_empty() {
            let mut body = Vec::with_capacity(4 * self.dns_servers.len());
            for ip in self.dns_servers {
                body.extend_from_slice(&ip.octets());
            }
            push_opt(&mut out, DHCP_OPT_DNS, &body);
        }
        if !self.hostname.is_empty() {
            push_opt(&mut out, DHCP_OPT_HOSTNAME, self.hostname.as_bytes());
        }
        push_opt(&mut out, DHCP_OPT_MTU, &self.mtu.to_be_bytes());
        push_opt(&mut out, DHCP_OPT_BROADCAST, &self.broadcast.octets());
        out.push(DHCP_OPT_END);
        out
    }
}

fn push_opt(out: &mut Vec<u8>, code: u8, body: &[u8]) {
    debug_assert!(body.len() <= u8::MAX as usize);
    out.push(code);
    out.push(body.len() as u8);
    out.extend_from_slice(body);
}
