#![forbid(unsafe_code)]

use gondolin_packet::{DhcpMessage, DhcpMessageType, DhcpReplyBuilder, MacAddr};
use std::net::Ipv4Addr;

use crate::tcp::Millis;

/// The single DHCP binding this server ever hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub client_mac: MacAddr,
    pub assigned_ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: u16,
    pub lease_time_secs: u32,
    pub acked_at_ms: Millis,
}

impl Lease {
    pub fn expires_at_ms(&self) -> Millis {
        self.acked_at_ms + Millis::from(self.lease_time_secs) * 1000
    }
}

#[derive(Debug, Clone)]
pub struct DhcpParams {
    pub guest_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub dns_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub mtu: u16,
    pub lease_time_secs: u32,
    pub hostname: String,
}

/// Single-client DHCP server offering one fixed lease. DHCP from a
/// hostile guest is best-effort: anything malformed or unexpected is
/// dropped without a reply.
#[derive(Debug)]
pub struct DhcpServer {
    params: DhcpParams,
    lease: Option<Lease>,
}

impl DhcpServer {
    pub fn new(params: DhcpParams) -> Self {
        Self {
            params,
            lease: None,
        }
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn params(&self) -> &DhcpParams {
        &self.params
    }

    /// Expire the lease when the guest never renewed.
    pub fn on_tick(&mut self, now: Millis) {
        if let Some(lease) = &self.lease {
            if now >= lease.expires_at_ms() {
                self.lease = None;
            }
        }
    }

    /// Process one client message; returns the reply payload to send (as
    /// UDP 67 -> 68), or `None` to stay silent.
    pub fn handle_message(&mut self, msg: &DhcpMessage, now: Millis) -> Option<Vec<u8>> {
        let mtype = msg.options.message_type?;
        match mtype {
            DhcpMessageType::Discover => Some(self.reply(msg, DhcpMessageType::Offer)),
            DhcpMessageType::Request => {
                // A request for some other address gets a NAK so the
                // client restarts discovery.
                if let Some(requested) = msg.options.requested_ip {
                    if requested != self.params.guest_ip {
                        return Some(self.reply(msg, DhcpMessageType::Nak));
                    }
                }
                if msg.ciaddr != Ipv4Addr::UNSPECIFIED && msg.ciaddr != self.params.guest_ip {
                    return Some(self.reply(msg, DhcpMessageType::Nak));
                }
                self.lease = Some(Lease {
                    client_mac: msg.chaddr,
                    assigned_ip: self.params.guest_ip,
                    gateway: self.params.gateway_ip,
                    dns: self.params.dns_ip,
                    netmask: self.params.netmask,
                    mtu: self.params.mtu,
                    lease_time_secs: self.params.lease_time_secs,
                    acked_at_ms: now,
                });
                Some(self.reply(msg, DhcpMessageType::Ack))
            }
            DhcpMessageType::Release | DhcpMessageType::Decline => {
                if self
                    .lease
                    .as_ref()
                    .is_some_and(|lease| lease.client_mac == msg.chaddr)
                {
                    self.lease = None;
                }
                None
            }
            _ => None,
        }
    }

    fn reply(&self, msg: &DhcpMessage, message_type: DhcpMessageType) -> Vec<u8> {
        let your_ip = if message_type == DhcpMessageType::Nak {
            Ipv4Addr::UNSPECIFIED
        } else {
            self.params.guest_ip
        };
        DhcpReplyBuilder {
            message_type,
            xid: msg.xid,
            flags: msg.flags,
            client_mac: msg.chaddr,
            your_ip,
            server_ip: self.params.gateway_ip,
            subnet_mask: self.params.netmask,
            router: self.params.gateway_ip,
            broadcast: self.params.broadcast,
            dns_servers: &[self.params.dns_ip],
            hostname: &self.params.hostname,
            mtu: self.params.mtu,
            lease_time_secs: self.params.lease_time_secs,
        }
        .serialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DhcpParams {
        DhcpParams {
            guest_ip: Ipv4Addr::new(10, 0, 2, 15),
            gateway_ip: Ipv4Addr::new(10, 0, 2, 2),
            dns_ip: Ipv4Addr::new(10, 0, 2, 3),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            broadcast: Ipv4Addr::new(10, 0, 2, 255),
            mtu: 1500,
            lease_time_secs: 86400,
            hostname: "gondolin".to_string(),
        }
    }

    fn message(mtype: DhcpMessageType, requested: Option<Ipv4Addr>) -> DhcpMessage {
        DhcpMessage {
            xid: 0x42,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: MacAddr([2, 0, 0, 0, 0, 7]),
            options: gondolin_packet::dhcp::DhcpClientOptions {
                message_type: Some(mtype),
                requested_ip: requested,
                server_id: None,
            },
        }
    }

    #[test]
    fn discover_offer_request_ack() {
        let mut server = DhcpServer::new(params());
        let offer = server
            .handle_message(&message(DhcpMessageType::Discover, None), 0)
            .unwrap();
        assert_eq!(offer[0], 2);
        assert!(server.lease().is_none());

        let ack = server
            .handle_message(
                &message(DhcpMessageType::Request, Some(Ipv4Addr::new(10, 0, 2, 15))),
                10,
            )
            .unwrap();
        assert_eq!(&ack[16..20], &[10, 0, 2, 15]);
        let lease = server.lease().unwrap();
        assert_eq!(lease.assigned_ip, Ipv4Addr::new(10, 0, 2, 15));
        assert_eq!(lease.acked_at_ms, 10);
    }

    #[test]
    fn request_for_foreign_ip_is_nakked() {
        let mut server = DhcpServer::new(params());
        let nak = server
            .handle_message(
                &message(DhcpMessageType::Request, Some(Ipv4Addr::new(192, 168, 1, 50))),
                0,
            )
            .unwrap();
        // yiaddr must be zero in a NAK.
        assert_eq!(&nak[16..20], &[0, 0, 0, 0]);
        assert!(server.lease().is_none());
    }

    #[test]
    fn release_clears_the_lease() {
        let mut server = DhcpServer::new(params());
        server.handle_message(&message(DhcpMessageType::Request, None), 0);
        assert!(server.lease().is_some());
        assert_eq!(
            server.handle_message(&message(DhcpMessageType::Release, None), 1),
            None
        );
        assert!(server.lease().is_none());
    }

    #[test]
    fn lease_expires_without_renewal() {
        let mut server = DhcpServer::new(params());
        server.handle_message(&message(DhcpMessageType::Request, None), 0);
        server.on_tick(86_400_000 - 1);
        assert!(server.lease().is_some());
        server.on_tick(86_400_000);
        assert!(server.lease().is_none());
    }

    #[test]
    fn missing_message_type_is_dropped() {
        let mut server = DhcpServer::new(params());
        let mut msg = message(DhcpMessageType::Discover, None);
        msg.options.message_type = None;
        assert_eq!(server.handle_message(&msg, 0), None);
    }
}
