#![forbid(unsafe_code)]

use crate::arp::ArpTable;
use crate::dhcp::{DhcpParams, DhcpServer, Lease};
use crate::dns::{DnsStub, NameBindings};
use crate::frag::Reassembler;
use crate::tcp::{ConnOutput, Millis, SegmentSpec, TcpConn, TcpKey, TcpTuning};
use gondolin_packet::{
    icmp, udp, ArpOperation, ArpPacket, DhcpMessage, EtherType, EthernetFrame, EthernetHeader,
    IcmpEchoPacket, Ipv4Packet, Ipv4Protocol, MacAddr, TcpFlags, TcpSegment, UdpDatagram,
};
use gondolin_policy::Admission;
use rand::RngCore;
use std::collections::HashMap;
use std::net::Ipv4Addr;

pub type FlowId = u32;

#[derive(Debug, Clone)]
pub struct StackConfig {
    pub our_mac: MacAddr,
    pub gateway_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub dns_ip: Ipv4Addr,
    pub mtu: u16,
    pub guest_hostname: String,

    pub dhcp_lease_time_secs: u32,
    /// TTL on synthetic DNS answers; kept short so a future unbinding is
    /// honored quickly by guest caches.
    pub dns_ttl_secs: u32,

    /// Maximum concurrent TCP connections. A SYN beyond the cap is
    /// answered with RST and no state is allocated.
    pub max_tcp_connections: u32,
    pub tcp: TcpTuning,

    /// Answer denied SYNs with ICMP administratively-prohibited instead
    /// of a bare RST.
    pub emit_unreachable_on_deny: bool,

    pub arp_ttl_ms: Millis,
    pub frag_max_datagram_bytes: usize,
    pub frag_timeout_ms: Millis,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            our_mac: MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            gateway_ip: Ipv4Addr::new(10, 0, 2, 2),
            guest_ip: Ipv4Addr::new(10, 0, 2, 15),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            broadcast: Ipv4Addr::new(10, 0, 2, 255),
            dns_ip: Ipv4Addr::new(10, 0, 2, 3),
            mtu: 1500,
            guest_hostname: "gondolin".to_string(),
            dhcp_lease_time_secs: 86400,
            dns_ttl_secs: 60,
            max_tcp_connections: 1024,
            tcp: TcpTuning::default(),
            emit_unreachable_on_deny: false,
            arp_ttl_ms: 60_000,
            frag_max_datagram_bytes: 64 * 1024,
            frag_timeout_ms: 30_000,
        }
    }
}

/// Outputs of the stack, consumed by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Deliver an Ethernet frame to the guest NIC.
    EmitFrame(Vec<u8>),
    /// A new guest connection was accepted toward `host`.
    FlowOpen {
        flow: FlowId,
        host: String,
        ip: Ipv4Addr,
        port: u16,
    },
    /// In-order payload bytes from the guest.
    FlowData { flow: FlowId, data: Vec<u8> },
    /// The guest acknowledged this many host-sent bytes; releases send
    /// credit.
    FlowAcked { flow: FlowId, bytes: usize },
    /// The guest closed its send direction (EOF).
    FlowFin { flow: FlowId },
    /// The connection died (RST, retransmit exhaustion, protocol abuse).
    FlowReset { flow: FlowId },
}

/// Inputs from the flow layer back into the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowIo {
    /// Queue host bytes toward the guest.
    Send { flow: FlowId, data: Vec<u8> },
    /// The flow layer consumed delivered bytes (reopens the window).
    Consumed { flow: FlowId, bytes: usize },
    /// Graceful FIN toward the guest.
    Shutdown { flow: FlowId },
    /// Abort with RST.
    Abort { flow: FlowId },
}

/// Drop/deny counters, exported to the driver's metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackStats {
    pub frames_dropped: u64,
    pub syns_denied: u64,
    pub dns_queries: u64,
    pub dns_denied: u64,
    pub tcp_opened: u64,
    pub tcp_closed: u64,
}

struct ConnEntry {
    id: FlowId,
    conn: TcpConn,
}

pub struct NetworkStack {
    cfg: StackConfig,
    admission: Admission,
    rng: Box<dyn rand::RngCore + Send>,

    guest_mac: Option<MacAddr>,
    arp: ArpTable,
    dhcp: DhcpServer,
    dns: DnsStub,
    bindings: NameBindings,
    reasm: Reassembler,

    ipv4_ident: u16,
    next_flow_id: FlowId,
    conns: HashMap<TcpKey, ConnEntry>,
    flows: HashMap<FlowId, TcpKey>,

    pub stats: StackStats,
}

impl NetworkStack {
    pub fn new(cfg: StackConfig, admission: Admission) -> Self {
        Self::with_rng(cfg, admission, Box::new(rand::rngs::OsRng))
    }

    /// Injected RNG keeps ISN allocation deterministic in tests.
    pub fn with_rng(
        cfg: StackConfig,
        admission: Admission,
        rng: Box<dyn rand::RngCore + Send>,
    ) -> Self {
        let dhcp = DhcpServer::new(DhcpParams {
            guest_ip: cfg.guest_ip,
            gateway_ip: cfg.gateway_ip,
            dns_ip: cfg.dns_ip,
            netmask: cfg.netmask,
            broadcast: cfg.broadcast,
            mtu: cfg.mtu,
            lease_time_secs: cfg.dhcp_lease_time_secs,
            hostname: cfg.guest_hostname.clone(),
        });
        Self {
            dns: DnsStub {
                ttl_secs: cfg.dns_ttl_secs,
            },
            arp: ArpTable::new(cfg.arp_ttl_ms),
            reasm: Reassembler::new(cfg.frag_max_datagram_bytes, cfg.frag_timeout_ms),
            dhcp,
            cfg,
            admission,
            rng,
            guest_mac: None,
            bindings: NameBindings::new(),
            ipv4_ident: 1,
            next_flow_id: 1,
            conns: HashMap::new(),
            flows: HashMap::new(),
            stats: StackStats::default(),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.cfg
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.dhcp.lease()
    }

    pub fn is_ip_assigned(&self) -> bool {
        self.dhcp.lease().is_some()
    }

    pub fn bindings(&self) -> &NameBindings {
        &self.bindings
    }

    /// Gratuitous ARP for the gateway, announced on link-up so the guest
    /// learns our MAC without probing.
    pub fn link_up(&mut self) -> Vec<Action> {
        let arp = ArpPacket {
            op: ArpOperation::Reply,
            sender_hw: self.cfg.our_mac,
            sender_ip: self.cfg.gateway_ip,
            target_hw: MacAddr::BROADCAST,
            target_ip: self.cfg.gateway_ip,
        };
        let eth = EthernetHeader {
            dst: MacAddr::BROADCAST,
            src: self.cfg.our_mac,
            ethertype: EtherType::ARP,
        }
        .wrap(&arp.serialize());
        vec![Action::EmitFrame(eth)]
    }

    /// Process one Ethernet frame arriving from the guest NIC.
    pub fn handle_frame(&mut self, frame: &[u8], now: Millis) -> Vec<Action> {
        let eth = match EthernetFrame::parse(frame) {
            Ok(eth) => eth,
            Err(_) => {
                self.stats.frames_dropped += 1;
                return Vec::new();
            }
        };

        // Learn the guest MAC; replies need it.
        self.guest_mac.get_or_insert(eth.src);

        match eth.ethertype {
            EtherType::ARP => self.handle_arp(eth.payload, now),
            EtherType::IPV4 => self.handle_ipv4(eth.payload, now),
            _ => Vec::new(),
        }
    }

    /// Process flow-layer input (host-side data and window updates).
    pub fn handle_flow_io(&mut self, io: FlowIo, now: Millis) -> Vec<Action> {
        let flow = match &io {
            FlowIo::Send { flow, .. }
            | FlowIo::Consumed { flow, .. }
            | FlowIo::Shutdown { flow }
            | FlowIo::Abort { flow } => *flow,
        };
        let Some(key) = self.flows.get(&flow).copied() else {
            return Vec::new();
        };
        let Some(entry) = self.conns.get_mut(&key) else {
            return Vec::new();
        };

        let mut outputs = Vec::new();
        match io {
            FlowIo::Send { data, .. } => {
                let accepted = entry.conn.send(&data, now, &mut outputs);
                if accepted < data.len() {
                    // The driver's send credit should make this
                    // unreachable; drop the overflow rather than grow.
                    self.stats.frames_dropped += 1;
                }
            }
            FlowIo::Consumed { bytes, .. } => entry.conn.consume(bytes, &mut outputs),
            FlowIo::Shutdown { .. } => entry.conn.shutdown(now, &mut outputs),
            FlowIo::Abort { .. } => entry.conn.abort(&mut outputs),
        }

        let actions = self.map_conn_outputs(key, flow, outputs);
        self.reap(key);
        actions
    }

    /// Drive timers. Call roughly every 100 ms.
    pub fn poll(&mut self, now: Millis) -> Vec<Action> {
        let mut actions = Vec::new();
        let keys: Vec<TcpKey> = self.conns.keys().copied().collect();
        for key in keys {
            let Some(entry) = self.conns.get_mut(&key) else {
                continue;
            };
            let id = entry.id;
            let mut outputs = Vec::new();
            entry.conn.on_tick(now, &mut outputs);
            actions.extend(self.map_conn_outputs(key, id, outputs));
            self.reap(key);
        }
        self.arp.expire(now);
        self.reasm.expire(now);
        self.dhcp.on_tick(now);
        actions
    }

    fn handle_arp(&mut self, payload: &[u8], now: Millis) -> Vec<Action> {
        let arp = match ArpPacket::parse(payload) {
            Ok(a) => a,
            Err(_) => {
                self.stats.frames_dropped += 1;
                return Vec::new();
            }
        };

        if arp.sender_ip != Ipv4Addr::UNSPECIFIED {
            self.arp.insert(arp.sender_ip, arp.sender_hw, now);
            if self.is_ip_assigned() && arp.sender_ip == self.cfg.guest_ip {
                self.guest_mac = Some(arp.sender_hw);
            }
        }

        if arp.op != ArpOperation::Request {
            return Vec::new();
        }
        let ours = arp.target_ip == self.cfg.gateway_ip
            || arp.target_ip == self.cfg.dns_ip
            || self.bindings.contains_ip(arp.target_ip);
        if !ours {
            return Vec::new();
        }

        let reply = ArpPacket {
            op: ArpOperation::Reply,
            sender_hw: self.cfg.our_mac,
            sender_ip: arp.target_ip,
            target_hw: arp.sender_hw,
            target_ip: arp.sender_ip,
        };
        let eth = EthernetHeader {
            dst: arp.sender_hw,
            src: self.cfg.our_mac,
            ethertype: EtherType::ARP,
        }
        .wrap(&reply.serialize());
        vec![Action::EmitFrame(eth)]
    }

    fn handle_ipv4(&mut self, payload: &[u8], now: Millis) -> Vec<Action> {
        let pkt = match Ipv4Packet::parse(payload) {
            Ok(p) => p,
            Err(_) => {
                self.stats.frames_dropped += 1;
                return Vec::new();
            }
        };

        if pkt.is_fragment() {
            let Some(reassembled) = self.reasm.push(&pkt, now) else {
                return Vec::new();
            };
            let (src, dst, protocol) = (pkt.src, pkt.dst, pkt.protocol);
            return self.handle_transport(src, dst, protocol, &reassembled, now);
        }

        let (src, dst, protocol) = (pkt.src, pkt.dst, pkt.protocol);
        let payload = pkt.payload;
        self.handle_transport(src, dst, protocol, payload, now)
    }

    fn handle_transport(
        &mut self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        payload: &[u8],
        now: Millis,
    ) -> Vec<Action> {
        match protocol {
            Ipv4Protocol::UDP => self.handle_udp(src, dst, payload, now),
            Ipv4Protocol::TCP => self.handle_tcp(src, dst, payload, now),
            Ipv4Protocol::ICMP => self.handle_icmp(dst, payload),
            _ => {
                self.stats.frames_dropped += 1;
                Vec::new()
            }
        }
    }

    fn handle_udp(
        &mut self,
        _src: Ipv4Addr,
        dst: Ipv4Addr,
        payload: &[u8],
        now: Millis,
    ) -> Vec<Action> {
        let udp = match UdpDatagram::parse(payload) {
            Ok(u) => u,
            Err(_) => {
                self.stats.frames_dropped += 1;
                return Vec::new();
            }
        };

        if udp.src_port == 68 && udp.dst_port == 67 {
            return self.handle_dhcp(udp.payload, now);
        }

        if udp.dst_port == 53 && dst == self.cfg.dns_ip {
            self.stats.dns_queries += 1;
            let reply =
                self.dns
                    .handle_query(udp.payload, udp.src_port, &mut self.bindings, &self.admission);
            let Some(reply) = reply else {
                self.stats.frames_dropped += 1;
                return Vec::new();
            };
            // Responses carry rcode; count denials for observability.
            if reply.payload.get(3).is_some_and(|b| b & 0x0f == 3) {
                self.stats.dns_denied += 1;
            }
            let udp_out = udp::datagram(
                (self.cfg.dns_ip, 53),
                (self.cfg.guest_ip, reply.dst_port),
                &reply.payload,
            );
            return self.emit_ipv4_to_guest(self.cfg.dns_ip, Ipv4Protocol::UDP, &udp_out);
        }

        // No UDP forwarding: everything else is dropped.
        self.stats.frames_dropped += 1;
        Vec::new()
    }

    fn handle_dhcp(&mut self, payload: &[u8], now: Millis) -> Vec<Action> {
        let msg = match DhcpMessage::parse(payload) {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };
        let guest_mac = msg.chaddr;
        let Some(reply) = self.dhcp.handle_message(&msg, now) else {
            return Vec::new();
        };
        self.guest_mac = Some(guest_mac);

        let udp_bcast = udp::datagram(
            (self.cfg.gateway_ip, 67),
            (Ipv4Addr::BROADCAST, 68),
            &reply,
        );
        let ip_bcast = Ipv4Packet::serialize(
            self.cfg.gateway_ip,
            Ipv4Addr::BROADCAST,
            Ipv4Protocol::UDP,
            self.next_ipv4_ident(),
            64,
            &udp_bcast,
        );
        let eth_bcast = EthernetHeader {
            dst: MacAddr::BROADCAST,
            src: self.cfg.our_mac,
            ethertype: EtherType::IPV4,
        }
        .wrap(&ip_bcast);
        let mut out = vec![Action::EmitFrame(eth_bcast)];

        // Some client stacks only accept a unicast copy once their MAC is
        // known; send both like slirp does.
        if guest_mac != MacAddr::BROADCAST {
            let udp_ucast = udp::datagram(
                (self.cfg.gateway_ip, 67),
                (self.cfg.guest_ip, 68),
                &reply,
            );
            let ip_ucast = Ipv4Packet::serialize(
                self.cfg.gateway_ip,
                self.cfg.guest_ip,
                Ipv4Protocol::UDP,
                self.next_ipv4_ident(),
                64,
                &udp_ucast,
            );
            let eth_ucast = EthernetHeader {
                dst: guest_mac,
                src: self.cfg.our_mac,
                ethertype: EtherType::IPV4,
            }
            .wrap(&ip_ucast);
            out.push(Action::EmitFrame(eth_ucast));
        }
        out
    }

    fn handle_icmp(&mut self, dst: Ipv4Addr, payload: &[u8]) -> Vec<Action> {
        if dst != self.cfg.gateway_ip {
            return Vec::new();
        }
        let pkt = match IcmpEchoPacket::parse(payload) {
            Ok(p) => p,
            Err(_) => {
                self.stats.frames_dropped += 1;
                return Vec::new();
            }
        };
        if pkt.icmp_type != icmp::ICMP_ECHO_REQUEST || pkt.code != 0 {
            return Vec::new();
        }
        let reply = IcmpEchoPacket::serialize_echo_reply(pkt.identifier, pkt.sequence, pkt.payload);
        self.emit_ipv4_to_guest(self.cfg.gateway_ip, Ipv4Protocol::ICMP, &reply)
    }

    fn handle_tcp(
        &mut self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        payload: &[u8],
        now: Millis,
    ) -> Vec<Action> {
        let seg = match TcpSegment::parse(payload) {
            Ok(t) => t,
            Err(_) => {
                self.stats.frames_dropped += 1;
                return Vec::new();
            }
        };
        if !self.is_ip_assigned() || src != self.cfg.guest_ip {
            return Vec::new();
        }

        let key = TcpKey {
            guest_port: seg.src_port,
            remote_ip: dst,
            remote_port: seg.dst_port,
        };

        if let Some(entry) = self.conns.get_mut(&key) {
            let id = entry.id;
            let outputs = entry.conn.on_segment(&seg, now);
            let actions = self.map_conn_outputs(key, id, outputs);
            self.reap(key);
            return actions;
        }

        if seg.flags & TcpFlags::RST != 0 {
            return Vec::new();
        }

        if seg.flags & TcpFlags::SYN != 0 && seg.flags & TcpFlags::ACK == 0 {
            return self.handle_syn(key, &seg, now);
        }

        // Segment to a connection we do not have: RST.
        let ack = seg
            .seq
            .wrapping_add(seg.payload.len() as u32)
            .wrapping_add(u32::from(seg.flags & TcpFlags::FIN != 0));
        let rst = TcpSegment::serialize(
            key.remote_ip,
            self.cfg.guest_ip,
            key.remote_port,
            key.guest_port,
            if seg.flags & TcpFlags::ACK != 0 { seg.ack } else { 0 },
            ack,
            TcpFlags::RST | TcpFlags::ACK,
            0,
            &Default::default(),
            &[],
        );
        self.emit_ipv4_to_guest(key.remote_ip, Ipv4Protocol::TCP, &rst)
    }

    fn handle_syn(&mut self, key: TcpKey, seg: &TcpSegment<'_>, now: Millis) -> Vec<Action> {
        // Only destinations the DNS stub handed out are connectable; the
        // hostname is what admission (and later the real resolution) runs
        // against.
        let host = self.bindings.hostname_for(key.remote_ip).map(str::to_string);
        let allowed = match &host {
            Some(host) => self.admission.admit_host(host).is_allowed(),
            None => false,
        };
        let at_capacity = self.conns.len() >= self.cfg.max_tcp_connections as usize;
        if !allowed || at_capacity {
            self.stats.syns_denied += 1;
            return self.deny_syn(key, seg);
        }
        let host = host.expect("allowed implies bound hostname");

        let iss = self.rng.next_u32();
        let (conn, syn_ack) = TcpConn::accept(key, seg, iss, self.cfg.tcp.clone(), now);
        let flow = self.next_flow_id;
        self.next_flow_id += 1;
        self.conns.insert(key, ConnEntry { id: flow, conn });
        self.flows.insert(flow, key);
        self.stats.tcp_opened += 1;

        let mut actions = vec![Action::FlowOpen {
            flow,
            host,
            ip: key.remote_ip,
            port: key.remote_port,
        }];
        actions.extend(self.emit_segment(key, &syn_ack));
        actions
    }

    fn deny_syn(&mut self, key: TcpKey, seg: &TcpSegment<'_>) -> Vec<Action> {
        if self.cfg.emit_unreachable_on_deny {
            // Quote the offending datagram back inside the ICMP error.
            let tcp = TcpSegment::serialize(
                self.cfg.guest_ip,
                key.remote_ip,
                key.guest_port,
                key.remote_port,
                seg.seq,
                0,
                TcpFlags::SYN,
                seg.window,
                &Default::default(),
                &[],
            );
            let original = Ipv4Packet::serialize(
                self.cfg.guest_ip,
                key.remote_ip,
                Ipv4Protocol::TCP,
                self.next_ipv4_ident(),
                64,
                &tcp,
            );
            let unreachable =
                icmp::serialize_dest_unreachable(icmp::ICMP_CODE_ADMIN_PROHIBITED, &original);
            return self.emit_ipv4_to_guest(self.cfg.gateway_ip, Ipv4Protocol::ICMP, &unreachable);
        }

        let rst = TcpSegment::serialize(
            key.remote_ip,
            self.cfg.guest_ip,
            key.remote_port,
            key.guest_port,
            0,
            seg.seq.wrapping_add(1),
            TcpFlags::RST | TcpFlags::ACK,
            0,
            &Default::default(),
            &[],
        );
        self.emit_ipv4_to_guest(key.remote_ip, Ipv4Protocol::TCP, &rst)
    }

    fn map_conn_outputs(
        &mut self,
        key: TcpKey,
        flow: FlowId,
        outputs: Vec<ConnOutput>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        for output in outputs {
            match output {
                ConnOutput::Segment(spec) => actions.extend(self.emit_segment(key, &spec)),
                ConnOutput::Deliver(data) => actions.push(Action::FlowData { flow, data }),
                ConnOutput::Acked(bytes) => actions.push(Action::FlowAcked { flow, bytes }),
                ConnOutput::RemoteFin => actions.push(Action::FlowFin { flow }),
                ConnOutput::Reset => actions.push(Action::FlowReset { flow }),
            }
        }
        actions
    }

    fn reap(&mut self, key: TcpKey) {
        if let Some(entry) = self.conns.get(&key) {
            if entry.conn.is_closed() {
                let entry = self.conns.remove(&key).unwrap();
                self.flows.remove(&entry.id);
                self.stats.tcp_closed += 1;
            }
        }
    }

    fn emit_segment(&mut self, key: TcpKey, spec: &SegmentSpec) -> Vec<Action> {
        let tcp = TcpSegment::serialize(
            key.remote_ip,
            self.cfg.guest_ip,
            key.remote_port,
            key.guest_port,
            spec.seq,
            spec.ack,
            spec.flags,
            spec.window,
            &spec.options,
            &spec.payload,
        );
        self.emit_ipv4_to_guest(key.remote_ip, Ipv4Protocol::TCP, &tcp)
    }

    fn emit_ipv4_to_guest(&mut self, src: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<Action> {
        let Some(guest_mac) = self.guest_mac else {
            return Vec::new();
        };
        let ip = Ipv4Packet::serialize(
            src,
            self.cfg.guest_ip,
            protocol,
            self.next_ipv4_ident(),
            64,
            payload,
        );
        let eth = EthernetHeader {
            dst: guest_mac,
            src: self.cfg.our_mac,
            ethertype: EtherType::IPV4,
        }
        .wrap(&ip);
        vec![Action::EmitFrame(eth)]
    }

    fn next_ipv4_ident(&mut self) -> u16 {
        let id = self.ipv4_ident;
        self.ipv4_ident = self.ipv4_ident.wrapping_add(1);
        id
    }
}
