//! Frame-level walk of the whole stack: DHCP handshake, gateway ping,
//! DNS stub with synthetic addresses, and a TCP connection carrying data
//! both ways through the flow interface.

use gondolin_packet::*;
use pretty_assertions::assert_eq;
use gondolin_policy::{Admission, HostPatternSet};
use gondolin_stack::{Action, FlowIo, NetworkStack, StackConfig};
use std::net::Ipv4Addr;

const GUEST_MAC: MacAddr = MacAddr([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);

fn new_stack(allowed: &[&str]) -> NetworkStack {
    let admission = Admission::new(HostPatternSet::compile(allowed).unwrap(), true, None);
    NetworkStack::new(StackConfig::default(), admission)
}

fn guest_eth(stack: &NetworkStack) -> EthernetHeader {
    EthernetHeader {
        dst: stack.config().our_mac,
        src: GUEST_MAC,
        ethertype: EtherType::IPV4,
    }
}

fn wrap_udp(
    stack: &NetworkStack,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp = udp::datagram((src_ip, src_port), (dst_ip, dst_port), payload);
    let ip = Ipv4Packet::serialize(src_ip, dst_ip, Ipv4Protocol::UDP, 99, 64, &udp);
    guest_eth(stack).wrap(&ip)
}

#[allow(clippy::too_many_arguments)]
fn wrap_tcp(
    stack: &NetworkStack,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let guest_ip = stack.config().guest_ip;
    let tcp = TcpSegment::serialize(
        guest_ip,
        dst_ip,
        src_port,
        dst_port,
        seq,
        ack,
        flags,
        65535,
        &TcpOptions {
            mss: Some(1460),
            ..Default::default()
        },
        payload,
    );
    let ip = Ipv4Packet::serialize(guest_ip, dst_ip, Ipv4Protocol::TCP, 100, 64, &tcp);
    guest_eth(stack).wrap(&ip)
}

fn build_dhcp(mtype: u8, xid: u32) -> Vec<u8> {
    let mut out = vec![0u8; 236];
    out[0] = 1;
    out[1] = 1;
    out[2] = 6;
    out[4..8].copy_from_slice(&xid.to_be_bytes());
    out[28..34].copy_from_slice(&GUEST_MAC.0);
    out.extend_from_slice(&[99, 130, 83, 99]);
    out.extend_from_slice(&[53, 1, mtype]);
    out.push(255);
    out
}

fn build_dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&(1u16 << 8).to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out
}

fn frames(actions: &[Action]) -> Vec<Vec<u8>> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::EmitFrame(f) => Some(f.clone()),
            _ => None,
        })
        .collect()
}

fn parse_tcp_reply(frame: &[u8]) -> (Ipv4Addr, u32, u32, u8, Vec<u8>) {
    let eth = EthernetFrame::parse(frame).unwrap();
    assert_eq!(eth.ethertype, EtherType::IPV4);
    let ip = Ipv4Packet::parse(eth.payload).unwrap();
    assert_eq!(ip.protocol, Ipv4Protocol::TCP);
    let tcp = TcpSegment::parse(ip.payload).unwrap();
    (ip.src, tcp.seq, tcp.ack, tcp.flags, tcp.payload.to_vec())
}

fn dhcp_handshake(stack: &mut NetworkStack) {
    let discover = wrap_udp(
        stack,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::BROADCAST,
        68,
        67,
        &build_dhcp(1, 0x1020),
    );
    let actions = stack.handle_frame(&discover, 0);
    assert!(!frames(&actions).is_empty(), "expected DHCP OFFER");

    let request = wrap_udp(
        stack,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::BROADCAST,
        68,
        67,
        &build_dhcp(3, 0x1020),
    );
    let actions = stack.handle_frame(&request, 1);
    assert!(!frames(&actions).is_empty(), "expected DHCP ACK");
    assert!(stack.is_ip_assigned());
}

fn resolve(stack: &mut NetworkStack, name: &str) -> Option<Ipv4Addr> {
    let dns_ip = stack.config().dns_ip;
    let guest_ip = stack.config().guest_ip;
    let query = wrap_udp(stack, guest_ip, dns_ip, 53000, 53, &build_dns_query(7, name));
    let actions = stack.handle_frame(&query, 10);
    let reply_frames = frames(&actions);
    assert_eq!(reply_frames.len(), 1);
    let eth = EthernetFrame::parse(&reply_frames[0]).unwrap();
    let ip = Ipv4Packet::parse(eth.payload).unwrap();
    let udp = UdpDatagram::parse(ip.payload).unwrap();
    assert_eq!(udp.src_port, 53);
    let p = udp.payload;
    let ancount = u16::from_be_bytes([p[6], p[7]]);
    (ancount == 1).then(|| {
        let o = p.len() - 4;
        Ipv4Addr::new(p[o], p[o + 1], p[o + 2], p[o + 3])
    })
}

#[test]
fn dhcp_dns_tcp_end_to_end() {
    let mut stack = new_stack(&["example.com"]);
    dhcp_handshake(&mut stack);

    // ARP for the gateway answers with our MAC.
    let arp = ArpPacket {
        op: ArpOperation::Request,
        sender_hw: GUEST_MAC,
        sender_ip: stack.config().guest_ip,
        target_hw: MacAddr([0; 6]),
        target_ip: stack.config().gateway_ip,
    };
    let arp_frame = EthernetHeader {
        dst: MacAddr::BROADCAST,
        src: GUEST_MAC,
        ethertype: EtherType::ARP,
    }
    .wrap(&arp.serialize());
    let actions = stack.handle_frame(&arp_frame, 5);
    let reply = &frames(&actions)[0];
    let eth = EthernetFrame::parse(reply).unwrap();
    let arp_reply = ArpPacket::parse(eth.payload).unwrap();
    assert_eq!(arp_reply.op, ArpOperation::Reply);
    assert_eq!(arp_reply.sender_hw, stack.config().our_mac);

    // DNS hands out a stable synthetic address.
    let ip1 = resolve(&mut stack, "example.com").unwrap();
    let ip2 = resolve(&mut stack, "example.com").unwrap();
    assert_eq!(ip1, ip2);
    assert_eq!(stack.bindings().hostname_for(ip1), Some("example.com"));

    // SYN opens a flow and answers SYN-ACK.
    let syn = wrap_tcp(&stack, ip1, 40000, 80, 5000, 0, TcpFlags::SYN, &[]);
    let actions = stack.handle_frame(&syn, 20);
    let open = actions
        .iter()
        .find_map(|a| match a {
            Action::FlowOpen { flow, host, port, .. } => Some((*flow, host.clone(), *port)),
            _ => None,
        })
        .expect("flow opened");
    assert_eq!(open.1, "example.com");
    assert_eq!(open.2, 80);
    let flow = open.0;

    let syn_ack_frame = &frames(&actions)[0];
    let (src, iss, ack, flags, _) = parse_tcp_reply(syn_ack_frame);
    assert_eq!(src, ip1);
    assert_eq!(flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(ack, 5001);

    // Handshake ACK, then request bytes.
    let ack_frame = wrap_tcp(&stack, ip1, 40000, 80, 5001, iss + 1, TcpFlags::ACK, &[]);
    assert!(frames(&stack.handle_frame(&ack_frame, 21)).is_empty());

    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let data_frame = wrap_tcp(
        &stack,
        ip1,
        40000,
        80,
        5001,
        iss + 1,
        TcpFlags::ACK | TcpFlags::PSH,
        request,
    );
    let actions = stack.handle_frame(&data_frame, 22);
    let delivered: Vec<u8> = actions
        .iter()
        .filter_map(|a| match a {
            Action::FlowData { flow: f, data } if *f == flow => Some(data.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(delivered, request);

    // Host responds through the flow interface; bytes come back framed.
    let response = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok".to_vec();
    let actions = stack.handle_flow_io(
        FlowIo::Send {
            flow,
            data: response.clone(),
        },
        23,
    );
    let reply_frames = frames(&actions);
    assert_eq!(reply_frames.len(), 1);
    let (_, seq, _, flags, payload) = parse_tcp_reply(&reply_frames[0]);
    assert_eq!(seq, iss + 1);
    assert!(flags & TcpFlags::PSH != 0);
    assert_eq!(payload, response);

    // Guest acks and closes; host shuts down; connection fully drains.
    let guest_ack = wrap_tcp(
        &stack,
        ip1,
        40000,
        80,
        5001 + request.len() as u32,
        iss + 1 + response.len() as u32,
        TcpFlags::ACK,
        &[],
    );
    let actions = stack.handle_frame(&guest_ack, 24);
    assert!(actions.contains(&Action::FlowAcked {
        flow,
        bytes: response.len()
    }));

    let fin = wrap_tcp(
        &stack,
        ip1,
        40000,
        80,
        5001 + request.len() as u32,
        iss + 1 + response.len() as u32,
        TcpFlags::FIN | TcpFlags::ACK,
        &[],
    );
    let actions = stack.handle_frame(&fin, 25);
    assert!(actions.contains(&Action::FlowFin { flow }));

    let actions = stack.handle_flow_io(FlowIo::Shutdown { flow }, 26);
    let fin_frame = frames(&actions)
        .into_iter()
        .find(|f| {
            let (_, _, _, flags, _) = parse_tcp_reply(f);
            flags & TcpFlags::FIN != 0
        })
        .expect("host FIN emitted");
    let (_, fin_seq, _, _, _) = parse_tcp_reply(&fin_frame);

    let last_ack = wrap_tcp(
        &stack,
        ip1,
        40000,
        80,
        5002 + request.len() as u32,
        fin_seq + 1,
        TcpFlags::ACK,
        &[],
    );
    stack.handle_frame(&last_ack, 27);
    assert_eq!(stack.stats.tcp_closed, 1);
}

#[test]
fn denied_hostname_gets_nxdomain_and_no_binding() {
    let mut stack = new_stack(&["example.com"]);
    dhcp_handshake(&mut stack);
    assert_eq!(resolve(&mut stack, "evil.test"), None);
    assert_eq!(stack.stats.dns_denied, 1);
}

#[test]
fn syn_to_unbound_ip_is_rst() {
    let mut stack = new_stack(&["example.com"]);
    dhcp_handshake(&mut stack);

    let syn = wrap_tcp(
        &stack,
        Ipv4Addr::new(203, 0, 113, 9),
        40000,
        443,
        100,
        0,
        TcpFlags::SYN,
        &[],
    );
    let actions = stack.handle_frame(&syn, 30);
    assert!(!actions
        .iter()
        .any(|a| matches!(a, Action::FlowOpen { .. })));
    let (_, _, ack, flags, _) = parse_tcp_reply(&frames(&actions)[0]);
    assert!(flags & TcpFlags::RST != 0);
    assert_eq!(ack, 101);
    assert_eq!(stack.stats.syns_denied, 1);
}

#[test]
fn ping_to_gateway_is_answered() {
    let mut stack = new_stack(&[]);
    dhcp_handshake(&mut stack);

    let echo = IcmpEchoPacket::serialize_echo_reply(7, 1, b"hi");
    // Rewrite as a request (type 8) and fix the checksum.
    let mut echo_req = echo;
    echo_req[0] = 8;
    echo_req[2..4].copy_from_slice(&[0, 0]);
    let sum = gondolin_packet::checksum::ones_complement_finish(
        gondolin_packet::checksum::ones_complement_sum(0, &echo_req),
    );
    echo_req[2..4].copy_from_slice(&sum.to_be_bytes());

    let guest_ip = stack.config().guest_ip;
    let gateway = stack.config().gateway_ip;
    let ip = Ipv4Packet::serialize(guest_ip, gateway, Ipv4Protocol::ICMP, 55, 64, &echo_req);
    let frame = guest_eth(&stack).wrap(&ip);
    let actions = stack.handle_frame(&frame, 40);
    let reply = &frames(&actions)[0];
    let eth = EthernetFrame::parse(reply).unwrap();
    let ip = Ipv4Packet::parse(eth.payload).unwrap();
    assert_eq!(ip.src, gateway);
    let icmp = IcmpEchoPacket::parse(ip.payload).unwrap();
    assert_eq!(icmp.icmp_type, 0);
    assert_eq!(icmp.payload, b"hi");
}

#[test]
fn tls_hello_split_across_segments_is_delivered_in_order() {
    let mut stack = new_stack(&["example.com"]);
    dhcp_handshake(&mut stack);
    let ip = resolve(&mut stack, "example.com").unwrap();

    let syn = wrap_tcp(&stack, ip, 41000, 443, 9000, 0, TcpFlags::SYN, &[]);
    let actions = stack.handle_frame(&syn, 50);
    let flow = actions
        .iter()
        .find_map(|a| match a {
            Action::FlowOpen { flow, .. } => Some(*flow),
            _ => None,
        })
        .unwrap();
    let (_, iss, _, _, _) = parse_tcp_reply(&frames(&actions)[0]);
    let ack = wrap_tcp(&stack, ip, 41000, 443, 9001, iss + 1, TcpFlags::ACK, &[]);
    stack.handle_frame(&ack, 51);

    // A ClientHello prefix split mid-record, second half arriving first.
    let hello: Vec<u8> = [0x16, 0x03, 0x01, 0x00, 0x40, 0x01, 0x00, 0x00, 0x3c].to_vec();
    let (a, b) = hello.split_at(4);
    let late = wrap_tcp(
        &stack,
        ip,
        41000,
        443,
        9001 + a.len() as u32,
        iss + 1,
        TcpFlags::ACK,
        b,
    );
    let actions = stack.handle_frame(&late, 52);
    assert!(actions.iter().all(|x| !matches!(x, Action::FlowData { .. })));

    let early = wrap_tcp(&stack, ip, 41000, 443, 9001, iss + 1, TcpFlags::ACK, a);
    let actions = stack.handle_frame(&early, 53);
    let delivered: Vec<u8> = actions
        .iter()
        .filter_map(|x| match x {
            Action::FlowData { flow: f, data } if *f == flow => Some(data.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(delivered, hello);
}
