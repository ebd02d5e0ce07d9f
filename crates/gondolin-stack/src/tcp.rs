#![forbid(unsafe_code)]

//! Per-connection TCP state machine.
//!
//! The stack only ever acts as the accepting side: the guest initiates
//! every connection, so the states reachable here are SYN_RECEIVED onward.
//! Sequence-number arithmetic is modular throughout.

use gondolin_packet::{TcpOptions, TcpSegment};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::net::Ipv4Addr;

pub type Millis = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    Closing,
    TimeWait,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpKey {
    pub guest_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

/// Knobs shared by every connection.
#[derive(Debug, Clone)]
pub struct TcpTuning {
    pub recv_buffer_bytes: usize,
    pub send_buffer_bytes: usize,
    pub mss: u16,
    pub rto_initial_ms: Millis,
    pub rto_max_ms: Millis,
    pub max_retransmits: u32,
    pub time_wait_ms: Millis,
    pub zero_window_probe_ms: Millis,
}

impl Default for TcpTuning {
    fn default() -> Self {
        Self {
            recv_buffer_bytes: 64 * 1024,
            send_buffer_bytes: 256 * 1024,
            mss: 1460,
            rto_initial_ms: 1000,
            rto_max_ms: 60_000,
            max_retransmits: 8,
            time_wait_ms: 60_000,
            zero_window_probe_ms: 1000,
        }
    }
}

/// A segment to transmit to the guest, before IP/Ethernet framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSpec {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub options: TcpOptions,
    pub payload: Vec<u8>,
}

/// What a connection wants done after processing an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnOutput {
    /// Transmit to the guest.
    Segment(SegmentSpec),
    /// In-order payload bytes for the flow layer.
    Deliver(Vec<u8>),
    /// The guest acknowledged this many bytes of host-sent data.
    Acked(usize),
    /// The guest closed its send direction.
    RemoteFin,
    /// The connection aborted; flow layer must tear down.
    Reset,
}

mod seq {
    //! Modular sequence-number comparisons.

    pub fn lt(a: u32, b: u32) -> bool {
        (a.wrapping_sub(b) as i32) < 0
    }

    pub fn le(a: u32, b: u32) -> bool {
        a == b || lt(a, b)
    }
}

use gondolin_packet::TcpFlags;

#[derive(Debug)]
pub struct TcpConn {
    pub key: TcpKey,
    state: TcpState,
    tuning: TcpTuning,

    // Receive direction (guest -> host).
    irs: u32,
    rcv_nxt: u32,
    /// Out-of-order segments keyed by sequence number.
    ooo: BTreeMap<u32, Vec<u8>>,
    ooo_bytes: usize,
    /// Delivered to the flow layer but not yet consumed by it; counts
    /// against the advertised window.
    unconsumed: usize,
    remote_fin_received: bool,
    /// Window was advertised as zero; reopening must push an update.
    advertised_zero: bool,

    // Send direction (host -> guest).
    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u32,
    /// Bytes from `snd_una` onward: in-flight prefix + unsent tail.
    send_buf: VecDeque<u8>,
    fin_queued: bool,
    fin_sent: bool,
    fin_seq: u32,
    /// Guest MSS from its SYN, clamped to ours.
    peer_mss: u16,

    // Timers.
    rto_ms: Millis,
    rtx_deadline: Option<Millis>,
    rtx_count: u32,
    probe_deadline: Option<Millis>,
    time_wait_deadline: Option<Millis>,
    pub last_activity_ms: Millis,
}

impl TcpConn {
    /// Accept a SYN. Returns the connection plus the SYN-ACK to emit.
    pub fn accept(
        key: TcpKey,
        syn: &TcpSegment<'_>,
        iss: u32,
        tuning: TcpTuning,
        now: Millis,
    ) -> (Self, SegmentSpec) {
        let peer_mss = syn.options.mss.unwrap_or(536).min(tuning.mss);
        let mut conn = Self {
            key,
            state: TcpState::SynReceived,
            irs: syn.seq,
            rcv_nxt: syn.seq.wrapping_add(1),
            ooo: BTreeMap::new(),
            ooo_bytes: 0,
            unconsumed: 0,
            remote_fin_received: false,
            advertised_zero: false,
            iss,
            snd_una: iss,
            snd_nxt: iss.wrapping_add(1),
            snd_wnd: u32::from(syn.window),
            send_buf: VecDeque::new(),
            fin_queued: false,
            fin_sent: false,
            fin_seq: 0,
            peer_mss,
            rto_ms: tuning.rto_initial_ms,
            // The SYN-ACK itself is on the retransmission clock; a guest
            // that never completes the handshake gets reaped by backoff.
            rtx_deadline: Some(now + tuning.rto_initial_ms),
            rtx_count: 0,
            probe_deadline: None,
            time_wait_deadline: None,
            last_activity_ms: now,
            tuning,
        };
        let syn_ack = conn.syn_ack();
        (conn, syn_ack)
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    /// Free space the flow layer still has for queued sends.
    pub fn send_capacity(&self) -> usize {
        self.tuning.send_buffer_bytes.saturating_sub(self.send_buf.len())
    }

    fn recv_window(&self) -> u16 {
        self.tuning
            .recv_buffer_bytes
            .saturating_sub(self.unconsumed + self.ooo_bytes)
            .min(u16::MAX as usize) as u16
    }

    fn syn_ack(&self) -> SegmentSpec {
        SegmentSpec {
            seq: self.iss,
            ack: self.rcv_nxt,
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: self.recv_window(),
            options: TcpOptions {
                mss: Some(self.tuning.mss),
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }

    fn ack_segment(&mut self) -> SegmentSpec {
        let window = self.recv_window();
        self.advertised_zero = window == 0;
        SegmentSpec {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: TcpFlags::ACK,
            window,
            options: TcpOptions::default(),
            payload: Vec::new(),
        }
    }

    fn rst_segment(&self) -> SegmentSpec {
        SegmentSpec {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: TcpFlags::RST | TcpFlags::ACK,
            window: 0,
            options: TcpOptions::default(),
            payload: Vec::new(),
        }
    }

    /// Process one segment from the guest.
    pub fn on_segment(&mut self, seg: &TcpSegment<'_>, now: Millis) -> Vec<ConnOutput> {
        let mut out = Vec::new();
        if self.state == TcpState::Closed {
            return out;
        }
        self.last_activity_ms = now;

        if seg.flags & TcpFlags::RST != 0 {
            // Only honor an RST that falls in the receive window.
            if seq::le(self.rcv_nxt, seg.seq)
                || self.state == TcpState::SynReceived && seg.seq == self.rcv_nxt
            {
                self.enter_closed();
                out.push(ConnOutput::Reset);
            }
            return out;
        }

        if seg.flags & TcpFlags::SYN != 0 {
            // Duplicate SYN: re-answer the handshake, no state change.
            if self.state == TcpState::SynReceived && seg.seq == self.irs {
                out.push(ConnOutput::Segment(self.syn_ack()));
            }
            return out;
        }

        if seg.flags & TcpFlags::ACK != 0 {
            self.process_ack(seg, now, &mut out);
            if self.state == TcpState::Closed {
                return out;
            }
        }

        if !seg.payload.is_empty() {
            self.process_payload(seg, &mut out);
            if self.state == TcpState::Closed {
                return out;
            }
        }

        if seg.flags & TcpFlags::FIN != 0 {
            self.process_fin(seg, &mut out);
        }

        // An opened send window may unblock queued data.
        self.push_segments(now, &mut out);
        out
    }

    fn process_ack(&mut self, seg: &TcpSegment<'_>, now: Millis, out: &mut Vec<ConnOutput>) {
        let ack = seg.ack;
        // Ignore stale or futuristic ACKs.
        if !(seq::le(self.snd_una, ack) && seq::le(ack, self.snd_nxt)) {
            return;
        }

        self.snd_wnd = u32::from(seg.window);

        let mut newly_acked = ack.wrapping_sub(self.snd_una) as usize;
        if newly_acked > 0 {
            if self.state == TcpState::SynReceived {
                // The SYN occupies one sequence number.
                self.state = TcpState::Established;
                newly_acked -= 1;
            }
            let fin_acked = self.fin_sent && ack == self.fin_seq.wrapping_add(1);
            if fin_acked {
                newly_acked -= 1;
            }
            let drained = newly_acked.min(self.send_buf.len());
            self.send_buf.drain(..drained);
            self.snd_una = ack;
            if drained > 0 {
                out.push(ConnOutput::Acked(drained));
            }

            // Fresh ACK: reset the retransmission state.
            self.rto_ms = self.tuning.rto_initial_ms;
            self.rtx_count = 0;
            self.rtx_deadline = if self.bytes_in_flight() > 0 || (self.fin_sent && !fin_acked) {
                Some(now + self.rto_ms)
            } else {
                None
            };

            if fin_acked {
                match self.state {
                    TcpState::FinWait1 => self.state = TcpState::FinWait2,
                    TcpState::Closing => self.enter_time_wait(now),
                    TcpState::LastAck => self.enter_closed(),
                    _ => {}
                }
            }
        }
    }

    fn process_payload(&mut self, seg: &TcpSegment<'_>, out: &mut Vec<ConnOutput>) {
        // Data after the guest already closed its direction is a protocol
        // violation on this proxy: abort.
        if self.remote_fin_received
            || matches!(self.state, TcpState::TimeWait | TcpState::LastAck | TcpState::Closing)
        {
            out.push(ConnOutput::Segment(self.rst_segment()));
            self.enter_closed();
            out.push(ConnOutput::Reset);
            return;
        }

        let payload = seg.payload;
        let seg_seq = seg.seq;
        let seg_end = seg_seq.wrapping_add(payload.len() as u32);
        let wnd_end = self
            .rcv_nxt
            .wrapping_add(self.recv_window() as u32);

        // Entirely old or entirely beyond the window: just re-ACK.
        if seq::le(seg_end, self.rcv_nxt) || !seq::lt(seg_seq, wnd_end) {
            out.push(ConnOutput::Segment(self.ack_segment()));
            return;
        }

        if seq::le(seg_seq, self.rcv_nxt) {
            // In order (possibly overlapping the already-received prefix).
            let skip = self.rcv_nxt.wrapping_sub(seg_seq) as usize;
            let mut fresh = payload[skip..].to_vec();
            let room = self
                .recv_window() as usize;
            fresh.truncate(room);
            if !fresh.is_empty() {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(fresh.len() as u32);
                self.unconsumed += fresh.len();
                out.push(ConnOutput::Deliver(fresh));
                self.drain_ooo(out);
            }
        } else {
            // Out of order: queue for later coalescing.
            let room = self
                .tuning
                .recv_buffer_bytes
                .saturating_sub(self.unconsumed + self.ooo_bytes);
            if payload.len() <= room && !self.ooo.contains_key(&seg_seq) {
                self.ooo_bytes += payload.len();
                self.ooo.insert(seg_seq, payload.to_vec());
            }
        }

        out.push(ConnOutput::Segment(self.ack_segment()));
    }

    fn drain_ooo(&mut self, out: &mut Vec<ConnOutput>) {
        while let Some((&seq_start, _)) = self.ooo.iter().next() {
            if seq::lt(self.rcv_nxt, seq_start) {
                break;
            }
            let (_, data) = self.ooo.pop_first().unwrap();
            self.ooo_bytes -= data.len();
            let skip = self.rcv_nxt.wrapping_sub(seq_start) as usize;
            if skip >= data.len() {
                continue;
            }
            let fresh = data[skip..].to_vec();
            self.rcv_nxt = self.rcv_nxt.wrapping_add(fresh.len() as u32);
            self.unconsumed += fresh.len();
            out.push(ConnOutput::Deliver(fresh));
        }
    }

    fn process_fin(&mut self, seg: &TcpSegment<'_>, out: &mut Vec<ConnOutput>) {
        let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
        if fin_seq != self.rcv_nxt {
            // FIN beyond data we have not received yet; wait for retransmit.
            out.push(ConnOutput::Segment(self.ack_segment()));
            return;
        }
        if self.remote_fin_received {
            out.push(ConnOutput::Segment(self.ack_segment()));
            return;
        }
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.remote_fin_received = true;
        out.push(ConnOutput::RemoteFin);
        match self.state {
            TcpState::SynReceived | TcpState::Established => self.state = TcpState::CloseWait,
            TcpState::FinWait1 => {
                // Our FIN is still unacked: simultaneous close.
                self.state = TcpState::Closing;
            }
            TcpState::FinWait2 => self.enter_time_wait(self.last_activity_ms),
            _ => {}
        }
        out.push(ConnOutput::Segment(self.ack_segment()));
    }

    fn bytes_in_flight(&self) -> u32 {
        let mut in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
        if self.fin_sent && in_flight > 0 {
            in_flight -= 1;
        }
        if self.state == TcpState::SynReceived {
            in_flight = in_flight.saturating_sub(1);
        }
        in_flight
    }

    /// Queue host data toward the guest. Returns the number of bytes
    /// accepted (bounded by the per-connection send buffer).
    pub fn send(&mut self, data: &[u8], now: Millis, out: &mut Vec<ConnOutput>) -> usize {
        if !matches!(
            self.state,
            TcpState::SynReceived | TcpState::Established | TcpState::CloseWait
        ) || self.fin_queued
        {
            return 0;
        }
        let accept = data.len().min(self.send_capacity());
        self.send_buf.extend(&data[..accept]);
        self.push_segments(now, out);
        accept
    }

    /// The flow layer consumed delivered bytes; may reopen the window.
    pub fn consume(&mut self, bytes: usize, out: &mut Vec<ConnOutput>) {
        let was_zero = self.recv_window() == 0;
        self.unconsumed = self.unconsumed.saturating_sub(bytes);
        if (was_zero || self.advertised_zero) && self.recv_window() > 0 {
            out.push(ConnOutput::Segment(self.ack_segment()));
        }
    }

    /// Graceful close of the host->guest direction; the FIN goes out once
    /// all queued data has been transmitted.
    pub fn shutdown(&mut self, now: Millis, out: &mut Vec<ConnOutput>) {
        if self.fin_queued || matches!(self.state, TcpState::Closed | TcpState::TimeWait) {
            return;
        }
        self.fin_queued = true;
        self.push_segments(now, out);
    }

    /// Abort: RST to the guest, connection gone.
    pub fn abort(&mut self, out: &mut Vec<ConnOutput>) {
        if self.state != TcpState::Closed {
            out.push(ConnOutput::Segment(self.rst_segment()));
            self.enter_closed();
        }
    }

    fn unsent_bytes(&self) -> usize {
        let in_flight = self.bytes_in_flight() as usize;
        self.send_buf.len().saturating_sub(in_flight)
    }

    fn push_segments(&mut self, now: Millis, out: &mut Vec<ConnOutput>) {
        if self.state == TcpState::SynReceived {
            // Nothing goes out until the handshake completes.
            return;
        }
        if matches!(self.state, TcpState::Closed | TcpState::TimeWait) {
            return;
        }
        loop {
            let in_flight = self.bytes_in_flight() as usize;
            let unsent = self.send_buf.len() - in_flight.min(self.send_buf.len());
            if unsent == 0 {
                break;
            }
            let window_room = (self.snd_wnd as usize).saturating_sub(in_flight);
            if window_room == 0 {
                if self.probe_deadline.is_none() {
                    self.probe_deadline = Some(now + self.tuning.zero_window_probe_ms);
                }
                break;
            }
            let len = unsent.min(window_room).min(self.peer_mss as usize);
            let offset = in_flight;
            let payload: Vec<u8> = self
                .send_buf
                .iter()
                .skip(offset)
                .take(len)
                .copied()
                .collect();
            let seq = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
            let mut flags = TcpFlags::ACK;
            if offset + len == self.send_buf.len() {
                flags |= TcpFlags::PSH;
            }
            out.push(ConnOutput::Segment(SegmentSpec {
                seq,
                ack: self.rcv_nxt,
                flags,
                window: self.recv_window(),
                options: TcpOptions::default(),
                payload,
            }));
            if self.rtx_deadline.is_none() {
                self.rtx_deadline = Some(now + self.rto_ms);
            }
        }

        // FIN rides out once everything queued has been sent.
        if self.fin_queued && !self.fin_sent && self.unsent_bytes() == 0 {
            self.fin_sent = true;
            self.fin_seq = self.snd_nxt;
            out.push(ConnOutput::Segment(SegmentSpec {
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
                flags: TcpFlags::FIN | TcpFlags::ACK,
                window: self.recv_window(),
                options: TcpOptions::default(),
                payload: Vec::new(),
            }));
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            match self.state {
                TcpState::Established => self.state = TcpState::FinWait1,
                TcpState::CloseWait => self.state = TcpState::LastAck,
                _ => {}
            }
            if self.rtx_deadline.is_none() {
                self.rtx_deadline = Some(now + self.rto_ms);
            }
        }
    }

    /// Drive timers: retransmission backoff, zero-window probes, and
    /// TIME_WAIT expiry.
    pub fn on_tick(&mut self, now: Millis, out: &mut Vec<ConnOutput>) {
        if let Some(deadline) = self.time_wait_deadline {
            if now >= deadline {
                self.enter_closed();
                return;
            }
        }

        if let Some(deadline) = self.rtx_deadline {
            if now >= deadline {
                if self.rtx_count >= self.tuning.max_retransmits {
                    self.abort(out);
                    out.push(ConnOutput::Reset);
                    return;
                }
                self.rtx_count += 1;
                self.rto_ms = (self.rto_ms * 2).min(self.tuning.rto_max_ms);
                self.rtx_deadline = Some(now + self.rto_ms);
                self.retransmit(out);
            }
        }

        if let Some(deadline) = self.probe_deadline {
            if now >= deadline {
                self.probe_deadline = if self.snd_wnd == 0 && !self.send_buf.is_empty() {
                    // Zero-window probe: one byte past the edge keeps the
                    // guest acking with its current window.
                    let payload = vec![*self.send_buf.front().unwrap_or(&0)];
                    out.push(ConnOutput::Segment(SegmentSpec {
                        seq: self.snd_una,
                        ack: self.rcv_nxt,
                        flags: TcpFlags::ACK,
                        window: self.recv_window(),
                        options: TcpOptions::default(),
                        payload,
                    }));
                    Some(now + self.tuning.zero_window_probe_ms)
                } else {
                    None
                };
            }
        }
    }

    fn retransmit(&mut self, out: &mut Vec<ConnOutput>) {
        if self.state == TcpState::SynReceived {
            out.push(ConnOutput::Segment(self.syn_ack()));
            return;
        }
        let in_flight = self.bytes_in_flight() as usize;
        if in_flight > 0 {
            let len = in_flight.min(self.peer_mss as usize).min(self.send_buf.len());
            let payload: Vec<u8> = self.send_buf.iter().take(len).copied().collect();
            out.push(ConnOutput::Segment(SegmentSpec {
                seq: self.snd_una,
                ack: self.rcv_nxt,
                flags: TcpFlags::ACK | TcpFlags::PSH,
                window: self.recv_window(),
                options: TcpOptions::default(),
                payload,
            }));
        } else if self.fin_sent {
            out.push(ConnOutput::Segment(SegmentSpec {
                seq: self.fin_seq,
                ack: self.rcv_nxt,
                flags: TcpFlags::FIN | TcpFlags::ACK,
                window: self.recv_window(),
                options: TcpOptions::default(),
                payload: Vec::new(),
            }));
        }
    }

    fn enter_time_wait(&mut self, now: Millis) {
        self.state = TcpState::TimeWait;
        self.time_wait_deadline = Some(now + self.tuning.time_wait_ms);
        self.rtx_deadline = None;
        self.probe_deadline = None;
    }

    fn enter_closed(&mut self) {
        self.state = TcpState::Closed;
        self.rtx_deadline = None;
        self.probe_deadline = None;
        self.time_wait_deadline = None;
        self.send_buf.clear();
        self.ooo.clear();
        self.ooo_bytes = 0;
    }
}
