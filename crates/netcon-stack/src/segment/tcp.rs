use std::collections::VecDeque;
use std::net::SocketAddrV4;

use crate::packet::{TcpFlags, TcpSegment};
use crate::{ControlBlock, Millis, StackError};

const INITIAL_RTO_MS: Millis = 1_000;
const MAX_RTO_MS: Millis = 60_000;
const MAX_RETRIES: u32 = 12;
const MAX_SYN_RETRIES: u32 = 6;
const TIME_WAIT_MS: Millis = 2_000;
/// Used when the peer sends no MSS option (RFC 1122).
const DEFAULT_PEER_MSS: usize = 536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// Segment to transmit; the owning stack fills in addresses and ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TcpOut {
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpEvent {
    Connected,
    /// A passive open completed its handshake.
    Established,
    Writable,
    PeerClosed,
    Error(StackError),
    /// The socket reached its end of life and can be dropped.
    Released,
}

pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

#[derive(Debug)]
pub(crate) struct TcpSocket {
    pub state: TcpState,
    pub local: Option<SocketAddrV4>,
    pub remote: Option<SocketAddrV4>,
    pub backlog: usize,
    /// Listener that spawned this socket, until the application accepts it.
    pub parent: Option<ControlBlock>,
    /// Closed by the owner; kept only to finish the FIN exchange. Emits no events.
    pub detached: bool,

    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u32,
    peer_mss: usize,
    our_mss: u16,
    rcv_nxt: u32,
    /// Window still open to the peer. Shrinks as bytes arrive, grows as the owner consumes them.
    rcv_wnd: u32,
    max_rcv_wnd: u32,
    /// Window carried by the last segment we sent.
    rcv_ann: u32,
    /// In-window bytes the owner could not take yet, in sequence order.
    held: VecDeque<u8>,
    /// FIN arrived while bytes were still held; reported once they drain.
    fin_deferred: bool,
    /// The window grew while bytes were held, so the owner may have room again.
    retry_held: bool,

    /// Bytes from `snd_una` onward: unacknowledged first, then unsent.
    send_buf: VecDeque<u8>,
    send_cap: usize,
    send_blocked: bool,
    fin_queued: bool,
    fin_sent: bool,

    rto: Millis,
    rto_deadline: Option<Millis>,
    retries: u32,
    time_wait_until: Option<Millis>,
}

impl TcpSocket {
    pub fn new(send_cap: usize, recv_window: u32) -> Self {
        Self {
            state: TcpState::Closed,
            local: None,
            remote: None,
            backlog: 0,
            parent: None,
            detached: false,
            iss: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            peer_mss: DEFAULT_PEER_MSS,
            our_mss: DEFAULT_PEER_MSS as u16,
            rcv_nxt: 0,
            rcv_wnd: recv_window,
            max_rcv_wnd: recv_window,
            rcv_ann: recv_window,
            held: VecDeque::new(),
            fin_deferred: false,
            retry_held: false,
            send_buf: VecDeque::new(),
            send_cap,
            send_blocked: false,
            fin_queued: false,
            fin_sent: false,
            rto: INITIAL_RTO_MS,
            rto_deadline: None,
            retries: 0,
            time_wait_until: None,
        }
    }

    pub fn listen(&mut self, backlog: usize) {
        self.state = TcpState::Listen;
        self.backlog = backlog;
    }

    /// Active open. Emits the SYN.
    pub fn connect(&mut self, iss: u32, our_mss: u16, now: Millis, out: &mut Vec<TcpOut>) {
        self.iss = iss;
        self.our_mss = our_mss;
        self.snd_una = iss;
        self.snd_nxt = iss.wrapping_add(1);
        self.state = TcpState::SynSent;
        self.retries = 0;
        self.rto = INITIAL_RTO_MS;
        self.rto_deadline = Some(now + self.rto);
        out.push(self.syn());
    }

    /// Passive open from a listener's SYN. Emits the SYN-ACK.
    pub fn accept_syn(
        &mut self,
        syn: &TcpSegment<'_>,
        iss: u32,
        our_mss: u16,
        now: Millis,
        out: &mut Vec<TcpOut>,
    ) {
        self.iss = iss;
        self.our_mss = our_mss;
        self.snd_una = iss;
        self.snd_nxt = iss.wrapping_add(1);
        self.rcv_nxt = syn.seq_number().wrapping_add(1);
        self.snd_wnd = syn.window_size() as u32;
        self.peer_mss = syn.mss().map(usize::from).unwrap_or(DEFAULT_PEER_MSS);
        self.state = TcpState::SynReceived;
        self.rto_deadline = Some(now + self.rto);
        out.push(self.syn());
    }

    fn syn(&self) -> TcpOut {
        let flags = if self.state == TcpState::SynReceived {
            TcpFlags::SYN | TcpFlags::ACK
        } else {
            TcpFlags::SYN
        };
        TcpOut {
            flags,
            seq: self.iss,
            ack: if flags.contains(TcpFlags::ACK) {
                self.rcv_nxt
            } else {
                0
            },
            window: self.advertised_window(),
            mss: Some(self.our_mss),
            payload: Vec::new(),
        }
    }

    fn advertised_window(&self) -> u16 {
        self.rcv_wnd.min(u16::MAX as u32) as u16
    }

    fn ack_only(&mut self) -> TcpOut {
        self.rcv_ann = self.rcv_wnd;
        TcpOut {
            flags: TcpFlags::ACK,
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            window: self.advertised_window(),
            mss: None,
            payload: Vec::new(),
        }
    }

    /// Reset matching this socket's current sequence space.
    pub fn rst(&self) -> TcpOut {
        TcpOut {
            flags: TcpFlags::RST | TcpFlags::ACK,
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            window: 0,
            mss: None,
            payload: Vec::new(),
        }
    }

    pub fn can_send_data(&self) -> bool {
        matches!(self.state, TcpState::Established | TcpState::CloseWait) && !self.fin_queued
    }

    pub fn send_capacity(&self) -> usize {
        if !self.can_send_data() {
            return 0;
        }
        self.send_cap.saturating_sub(self.send_buf.len())
    }

    pub fn write(&mut self, data: &[u8], now: Millis, out: &mut Vec<TcpOut>) -> usize {
        if matches!(self.state, TcpState::SynSent | TcpState::SynReceived) {
            self.send_blocked = true;
            return 0;
        }
        let n = data.len().min(self.send_capacity());
        self.send_buf.extend(&data[..n]);
        if n < data.len() {
            self.send_blocked = true;
        }
        self.transmit(now, out);
        n
    }

    /// Graceful close: queue a FIN behind any pending data.
    pub fn close(&mut self, now: Millis, out: &mut Vec<TcpOut>) {
        match self.state {
            TcpState::Established | TcpState::CloseWait => {
                self.fin_queued = true;
                self.transmit(now, out);
            }
            _ => {}
        }
    }

    /// Gives `len` consumed bytes back to the receive window. A window update goes out once the
    /// window has grown enough past what the peer last saw.
    pub fn recved(&mut self, len: usize, out: &mut Vec<TcpOut>) {
        let len = len.min(u32::MAX as usize) as u32;
        self.rcv_wnd = self.rcv_wnd.saturating_add(len).min(self.max_rcv_wnd);
        if !self.held.is_empty() {
            self.retry_held = true;
        }
        let receiving = matches!(
            self.state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        );
        if receiving && self.window_update_due() {
            out.push(self.ack_only());
        }
    }

    fn window_update_due(&self) -> bool {
        let mss = u32::from(self.our_mss);
        if self.rcv_ann == 0 {
            return self.rcv_wnd >= mss.min(self.max_rcv_wnd / 2).max(1);
        }
        let threshold = (self.max_rcv_wnd / 4).min(2 * mss).max(1);
        self.rcv_wnd >= self.rcv_ann.saturating_add(threshold)
    }

    pub fn has_held(&self) -> bool {
        !self.held.is_empty()
    }

    /// Whether held bytes should be offered again without waiting for a timer.
    pub fn wants_flush(&self) -> bool {
        self.retry_held && !self.held.is_empty()
    }

    /// Offers held bytes to the owner again. Reports a deferred peer close once they are gone.
    pub fn flush_held(&mut self, deliver: &mut dyn FnMut(&[u8]) -> usize) -> Option<TcpEvent> {
        self.retry_held = false;
        if !self.held.is_empty() {
            let data = self.held.make_contiguous();
            let taken = deliver(data).min(data.len());
            self.held.drain(..taken);
        }
        if self.held.is_empty() && self.fin_deferred {
            self.fin_deferred = false;
            return Some(TcpEvent::PeerClosed);
        }
        None
    }

    /// The owner let go of the socket: held bytes are discarded and their window returned.
    pub fn detach(&mut self) {
        self.detached = true;
        let held = self.held.len().min(u32::MAX as usize) as u32;
        self.held.clear();
        self.fin_deferred = false;
        self.rcv_wnd = self.rcv_wnd.saturating_add(held).min(self.max_rcv_wnd);
    }

    fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// Sends as much queued data as the peer's window allows, then the FIN if one is queued.
    fn transmit(&mut self, now: Millis, out: &mut Vec<TcpOut>) {
        if !matches!(
            self.state,
            TcpState::Established
                | TcpState::CloseWait
                | TcpState::FinWait1
                | TcpState::Closing
                | TcpState::LastAck
        ) {
            return;
        }
        loop {
            let offset = self.in_flight() as usize;
            if self.fin_sent || offset > self.send_buf.len() {
                break;
            }
            let unsent = self.send_buf.len() - offset;
            let window = (self.snd_wnd as usize).saturating_sub(offset);
            if unsent > 0 && window > 0 {
                let n = unsent.min(window).min(self.peer_mss);
                let payload: Vec<u8> = self.send_buf.range(offset..offset + n).copied().collect();
                self.rcv_ann = self.rcv_wnd;
                out.push(TcpOut {
                    flags: TcpFlags::ACK | TcpFlags::PSH,
                    seq: self.snd_nxt,
                    ack: self.rcv_nxt,
                    window: self.advertised_window(),
                    mss: None,
                    payload,
                });
                self.snd_nxt = self.snd_nxt.wrapping_add(n as u32);
                self.arm_rto(now);
                continue;
            }
            if unsent == 0 && self.fin_queued {
                self.rcv_ann = self.rcv_wnd;
                out.push(TcpOut {
                    flags: TcpFlags::FIN | TcpFlags::ACK,
                    seq: self.snd_nxt,
                    ack: self.rcv_nxt,
                    window: self.advertised_window(),
                    mss: None,
                    payload: Vec::new(),
                });
                self.snd_nxt = self.snd_nxt.wrapping_add(1);
                self.fin_sent = true;
                self.state = match self.state {
                    TcpState::Established => TcpState::FinWait1,
                    TcpState::CloseWait => TcpState::LastAck,
                    other => other,
                };
                self.arm_rto(now);
            } else if unsent > 0 && self.snd_wnd == 0 {
                // Zero window: the retransmission timer doubles as the persist timer.
                self.arm_rto(now);
            }
            break;
        }
    }

    fn arm_rto(&mut self, now: Millis) {
        if self.rto_deadline.is_none() {
            self.rto_deadline = Some(now + self.rto);
        }
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        match (self.rto_deadline, self.time_wait_until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_timer(&mut self, now: Millis, out: &mut Vec<TcpOut>) -> Option<TcpEvent> {
        if let Some(until) = self.time_wait_until {
            if now >= until {
                self.state = TcpState::Closed;
                return Some(TcpEvent::Released);
            }
        }
        let deadline = self.rto_deadline?;
        if now < deadline {
            return None;
        }
        self.rto = (self.rto * 2).min(MAX_RTO_MS);
        self.rto_deadline = Some(now + self.rto);

        match self.state {
            TcpState::SynSent | TcpState::SynReceived => {
                self.retries += 1;
                if self.retries > MAX_SYN_RETRIES {
                    self.state = TcpState::Closed;
                    return Some(TcpEvent::Error(StackError::Timeout));
                }
                out.push(self.syn());
                None
            }
            TcpState::Established
            | TcpState::CloseWait
            | TcpState::FinWait1
            | TcpState::Closing
            | TcpState::LastAck => {
                let probing = self.snd_wnd == 0;
                if !probing {
                    self.retries += 1;
                    if self.retries > MAX_RETRIES {
                        self.state = TcpState::Closed;
                        return Some(TcpEvent::Error(StackError::Timeout));
                    }
                }
                // Go back N.
                self.snd_nxt = self.snd_una;
                self.fin_sent = false;
                if probing && !self.send_buf.is_empty() {
                    let byte = self.send_buf[0];
                    self.rcv_ann = self.rcv_wnd;
                    out.push(TcpOut {
                        flags: TcpFlags::ACK | TcpFlags::PSH,
                        seq: self.snd_nxt,
                        ack: self.rcv_nxt,
                        window: self.advertised_window(),
                        mss: None,
                        payload: vec![byte],
                    });
                    self.snd_nxt = self.snd_nxt.wrapping_add(1);
                } else {
                    self.transmit(now, out);
                }
                if self.in_flight() == 0 && !(probing && !self.send_buf.is_empty()) {
                    self.rto_deadline = None;
                }
                None
            }
            _ => {
                self.rto_deadline = None;
                None
            }
        }
    }

    /// Processes a segment addressed to this (non-listening) socket.
    ///
    /// `deliver` offers in-order payload to the owner and returns how many bytes it took.
    pub fn on_segment(
        &mut self,
        seg: &TcpSegment<'_>,
        now: Millis,
        out: &mut Vec<TcpOut>,
        deliver: &mut dyn FnMut(&[u8]) -> usize,
    ) -> Vec<TcpEvent> {
        let mut events = Vec::new();
        let flags = seg.flags();

        if flags.contains(TcpFlags::RST) {
            match self.state {
                TcpState::SynSent => {
                    if flags.contains(TcpFlags::ACK) && seg.ack_number() == self.snd_nxt {
                        self.state = TcpState::Closed;
                        events.push(TcpEvent::Error(StackError::ProtocolAborted));
                    }
                }
                TcpState::SynReceived | TcpState::TimeWait => {
                    self.state = TcpState::Closed;
                    events.push(TcpEvent::Released);
                }
                TcpState::Closed | TcpState::Listen => {}
                _ => {
                    self.state = TcpState::Closed;
                    events.push(TcpEvent::Error(StackError::ProtocolAborted));
                }
            }
            return events;
        }

        match self.state {
            TcpState::Closed | TcpState::Listen => return events,
            TcpState::SynSent => {
                if flags.contains(TcpFlags::SYN | TcpFlags::ACK)
                    && seg.ack_number() == self.iss.wrapping_add(1)
                {
                    self.rcv_nxt = seg.seq_number().wrapping_add(1);
                    self.snd_una = seg.ack_number();
                    self.snd_wnd = seg.window_size() as u32;
                    self.peer_mss = seg.mss().map(usize::from).unwrap_or(DEFAULT_PEER_MSS);
                    self.state = TcpState::Established;
                    self.reset_timer();
                    out.push(self.ack_only());
                    events.push(TcpEvent::Connected);
                    if self.send_blocked {
                        self.send_blocked = false;
                        events.push(TcpEvent::Writable);
                    }
                }
                return events;
            }
            TcpState::SynReceived => {
                if flags.contains(TcpFlags::SYN) && !flags.contains(TcpFlags::ACK) {
                    out.push(self.syn());
                    return events;
                }
                if !flags.contains(TcpFlags::ACK) || seg.ack_number() != self.iss.wrapping_add(1) {
                    return events;
                }
                self.snd_una = seg.ack_number();
                self.snd_wnd = seg.window_size() as u32;
                self.state = TcpState::Established;
                self.reset_timer();
                events.push(TcpEvent::Established);
            }
            _ => {}
        }

        if flags.contains(TcpFlags::SYN) {
            // Our handshake ACK was lost; repeat it.
            out.push(self.ack_only());
            return events;
        }

        if flags.contains(TcpFlags::ACK) {
            self.on_ack(seg, now, &mut events);
        }

        let mut need_ack = false;
        let payload = seg.payload();
        if !payload.is_empty() {
            need_ack = true;
            let receiving = matches!(
                self.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            );
            let seq = seg.seq_number();
            let end = seq.wrapping_add(payload.len() as u32);
            // Accept the part starting at rcv_nxt, including the tail of a partial retransmission.
            if receiving && seq_le(seq, self.rcv_nxt) && seq_lt(self.rcv_nxt, end) {
                let fresh = &payload[self.rcv_nxt.wrapping_sub(seq) as usize..];
                if self.detached {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(fresh.len() as u32);
                } else {
                    let fresh = &fresh[..fresh.len().min(self.rcv_wnd as usize)];
                    let taken = if self.held.is_empty() {
                        deliver(fresh).min(fresh.len())
                    } else {
                        0
                    };
                    self.held.extend(&fresh[taken..]);
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(fresh.len() as u32);
                    self.rcv_wnd -= fresh.len() as u32;
                }
            }
        }

        if flags.contains(TcpFlags::FIN) {
            need_ack = true;
            let fin_seq = seg.seq_number().wrapping_add(payload.len() as u32);
            if fin_seq == self.rcv_nxt {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                match self.state {
                    TcpState::Established => {
                        self.state = TcpState::CloseWait;
                        if !self.detached {
                            if self.held.is_empty() {
                                events.push(TcpEvent::PeerClosed);
                            } else {
                                self.fin_deferred = true;
                            }
                        }
                    }
                    TcpState::FinWait1 => {
                        self.state = TcpState::Closing;
                    }
                    TcpState::FinWait2 => {
                        self.enter_time_wait(now);
                    }
                    _ => {}
                }
            }
        }

        if need_ack {
            out.push(self.ack_only());
        }
        self.transmit(now, out);
        events
    }

    fn on_ack(&mut self, seg: &TcpSegment<'_>, now: Millis, events: &mut Vec<TcpEvent>) {
        let ack = seg.ack_number();
        if seq_lt(ack, self.snd_una) {
            return;
        }
        if seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt) {
            let acked = ack.wrapping_sub(self.snd_una) as usize;
            let data_acked = acked.min(self.send_buf.len());
            self.send_buf.drain(..data_acked);
            let fin_acked = self.fin_sent && ack == self.snd_nxt;
            self.snd_una = ack;
            self.retries = 0;
            self.rto = INITIAL_RTO_MS;
            self.rto_deadline = if self.in_flight() > 0 {
                Some(now + self.rto)
            } else {
                None
            };
            if data_acked > 0 && self.send_blocked && !self.detached {
                self.send_blocked = false;
                events.push(TcpEvent::Writable);
            }
            if fin_acked {
                match self.state {
                    TcpState::FinWait1 => self.state = TcpState::FinWait2,
                    TcpState::Closing => self.enter_time_wait(now),
                    TcpState::LastAck => {
                        self.state = TcpState::Closed;
                        events.push(TcpEvent::Released);
                    }
                    _ => {}
                }
            }
        }
        if seq_le(ack, self.snd_nxt) {
            self.snd_wnd = seg.window_size() as u32;
        }
    }

    fn enter_time_wait(&mut self, now: Millis) {
        self.state = TcpState::TimeWait;
        self.rto_deadline = None;
        self.time_wait_until = Some(now + TIME_WAIT_MS);
    }

    fn reset_timer(&mut self) {
        self.retries = 0;
        self.rto = INITIAL_RTO_MS;
        self.rto_deadline = None;
    }
}
