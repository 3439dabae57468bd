#![forbid(unsafe_code)]

//! Protocol stack adapter.
//!
//! [`ProtocolStack`] is the fixed operation set the tap drives: open/bind/listen/connect/write/close
//! on opaque [`ControlBlock`] handles, plus frame injection and timer polling. Asynchronous stack
//! events are delivered to a [`StackEventSink`] passed into every call that can produce them, so a
//! backend never needs a global or a back-pointer to reach the connection table.
//!
//! Two backends are provided:
//! - [`SmoltcpStack`]: a polling stack built on `smoltcp`; events are discovered after each poll.
//! - [`SegmentStack`]: a small in-tree ARP/IPv4/TCP/UDP engine that fires callbacks synchronously
//!   while a frame is being parsed.

use core::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

mod cidr;
mod error;
pub mod packet;
pub mod segment;
pub mod smoltcp_stack;

pub use cidr::{IpCidr, ParseCidrError};
pub use error::StackError;
pub use packet::MacAddr;
pub use segment::SegmentStack;
pub use smoltcp_stack::SmoltcpStack;

/// Milliseconds on the stack's monotonic clock.
pub type Millis = u64;

/// Opaque handle for a stack-side socket.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlBlock(u64);

impl ControlBlock {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

impl fmt::Display for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptDecision {
    Accept,
    /// Reset the new connection and release its control block.
    Abort,
}

/// Receives asynchronous events for control blocks.
///
/// Implementations must tolerate events for control blocks they no longer know about and treat
/// them as no-ops.
pub trait StackEventSink {
    /// Offers received bytes. Returns how many were taken.
    ///
    /// Stream backends leave untaken bytes unacknowledged; datagram backends drop a datagram that
    /// was not taken whole. `from` is set for datagrams.
    fn on_readable(&mut self, cb: ControlBlock, data: &[u8], from: Option<SocketAddr>) -> usize;

    /// Send capacity became available after having been exhausted.
    fn on_writable(&mut self, cb: ControlBlock);

    fn on_connected(&mut self, cb: ControlBlock);

    /// A listener produced an established connection with its own control block.
    fn on_accept(
        &mut self,
        listener: ControlBlock,
        accepted: ControlBlock,
        peer: SocketAddr,
    ) -> AcceptDecision;

    /// Fatal to `cb`. The backend has already released the control block.
    fn on_error(&mut self, cb: ControlBlock, err: StackError);

    /// The peer finished sending.
    fn on_peer_closed(&mut self, cb: ControlBlock);
}

/// Callback receiving each complete Ethernet frame the stack transmits.
pub type FrameOutput = Arc<dyn Fn(&[u8]) + Send + Sync>;

pub trait ProtocolStack: Send {
    fn name(&self) -> &'static str;

    /// Assigns an address to the interface and brings it up.
    fn add_address(&mut self, cidr: IpCidr) -> Result<(), StackError>;

    fn remove_address(&mut self, cidr: IpCidr);

    fn open(&mut self, kind: SocketKind) -> Result<ControlBlock, StackError>;

    /// Binds a control block. Port 0 selects an ephemeral port; the bound address is returned.
    fn bind(&mut self, cb: ControlBlock, addr: SocketAddr) -> Result<SocketAddr, StackError>;

    fn listen(&mut self, cb: ControlBlock, backlog: usize) -> Result<(), StackError>;

    /// Starts a connect. For streams, completion arrives through
    /// [`StackEventSink::on_connected`] or [`StackEventSink::on_error`]; datagram connects
    /// complete immediately.
    fn connect(&mut self, cb: ControlBlock, addr: SocketAddr, now: Millis)
        -> Result<(), StackError>;

    /// Queues bytes for transmission. May accept fewer bytes than offered; never blocks.
    fn write(&mut self, cb: ControlBlock, data: &[u8], now: Millis) -> Result<usize, StackError>;

    /// Bytes `write` would currently accept on a stream control block.
    fn send_capacity(&self, cb: ControlBlock) -> usize;

    /// The application consumed `len` bytes previously taken through `on_readable`.
    fn recved(&mut self, cb: ControlBlock, len: usize, now: Millis);

    /// Releases a control block. No further events are delivered for it.
    fn close(&mut self, cb: ControlBlock, now: Millis) -> Result<(), StackError>;

    fn local_addr(&self, cb: ControlBlock) -> Option<SocketAddr>;

    fn peer_addr(&self, cb: ControlBlock) -> Option<SocketAddr>;

    /// Feeds one inbound Ethernet frame to the stack.
    fn inject(&mut self, frame: &[u8], now: Millis, sink: &mut dyn StackEventSink);

    /// Runs protocol timers and delivers any pending events.
    fn poll(&mut self, now: Millis, sink: &mut dyn StackEventSink);

    /// Expires neighbor-discovery state.
    fn discovery_tick(&mut self, _now: Millis) {}

    /// How long the stack can sleep before `poll` has work to do, if it knows.
    fn poll_delay(&mut self, now: Millis) -> Option<Duration>;
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackKind {
    #[default]
    Smoltcp,
    Segment,
}

impl StackKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smoltcp" | "poll" => Some(StackKind::Smoltcp),
            "segment" | "callback" => Some(StackKind::Segment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StackParams {
    pub mac: MacAddr,
    /// IP MTU (Ethernet payload size).
    pub mtu: usize,
    /// Per-socket stream buffer size inside the stack, in each direction.
    pub stream_buffer: usize,
    /// Per-socket datagram buffer size inside the stack, in each direction.
    pub datagram_buffer: usize,
}

impl Default for StackParams {
    fn default() -> Self {
        Self {
            mac: MacAddr([0x02, 0x6e, 0x63, 0x00, 0x00, 0x01]),
            mtu: 2800,
            stream_buffer: 64 * 1024,
            datagram_buffer: 64 * 1024,
        }
    }
}

/// Builds the selected backend. `output` receives every frame the stack transmits.
pub fn build(
    kind: StackKind,
    params: StackParams,
    output: FrameOutput,
    now: Millis,
) -> Box<dyn ProtocolStack> {
    match kind {
        StackKind::Smoltcp => Box::new(SmoltcpStack::new(params, output, now)),
        StackKind::Segment => Box::new(SegmentStack::new(params, output)),
    }
}
