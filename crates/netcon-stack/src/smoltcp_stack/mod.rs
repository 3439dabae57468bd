//! Polling backend built on `smoltcp`.
//!
//! Injected frames are queued on an in-memory device and processed by the interface poll that
//! follows. smoltcp reports nothing by callback, so after every poll each control block's socket
//! state is compared with what was last reported and the differences become sink events.
//!
//! A listening control block owns a pool of `backlog` listening sockets. When one of them leaves
//! the handshake states it is handed out as a new control block and replaced in the pool.

mod device;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::{Duration as SmolDuration, Instant};
use smoltcp::wire::{
    EthernetAddress, HardwareAddress, IpAddress, IpCidr as SmolCidr, IpEndpoint,
    IpListenEndpoint, Ipv4Address, Ipv6Address,
};
use tracing::{debug, trace, warn};

use crate::{
    AcceptDecision, ControlBlock, FrameOutput, IpCidr, Millis, ProtocolStack, SocketKind,
    StackError, StackEventSink, StackParams,
};
use device::FrameDevice;

const EPHEMERAL_START: u16 = 49152;
const CONNECT_TIMEOUT_MS: Millis = 20_000;
const UDP_METADATA_SLOTS: usize = 64;
const IPV4_UDP_OVERHEAD: usize = 28;

fn instant(now: Millis) -> Instant {
    Instant::from_millis(now as i64)
}

fn to_smol_addr(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address(v4.octets())),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address(v6.octets())),
    }
}

fn from_smol_addr(addr: IpAddress) -> IpAddr {
    match addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4.0)),
        IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6.0)),
    }
}

fn to_endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(to_smol_addr(addr.ip()), addr.port())
}

fn from_endpoint(ep: IpEndpoint) -> SocketAddr {
    SocketAddr::new(from_smol_addr(ep.addr), ep.port)
}

fn listen_endpoint(addr: SocketAddr) -> IpListenEndpoint {
    IpListenEndpoint {
        addr: (!addr.ip().is_unspecified()).then(|| to_smol_addr(addr.ip())),
        port: addr.port(),
    }
}

fn to_smol_cidr(cidr: IpCidr) -> SmolCidr {
    SmolCidr::new(to_smol_addr(cidr.addr()), cidr.prefix_len())
}

#[derive(Debug)]
enum TcpPhase {
    Idle,
    Listening { pool: Vec<SocketHandle> },
    Connecting { since: Millis },
    Open,
}

#[derive(Debug)]
struct TcpEntry {
    handle: SocketHandle,
    bound: Option<SocketAddr>,
    phase: TcpPhase,
    send_blocked: bool,
    peer_closed: bool,
    /// Closed by the owner; reaped once smoltcp finishes with it.
    detached: bool,
}

#[derive(Debug)]
struct UdpEntry {
    handle: SocketHandle,
    bound: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    /// Address a wildcard-bound socket sends from once connected.
    source: Option<IpAddr>,
}

#[derive(Debug)]
enum Entry {
    Tcp(TcpEntry),
    Udp(UdpEntry),
}

pub struct SmoltcpStack {
    params: StackParams,
    device: FrameDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    addrs: Vec<IpCidr>,
    entries: HashMap<ControlBlock, Entry>,
    next_cb: u64,
    next_ephemeral: u16,
}

impl SmoltcpStack {
    pub fn new(params: StackParams, output: FrameOutput, now: Millis) -> Self {
        let mut device = FrameDevice::new(output, params.mtu);
        let mut config = Config::new(HardwareAddress::Ethernet(EthernetAddress(params.mac.0)));
        config.random_seed = rand::random();
        let iface = Interface::new(config, &mut device, instant(now));
        Self {
            params,
            device,
            iface,
            sockets: SocketSet::new(Vec::new()),
            addrs: Vec::new(),
            entries: HashMap::new(),
            next_cb: 1,
            next_ephemeral: EPHEMERAL_START,
        }
    }

    fn alloc_cb(&mut self) -> ControlBlock {
        let cb = ControlBlock::from_raw(self.next_cb);
        self.next_cb += 1;
        cb
    }

    fn new_tcp_socket(&self) -> tcp::Socket<'static> {
        let rx = tcp::SocketBuffer::new(vec![0u8; self.params.stream_buffer]);
        let tx = tcp::SocketBuffer::new(vec![0u8; self.params.stream_buffer]);
        let mut socket = tcp::Socket::new(rx, tx);
        socket.set_nagle_enabled(false);
        socket
    }

    fn new_udp_socket(&self) -> udp::Socket<'static> {
        let buffer = || {
            udp::PacketBuffer::new(
                vec![udp::PacketMetadata::EMPTY; UDP_METADATA_SLOTS],
                vec![0u8; self.params.datagram_buffer],
            )
        };
        udp::Socket::new(buffer(), buffer())
    }

    fn max_datagram(&self) -> usize {
        self.params
            .mtu
            .saturating_sub(IPV4_UDP_OVERHEAD)
            .min(self.params.datagram_buffer)
    }

    fn is_local(&self, ip: IpAddr) -> bool {
        self.addrs.iter().any(|c| c.addr() == ip)
    }

    /// Picks the assigned address on the destination's subnet, else the first of its family.
    fn source_for(&self, dst: IpAddr) -> Option<IpAddr> {
        self.addrs
            .iter()
            .find(|c| c.contains(dst))
            .or_else(|| self.addrs.iter().find(|c| c.addr().is_ipv4() == dst.is_ipv4()))
            .map(|c| c.addr())
    }

    fn port_in_use(&self, kind: SocketKind, port: u16) -> bool {
        self.entries.values().any(|e| match (e, kind) {
            (Entry::Tcp(t), SocketKind::Stream) => {
                !t.detached && t.bound.map(|b| b.port()) == Some(port)
            }
            (Entry::Udp(u), SocketKind::Datagram) => u.bound.map(|b| b.port()) == Some(port),
            _ => false,
        })
    }

    fn ephemeral_port(&mut self, kind: SocketKind) -> Result<u16, StackError> {
        for _ in 0..=(u16::MAX - EPHEMERAL_START) {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == u16::MAX {
                EPHEMERAL_START
            } else {
                port + 1
            };
            if !self.port_in_use(kind, port) {
                return Ok(port);
            }
        }
        Err(StackError::AddressInUse)
    }

    /// Lets the interface transmit whatever the last operation queued.
    fn flush(&mut self, now: Millis) {
        self.iface
            .poll(instant(now), &mut self.device, &mut self.sockets);
    }

    fn drive(&mut self, now: Millis, sink: &mut dyn StackEventSink) {
        self.flush(now);
        self.collect_events(now, sink);
        // Reading may have opened receive windows.
        self.flush(now);
    }

    fn release(&mut self, cb: ControlBlock) {
        match self.entries.remove(&cb) {
            Some(Entry::Tcp(t)) => {
                if let TcpPhase::Listening { pool } = t.phase {
                    for h in pool {
                        self.sockets.remove(h);
                    }
                }
                self.sockets.remove(t.handle);
            }
            Some(Entry::Udp(u)) => {
                self.sockets.remove(u.handle);
            }
            None => {}
        }
    }

    fn collect_events(&mut self, now: Millis, sink: &mut dyn StackEventSink) {
        let mut cbs: Vec<ControlBlock> = self.entries.keys().copied().collect();
        cbs.sort();
        for cb in cbs {
            match self.entries.get(&cb) {
                Some(Entry::Tcp(_)) => self.tcp_events(cb, now, sink),
                Some(Entry::Udp(_)) => self.udp_events(cb, sink),
                None => {}
            }
        }
    }

    fn tcp_events(&mut self, cb: ControlBlock, now: Millis, sink: &mut dyn StackEventSink) {
        let Some(Entry::Tcp(entry)) = self.entries.get_mut(&cb) else {
            return;
        };
        let handle = entry.handle;

        if entry.detached {
            let state = self.sockets.get::<tcp::Socket>(handle).state();
            if matches!(state, tcp::State::Closed | tcp::State::TimeWait) {
                trace!(%cb, "reaping closed socket");
                self.release(cb);
            }
            return;
        }

        match &entry.phase {
            TcpPhase::Idle => {}
            TcpPhase::Listening { .. } => self.accept_ready(cb, sink),
            TcpPhase::Connecting { since } => {
                let since = *since;
                let socket = self.sockets.get_mut::<tcp::Socket>(handle);
                match socket.state() {
                    tcp::State::SynSent | tcp::State::SynReceived => {}
                    tcp::State::Closed => {
                        let err = if now.saturating_sub(since) >= CONNECT_TIMEOUT_MS {
                            StackError::Timeout
                        } else {
                            StackError::ProtocolAborted
                        };
                        self.release(cb);
                        sink.on_error(cb, err);
                    }
                    _ => {
                        socket.set_timeout(None);
                        entry.phase = TcpPhase::Open;
                        sink.on_connected(cb);
                        self.open_events(cb, sink);
                    }
                }
            }
            TcpPhase::Open => self.open_events(cb, sink),
        }
    }

    fn open_events(&mut self, cb: ControlBlock, sink: &mut dyn StackEventSink) {
        let Some(Entry::Tcp(entry)) = self.entries.get_mut(&cb) else {
            return;
        };
        let socket = self.sockets.get_mut::<tcp::Socket>(entry.handle);

        while socket.can_recv() {
            let taken = socket.recv(|buf| {
                let n = sink.on_readable(cb, buf, None).min(buf.len());
                (n, n)
            });
            if !matches!(taken, Ok(n) if n > 0) {
                break;
            }
        }

        if entry.send_blocked && socket.can_send() {
            entry.send_blocked = false;
            sink.on_writable(cb);
        }

        if !entry.peer_closed && !socket.may_recv() && !socket.can_recv() {
            match socket.state() {
                tcp::State::Closed => {
                    self.release(cb);
                    sink.on_error(cb, StackError::ProtocolAborted);
                }
                tcp::State::CloseWait
                | tcp::State::LastAck
                | tcp::State::Closing
                | tcp::State::TimeWait => {
                    entry.peer_closed = true;
                    sink.on_peer_closed(cb);
                }
                _ => {}
            }
        } else if socket.state() == tcp::State::Closed {
            self.release(cb);
            sink.on_error(cb, StackError::ProtocolAborted);
        }
    }

    fn accept_ready(&mut self, listener: ControlBlock, sink: &mut dyn StackEventSink) {
        let Some(Entry::Tcp(TcpEntry {
            bound,
            phase: TcpPhase::Listening { pool },
            ..
        })) = self.entries.get(&listener)
        else {
            return;
        };
        let Some(bound) = *bound else {
            return;
        };
        let mut ready = Vec::new();
        for (slot, &h) in pool.iter().enumerate() {
            let state = self.sockets.get::<tcp::Socket>(h).state();
            match state {
                tcp::State::Listen | tcp::State::SynReceived => {}
                _ => ready.push((slot, h, state)),
            }
        }

        for (slot, handle, state) in ready {
            let mut replacement = self.new_tcp_socket();
            if let Err(e) = replacement.listen(listen_endpoint(bound)) {
                warn!(%listener, error = ?e, "cannot refill listen pool");
                continue;
            }
            let fresh = self.sockets.add(replacement);
            if let Some(Entry::Tcp(TcpEntry {
                phase: TcpPhase::Listening { pool },
                ..
            })) = self.entries.get_mut(&listener)
            {
                pool[slot] = fresh;
            }

            let socket = self.sockets.get_mut::<tcp::Socket>(handle);
            let (Some(local), Some(peer)) = (socket.local_endpoint(), socket.remote_endpoint())
            else {
                debug!(%listener, ?state, "dropping pool socket without endpoints");
                self.sockets.remove(handle);
                continue;
            };
            let accepted = self.alloc_cb();
            self.entries.insert(
                accepted,
                Entry::Tcp(TcpEntry {
                    handle,
                    bound: Some(from_endpoint(local)),
                    phase: TcpPhase::Open,
                    send_blocked: false,
                    peer_closed: false,
                    detached: false,
                }),
            );
            match sink.on_accept(listener, accepted, from_endpoint(peer)) {
                AcceptDecision::Accept => self.open_events(accepted, sink),
                AcceptDecision::Abort => {
                    self.sockets.get_mut::<tcp::Socket>(handle).abort();
                    if let Some(Entry::Tcp(t)) = self.entries.get_mut(&accepted) {
                        t.detached = true;
                    }
                }
            }
        }
    }

    fn udp_events(&mut self, cb: ControlBlock, sink: &mut dyn StackEventSink) {
        let Some(Entry::Udp(entry)) = self.entries.get(&cb) else {
            return;
        };
        let peer = entry.peer;
        let socket = self.sockets.get_mut::<udp::Socket>(entry.handle);
        while let Ok((data, meta)) = socket.recv() {
            let from = from_endpoint(meta.endpoint);
            if peer.is_some_and(|p| p != from) {
                continue;
            }
            if sink.on_readable(cb, data, Some(from)) < data.len() {
                trace!(%cb, len = data.len(), "datagram not taken");
            }
        }
    }
}

impl ProtocolStack for SmoltcpStack {
    fn name(&self) -> &'static str {
        "smoltcp"
    }

    fn add_address(&mut self, cidr: IpCidr) -> Result<(), StackError> {
        if self.addrs.contains(&cidr) {
            return Ok(());
        }
        let smol = to_smol_cidr(cidr);
        let mut full = false;
        self.iface.update_ip_addrs(|addrs| {
            full = addrs.push(smol).is_err();
        });
        if full {
            return Err(StackError::OutOfMemory);
        }
        self.addrs.push(cidr);
        Ok(())
    }

    fn remove_address(&mut self, cidr: IpCidr) {
        let smol = to_smol_cidr(cidr);
        self.iface.update_ip_addrs(|addrs| addrs.retain(|c| *c != smol));
        self.addrs.retain(|c| *c != cidr);
    }

    fn open(&mut self, kind: SocketKind) -> Result<ControlBlock, StackError> {
        let entry = match kind {
            SocketKind::Stream => {
                let handle = self.sockets.add(self.new_tcp_socket());
                Entry::Tcp(TcpEntry {
                    handle,
                    bound: None,
                    phase: TcpPhase::Idle,
                    send_blocked: false,
                    peer_closed: false,
                    detached: false,
                })
            }
            SocketKind::Datagram => {
                let handle = self.sockets.add(self.new_udp_socket());
                Entry::Udp(UdpEntry {
                    handle,
                    bound: None,
                    peer: None,
                    source: None,
                })
            }
        };
        let cb = self.alloc_cb();
        self.entries.insert(cb, entry);
        Ok(cb)
    }

    fn bind(&mut self, cb: ControlBlock, addr: SocketAddr) -> Result<SocketAddr, StackError> {
        if !addr.ip().is_unspecified() && !self.is_local(addr.ip()) {
            return Err(StackError::InvalidArgument);
        }
        let kind = match self.entries.get(&cb) {
            None => return Err(StackError::InvalidConnection),
            Some(Entry::Tcp(t)) if t.bound.is_some() || !matches!(t.phase, TcpPhase::Idle) => {
                return Err(StackError::InvalidArgument)
            }
            Some(Entry::Udp(u)) if u.bound.is_some() => return Err(StackError::InvalidArgument),
            Some(Entry::Tcp(_)) => SocketKind::Stream,
            Some(Entry::Udp(_)) => SocketKind::Datagram,
        };
        let port = match addr.port() {
            0 => self.ephemeral_port(kind)?,
            port if self.port_in_use(kind, port) => return Err(StackError::AddressInUse),
            port => port,
        };
        let bound = SocketAddr::new(addr.ip(), port);
        match self.entries.get_mut(&cb) {
            Some(Entry::Tcp(t)) => t.bound = Some(bound),
            Some(Entry::Udp(u)) => {
                u.bound = Some(bound);
                self.sockets
                    .get_mut::<udp::Socket>(u.handle)
                    .bind(listen_endpoint(bound))
                    .map_err(|_| StackError::InvalidArgument)?;
            }
            None => return Err(StackError::InvalidConnection),
        }
        Ok(bound)
    }

    fn listen(&mut self, cb: ControlBlock, backlog: usize) -> Result<(), StackError> {
        let bound = match self.entries.get(&cb) {
            None => return Err(StackError::InvalidConnection),
            Some(Entry::Udp(_)) => return Err(StackError::InvalidArgument),
            Some(Entry::Tcp(t)) => match t.phase {
                TcpPhase::Listening { .. } => return Ok(()),
                TcpPhase::Idle => t.bound,
                _ => return Err(StackError::InvalidArgument),
            },
        };
        let bound = match bound {
            Some(b) => b,
            None => {
                let port = self.ephemeral_port(SocketKind::Stream)?;
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
            }
        };
        let mut pool = Vec::with_capacity(backlog.max(1));
        for _ in 0..backlog.max(1) {
            let mut socket = self.new_tcp_socket();
            if socket.listen(listen_endpoint(bound)).is_err() {
                for h in pool {
                    self.sockets.remove(h);
                }
                return Err(StackError::InvalidArgument);
            }
            pool.push(self.sockets.add(socket));
        }
        if let Some(Entry::Tcp(t)) = self.entries.get_mut(&cb) {
            t.bound = Some(bound);
            t.phase = TcpPhase::Listening { pool };
        }
        Ok(())
    }

    fn connect(
        &mut self,
        cb: ControlBlock,
        addr: SocketAddr,
        now: Millis,
    ) -> Result<(), StackError> {
        let (kind, bound) = match self.entries.get(&cb) {
            None => return Err(StackError::InvalidConnection),
            Some(Entry::Tcp(t)) => match t.phase {
                TcpPhase::Idle => (SocketKind::Stream, t.bound),
                TcpPhase::Listening { .. } => return Err(StackError::InvalidArgument),
                _ => return Err(StackError::AlreadyConnected),
            },
            Some(Entry::Udp(u)) => (SocketKind::Datagram, u.bound),
        };
        let source = self
            .source_for(addr.ip())
            .ok_or(StackError::HostUnreachable)?;
        let local = match bound {
            Some(b) => b,
            None => {
                let port = self.ephemeral_port(kind)?;
                let unspecified = match addr {
                    SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                };
                SocketAddr::new(unspecified, port)
            }
        };

        match self.entries.get_mut(&cb) {
            Some(Entry::Tcp(t)) => {
                let socket = self.sockets.get_mut::<tcp::Socket>(t.handle);
                socket.set_timeout(Some(SmolDuration::from_millis(CONNECT_TIMEOUT_MS)));
                socket
                    .connect(self.iface.context(), to_endpoint(addr), listen_endpoint(local))
                    .map_err(|e| match e {
                        tcp::ConnectError::InvalidState => StackError::AlreadyConnected,
                        _ => StackError::HostUnreachable,
                    })?;
                t.bound = Some(local);
                t.phase = TcpPhase::Connecting { since: now };
            }
            Some(Entry::Udp(u)) => {
                if u.bound.is_none() {
                    self.sockets
                        .get_mut::<udp::Socket>(u.handle)
                        .bind(listen_endpoint(local))
                        .map_err(|_| StackError::InvalidArgument)?;
                    u.bound = Some(local);
                }
                u.peer = Some(addr);
                u.source = Some(source);
            }
            None => return Err(StackError::InvalidConnection),
        }
        self.flush(now);
        Ok(())
    }

    fn write(&mut self, cb: ControlBlock, data: &[u8], now: Millis) -> Result<usize, StackError> {
        let max_datagram = self.max_datagram();
        let written = match self.entries.get_mut(&cb) {
            None => return Err(StackError::InvalidConnection),
            Some(Entry::Tcp(t)) => match t.phase {
                TcpPhase::Idle | TcpPhase::Listening { .. } => {
                    return Err(StackError::NotConnected)
                }
                TcpPhase::Connecting { .. } => {
                    t.send_blocked = true;
                    0
                }
                TcpPhase::Open => {
                    let socket = self.sockets.get_mut::<tcp::Socket>(t.handle);
                    let n = socket
                        .send_slice(data)
                        .map_err(|_| StackError::NotConnected)?;
                    if n < data.len() {
                        t.send_blocked = true;
                    }
                    n
                }
            },
            Some(Entry::Udp(u)) => {
                let peer = u.peer.ok_or(StackError::NotConnected)?;
                if data.len() > max_datagram {
                    return Err(StackError::InvalidArgument);
                }
                let socket = self.sockets.get_mut::<udp::Socket>(u.handle);
                match socket.send_slice(data, to_endpoint(peer)) {
                    Ok(()) => data.len(),
                    Err(udp::SendError::BufferFull) => 0,
                    Err(_) => return Err(StackError::HostUnreachable),
                }
            }
        };
        if written > 0 {
            self.flush(now);
        }
        Ok(written)
    }

    fn send_capacity(&self, cb: ControlBlock) -> usize {
        match self.entries.get(&cb) {
            Some(Entry::Tcp(t)) if matches!(t.phase, TcpPhase::Open) => {
                let socket = self.sockets.get::<tcp::Socket>(t.handle);
                if socket.may_send() {
                    socket.send_capacity() - socket.send_queue()
                } else {
                    0
                }
            }
            Some(Entry::Udp(u)) if u.peer.is_some() => {
                if self.sockets.get::<udp::Socket>(u.handle).can_send() {
                    self.max_datagram()
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn recved(&mut self, _cb: ControlBlock, _len: usize, now: Millis) {
        self.flush(now);
    }

    fn close(&mut self, cb: ControlBlock, now: Millis) -> Result<(), StackError> {
        match self.entries.get_mut(&cb) {
            None => return Err(StackError::InvalidConnection),
            Some(Entry::Tcp(t)) if matches!(t.phase, TcpPhase::Open) && !t.detached => {
                self.sockets.get_mut::<tcp::Socket>(t.handle).close();
                t.detached = true;
            }
            Some(Entry::Tcp(t)) if t.detached => {}
            Some(Entry::Tcp(t)) => {
                self.sockets.get_mut::<tcp::Socket>(t.handle).abort();
                if let TcpPhase::Listening { pool } = &t.phase {
                    for &h in pool {
                        self.sockets.get_mut::<tcp::Socket>(h).abort();
                    }
                }
                self.flush(now);
                self.release(cb);
                return Ok(());
            }
            Some(Entry::Udp(_)) => {
                self.release(cb);
                return Ok(());
            }
        }
        self.flush(now);
        Ok(())
    }

    fn local_addr(&self, cb: ControlBlock) -> Option<SocketAddr> {
        match self.entries.get(&cb)? {
            Entry::Tcp(t) => {
                let socket = self.sockets.get::<tcp::Socket>(t.handle);
                match t.phase {
                    TcpPhase::Open | TcpPhase::Connecting { .. } => socket
                        .local_endpoint()
                        .map(from_endpoint)
                        .or(t.bound),
                    _ => t.bound,
                }
            }
            Entry::Udp(u) => match (u.bound, u.source) {
                (Some(b), Some(ip)) if b.ip().is_unspecified() => Some(SocketAddr::new(ip, b.port())),
                (bound, _) => bound,
            },
        }
    }

    fn peer_addr(&self, cb: ControlBlock) -> Option<SocketAddr> {
        match self.entries.get(&cb)? {
            Entry::Tcp(t) => match t.phase {
                TcpPhase::Open | TcpPhase::Connecting { .. } => self
                    .sockets
                    .get::<tcp::Socket>(t.handle)
                    .remote_endpoint()
                    .map(from_endpoint),
                _ => None,
            },
            Entry::Udp(u) => u.peer,
        }
    }

    fn inject(&mut self, frame: &[u8], now: Millis, sink: &mut dyn StackEventSink) {
        self.device.push_rx(frame);
        self.drive(now, sink);
    }

    fn poll(&mut self, now: Millis, sink: &mut dyn StackEventSink) {
        self.drive(now, sink);
    }

    fn poll_delay(&mut self, now: Millis) -> Option<Duration> {
        self.iface
            .poll_delay(instant(now), &self.sockets)
            .map(|d| Duration::from_millis(d.total_millis()))
    }
}
