//! The Ethernet tap: owns the protocol stack, the connection table and the pending RPC jobs.
//!
//! Everything that touches the stack goes through [`Shared::lock_core`], so the pump thread and
//! the channel event loop never call into the stack concurrently. Nested locks are always taken
//! in the order core, then a connection's state, then the address set or the frame buffer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use netcon_rpc::{
    classify_frame, encode_address_reply, encode_datagram_header, errno, ChannelFrame, Command,
    DataFrame, RetVal, RpcBlock, AF_INET, AF_INET6, RPC_ACK, SOCK_DGRAM, SOCK_STREAM,
    SOCK_TYPE_MASK,
};
use netcon_stack::packet::EthernetFrame;
use netcon_stack::{
    AcceptDecision, ControlBlock, FrameOutput, IpCidr, MacAddr, Millis, ProtocolStack,
    SocketKind, StackError, StackEventSink, StackParams,
};
use tracing::{debug, error, warn};

use crate::address::{AddressSet, GroupChanges};
use crate::channel::{AppChannel, ChannelId};
use crate::config::TapConfig;
use crate::connection::{BufferCaps, Connection, ConnectionInfo, ConnectionTable};
use crate::error::TapError;
use crate::frame_buffer::FrameBuffer;
use crate::jobs::{PendingJob, PendingJobs};
use crate::pump;

const MAX_BACKLOG: i32 = 16;

/// A frame the stack transmitted, split into its Ethernet fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundFrame<'a> {
    pub network_id: u64,
    pub src: MacAddr,
    pub dst: MacAddr,
    pub ethertype: u16,
    pub vlan: u16,
    pub payload: &'a [u8],
}

/// Receives every frame the tap sends toward the overlay network.
pub type FrameHandler = Arc<dyn Fn(&OutboundFrame<'_>) + Send + Sync>;

pub(crate) struct Core {
    pub table: ConnectionTable,
    pub jobs: PendingJobs,
    pub stack: Box<dyn ProtocolStack>,
    pub last_discovery: Millis,
    pub last_status: Millis,
}

pub(crate) struct Shared {
    pub cfg: TapConfig,
    start: Instant,
    enabled: AtomicBool,
    pub running: AtomicBool,
    core: Mutex<Core>,
    pub frames: FrameBuffer,
    addrs: Mutex<AddressSet>,
    wake: (Mutex<bool>, Condvar),
}

pub struct Tap {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Tap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tap")
            .field("device", &self.shared.cfg.device_name)
            .field("network_id", &format_args!("{:016x}", self.shared.cfg.network_id))
            .finish_non_exhaustive()
    }
}

impl Tap {
    /// Builds a tap around the configured backend. `handler` receives every outbound frame.
    pub fn new(cfg: TapConfig, handler: FrameHandler) -> Result<Arc<Self>, TapError> {
        validate(&cfg)?;
        let network_id = cfg.network_id;
        let output: FrameOutput = Arc::new(move |frame: &[u8]| match EthernetFrame::parse(frame) {
            Ok(eth) => handler(&OutboundFrame {
                network_id,
                src: eth.src,
                dst: eth.dst,
                ethertype: eth.ethertype,
                vlan: 0,
                payload: eth.payload,
            }),
            Err(err) => warn!(len = frame.len(), %err, "dropping malformed outbound frame"),
        });
        let params = StackParams {
            mac: cfg.mac,
            mtu: cfg.mtu,
            ..StackParams::default()
        };
        let stack = netcon_stack::build(cfg.backend, params, output, 0);
        Self::start(cfg, stack)
    }

    /// Builds a tap around a caller-supplied stack. The stack's clock must start at zero.
    pub fn with_stack(cfg: TapConfig, stack: Box<dyn ProtocolStack>) -> Result<Arc<Self>, TapError> {
        validate(&cfg)?;
        Self::start(cfg, stack)
    }

    fn start(cfg: TapConfig, stack: Box<dyn ProtocolStack>) -> Result<Arc<Self>, TapError> {
        debug!(
            device = %cfg.device_name,
            mac = %cfg.mac,
            backend = stack.name(),
            "starting tap"
        );
        let shared = Arc::new(Shared {
            frames: FrameBuffer::new(cfg.frame_buffer_capacity),
            start: Instant::now(),
            enabled: AtomicBool::new(true),
            running: AtomicBool::new(true),
            core: Mutex::new(Core {
                table: ConnectionTable::default(),
                jobs: PendingJobs::default(),
                stack,
                last_discovery: 0,
                last_status: 0,
            }),
            addrs: Mutex::new(AddressSet::default()),
            wake: (Mutex::new(false), Condvar::new()),
            cfg,
        });

        let pump = if shared.cfg.run_pump_thread {
            let pump_shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("netcon-pump-{}", shared.cfg.device_name))
                .spawn(move || pump::run(pump_shared))
                .map_err(|err| TapError::Spawn("pump", err))?;
            Some(handle)
        } else {
            None
        };

        Ok(Arc::new(Self {
            shared,
            pump: Mutex::new(pump),
        }))
    }

    /// Queues an inbound frame from the overlay. Returns false if it was dropped.
    pub fn put(&self, src: MacAddr, dst: MacAddr, ethertype: u16, payload: &[u8]) -> bool {
        if !self.enabled() {
            warn!(%src, %dst, ethertype, "tap disabled; dropping inbound frame");
            return false;
        }
        let frame = EthernetFrame::serialize(dst, src, ethertype, payload);
        let len = frame.len();
        if !self.shared.frames.push(frame) {
            warn!(len, queued = self.shared.frames.queued_bytes(), "frame buffer full; dropping inbound frame");
            return false;
        }
        self.shared.wake();
        true
    }

    /// Assigns an address. The stack is told about each distinct address once; returns false if
    /// the address was already assigned.
    pub fn add_address(&self, cidr: IpCidr) -> Result<bool, TapError> {
        if !self.shared.lock_addrs().insert(cidr) {
            return Ok(false);
        }
        let result = self.shared.lock_core().stack.add_address(cidr);
        if let Err(err) = result {
            self.shared.lock_addrs().remove(&cidr);
            return Err(err.into());
        }
        debug!(%cidr, "address added");
        Ok(true)
    }

    pub fn remove_address(&self, cidr: IpCidr) -> bool {
        if !self.shared.lock_addrs().remove(&cidr) {
            return false;
        }
        self.shared.lock_core().stack.remove_address(cidr);
        debug!(%cidr, "address removed");
        true
    }

    pub fn addresses(&self) -> Vec<IpCidr> {
        self.shared.lock_addrs().to_vec()
    }

    /// Multicast groups joined and left since the previous call.
    pub fn scan_multicast_groups(&self) -> GroupChanges {
        self.shared.lock_addrs().scan()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &TapConfig {
        &self.shared.cfg
    }

    pub fn mac(&self) -> MacAddr {
        self.shared.cfg.mac
    }

    pub fn mtu(&self) -> usize {
        self.shared.cfg.mtu
    }

    pub fn network_id(&self) -> u64 {
        self.shared.cfg.network_id
    }

    pub fn device_name(&self) -> &str {
        &self.shared.cfg.device_name
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock_core().table.len()
    }

    pub fn connection_info(&self, channel: ChannelId) -> Option<ConnectionInfo> {
        let core = self.shared.lock_core();
        core.table.find_by_channel(channel).map(|conn| conn.info())
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let core = self.shared.lock_core();
        core.table.connections().iter().map(|c| c.info()).collect()
    }

    pub fn has_pending_job(&self, token: u64) -> bool {
        self.shared.lock_core().jobs.contains(token)
    }

    pub fn pending_job_count(&self) -> usize {
        self.shared.lock_core().jobs.len()
    }

    /// Destroys the connection owned by `channel`. Returns false if it was already gone.
    pub fn close_connection(&self, channel: ChannelId) -> bool {
        let mut core = self.shared.lock_core();
        self.shared.destroy(&mut core, channel)
    }

    /// Handles one read from an application channel: a control block or stream bytes.
    pub fn on_channel_data(&self, channel: &Arc<dyn AppChannel>, data: &[u8]) {
        match classify_frame(data) {
            Ok(ChannelFrame::Control(block)) => self.shared.handle_control(channel, block),
            Ok(ChannelFrame::Data(frame)) => self.shared.handle_data(channel, frame),
            Err(err) => warn!(channel = channel.id(), %err, "dropping malformed control frame"),
        }
        self.shared.wake();
    }

    /// The channel can take more bytes: deliver what is buffered.
    pub fn on_channel_writable(&self, channel: ChannelId) {
        let now = self.shared.now();
        let mut core = self.shared.lock_core();
        if let Some(conn) = core.table.find_by_channel(channel) {
            self.shared.deliver(&mut core, &conn, now);
        }
        drop(core);
        // Delivery may have reopened a receive window with bytes held inside the stack.
        self.shared.wake();
    }

    /// The application end went away.
    pub fn on_channel_closed(&self, channel: ChannelId) {
        let mut core = self.shared.lock_core();
        self.shared.destroy(&mut core, channel);
        let orphaned = core.jobs.remove_for_channel(channel);
        if orphaned.is_empty() {
            return;
        }
        for conn in core.table.connections() {
            let mut state = conn.lock();
            if matches!(state.connect_token, Some(t) if orphaned.contains(&t)) {
                state.connect_token = None;
            }
        }
        debug!(channel, jobs = orphaned.len(), "dropped jobs of closed reply channel");
    }

    /// Runs one full pump iteration on the calling thread.
    pub fn pump_once(&self) {
        let _ = self.shared.cycle(true);
    }

    /// Stops the pump thread and destroys every connection. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake();
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("pump thread panicked");
            }
        }

        let mut core = self.shared.lock_core();
        let ids: Vec<ChannelId> = core.table.connections().iter().map(|c| c.id).collect();
        for id in ids {
            self.shared.destroy(&mut core, id);
        }
        for job in core.jobs.drain() {
            job.channel.close();
        }
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn validate(cfg: &TapConfig) -> Result<(), TapError> {
    if cfg.mtu < 576 {
        return Err(TapError::InvalidConfig("mtu below 576"));
    }
    if cfg.read_chunk == 0 {
        return Err(TapError::InvalidConfig("read_chunk is zero"));
    }
    if cfg.udp_payload_mtu == 0 || cfg.udp_payload_mtu > cfg.mtu - 48 {
        return Err(TapError::InvalidConfig("udp_payload_mtu does not fit the mtu"));
    }
    if cfg.stream_rx_cap == 0 || cfg.datagram_rx_cap == 0 {
        return Err(TapError::InvalidConfig("rx buffer cap is zero"));
    }
    Ok(())
}

fn reply(channel: &Arc<dyn AppChannel>, bytes: &[u8]) {
    match channel.write(bytes) {
        Ok(n) if n == bytes.len() => {}
        Ok(n) => warn!(channel = channel.id(), n, len = bytes.len(), "short reply write"),
        Err(err) => debug!(channel = channel.id(), %err, "reply write failed"),
    }
}

/// Writes the reply and closes the reply channel.
fn finish(job: PendingJob, bytes: &[u8]) {
    reply(&job.channel, bytes);
    job.channel.close();
}

/// Stages a job under its token. A token already pending refuses the job with EINVAL.
fn stage(jobs: &mut PendingJobs, token: u64, job: PendingJob) -> bool {
    match jobs.insert(token, job) {
        Ok(()) => true,
        Err(job) => {
            warn!(channel = job.channel.id(), token, "duplicate rpc token");
            finish(job, &RetVal::error(errno::EINVAL).encode());
            false
        }
    }
}

fn unspecified(like: SocketAddr) -> SocketAddr {
    match like {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

impl Shared {
    pub fn now(&self) -> Millis {
        self.start.elapsed().as_millis() as Millis
    }

    pub fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_addrs(&self) -> MutexGuard<'_, AddressSet> {
        self.addrs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn wake(&self) {
        let (flag, cvar) = &self.wake;
        *flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        cvar.notify_all();
    }

    /// Blocks until woken or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) {
        let (flag, cvar) = &self.wake;
        let guard = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (mut guard, _) = cvar
            .wait_timeout_while(guard, timeout, |woken| !*woken)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = false;
    }

    fn caps(&self, kind: SocketKind) -> BufferCaps {
        let (rx, tx) = match kind {
            SocketKind::Stream => (self.cfg.stream_rx_cap, self.cfg.stream_tx_cap),
            SocketKind::Datagram => (self.cfg.datagram_rx_cap, self.cfg.datagram_tx_cap),
        };
        BufferCaps {
            rx,
            tx,
            read_chunk: self.cfg.read_chunk,
        }
    }

    /// Runs a stack call that may deliver events, then fills in addresses the sink could not
    /// look up while the stack was borrowed.
    pub fn with_sink(
        &self,
        core: &mut Core,
        f: impl FnOnce(&mut dyn ProtocolStack, &mut dyn StackEventSink),
    ) {
        let Core {
            table, jobs, stack, ..
        } = core;
        let mut sink = CoreSink {
            table,
            jobs,
            shared: self,
            resolve: Vec::new(),
        };
        f(stack.as_mut(), &mut sink);
        for conn in sink.resolve {
            let mut state = conn.lock();
            let Some(cb) = state.control_block else {
                continue;
            };
            if state.local_addr.is_none() {
                state.local_addr = stack.local_addr(cb);
            }
            if state.peer_addr.is_none() {
                state.peer_addr = stack.peer_addr(cb);
            }
        }
    }

    /// Detaches and tears down a connection. Returns false if it was already gone.
    pub fn destroy(&self, core: &mut Core, channel: ChannelId) -> bool {
        let Some(conn) = core.table.remove(channel) else {
            return false;
        };
        let (cb, token) = {
            let mut state = conn.lock();
            (state.control_block.take(), state.connect_token.take())
        };
        if let Some(job) = token.and_then(|t| core.jobs.take(t)) {
            finish(
                job,
                &RetVal::error(StackError::ProtocolAborted.errno()).encode(),
            );
        }
        if let Some(cb) = cb {
            if let Err(err) = core.stack.close(cb, self.now()) {
                debug!(channel, %cb, %err, "stack close failed");
            }
        }
        conn.channel.close();
        debug!(channel, kind = ?conn.kind, "connection destroyed");
        true
    }

    fn handle_control(&self, channel: &Arc<dyn AppChannel>, block: RpcBlock) {
        debug!(
            channel = channel.id(),
            pid = block.pid,
            token = block.token,
            command = block.command.name(),
            "rpc"
        );
        let mut core = self.lock_core();
        if let Command::Socket {
            domain,
            socket_type,
            protocol,
        } = block.command
        {
            let ret = self.open_socket(&mut core, channel, block.pid, domain, socket_type);
            match ret {
                Ok(()) => reply(channel, &[RPC_ACK]),
                Err(err) => {
                    debug!(channel = channel.id(), domain, socket_type, protocol, %err, "socket failed");
                    reply(channel, &RetVal::error(err.errno()).encode());
                }
            }
            return;
        }

        let token = block.token;
        let job = PendingJob {
            channel: channel.clone(),
            block,
        };
        if stage(&mut core.jobs, token, job) {
            reply(channel, &[RPC_ACK]);
        }
    }

    fn open_socket(
        &self,
        core: &mut Core,
        channel: &Arc<dyn AppChannel>,
        pid: u32,
        domain: i32,
        socket_type: i32,
    ) -> Result<(), StackError> {
        if core.table.find_by_channel(channel.id()).is_some() {
            return Err(StackError::InvalidArgument);
        }
        if domain != i32::from(AF_INET) && domain != i32::from(AF_INET6) {
            return Err(StackError::Unsupported);
        }
        let kind = match socket_type & SOCK_TYPE_MASK {
            SOCK_STREAM => SocketKind::Stream,
            SOCK_DGRAM => SocketKind::Datagram,
            _ => return Err(StackError::Unsupported),
        };
        let cb = core.stack.open(kind)?;
        let conn = Arc::new(Connection::new(kind, channel.clone(), self.caps(kind)));
        {
            let mut state = conn.lock();
            state.control_block = Some(cb);
            state.pid = pid;
        }
        core.table.insert(conn);
        debug!(channel = channel.id(), %cb, ?kind, pid, "connection created");
        Ok(())
    }

    fn handle_data(&self, channel: &Arc<dyn AppChannel>, frame: DataFrame<'_>) {
        let now = self.now();
        let mut core = self.lock_core();
        let Some(conn) = core.table.find_by_channel(channel.id()) else {
            warn!(channel = channel.id(), len = frame.len(), "stream bytes on channel without a connection");
            return;
        };

        self.append_tx(&conn, frame.head);
        if let Some(token) = frame.token {
            match core.jobs.take(token) {
                Some(job) => self.dispatch(&mut core, &conn, token, job, now),
                None => warn!(channel = conn.id, token, "token without a pending job"),
            }
        }
        self.append_tx(&conn, frame.tail);
        self.handle_write(&mut core, &conn, now);
    }

    fn append_tx(&self, conn: &Connection, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut state = conn.lock();
        let n = state.tx.append(bytes);
        if n < bytes.len() {
            warn!(channel = conn.id, dropped = bytes.len() - n, "tx buffer overflow");
        }
        conn.refresh_readable(&mut state);
    }

    fn dispatch(&self, core: &mut Core, conn: &Arc<Connection>, token: u64, job: PendingJob, now: Millis) {
        match job.block.command {
            Command::Bind { addr, .. } => {
                let ret = self.bind(core, conn, addr);
                finish(job, &ret.encode());
            }
            Command::Listen { backlog, .. } => {
                let ret = self.listen(core, conn, backlog);
                finish(job, &ret.encode());
            }
            Command::Connect { addr, .. } => {
                match self.connect(core, conn, addr, token, now) {
                    // Resolved from on_connected or on_error.
                    Ok(true) => {
                        stage(&mut core.jobs, token, job);
                    }
                    Ok(false) => {
                        finish(job, &RetVal::OK.encode());
                        self.handle_write(core, conn, now);
                    }
                    Err(err) => finish(job, &RetVal::error(err.errno()).encode()),
                }
            }
            Command::GetSockName { .. } => {
                let state = conn.lock();
                let addr = state
                    .local_addr
                    .or_else(|| state.control_block.and_then(|cb| core.stack.local_addr(cb)));
                drop(state);
                let ret = match addr {
                    Some(_) => RetVal::OK,
                    None => RetVal::error(errno::EINVAL),
                };
                finish(job, &encode_address_reply(ret, addr));
            }
            Command::GetPeerName { .. } => {
                let addr = conn.lock().peer_addr;
                let ret = match addr {
                    Some(_) => RetVal::OK,
                    None => RetVal::error(errno::ENOTCONN),
                };
                finish(job, &encode_address_reply(ret, addr));
            }
            Command::Socket { .. } | Command::Unknown(_) => {
                debug!(channel = conn.id, token, code = job.block.command.code(), "ignoring command");
                job.channel.close();
            }
        }
    }

    fn bind(&self, core: &mut Core, conn: &Connection, addr: Option<SocketAddr>) -> RetVal {
        if self.lock_addrs().is_empty() {
            return RetVal::error(StackError::OutOfMemory.errno());
        }
        let Some(addr) = addr else {
            return RetVal::error(errno::EINVAL);
        };
        let mut state = conn.lock();
        if state.local_addr.is_some() || state.listening || state.peer_addr.is_some() {
            return RetVal::error(StackError::InvalidArgument.errno());
        }
        let Some(cb) = state.control_block else {
            return RetVal::error(StackError::InvalidConnection.errno());
        };
        match core.stack.bind(cb, addr) {
            Ok(bound) => {
                debug!(channel = conn.id, %cb, %bound, "bound");
                state.local_addr = Some(bound);
                RetVal::OK
            }
            Err(err) => RetVal::error(err.errno()),
        }
    }

    fn listen(&self, core: &mut Core, conn: &Connection, backlog: i32) -> RetVal {
        if conn.kind == SocketKind::Datagram {
            return RetVal::OK;
        }
        let mut state = conn.lock();
        if state.listening {
            return RetVal::OK;
        }
        let Some(cb) = state.control_block else {
            return RetVal::error(StackError::InvalidConnection.errno());
        };
        let backlog = backlog.clamp(1, MAX_BACKLOG) as usize;
        match core.stack.listen(cb, backlog) {
            Ok(()) => {
                debug!(channel = conn.id, %cb, backlog, "listening");
                state.listening = true;
                RetVal::OK
            }
            Err(err) => RetVal::error(err.errno()),
        }
    }

    /// Starts a connect. `Ok(true)` means the reply is deferred until the handshake resolves.
    fn connect(
        &self,
        core: &mut Core,
        conn: &Connection,
        addr: Option<SocketAddr>,
        token: u64,
        now: Millis,
    ) -> Result<bool, StackError> {
        let addr = addr.ok_or(StackError::InvalidArgument)?;
        let mut state = conn.lock();
        let cb = state.control_block.ok_or(StackError::InvalidConnection)?;
        match conn.kind {
            SocketKind::Stream => {
                if state.listening || state.connect_token.is_some() {
                    return Err(StackError::InvalidArgument);
                }
                if state.peer_addr.is_some() {
                    return Err(StackError::AlreadyConnected);
                }
                core.stack.connect(cb, addr, now)?;
                state.connect_token = Some(token);
                debug!(channel = conn.id, %cb, %addr, token, "connecting");
                Ok(true)
            }
            SocketKind::Datagram => {
                if state.local_addr.is_none() {
                    state.local_addr = Some(core.stack.bind(cb, unspecified(addr))?);
                }
                core.stack.connect(cb, addr, now)?;
                // The stack narrows a wildcard bind to the source it picked for this peer.
                if let Some(local) = core.stack.local_addr(cb) {
                    state.local_addr = Some(local);
                }
                state.peer_addr = Some(addr);
                debug!(channel = conn.id, %cb, %addr, local = ?state.local_addr, "datagram peer set");
                Ok(false)
            }
        }
    }

    /// Moves queued application bytes into the stack.
    pub fn handle_write(&self, core: &mut Core, conn: &Connection, now: Millis) {
        let mut state = conn.lock();
        let Some(cb) = state.control_block else {
            return;
        };
        if state.tx.is_empty() || state.peer_addr.is_none() || state.connect_token.is_some() {
            return;
        }

        let mut failed = None;
        match conn.kind {
            SocketKind::Stream => {
                let capacity = core.stack.send_capacity(cb);
                let offer = match capacity {
                    // Offering bytes anyway registers interest in writability.
                    0 => state.tx.len(),
                    cap => cap.min(state.tx.len()),
                };
                let chunk = state.tx.front(offer);
                match core.stack.write(cb, chunk, now) {
                    Ok(0) => state.probation = true,
                    Ok(n) => state.tx.consume(n),
                    Err(err) => failed = Some(err),
                }
            }
            SocketKind::Datagram => {
                while !state.tx.is_empty() {
                    let len = state.tx.len().min(self.cfg.udp_payload_mtu);
                    let chunk = state.tx.front(len);
                    match core.stack.write(cb, chunk, now) {
                        Ok(0) => break,
                        Ok(n) => state.tx.consume(n),
                        Err(err) => {
                            failed = Some(err);
                            break;
                        }
                    }
                }
            }
        }
        conn.refresh_readable(&mut state);
        drop(state);

        if let Some(err) = failed {
            error!(channel = conn.id, %cb, %err, "stack write failed");
            self.destroy(core, conn.id);
        }
    }

    /// Copies buffered stack bytes to the application channel.
    pub fn deliver(&self, core: &mut Core, conn: &Connection, now: Millis) {
        let mut state = conn.lock();
        let mut delivered = 0;
        let mut failed = None;
        while !state.rx.is_empty() {
            let (front, _) = state.rx.as_slices();
            match conn.channel.write(front) {
                Ok(0) => break,
                Ok(n) => {
                    state.rx.consume(n);
                    delivered += n;
                }
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }
        conn.channel.set_notify_writable(!state.rx.is_empty());
        let cb = state.control_block;
        let finished = state.peer_closed && state.rx.is_empty();
        drop(state);

        if let Some(err) = failed {
            debug!(channel = conn.id, %err, "channel write failed");
            self.destroy(core, conn.id);
            return;
        }
        if delivered > 0 && conn.kind == SocketKind::Stream {
            if let Some(cb) = cb {
                core.stack.recved(cb, delivered, now);
            }
        }
        if finished {
            debug!(channel = conn.id, "peer closed and rx drained");
            self.destroy(core, conn.id);
        }
    }
}

/// Routes stack events into the connection table.
struct CoreSink<'a> {
    table: &'a mut ConnectionTable,
    jobs: &'a mut PendingJobs,
    shared: &'a Shared,
    /// Connections whose addresses should be read back from the stack after the call.
    resolve: Vec<Arc<Connection>>,
}

impl StackEventSink for CoreSink<'_> {
    fn on_readable(&mut self, cb: ControlBlock, data: &[u8], from: Option<SocketAddr>) -> usize {
        let Some(conn) = self.table.find_by_control_block(cb) else {
            return data.len();
        };
        let mut state = conn.lock();
        match conn.kind {
            SocketKind::Stream => state.rx.append(data),
            SocketKind::Datagram => {
                let Some(from) = from else {
                    return data.len();
                };
                match encode_datagram_header(from, data.len()) {
                    Ok(header) => {
                        if !state.rx.append_whole(&[&header, data]) {
                            warn!(channel = conn.id, %from, len = data.len(), "rx full; dropping datagram");
                        }
                    }
                    Err(err) => warn!(channel = conn.id, %from, %err, "dropping datagram"),
                }
                data.len()
            }
        }
    }

    fn on_writable(&mut self, cb: ControlBlock) {
        if let Some(conn) = self.table.find_by_control_block(cb) {
            let mut state = conn.lock();
            state.probation = false;
            conn.refresh_readable(&mut state);
        }
    }

    fn on_connected(&mut self, cb: ControlBlock) {
        let Some(conn) = self.table.find_by_control_block(cb) else {
            return;
        };
        let token = conn.lock().connect_token.take();
        debug!(channel = conn.id, %cb, "connected");
        if let Some(job) = token.and_then(|t| self.jobs.take(t)) {
            finish(job, &RetVal::OK.encode());
        }
        self.resolve.push(conn);
    }

    fn on_accept(
        &mut self,
        listener: ControlBlock,
        accepted: ControlBlock,
        peer: SocketAddr,
    ) -> AcceptDecision {
        let Some(listening) = self.table.find_by_control_block(listener) else {
            return AcceptDecision::Abort;
        };
        let channel = match listening.channel.spawn_accepted() {
            Ok(channel) => channel,
            Err(err) => {
                warn!(channel = listening.id, %peer, %err, "accept hand-off failed");
                return AcceptDecision::Abort;
            }
        };
        let pid = listening.lock().pid;
        let conn = Arc::new(Connection::new(
            SocketKind::Stream,
            channel,
            self.shared.caps(SocketKind::Stream),
        ));
        {
            let mut state = conn.lock();
            state.control_block = Some(accepted);
            state.peer_addr = Some(peer);
            state.pid = pid;
        }
        debug!(listener = listening.id, channel = conn.id, %accepted, %peer, "accepted");
        self.table.insert(conn.clone());
        self.resolve.push(conn);
        AcceptDecision::Accept
    }

    fn on_error(&mut self, cb: ControlBlock, err: StackError) {
        let Some(conn) = self.table.find_by_control_block(cb) else {
            return;
        };
        error!(channel = conn.id, %cb, %err, "connection failed");
        self.table.remove(conn.id);
        let token = {
            let mut state = conn.lock();
            state.control_block = None;
            state.connect_token.take()
        };
        if let Some(job) = token.and_then(|t| self.jobs.take(t)) {
            finish(job, &RetVal::error(err.errno()).encode());
        }
        conn.channel.close();
    }

    fn on_peer_closed(&mut self, cb: ControlBlock) {
        if let Some(conn) = self.table.find_by_control_block(cb) {
            debug!(channel = conn.id, %cb, "peer closed");
            conn.lock().peer_closed = true;
        }
    }
}
