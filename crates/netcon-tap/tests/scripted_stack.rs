//! Buffer, backpressure and lifecycle behavior against a stack whose events are scripted.

use std::net::SocketAddr;
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use netcon_rpc::{
    decode_datagram_record, encode_token, errno, Command, RetVal, RpcBlock, AF_INET, RPC_ACK,
    SOCK_DGRAM, SOCK_STREAM,
};
use netcon_stack::{
    AcceptDecision, ControlBlock, IpCidr, Millis, ProtocolStack, SocketKind, StackError,
    StackEventSink,
};
use netcon_tap::{AppChannel, ConnectionStatus, MemoryChannel, Tap, TapConfig};

enum Event {
    Readable(ControlBlock, Vec<u8>, Option<SocketAddr>),
    Writable(ControlBlock),
    Connected(ControlBlock),
    Accept(ControlBlock, ControlBlock, SocketAddr),
    Error(ControlBlock, StackError),
    PeerClosed(ControlBlock),
}

#[derive(Default)]
struct Script {
    next_cb: u64,
    capacity: usize,
    written: Vec<u8>,
    closed: Vec<ControlBlock>,
    events: Vec<Event>,
    decisions: Vec<AcceptDecision>,
    /// Bytes the sink refused, per control block.
    unread: Vec<(ControlBlock, usize)>,
}

#[derive(Clone, Default)]
struct Handle(Arc<Mutex<Script>>);

impl Handle {
    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    fn push(&self, event: Event) {
        self.with(|s| s.events.push(event));
    }
}

struct ScriptedStack(Handle);

impl ProtocolStack for ScriptedStack {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn add_address(&mut self, _cidr: IpCidr) -> Result<(), StackError> {
        Ok(())
    }

    fn remove_address(&mut self, _cidr: IpCidr) {}

    fn open(&mut self, _kind: SocketKind) -> Result<ControlBlock, StackError> {
        Ok(self.0.with(|s| {
            s.next_cb += 1;
            ControlBlock::from_raw(s.next_cb)
        }))
    }

    fn bind(&mut self, _cb: ControlBlock, addr: SocketAddr) -> Result<SocketAddr, StackError> {
        Ok(addr)
    }

    fn listen(&mut self, _cb: ControlBlock, _backlog: usize) -> Result<(), StackError> {
        Ok(())
    }

    fn connect(&mut self, _cb: ControlBlock, _addr: SocketAddr, _now: Millis) -> Result<(), StackError> {
        Ok(())
    }

    fn write(&mut self, _cb: ControlBlock, data: &[u8], _now: Millis) -> Result<usize, StackError> {
        Ok(self.0.with(|s| {
            let n = data.len().min(s.capacity);
            s.capacity -= n;
            s.written.extend_from_slice(&data[..n]);
            n
        }))
    }

    fn send_capacity(&self, _cb: ControlBlock) -> usize {
        self.0.with(|s| s.capacity)
    }

    fn recved(&mut self, _cb: ControlBlock, _len: usize, _now: Millis) {}

    fn close(&mut self, cb: ControlBlock, _now: Millis) -> Result<(), StackError> {
        self.0.with(|s| s.closed.push(cb));
        Ok(())
    }

    fn local_addr(&self, _cb: ControlBlock) -> Option<SocketAddr> {
        Some("10.0.0.1:40000".parse().unwrap())
    }

    fn peer_addr(&self, _cb: ControlBlock) -> Option<SocketAddr> {
        Some("10.0.0.2:80".parse().unwrap())
    }

    fn inject(&mut self, _frame: &[u8], _now: Millis, _sink: &mut dyn StackEventSink) {}

    fn poll(&mut self, _now: Millis, sink: &mut dyn StackEventSink) {
        let events = self.0.with(|s| std::mem::take(&mut s.events));
        for event in events {
            match event {
                Event::Readable(cb, data, from) => {
                    let taken = sink.on_readable(cb, &data, from);
                    if taken < data.len() {
                        self.0.with(|s| s.unread.push((cb, data.len() - taken)));
                    }
                }
                Event::Writable(cb) => sink.on_writable(cb),
                Event::Connected(cb) => sink.on_connected(cb),
                Event::Accept(l, a, peer) => {
                    let decision = sink.on_accept(l, a, peer);
                    self.0.with(|s| s.decisions.push(decision));
                }
                Event::Error(cb, err) => sink.on_error(cb, err),
                Event::PeerClosed(cb) => sink.on_peer_closed(cb),
            }
        }
    }

    fn poll_delay(&mut self, _now: Millis) -> Option<Duration> {
        None
    }
}

fn setup(cfg: TapConfig) -> (Arc<Tap>, Handle) {
    let handle = Handle::default();
    let cfg = TapConfig {
        run_pump_thread: false,
        ..cfg
    };
    let tap = Tap::with_stack(cfg, Box::new(ScriptedStack(handle.clone()))).unwrap();
    tap.add_address("10.0.0.1/24".parse().unwrap()).unwrap();
    (tap, handle)
}

fn dyn_channel(ch: &Arc<MemoryChannel>) -> Arc<dyn AppChannel> {
    ch.clone()
}

fn open(tap: &Tap, socket_type: i32) -> (Arc<MemoryChannel>, ControlBlock) {
    let ch = MemoryChannel::new();
    let block = RpcBlock::new(
        7,
        1,
        0,
        Command::Socket {
            domain: i32::from(AF_INET),
            socket_type,
            protocol: 0,
        },
    );
    tap.on_channel_data(&dyn_channel(&ch), &block.encode());
    assert_eq!(ch.take_written(), [RPC_ACK]);
    let cb = tap.connection_info(ch.id()).unwrap().control_block.unwrap();
    (ch, cb)
}

fn stage(tap: &Tap, data: &Arc<MemoryChannel>, token: u64, command: Command) -> Arc<MemoryChannel> {
    let reply = MemoryChannel::new();
    tap.on_channel_data(&dyn_channel(&reply), &RpcBlock::new(7, 1, token, command).encode());
    assert_eq!(reply.take_written(), [RPC_ACK]);
    tap.on_channel_data(&dyn_channel(data), &encode_token(token));
    reply
}

/// Opens a stream and completes a connect through the script.
fn connected(tap: &Tap, handle: &Handle) -> (Arc<MemoryChannel>, ControlBlock) {
    let (ch, cb) = open(tap, SOCK_STREAM);
    let reply = stage(tap, &ch, 1, Command::Connect { fd: 3, addr: Some("10.0.0.2:80".parse().unwrap()) });
    handle.push(Event::Connected(cb));
    tap.pump_once();
    assert_eq!(RetVal::decode(&reply.written()).unwrap(), RetVal::OK);
    (ch, cb)
}

#[test]
fn connect_job_resolves_once_on_connected() {
    let (tap, handle) = setup(TapConfig::default());
    let (ch, cb) = open(&tap, SOCK_STREAM);
    let reply = stage(&tap, &ch, 99, Command::Connect { fd: 3, addr: Some("10.0.0.2:80".parse().unwrap()) });
    assert!(tap.has_pending_job(99));
    assert!(reply.written().is_empty());

    handle.push(Event::Connected(cb));
    handle.push(Event::Connected(cb));
    tap.pump_once();

    assert!(!tap.has_pending_job(99));
    assert_eq!(reply.written(), RetVal::OK.encode());
    assert!(reply.is_closed());
    let info = tap.connection_info(ch.id()).unwrap();
    assert_eq!(info.status, ConnectionStatus::Connected);
    assert_eq!(info.local_addr, Some("10.0.0.1:40000".parse().unwrap()));
}

#[test]
fn stack_error_resolves_connect_and_destroys() {
    let (tap, handle) = setup(TapConfig::default());
    let (ch, cb) = open(&tap, SOCK_STREAM);
    let reply = stage(&tap, &ch, 5, Command::Connect { fd: 3, addr: Some("10.0.0.2:80".parse().unwrap()) });

    handle.push(Event::Error(cb, StackError::Timeout));
    tap.pump_once();

    assert_eq!(RetVal::decode(&reply.written()).unwrap(), RetVal::error(errno::ETIMEDOUT));
    assert!(!tap.has_pending_job(5));
    assert_eq!(tap.connection_count(), 0);
    assert!(ch.is_closed());
    // The backend already released the control block.
    assert!(handle.with(|s| s.closed.is_empty()));
}

#[test]
fn tx_over_cap_suppresses_reads_until_drained() {
    let cfg = TapConfig {
        datagram_tx_cap: 64,
        read_chunk: 16,
        ..TapConfig::default()
    };
    let (tap, handle) = setup(cfg);
    handle.with(|s| s.capacity = 1000);
    // Without a peer nothing leaves tx, so it fills past the cap.
    let (ch, _cb) = open(&tap, SOCK_DGRAM);
    let data = dyn_channel(&ch);

    let payload: Vec<u8> = (0..65u8).collect();
    for chunk in payload.chunks(16) {
        assert!(ch.notify_readable());
        tap.on_channel_data(&data, chunk);
    }
    let info = tap.connection_info(ch.id()).unwrap();
    assert_eq!(info.tx_len, 65);
    assert!(info.disabled);
    assert!(!info.probation);
    assert!(!ch.notify_readable());

    let reply = stage(&tap, &ch, 2, Command::Connect { fd: 3, addr: Some("10.0.0.2:53".parse().unwrap()) });
    assert_eq!(RetVal::decode(&reply.written()).unwrap(), RetVal::OK);

    let info = tap.connection_info(ch.id()).unwrap();
    assert_eq!(info.tx_len, 0);
    assert!(!info.disabled);
    assert!(ch.notify_readable());
    assert_eq!(handle.with(|s| s.written.clone()), payload);
}

#[test]
fn full_stack_buffer_holds_reads_until_writable() {
    let cfg = TapConfig {
        stream_tx_cap: 32,
        read_chunk: 16,
        ..TapConfig::default()
    };
    let (tap, handle) = setup(cfg);
    let (ch, cb) = connected(&tap, &handle);

    tap.on_channel_data(&dyn_channel(&ch), &[1u8; 16]);
    let info = tap.connection_info(ch.id()).unwrap();
    assert!(info.probation);
    assert!(!ch.notify_readable());

    // Room in the stack alone does not lift probation; the pump still drains what it can.
    handle.with(|s| s.capacity = 10);
    tap.pump_once();
    let info = tap.connection_info(ch.id()).unwrap();
    assert_eq!(info.tx_len, 6);
    assert!(info.probation);
    assert!(!ch.notify_readable());

    handle.with(|s| s.capacity = 100);
    handle.push(Event::Writable(cb));
    tap.pump_once();
    let info = tap.connection_info(ch.id()).unwrap();
    assert_eq!(info.tx_len, 0);
    assert!(!info.probation);
    assert!(ch.notify_readable());
    assert_eq!(handle.with(|s| s.written.len()), 16);
}

#[test]
fn stream_rx_takes_only_what_fits() {
    let cfg = TapConfig {
        stream_rx_cap: 8,
        ..TapConfig::default()
    };
    let (tap, handle) = setup(cfg);
    let (ch, cb) = connected(&tap, &handle);
    ch.set_write_limit(Some(0));

    handle.push(Event::Readable(cb, b"0123456789".to_vec(), None));
    tap.pump_once();
    assert_eq!(tap.connection_info(ch.id()).unwrap().rx_len, 8);
    assert_eq!(handle.with(|s| s.unread.clone()), vec![(cb, 2)]);
    assert!(ch.notify_writable());

    ch.set_write_limit(None);
    tap.on_channel_writable(ch.id());
    assert_eq!(ch.written(), b"01234567");
    assert!(!ch.notify_writable());
}

#[test]
fn datagrams_arrive_as_records_and_overflow_drops_whole() {
    let cfg = TapConfig {
        datagram_rx_cap: 64,
        ..TapConfig::default()
    };
    let (tap, handle) = setup(cfg);
    let (ch, cb) = open(&tap, SOCK_DGRAM);
    ch.set_write_limit(Some(0));
    let from: SocketAddr = "10.0.0.7:5000".parse().unwrap();

    handle.push(Event::Readable(cb, vec![0xaa; 30], Some(from)));
    handle.push(Event::Readable(cb, vec![0xbb; 30], Some(from)));
    tap.pump_once();
    // 21 + 30 fits once; the second record would overflow and is dropped.
    assert_eq!(tap.connection_info(ch.id()).unwrap().rx_len, 51);
    assert!(handle.with(|s| s.unread.is_empty()));

    ch.set_write_limit(None);
    tap.pump_once();
    let written = ch.written();
    let (sender, payload, used) = decode_datagram_record(&written).unwrap();
    assert_eq!(sender, from);
    assert_eq!(payload, &[0xaa; 30][..]);
    assert_eq!(used, written.len());
}

#[test]
fn datagram_writes_are_chunked_to_the_payload_mtu() {
    let cfg = TapConfig {
        udp_payload_mtu: 10,
        ..TapConfig::default()
    };
    let (tap, handle) = setup(cfg);
    handle.with(|s| s.capacity = 1000);
    let (ch, _cb) = open(&tap, SOCK_DGRAM);
    tap.on_channel_data(&dyn_channel(&ch), &[3u8; 25]);
    assert_eq!(tap.connection_info(ch.id()).unwrap().tx_len, 25);

    let reply = stage(&tap, &ch, 4, Command::Connect { fd: 3, addr: Some("10.0.0.2:53".parse().unwrap()) });
    assert_eq!(RetVal::decode(&reply.written()).unwrap(), RetVal::OK);
    assert_eq!(tap.connection_info(ch.id()).unwrap().tx_len, 0);
    assert_eq!(handle.with(|s| s.written.len()), 25);
}

#[test]
fn accept_creates_a_connection_with_a_new_channel() {
    let (tap, handle) = setup(TapConfig::default());
    let (listener, cb) = open(&tap, SOCK_STREAM);
    let peer: SocketAddr = "10.0.0.9:33000".parse().unwrap();

    handle.push(Event::Accept(cb, ControlBlock::from_raw(100), peer));
    tap.pump_once();
    assert_eq!(handle.with(|s| s.decisions.clone()), vec![AcceptDecision::Accept]);
    assert_eq!(tap.connection_count(), 2);

    let accepted = listener.next_accepted().unwrap();
    let info = tap.connection_info(accepted.id()).unwrap();
    assert_eq!(info.peer_addr, Some(peer));
    assert_eq!(info.pid, 7);

    handle.push(Event::Readable(ControlBlock::from_raw(100), b"hello".to_vec(), None));
    tap.pump_once();
    assert_eq!(accepted.written(), b"hello");
}

#[test]
fn failed_hand_off_aborts_the_accept() {
    let (tap, handle) = setup(TapConfig::default());
    let (listener, cb) = open(&tap, SOCK_STREAM);
    listener.fail_next_accept();
    handle.push(Event::Accept(cb, ControlBlock::from_raw(100), "10.0.0.9:1".parse().unwrap()));
    tap.pump_once();
    assert_eq!(handle.with(|s| s.decisions.clone()), vec![AcceptDecision::Abort]);
    assert_eq!(tap.connection_count(), 1);
}

#[test]
fn peer_close_waits_for_rx_to_drain() {
    let (tap, handle) = setup(TapConfig::default());
    let (ch, cb) = connected(&tap, &handle);
    ch.set_write_limit(Some(2));

    handle.push(Event::Readable(cb, b"hello".to_vec(), None));
    handle.push(Event::PeerClosed(cb));
    tap.pump_once();
    assert_eq!(ch.written(), b"he");
    assert!(tap.connection_info(ch.id()).unwrap().peer_closed);

    ch.set_write_limit(None);
    tap.on_channel_writable(ch.id());
    assert_eq!(ch.written(), b"hello");
    assert_eq!(tap.connection_count(), 0);
    assert_eq!(handle.with(|s| s.closed.clone()), vec![cb]);
}

#[test]
fn events_for_unknown_control_blocks_are_ignored() {
    let (tap, handle) = setup(TapConfig::default());
    let ghost = ControlBlock::from_raw(555);
    handle.push(Event::Readable(ghost, b"x".to_vec(), None));
    handle.push(Event::Writable(ghost));
    handle.push(Event::Connected(ghost));
    handle.push(Event::Error(ghost, StackError::ProtocolAborted));
    handle.push(Event::PeerClosed(ghost));
    handle.push(Event::Accept(ghost, ControlBlock::from_raw(556), "10.0.0.9:1".parse().unwrap()));
    tap.pump_once();
    assert_eq!(tap.connection_count(), 0);
    assert_eq!(handle.with(|s| s.decisions.clone()), vec![AcceptDecision::Abort]);
}

#[test]
fn concurrent_destroy_removes_exactly_once() {
    let (tap, handle) = setup(TapConfig::default());
    let (_keep, _) = open(&tap, SOCK_STREAM);
    let (ch, cb) = open(&tap, SOCK_STREAM);
    assert_eq!(tap.connection_count(), 2);

    const THREADS: usize = 8;
    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let tap = tap.clone();
            let barrier = barrier.clone();
            let id = ch.id();
            std::thread::spawn(move || {
                barrier.wait();
                tap.close_connection(id)
            })
        })
        .collect();
    let destroyed = workers
        .into_iter()
        .map(|w| w.join().unwrap())
        .filter(|&d| d)
        .count();

    assert_eq!(destroyed, 1);
    assert_eq!(tap.connection_count(), 1);
    assert_eq!(handle.with(|s| s.closed.clone()), vec![cb]);
}
