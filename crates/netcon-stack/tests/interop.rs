//! Both backends speak plain Ethernet, so either can sit on each end of a wire.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use netcon_stack::{
    build, AcceptDecision, ControlBlock, Millis, ProtocolStack, SocketKind, StackError,
    StackEventSink, StackKind, StackParams,
};
use netcon_stack::packet::MacAddr;

#[derive(Default)]
struct Sink {
    received: Vec<u8>,
    connected: bool,
    accepted: Option<ControlBlock>,
    errors: Vec<StackError>,
}

impl StackEventSink for Sink {
    fn on_readable(&mut self, _cb: ControlBlock, data: &[u8], _from: Option<SocketAddr>) -> usize {
        self.received.extend_from_slice(data);
        data.len()
    }
    fn on_writable(&mut self, _cb: ControlBlock) {}
    fn on_connected(&mut self, _cb: ControlBlock) {
        self.connected = true;
    }
    fn on_accept(&mut self, _l: ControlBlock, a: ControlBlock, _peer: SocketAddr) -> AcceptDecision {
        self.accepted = Some(a);
        AcceptDecision::Accept
    }
    fn on_error(&mut self, _cb: ControlBlock, err: StackError) {
        self.errors.push(err);
    }
    fn on_peer_closed(&mut self, _cb: ControlBlock) {}
}

type Wire = Arc<Mutex<Vec<Vec<u8>>>>;

struct Node {
    stack: Box<dyn ProtocolStack>,
    wire: Wire,
    sink: Sink,
}

fn node(kind: StackKind, last: u8) -> Node {
    let wire: Wire = Arc::default();
    let tx = wire.clone();
    let params = StackParams {
        mac: MacAddr([0x02, 0, 0, 0, 0, last]),
        mtu: 1500,
        ..StackParams::default()
    };
    let mut stack = build(kind, params, Arc::new(move |f: &[u8]| tx.lock().unwrap().push(f.to_vec())), 0);
    stack
        .add_address(format!("192.168.7.{last}/24").parse().unwrap())
        .unwrap();
    Node {
        stack,
        wire,
        sink: Sink::default(),
    }
}

fn run(a: &mut Node, b: &mut Node, now: &mut Millis, rounds: usize) {
    for _ in 0..rounds {
        *now += 5;
        a.stack.poll(*now, &mut a.sink);
        b.stack.poll(*now, &mut b.sink);
        let to_b: Vec<_> = a.wire.lock().unwrap().drain(..).collect();
        let to_a: Vec<_> = b.wire.lock().unwrap().drain(..).collect();
        for f in &to_b {
            b.stack.inject(f, *now, &mut b.sink);
        }
        for f in &to_a {
            a.stack.inject(f, *now, &mut a.sink);
        }
    }
}

fn transfer(client_kind: StackKind, server_kind: StackKind) {
    let mut client = node(client_kind, 1);
    let mut server = node(server_kind, 2);
    let mut now = 0;

    let listener = server.stack.open(SocketKind::Stream).unwrap();
    server
        .stack
        .bind(listener, "0.0.0.0:4000".parse().unwrap())
        .unwrap();
    server.stack.listen(listener, 4).unwrap();

    let cb = client.stack.open(SocketKind::Stream).unwrap();
    client
        .stack
        .connect(cb, "192.168.7.2:4000".parse().unwrap(), now)
        .unwrap();
    run(&mut client, &mut server, &mut now, 40);
    assert!(client.sink.connected, "{client_kind:?} -> {server_kind:?} did not connect");
    assert!(server.sink.accepted.is_some());

    let payload: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
    let mut sent = 0;
    for _ in 0..200 {
        if sent < payload.len() {
            sent += client.stack.write(cb, &payload[sent..], now).unwrap();
        }
        run(&mut client, &mut server, &mut now, 1);
        if server.sink.received.len() == payload.len() {
            break;
        }
    }
    assert_eq!(server.sink.received, payload);
    assert!(client.sink.errors.is_empty());
}

#[test]
fn smoltcp_client_to_segment_server() {
    transfer(StackKind::Smoltcp, StackKind::Segment);
}

#[test]
fn segment_client_to_smoltcp_server() {
    transfer(StackKind::Segment, StackKind::Smoltcp);
}
