//! Applications on two taps wired back to back, talking through the Unix socket service.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use netcon_rpc::{decode_datagram_record, errno, DATAGRAM_HEADER_LEN};
use netcon_stack::{MacAddr, SocketKind};
use netcon_tap::{ChannelService, OutboundFrame, RpcClient, Tap, TapConfig};

const TIMEOUT: Duration = Duration::from_secs(10);

type Link = Arc<OnceLock<Weak<Tap>>>;

fn tap(last: u8, link: Link) -> Arc<Tap> {
    let cfg = TapConfig {
        mac: MacAddr([0x02, 0x6e, 0x63, 0, 0, last]),
        device_name: format!("netcon-test{last}"),
        ..TapConfig::default()
    };
    let handler = Arc::new(move |frame: &OutboundFrame<'_>| {
        if let Some(peer) = link.get().and_then(Weak::upgrade) {
            peer.put(frame.src, frame.dst, frame.ethertype, frame.payload);
        }
    });
    let tap = Tap::new(cfg, handler).unwrap();
    tap.add_address(format!("10.1.0.{last}/24").parse().unwrap())
        .unwrap();
    tap
}

struct Pair {
    _dir: tempfile::TempDir,
    taps: [Arc<Tap>; 2],
    services: [ChannelService; 2],
    clients: [RpcClient; 2],
}

fn pair() -> Pair {
    let to_b: Link = Arc::default();
    let to_a: Link = Arc::default();
    let a = tap(1, to_b.clone());
    let b = tap(2, to_a.clone());
    to_b.set(Arc::downgrade(&b)).unwrap();
    to_a.set(Arc::downgrade(&a)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let services = [
        ChannelService::bind(dir.path().join("a.sock"), &a).unwrap(),
        ChannelService::bind(dir.path().join("b.sock"), &b).unwrap(),
    ];
    let clients = [
        RpcClient::new(services[0].path()),
        RpcClient::new(services[1].path()),
    ];
    Pair {
        _dir: dir,
        taps: [a, b],
        services,
        clients,
    }
}

#[test]
fn stream_connect_accept_and_echo() {
    let pair = pair();
    let [client, server] = &pair.clients;
    let target: SocketAddr = "10.1.0.2:7000".parse().unwrap();

    let mut listener = server.socket(SocketKind::Stream, false).unwrap();
    listener.stream().set_read_timeout(Some(TIMEOUT)).unwrap();
    server.bind(&mut listener, target).unwrap();
    server.listen(&mut listener, 4).unwrap();
    assert_eq!(server.getsockname(&mut listener).unwrap(), target);

    let mut conn = client.socket(SocketKind::Stream, false).unwrap();
    conn.stream().set_read_timeout(Some(TIMEOUT)).unwrap();
    client.connect(&mut conn, target).unwrap();
    assert_eq!(client.getpeername(&mut conn).unwrap(), target);
    let local = client.getsockname(&mut conn).unwrap();
    assert_eq!(local.ip(), "10.1.0.1".parse::<std::net::IpAddr>().unwrap());

    let mut accepted = listener.accept().unwrap();
    accepted.set_read_timeout(Some(TIMEOUT)).unwrap();

    conn.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    accepted.write_all(b"pong").unwrap();
    conn.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pong");

    assert_eq!(pair.taps[0].connection_count(), 1);
    assert_eq!(pair.taps[1].connection_count(), 2);
}

#[test]
fn datagrams_carry_the_sender_address() {
    let pair = pair();
    let [client, server] = &pair.clients;
    let target: SocketAddr = "10.1.0.2:5353".parse().unwrap();

    let mut receiver = server.socket(SocketKind::Datagram, false).unwrap();
    receiver.stream().set_read_timeout(Some(TIMEOUT)).unwrap();
    server.bind(&mut receiver, target).unwrap();

    let mut sender = client.socket(SocketKind::Datagram, false).unwrap();
    client.connect(&mut sender, target).unwrap();
    let from = client.getsockname(&mut sender).unwrap();
    sender.write_all(b"hello").unwrap();

    let mut record = [0u8; DATAGRAM_HEADER_LEN + 5];
    receiver.read_exact(&mut record).unwrap();
    let (sender_addr, payload, used) = decode_datagram_record(&record).unwrap();
    assert_eq!(sender_addr.ip(), from.ip());
    assert_eq!(payload, b"hello");
    assert_eq!(used, record.len());
}

#[test]
fn refused_connect_reports_errno() {
    let pair = pair();
    let client = &pair.clients[0];
    let mut conn = client.socket(SocketKind::Stream, false).unwrap();
    let err = client
        .connect(&mut conn, "10.1.0.2:9".parse().unwrap())
        .unwrap_err();
    assert_eq!(err.errno(), Some(errno::ECONNREFUSED));
}

#[test]
fn hung_up_application_is_cleaned_up() {
    let pair = pair();
    let client = &pair.clients[0];
    let socket = client.socket(SocketKind::Stream, false).unwrap();
    assert_eq!(pair.taps[0].connection_count(), 1);
    drop(socket);

    let deadline = std::time::Instant::now() + TIMEOUT;
    while pair.taps[0].connection_count() != 0 {
        assert!(std::time::Instant::now() < deadline, "connection not cleaned up");
        std::thread::sleep(Duration::from_millis(10));
    }
}
