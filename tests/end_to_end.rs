//! Two taps joined by an in-process wire, one per backend, with applications on memory channels.

use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use netcon_rpc::{encode_token, Command, RetVal, RpcBlock, AF_INET, RPC_ACK, SOCK_STREAM};
use netcon_stack::{MacAddr, StackKind};
use netcon_tap::{AppChannel, ConnectionStatus, MemoryChannel, OutboundFrame, Tap, TapConfig};

type Link = Arc<OnceLock<Weak<Tap>>>;

fn tap(backend: StackKind, last: u8, link: Link) -> anyhow::Result<Arc<Tap>> {
    let cfg = TapConfig {
        mac: MacAddr([0x02, 0x6e, 0x63, 0, 0, last]),
        device_name: format!("e2e{last}"),
        backend,
        run_pump_thread: false,
        ..TapConfig::default()
    };
    let handler = Arc::new(move |frame: &OutboundFrame<'_>| {
        if let Some(peer) = link.get().and_then(Weak::upgrade) {
            peer.put(frame.src, frame.dst, frame.ethertype, frame.payload);
        }
    });
    let tap = Tap::new(cfg, handler)?;
    tap.add_address(format!("10.2.0.{last}/24").parse()?)?;
    Ok(tap)
}

fn dyn_channel(ch: &Arc<MemoryChannel>) -> Arc<dyn AppChannel> {
    ch.clone()
}

fn socket(tap: &Tap) -> Arc<MemoryChannel> {
    let ch = MemoryChannel::new();
    let block = RpcBlock::new(
        1,
        1,
        0,
        Command::Socket {
            domain: i32::from(AF_INET),
            socket_type: SOCK_STREAM,
            protocol: 0,
        },
    );
    tap.on_channel_data(&dyn_channel(&ch), &block.encode());
    assert_eq!(ch.take_written(), [RPC_ACK]);
    ch
}

/// Stages `command` on a fresh reply channel and releases it with a token on `data`.
fn call(tap: &Tap, data: &Arc<MemoryChannel>, token: u64, command: Command) -> Arc<MemoryChannel> {
    let reply = MemoryChannel::new();
    tap.on_channel_data(&dyn_channel(&reply), &RpcBlock::new(1, 1, token, command).encode());
    assert_eq!(reply.take_written(), [RPC_ACK]);
    tap.on_channel_data(&dyn_channel(data), &encode_token(token));
    reply
}

fn pump_until(taps: &[&Arc<Tap>], what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        for tap in taps {
            tap.pump_once();
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn transfer(client_backend: StackKind, server_backend: StackKind) -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let to_server: Link = Arc::default();
    let to_client: Link = Arc::default();
    let client = tap(client_backend, 1, to_server.clone())?;
    let server = tap(server_backend, 2, to_client.clone())?;
    let _ = to_server.set(Arc::downgrade(&server));
    let _ = to_client.set(Arc::downgrade(&client));
    let taps = [&client, &server];

    let target = "10.2.0.2:8080".parse()?;
    let listener = socket(&server);
    let bound = call(&server, &listener, 1, Command::Bind { fd: 3, addr: Some(target) });
    assert_eq!(RetVal::decode(&bound.written())?, RetVal::OK);
    let listening = call(&server, &listener, 2, Command::Listen { fd: 3, backlog: 4 });
    assert_eq!(RetVal::decode(&listening.written())?, RetVal::OK);

    let conn = socket(&client);
    let connect = call(&client, &conn, 3, Command::Connect { fd: 4, addr: Some(target) });
    pump_until(&taps, "connect reply", || !connect.written().is_empty());
    assert_eq!(RetVal::decode(&connect.written())?, RetVal::OK);
    assert_eq!(
        client.connection_info(conn.id()).map(|i| i.status),
        Some(ConnectionStatus::Connected)
    );

    pump_until(&taps, "accept", || server.connection_count() == 2);
    let accepted = listener
        .next_accepted()
        .ok_or_else(|| anyhow::anyhow!("no accepted channel"))?;
    // Hold delivery so the bytes stay observable in the server's rx buffer.
    accepted.set_write_limit(Some(0));

    let payload: Vec<u8> = (0..30u8).collect();
    client.on_channel_data(&dyn_channel(&conn), &payload[..10]);
    client.on_channel_data(&dyn_channel(&conn), &payload[10..]);
    pump_until(&taps, "server rx", || {
        server
            .connection_info(accepted.id())
            .is_some_and(|i| i.rx_len == payload.len())
    });

    accepted.set_write_limit(None);
    server.on_channel_writable(accepted.id());
    assert_eq!(accepted.written(), payload);
    assert_eq!(server.connection_info(accepted.id()).map(|i| i.rx_len), Some(0));

    client.shutdown();
    server.shutdown();
    Ok(())
}

#[test]
fn smoltcp_to_smoltcp() -> anyhow::Result<()> {
    transfer(StackKind::Smoltcp, StackKind::Smoltcp)
}

#[test]
fn segment_to_segment() -> anyhow::Result<()> {
    transfer(StackKind::Segment, StackKind::Segment)
}

#[test]
fn smoltcp_to_segment() -> anyhow::Result<()> {
    transfer(StackKind::Smoltcp, StackKind::Segment)
}

#[test]
fn segment_to_smoltcp() -> anyhow::Result<()> {
    transfer(StackKind::Segment, StackKind::Smoltcp)
}
