#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use netcon_stack::packet::EthernetFrame;
use netcon_tap::{ChannelService, FrameHandler, OutboundFrame, Tap, TapdConfig};
use tokio::net::UdpSocket;

type Peer = Arc<Mutex<Option<SocketAddr>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match TapdConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("invalid config: {err}");
            return Err(err.into());
        }
    };

    let overlay = Arc::new(
        UdpSocket::bind(config.overlay_bind)
            .await
            .with_context(|| format!("binding overlay socket {}", config.overlay_bind))?,
    );
    let peer: Peer = Arc::new(Mutex::new(config.overlay_peer));

    let handler: FrameHandler = {
        let overlay = overlay.clone();
        let peer = peer.clone();
        Arc::new(move |frame: &OutboundFrame<'_>| {
            let Some(to) = *peer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) else {
                tracing::trace!("no overlay peer yet; dropping outbound frame");
                return;
            };
            let bytes = EthernetFrame::serialize(frame.dst, frame.src, frame.ethertype, frame.payload);
            if let Err(err) = overlay.try_send_to(&bytes, to) {
                tracing::debug!(%to, %err, "overlay send failed");
            }
        })
    };

    let tap = Tap::new(config.tap.clone(), handler).context("starting tap")?;
    for cidr in &config.addresses {
        tap.add_address(*cidr)
            .with_context(|| format!("assigning {cidr}"))?;
    }
    let groups = tap.scan_multicast_groups();
    for group in &groups.added {
        tracing::info!(mac = %group.mac, adi = group.adi, "joined multicast group");
    }

    let mut service = ChannelService::bind(&config.socket_path, &tap)
        .with_context(|| format!("binding {}", config.socket_path.display()))?;
    tracing::info!(
        device = tap.device_name(),
        mac = %tap.mac(),
        overlay = %config.overlay_bind,
        "netcon-tapd ready"
    );

    let relay = tokio::spawn(relay(overlay, peer, tap.clone()));

    // Best-effort graceful shutdown on Ctrl+C / SIGTERM.
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }

    tracing::info!("shutdown signal received");
    relay.abort();
    service.shutdown();
    tap.shutdown();
    Ok(())
}

/// Feeds frames from the overlay socket into the tap, learning the peer if none was configured.
async fn relay(overlay: Arc<UdpSocket>, peer: Peer, tap: Arc<Tap>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match overlay.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                tracing::warn!(%err, "overlay receive failed");
                continue;
            }
        };
        {
            let mut peer = peer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if peer.is_none() {
                tracing::info!(%from, "learned overlay peer");
                *peer = Some(from);
            }
        }
        match EthernetFrame::parse(&buf[..n]) {
            Ok(eth) => {
                tap.put(eth.src, eth.dst, eth.ethertype, eth.payload);
            }
            Err(err) => tracing::debug!(%from, %err, "dropping malformed overlay datagram"),
        }
    }
}
