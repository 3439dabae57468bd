use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use netcon_stack::{IpCidr, MacAddr, StackKind};

/// Per-tap settings. Everything here is policy; nothing is negotiated with peers.
#[derive(Debug, Clone)]
pub struct TapConfig {
    /// MAC address of the virtual interface.
    pub mac: MacAddr,
    /// IP MTU of the virtual interface.
    pub mtu: usize,
    /// Overlay network this tap is attached to. Passed back with every outbound frame.
    pub network_id: u64,
    pub device_name: String,
    pub stream_rx_cap: usize,
    pub stream_tx_cap: usize,
    pub datagram_rx_cap: usize,
    pub datagram_tx_cap: usize,
    /// Largest single read taken from an application channel.
    pub read_chunk: usize,
    /// Byte budget of the inbound Ethernet frame queue.
    pub frame_buffer_capacity: usize,
    pub tcp_timer_interval: Duration,
    pub discovery_interval: Duration,
    /// How often stream channels are probed for liveness.
    pub status_interval: Duration,
    pub backend: StackKind,
    /// Largest datagram payload sent in one write.
    pub udp_payload_mtu: usize,
    /// Start the I/O pump thread. Tests turn this off and call `Tap::pump_once`.
    pub run_pump_thread: bool,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            mac: MacAddr([0x02, 0x6e, 0x63, 0x00, 0x00, 0x01]),
            mtu: 2800,
            network_id: 0,
            device_name: "netcon0".into(),
            stream_rx_cap: 256 * 1024,
            stream_tx_cap: 256 * 1024,
            datagram_rx_cap: 64 * 1024,
            datagram_tx_cap: 64 * 1024,
            read_chunk: 16 * 1024,
            frame_buffer_capacity: 1024 * 1024,
            tcp_timer_interval: Duration::from_millis(250),
            discovery_interval: Duration::from_secs(1),
            status_interval: Duration::from_millis(500),
            backend: StackKind::Smoltcp,
            udp_payload_mtu: 1400,
            run_pump_thread: true,
        }
    }
}

/// Settings for the `netcon-tapd` daemon.
#[derive(Debug, Clone)]
pub struct TapdConfig {
    pub socket_path: PathBuf,
    pub tap: TapConfig,
    pub addresses: Vec<IpCidr>,
    pub overlay_bind: SocketAddr,
    /// Where outbound frames go. Learned from the first inbound datagram when unset.
    pub overlay_peer: Option<SocketAddr>,
}

impl TapdConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let socket_path = var("NETCON_SOCKET_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingEnv("NETCON_SOCKET_PATH"))?;

        let mut tap = TapConfig::default();
        if let Some(raw) = var("NETCON_MAC") {
            tap.mac = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("NETCON_MAC"))?;
        }
        if let Some(raw) = var("NETCON_NETWORK_ID") {
            tap.network_id = parse_network_id(&raw).ok_or(ConfigError::InvalidEnv("NETCON_NETWORK_ID"))?;
        }
        if let Some(raw) = var("NETCON_BACKEND") {
            tap.backend = StackKind::parse(&raw).ok_or(ConfigError::InvalidEnv("NETCON_BACKEND"))?;
        }
        if let Some(raw) = var("NETCON_MTU") {
            tap.mtu = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|mtu| (576..=9000).contains(mtu))
                .ok_or(ConfigError::InvalidEnv("NETCON_MTU"))?;
        }

        let addresses = match var("NETCON_ADDRESSES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<IpCidr>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| ConfigError::InvalidEnv("NETCON_ADDRESSES"))?,
            None => Vec::new(),
        };

        let overlay_bind = var("NETCON_OVERLAY_BIND")
            .unwrap_or_else(|| "0.0.0.0:9993".into())
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv("NETCON_OVERLAY_BIND"))?;
        let overlay_peer = var("NETCON_OVERLAY_PEER")
            .map(|raw| raw.trim().parse())
            .transpose()
            .map_err(|_| ConfigError::InvalidEnv("NETCON_OVERLAY_PEER"))?;

        Ok(Self {
            socket_path,
            tap,
            addresses,
            overlay_bind,
            overlay_peer,
        })
    }
}

/// Accepts decimal or `0x`-prefixed hex, matching how network ids are usually written.
fn parse_network_id(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => u64::from_str_radix(raw, 16)
            .ok()
            .filter(|_| raw.len() == 16)
            .or_else(|| raw.parse().ok()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingEnv(&'static str),
    InvalidEnv(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnv(var) => write!(f, "missing required env var {var}"),
            Self::InvalidEnv(var) => write!(f, "invalid value for env var {var}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<TapdConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TapdConfig::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn socket_path_is_required() {
        assert_eq!(
            load(&[]).unwrap_err(),
            ConfigError::MissingEnv("NETCON_SOCKET_PATH")
        );
    }

    #[test]
    fn defaults_apply() {
        let cfg = load(&[("NETCON_SOCKET_PATH", "/tmp/netcon.sock")]).unwrap();
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/netcon.sock"));
        assert_eq!(cfg.tap.mtu, 2800);
        assert_eq!(cfg.tap.backend, StackKind::Smoltcp);
        assert!(cfg.addresses.is_empty());
        assert!(cfg.overlay_peer.is_none());
    }

    #[test]
    fn full_environment() {
        let cfg = load(&[
            ("NETCON_SOCKET_PATH", "/run/n.sock"),
            ("NETCON_MAC", "02:00:00:00:00:2a"),
            ("NETCON_NETWORK_ID", "0x8056c2e21c000001"),
            ("NETCON_ADDRESSES", "10.0.0.1/24, fd00::1/64"),
            ("NETCON_BACKEND", "segment"),
            ("NETCON_MTU", "1500"),
            ("NETCON_OVERLAY_BIND", "127.0.0.1:7000"),
            ("NETCON_OVERLAY_PEER", "127.0.0.1:7001"),
        ])
        .unwrap();
        assert_eq!(cfg.tap.mac, MacAddr([2, 0, 0, 0, 0, 0x2a]));
        assert_eq!(cfg.tap.network_id, 0x8056_c2e2_1c00_0001);
        assert_eq!(cfg.addresses.len(), 2);
        assert_eq!(cfg.tap.backend, StackKind::Segment);
        assert_eq!(cfg.tap.mtu, 1500);
        assert_eq!(cfg.overlay_peer, Some("127.0.0.1:7001".parse().unwrap()));
    }

    #[test]
    fn network_id_forms() {
        assert_eq!(parse_network_id("42"), Some(42));
        assert_eq!(parse_network_id("8056c2e21c000001"), Some(0x8056_c2e2_1c00_0001));
        assert_eq!(parse_network_id("nope"), None);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = load(&[("NETCON_SOCKET_PATH", "/s"), ("NETCON_ADDRESSES", "10.0.0.1/99")])
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidEnv("NETCON_ADDRESSES"));
        let err = load(&[("NETCON_SOCKET_PATH", "/s"), ("NETCON_BACKEND", "lwip")]).unwrap_err();
        assert_eq!(err.to_string(), "invalid value for env var NETCON_BACKEND");
    }
}
