use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use netcon_stack::{ControlBlock, SocketKind};

use crate::buffer::ByteRing;
use crate::channel::{AppChannel, ChannelId};

/// Buffer limits for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCaps {
    pub rx: usize,
    /// Soft limit: the channel stops being read once `tx` holds more than this.
    pub tx: usize,
    /// Largest single read the channel owner hands over.
    pub read_chunk: usize,
}

/// Mutable per-connection state, guarded by the connection's own lock.
pub(crate) struct ConnectionState {
    pub control_block: Option<ControlBlock>,
    pub rx: ByteRing,
    pub tx: ByteRing,
    pub tx_cap: usize,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub listening: bool,
    /// Channel reads are suppressed because `tx` is over its cap or the stack is on probation.
    pub disabled: bool,
    /// The stack refused bytes; wait for it to report writability.
    pub probation: bool,
    pub peer_closed: bool,
    /// Token of the connect job awaiting the handshake.
    pub connect_token: Option<u64>,
    pub pid: u32,
}

impl ConnectionState {
    pub fn readable(&self) -> bool {
        self.tx.len() <= self.tx_cap && !self.probation
    }
}

pub struct Connection {
    pub(crate) id: ChannelId,
    pub(crate) kind: SocketKind,
    pub(crate) channel: Arc<dyn AppChannel>,
    state: Mutex<ConnectionState>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(kind: SocketKind, channel: Arc<dyn AppChannel>, caps: BufferCaps) -> Self {
        Self {
            id: channel.id(),
            kind,
            channel,
            state: Mutex::new(ConnectionState {
                control_block: None,
                rx: ByteRing::new(caps.rx),
                tx: ByteRing::new(caps.tx + caps.read_chunk),
                tx_cap: caps.tx,
                local_addr: None,
                peer_addr: None,
                listening: false,
                disabled: false,
                probation: false,
                peer_closed: false,
                connect_token: None,
                pid: 0,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies the readability rule to the channel's read notification.
    pub(crate) fn refresh_readable(&self, state: &mut ConnectionState) {
        let readable = state.readable();
        if readable == state.disabled {
            state.disabled = !readable;
            self.channel.set_notify_readable(readable);
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        let state = self.lock();
        let status = if state.listening {
            ConnectionStatus::Listening
        } else if state.connect_token.is_some() {
            ConnectionStatus::Connecting
        } else if state.peer_addr.is_some() {
            ConnectionStatus::Connected
        } else if state.local_addr.is_some() {
            ConnectionStatus::Bound
        } else {
            ConnectionStatus::Unbound
        };
        ConnectionInfo {
            channel: self.id,
            kind: self.kind,
            status,
            control_block: state.control_block,
            rx_len: state.rx.len(),
            tx_len: state.tx.len(),
            local_addr: state.local_addr,
            peer_addr: state.peer_addr,
            disabled: state.disabled,
            probation: state.probation,
            peer_closed: state.peer_closed,
            pid: state.pid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Unbound,
    Bound,
    Listening,
    Connecting,
    Connected,
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub channel: ChannelId,
    pub kind: SocketKind,
    pub status: ConnectionStatus,
    pub control_block: Option<ControlBlock>,
    pub rx_len: usize,
    pub tx_len: usize,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub disabled: bool,
    pub probation: bool,
    pub peer_closed: bool,
    pub pid: u32,
}

/// Live connections, indexed by channel and by control block.
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    by_channel: HashMap<ChannelId, Arc<Connection>>,
    by_cb: HashMap<ControlBlock, ChannelId>,
}

impl ConnectionTable {
    pub fn insert(&mut self, conn: Arc<Connection>) {
        if let Some(cb) = conn.lock().control_block {
            self.by_cb.insert(cb, conn.id);
        }
        self.by_channel.insert(conn.id, conn);
    }

    pub fn bind_control_block(&mut self, id: ChannelId, cb: ControlBlock) {
        if self.by_channel.contains_key(&id) {
            self.by_cb.insert(cb, id);
        }
    }

    pub fn find_by_channel(&self, id: ChannelId) -> Option<Arc<Connection>> {
        self.by_channel.get(&id).cloned()
    }

    pub fn find_by_control_block(&self, cb: ControlBlock) -> Option<Arc<Connection>> {
        self.by_cb
            .get(&cb)
            .and_then(|id| self.by_channel.get(id))
            .cloned()
    }

    /// Detaches a connection. Returns `None` if it was already gone.
    pub fn remove(&mut self, id: ChannelId) -> Option<Arc<Connection>> {
        let conn = self.by_channel.remove(&id)?;
        self.by_cb.retain(|_, v| *v != id);
        Some(conn)
    }

    pub fn len(&self) -> usize {
        self.by_channel.len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut all: Vec<_> = self.by_channel.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryChannel;

    const CAPS: BufferCaps = BufferCaps {
        rx: 16,
        tx: 8,
        read_chunk: 4,
    };

    fn conn() -> Arc<Connection> {
        Arc::new(Connection::new(SocketKind::Stream, MemoryChannel::new(), CAPS))
    }

    #[test]
    fn both_indices_follow_insert_and_remove() {
        let mut table = ConnectionTable::default();
        let c = conn();
        let cb = ControlBlock::from_raw(7);
        c.lock().control_block = Some(cb);
        table.insert(c.clone());
        assert_eq!(table.find_by_control_block(cb).map(|x| x.id), Some(c.id));
        assert!(table.remove(c.id).is_some());
        assert!(table.remove(c.id).is_none());
        assert!(table.find_by_control_block(cb).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn late_control_block_binding() {
        let mut table = ConnectionTable::default();
        let c = conn();
        table.insert(c.clone());
        let cb = ControlBlock::from_raw(3);
        table.bind_control_block(c.id, cb);
        assert!(table.find_by_control_block(cb).is_some());
    }

    #[test]
    fn tx_hard_cap_leaves_room_for_one_read_over_the_soft_cap() {
        let c = conn();
        let mut state = c.lock();
        assert_eq!(state.tx.append(&[0u8; 20]), 12);
        assert!(!state.readable());
        state.tx.consume(4);
        assert!(state.readable());
        state.probation = true;
        assert!(!state.readable());
    }

    #[test]
    fn status_derivation() {
        let c = conn();
        assert_eq!(c.info().status, ConnectionStatus::Unbound);
        c.lock().local_addr = Some("10.0.0.1:80".parse().unwrap());
        assert_eq!(c.info().status, ConnectionStatus::Bound);
        c.lock().listening = true;
        assert_eq!(c.info().status, ConnectionStatus::Listening);
    }
}
