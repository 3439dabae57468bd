//! Application-facing channels.
//!
//! The tap never owns an event loop for these: whoever does (the Unix service, or a test) feeds
//! inbound bytes to [`Tap::on_channel_data`] and honors the notification flags set here.
//!
//! [`Tap::on_channel_data`]: crate::Tap::on_channel_data

pub mod memory;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identity.
pub fn next_channel_id() -> ChannelId {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

pub trait AppChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Writes without blocking. `Ok(0)` means the channel cannot take more right now.
    fn write(&self, data: &[u8]) -> io::Result<usize>;

    /// Nonblocking liveness check: `Ok(false)` once the application end has gone away.
    fn probe(&self) -> io::Result<bool>;

    /// Whether the owning event loop should deliver inbound bytes for this channel.
    fn set_notify_readable(&self, on: bool);

    /// Whether the owning event loop should report when the channel can take more bytes.
    fn set_notify_writable(&self, on: bool);

    fn close(&self);

    /// Creates a connected channel pair for an accepted connection, hands one end to the
    /// application over this channel and returns the other.
    fn spawn_accepted(&self) -> io::Result<Arc<dyn AppChannel>>;
}
