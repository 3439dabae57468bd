#![deny(unsafe_code)]

//! Connection multiplexer between application channels and a userspace protocol stack.
//!
//! A [`Tap`] is one virtual Ethernet interface. Applications reach it over [`AppChannel`]s
//! (Unix sockets via [`ChannelService`], or [`MemoryChannel`] in tests) and speak the
//! `netcon-rpc` protocol; the tap turns those calls into [`ProtocolStack`] operations and moves
//! bytes both ways. Ethernet frames enter through [`Tap::put`] and leave through the
//! [`FrameHandler`] given at construction.
//!
//! [`ProtocolStack`]: netcon_stack::ProtocolStack

mod address;
mod buffer;
pub mod channel;
mod client;
mod config;
mod connection;
mod error;
mod fdpass;
mod frame_buffer;
mod jobs;
mod pump;
mod service;
mod tap;

pub use address::{AddressSet, GroupChanges, MulticastGroup};
pub use buffer::ByteRing;
pub use channel::memory::MemoryChannel;
pub use channel::{AppChannel, ChannelId};
pub use client::{ClientError, ClientSocket, RpcClient};
pub use config::{ConfigError, TapConfig, TapdConfig};
pub use connection::{ConnectionInfo, ConnectionStatus};
pub use error::TapError;
pub use frame_buffer::FrameBuffer;
pub use service::{ChannelService, UnixChannel};
pub use tap::{FrameHandler, OutboundFrame, Tap};
