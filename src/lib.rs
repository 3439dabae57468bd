//! Userspace socket redirection over a virtual Ethernet interface.
//!
//! Applications speak the control-block protocol in [`rpc`] over a local channel; a [`tap`]
//! multiplexes those connections onto a [`stack`] backend that exchanges raw Ethernet frames
//! with an overlay network.

pub use netcon_rpc as rpc;
pub use netcon_stack as stack;
pub use netcon_tap as tap;

pub use netcon_stack::{ProtocolStack, StackError, StackEventSink, StackKind};
pub use netcon_tap::{ChannelService, RpcClient, Tap, TapConfig};
