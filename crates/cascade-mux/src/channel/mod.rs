//! Logical channels multiplexed over the cascade connection.
//!
//! Channels come in a closed set of variants:
//!
//! - [`ControlChannel`] — fixed id in `1..=255`, unencrypted, carries framed
//!   messages for a [`ControlMessageHandler`] (dummy traffic, replay
//!   timestamps, payment)
//! - [`DataChannel`] — random id, onion-encrypted, feeds a data chain;
//!   either unlimited or simulated-limited depending on the negotiated chain
//!   protocol
//!
//! Every variant implements [`Channel`], which is all the channel table and
//! the receive loop need.

pub mod control;
pub mod data;
pub mod dummy;

use cascade_wire::packet::MixPacket;

pub use control::{ControlChannel, ControlMessageHandler, DiscardHandler};
pub use data::{ChannelMessage, DataChannel, DataChannelMode};
pub use dummy::{DummyTraffic, DummyTrafficConfig};

/// Behaviour shared by every channel variant.
pub trait Channel: Send + Sync {
    /// Channel id on the wire.
    fn id(&self) -> u32;

    /// Handle a packet the receive loop dispatched to this channel.
    fn process_received_packet(&self, packet: MixPacket);

    /// The multiplexer closed; called at most once per surviving channel.
    fn multiplexer_closed(&self);

    /// Whether the channel can still send.
    fn is_open(&self) -> bool;
}
