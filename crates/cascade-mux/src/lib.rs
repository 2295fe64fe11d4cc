//! # cascade-mux
//!
//! The client side of the mix-cascade multiplexing protocol.
//!
//! One physical connection to the first mix carries many logical channels.
//! Every channel sends fixed-size [`MixPacket`](cascade_wire::packet::MixPacket)s
//! whose payload is onion-encrypted for every mix of the cascade.
//!
//! ## Modules
//!
//! - [`cipher`] — Per-hop parameters and the layered channel encryption
//! - [`table`] — Channel registry with id allocation and a data channel cap
//! - [`scheduler`] — Two-tier (control before data) FIFO send slot
//! - [`mux`] — The multiplexer: send path and receive loop
//! - [`events`] — Packet event bus and packet counter
//! - [`channel`] — Control channels, dummy traffic and data channels
//! - [`chain`] — Byte streams (data chains) on top of data channels
//!
//! ## Threads
//!
//! ```text
//! caller threads ──write──> DataChain ──> DataChannel ──> Multiplexer::send_packet ──> socket
//! socket ──> receive loop ──> ChannelTable lookup ──> channel ──> chain processor ──> read queue
//! ```

pub mod chain;
pub mod channel;
pub mod cipher;
pub mod events;
pub mod mux;
pub mod scheduler;
pub mod table;

pub use chain::{ChainProtocol, DataChain, FixedRatio, FlowControl, ReadStatus};
pub use cipher::{CipherChain, MixParameters, ReplayTimestamp};
pub use events::{EventBus, MuxEvent, PacketCounter};
pub use mux::{Multiplexer, MuxSetup};
pub use scheduler::CancelToken;

/// Largest channel id reserved for control channels.
pub const MAX_CONTROL_CHANNEL_ID: u32 = 255;

/// Control channel carrying payment messages.
pub const CONTROL_CHANNEL_ID_PAY: u32 = 2;

/// Control channel carrying replay timestamp synchronization.
pub const CONTROL_CHANNEL_ID_REPLAY: u32 = 3;

/// Control channel carrying dummy traffic.
pub const CONTROL_CHANNEL_ID_DUMMY: u32 = 4;

/// Default cap on simultaneously open data channels.
pub const DEFAULT_MAX_DATA_CHANNELS: usize = 50;

/// Error types for multiplexer, channel and chain operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// I/O error on the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire format error (framing, truncated packets).
    #[error("wire error: {0}")]
    Wire(#[from] cascade_wire::WireError),

    /// Cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] cascade_crypto::CryptoError),

    /// The channel or chain is closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The multiplexer is closed; no packet can be sent.
    #[error("multiplexer closed")]
    MultiplexerClosed,

    /// A blocking operation was cancelled.
    #[error("operation interrupted")]
    Interrupted,

    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The last mix reported that its connection to the destination failed.
    #[error("connection error signaled by the last mix")]
    ConnectionError,

    /// A local protocol parameter is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Convenience result type for multiplexer operations.
pub type Result<T> = std::result::Result<T, MuxError>;

impl From<MuxError> for std::io::Error {
    fn from(e: MuxError) -> Self {
        use std::io::ErrorKind;
        match e {
            MuxError::Io(e) => e,
            MuxError::ChannelClosed | MuxError::MultiplexerClosed => {
                std::io::Error::new(ErrorKind::BrokenPipe, e.to_string())
            }
            MuxError::Interrupted => std::io::Error::new(ErrorKind::Interrupted, e.to_string()),
            MuxError::ConnectionError => std::io::Error::new(ErrorKind::ConnectionReset, e.to_string()),
            other => std::io::Error::other(other.to_string()),
        }
    }
}

/// Whether `id` lies in the control channel range (`1..=255`).
pub fn is_control_channel_id(id: u32) -> bool {
    id > 0 && id <= MAX_CONTROL_CHANNEL_ID
}
