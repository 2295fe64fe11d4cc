//! # cascade-wire
//!
//! Wire formats and the physical connection for the mix-cascade client.
//!
//! - **Mix packets** — fixed 998-byte multiplexer frames via [`packet`]
//! - **Chain cells** — framing inside a data channel payload via [`cell`]
//! - **Handshake frames** — length-prefixed login messages via [`frame`]
//! - **Connections** — the abstract byte stream to the first mix via [`connection`]
//!
//! ## Architecture
//!
//! ```text
//! DataChain bytes
//!     |
//!     v
//! ChainCell / SequentialCell (cell.rs)  -- length + flags + data
//!     |
//!     v
//! hop layers (cascade-mux cipher chain)
//!     |
//!     v
//! MixPacket (packet.rs)                 -- 998 bytes, first 16 link-encrypted
//!     |
//!     v
//! StreamConnection (connection.rs)      -- TCP to the first mix
//! ```

pub mod cell;
pub mod connection;
pub mod frame;
pub mod packet;

/// Error types for wire operations.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// I/O error on the underlying stream (including truncated reads).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A chain cell declares more data than its buffer holds.
    #[error("invalid chain cell: {0}")]
    InvalidCell(String),

    /// A length-prefixed frame exceeds what the protocol allows.
    #[error("frame too large: {len} bytes, max {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] cascade_crypto::CryptoError),
}

/// Convenience result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
