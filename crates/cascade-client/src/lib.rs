//! # cascade-client
//!
//! Login to a mix cascade and the client facade on top of the multiplexer.
//!
//! ## Modules
//!
//! - [`cascade`] — Cascade descriptors and the collaborator traits (codec,
//!   trust, terms)
//! - [`handshake`] — The key exchange producing the cipher chain and link ciphers
//! - [`client`] — [`AnonClient`]: connect, open chains, reconnect, shut down
//! - [`config`] — TOML client configuration
//! - [`logging`] — `tracing` subscriber setup
//!
//! ## Login
//!
//! ```text
//! Connector ──> StreamConnection ──> KeyExchangeManager ──> HandshakeOutcome
//!                                                              │
//!                          AnonClient <── Multiplexer::start <─┘
//! ```

pub mod cascade;
pub mod client;
pub mod config;
pub mod handshake;
pub mod logging;

pub use cascade::{
    CascadeDescriptor, CascadeTarget, DescriptorCodec, MixDescriptor, PendingTerms, TermsConfirmation,
    TermsContainer, TrustModel,
};
pub use client::{AnonClient, ClientEvent, Connector, TcpConnector};
pub use config::ClientConfig;
pub use handshake::{ChannelProtocol, HandshakeOutcome, KeyExchangeManager};

use cascade::PendingTerms as Pending;

/// Error types for login and client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// I/O error on the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error during login.
    #[error("wire error: {0}")]
    Wire(#[from] cascade_wire::WireError),

    /// Cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] cascade_crypto::CryptoError),

    /// Multiplexer or channel failure.
    #[error("multiplexer error: {0}")]
    Mux(#[from] cascade_mux::MuxError),

    /// A login message is malformed or incomplete.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The cascade speaks a protocol version this client does not know.
    #[error("unknown protocol version: {0}")]
    UnknownProtocolVersion(String),

    /// The cascade is not trusted.
    #[error("cascade not trusted: {0}")]
    Trust(String),

    /// A signature in the login exchange is invalid.
    #[error("invalid signature: {0}")]
    Signature(String),

    /// The cascade's terms and conditions are not accepted yet. The login
    /// may be retried once after the user accepted them.
    #[error("terms and conditions of {} operator(s) need confirmation", pending.len())]
    TermsInterrupt { pending: Vec<Pending> },

    /// The user declined the cascade's terms and conditions.
    #[error("terms and conditions rejected")]
    TermsRejected,

    /// No cascade connection is established.
    #[error("not connected")]
    NotConnected,

    /// A cascade connection is already established.
    #[error("already connected")]
    AlreadyConnected,

    /// The login was interrupted by a shutdown.
    #[error("login interrupted")]
    Interrupted,

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
