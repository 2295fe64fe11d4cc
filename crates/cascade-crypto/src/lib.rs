//! # cascade-crypto
//!
//! Cryptographic primitives used by the mix-cascade client.
//!
//! The cascade protocol fixes its suite: AES-128 in OFB mode for every
//! symmetric layer (link, first-mix and per-channel hop layers) and 1024-bit
//! RSA for transporting per-channel hop keys inside the first packet of a
//! channel.
//!
//! ## Modules
//!
//! - [`sym`] — AES-128 OFB stream cipher with independent upstream and
//!   downstream registers
//! - [`asym`] — RSA block encryption (plain and OAEP/SHA-1) for hop key transport
//! - [`keys`] — Random key material and RSA key generation

pub mod asym;
pub mod keys;
pub mod sym;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Malformed public or private key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Input block does not fit the asymmetric cipher.
    #[error("block too large: max {max}, got {actual}")]
    BlockTooLarge { max: usize, actual: usize },

    /// Plain RSA input is not smaller than the modulus.
    #[error("message representative out of range")]
    MessageOutOfRange,

    /// RSA operation failed.
    #[error("RSA error: {0}")]
    Rsa(String),
}

impl From<rsa::Error> for CryptoError {
    fn from(err: rsa::Error) -> Self {
        CryptoError::Rsa(err.to_string())
    }
}

/// Convenience result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
