//! RSA block encryption for hop key transport.
//!
//! The first packet of every data channel carries the channel's symmetric
//! key for each hop. For hops without a pre-shared symmetric cipher the
//! leading block of that hop's layer is RSA-encrypted under the mix's
//! public key:
//!
//! - [`AsymScheme::Plain`] — textbook RSA over a full modulus-sized block.
//!   The caller guarantees the block is numerically smaller than the
//!   modulus (the protocol clears the top bit of the first key byte).
//! - [`AsymScheme::Oaep`] — RSA-OAEP with SHA-1, used by cascades that
//!   negotiate enhanced channel encryption. The block grows by
//!   `2 * 20 + 2` bytes.
//!
//! [`AsymDecryptor`] is the mix-side counterpart and is used by loopback
//! test cascades.

use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

use crate::{CryptoError, Result};

/// Modulus size used by cascade mixes (bits).
pub const RSA_MODULUS_BITS: usize = 1024;

/// SHA-1 digest length, used in the OAEP size computation.
const SHA1_LEN: usize = 20;

/// Asymmetric encryption scheme negotiated with the cascade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsymScheme {
    /// Textbook RSA, one modulus-sized block in and out.
    Plain,
    /// RSA-OAEP with SHA-1.
    Oaep,
}

/// A mix's public key together with the scheme used to encrypt for it.
#[derive(Clone, Debug)]
pub struct AsymCipher {
    key: RsaPublicKey,
    scheme: AsymScheme,
}

impl AsymCipher {
    /// Wrap an existing public key.
    pub fn new(key: RsaPublicKey, scheme: AsymScheme) -> Self {
        Self { key, scheme }
    }

    /// Build a public key from big-endian modulus and exponent bytes.
    pub fn from_components(modulus: &[u8], exponent: &[u8], scheme: AsymScheme) -> Result<Self> {
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(modulus),
            BigUint::from_bytes_be(exponent),
        )
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self::new(key, scheme))
    }

    /// The negotiated scheme.
    pub fn scheme(&self) -> AsymScheme {
        self.scheme
    }

    /// The wrapped public key.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.key
    }

    /// Bytes consumed from the plaintext per encrypted block.
    pub fn input_block_size(&self) -> usize {
        input_block_size(self.key.size(), self.scheme)
    }

    /// Bytes produced per encrypted block (the modulus size).
    pub fn output_block_size(&self) -> usize {
        self.key.size()
    }

    /// How many bytes one block grows by when encrypted.
    pub fn expansion(&self) -> usize {
        self.output_block_size() - self.input_block_size()
    }

    /// Encrypt one block. The output is always `output_block_size()` bytes.
    pub fn encrypt_block(&self, block: &[u8]) -> Result<Vec<u8>> {
        let max = self.input_block_size();
        if block.len() > max {
            return Err(CryptoError::BlockTooLarge {
                max,
                actual: block.len(),
            });
        }

        match self.scheme {
            AsymScheme::Plain => {
                let m = BigUint::from_bytes_be(block);
                if &m >= self.key.n() {
                    return Err(CryptoError::MessageOutOfRange);
                }
                let c = m.modpow(self.key.e(), self.key.n());
                Ok(left_pad(&c.to_bytes_be(), self.output_block_size()))
            }
            AsymScheme::Oaep => {
                let mut rng = rand::rngs::OsRng;
                Ok(self.key.encrypt(&mut rng, Oaep::new::<Sha1>(), block)?)
            }
        }
    }
}

/// Private-key counterpart of [`AsymCipher`].
pub struct AsymDecryptor {
    key: RsaPrivateKey,
    scheme: AsymScheme,
}

impl AsymDecryptor {
    /// Wrap a private key.
    pub fn new(key: RsaPrivateKey, scheme: AsymScheme) -> Self {
        Self { key, scheme }
    }

    /// Matching public cipher.
    pub fn public_cipher(&self) -> AsymCipher {
        AsymCipher::new(self.key.to_public_key(), self.scheme)
    }

    /// Decrypt one block produced by [`AsymCipher::encrypt_block`].
    ///
    /// Plain blocks come back left-padded to the full modulus size.
    pub fn decrypt_block(&self, block: &[u8]) -> Result<Vec<u8>> {
        match self.scheme {
            AsymScheme::Plain => {
                let c = BigUint::from_bytes_be(block);
                if &c >= self.key.n() {
                    return Err(CryptoError::MessageOutOfRange);
                }
                let m = c.modpow(self.key.d(), self.key.n());
                Ok(left_pad(&m.to_bytes_be(), self.key.size()))
            }
            AsymScheme::Oaep => Ok(self.key.decrypt(Oaep::new::<Sha1>(), block)?),
        }
    }

    /// Bytes consumed per encrypted block.
    pub fn output_block_size(&self) -> usize {
        self.key.size()
    }

    /// Plaintext bytes recovered per block.
    pub fn input_block_size(&self) -> usize {
        input_block_size(self.key.size(), self.scheme)
    }
}

fn input_block_size(modulus_len: usize, scheme: AsymScheme) -> usize {
    match scheme {
        AsymScheme::Plain => modulus_len,
        AsymScheme::Oaep => modulus_len - 2 * SHA1_LEN - 2,
    }
}

fn left_pad(bytes: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len.saturating_sub(bytes.len())];
    out.extend_from_slice(bytes);
    out
}
