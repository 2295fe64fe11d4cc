//! AES-128 in OFB mode.
//!
//! Every symmetric layer of the cascade protocol is an AES-128 OFB stream.
//! A [`SymCipher`] carries two feedback registers over the same key (or two
//! keys under enhanced channel encryption): the upstream register encrypts
//! what the client sends, the downstream register decrypts what the cascade
//! returns. Both start from the same IV.
//!
//! Each call starts on a fresh keystream block; the unused tail of a partial
//! block is discarded. Mix and client must therefore process the same byte
//! counts per call to stay synchronized.

use std::fmt;

use aes::Aes128;
use cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use zeroize::{Zeroize, Zeroizing};

use crate::{CryptoError, Result};

/// AES-128 key size in bytes.
pub const KEY_SIZE: usize = 16;

/// AES block size, also the OFB register size.
pub const BLOCK_SIZE: usize = 16;

/// Size of key material carrying an explicit IV (`key || iv`).
pub const KEY_WITH_IV_SIZE: usize = KEY_SIZE + BLOCK_SIZE;

/// A single OFB feedback register bound to an AES key schedule.
struct OfbRegister {
    engine: Aes128,
    feedback: [u8; BLOCK_SIZE],
}

impl OfbRegister {
    fn new(key: &[u8], iv: [u8; BLOCK_SIZE]) -> Result<Self> {
        let engine = Aes128::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: key.len(),
        })?;
        Ok(Self {
            engine,
            feedback: iv,
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        for chunk in data.chunks_mut(BLOCK_SIZE) {
            self.engine
                .encrypt_block(GenericArray::from_mut_slice(&mut self.feedback));
            for (byte, stream) in chunk.iter_mut().zip(self.feedback.iter()) {
                *byte ^= stream;
            }
        }
    }
}

impl Drop for OfbRegister {
    fn drop(&mut self) {
        self.feedback.zeroize();
    }
}

/// AES-128 OFB cipher with independent upstream and downstream registers.
pub struct SymCipher {
    key: Zeroizing<Vec<u8>>,
    upstream: OfbRegister,
    downstream: OfbRegister,
}

impl SymCipher {
    /// Create a cipher from raw key material.
    ///
    /// 16 bytes are a bare key with an all-zero IV; 32 bytes are
    /// `key || iv`. Any other length is rejected.
    pub fn new(key_material: &[u8]) -> Result<Self> {
        let (key, iv) = match key_material.len() {
            KEY_SIZE => (key_material, [0u8; BLOCK_SIZE]),
            KEY_WITH_IV_SIZE => {
                let mut iv = [0u8; BLOCK_SIZE];
                iv.copy_from_slice(&key_material[KEY_SIZE..]);
                (&key_material[..KEY_SIZE], iv)
            }
            actual => {
                return Err(CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual,
                })
            }
        };

        Ok(Self {
            key: Zeroizing::new(key.to_vec()),
            upstream: OfbRegister::new(key, iv)?,
            downstream: OfbRegister::new(key, iv)?,
        })
    }

    /// Create a cipher with separate upstream and downstream keys, both
    /// with an all-zero IV. [`SymCipher::key`] then returns `upstream || downstream`.
    pub fn with_directional_keys(upstream: &[u8], downstream: &[u8]) -> Result<Self> {
        let mut key = Zeroizing::new(Vec::with_capacity(2 * KEY_SIZE));
        key.extend_from_slice(upstream);
        key.extend_from_slice(downstream);
        Ok(Self {
            upstream: OfbRegister::new(upstream, [0u8; BLOCK_SIZE])?,
            downstream: OfbRegister::new(downstream, [0u8; BLOCK_SIZE])?,
            key,
        })
    }

    /// Key bytes this cipher was created with (without IV).
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// XOR `data` in place with the next upstream keystream bytes.
    pub fn apply_upstream(&mut self, data: &mut [u8]) {
        self.upstream.apply(data);
    }

    /// XOR `data` in place with the next downstream keystream bytes.
    pub fn apply_downstream(&mut self, data: &mut [u8]) {
        self.downstream.apply(data);
    }

    /// Reset the downstream register to `iv`.
    pub fn set_downstream_iv(&mut self, iv: &[u8; BLOCK_SIZE]) {
        self.downstream.feedback = *iv;
    }
}

impl fmt::Debug for SymCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymCipher")
            .field("key_len", &self.key.len())
            .finish_non_exhaustive()
    }
}
