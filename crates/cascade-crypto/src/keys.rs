//! Random key material.
//!
//! All keys come from the operating system RNG.

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::RsaPrivateKey;
use zeroize::Zeroizing;

use crate::sym::KEY_SIZE;
use crate::Result;

/// Fill `buf` with random bytes.
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Generate a fresh random AES-128 key.
pub fn random_sym_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    fill_random(key.as_mut());
    key
}

/// Generate `len` bytes of random key material.
pub fn random_key_material(len: usize) -> Zeroizing<Vec<u8>> {
    let mut material = Zeroizing::new(vec![0u8; len]);
    fill_random(&mut material);
    material
}

/// Generate an RSA private key. Used by mix-side tooling and tests.
pub fn generate_rsa_key(bits: usize) -> Result<RsaPrivateKey> {
    Ok(RsaPrivateKey::new(&mut OsRng, bits)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_keys_differ() {
        let a = random_sym_key();
        let b = random_sym_key();
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_random_key_material_length() {
        assert_eq!(random_key_material(64).len(), 64);
        assert!(random_key_material(0).is_empty());
    }
}
