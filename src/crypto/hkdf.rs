//! HKDF (HMAC-based Key Derivation Function).
//!
//! Used to turn Diffie-Hellman shared secrets into session keys and to derive
//! one-time message keys from session key material.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HKDF-SHA256 key derivation.
pub struct Hkdf {
    prk: [u8; 32],
}

impl Hkdf {
    /// Create a new HKDF instance with the given input key material and salt.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        // HKDF-Extract
        let salt = salt.unwrap_or(&[0u8; 32]);
        let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC can take key of any size");
        mac.update(ikm);
        let prk: [u8; 32] = mac.finalize().into_bytes().into();

        Self { prk }
    }

    /// Expand the key to the desired length with optional info.
    pub fn expand(&self, info: &[u8], length: usize) -> Vec<u8> {
        let mut output = Vec::with_capacity(length);
        let mut t = Vec::new();
        let mut counter = 1u8;

        while output.len() < length {
            let mut mac =
                HmacSha256::new_from_slice(&self.prk).expect("HMAC can take key of any size");
            mac.update(&t);
            mac.update(info);
            mac.update(&[counter]);
            t = mac.finalize().into_bytes().to_vec();

            let remaining = length - output.len();
            let to_copy = remaining.min(t.len());
            output.extend_from_slice(&t[..to_copy]);

            counter += 1;
        }

        output.truncate(length);
        output
    }

    /// Convenience function to extract and expand in one call.
    pub fn derive(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], length: usize) -> Vec<u8> {
        let hkdf = Self::new(salt, ikm);
        hkdf.expand(info, length)
    }
}

/// Derive a single 32-byte key.
pub fn derive_key32(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let derived = Hkdf::derive(salt, ikm, info, 32);
    let mut key = [0u8; 32];
    key.copy_from_slice(&derived);
    key
}
