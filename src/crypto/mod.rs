//! Cryptographic primitives.
//!
//! X25519 key pairs and signed prekeys, HKDF-SHA256 derivation, and the
//! AES-256-GCM cipher used for message bodies.

mod cipher;
mod hkdf;
mod keypair;

pub use cipher::{Cipher, CipherError, NONCE_LEN};
pub use hkdf::{derive_key32, Hkdf};
pub use keypair::{KeyPair, PreKey};
