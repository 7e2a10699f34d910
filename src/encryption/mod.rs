//! End-to-end encryption.
//!
//! The [`EncryptionLayer`] sits above the connection and transparently
//! seals chat bodies per recipient. Cryptographic state — the local
//! identity with its prekey pool, per-peer sessions, and the
//! trust-on-first-use peer key registry — lives in a [`KeyStore`] backed
//! by JSON files.

mod identity;
mod layer;
mod session;
mod store;

pub use identity::{Identity, PreKeyPool, PREKEY_POOL_MIN};
pub use layer::EncryptionLayer;
pub use session::Session;
pub use store::{KeyStore, StoreError};
