//! Per-peer cryptographic sessions.
//!
//! A session key comes from a static-static X25519 agreement between the
//! two identity keys, expanded through HKDF with a salt built from both
//! public keys in sorted order, so either side derives the same key.
//! Per-message keys are derived from the session key and the message id —
//! deterministic, so the receiver rederives exactly the key the sender
//! used — and cached write-once per message id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::crypto::{derive_key32, KeyPair};

const SESSION_INFO: &[u8] = b"bocksup-session-v1";

/// Cryptographic context shared with one peer.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub peer_id: String,
    pub key: [u8; 32],
    pub created: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    message_keys: HashMap<String, [u8; 32]>,
}

impl Session {
    /// Establish a session from our identity and the peer's public
    /// identity key. Symmetric: the peer running the same computation with
    /// the roles swapped arrives at the same session key.
    pub fn establish(local: &KeyPair, peer_id: &str, peer_public: &[u8; 32]) -> Self {
        let shared = local.dh(peer_public);

        let (low, high) = if local.public <= *peer_public {
            (&local.public, peer_public)
        } else {
            (peer_public, &local.public)
        };
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(low);
        salt[32..].copy_from_slice(high);

        let now = Utc::now();
        Self {
            peer_id: peer_id.to_string(),
            key: derive_key32(Some(&salt), &shared, SESSION_INFO),
            created: now,
            last_used: now,
            message_keys: HashMap::new(),
        }
    }

    /// Rebuild a persisted session.
    pub fn restore(
        peer_id: String,
        key: [u8; 32],
        created: DateTime<Utc>,
        last_used: DateTime<Utc>,
        message_keys: HashMap<String, [u8; 32]>,
    ) -> Self {
        Self {
            peer_id,
            key,
            created,
            last_used,
            message_keys,
        }
    }

    /// One-time key for `message_id`. The first derivation is cached and
    /// never overwritten, so every message decrypts independently with the
    /// key it was sealed under.
    pub fn message_key(&mut self, message_id: &str) -> [u8; 32] {
        if let Some(cached) = self.message_keys.get(message_id) {
            return *cached;
        }
        let key = derive_key32(None, &self.key, message_id.as_bytes());
        self.message_keys.insert(message_id.to_string(), key);
        self.last_used = Utc::now();
        key
    }

    /// Snapshot of the cached message keys, for persistence.
    pub fn message_keys(&self) -> &HashMap<String, [u8; 32]> {
        &self.message_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_keys_agree_between_peers() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let on_alice = Session::establish(&alice, "bob@s.whatsapp.net", &bob.public);
        let on_bob = Session::establish(&bob, "alice@s.whatsapp.net", &alice.public);

        assert_eq!(on_alice.key, on_bob.key);
    }

    #[test]
    fn test_message_keys_differ_per_message_id() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut session = Session::establish(&alice, "bob@s.whatsapp.net", &bob.public);

        let first = session.message_key("MID_1");
        let second = session.message_key("MID_2");
        assert_ne!(first, second);
    }

    #[test]
    fn test_message_key_cache_is_write_once() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut session = Session::establish(&alice, "bob@s.whatsapp.net", &bob.public);

        let first = session.message_key("MID_1");
        assert_eq!(session.message_key("MID_1"), first);
        assert_eq!(session.message_keys().len(), 1);
    }

    #[test]
    fn test_receiver_derives_the_senders_message_key() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let mut on_alice = Session::establish(&alice, "bob@s.whatsapp.net", &bob.public);
        let mut on_bob = Session::establish(&bob, "alice@s.whatsapp.net", &alice.public);

        assert_eq!(on_alice.message_key("MID_42"), on_bob.message_key("MID_42"));
    }

    #[test]
    fn test_message_key_touches_last_used() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut session = Session::establish(&alice, "bob@s.whatsapp.net", &bob.public);
        let created = session.created;

        session.message_key("MID_1");
        assert!(session.last_used >= created);
    }
}
