//! Local identity and prekey pool.

use std::collections::BTreeMap;

use rand::Rng;

use crate::crypto::{KeyPair, PreKey};

/// The pool is topped back up whenever the number of unused prekeys drops
/// below this.
pub const PREKEY_POOL_MIN: usize = 20;

/// The client's long-lived identity: one key pair, a registration id, and
/// one signed prekey. Generated once and persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub key_pair: KeyPair,
    pub registration_id: u32,
    pub signed_pre_key: PreKey,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let key_pair = KeyPair::generate();
        let signed_pre_key = PreKey::new_signed(1, &key_pair);
        Self {
            key_pair,
            // Registration ids live in the 14-bit range used by the
            // protocol, never zero.
            registration_id: rand::thread_rng().gen_range(1..16381),
            signed_pre_key,
        }
    }
}

/// Pool of unsigned prekeys available for asynchronous session
/// establishment, keyed by prekey id.
#[derive(Clone, Debug)]
pub struct PreKeyPool {
    keys: BTreeMap<u32, KeyPair>,
    next_id: u32,
}

impl Default for PreKeyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PreKeyPool {
    pub fn new() -> Self {
        Self {
            keys: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Rebuild from persisted keys.
    pub fn from_keys(keys: BTreeMap<u32, KeyPair>) -> Self {
        let next_id = keys.keys().max().map(|id| id + 1).unwrap_or(1);
        Self { keys, next_id }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &BTreeMap<u32, KeyPair> {
        &self.keys
    }

    /// Consume one prekey, e.g. when handing it to a new peer.
    pub fn take(&mut self, id: u32) -> Option<KeyPair> {
        self.keys.remove(&id)
    }

    /// Top the pool back up to [`PREKEY_POOL_MIN`] once it has dropped
    /// below the threshold. Returns whether anything was generated, so the
    /// caller knows to persist.
    pub fn replenish(&mut self) -> bool {
        if self.keys.len() >= PREKEY_POOL_MIN {
            return false;
        }
        while self.keys.len() < PREKEY_POOL_MIN {
            let id = self.next_id;
            self.next_id += 1;
            self.keys.insert(id, KeyPair::generate());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identity_is_complete() {
        let identity = Identity::generate();
        assert!(identity.registration_id > 0);
        assert!(identity.registration_id < 16381);
        assert!(identity.signed_pre_key.signature.is_some());
        assert_eq!(identity.signed_pre_key.key_id, 1);
    }

    #[test]
    fn test_replenish_fills_to_threshold() {
        let mut pool = PreKeyPool::new();
        assert!(pool.replenish());
        assert_eq!(pool.len(), PREKEY_POOL_MIN);
        // Already full; nothing to do.
        assert!(!pool.replenish());
    }

    #[test]
    fn test_replenish_triggers_below_threshold_only() {
        let mut pool = PreKeyPool::new();
        pool.replenish();

        let first_id = *pool.keys().keys().next().unwrap();
        pool.take(first_id);
        assert_eq!(pool.len(), PREKEY_POOL_MIN - 1);

        assert!(pool.replenish());
        assert_eq!(pool.len(), PREKEY_POOL_MIN);
    }

    #[test]
    fn test_replenished_ids_never_repeat() {
        let mut pool = PreKeyPool::new();
        pool.replenish();
        let taken: Vec<u32> = pool.keys().keys().copied().take(5).collect();
        for id in &taken {
            pool.take(*id);
        }
        pool.replenish();
        for id in taken {
            assert!(!pool.keys().contains_key(&id), "id {} was reissued", id);
        }
    }
}
