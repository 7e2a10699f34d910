//! Durable key storage.
//!
//! State lives in JSON files under one directory: `identity.json`,
//! `pre_keys.json`, `sessions.json`, and the trust-on-first-use peer key
//! registry in `peer_keys.json`. Key material is base64 in the files.
//! Saves for one store are serialized behind a lock so two flushes cannot
//! interleave writes to the same file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{KeyPair, PreKey};
use crate::encryption::{Identity, Session};

/// Key store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store file {file}: {reason}")]
    Corrupt { file: String, reason: String },
    #[error("peer {0} already has a different identity key on record")]
    IdentityChanged(String),
}

const IDENTITY_FILE: &str = "identity.json";
const PRE_KEYS_FILE: &str = "pre_keys.json";
const SESSIONS_FILE: &str = "sessions.json";
const PEER_KEYS_FILE: &str = "peer_keys.json";

#[derive(Serialize, Deserialize)]
struct StoredKeyPair {
    public: String,
    private: String,
}

#[derive(Serialize, Deserialize)]
struct StoredSignedPreKey {
    key_id: u32,
    public: String,
    private: String,
    signature: String,
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    identity_key_pair: StoredKeyPair,
    registration_id: u32,
    signed_pre_key: StoredSignedPreKey,
}

#[derive(Serialize, Deserialize)]
struct StoredSession {
    key: String,
    created: DateTime<Utc>,
    last_used: DateTime<Utc>,
    message_keys: HashMap<String, String>,
}

/// File-backed store for identity, prekeys, sessions and peer keys.
pub struct KeyStore {
    dir: PathBuf,
    save_lock: Mutex<()>,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            save_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_identity(&self) -> Result<Option<Identity>, StoreError> {
        let Some(stored) = self.read_file::<StoredIdentity>(IDENTITY_FILE)? else {
            return Ok(None);
        };
        let key_pair = keypair_from(&stored.identity_key_pair, IDENTITY_FILE)?;
        let signed = &stored.signed_pre_key;
        let signed_pre_key = PreKey {
            key_pair: KeyPair {
                public: decode32(&signed.public, IDENTITY_FILE)?,
                private: decode32(&signed.private, IDENTITY_FILE)?,
            },
            key_id: signed.key_id,
            signature: Some(decode64(&signed.signature, IDENTITY_FILE)?),
        };
        Ok(Some(Identity {
            key_pair,
            registration_id: stored.registration_id,
            signed_pre_key,
        }))
    }

    pub fn save_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let signed = &identity.signed_pre_key;
        let stored = StoredIdentity {
            identity_key_pair: keypair_to(&identity.key_pair),
            registration_id: identity.registration_id,
            signed_pre_key: StoredSignedPreKey {
                key_id: signed.key_id,
                public: B64.encode(signed.key_pair.public),
                private: B64.encode(signed.key_pair.private),
                signature: B64.encode(signed.signature.unwrap_or([0u8; 64])),
            },
        };
        self.write_file(IDENTITY_FILE, &stored)
    }

    pub fn load_pre_keys(&self) -> Result<BTreeMap<u32, KeyPair>, StoreError> {
        let Some(stored) = self.read_file::<HashMap<String, StoredKeyPair>>(PRE_KEYS_FILE)?
        else {
            return Ok(BTreeMap::new());
        };
        let mut keys = BTreeMap::new();
        for (id, pair) in stored {
            let id: u32 = id.parse().map_err(|_| StoreError::Corrupt {
                file: PRE_KEYS_FILE.to_string(),
                reason: format!("bad prekey id {}", id),
            })?;
            keys.insert(id, keypair_from(&pair, PRE_KEYS_FILE)?);
        }
        Ok(keys)
    }

    pub fn save_pre_keys(&self, keys: &BTreeMap<u32, KeyPair>) -> Result<(), StoreError> {
        let stored: HashMap<String, StoredKeyPair> = keys
            .iter()
            .map(|(id, pair)| (id.to_string(), keypair_to(pair)))
            .collect();
        self.write_file(PRE_KEYS_FILE, &stored)
    }

    pub fn load_sessions(&self) -> Result<HashMap<String, Session>, StoreError> {
        let Some(stored) = self.read_file::<HashMap<String, StoredSession>>(SESSIONS_FILE)?
        else {
            return Ok(HashMap::new());
        };
        let mut sessions = HashMap::new();
        for (peer_id, record) in stored {
            let mut message_keys = HashMap::new();
            for (message_id, key) in record.message_keys {
                message_keys.insert(message_id, decode32(&key, SESSIONS_FILE)?);
            }
            sessions.insert(
                peer_id.clone(),
                Session::restore(
                    peer_id,
                    decode32(&record.key, SESSIONS_FILE)?,
                    record.created,
                    record.last_used,
                    message_keys,
                ),
            );
        }
        Ok(sessions)
    }

    pub fn save_sessions(&self, sessions: &HashMap<String, Session>) -> Result<(), StoreError> {
        let stored: HashMap<String, StoredSession> = sessions
            .iter()
            .map(|(peer_id, session)| {
                (
                    peer_id.clone(),
                    StoredSession {
                        key: B64.encode(session.key),
                        created: session.created,
                        last_used: session.last_used,
                        message_keys: session
                            .message_keys()
                            .iter()
                            .map(|(id, key)| (id.clone(), B64.encode(key)))
                            .collect(),
                    },
                )
            })
            .collect();
        self.write_file(SESSIONS_FILE, &stored)
    }

    pub fn load_peer_keys(&self) -> Result<HashMap<String, [u8; 32]>, StoreError> {
        let Some(stored) = self.read_file::<HashMap<String, String>>(PEER_KEYS_FILE)? else {
            return Ok(HashMap::new());
        };
        let mut keys = HashMap::new();
        for (peer_id, key) in stored {
            let key = decode32(&key, PEER_KEYS_FILE)?;
            keys.insert(peer_id, key);
        }
        Ok(keys)
    }

    pub fn save_peer_keys(&self, keys: &HashMap<String, [u8; 32]>) -> Result<(), StoreError> {
        let stored: HashMap<String, String> = keys
            .iter()
            .map(|(peer_id, key)| (peer_id.clone(), B64.encode(key)))
            .collect();
        self.write_file(PEER_KEYS_FILE, &stored)
    }

    fn read_file<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, StoreError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                file: name.to_string(),
                reason: e.to_string(),
            })
    }

    fn write_file<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let _guard = self.save_lock.lock().expect("store save lock poisoned");
        std::fs::create_dir_all(&self.dir)?;
        let raw = serde_json::to_string_pretty(value).map_err(|e| StoreError::Corrupt {
            file: name.to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(self.dir.join(name), raw)?;
        debug!("flushed {}", name);
        Ok(())
    }
}

fn keypair_to(pair: &KeyPair) -> StoredKeyPair {
    StoredKeyPair {
        public: B64.encode(pair.public),
        private: B64.encode(pair.private),
    }
}

fn keypair_from(stored: &StoredKeyPair, file: &str) -> Result<KeyPair, StoreError> {
    Ok(KeyPair {
        public: decode32(&stored.public, file)?,
        private: decode32(&stored.private, file)?,
    })
}

fn decode32(encoded: &str, file: &str) -> Result<[u8; 32], StoreError> {
    let bytes = B64.decode(encoded).map_err(|e| StoreError::Corrupt {
        file: file.to_string(),
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|_| StoreError::Corrupt {
        file: file.to_string(),
        reason: "key is not 32 bytes".to_string(),
    })
}

fn decode64(encoded: &str, file: &str) -> Result<[u8; 64], StoreError> {
    let bytes = B64.decode(encoded).map_err(|e| StoreError::Corrupt {
        file: file.to_string(),
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|_| StoreError::Corrupt {
        file: file.to_string(),
        reason: "signature is not 64 bytes".to_string(),
    })
}
