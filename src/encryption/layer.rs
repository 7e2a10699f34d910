//! The encryption pipeline layer.
//!
//! Seals chat bodies on the way down and opens them on the way up, keyed
//! by the recipient or sender JID. A failure on either path is reported
//! through the layer's error event with the offending message attached;
//! the pipeline and the connection keep running.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::config::EncryptionConfig;
use crate::crypto::Cipher;
use crate::error::{EncryptionError, StackError};
use crate::layer::Layer;
use crate::types::{ChatMessage, Message, StackEvent};
use crate::EventHub;

use super::{Identity, KeyStore, PreKeyPool, Session, StoreError};

#[derive(Default)]
struct State {
    identity: Option<Identity>,
    pre_keys: PreKeyPool,
    sessions: HashMap<String, Session>,
    peer_keys: HashMap<String, [u8; 32]>,
}

/// Transparent per-peer encryption for chat messages.
pub struct EncryptionLayer {
    store: KeyStore,
    events: EventHub,
    verify_identities: bool,
    state: Mutex<State>,
}

impl EncryptionLayer {
    pub fn new(config: EncryptionConfig, events: EventHub) -> Self {
        Self {
            store: KeyStore::new(config.key_store_path),
            events,
            verify_identities: config.verify_identities,
            state: Mutex::new(State::default()),
        }
    }

    /// The local identity public key, for announcing to peers. `None`
    /// before the layer has started.
    pub async fn identity_key(&self) -> Option<[u8; 32]> {
        let state = self.state.lock().await;
        state.identity.as_ref().map(|identity| identity.key_pair.public)
    }

    /// Record a peer's public identity key, trust-on-first-use. A changed
    /// key for a known peer is refused when identity verification is on.
    pub async fn register_peer_key(
        &self,
        peer_id: &str,
        key: [u8; 32],
    ) -> Result<(), EncryptionError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.peer_keys.get(peer_id) {
            if *existing == key {
                return Ok(());
            }
            if self.verify_identities {
                return Err(StoreError::IdentityChanged(peer_id.to_string()).into());
            }
            warn!("identity key for {} replaced", peer_id);
        }
        state.peer_keys.insert(peer_id.to_string(), key);
        self.store.save_peer_keys(&state.peer_keys)?;
        Ok(())
    }

    /// Peers with an established session.
    pub async fn known_peers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.sessions.keys().cloned().collect()
    }

    /// Drop the session with one peer, e.g. after a key change.
    pub async fn delete_session(&self, peer_id: &str) -> Result<(), EncryptionError> {
        let mut state = self.state.lock().await;
        if state.sessions.remove(peer_id).is_some() {
            self.store.save_sessions(&state.sessions)?;
        }
        Ok(())
    }

    async fn encrypt_chat(&self, mut chat: ChatMessage) -> Result<ChatMessage, EncryptionError> {
        let peer_id = chat.recipient.clone();
        let mut state = self.state.lock().await;
        let message_key = self.message_key(&mut state, &peer_id, &chat.tag)?;
        // Session and message-key mutations hit disk whether or not the
        // seal below succeeds.
        self.store.save_sessions(&state.sessions)?;

        let sealed = Cipher::new(message_key).seal(chat.content.body.as_bytes(), chat.tag.as_bytes())?;
        chat.content.body = B64.encode(sealed);
        chat.content.encrypted = true;
        debug!("sealed message {} for {}", chat.tag, peer_id);
        Ok(chat)
    }

    async fn decrypt_chat(&self, mut chat: ChatMessage) -> Result<ChatMessage, EncryptionError> {
        let peer_id = chat
            .sender
            .clone()
            .ok_or_else(|| EncryptionError::NoBody(chat.tag.clone()))?;
        let mut state = self.state.lock().await;
        let message_key = self.message_key(&mut state, &peer_id, &chat.tag)?;
        self.store.save_sessions(&state.sessions)?;

        let sealed = B64
            .decode(&chat.content.body)
            .map_err(|e| EncryptionError::Undecryptable {
                peer: peer_id.clone(),
                reason: e.to_string(),
            })?;
        let opened = Cipher::new(message_key)
            .open(&sealed, chat.tag.as_bytes())
            .map_err(|e| EncryptionError::Undecryptable {
                peer: peer_id.clone(),
                reason: e.to_string(),
            })?;
        chat.content.body =
            String::from_utf8(opened).map_err(|_| EncryptionError::Undecryptable {
                peer: peer_id.clone(),
                reason: "plaintext is not utf-8".to_string(),
            })?;
        chat.content.encrypted = false;
        debug!("opened message {} from {}", chat.tag, peer_id);
        Ok(chat)
    }

    /// Resolve (establishing lazily) the session with `peer_id` and derive
    /// the message key for `message_id`.
    fn message_key(
        &self,
        state: &mut State,
        peer_id: &str,
        message_id: &str,
    ) -> Result<[u8; 32], EncryptionError> {
        if !state.sessions.contains_key(peer_id) {
            let identity = state
                .identity
                .as_ref()
                .ok_or_else(|| EncryptionError::UnknownPeer(peer_id.to_string()))?;
            let peer_key = state
                .peer_keys
                .get(peer_id)
                .ok_or_else(|| EncryptionError::UnknownPeer(peer_id.to_string()))?;
            let session = Session::establish(&identity.key_pair, peer_id, peer_key);
            info!("session established with {}", peer_id);
            state.sessions.insert(peer_id.to_string(), session);
        }
        let session = state
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| EncryptionError::UnknownPeer(peer_id.to_string()))?;
        Ok(session.message_key(message_id))
    }

    fn report(&self, err: EncryptionError, message: Message) {
        warn!("encryption layer dropped a message: {}", err);
        self.events.emit(StackEvent::Error {
            layer: "encryption".to_string(),
            reason: err.to_string(),
            message: Some(message),
        });
    }
}

#[async_trait]
impl Layer for EncryptionLayer {
    fn name(&self) -> &str {
        "encryption"
    }

    /// Load persisted state, generating identity and prekeys on first
    /// start.
    async fn on_start(&self) -> Result<(), StackError> {
        let mut state = self.state.lock().await;

        state.identity = match self.store.load_identity().map_err(EncryptionError::from)? {
            Some(identity) => {
                debug!("identity loaded from {}", self.store.dir().display());
                Some(identity)
            }
            None => {
                let identity = Identity::generate();
                info!("no identity on disk; generated a new one");
                self.store
                    .save_identity(&identity)
                    .map_err(EncryptionError::from)?;
                Some(identity)
            }
        };

        state.pre_keys =
            PreKeyPool::from_keys(self.store.load_pre_keys().map_err(EncryptionError::from)?);
        if state.pre_keys.replenish() {
            self.store
                .save_pre_keys(state.pre_keys.keys())
                .map_err(EncryptionError::from)?;
        }

        state.sessions = self.store.load_sessions().map_err(EncryptionError::from)?;
        state.peer_keys = self.store.load_peer_keys().map_err(EncryptionError::from)?;
        info!(
            "encryption layer ready: {} session(s), {} prekey(s)",
            state.sessions.len(),
            state.pre_keys.len()
        );
        Ok(())
    }

    /// Flush every store.
    async fn on_stop(&self) {
        let state = self.state.lock().await;
        if let Some(identity) = &state.identity {
            if let Err(err) = self.store.save_identity(identity) {
                warn!("identity flush failed: {}", err);
            }
        }
        if let Err(err) = self.store.save_pre_keys(state.pre_keys.keys()) {
            warn!("prekey flush failed: {}", err);
        }
        if let Err(err) = self.store.save_sessions(&state.sessions) {
            warn!("session flush failed: {}", err);
        }
        if let Err(err) = self.store.save_peer_keys(&state.peer_keys) {
            warn!("peer key flush failed: {}", err);
        }
    }

    async fn receive_from_upper(&self, message: Message) -> Result<Option<Message>, StackError> {
        match message {
            Message::Chat(chat) if !chat.content.encrypted => {
                match self.encrypt_chat(chat.clone()).await {
                    Ok(sealed) => Ok(Some(Message::Chat(sealed))),
                    Err(err) => {
                        self.report(err, Message::Chat(chat));
                        Ok(None)
                    }
                }
            }
            other => Ok(Some(other)),
        }
    }

    async fn receive_from_lower(&self, message: Message) -> Result<Option<Message>, StackError> {
        match message {
            Message::Chat(chat) if chat.content.encrypted => {
                match self.decrypt_chat(chat.clone()).await {
                    Ok(opened) => Ok(Some(Message::Chat(opened))),
                    Err(err) => {
                        self.report(err, Message::Chat(chat));
                        Ok(None)
                    }
                }
            }
            other => Ok(Some(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;
    use std::sync::{Arc, Mutex as StdMutex};

    fn temp_config() -> EncryptionConfig {
        EncryptionConfig {
            enabled: true,
            key_store_path: std::env::temp_dir()
                .join(format!("bocksup-enc-{}", uuid::Uuid::new_v4())),
            verify_identities: true,
        }
    }

    async fn started_layer() -> EncryptionLayer {
        let layer = EncryptionLayer::new(temp_config(), EventHub::new());
        layer.on_start().await.unwrap();
        layer
    }

    fn chat(tag: &str, to: &str, body: &str) -> ChatMessage {
        match Message::text(tag, to, body) {
            Message::Chat(chat) => chat,
            _ => unreachable!(),
        }
    }

    /// Two layers with each other's identity keys registered, as after a
    /// key announcement exchange.
    async fn paired_layers() -> (EncryptionLayer, EncryptionLayer) {
        let alice = started_layer().await;
        let bob = started_layer().await;
        let alice_key = alice.identity_key().await.unwrap();
        let bob_key = bob.identity_key().await.unwrap();
        alice
            .register_peer_key("bob@s.whatsapp.net", bob_key)
            .await
            .unwrap();
        bob.register_peer_key("alice@s.whatsapp.net", alice_key)
            .await
            .unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn test_encrypt_then_decrypt_between_peers() {
        let (alice, bob) = paired_layers().await;

        let outgoing = alice
            .receive_from_upper(Message::Chat(chat("MID_1", "bob@s.whatsapp.net", "secret")))
            .await
            .unwrap()
            .unwrap();

        let mut wire_chat = match outgoing {
            Message::Chat(chat) => chat,
            other => panic!("unexpected: {:?}", other),
        };
        assert!(wire_chat.content.encrypted);
        assert_ne!(wire_chat.content.body, "secret");

        // On Bob's side the same message arrives from Alice.
        wire_chat.sender = Some("alice@s.whatsapp.net".to_string());
        let delivered = bob
            .receive_from_lower(Message::Chat(wire_chat))
            .await
            .unwrap()
            .unwrap();
        match delivered {
            Message::Chat(chat) => {
                assert!(!chat.content.encrypted);
                assert_eq!(chat.content.body, "secret");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_plaintext_two_ids_distinct_ciphertexts() {
        let (alice, _bob) = paired_layers().await;

        let mut bodies = Vec::new();
        for tag in ["MID_1", "MID_2"] {
            let sealed = alice
                .receive_from_upper(Message::Chat(chat(tag, "bob@s.whatsapp.net", "same text")))
                .await
                .unwrap()
                .unwrap();
            match sealed {
                Message::Chat(chat) => bodies.push(chat.content.body),
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_ne!(bodies[0], bodies[1]);
    }

    #[tokio::test]
    async fn test_unknown_peer_reports_error_event_and_drops() {
        let events = EventHub::new();
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let errors_in_handler = errors.clone();
        events.register(EventKind::Error, move |event| {
            if let StackEvent::Error { reason, message, .. } = event {
                errors_in_handler
                    .lock()
                    .unwrap()
                    .push((reason.clone(), message.is_some()));
            }
        });

        let layer = EncryptionLayer::new(temp_config(), events.clone());
        layer.on_start().await.unwrap();

        let result = layer
            .receive_from_upper(Message::Chat(chat("MID_1", "stranger@s.whatsapp.net", "x")))
            .await
            .unwrap();
        assert!(result.is_none(), "message must be consumed, not forwarded");

        events.shutdown().await;
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].0.contains("stranger@s.whatsapp.net"));
        assert!(errors[0].1, "offending message attached to the event");
    }

    #[tokio::test]
    async fn test_failed_decrypt_still_flushes_the_session() {
        let config = temp_config();
        let layer = EncryptionLayer::new(config.clone(), EventHub::new());
        layer.on_start().await.unwrap();
        layer
            .register_peer_key("bob@s.whatsapp.net", [3u8; 32])
            .await
            .unwrap();

        // The body is not even base64, so decryption fails after the
        // session was lazily established.
        let mut garbled = chat("MID_1", "me@s.whatsapp.net", "!!not base64!!");
        garbled.sender = Some("bob@s.whatsapp.net".to_string());
        garbled.content.encrypted = true;
        let result = layer
            .receive_from_lower(Message::Chat(garbled))
            .await
            .unwrap();
        assert!(result.is_none(), "undecryptable message is consumed");

        // The new session reached disk despite the failure.
        let sessions = KeyStore::new(config.key_store_path)
            .load_sessions()
            .unwrap();
        assert!(sessions.contains_key("bob@s.whatsapp.net"));
        assert!(sessions["bob@s.whatsapp.net"].message_keys().contains_key("MID_1"));
    }

    #[tokio::test]
    async fn test_non_chat_messages_pass_through() {
        let layer = started_layer().await;
        let ping = Message::keep_alive("t");
        let down = layer.receive_from_upper(ping.clone()).await.unwrap();
        assert_eq!(down, Some(ping.clone()));
        let up = layer.receive_from_lower(ping.clone()).await.unwrap();
        assert_eq!(up, Some(ping));
    }

    #[tokio::test]
    async fn test_identity_persists_across_restarts() {
        let config = temp_config();
        let first = EncryptionLayer::new(config.clone(), EventHub::new());
        first.on_start().await.unwrap();
        let key = first.identity_key().await.unwrap();
        first.on_stop().await;

        let second = EncryptionLayer::new(config, EventHub::new());
        second.on_start().await.unwrap();
        assert_eq!(second.identity_key().await.unwrap(), key);
    }

    #[tokio::test]
    async fn test_changed_peer_key_is_refused() {
        let layer = started_layer().await;
        layer
            .register_peer_key("bob@s.whatsapp.net", [1u8; 32])
            .await
            .unwrap();
        let result = layer
            .register_peer_key("bob@s.whatsapp.net", [2u8; 32])
            .await;
        assert!(matches!(
            result,
            Err(EncryptionError::Store(StoreError::IdentityChanged(_)))
        ));
    }
}
