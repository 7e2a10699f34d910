//! Composition root.
//!
//! The [`StackBuilder`] wires the connection, the optional encryption
//! layer, and the authenticator into one [`Stack`] driven by the
//! application: connect, authenticate, send, disconnect. Inbound messages
//! are pumped off the connection and up the pipeline by a dispatch task;
//! whatever clears the top arrives as a [`StackEvent::Message`]. A
//! successful reconnection re-runs authentication automatically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, Credentials};
use crate::config::StackConfig;
use crate::connection::Connection;
use crate::encryption::EncryptionLayer;
use crate::error::{AuthenticationError, EncryptionError, MessageError, StackError};
use crate::layer::{EventHub, Pipeline};
use crate::request::PendingRequests;
use crate::transport::{Dialer, NetDialer};
use crate::types::{EventKind, Message, StackEvent};
use crate::wire::Serializer;

/// Builds a [`Stack`] from configuration and credentials.
///
/// Must be used inside a tokio runtime; building spawns the event
/// dispatch and inbound pump tasks.
pub struct StackBuilder {
    config: StackConfig,
    dialer: Option<Arc<dyn Dialer>>,
}

impl StackBuilder {
    pub fn new(config: StackConfig) -> Self {
        Self {
            config,
            dialer: None,
        }
    }

    /// Substitute the dialer, e.g. an in-memory loopback in tests.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn build(self, credentials: Credentials) -> Stack {
        let events = EventHub::new();
        let pending = Arc::new(PendingRequests::new());
        let dialer = self.dialer.unwrap_or_else(|| Arc::new(NetDialer::new()));
        let response_timeout = self.config.connection.timeout();

        let connection = Connection::new(
            self.config.connection.clone(),
            dialer,
            Serializer::new(),
            events.clone(),
            pending.clone(),
        );

        let mut pipeline = Pipeline::new(events.clone());
        pipeline.push(Arc::new(connection.clone()));

        let encryption = if self.config.encryption.enabled {
            let layer = Arc::new(EncryptionLayer::new(
                self.config.encryption.clone(),
                events.clone(),
            ));
            pipeline.push(layer.clone());
            Some(layer)
        } else {
            None
        };
        let pipeline = Arc::new(pipeline);

        let authenticator = Arc::new(Authenticator::new(
            connection.clone(),
            pending,
            events.clone(),
            credentials,
            response_timeout,
        ));

        let connected = Arc::new(AtomicBool::new(false));
        for (kind, up) in [
            (EventKind::Connected, true),
            (EventKind::Reconnected, true),
            (EventKind::Disconnected, false),
            (EventKind::ConnectionFailed, false),
        ] {
            let connected = connected.clone();
            events.register(kind, move |_| connected.store(up, Ordering::SeqCst));
        }

        // Reconnection handlers are synchronous, so re-authentication is
        // signalled over a channel to a worker that can await.
        let (reauth_tx, reauth_rx) = mpsc::unbounded_channel();
        events.register(EventKind::Reconnected, move |_| {
            let _ = reauth_tx.send(());
        });

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(pump_inbound(
                connection.clone(),
                pipeline.clone(),
                cancel.clone(),
            )),
            tokio::spawn(reauthenticate_on_reconnect(
                authenticator.clone(),
                events.clone(),
                reauth_rx,
                cancel.clone(),
            )),
        ];

        Stack {
            connection,
            authenticator,
            encryption,
            pipeline,
            events,
            connected,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }
}

/// Forwards every inbound message up the pipeline. The connection sits at
/// index 0, so delivery starts at the layer above it.
async fn pump_inbound(connection: Connection, pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = connection.next_inbound() => message,
        };
        match message {
            Some(message) => pipeline.send_up_from(0, message).await,
            None => return,
        }
    }
}

async fn reauthenticate_on_reconnect(
    authenticator: Arc<Authenticator>,
    events: EventHub,
    mut reauth_rx: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            signal = reauth_rx.recv() => {
                if signal.is_none() {
                    return;
                }
            }
        }
        info!("transport re-established; re-running authentication");
        if let Err(err) = authenticator.authenticate().await {
            warn!("re-authentication failed: {}", err);
            events.emit(StackEvent::Error {
                layer: "auth".to_string(),
                reason: err.to_string(),
                message: None,
            });
        }
    }
}

/// The assembled protocol stack.
pub struct Stack {
    connection: Connection,
    authenticator: Arc<Authenticator>,
    encryption: Option<Arc<EncryptionLayer>>,
    pipeline: Arc<Pipeline>,
    events: EventHub,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Stack {
    /// Start every layer and establish the transport.
    pub async fn connect(&self) -> Result<(), StackError> {
        self.pipeline.start().await?;
        self.connection.connect().await?;
        Ok(())
    }

    /// Run the handshake. Returns once a pairing code or a validated
    /// static credential is held.
    pub async fn authenticate(&self) -> Result<bool, AuthenticationError> {
        self.authenticator.authenticate().await
    }

    /// Push one message down the pipeline and onto the wire. Failures on
    /// the way down come back as [`MessageError`]s.
    pub async fn send_message(&self, message: Message) -> Result<(), StackError> {
        self.pipeline
            .send_down(message)
            .await
            .map_err(as_message_error)
    }

    /// Tear the stack down: stop the pump tasks, stop every layer, close
    /// the transport, and drain pending events.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().expect("stack task list poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.pipeline.stop().await;
        self.events.shutdown().await;
        debug!("stack shut down");
    }

    /// Whether the transport is currently up, as seen by the event flow.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.connection.is_connected()
    }

    /// Register a handler for one event kind.
    pub fn on_event<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&StackEvent) + Send + Sync + 'static,
    {
        self.events.register(kind, handler);
    }

    /// Pairing code issued during authentication, once obtained.
    pub fn pairing_code(&self) -> Option<String> {
        self.authenticator.pairing_code()
    }

    /// Fresh message id for an outgoing chat message.
    pub fn next_message_id(&self) -> String {
        self.connection.tags().next_message_id()
    }

    /// Record a peer's identity key so chats to them can be encrypted.
    /// Fails when the stack was built without encryption.
    pub async fn register_peer_key(
        &self,
        peer_id: &str,
        key: [u8; 32],
    ) -> Result<(), StackError> {
        match &self.encryption {
            Some(layer) => Ok(layer.register_peer_key(peer_id, key).await?),
            None => Err(EncryptionError::UnknownPeer(peer_id.to_string()).into()),
        }
    }

    /// The local identity public key, for announcing to peers. `None`
    /// without encryption or before `connect`.
    pub async fn identity_key(&self) -> Option<[u8; 32]> {
        match &self.encryption {
            Some(layer) => layer.identity_key().await,
            None => None,
        }
    }
}

impl Stack {
    /// Convenience wrapper around [`Stack::send_message`] for plain text.
    /// Returns the generated message id.
    pub async fn send_text(
        &self,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<String, StackError> {
        if !self.connection.is_connected() {
            return Err(MessageError::NotConnected.into());
        }
        let id = self.next_message_id();
        self.send_message(Message::text(id.clone(), recipient, body))
            .await?;
        Ok(id)
    }
}

/// Classify a send-path failure under [`MessageError`], keeping the
/// concern that produced it.
fn as_message_error(err: StackError) -> StackError {
    match err {
        StackError::Connection(e) => MessageError::Transport(e).into(),
        StackError::Protocol(e) => MessageError::Encode(e).into(),
        StackError::Encryption(e) => MessageError::Encryption(e).into(),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::error::ConnectionError;
    use crate::transport::{Frame, Transport, TransportSink, TransportStream};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedDialer {
        supply: Mutex<VecDeque<Transport>>,
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self, config: &ConnectionConfig) -> Result<Transport, ConnectionError> {
            self.supply
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(ConnectionError::ConnectFailed {
                    url: config.endpoint.clone(),
                    reason: "scripted failure".to_string(),
                })
        }
    }

    fn loopback_stack(encryption: bool) -> (Stack, TransportSink, TransportStream) {
        let (client_end, server_end) = Transport::duplex(16384);
        let dialer = Arc::new(ScriptedDialer {
            supply: Mutex::new(VecDeque::from([client_end])),
        });
        let config = StackConfig::default()
            .with_encryption(encryption)
            .with_key_store_path(
                std::env::temp_dir().join(format!("bocksup-stack-{}", uuid::Uuid::new_v4())),
            );
        let stack = StackBuilder::new(config)
            .with_dialer(dialer)
            .build(Credentials::pairing("15551234567"));
        let (sink, stream) = server_end.split();
        (stack, sink, stream)
    }

    async fn read_one(stream: &mut TransportStream, decoder: &Serializer) -> Message {
        let mut buffer = Vec::new();
        loop {
            match stream.next().await.unwrap().unwrap() {
                Frame::Binary(chunk) => buffer.extend(chunk),
                Frame::Text(_) => panic!("unexpected text frame"),
            }
            if let (Some(message), rest) = decoder.deserialize(&buffer).unwrap() {
                assert!(rest.is_empty());
                return message;
            }
        }
    }

    #[tokio::test]
    async fn test_send_text_reaches_the_wire() {
        let (stack, _sink, mut stream) = loopback_stack(false);
        stack.connect().await.unwrap();

        let id = stack.send_text("123@s.whatsapp.net", "hello").await.unwrap();

        let decoder = Serializer::new();
        let message = read_one(&mut stream, &decoder).await;
        match message {
            Message::Chat(chat) => {
                assert_eq!(chat.tag, id);
                assert_eq!(chat.content.body, "hello");
            }
            other => panic!("unexpected: {:?}", other),
        }

        stack.disconnect().await;
        assert!(!stack.is_connected());
    }

    #[tokio::test]
    async fn test_inbound_messages_surface_as_events() {
        let (stack, mut sink, _stream) = loopback_stack(false);
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let delivered_in_handler = delivered.clone();
        stack.on_event(EventKind::Message, move |event| {
            if let StackEvent::Message(message) = event {
                delivered_in_handler.lock().unwrap().push(message.clone());
            }
        });

        stack.connect().await.unwrap();

        let encoder = Serializer::new();
        let inbound = Message::text("MID_srv_1", "me@s.whatsapp.net", "hi there");
        let frame = encoder.serialize(&inbound, false, false).unwrap();
        sink.send(Frame::Binary(frame)).await.unwrap();

        // disconnect() drains the pump and the event queue.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stack.disconnect().await;

        assert_eq!(delivered.lock().unwrap().as_slice(), &[inbound]);
    }

    #[tokio::test]
    async fn test_send_text_without_connection_fails() {
        let (stack, _sink, _stream) = loopback_stack(false);
        let result = stack.send_text("123@s.whatsapp.net", "x").await;
        assert!(matches!(
            result,
            Err(StackError::Message(MessageError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn test_send_message_failure_is_a_message_error() {
        let (stack, _sink, _stream) = loopback_stack(false);
        // Never connected, so the connection layer refuses the send.
        let result = stack.send_message(Message::keep_alive("t")).await;
        assert!(matches!(
            result,
            Err(StackError::Message(MessageError::Transport(
                ConnectionError::NotConnected
            )))
        ));
    }

    #[tokio::test]
    async fn test_register_peer_key_requires_encryption() {
        let (stack, _sink, _stream) = loopback_stack(false);
        let result = stack.register_peer_key("123@s.whatsapp.net", [1u8; 32]).await;
        assert!(result.is_err());
        assert!(stack.identity_key().await.is_none());
    }

    #[tokio::test]
    async fn test_pairing_flow_end_to_end() {
        let (stack, mut sink, mut stream) = loopback_stack(false);
        let codes = Arc::new(Mutex::new(Vec::new()));
        let codes_in_handler = codes.clone();
        stack.on_event(EventKind::PairingCode, move |event| {
            if let StackEvent::PairingCode { code } = event {
                codes_in_handler.lock().unwrap().push(code.clone());
            }
        });

        stack.connect().await.unwrap();

        // Scripted server: swallow the handshake, answer the pairing
        // request with a challenge carrying the code.
        let server = tokio::spawn(async move {
            let decoder = Serializer::new();
            let handshake = read_one(&mut stream, &decoder).await;
            assert!(matches!(handshake, Message::Connect(_)));

            let request = read_one(&mut stream, &decoder).await;
            let tag = match &request {
                Message::Request(r) => {
                    assert_eq!(r.method, "requestPairingCode");
                    r.tag.clone()
                }
                other => panic!("unexpected: {:?}", other),
            };

            let challenge = Message::from_value(serde_json::json!({
                "type": "challenge",
                "tag": tag,
                "data": { "pairingCode": "593217" },
            }));
            let frame = decoder.serialize(&challenge, false, false).unwrap();
            sink.send(Frame::Binary(frame)).await.unwrap();
        });

        let paired = stack.authenticate().await.unwrap();
        assert!(paired);
        assert_eq!(stack.pairing_code().as_deref(), Some("593217"));

        server.await.unwrap();
        stack.disconnect().await;
        assert_eq!(codes.lock().unwrap().as_slice(), &["593217".to_string()]);
    }

    #[tokio::test]
    async fn test_encrypted_chat_leaves_no_plaintext_on_the_wire() {
        let (stack, _sink, mut stream) = loopback_stack(true);
        stack.connect().await.unwrap();
        stack
            .register_peer_key("123@s.whatsapp.net", [9u8; 32])
            .await
            .unwrap();

        stack.send_text("123@s.whatsapp.net", "top secret").await.unwrap();

        let decoder = Serializer::new();
        let message = read_one(&mut stream, &decoder).await;
        match message {
            Message::Chat(chat) => {
                assert!(chat.content.encrypted);
                assert_ne!(chat.content.body, "top secret");
            }
            other => panic!("unexpected: {:?}", other),
        }

        stack.disconnect().await;
    }
}
