//! Authentication and pairing.
//!
//! After the transport connects, the client announces itself with a
//! capability handshake and then obtains a credential: either the server's
//! `connected` ack validates restored tokens, or the client requests a
//! pairing code for its phone number and waits for the server's challenge
//! carrying the short numeric code.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{AuthenticationError, TimeoutError};
use crate::request::{PendingRequests, WaitKind};
use crate::types::{
    Features, Handshake, Message, PairingParams, PairingRequest, RequestMeta, StackEvent,
};
use crate::EventHub;

/// Protocol version announced in the handshake.
pub const PROTOCOL_VERSION: &str = "0.4";

/// Login material supplied by the application.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub phone_number: Option<String>,
    pub password: Option<String>,
    pub client_token: Option<String>,
    pub server_token: Option<String>,
}

impl Credentials {
    /// Pairing-code login for a new device.
    pub fn pairing(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: Some(phone_number.into()),
            ..Default::default()
        }
    }

    /// Static login with a previously issued password.
    pub fn static_login(phone_number: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            phone_number: Some(phone_number.into()),
            password: Some(password.into()),
            ..Default::default()
        }
    }

    /// Restore tokens from an earlier session.
    pub fn with_tokens(
        mut self,
        client_token: impl Into<String>,
        server_token: impl Into<String>,
    ) -> Self {
        self.client_token = Some(client_token.into());
        self.server_token = Some(server_token.into());
        self
    }

    /// Whether a static credential is already held, making the pairing
    /// exchange unnecessary.
    pub fn has_static(&self) -> bool {
        self.password.is_some() || (self.client_token.is_some() && self.server_token.is_some())
    }
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Init,
    Connecting,
    HandshakeSent,
    AwaitingChallenge,
    ChallengeReceived,
    CodeIssued,
    Failed,
}

/// Drives the handshake over a [`Connection`]. Never retried on its own;
/// callers decide whether to call [`Authenticator::authenticate`] again.
pub struct Authenticator {
    connection: Connection,
    pending: Arc<PendingRequests>,
    events: EventHub,
    credentials: Mutex<Credentials>,
    state: Mutex<AuthState>,
    client_id: String,
    device_id: String,
    session_id: String,
    pairing_code: Mutex<Option<String>>,
    response_timeout: Duration,
}

impl Authenticator {
    pub fn new(
        connection: Connection,
        pending: Arc<PendingRequests>,
        events: EventHub,
        credentials: Credentials,
        response_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            pending,
            events,
            credentials: Mutex::new(credentials),
            state: Mutex::new(AuthState::Init),
            client_id: format!("bocksup:{}", Uuid::new_v4()),
            device_id: Uuid::new_v4().to_string(),
            session_id: Uuid::new_v4().to_string(),
            pairing_code: Mutex::new(None),
            response_timeout,
        }
    }

    pub fn state(&self) -> AuthState {
        *lock(&self.state)
    }

    /// Pairing code issued by the server, once obtained.
    pub fn pairing_code(&self) -> Option<String> {
        lock(&self.pairing_code).clone()
    }

    /// Run the handshake until a usable credential is held.
    pub async fn authenticate(&self) -> Result<bool, AuthenticationError> {
        self.set_state(AuthState::Connecting);
        if !self.connection.is_connected() {
            if let Err(err) = self.connection.connect().await {
                self.set_state(AuthState::Failed);
                return Err(err.into());
            }
        }

        // Waiters are parked before the handshake goes out, so a fast
        // server response cannot slip past them.
        let challenge_rx = self.pending.register_kind(WaitKind::Challenge);
        let connected_rx = self.pending.register_kind(WaitKind::Connected);

        let handshake = self.build_handshake();
        if let Err(err) = self.connection.send(&handshake).await {
            self.set_state(AuthState::Failed);
            return Err(err.into());
        }
        self.set_state(AuthState::HandshakeSent);
        self.set_state(AuthState::AwaitingChallenge);

        if lock(&self.credentials).has_static() {
            debug!("static credential held; awaiting connected ack");
            let message = tokio::time::timeout(self.response_timeout, connected_rx)
                .await
                .map_err(|_| self.fail_timeout())?
                .map_err(|_| self.fail_closed())?;
            match message {
                Message::Connected(ack) => {
                    let mut credentials = lock(&self.credentials);
                    if ack.client_token.is_some() {
                        credentials.client_token = ack.client_token;
                    }
                    if ack.server_token.is_some() {
                        credentials.server_token = ack.server_token;
                    }
                    drop(credentials);
                    self.set_state(AuthState::CodeIssued);
                    info!("authenticated with static credential");
                    Ok(true)
                }
                other => {
                    self.set_state(AuthState::Failed);
                    Err(AuthenticationError::MalformedResponse(format!(
                        "expected connected ack, got {}",
                        other.kind()
                    )))
                }
            }
        } else {
            self.request_pairing_code(challenge_rx).await
        }
    }

    async fn request_pairing_code(
        &self,
        challenge_rx: tokio::sync::oneshot::Receiver<Message>,
    ) -> Result<bool, AuthenticationError> {
        let phone_number = lock(&self.credentials)
            .phone_number
            .clone()
            .ok_or(AuthenticationError::MissingPhoneNumber)?;

        let tag = self.connection.tags().next_tag();
        let response_rx = self.pending.register_tag(&tag);
        let request = Message::Request(PairingRequest {
            tag: tag.clone(),
            method: "requestPairingCode".to_string(),
            params: PairingParams {
                phone_number,
                request_meta: RequestMeta {
                    platform: "rust".to_string(),
                    device_id: self.device_id.clone(),
                    session_id: self.session_id.clone(),
                },
            },
        });

        if let Err(err) = self.connection.send(&request).await {
            self.pending.cancel_tag(&tag);
            self.set_state(AuthState::Failed);
            return Err(err.into());
        }
        debug!("pairing code requested with tag {}", tag);

        let message = tokio::time::timeout(self.response_timeout, async {
            tokio::select! {
                challenge = challenge_rx => challenge,
                response = response_rx => response,
            }
        })
        .await
        .map_err(|_| self.fail_timeout())?
        .map_err(|_| self.fail_closed())?;

        let value = message
            .to_value()
            .map_err(|e| AuthenticationError::MalformedResponse(e.to_string()))?;
        if matches!(message, Message::Challenge(_)) {
            self.set_state(AuthState::ChallengeReceived);
        }

        match extract_pairing_code(&value) {
            Some(code) => {
                *lock(&self.pairing_code) = Some(code.clone());
                self.set_state(AuthState::CodeIssued);
                info!("pairing code issued");
                self.events.emit(StackEvent::PairingCode { code });
                Ok(true)
            }
            None => {
                warn!("server response carried no pairing code");
                self.set_state(AuthState::Failed);
                Err(AuthenticationError::MalformedResponse(
                    "no pairing code in server response".to_string(),
                ))
            }
        }
    }

    fn build_handshake(&self) -> Message {
        let credentials = lock(&self.credentials);
        Message::Connect(Handshake {
            client_token: credentials.client_token.clone(),
            server_token: credentials.server_token.clone(),
            client_id: self.client_id.clone(),
            tag: self.connection.tags().next_tag(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            connect_type: "PHONE_CONNECTING".to_string(),
            connect_reason: "USER_ACTIVATED".to_string(),
            features: Features::default(),
        })
    }

    fn set_state(&self, state: AuthState) {
        debug!("auth state -> {:?}", state);
        *lock(&self.state) = state;
    }

    fn fail_timeout(&self) -> AuthenticationError {
        self.set_state(AuthState::Failed);
        TimeoutError(self.response_timeout).into()
    }

    fn fail_closed(&self) -> AuthenticationError {
        self.set_state(AuthState::Failed);
        AuthenticationError::Connection(crate::error::ConnectionError::Closed)
    }
}

/// Pairing codes arrive at the top level, under `data`, or under `result`,
/// depending on the server build.
fn extract_pairing_code(value: &Value) -> Option<String> {
    for candidate in [
        value.get("pairingCode"),
        value.get("data").and_then(|d| d.get("pairingCode")),
        value.get("result").and_then(|r| r.get("pairingCode")),
    ]
    .into_iter()
    .flatten()
    {
        if let Some(code) = candidate.as_str() {
            return Some(code.to_string());
        }
        if let Some(code) = candidate.as_u64() {
            return Some(format!("{:06}", code));
        }
    }
    None
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("authenticator state lock poisoned")
}
