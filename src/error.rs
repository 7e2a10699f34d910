//! Error types for the protocol stack.
//!
//! Each concern has its own error enum; `StackError` aggregates them for
//! callers that drive the whole stack through one API.

use std::time::Duration;

use thiserror::Error;

use crate::crypto::CipherError;
use crate::encryption::StoreError;

/// Transport-level failures: the connection could not be established, was
/// closed by the peer, or refused an operation.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailed { url: String, reason: String },
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connection closed by peer")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

/// A bounded wait elapsed without a response.
#[derive(Debug, Error)]
#[error("timed out after {0:?}")]
pub struct TimeoutError(pub Duration);

/// Handshake, challenge, or pairing failures.
#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("connection failed during authentication: {0}")]
    Connection(#[from] ConnectionError),
    #[error("no server response: {0}")]
    Timeout(#[from] TimeoutError),
    #[error("malformed server response: {0}")]
    MalformedResponse(String),
    #[error("server rejected authentication: {0}")]
    Rejected(String),
    #[error("a phone number is required to request a pairing code")]
    MissingPhoneNumber,
}

/// Malformed or unsupported wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported envelope version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("encrypted frame received but no frame key is configured")]
    KeyNotConfigured,
    #[error("frame decryption failed")]
    DecryptFailed,
    #[error("ciphertext shorter than the prepended nonce")]
    TruncatedCiphertext,
    #[error("failed to inflate payload: {0}")]
    Inflate(#[from] std::io::Error),
    #[error("invalid message payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("`{0}` is not a valid JID")]
    InvalidJid(String),
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Session or key-material failures in the encryption layer.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("no identity key registered for peer {0}")]
    UnknownPeer(String),
    #[error("cipher failure: {0}")]
    Cipher(#[from] CipherError),
    #[error("key store failure: {0}")]
    Store(#[from] StoreError),
    #[error("message {0} has no body to process")]
    NoBody(String),
    #[error("undecryptable message from {peer}: {reason}")]
    Undecryptable { peer: String, reason: String },
}

/// Send-path failures after a connection is established.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("not connected")]
    NotConnected,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("failed to encode message: {0}")]
    Encode(#[from] ProtocolError),
    #[error("transport rejected the message: {0}")]
    Transport(#[from] ConnectionError),
    #[error("encryption failed: {0}")]
    Encryption(#[from] EncryptionError),
}

/// Aggregate error for stack-level operations.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("timeout: {0}")]
    Timeout(#[from] TimeoutError),
    #[error("authentication error: {0}")]
    Authentication(#[from] AuthenticationError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConnectionError::ConnectFailed {
            url: "wss://example.test/ws".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to wss://example.test/ws: refused"
        );
    }

    #[test]
    fn test_stack_error_from_timeout() {
        let err: StackError = TimeoutError(Duration::from_secs(5)).into();
        assert!(matches!(err, StackError::Timeout(_)));
    }

    #[test]
    fn test_message_error_keeps_the_failing_concern() {
        let err: StackError = MessageError::Transport(ConnectionError::NotConnected).into();
        assert!(matches!(
            err,
            StackError::Message(MessageError::Transport(ConnectionError::NotConnected))
        ));
        assert_eq!(
            MessageError::NotAuthenticated.to_string(),
            "not authenticated"
        );
    }

    #[test]
    fn test_unsupported_version_mentions_byte() {
        let err = ProtocolError::UnsupportedVersion(0x02);
        assert!(err.to_string().contains("0x02"));
    }
}
