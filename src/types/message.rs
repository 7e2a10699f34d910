//! Protocol message types.
//!
//! Every frame exchanged with the server is one of these variants. Unknown
//! payloads are preserved as [`Message::Raw`] so newer server message kinds
//! pass through the stack untouched.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::JID;

fn is_false(v: &bool) -> bool {
    !*v
}

/// Capability flags advertised in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    #[serde(rename = "supportsMultiDevice")]
    pub supports_multi_device: bool,
    #[serde(rename = "supportsE2EEncryption")]
    pub supports_e2e_encryption: bool,
    #[serde(rename = "supportsQRLinking")]
    pub supports_qr_linking: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            supports_multi_device: true,
            supports_e2e_encryption: true,
            supports_qr_linking: true,
        }
    }
}

/// Initial hello announcing client identity and capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "clientToken")]
    pub client_token: Option<String>,
    #[serde(rename = "serverToken")]
    pub server_token: Option<String>,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub tag: String,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "connectType")]
    pub connect_type: String,
    #[serde(rename = "connectReason")]
    pub connect_reason: String,
    pub features: Features,
}

/// Server challenge issued after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// Server acknowledgement completing authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedAck {
    #[serde(rename = "clientToken", default)]
    pub client_token: Option<String>,
    #[serde(rename = "serverToken", default)]
    pub server_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub platform: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingParams {
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
    #[serde(rename = "requestMeta")]
    pub request_meta: RequestMeta,
}

/// Tagged request for a pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRequest {
    pub tag: String,
    pub method: String,
    pub params: PairingParams,
}

/// Tagged server reply to a request; payload fields vary by method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// Body of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
}

/// A chat message; `tag` doubles as the message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub tag: String,
    #[serde(rename = "from", default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub recipient: String,
    pub content: ChatContent,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckContent {
    #[serde(rename = "type")]
    pub ack_type: String,
    pub id: String,
}

/// Delivery/read acknowledgement for a previously sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub tag: String,
    pub recipient: String,
    pub content: AckContent,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceContent {
    #[serde(rename = "type")]
    pub presence_type: String,
    pub timestamp: i64,
}

/// Presence update, optionally directed at one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub content: PresenceContent,
}

/// Idle keep-alive probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    pub tag: String,
}

/// Orderly shutdown notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectNotice {
    pub tag: String,
    pub reason: String,
    pub timestamp: i64,
}

/// Error frame reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A protocol message, dispatched on the wire `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Connect(Handshake),
    Challenge(Challenge),
    Connected(ConnectedAck),
    Request(PairingRequest),
    Response(ResponseMessage),
    Chat(ChatMessage),
    Ack(AckMessage),
    Presence(PresenceMessage),
    KeepAlive(KeepAlive),
    Disconnect(DisconnectNotice),
    Error(ErrorMessage),
    /// Unknown or untyped payload, preserved verbatim.
    Raw(Value),
}

impl Message {
    /// Wire value of the `type` field for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connect(_) => "connect",
            Message::Challenge(_) => "challenge",
            Message::Connected(_) => "connected",
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Chat(_) => "message",
            Message::Ack(_) => "ack",
            Message::Presence(_) => "presence",
            Message::KeepAlive(_) => "keep_alive",
            Message::Disconnect(_) => "disconnect",
            Message::Error(_) => "error",
            Message::Raw(_) => "raw",
        }
    }

    /// Correlation tag, when the message carries one.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Message::Connect(m) => Some(&m.tag),
            Message::Challenge(m) => m.tag.as_deref(),
            Message::Connected(_) => None,
            Message::Request(m) => Some(&m.tag),
            Message::Response(m) => m.tag.as_deref(),
            Message::Chat(m) => Some(&m.tag),
            Message::Ack(m) => Some(&m.tag),
            Message::Presence(m) => Some(&m.tag),
            Message::KeepAlive(m) => Some(&m.tag),
            Message::Disconnect(m) => Some(&m.tag),
            Message::Error(m) => m.tag.as_deref(),
            Message::Raw(v) => v.get("tag").and_then(Value::as_str),
        }
    }

    /// Convert into the wire JSON value, adding the `type` field.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        let (kind, mut value) = match self {
            Message::Raw(v) => return Ok(v.clone()),
            Message::Connect(p) => ("connect", serde_json::to_value(p)?),
            Message::Challenge(p) => ("challenge", serde_json::to_value(p)?),
            Message::Connected(p) => ("connected", serde_json::to_value(p)?),
            Message::Request(p) => ("request", serde_json::to_value(p)?),
            Message::Response(p) => ("response", serde_json::to_value(p)?),
            Message::Chat(p) => ("message", serde_json::to_value(p)?),
            Message::Ack(p) => ("ack", serde_json::to_value(p)?),
            Message::Presence(p) => ("presence", serde_json::to_value(p)?),
            Message::KeepAlive(p) => ("keep_alive", serde_json::to_value(p)?),
            Message::Disconnect(p) => ("disconnect", serde_json::to_value(p)?),
            Message::Error(p) => ("error", serde_json::to_value(p)?),
        };
        if let Value::Object(map) = &mut value {
            map.insert("type".to_string(), Value::String(kind.to_string()));
        }
        Ok(value)
    }

    /// Parse a wire JSON value. Unknown `type` tags and payloads that do not
    /// match their declared shape come back as [`Message::Raw`].
    pub fn from_value(value: Value) -> Message {
        let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
            return Message::Raw(value);
        };

        let mut stripped = value.clone();
        if let Value::Object(map) = &mut stripped {
            map.remove("type");
        }

        let parsed = match kind.as_str() {
            "connect" => serde_json::from_value(stripped).map(Message::Connect),
            "challenge" => serde_json::from_value(stripped).map(Message::Challenge),
            "connected" => serde_json::from_value(stripped).map(Message::Connected),
            "request" => serde_json::from_value(stripped).map(Message::Request),
            "response" => serde_json::from_value(stripped).map(Message::Response),
            "message" => serde_json::from_value(stripped).map(Message::Chat),
            "ack" => serde_json::from_value(stripped).map(Message::Ack),
            "presence" => serde_json::from_value(stripped).map(Message::Presence),
            "keep_alive" => serde_json::from_value(stripped).map(Message::KeepAlive),
            "disconnect" => serde_json::from_value(stripped).map(Message::Disconnect),
            "error" => serde_json::from_value(stripped).map(Message::Error),
            _ => return Message::Raw(value),
        };
        parsed.unwrap_or(Message::Raw(value))
    }

    /// Check the addressing fields before the message leaves the client.
    /// Chat, ack and directed presence messages must carry well-formed
    /// JIDs with a user part; everything else has no address to check.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        fn check(candidate: &str) -> Result<(), ProtocolError> {
            let jid: JID = candidate
                .parse()
                .map_err(|_| ProtocolError::InvalidJid(candidate.to_string()))?;
            if jid.user.is_empty() || jid.is_empty() {
                return Err(ProtocolError::InvalidJid(candidate.to_string()));
            }
            Ok(())
        }

        match self {
            Message::Chat(m) => {
                check(&m.recipient)?;
                if let Some(sender) = &m.sender {
                    check(sender)?;
                }
                Ok(())
            }
            Message::Ack(m) => check(&m.recipient),
            Message::Presence(m) => match &m.recipient {
                Some(recipient) => check(recipient),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Build a text chat message.
    pub fn text(
        id: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Message {
        Message::Chat(ChatMessage {
            tag: id.into(),
            sender: None,
            recipient: recipient.into(),
            content: ChatContent {
                content_type: "text".to_string(),
                body: body.into(),
                encrypted: false,
            },
            timestamp: Utc::now().timestamp(),
        })
    }

    /// Build an acknowledgement for a received message.
    pub fn ack(
        message_id: impl Into<String>,
        recipient: impl Into<String>,
        ack_type: impl Into<String>,
    ) -> Message {
        let id = message_id.into();
        Message::Ack(AckMessage {
            tag: format!("ACK_{}", id),
            recipient: recipient.into(),
            content: AckContent {
                ack_type: ack_type.into(),
                id,
            },
            timestamp: Utc::now().timestamp(),
        })
    }

    /// Build a presence update.
    pub fn presence(presence_type: impl Into<String>, to: Option<String>) -> Message {
        let now = Utc::now().timestamp();
        Message::Presence(PresenceMessage {
            tag: format!("PRESENCE_{}", now),
            recipient: to,
            content: PresenceContent {
                presence_type: presence_type.into(),
                timestamp: now,
            },
        })
    }

    /// Build an idle keep-alive probe.
    pub fn keep_alive(tag: impl Into<String>) -> Message {
        Message::KeepAlive(KeepAlive { tag: tag.into() })
    }

    /// Build an orderly shutdown notice.
    pub fn disconnect_notice(tag: impl Into<String>, reason: impl Into<String>) -> Message {
        Message::Disconnect(DisconnectNotice {
            tag: tag.into(),
            reason: reason.into(),
            timestamp: Utc::now().timestamp(),
        })
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error as _;
        let value = self.to_value().map_err(S::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Message::from_value(value))
    }
}

/// Generates per-connection message tags and message ids.
///
/// Tags follow the `"<unix-time>.--<counter>"` shape and stay unique for the
/// lifetime of one connection.
#[derive(Debug, Default)]
pub struct TagGenerator {
    counter: AtomicU64,
}

impl TagGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Next correlation tag.
    pub fn next_tag(&self) -> String {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}.--{}", Utc::now().timestamp(), count)
    }

    /// Next chat message id.
    pub fn next_message_id(&self) -> String {
        let salt: u16 = rand::thread_rng().gen_range(0..10000);
        format!("MID_{}_{}", Utc::now().timestamp(), salt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_round_trip() {
        let msg = Message::text("MID_1700000000_42", "123@s.whatsapp.net", "hello");
        let value = msg.to_value().unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["content"]["body"], "hello");
        assert_eq!(Message::from_value(value), msg);
    }

    #[test]
    fn test_handshake_serializes_camel_case() {
        let msg = Message::Connect(Handshake {
            client_token: Some("ct".into()),
            server_token: None,
            client_id: "bocksup:abc".into(),
            tag: "1700000000.--0".into(),
            protocol_version: "0.4".into(),
            connect_type: "PHONE_CONNECTING".into(),
            connect_reason: "USER_ACTIVATED".into(),
            features: Features::default(),
        });
        let value = msg.to_value().unwrap();
        assert_eq!(value["type"], "connect");
        assert_eq!(value["clientToken"], "ct");
        assert!(value["serverToken"].is_null());
        assert_eq!(value["features"]["supportsMultiDevice"], true);
    }

    #[test]
    fn test_unknown_type_is_raw() {
        let value = json!({"type": "shiny_new_thing", "payload": 7});
        let msg = Message::from_value(value.clone());
        assert_eq!(msg, Message::Raw(value.clone()));
        assert_eq!(msg.to_value().unwrap(), value);
    }

    #[test]
    fn test_untyped_value_is_raw() {
        let value = json!(["admin", "init"]);
        assert_eq!(Message::from_value(value.clone()), Message::Raw(value));
    }

    #[test]
    fn test_response_keeps_extra_fields() {
        let value = json!({"type": "response", "tag": "t1", "pairingCode": "123456"});
        let msg = Message::from_value(value);
        match &msg {
            Message::Response(r) => {
                assert_eq!(r.tag.as_deref(), Some("t1"));
                assert_eq!(r.rest["pairingCode"], "123456");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
        let back = msg.to_value().unwrap();
        assert_eq!(back["pairingCode"], "123456");
        assert_eq!(back["type"], "response");
    }

    #[test]
    fn test_validate_accepts_well_formed_addresses() {
        assert!(Message::text("MID_1", "123@s.whatsapp.net", "hi")
            .validate()
            .is_ok());
        assert!(Message::text("MID_1", "123456789-987@g.us", "hi")
            .validate()
            .is_ok());
        assert!(Message::ack("MID_1", "123@s.whatsapp.net", "read")
            .validate()
            .is_ok());
        // Undirected presence has no address to check.
        assert!(Message::presence("available", None).validate().is_ok());
        assert!(Message::keep_alive("t").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_recipients() {
        for bad in ["a@b@c", "s.whatsapp.net", ""] {
            let result = Message::text("MID_1", bad, "hi").validate();
            assert!(
                matches!(result, Err(ProtocolError::InvalidJid(ref j)) if j == bad),
                "{:?} accepted",
                bad
            );
        }

        let mut chat = match Message::text("MID_1", "123@s.whatsapp.net", "hi") {
            Message::Chat(chat) => chat,
            _ => unreachable!(),
        };
        chat.sender = Some("bad@sender@jid".to_string());
        assert!(Message::Chat(chat).validate().is_err());

        let presence = Message::presence("composing", Some("@".to_string()));
        assert!(presence.validate().is_err());
    }

    #[test]
    fn test_tags_are_unique_and_increasing() {
        let tags = TagGenerator::new();
        let a = tags.next_tag();
        let b = tags.next_tag();
        assert_ne!(a, b);
        assert!(a.contains(".--"));
    }

    #[test]
    fn test_ack_builder_shape() {
        let msg = Message::ack("MID_1_2", "123@s.whatsapp.net", "read");
        let value = msg.to_value().unwrap();
        assert_eq!(value["tag"], "ACK_MID_1_2");
        assert_eq!(value["content"]["id"], "MID_1_2");
        assert_eq!(value["content"]["type"], "read");
    }
}
