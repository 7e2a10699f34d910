//! Binary envelope serializer.
//!
//! Every framed-mode message travels as
//! `version(1) | flags(1) | message_type(1) | length(4 BE) | payload`.
//! The payload is canonical JSON, optionally deflated and optionally
//! encrypted; each transformation sets its flag bit so the receiving side
//! knows exactly which steps to undo.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::crypto::Cipher;
use crate::error::ProtocolError;
use crate::types::Message;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 7;

/// Payload size above which [`Serializer::serialize_auto`] deflates.
pub const COMPRESS_THRESHOLD: usize = 200;

/// JSON payload encoding. The only version currently decoded.
pub const VERSION_JSON: u8 = 0x01;
/// Reserved for a future binary node encoding.
pub const VERSION_BINARY: u8 = 0x02;
/// Reserved for a future protobuf encoding.
pub const VERSION_PROTOBUF: u8 = 0x03;

/// Envelope flag bits.
pub mod flags {
    /// Payload was deflated before (and after decryption, inflated).
    pub const COMPRESSED: u8 = 0x01;
    /// Payload is sealed with the configured frame key.
    pub const ENCRYPTED: u8 = 0x02;
}

/// Stateless envelope codec. Cloning shares the configured frame key.
#[derive(Clone, Default)]
pub struct Serializer {
    key: Option<[u8; 32]>,
}

impl Serializer {
    /// Create a serializer without a frame key; encrypted frames are
    /// rejected until one is configured.
    pub fn new() -> Self {
        Self { key: None }
    }

    /// Create a serializer with a frame key for the `ENCRYPTED` flag.
    pub fn with_key(key: [u8; 32]) -> Self {
        Self { key: Some(key) }
    }

    /// Whether a frame key is configured.
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Encode a message into one complete frame. Addressed messages with
    /// malformed JIDs are refused before they reach the wire.
    pub fn serialize(
        &self,
        message: &Message,
        compress: bool,
        encrypt: bool,
    ) -> Result<Vec<u8>, ProtocolError> {
        message.validate()?;
        let value = message.to_value()?;
        let mut payload = serde_json::to_vec(&value)?;
        let mut frame_flags = 0u8;

        if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&payload)?;
            payload = encoder.finish()?;
            frame_flags |= flags::COMPRESSED;
        }

        if encrypt {
            let key = self.key.ok_or(ProtocolError::KeyNotConfigured)?;
            payload = Cipher::new(key)
                .seal(&payload, &[])
                .map_err(|_| ProtocolError::DecryptFailed)?;
            frame_flags |= flags::ENCRYPTED;
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.push(VERSION_JSON);
        frame.push(frame_flags);
        frame.push(0); // message_type, reserved
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Encode a message, deflating only when the payload is large enough
    /// for compression to pay for itself.
    pub fn serialize_auto(&self, message: &Message) -> Result<Vec<u8>, ProtocolError> {
        let payload = serde_json::to_vec(&message.to_value()?)?;
        self.serialize(message, payload.len() > COMPRESS_THRESHOLD, false)
    }

    /// Decode the first complete frame from `buffer`.
    ///
    /// Returns `(None, buffer)` unchanged while the buffer holds less than
    /// one whole frame; callers accumulate more bytes and retry. On success
    /// the remainder after the frame is returned so concatenated frames can
    /// be drained in a loop.
    pub fn deserialize<'a>(
        &self,
        buffer: &'a [u8],
    ) -> Result<(Option<Message>, &'a [u8]), ProtocolError> {
        if buffer.len() < HEADER_LEN {
            return Ok((None, buffer));
        }

        let version = buffer[0];
        let frame_flags = buffer[1];
        let length = u32::from_be_bytes([buffer[3], buffer[4], buffer[5], buffer[6]]) as usize;

        if buffer.len() < HEADER_LEN + length {
            return Ok((None, buffer));
        }

        let (payload, remainder) = buffer[HEADER_LEN..].split_at(length);
        let mut payload = payload.to_vec();

        if frame_flags & flags::ENCRYPTED != 0 {
            let key = self.key.ok_or(ProtocolError::KeyNotConfigured)?;
            payload = Cipher::new(key)
                .open(&payload, &[])
                .map_err(|_| ProtocolError::DecryptFailed)?;
        }

        if frame_flags & flags::COMPRESSED != 0 {
            let mut inflated = Vec::new();
            ZlibDecoder::new(payload.as_slice()).read_to_end(&mut inflated)?;
            payload = inflated;
        }

        let message = match version {
            VERSION_JSON => {
                let value: serde_json::Value = serde_json::from_slice(&payload)?;
                Message::from_value(value)
            }
            other => return Err(ProtocolError::UnsupportedVersion(other)),
        };

        Ok((Some(message), remainder))
    }
}

impl std::fmt::Debug for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serializer")
            .field("key", &self.key.map(|_| "[REDACTED]"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> Message {
        Message::text("MID_1700000000_1", "123@s.whatsapp.net", "hi")
    }

    #[test]
    fn test_round_trip_all_flag_combinations() {
        let serializer = Serializer::with_key([0x42; 32]);
        let message = chat();

        for compress in [false, true] {
            for encrypt in [false, true] {
                let frame = serializer.serialize(&message, compress, encrypt).unwrap();
                let (decoded, rest) = serializer.deserialize(&frame).unwrap();
                assert_eq!(decoded, Some(message.clone()), "c={compress} e={encrypt}");
                assert!(rest.is_empty());
            }
        }
    }

    #[test]
    fn test_plain_frame_layout() {
        let serializer = Serializer::new();
        let message = chat();
        let frame = serializer.serialize(&message, false, false).unwrap();

        assert_eq!(frame[0], VERSION_JSON);
        assert_eq!(frame[1], 0);
        let length = u32::from_be_bytes([frame[3], frame[4], frame[5], frame[6]]) as usize;
        assert_eq!(frame.len(), HEADER_LEN + length);

        // Payload is plain UTF-8 JSON.
        let value: serde_json::Value = serde_json::from_slice(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["content"]["body"], "hi");
    }

    #[test]
    fn test_partial_frame_returns_buffer_unchanged() {
        let serializer = Serializer::new();
        let frame = serializer.serialize(&chat(), false, false).unwrap();

        for cut in [0, 3, HEADER_LEN, frame.len() - 1] {
            let partial = &frame[..cut];
            let (decoded, rest) = serializer.deserialize(partial).unwrap();
            assert_eq!(decoded, None);
            assert_eq!(rest, partial);
        }
    }

    #[test]
    fn test_pipelined_frames_drain_in_order() {
        let serializer = Serializer::new();
        let first = Message::text("MID_1", "123@s.whatsapp.net", "one");
        let second = Message::text("MID_2", "123@s.whatsapp.net", "two");

        let mut buffer = serializer.serialize(&first, false, false).unwrap();
        buffer.extend(serializer.serialize(&second, true, false).unwrap());

        let (decoded, rest) = serializer.deserialize(&buffer).unwrap();
        assert_eq!(decoded, Some(first));
        let (decoded, rest) = serializer.deserialize(rest).unwrap();
        assert_eq!(decoded, Some(second));
        assert!(rest.is_empty());
    }

    #[test]
    fn test_malformed_recipient_never_reaches_the_wire() {
        let serializer = Serializer::new();
        let message = Message::text("MID_1", "not@a@jid", "hi");
        let result = serializer.serialize(&message, false, false);
        assert!(matches!(result, Err(ProtocolError::InvalidJid(_))));
    }

    #[test]
    fn test_encrypt_without_key_fails() {
        let serializer = Serializer::new();
        let result = serializer.serialize(&chat(), false, true);
        assert!(matches!(result, Err(ProtocolError::KeyNotConfigured)));
    }

    #[test]
    fn test_encrypted_frame_without_key_fails_to_decode() {
        let sender = Serializer::with_key([0x42; 32]);
        let frame = sender.serialize(&chat(), false, true).unwrap();

        let receiver = Serializer::new();
        let result = receiver.deserialize(&frame);
        assert!(matches!(result, Err(ProtocolError::KeyNotConfigured)));
    }

    #[test]
    fn test_reserved_versions_are_rejected() {
        let serializer = Serializer::new();
        let mut frame = serializer.serialize(&chat(), false, false).unwrap();

        for version in [VERSION_BINARY, VERSION_PROTOBUF, 0x7f] {
            frame[0] = version;
            let result = serializer.deserialize(&frame);
            assert!(matches!(
                result,
                Err(ProtocolError::UnsupportedVersion(v)) if v == version
            ));
        }
    }

    #[test]
    fn test_serialize_auto_compresses_only_large_bodies() {
        let serializer = Serializer::new();

        let small = serializer.serialize_auto(&chat()).unwrap();
        assert_eq!(small[1] & flags::COMPRESSED, 0);

        let big = Message::text("MID_2", "123@s.whatsapp.net", "x".repeat(400));
        let frame = serializer.serialize_auto(&big).unwrap();
        assert_eq!(frame[1] & flags::COMPRESSED, flags::COMPRESSED);

        let (decoded, _) = serializer.deserialize(&frame).unwrap();
        assert_eq!(decoded, Some(big));
    }

    #[test]
    fn test_compression_shrinks_repetitive_payload() {
        let serializer = Serializer::new();
        let message = Message::text("MID_1", "123@s.whatsapp.net", "ab".repeat(600));

        let plain = serializer.serialize(&message, false, false).unwrap();
        let compressed = serializer.serialize(&message, true, false).unwrap();
        assert!(compressed.len() < plain.len());
        assert_eq!(compressed[1] & flags::COMPRESSED, flags::COMPRESSED);
    }
}
