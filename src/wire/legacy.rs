//! Legacy text-mode codec.
//!
//! Older servers exchange frames as `"<tag>,<json>"` strings. A frame
//! without the tag prefix is plain JSON.

use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::Message;

/// Encode a message as a tagged text frame.
pub fn encode(tag: &str, message: &Message) -> Result<String, ProtocolError> {
    message.validate()?;
    let value = message.to_value()?;
    Ok(format!("{},{}", tag, serde_json::to_string(&value)?))
}

/// Decode a text frame into its tag (when present) and message.
pub fn decode(frame: &str) -> Result<(Option<String>, Message), ProtocolError> {
    let trimmed = frame.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        let value: Value = serde_json::from_str(trimmed)?;
        return Ok((None, Message::from_value(value)));
    }

    match frame.split_once(',') {
        Some((tag, body)) => {
            let value: Value = serde_json::from_str(body)?;
            Ok((Some(tag.to_string()), Message::from_value(value)))
        }
        None => {
            let value: Value = serde_json::from_str(frame)?;
            Ok((None, Message::from_value(value)))
        }
    }
}
