//! Stack lifecycle and delivery events.
//!
//! Events flow out of the connection and the processing layers to whoever
//! registered a handler for their kind.

use crate::types::Message;

/// Identifies an event family for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Reconnected,
    ConnectionFailed,
    PairingCode,
    Message,
    Error,
}

/// Events emitted by the stack and its layers.
#[derive(Debug, Clone)]
pub enum StackEvent {
    /// Transport established.
    Connected { reconnect: bool },
    /// Transport lost; reconnection may follow.
    Disconnected { error: Option<String> },
    /// Transport re-established after a drop.
    Reconnected { attempts: u32 },
    /// Reconnection attempts exhausted; no further retries.
    ConnectionFailed { error: String, permanent: bool },
    /// Server issued a pairing code.
    PairingCode { code: String },
    /// Inbound message that reached the top of the pipeline.
    Message(Message),
    /// A layer failed to process one message; the pipeline keeps running.
    Error {
        layer: String,
        reason: String,
        message: Option<Message>,
    },
}

impl StackEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StackEvent::Connected { .. } => EventKind::Connected,
            StackEvent::Disconnected { .. } => EventKind::Disconnected,
            StackEvent::Reconnected { .. } => EventKind::Reconnected,
            StackEvent::ConnectionFailed { .. } => EventKind::ConnectionFailed,
            StackEvent::PairingCode { .. } => EventKind::PairingCode,
            StackEvent::Message(_) => EventKind::Message,
            StackEvent::Error { .. } => EventKind::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_mapping() {
        let event = StackEvent::ConnectionFailed {
            error: "gone".into(),
            permanent: true,
        };
        assert_eq!(event.kind(), EventKind::ConnectionFailed);

        let event = StackEvent::Disconnected { error: None };
        assert_eq!(event.kind(), EventKind::Disconnected);
    }
}
