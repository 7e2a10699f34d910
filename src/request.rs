//! Pending-request tracking.
//!
//! Requests carry a correlation tag; the matching response arrives
//! asynchronously on the read loop. Waiters park on a oneshot channel until
//! the tagged response shows up. Untagged server messages that someone is
//! waiting for (the authentication challenge, the connected ack) are claimed
//! through kind waiters.

use std::collections::HashMap;
use std::sync::RwLock;

use log::debug;
use tokio::sync::oneshot;

use crate::types::Message;

/// Untagged message families a caller can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKind {
    Challenge,
    Connected,
}

/// Tag and kind waiter registry shared between the read loop and callers.
#[derive(Default)]
pub struct PendingRequests {
    tags: RwLock<HashMap<String, oneshot::Sender<Message>>>,
    kinds: RwLock<HashMap<WaitKind, oneshot::Sender<Message>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a waiter for the response to `tag`.
    pub fn register_tag(&self, tag: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut tags) = self.tags.write() {
            tags.insert(tag.to_string(), tx);
        }
        rx
    }

    /// Park a waiter for the next message of `kind`. A newer waiter for the
    /// same kind replaces the old one, which resolves as cancelled.
    pub fn register_kind(&self, kind: WaitKind) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut kinds) = self.kinds.write() {
            kinds.insert(kind, tx);
        }
        rx
    }

    /// Offer an inbound message to the waiters. Returns the message back
    /// when nobody claimed it, so the read loop can forward it upward.
    pub fn complete(&self, message: Message) -> Option<Message> {
        let kind = match &message {
            Message::Challenge(_) => Some(WaitKind::Challenge),
            Message::Connected(_) => Some(WaitKind::Connected),
            _ => None,
        };
        if let Some(kind) = kind {
            let waiter = self.kinds.write().ok().and_then(|mut kinds| kinds.remove(&kind));
            if let Some(tx) = waiter {
                debug!("inbound {:?} claimed by kind waiter", kind);
                return match tx.send(message) {
                    Ok(()) => None,
                    Err(message) => Some(message),
                };
            }
        }

        let tag = message.tag().map(str::to_owned);
        if let Some(tag) = tag {
            let waiter = self.tags.write().ok().and_then(|mut tags| tags.remove(&tag));
            if let Some(tx) = waiter {
                debug!("inbound response claimed by tag {}", tag);
                return match tx.send(message) {
                    Ok(()) => None,
                    Err(message) => Some(message),
                };
            }
        }

        Some(message)
    }

    /// Drop a tag waiter that is no longer interested.
    pub fn cancel_tag(&self, tag: &str) {
        if let Ok(mut tags) = self.tags.write() {
            tags.remove(tag);
        }
    }

    /// Drop every waiter; their receivers resolve as cancelled. Called
    /// when the transport goes away.
    pub fn cancel_all(&self) {
        if let Ok(mut tags) = self.tags.write() {
            tags.clear();
        }
        if let Ok(mut kinds) = self.kinds.write() {
            kinds.clear();
        }
    }

    /// Number of outstanding tag waiters.
    pub fn pending_count(&self) -> usize {
        self.tags.read().map(|tags| tags.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Challenge, ResponseMessage};

    fn response(tag: &str) -> Message {
        Message::Response(ResponseMessage {
            tag: Some(tag.to_string()),
            status: Some(200),
            rest: Default::default(),
        })
    }

    #[tokio::test]
    async fn test_tagged_response_completes_waiter() {
        let pending = PendingRequests::new();
        let rx = pending.register_tag("1700000000.--0");
        assert_eq!(pending.pending_count(), 1);

        assert!(pending.complete(response("1700000000.--0")).is_none());
        assert_eq!(pending.pending_count(), 0);

        let message = rx.await.unwrap();
        assert_eq!(message.tag(), Some("1700000000.--0"));
    }

    #[tokio::test]
    async fn test_unclaimed_message_is_returned() {
        let pending = PendingRequests::new();
        let message = response("nobody-waiting");
        assert_eq!(pending.complete(message.clone()), Some(message));
    }

    #[tokio::test]
    async fn test_challenge_goes_to_kind_waiter() {
        let pending = PendingRequests::new();
        let rx = pending.register_kind(WaitKind::Challenge);

        let challenge = Message::Challenge(Challenge {
            tag: None,
            data: serde_json::json!({"pairingCode": "123456"}),
        });
        assert!(pending.complete(challenge).is_none());

        match rx.await.unwrap() {
            Message::Challenge(c) => assert_eq!(c.data["pairingCode"], "123456"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_all_fails_waiters() {
        let pending = PendingRequests::new();
        let rx = pending.register_tag("t");
        pending.cancel_all();
        assert!(rx.await.is_err());
    }
}
