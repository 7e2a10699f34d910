//! Bocksup: a layered WhatsApp-Web-style protocol stack.
//!
//! Messages travel through a pipeline of layers between the application
//! and the wire: the [`Stack`] on top, an optional end-to-end
//! [`EncryptionLayer`], and a [`Connection`] that frames, sends, and
//! reassembles envelopes over WebSocket (or a TCP+TLS fallback) while
//! keeping the link alive and reconnecting with backoff when it drops.
//!
//! ```no_run
//! use bocksup_rust::{Credentials, EventKind, StackBuilder, StackConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let stack = StackBuilder::new(StackConfig::default().from_env())
//!     .build(Credentials::pairing("15551234567"));
//!
//! stack.on_event(EventKind::PairingCode, |event| {
//!     println!("pair with: {:?}", event);
//! });
//!
//! stack.connect().await?;
//! stack.authenticate().await?;
//! stack.send_text("123@s.whatsapp.net", "hello").await?;
//! stack.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod encryption;
pub mod error;
pub mod layer;
pub mod request;
pub mod stack;
pub mod transport;
pub mod types;
pub mod wire;

pub use auth::{AuthState, Authenticator, Credentials};
pub use config::{ConnectionConfig, EncryptionConfig, StackConfig};
pub use connection::Connection;
pub use encryption::EncryptionLayer;
pub use error::{
    AuthenticationError, ConnectionError, EncryptionError, MessageError, ProtocolError,
    StackError, TimeoutError,
};
pub use layer::{EventHandler, EventHub, Layer, Pipeline};
pub use request::{PendingRequests, WaitKind};
pub use stack::{Stack, StackBuilder};
pub use transport::{Dialer, Frame, NetDialer, Transport};
pub use types::{EventKind, Message, StackEvent, TagGenerator, JID};
pub use wire::Serializer;
