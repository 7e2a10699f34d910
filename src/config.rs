//! Configuration for the protocol stack.
//!
//! Options are grouped the way they appear in configuration files:
//! `connection.*` for transport tuning and `encryption.*` for the key store.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport and reconnection tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// WebSocket chat endpoint.
    pub endpoint: String,
    /// TCP address tried when the WebSocket dial fails.
    pub fallback_addr: String,
    /// Connect and read timeout, in seconds.
    pub timeout: u64,
    /// Idle interval after which a keep-alive is sent, in seconds.
    pub ping_interval: u64,
    /// Maximum reconnection attempts before giving up.
    pub max_retries: u32,
    /// Base delay between reconnection attempts, in seconds.
    pub retry_delay: u64,
    /// User agent advertised on the WebSocket upgrade.
    pub user_agent: String,
    /// Origin header sent on the WebSocket upgrade.
    pub origin: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://web.whatsapp.com/ws/chat".into(),
            fallback_addr: "web.whatsapp.com:443".into(),
            timeout: 30,
            ping_interval: 25,
            max_retries: 5,
            retry_delay: 5,
            user_agent: "WhatsApp/2.2412.54 Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                         AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36"
                .into(),
            origin: "https://web.whatsapp.com".into(),
        }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}

/// End-to-end encryption options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionConfig {
    /// Whether the encryption layer is built into the stack.
    pub enabled: bool,
    /// Directory holding identity.json, sessions.json and pre_keys.json.
    pub key_store_path: PathBuf,
    /// Refuse to overwrite a previously stored peer identity key.
    pub verify_identities: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_store_path: "./keys".into(),
            verify_identities: true,
        }
    }
}

/// Base configuration used by the stack builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    pub connection: ConnectionConfig,
    pub encryption: EncryptionConfig,
}

impl StackConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(std::io::Error::other)
    }

    /// Apply `BOCKSUP_SECTION_KEY` environment overrides, e.g.
    /// `BOCKSUP_CONNECTION_TIMEOUT` for `connection.timeout`.
    pub fn from_env(mut self) -> Self {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok()
        }

        if let Some(v) = var("BOCKSUP_CONNECTION_ENDPOINT") {
            self.connection.endpoint = v;
        }
        if let Some(v) = var("BOCKSUP_CONNECTION_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.connection.timeout = v;
        }
        if let Some(v) = var("BOCKSUP_CONNECTION_PING_INTERVAL").and_then(|v| v.parse().ok()) {
            self.connection.ping_interval = v;
        }
        if let Some(v) = var("BOCKSUP_CONNECTION_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.connection.max_retries = v;
        }
        if let Some(v) = var("BOCKSUP_CONNECTION_RETRY_DELAY").and_then(|v| v.parse().ok()) {
            self.connection.retry_delay = v;
        }
        if let Some(v) = var("BOCKSUP_ENCRYPTION_ENABLED").and_then(|v| v.parse().ok()) {
            self.encryption.enabled = v;
        }
        if let Some(v) = var("BOCKSUP_ENCRYPTION_KEY_STORE_PATH") {
            self.encryption.key_store_path = v.into();
        }
        self
    }

    /// Override the chat endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.connection.endpoint = endpoint.into();
        self
    }

    /// Override the connect/read timeout in seconds.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.connection.timeout = seconds;
        self
    }

    /// Override the keep-alive interval in seconds.
    pub fn with_ping_interval(mut self, seconds: u64) -> Self {
        self.connection.ping_interval = seconds;
        self
    }

    /// Override the reconnection attempt bound.
    pub fn with_max_retries(mut self, attempts: u32) -> Self {
        self.connection.max_retries = attempts;
        self
    }

    /// Override the base reconnection delay in seconds.
    pub fn with_retry_delay(mut self, seconds: u64) -> Self {
        self.connection.retry_delay = seconds;
        self
    }

    /// Enable or disable the encryption layer.
    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encryption.enabled = enabled;
        self
    }

    /// Override the key store directory.
    pub fn with_key_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.encryption.key_store_path = path.into();
        self
    }
}
