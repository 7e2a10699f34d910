//! JID (Jabber ID) types.
//!
//! JIDs identify users, groups and broadcast lists on the chat service.

use std::fmt;
use std::str::FromStr;

/// Known JID servers.
pub mod servers {
    pub const DEFAULT_USER: &str = "s.whatsapp.net";
    pub const GROUP: &str = "g.us";
    pub const LEGACY_USER: &str = "c.us";
    pub const BROADCAST: &str = "broadcast";
}

/// MessageID is the client-generated ID of a chat message.
pub type MessageID = String;

/// JID represents an addressable identity.
///
/// There are two shapes:
/// - Regular JID pairs (user and server)
/// - AD-JIDs (user, agent and device) addressing one device of a user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct JID {
    pub user: String,
    pub raw_agent: u8,
    pub device: u16,
    pub server: String,
}

impl JID {
    /// Creates a new regular JID.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            ..Default::default()
        }
    }

    /// Creates a user JID on the default server.
    pub fn user(user: impl Into<String>) -> Self {
        Self::new(user, servers::DEFAULT_USER)
    }

    /// Creates a group JID.
    pub fn group(id: impl Into<String>) -> Self {
        Self::new(id, servers::GROUP)
    }

    /// Returns a version of the JID without agent and device.
    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server.clone(),
            ..Default::default()
        }
    }

    /// Returns true for group JIDs.
    pub fn is_group(&self) -> bool {
        self.server == servers::GROUP
    }

    /// Returns true if this is a broadcast list (not status broadcast).
    pub fn is_broadcast_list(&self) -> bool {
        self.server == servers::BROADCAST && self.user != "status"
    }

    /// Returns true if the JID is empty (no server).
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }
}

impl fmt::Display for JID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw_agent > 0 {
            write!(
                f,
                "{}.{}:{}@{}",
                self.user, self.raw_agent, self.device, self.server
            )
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

/// Error type for JID parsing
#[derive(Debug, Clone, PartialEq)]
pub struct ParseJIDError(pub String);

impl fmt::Display for ParseJIDError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse JID: {}", self.0)
    }
}

impl std::error::Error for ParseJIDError {}

impl FromStr for JID {
    type Err = ParseJIDError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('@').collect();

        if parts.len() == 1 {
            return Ok(JID::new("", parts[0]));
        }
        if parts.len() > 2 {
            return Err(ParseJIDError("unexpected number of @ signs in JID".to_string()));
        }

        let user_str = parts[0].to_string();
        let server = parts[1].to_string();

        let mut jid = JID {
            user: user_str.clone(),
            server,
            ..Default::default()
        };

        // AD JID format: user.agent:device@server
        if user_str.contains('.') {
            let user_parts: Vec<&str> = user_str.split('.').collect();
            if user_parts.len() != 2 {
                return Err(ParseJIDError("unexpected number of dots in JID".to_string()));
            }
            jid.user = user_parts[0].to_string();
            let ad = user_parts[1];

            let ad_parts: Vec<&str> = ad.split(':').collect();
            if ad_parts.len() > 2 {
                return Err(ParseJIDError("unexpected number of colons in JID".to_string()));
            }

            jid.raw_agent = ad_parts[0]
                .parse()
                .map_err(|_| ParseJIDError("failed to parse agent from JID".to_string()))?;

            if ad_parts.len() == 2 {
                jid.device = ad_parts[1]
                    .parse()
                    .map_err(|_| ParseJIDError("failed to parse device from JID".to_string()))?;
            }
        } else if user_str.contains(':') {
            let user_parts: Vec<&str> = user_str.split(':').collect();
            if user_parts.len() != 2 {
                return Err(ParseJIDError("unexpected number of colons in JID".to_string()));
            }
            jid.user = user_parts[0].to_string();
            jid.device = user_parts[1]
                .parse()
                .map_err(|_| ParseJIDError("failed to parse device from JID".to_string()))?;
        }

        Ok(jid)
    }
}

// Common JIDs
lazy_static::lazy_static! {
    pub static ref EMPTY_JID: JID = JID::default();
    pub static ref GROUP_SERVER_JID: JID = JID::new("", servers::GROUP);
    pub static ref SERVER_JID: JID = JID::new("", servers::DEFAULT_USER);
    pub static ref BROADCAST_SERVER_JID: JID = JID::new("", servers::BROADCAST);
    pub static ref STATUS_BROADCAST_JID: JID = JID::new("status", servers::BROADCAST);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_jid() {
        let jid: JID = "1234567890@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.server, servers::DEFAULT_USER);
        assert_eq!(jid.device, 0);
        assert_eq!(jid.raw_agent, 0);
    }

    #[test]
    fn test_parse_device_jid() {
        let jid: JID = "1234567890:2@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.server, servers::DEFAULT_USER);
        assert_eq!(jid.device, 2);
    }

    #[test]
    fn test_parse_ad_jid() {
        let jid: JID = "1234567890.0:1@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.raw_agent, 0);
        assert_eq!(jid.device, 1);
    }

    #[test]
    fn test_jid_to_string() {
        let jid = JID::user("1234567890");
        assert_eq!(jid.to_string(), "1234567890@s.whatsapp.net");

        let jid = JID {
            user: "1234567890".to_string(),
            device: 2,
            server: servers::DEFAULT_USER.to_string(),
            ..Default::default()
        };
        assert_eq!(jid.to_string(), "1234567890:2@s.whatsapp.net");
    }

    #[test]
    fn test_group_jid() {
        let jid: JID = "123456789-1234567890@g.us".parse().unwrap();
        assert_eq!(jid.user, "123456789-1234567890");
        assert_eq!(jid.server, servers::GROUP);
        assert!(jid.is_group());
    }

    #[test]
    fn test_to_non_ad_drops_device() {
        let jid: JID = "1234567890:7@s.whatsapp.net".parse().unwrap();
        let bare = jid.to_non_ad();
        assert_eq!(bare.device, 0);
        assert_eq!(bare.to_string(), "1234567890@s.whatsapp.net");
    }
}
