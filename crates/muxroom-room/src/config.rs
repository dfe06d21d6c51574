//! Room configuration

use muxroom_proto::PeerId;
use muxroom_rpc::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Who may use the room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyMode {
    /// Anyone may connect, announce and open tunnels
    #[default]
    Open,
    /// Anyone may connect and open tunnels; only members may announce
    Community,
    /// Only members may connect
    Restricted,
}

/// Relay behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Tear a tunnel down when neither side sent anything for this long
    pub idle_timeout: Option<Duration>,
}

impl RelayConfig {
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

/// Room server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Human readable name returned by `room.metadata`
    #[serde(default = "default_name")]
    pub name: String,

    /// Identity of the room itself; connections from it are treated as members
    pub room_id: PeerId,

    #[serde(default)]
    pub privacy_mode: PrivacyMode,

    /// Initial member list
    #[serde(default)]
    pub members: Vec<PeerId>,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub relay: RelayConfig,
}

fn default_name() -> String {
    "muxroom".to_string()
}

impl RoomConfig {
    pub fn new(room_id: impl Into<PeerId>) -> Self {
        Self {
            name: default_name(),
            room_id: room_id.into(),
            privacy_mode: PrivacyMode::default(),
            members: Vec::new(),
            connection: ConnectionConfig::default(),
            relay: RelayConfig::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_privacy_mode(mut self, mode: PrivacyMode) -> Self {
        self.privacy_mode = mode;
        self
    }

    pub fn with_members(mut self, members: impl IntoIterator<Item = PeerId>) -> Self {
        self.members.extend(members);
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config: RoomConfig = serde_json::from_str(
            r#"{"room_id": "@room.ed25519", "privacy_mode": "community"}"#,
        )
        .unwrap();

        assert_eq!(config.room_id, PeerId::from("@room.ed25519"));
        assert_eq!(config.privacy_mode, PrivacyMode::Community);
        assert_eq!(config.name, "muxroom");
        assert!(config.members.is_empty());
        assert_eq!(config.relay.idle_timeout, None);
        assert_eq!(config.connection, ConnectionConfig::default());
    }

    #[test]
    fn test_builder() {
        let config = RoomConfig::new("@room.ed25519")
            .with_name("hub")
            .with_privacy_mode(PrivacyMode::Restricted)
            .with_members([PeerId::from("@alice.ed25519")])
            .with_relay(RelayConfig::default().with_idle_timeout(Duration::from_secs(30)));

        assert_eq!(config.name, "hub");
        assert_eq!(config.members.len(), 1);
        assert_eq!(config.relay.idle_timeout, Some(Duration::from_secs(30)));
    }
}
