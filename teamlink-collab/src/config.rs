//! Client configuration.
//!
//! Values come from `TEAMLINK_*` environment variables (optionally seeded
//! from a `.env` file) and fall back to the defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::ReconnectPolicy;

/// How concurrent edits are meant to be reconciled. Carried for the host
/// editor; the session layer forwards operations without merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    #[default]
    Automatic,
    Manual,
    LastWriterWins,
}

/// What to do with an inbound operation whose version does not advance
/// the locally tracked one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionPolicy {
    /// Adopt the peer's version as-is, even on gaps or regressions.
    #[default]
    Trust,
    /// Drop operations that do not advance the version and report a conflict.
    RejectStale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Viewer,
    #[default]
    Editor,
    Admin,
}

/// Collaboration client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// WebSocket endpoint of the collaboration relay
    pub server_url: String,
    /// Display name; empty means "Anonymous"
    pub user_name: String,
    /// Master switch; a disabled client refuses to connect or enter sessions
    pub enabled: bool,
    // Host-UI hints: carried for the embedding editor, never read here.
    pub auto_connect: bool,
    pub show_presence: bool,
    pub show_typing_indicator: bool,
    pub chat_enabled: bool,
    pub comments_enabled: bool,
    /// Include resolved comments in `get_comments`
    pub comments_show_resolved: bool,
    pub sync_enabled: bool,
    pub conflict_resolution: ConflictResolution,
    pub version_policy: VersionPolicy,
    // Carried for the host and the relay operator; the client does not
    // enforce roles, invites or transport encryption.
    pub default_role: ParticipantRole,
    pub require_invite: bool,
    pub encrypt_communication: bool,
    pub max_participants: usize,
    /// How often the host should coalesce local edits into operations
    pub sync_throttle_ms: u64,
    pub connect_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub outbound_queue_capacity: usize,
    pub event_capacity: usize,
    pub message_history_limit: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/collaboration".to_string(),
            user_name: String::new(),
            enabled: true,
            auto_connect: true,
            show_presence: true,
            show_typing_indicator: true,
            chat_enabled: true,
            comments_enabled: true,
            comments_show_resolved: false,
            sync_enabled: true,
            conflict_resolution: ConflictResolution::default(),
            version_policy: VersionPolicy::default(),
            default_role: ParticipantRole::default(),
            require_invite: true,
            encrypt_communication: true,
            max_participants: 10,
            sync_throttle_ms: 100,
            connect_timeout_ms: 10_000,
            join_timeout_ms: 10_000,
            reconnect_base_delay_ms: 1_000,
            max_reconnect_attempts: 5,
            outbound_queue_capacity: 256,
            event_capacity: 256,
            message_history_limit: 1_000,
        }
    }
}

impl CollabConfig {
    pub const ENV_PREFIX: &'static str = "TEAMLINK_";

    /// Load from `TEAMLINK_*` environment variables, reading `.env` first
    /// if one exists. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self::from_env()?;
        log::info!("Configuration loaded (server {})", config.server_url);
        Ok(config)
    }

    /// Load from the process environment only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = envy::prefixed(Self::ENV_PREFIX).from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from explicit key/value pairs (keys without prefix).
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(pairs)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=50).contains(&self.max_participants) {
            return Err(ConfigError::invalid("max_participants", "must be between 2 and 50"));
        }
        if !(50..=1_000).contains(&self.sync_throttle_ms) {
            return Err(ConfigError::invalid("sync_throttle_ms", "must be between 50 and 1000"));
        }
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err(ConfigError::invalid("server_url", "must be a ws:// or wss:// URL"));
        }
        if self.outbound_queue_capacity == 0 || self.event_capacity == 0 {
            return Err(ConfigError::invalid("outbound_queue_capacity", "queues need capacity"));
        }
        Ok(())
    }

    /// Display name with the "Anonymous" fallback applied.
    pub fn display_name(&self) -> &str {
        let trimmed = self.user_name.trim();
        if trimmed.is_empty() {
            "Anonymous"
        } else {
            trimmed
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn sync_throttle(&self) -> Duration {
        Duration::from_millis(self.sync_throttle_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable error: {0}")]
    Env(#[from] envy::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.server_url, "ws://localhost:8080/collaboration");
        assert_eq!(config.display_name(), "Anonymous");
        assert_eq!(config.max_participants, 10);
        assert_eq!(config.sync_throttle(), Duration::from_millis(100));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.join_timeout(), Duration::from_secs(10));
        assert_eq!(config.conflict_resolution, ConflictResolution::Automatic);
        assert_eq!(config.version_policy, VersionPolicy::Trust);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_pairs_overrides() {
        let config = CollabConfig::from_pairs(pairs(&[
            ("SERVER_URL", "wss://collab.example.com/ws"),
            ("USER_NAME", "  Alice "),
            ("CONFLICT_RESOLUTION", "last-writer-wins"),
            ("VERSION_POLICY", "reject-stale"),
            ("MAX_PARTICIPANTS", "25"),
            ("DEFAULT_ROLE", "viewer"),
        ]))
        .unwrap();

        assert_eq!(config.server_url, "wss://collab.example.com/ws");
        assert_eq!(config.display_name(), "Alice");
        assert_eq!(config.conflict_resolution, ConflictResolution::LastWriterWins);
        assert_eq!(config.version_policy, VersionPolicy::RejectStale);
        assert_eq!(config.max_participants, 25);
        assert_eq!(config.default_role, ParticipantRole::Viewer);
        // Untouched fields keep their defaults.
        assert_eq!(config.join_timeout_ms, 10_000);
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let err = CollabConfig::from_pairs(pairs(&[("MAX_PARTICIPANTS", "51")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_participants", .. }));

        let err = CollabConfig::from_pairs(pairs(&[("SYNC_THROTTLE_MS", "10")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "sync_throttle_ms", .. }));

        let err = CollabConfig::from_pairs(pairs(&[("SERVER_URL", "http://x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "server_url", .. }));
    }

    #[test]
    fn test_bad_enum_value_is_env_error() {
        let err = CollabConfig::from_pairs(pairs(&[("CONFLICT_RESOLUTION", "merge")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env(_)));
    }

    #[test]
    fn test_reconnect_policy_from_config() {
        let config = CollabConfig { reconnect_base_delay_ms: 250, max_reconnect_attempts: 3, ..CollabConfig::default() };
        let policy = config.reconnect_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_attempts, 3);
    }
}
