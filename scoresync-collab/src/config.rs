//! Tunables for a collaboration session and its WebSocket client.

use std::time::Duration;

use serde::Deserialize;

/// Session configuration.
///
/// All durations are in milliseconds so the struct can be loaded straight
/// from JSON or TOML; missing fields fall back to [`SessionConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long an in-flight edit may wait for its acknowledgement before
    /// the session is rejoined.
    pub edit_timeout_ms: u64,
    /// How long a join or status check may wait before the transport is
    /// reported as lost.
    pub sync_timeout_ms: u64,
    /// Idle delay before the local text is compared with the server's.
    pub drift_check_delay_ms: u64,
    /// Acknowledged operations kept for diagnostics.
    pub history_window: usize,
    /// Number of colour bands used for remote presence markers.
    pub marker_bands: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            edit_timeout_ms: 5000,
            sync_timeout_ms: 5000,
            drift_check_delay_ms: 5000,
            history_window: 256,
            marker_bands: 6,
        }
    }
}

impl SessionConfig {
    pub fn edit_timeout(&self) -> Duration {
        Duration::from_millis(self.edit_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn drift_check_delay(&self) -> Duration {
        Duration::from_millis(self.drift_check_delay_ms)
    }
}

/// WebSocket client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://localhost:9090/collab`.
    pub server_url: String,
    /// Capacity of the event channel handed to the application.
    pub event_capacity: usize,
    /// Capacity of the command channel feeding the session task.
    pub command_capacity: usize,
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            event_capacity: 256,
            command_capacity: 256,
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.edit_timeout(), Duration::from_secs(5));
        assert_eq!(config.sync_timeout(), Duration::from_secs(5));
        assert_eq!(config.drift_check_delay(), Duration::from_secs(5));
        assert_eq!(config.marker_bands, 6);
    }

    #[test]
    fn test_partial_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"server_url":"ws://x","session":{"edit_timeout_ms":100}}"#)
                .unwrap();
        assert_eq!(config.server_url, "ws://x");
        assert_eq!(config.session.edit_timeout(), Duration::from_millis(100));
        assert_eq!(config.session.history_window, 256);
        assert_eq!(config.event_capacity, 256);
    }
}
