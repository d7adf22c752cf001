//! Hub configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tuning knobs for the collaboration hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Outbound mailbox capacity per session; a full mailbox disconnects
    /// the session
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Inbound event queue capacity per room
    #[serde(default = "default_room_queue_capacity")]
    pub room_queue_capacity: usize,

    /// Evict rooms with no members after this many idle seconds
    /// (unset = rooms are kept for the life of the process)
    #[serde(default)]
    pub idle_eviction_secs: Option<u64>,

    /// How often the idle sweep runs
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,

    /// Upper bound on closing a connection after its session ends
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

fn default_mailbox_capacity() -> usize {
    256
}

fn default_room_queue_capacity() -> usize {
    1024
}

fn default_eviction_interval_secs() -> u64 {
    60
}

fn default_close_timeout_ms() -> u64 {
    1000
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            room_queue_capacity: default_room_queue_capacity(),
            idle_eviction_secs: None,
            eviction_interval_secs: default_eviction_interval_secs(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl HubConfig {
    /// Set the per-session mailbox capacity
    #[must_use]
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Enable idle eviction
    #[must_use]
    pub fn with_idle_eviction(mut self, idle: Duration) -> Self {
        self.idle_eviction_secs = Some(idle.as_secs());
        self
    }

    /// Mailbox capacity actually used; a joiner needs room for the roster
    /// and its snapshot
    #[must_use]
    pub fn effective_mailbox_capacity(&self) -> usize {
        self.mailbox_capacity.max(2)
    }

    /// Idle threshold, if eviction is enabled
    #[must_use]
    pub fn idle_eviction(&self) -> Option<Duration> {
        self.idle_eviction_secs.map(Duration::from_secs)
    }

    /// Sweep period
    #[must_use]
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }

    /// Close timeout
    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Reject unusable values
    pub fn validate(&self) -> Result<()> {
        if self.mailbox_capacity == 0 {
            return Err(Error::Config("mailbox_capacity must be positive".into()));
        }
        if self.room_queue_capacity == 0 {
            return Err(Error::Config("room_queue_capacity must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.mailbox_capacity, 256);
        assert!(config.idle_eviction().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: HubConfig = serde_json::from_str(r#"{"idle_eviction_secs": 600}"#).unwrap();
        assert_eq!(config.idle_eviction(), Some(Duration::from_secs(600)));
        assert_eq!(config.room_queue_capacity, 1024);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = HubConfig::default().with_mailbox_capacity(0);
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "config_error");
    }

    #[test]
    fn test_mailbox_capacity_floor() {
        let config = HubConfig::default().with_mailbox_capacity(1);
        assert_eq!(config.effective_mailbox_capacity(), 2);
    }
}
