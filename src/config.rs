//! Client configuration.
//!
//! Loaded from an optional TOML file; every field has a default so an empty
//! file (or none at all) yields a usable client.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket URL of the signaling relay
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,

    /// Room to join on startup
    #[serde(default)]
    pub room_id: Option<String>,

    /// Display name announced to other participants
    #[serde(default = "default_username")]
    pub username: String,

    /// STUN/TURN urls handed to every peer connection
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,

    /// Period of the adaptive bitrate loop
    #[serde(default = "default_quality_interval_ms")]
    pub quality_interval_ms: u64,

    /// Period of the speaking detector
    #[serde(default = "default_audio_sample_interval_ms")]
    pub audio_sample_interval_ms: u64,

    /// How many times to poll for the local capture stream
    #[serde(default = "default_local_stream_attempts")]
    pub local_stream_attempts: u32,

    #[serde(default = "default_local_stream_retry_ms")]
    pub local_stream_retry_ms: u64,
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}

fn default_username() -> String {
    format!("guest-{:04}", rand::thread_rng().gen_range(0..10_000))
}

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

fn default_quality_interval_ms() -> u64 {
    8_000
}

fn default_audio_sample_interval_ms() -> u64 {
    100
}

fn default_local_stream_attempts() -> u32 {
    5
}

fn default_local_stream_retry_ms() -> u64 {
    1_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: default_signaling_url(),
            room_id: None,
            username: default_username(),
            ice_servers: default_ice_servers(),
            quality_interval_ms: default_quality_interval_ms(),
            audio_sample_interval_ms: default_audio_sample_interval_ms(),
            local_stream_attempts: default_local_stream_attempts(),
            local_stream_retry_ms: default_local_stream_retry_ms(),
        }
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(Error::Config("username must not be empty".into()));
        }
        if self.quality_interval_ms == 0 || self.audio_sample_interval_ms == 0 {
            return Err(Error::Config("sampling intervals must be positive".into()));
        }
        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::Config(format!(
                "signaling url must be ws:// or wss://, got {}",
                self.signaling_url
            )));
        }
        Ok(())
    }

    pub fn local_stream_retry(&self) -> Duration {
        Duration::from_millis(self.local_stream_retry_ms)
    }

    /// The subset of settings the coordinator works from.
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            username: self.username.clone(),
            quality_interval: Duration::from_millis(self.quality_interval_ms),
            audio_sample_interval: Duration::from_millis(self.audio_sample_interval_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub username: String,
    pub quality_interval: Duration,
    pub audio_sample_interval: Duration,
}

impl CoordinatorConfig {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        ClientConfig::default().coordinator()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config.signaling_url, "ws://127.0.0.1:8080");
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.quality_interval_ms, 8_000);
        assert_eq!(config.audio_sample_interval_ms, 100);
        assert_eq!(config.local_stream_attempts, 5);
        assert!(config.username.starts_with("guest-"));
        assert!(config.room_id.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_overrides() {
        let config: ClientConfig = toml::from_str(
            r#"
            username = "alice"
            room_id = "standup"
            quality_interval_ms = 4000
            "#,
        )
        .unwrap();

        let coordinator = config.coordinator();
        assert_eq!(coordinator.username, "alice");
        assert_eq!(coordinator.quality_interval, Duration::from_secs(4));
        assert_eq!(coordinator.audio_sample_interval, Duration::from_millis(100));
        assert_eq!(config.room_id.as_deref(), Some("standup"));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.signaling_url = "http://relay".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ClientConfig::default();
        config.quality_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
