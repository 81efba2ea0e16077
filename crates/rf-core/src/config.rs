//! Session configuration
//!
//! Loaded from JSON; every field falls back to its default when missing.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{MixerError, MixerResult};

/// Per-application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session display name
    pub name: String,
    /// Channel count inherited by every node without its own
    pub channel_count: usize,
    /// Upper bound accepted by `set_channel_count`
    pub max_channel_count: usize,
    /// Hardware output buses; private buses are allocated after these
    pub hardware_output_channels: usize,
    /// Hardware input buses, following the outputs
    pub hardware_input_channels: usize,
    /// Register metering callbacks on track stages
    pub meters_enabled: bool,
    /// Initial gain of newly created sends
    pub default_send_gain: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "Session".into(),
            channel_count: 2,
            max_channel_count: 8,
            hardware_output_channels: 8,
            hardware_input_channels: 8,
            meters_enabled: true,
            default_send_gain: 1.0,
        }
    }
}

impl SessionConfig {
    /// Single-channel session
    pub fn mono() -> Self {
        Self {
            channel_count: 1,
            ..Default::default()
        }
    }

    /// 5.1 surround session
    pub fn surround() -> Self {
        Self {
            channel_count: 6,
            hardware_output_channels: 16,
            ..Default::default()
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> MixerResult<()> {
        self.check_channel_count(self.channel_count)?;
        if self.max_channel_count == 0 {
            return Err(MixerError::Config("max_channel_count must be positive".into()));
        }
        if self.channel_count * 2 > self.hardware_output_channels {
            return Err(MixerError::Config(format!(
                "{} hardware outputs cannot hold master and cue at {} channels",
                self.hardware_output_channels, self.channel_count
            )));
        }
        Ok(())
    }

    /// Check a channel count against `1..=max_channel_count`
    pub fn check_channel_count(&self, count: usize) -> MixerResult<()> {
        if count == 0 || count > self.max_channel_count {
            return Err(MixerError::InvalidChannelCount(count));
        }
        Ok(())
    }

    /// First bus available for private allocation
    pub fn first_private_bus(&self) -> u32 {
        (self.hardware_output_channels + self.hardware_input_channels) as u32
    }

    pub fn from_json(json: &str) -> MixerResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| MixerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> MixerResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| MixerError::Config(e.to_string()))
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> MixerResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        log::debug!("loaded session config '{}' from {}", config.name, path.display());
        Ok(config)
    }

    /// Save to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> MixerResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.channel_count, 2);
        assert_eq!(config.first_private_bus(), 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SessionConfig::from_json(r#"{ "channel_count": 1 }"#).unwrap();
        assert_eq!(config.channel_count, 1);
        assert_eq!(config.max_channel_count, 8);
        assert!(config.meters_enabled);
    }

    #[test]
    fn test_rejects_bad_channel_count() {
        let result = SessionConfig::from_json(r#"{ "channel_count": 9 }"#);
        assert!(matches!(result, Err(MixerError::InvalidChannelCount(9))));
        let result = SessionConfig::from_json(r#"{ "channel_count": 0 }"#);
        assert!(matches!(result, Err(MixerError::InvalidChannelCount(0))));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let result = SessionConfig::from_json("{ channel_count: ");
        assert!(matches!(result, Err(MixerError::Config(_))));
    }

    #[test]
    fn test_presets() {
        assert_eq!(SessionConfig::mono().channel_count, 1);
        assert!(SessionConfig::surround().validate().is_ok());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let config = SessionConfig {
            name: "Live".into(),
            meters_enabled: false,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let result = SessionConfig::load("/nonexistent/session.json");
        assert!(matches!(result, Err(MixerError::Io(_))));
    }
}
