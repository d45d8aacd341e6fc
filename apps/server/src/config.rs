//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides
//! for the settings that usually differ per deployment.

use std::path::Path;

use anyhow::{Context, Result};
use pulseguard_core::Config as CoreConfig;
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Core service configuration (thresholds, collaborators, timeouts).
    #[serde(flatten)]
    pub core: CoreConfig,
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.core.database_url = val;
        }
        if let Ok(val) = std::env::var("CORS_ORIGINS") {
            self.core.cors_origins = val.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(val) = std::env::var("WS_AUTH_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                self.core.ws_auth_timeout_secs = secs;
            }
        }
        if let Ok(val) = std::env::var("ANOMALY_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                self.core.aggregation.anomaly_threshold = threshold;
            }
        }
        if let Ok(val) = std::env::var("COMMUNITY_ANOMALY_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                self.core.aggregation.community_anomaly_threshold = threshold;
            }
        }
        if let Ok(val) = std::env::var("COMMUNITY_MIN_AFFECTED") {
            if let Ok(count) = val.parse() {
                self.core.aggregation.community_min_affected = count;
            }
        }
        if let Ok(val) = std::env::var("ZONE_AGGREGATION_WINDOW") {
            if let Ok(secs) = val.parse() {
                self.core.aggregation.zone_aggregation_window_secs = secs;
            }
        }
        if let Ok(val) = std::env::var("AGENT_API_KEY") {
            self.core.agent.api_key = val;
        }
        if let Ok(val) = std::env::var("AGENT_ID") {
            self.core.agent.agent_id = val;
        }
        if let Ok(val) = std::env::var("AGENT_DISTRESS_ID") {
            self.core.agent.distress_agent_id = val;
        }
        if let Ok(val) = std::env::var("TTS_VOICE_ID") {
            self.core.agent.tts_voice_id = val;
        }
        if let Ok(val) = std::env::var("ANALYST_API_KEY") {
            self.core.analyst.api_key = val;
        }
        if let Ok(val) = std::env::var("ANALYST_MODEL") {
            self.core.analyst.model = val;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.core.validate().is_ok());
    }

    #[test]
    fn yaml_overrides_defaults() {
        let yaml = "preferred_port: 9000\naggregation:\n  anomaly_threshold: 0.4\n";
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.core.preferred_port, 9000);
        assert_eq!(config.core.aggregation.anomaly_threshold, 0.4);
        // Untouched fields keep their defaults.
        assert_eq!(config.core.ws_auth_timeout_secs, 30);
    }
}
