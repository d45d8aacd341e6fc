//! Core application configuration types.
//!
//! Provides the validated [`Config`] with its sub-configurations for
//! aggregation thresholds ([`AggregationConfig`]), the conversational agent
//! ([`AgentConfig`]), and the generative fusion analyst ([`AnalystConfig`]).

use serde::{Deserialize, Serialize};

/// Thresholds driving zone/group aggregation and alerting.
///
/// The defaults mirror the demo deployment; they are not clinically
/// validated values.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AggregationConfig {
    /// Per-device score above which a device counts as anomalous.
    pub anomaly_threshold: f64,

    /// Zone/group average score above which a correlated pattern is flagged.
    pub community_anomaly_threshold: f64,

    /// Minimum anomalous devices for a correlated pattern.
    pub community_min_affected: usize,

    /// Interval in seconds between aggregation sweeps over live zones.
    pub zone_aggregation_window_secs: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: 0.5,
            community_anomaly_threshold: 0.6,
            community_min_affected: 3,
            zone_aggregation_window_secs: 300,
        }
    }
}

/// Credentials and voice settings for the external conversational agent
/// and its TTS sibling.
///
/// Empty strings mean the feature is not configured; the session engine
/// degrades the conversational and TTS paths to no-ops in that case.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    /// Conversational agent WebSocket endpoint.
    pub endpoint: String,

    /// TTS streaming HTTP endpoint base.
    pub tts_endpoint: String,

    /// API key for the agent/TTS vendor.
    pub api_key: String,

    /// Agent id used for normal-mode conversations.
    pub agent_id: String,

    /// Agent id used for distress-mode conversations. Falls back to
    /// `agent_id` when empty.
    pub distress_agent_id: String,

    /// Voice id for standalone TTS playback (media narration).
    pub tts_voice_id: String,

    /// TTS model id.
    pub tts_model_id: String,

    /// TTS output format (PCM16 @ 16 kHz for the watch).
    pub tts_output_format: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.elevenlabs.io/v1/convai/conversation".to_string(),
            tts_endpoint: "https://api.elevenlabs.io/v1/text-to-speech".to_string(),
            api_key: String::new(),
            agent_id: String::new(),
            distress_agent_id: String::new(),
            tts_voice_id: String::new(),
            tts_model_id: "eleven_turbo_v2_5".to_string(),
            tts_output_format: "pcm_16000".to_string(),
        }
    }
}

impl AgentConfig {
    /// Whether the conversational agent can be used at all.
    pub fn agent_available(&self) -> bool {
        !self.api_key.is_empty() && !self.agent_id.is_empty()
    }

    /// Whether standalone TTS playback can be used.
    pub fn tts_available(&self) -> bool {
        !self.api_key.is_empty() && !self.tts_voice_id.is_empty()
    }

    /// Selects the agent id for a session mode, falling back to the
    /// normal agent when no distress agent is configured.
    pub fn agent_id_for_distress(&self, distress: bool) -> &str {
        if distress && !self.distress_agent_id.is_empty() {
            &self.distress_agent_id
        } else {
            &self.agent_id
        }
    }
}

/// Settings for the external generative model used in episode fusion.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AnalystConfig {
    /// API key. Empty means threshold fusion only.
    pub api_key: String,

    /// Model name.
    pub model: String,

    /// Endpoint base URL.
    pub endpoint: String,
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }
}

/// Configuration for the Pulseguard server.
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    // Server
    /// Preferred port for the HTTP/WS server (0 = auto-allocate).
    pub preferred_port: u16,

    /// Allowed CORS origins for dashboard clients.
    pub cors_origins: Vec<String>,

    /// External transactional store URL. Consumed by the store
    /// collaborator; the core keeps no rows itself.
    pub database_url: String,

    // WebSocket
    /// Seconds a pending socket may remain unauthenticated before it is
    /// closed with code 4001.
    pub ws_auth_timeout_secs: u64,

    /// Capacity of each connection's outbound frame queue.
    pub outbound_queue_capacity: usize,

    // Inference
    /// Worker slots for the model-inference collaborator.
    pub inference_workers: usize,

    // Aggregation / alerting
    /// Aggregation thresholds.
    pub aggregation: AggregationConfig,

    // External collaborators
    /// Conversational agent and TTS settings.
    pub agent: AgentConfig,

    /// Generative fusion analyst settings.
    pub analyst: AnalystConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preferred_port: 0,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:3001".to_string(),
            ],
            database_url: String::new(),
            ws_auth_timeout_secs: 30,
            outbound_queue_capacity: 256,
            inference_workers: 2,
            aggregation: AggregationConfig::default(),
            agent: AgentConfig::default(),
            analyst: AnalystConfig::default(),
        }
    }
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.ws_auth_timeout_secs == 0 {
            return Err("ws_auth_timeout_secs must be >= 1".to_string());
        }
        if self.outbound_queue_capacity == 0 {
            return Err("outbound_queue_capacity must be >= 1".to_string());
        }
        if self.inference_workers == 0 {
            return Err("inference_workers must be >= 1 (semaphore permits)".to_string());
        }
        if !(0.0..=1.0).contains(&self.aggregation.anomaly_threshold) {
            return Err("anomaly_threshold must be within [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.aggregation.community_anomaly_threshold) {
            return Err("community_anomaly_threshold must be within [0, 1]".to_string());
        }
        if self.aggregation.community_min_affected == 0 {
            return Err("community_min_affected must be >= 1".to_string());
        }
        Ok(())
    }
}
