//! Client socket message grammar.
//!
//! Inbound text frames are JSON with a `type` discriminator, modeled as a
//! tagged [`ClientMessage`] enum with a validating parser. Outbound frames
//! are built from [`ServerMessage`] via [`ServerMessage::to_frame`].
//!
//! Canonical vitals casing on the wire is snake_case; camelCase spellings
//! are accepted on decode via serde aliases (compatibility shim for older
//! watch firmware).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::aggregation::AggregationSnapshot;
use crate::services::alerts::Alert;
use crate::services::episodes::{Episode, EpisodePhase, Resolution};

// ─────────────────────────────────────────────────────────────────────────────
// Close codes
// ─────────────────────────────────────────────────────────────────────────────

/// Pending socket failed to authenticate within the timeout.
pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;
/// An older socket for the same device id was evicted by a newer one.
pub const CLOSE_SUPERSEDED: u16 = 4002;
/// Pairing was cancelled by the caregiver while the watch waited.
pub const CLOSE_PAIRING_CANCELLED: u16 = 4003;

// ─────────────────────────────────────────────────────────────────────────────
// Shared vitals payloads
// ─────────────────────────────────────────────────────────────────────────────

fn default_acceleration() -> f64 {
    1.0
}

fn default_skin_temp() -> f64 {
    36.5
}

fn default_checkin_message() -> String {
    "I'm okay!".to_string()
}

/// Biometric sample attached to a health message or an episode trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vitals {
    #[serde(default, alias = "heartRate")]
    pub heart_rate: f64,
    #[serde(default)]
    pub hrv: f64,
    #[serde(default = "default_acceleration")]
    pub acceleration: f64,
    #[serde(default = "default_skin_temp", alias = "skinTemp")]
    pub skin_temp: f64,
}

impl Default for Vitals {
    fn default() -> Self {
        Self {
            heart_rate: 0.0,
            hrv: 0.0,
            acceleration: default_acceleration(),
            skin_temp: default_skin_temp(),
        }
    }
}

/// Anomaly trigger that opens an episode.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TriggerVitals {
    #[serde(flatten)]
    pub vitals: Vitals,
    #[serde(default, alias = "anomalyScore")]
    pub anomaly_score: Option<f64>,
    #[serde(default, alias = "anomalyType")]
    pub anomaly_type: Option<String>,
}

/// Visual check-in result from the phone camera collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresageReading {
    #[serde(default, alias = "visualHeartRate")]
    pub visual_heart_rate: f64,
    #[serde(default, alias = "breathingRate")]
    pub breathing_rate: f64,
    #[serde(default = "PresageReading::default_expression", alias = "facialExpression")]
    pub facial_expression: String,
    #[serde(default, alias = "blinkRate")]
    pub blink_rate: f64,
    #[serde(default = "PresageReading::default_eye", alias = "eyeResponsiveness")]
    pub eye_responsiveness: String,
    #[serde(default = "PresageReading::default_confidence", alias = "confidenceScore")]
    pub confidence_score: f64,
}

impl PresageReading {
    fn default_expression() -> String {
        "calm".to_string()
    }

    fn default_eye() -> String {
        "normal".to_string()
    }

    fn default_confidence() -> f64 {
        0.5
    }
}

impl Default for PresageReading {
    fn default() -> Self {
        Self {
            visual_heart_rate: 0.0,
            breathing_rate: 0.0,
            facial_expression: Self::default_expression(),
            blink_rate: 0.0,
            eye_responsiveness: Self::default_eye(),
            confidence_score: Self::default_confidence(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound messages
// ─────────────────────────────────────────────────────────────────────────────

/// Role a relay connection registers as.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelayRole {
    Watch,
    Mobile,
}

/// Role requested at authentication time.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthRole {
    #[default]
    Device,
    Watch,
    Caregiver,
    Mobile,
}

/// Incoming socket message envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "authenticate")]
    Authenticate {
        device_id: String,
        user_id: String,
        #[serde(default)]
        zone_ids: Vec<String>,
        #[serde(default)]
        group_ids: Vec<String>,
        #[serde(default)]
        role: AuthRole,
        #[serde(default)]
        token: Option<String>,
    },

    /// Legacy relay shim role registration.
    #[serde(rename = "register")]
    Register { role: RelayRole },

    #[serde(rename = "subscribe-group")]
    SubscribeGroup {
        #[serde(rename = "groupId", alias = "group_id")]
        group_id: String,
    },

    #[serde(rename = "ping")]
    Ping,

    /// Single reading; triggers inference and dashboard fan-out.
    #[serde(rename = "health_data", alias = "health-update")]
    HealthData {
        #[serde(flatten)]
        vitals: Vitals,
        #[serde(default)]
        timestamp: Option<u64>,
    },

    /// Full W×F window for one-shot inference.
    #[serde(rename = "health_batch")]
    HealthBatch { window: Vec<Vec<f32>> },

    /// Wearer-triggered session start from the watch.
    #[serde(rename = "command")]
    Command,

    #[serde(rename = "caregiver-event")]
    CaregiverEvent {
        event: String,
        #[serde(default)]
        payload: Value,
    },

    #[serde(rename = "caregiver-call-start")]
    CaregiverCallStart,

    #[serde(rename = "caregiver-call-end")]
    CaregiverCallEnd,

    #[serde(rename = "cancel-pairing")]
    CancelPairing {
        #[serde(rename = "pairingCode")]
        pairing_code: String,
    },

    #[serde(rename = "reconnect-request")]
    ReconnectRequest,

    #[serde(rename = "reconnect-approve")]
    ReconnectApprove {
        #[serde(rename = "deviceId")]
        device_id: String,
    },

    #[serde(rename = "reconnect-reject")]
    ReconnectReject {
        #[serde(rename = "deviceId")]
        device_id: String,
    },

    #[serde(rename = "deadman-cancel")]
    DeadmanCancel {
        #[serde(rename = "pendingId")]
        pending_id: String,
    },

    #[serde(rename = "media-event")]
    MediaEvent {
        event: String,
        #[serde(default)]
        payload: Value,
    },

    #[serde(rename = "tts-playback-complete")]
    TtsPlaybackComplete,

    #[serde(rename = "pulse-checkin")]
    PulseCheckin {
        #[serde(default)]
        photo_url: String,
        #[serde(default = "default_checkin_message")]
        message: String,
    },

    #[serde(rename = "episode-start")]
    EpisodeStart {
        #[serde(default)]
        trigger: TriggerVitals,
        #[serde(default)]
        group_id: Option<String>,
    },

    #[serde(rename = "episode-calming-done")]
    EpisodeCalmingDone {
        #[serde(default)]
        episode_id: Option<String>,
        #[serde(flatten)]
        vitals: Vitals,
    },

    #[serde(rename = "episode-presage-result")]
    EpisodePresageResult {
        #[serde(default)]
        episode_id: Option<String>,
        #[serde(flatten)]
        presage: PresageReading,
    },

    #[serde(rename = "episode-resolve")]
    EpisodeResolve {
        #[serde(default)]
        episode_id: Option<String>,
        resolution: Resolution,
    },

    #[serde(rename = "dashboard_subscribe")]
    DashboardSubscribe,
}

/// Message types the router understands; anything else is logged and dropped.
const KNOWN_TYPES: &[&str] = &[
    "authenticate",
    "register",
    "subscribe-group",
    "ping",
    "health_data",
    "health-update",
    "health_batch",
    "command",
    "caregiver-event",
    "caregiver-call-start",
    "caregiver-call-end",
    "cancel-pairing",
    "reconnect-request",
    "reconnect-approve",
    "reconnect-reject",
    "deadman-cancel",
    "media-event",
    "tts-playback-complete",
    "pulse-checkin",
    "episode-start",
    "episode-calming-done",
    "episode-presage-result",
    "episode-resolve",
    "dashboard_subscribe",
];

/// Outcome of parsing an inbound text frame.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A well-formed, recognized message.
    Message(Box<ClientMessage>),
    /// Not valid JSON, or no string `type` field. Sender gets `{type:error}`.
    InvalidJson,
    /// Recognized `type` but malformed fields. Sender gets `{type:error}`.
    Malformed { msg_type: String, detail: String },
    /// Unrecognized `type`. Logged and dropped.
    UnknownType(String),
}

impl ClientMessage {
    /// Parses an inbound text frame, distinguishing JSON failures,
    /// malformed known messages, and unknown message types.
    pub fn parse(text: &str) -> ParseOutcome {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return ParseOutcome::InvalidJson,
        };
        let msg_type = match value.get("type").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => return ParseOutcome::InvalidJson,
        };
        if !KNOWN_TYPES.contains(&msg_type.as_str()) {
            return ParseOutcome::UnknownType(msg_type);
        }
        match serde_json::from_value::<ClientMessage>(value) {
            Ok(msg) => ParseOutcome::Message(Box::new(msg)),
            Err(e) => ParseOutcome::Malformed {
                msg_type,
                detail: e.to_string(),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound messages
// ─────────────────────────────────────────────────────────────────────────────

/// Outgoing socket messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "authenticated")]
    Authenticated {
        device_id: String,
        user_id: String,
        zone_ids: Vec<String>,
        group_ids: Vec<String>,
    },

    #[serde(rename = "auth_error")]
    AuthError { message: String },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "pong")]
    Pong { timestamp: u64 },

    #[serde(rename = "anomaly_result")]
    AnomalyResult {
        device_id: String,
        score: f64,
        status: String,
        is_anomaly: bool,
    },

    #[serde(rename = "health_update")]
    HealthUpdate {
        device_id: String,
        reading: Value,
        anomaly: Value,
    },

    #[serde(rename = "group-health-update")]
    GroupHealthUpdate {
        #[serde(rename = "groupId")]
        group_id: String,
        snapshot: AggregationSnapshot,
    },

    #[serde(rename = "alert")]
    Alert { alert: Alert },

    #[serde(rename = "zone_alert")]
    ZoneAlert { alert: Alert },

    #[serde(rename = "group-alert")]
    GroupAlert {
        #[serde(rename = "groupId")]
        group_id: String,
        alert: Alert,
    },

    #[serde(rename = "alert_resolved")]
    AlertResolved { alert_id: String },

    #[serde(rename = "device_connected")]
    DeviceConnected {
        device_id: String,
        user_id: String,
        zone_ids: Vec<String>,
        total_devices: usize,
    },

    #[serde(rename = "device_disconnected")]
    DeviceDisconnected {
        device_id: String,
        total_devices: usize,
    },

    #[serde(rename = "dashboard_subscribed")]
    DashboardSubscribed { status: Value },

    #[serde(rename = "group-subscribed")]
    GroupSubscribed {
        #[serde(rename = "groupId")]
        group_id: String,
    },

    #[serde(rename = "episode-started")]
    EpisodeStarted { episode: Episode },

    #[serde(rename = "episode-phase-update")]
    EpisodePhaseUpdate {
        episode_id: String,
        phase: EpisodePhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    #[serde(rename = "episode-update")]
    EpisodeUpdate { episode: Episode },

    #[serde(rename = "episode-resolved")]
    EpisodeResolved {
        episode_id: String,
        resolution: Resolution,
    },

    #[serde(rename = "caregiver-alert")]
    CaregiverAlert {
        episode_id: String,
        user_id: String,
        device_id: String,
        escalation_level: u8,
        level_label: String,
        severity_score: f64,
        phase: EpisodePhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        fusion_result: Option<Value>,
        timestamp: u64,
    },

    #[serde(rename = "ring-episode-alert")]
    RingEpisodeAlert {
        device_id: String,
        member_name: String,
        trigger_type: String,
        phase: String,
    },

    #[serde(rename = "ring-episode-resolved")]
    RingEpisodeResolved {
        device_id: String,
        member_name: String,
        resolution: String,
    },

    #[serde(rename = "ring-pulse-checkin")]
    RingPulseCheckin {
        device_id: String,
        member_name: String,
        photo_url: String,
        message: String,
    },

    #[serde(rename = "tts-end-marker")]
    TtsEndMarker,

    #[serde(rename = "reconnect-approved")]
    ReconnectApproved,

    #[serde(rename = "reconnect-rejected")]
    ReconnectRejected,

    #[serde(rename = "pairing-cancelled")]
    PairingCancelled {
        #[serde(rename = "pairingCode")]
        pairing_code: String,
        #[serde(rename = "cancelledBy")]
        cancelled_by: String,
    },

    #[serde(rename = "deadman-pending")]
    DeadmanPending {
        #[serde(rename = "pendingId")]
        pending_id: String,
        action: String,
        countdown_secs: u64,
    },

    #[serde(rename = "deadman-cancelled")]
    DeadmanCancelled {
        #[serde(rename = "pendingId")]
        pending_id: String,
    },

    #[serde(rename = "media-start")]
    MediaStart { action: String, vibe: String },

    #[serde(rename = "media-stop")]
    MediaStop { action: String },

    #[serde(rename = "media-duck")]
    MediaDuck,

    #[serde(rename = "media-unduck")]
    MediaUnduck,
}

impl ServerMessage {
    /// Serializes the message to a text frame body.
    ///
    /// Returns `None` only if serialization fails, which indicates a bug in
    /// a payload type; the caller drops the frame.
    pub fn to_frame(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(s) => Some(s),
            Err(e) => {
                log::error!("[Protocol] Failed to serialize outbound message: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_authenticate_with_defaults() {
        let out = ClientMessage::parse(r#"{"type":"authenticate","device_id":"d1","user_id":"u1"}"#);
        match out {
            ParseOutcome::Message(msg) => match *msg {
                ClientMessage::Authenticate {
                    device_id,
                    user_id,
                    zone_ids,
                    role,
                    ..
                } => {
                    assert_eq!(device_id, "d1");
                    assert_eq!(user_id, "u1");
                    assert!(zone_ids.is_empty());
                    assert_eq!(role, AuthRole::Device);
                }
                other => panic!("unexpected message: {:?}", other),
            },
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn parse_accepts_camel_case_vitals() {
        let out = ClientMessage::parse(
            r#"{"type":"health_data","heartRate":95.0,"hrv":40.0,"skinTemp":36.9}"#,
        );
        match out {
            ParseOutcome::Message(msg) => match *msg {
                ClientMessage::HealthData { vitals, .. } => {
                    assert_eq!(vitals.heart_rate, 95.0);
                    assert_eq!(vitals.skin_temp, 36.9);
                    assert_eq!(vitals.acceleration, 1.0);
                }
                other => panic!("unexpected message: {:?}", other),
            },
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn parse_health_update_alias() {
        match ClientMessage::parse(r#"{"type":"health-update","heart_rate":70}"#) {
            ParseOutcome::Message(msg) => {
                assert!(matches!(*msg, ClientMessage::HealthData { .. }));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn parse_invalid_json() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            ParseOutcome::InvalidJson
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"no_type":1}"#),
            ParseOutcome::InvalidJson
        ));
    }

    #[test]
    fn parse_unknown_type_is_dropped_not_errored() {
        match ClientMessage::parse(r#"{"type":"telemetry-v9"}"#) {
            ParseOutcome::UnknownType(t) => assert_eq!(t, "telemetry-v9"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn parse_malformed_known_type() {
        match ClientMessage::parse(r#"{"type":"deadman-cancel"}"#) {
            ParseOutcome::Malformed { msg_type, .. } => assert_eq!(msg_type, "deadman-cancel"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn server_message_tags_match_wire_names() {
        let frame = ServerMessage::Pong { timestamp: 1 }.to_frame().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "pong");

        let frame = ServerMessage::GroupSubscribed {
            group_id: "g1".into(),
        }
        .to_frame()
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "group-subscribed");
        assert_eq!(value["groupId"], "g1");
    }
}
