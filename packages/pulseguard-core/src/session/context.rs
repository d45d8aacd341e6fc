//! Conversation context assembly.
//!
//! Everything the agent needs at connect time (dynamic variables, the
//! first message, recent session log lines) is pre-computed here before
//! the socket opens, so the `open` handler only has to send it.

use std::collections::VecDeque;

use serde_json::{json, Value};

/// Recent session log lines carried into the agent's dynamic context.
const SESSION_LOG_CAP: usize = 30;

pub const DEFAULT_USER_SPEECH_START_REASON: &str = "The user started speaking to you.";
pub const DEFAULT_REGULAR_START_REASON: &str = "Checking in with the user.";
pub const DEFAULT_DISTRESS_START_REASON: &str = "The user may be in distress.";
pub const WATCH_DISCONNECTED_REASON: &str = "Watch disconnected.";
pub const CONVERSATION_CLOSED_REASON: &str = "Conversation closed by agent.";

/// Session mode: distress swaps the agent persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    Normal,
    Distress,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Distress => "distress",
        }
    }
}

/// Bounded in-memory log of session events, rendered into the agent's
/// `session_logs` dynamic variable.
#[derive(Default)]
pub struct SessionLog {
    lines: VecDeque<String>,
}

impl SessionLog {
    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == SESSION_LOG_CAP {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn render(&self) -> String {
        if self.lines.is_empty() {
            "(no recent events)".to_string()
        } else {
            self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Inputs for one init payload.
pub struct InitContext<'a> {
    pub patient_name: &'a str,
    pub caregiver_name: &'a str,
    pub music_playing: bool,
    pub images_displaying: bool,
    pub start_reason: &'a str,
    pub session_logs: String,
    /// `Some("")` silences the agent until the wearer speaks; `None` lets
    /// the agent use its configured default.
    pub first_message: Option<String>,
}

/// Builds the `conversation_initiation_client_data` frame.
pub fn build_init_payload(ctx: &InitContext<'_>) -> Value {
    let mut payload = json!({
        "type": "conversation_initiation_client_data",
        "user_input_audio_format": "pcm_s16le_16000",
        "dynamic_variables": {
            "patient_name": ctx.patient_name,
            "caregiver_name": ctx.caregiver_name,
            "music_playing": ctx.music_playing,
            "images_displaying": ctx.images_displaying,
            "conversation_start_reason": ctx.start_reason,
            "session_logs": ctx.session_logs,
        },
    });
    if let Some(first_message) = &ctx.first_message {
        payload["conversation_config_override"] = json!({
            "agent": {"first_message": first_message},
        });
    }
    payload
}

/// First message for a session's first conversation.
pub fn conversation_opener(patient_name: &str, reason: &str, mode: SessionMode) -> String {
    match mode {
        SessionMode::Distress => format!(
            "Hi {}, I'm here with you. {} Let's take a slow breath together \
             and you can tell me what's going on.",
            patient_name, reason
        ),
        SessionMode::Normal => format!("Hi {}, it's me. {}", patient_name, reason),
    }
}

/// First message for a reconnect within the same session.
pub fn conversation_refresher(patient_name: &str, reason: &str, mode: SessionMode) -> String {
    match mode {
        SessionMode::Distress => format!(
            "{}, I'm still right here with you. {}",
            patient_name, reason
        ),
        SessionMode::Normal => format!("Me again, {}. {}", patient_name, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_log_is_bounded() {
        let mut log = SessionLog::default();
        for i in 0..SESSION_LOG_CAP + 5 {
            log.push(format!("line {}", i));
        }
        let rendered = log.render();
        assert!(!rendered.contains("line 0"));
        assert!(rendered.contains(&format!("line {}", SESSION_LOG_CAP + 4)));
        assert_eq!(rendered.lines().count(), SESSION_LOG_CAP);
    }

    #[test]
    fn empty_log_renders_placeholder() {
        let log = SessionLog::default();
        assert_eq!(log.render(), "(no recent events)");
    }

    #[test]
    fn init_payload_carries_dynamic_variables() {
        let payload = build_init_payload(&InitContext {
            patient_name: "June",
            caregiver_name: "Sam",
            music_playing: true,
            images_displaying: false,
            start_reason: DEFAULT_USER_SPEECH_START_REASON,
            session_logs: "(no recent events)".to_string(),
            first_message: Some(String::new()),
        });

        assert_eq!(payload["type"], "conversation_initiation_client_data");
        assert_eq!(payload["dynamic_variables"]["patient_name"], "June");
        assert_eq!(payload["dynamic_variables"]["music_playing"], true);
        assert_eq!(
            payload["conversation_config_override"]["agent"]["first_message"],
            ""
        );
    }

    #[test]
    fn default_first_message_is_omitted() {
        let payload = build_init_payload(&InitContext {
            patient_name: "June",
            caregiver_name: "Sam",
            music_playing: false,
            images_displaying: false,
            start_reason: "r",
            session_logs: String::new(),
            first_message: None,
        });
        assert!(payload.get("conversation_config_override").is_none());
    }
}
