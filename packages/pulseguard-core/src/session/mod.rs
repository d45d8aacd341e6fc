//! Per-device session engine: VAD-gated audio, the external agent stream,
//! the dead-man switch, and media automation.
//!
//! [`SessionManager`] owns one [`Session`] per device and translates
//! caregiver events into session operations. Controllers receive narrow
//! capability surfaces ([`WatchLink`], the agent link) rather than the
//! session itself.

pub mod agent_stream;
pub mod audio_gate;
pub mod context;
pub mod deadman;
pub mod media;
pub mod session;
pub mod store;
pub mod tools;
pub mod tts;
pub mod vad;

pub use context::SessionMode;
pub use deadman::{CancelReason, DeadmanAction};
pub use media::{MediaAction, MediaStopAction};
pub use session::{AgentState, Session};
pub use store::{InMemorySessionStore, SessionStore, WearerProfile};
pub use tts::TtsClient;
pub use vad::{EnergyVad, VadEngine};

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{PulseguardError, PulseguardResult};
use crate::protocol::ServerMessage;
use crate::services::connection_plane::ConnectionPlane;
use crate::state::AgentConfig;

/// Narrow delivery surface a session and its controllers hold instead of
/// the connection plane.
pub trait WatchLink: Send + Sync {
    /// Sends a text message to the wearer device.
    fn send(&self, msg: &ServerMessage);
    /// Sends raw audio bytes to the wearer device.
    fn send_binary(&self, data: Bytes);
    /// Sends a message to the caregiver/mobile clients paired with the
    /// wearer.
    fn send_to_paired_caregiver(&self, msg: &ServerMessage);
}

/// [`WatchLink`] backed by the connection plane.
pub struct PlaneWatchLink {
    plane: Arc<ConnectionPlane>,
    device_id: String,
}

impl PlaneWatchLink {
    pub fn new(plane: Arc<ConnectionPlane>, device_id: &str) -> Self {
        Self {
            plane,
            device_id: device_id.to_string(),
        }
    }
}

impl WatchLink for PlaneWatchLink {
    fn send(&self, msg: &ServerMessage) {
        self.plane.send_to_device(&self.device_id, msg);
    }

    fn send_binary(&self, data: Bytes) {
        self.plane.send_binary_to_device(&self.device_id, data);
    }

    fn send_to_paired_caregiver(&self, msg: &ServerMessage) {
        self.plane.send_to_paired_caregiver(&self.device_id, msg);
    }
}

/// Translates a caregiver event into the context text handed to the agent
/// and the session mode it implies.
pub fn build_event_context(event: &str, payload: &Value) -> (String, Option<SessionMode>) {
    let text = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let distress_mode = || {
        if payload.get("distress").and_then(Value::as_bool) == Some(true) {
            Some(SessionMode::Distress)
        } else {
            Some(SessionMode::Normal)
        }
    };

    match event {
        "check_in" => {
            let context = match text("instruction") {
                Some(instruction) => format!(
                    "Your job is to check in with the person about this: {}.",
                    instruction
                ),
                None => "Your job is to check in with the person about this.".to_string(),
            };
            (context, Some(SessionMode::Normal))
        }
        "noise" => {
            let context = match text("noise") {
                Some(noise) => format!(
                    "This noise happened just now and you need to figure out if \
                     everything's alright: {}.",
                    noise
                ),
                None => "This noise happened just now and you need to figure out if \
                         everything's alright."
                    .to_string(),
            };
            (context, distress_mode())
        }
        "health" => {
            let context = match text("description") {
                Some(description) => format!("This health event just happened: {}.", description),
                None => "This health event just happened.".to_string(),
            };
            (context, distress_mode())
        }
        _ => ("New caregiver event received.".to_string(), None),
    }
}

/// Owns the per-device sessions and the active-monitoring flags.
pub struct SessionManager {
    plane: Arc<ConnectionPlane>,
    store: Arc<dyn SessionStore>,
    vad: Arc<dyn VadEngine>,
    tts: Arc<TtsClient>,
    agent_config: AgentConfig,
    sessions: DashMap<String, Arc<Session>>,
    monitoring: DashMap<String, bool>,
}

impl SessionManager {
    pub fn new(
        plane: Arc<ConnectionPlane>,
        store: Arc<dyn SessionStore>,
        vad: Arc<dyn VadEngine>,
        tts: Arc<TtsClient>,
        agent_config: AgentConfig,
    ) -> Self {
        Self {
            plane,
            store,
            vad,
            tts,
            agent_config,
            sessions: DashMap::new(),
            monitoring: DashMap::new(),
        }
    }

    /// The session for a device, creating it on first use.
    pub fn get_or_create(&self, device_id: &str, user_id: &str) -> Arc<Session> {
        self.sessions
            .entry(device_id.to_string())
            .or_insert_with(|| {
                let watch: Arc<dyn WatchLink> =
                    Arc::new(PlaneWatchLink::new(Arc::clone(&self.plane), device_id));
                Session::new(
                    device_id,
                    user_id,
                    watch,
                    Arc::clone(&self.store),
                    Arc::clone(&self.vad),
                    Arc::clone(&self.tts),
                    self.agent_config.clone(),
                )
            })
            .clone()
    }

    /// The session for a device, if one exists.
    pub fn get(&self, device_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(device_id).map(|e| Arc::clone(e.value()))
    }

    pub fn is_actively_monitored(&self, device_id: &str) -> bool {
        self.monitoring.get(device_id).map_or(false, |e| *e.value())
    }

    pub fn set_monitoring_state(&self, device_id: &str, active: bool) {
        self.monitoring.insert(device_id.to_string(), active);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Watch-side entry points
    // ─────────────────────────────────────────────────────────────────────

    /// Binary audio from the watch.
    pub async fn watch_audio(&self, device_id: &str, user_id: &str, pcm: Bytes) {
        let session = self.get_or_create(device_id, user_id);
        session.handle_audio_chunk(pcm).await;
    }

    /// Wearer pressed the talk command on the watch.
    pub async fn patient_command(&self, device_id: &str, user_id: &str) {
        if let Some(session) = self.get(device_id) {
            if session.has_active_session().await {
                return;
            }
        }

        // Paired caregiver hears about it before any store or agent work.
        self.plane.send_to_paired_caregiver(
            device_id,
            &ServerMessage::RingEpisodeAlert {
                device_id: device_id.to_string(),
                member_name: user_id.to_string(),
                trigger_type: "command".to_string(),
                phase: "session_started".to_string(),
            },
        );

        let session = self.get_or_create(device_id, user_id);
        session.set_session_mode(SessionMode::Normal, None).await;
        let reason = "The patient wanted to initially tell you something.";
        session.ensure_session_started(reason, "command").await;
        session.set_start_reason(reason).await;
        session.ensure_conversation_active(true).await;
    }

    pub async fn deadman_cancel(&self, device_id: &str, pending_id: &str) {
        if let Some(session) = self.get(device_id) {
            session.cancel_deadman(pending_id);
        }
    }

    pub async fn media_event(&self, device_id: &str, event: &str, payload: &Value) {
        if let Some(session) = self.get(device_id) {
            session.handle_media_event(event, payload).await;
        }
    }

    pub async fn tts_playback_complete(&self, device_id: &str) {
        if let Some(session) = self.get(device_id) {
            session.handle_tts_playback_complete().await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Caregiver-side entry points
    // ─────────────────────────────────────────────────────────────────────

    /// Routes a caregiver event to the paired wearer's session.
    pub async fn caregiver_event(
        &self,
        user_id: &str,
        event: &str,
        payload: &Value,
    ) -> PulseguardResult<()> {
        if !matches!(event, "check_in" | "noise" | "health" | "active_monitoring") {
            return Err(PulseguardError::InvalidRequest(
                "Unknown caregiver event".to_string(),
            ));
        }

        let device_id = self
            .plane
            .devices_for_user(user_id)
            .into_iter()
            .next()
            .ok_or_else(|| PulseguardError::DeviceNotFound("No paired device found".to_string()))?;

        if event == "active_monitoring" {
            return self.active_monitoring(&device_id, payload).await;
        }

        let (context_text, mode) = build_event_context(event, payload);
        let session = self.get_or_create(&device_id, user_id);

        if session.has_active_session().await {
            let mode_change = match mode {
                Some(mode) => mode != session.session_mode().await,
                None => false,
            };
            if mode_change {
                // A mode change mid-session swaps the agent persona:
                // pause-and-reconnect with the event as the start reason.
                session
                    .transfer_session(mode.unwrap_or_default(), Some(&context_text), None)
                    .await;
            } else if session.has_active_conversation() {
                session.send_contextual_update(&context_text);
            } else {
                session.set_start_reason(&context_text).await;
                session.ensure_conversation_active(false).await;
            }
            session.log_event(&context_text).await;
            return Ok(());
        }

        if let Some(mode) = mode {
            session.set_session_mode(mode, Some(&context_text)).await;
        }
        session.ensure_session_started(&context_text, event).await;
        session.log_event(&context_text).await;
        session.set_start_reason(&context_text).await;
        session.ensure_conversation_active(false).await;
        Ok(())
    }

    async fn active_monitoring(&self, device_id: &str, payload: &Value) -> PulseguardResult<()> {
        match payload.get("action").and_then(Value::as_str) {
            Some("start") => {
                self.set_monitoring_state(device_id, true);
                if let Some(session) = self.get(device_id) {
                    session.log_event("Active monitoring started").await;
                }
                Ok(())
            }
            Some("stop") => {
                if let Some(session) = self.get(device_id) {
                    if session.has_active_session().await {
                        session
                            .end_session("Active monitoring ended by caregiver")
                            .await;
                    }
                    session.log_event("Active monitoring stopped").await;
                }
                self.set_monitoring_state(device_id, false);
                Ok(())
            }
            _ => Err(PulseguardError::InvalidRequest(
                "active_monitoring requires action start|stop".to_string(),
            )),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────

    /// The watch socket dropped: tear the session down in the background
    /// and forget it.
    pub fn watch_disconnected(&self, device_id: &str) {
        if let Some((_, session)) = self.sessions.remove(device_id) {
            tokio::spawn(async move {
                session.on_watch_disconnected().await;
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::WatchLink;
    use crate::protocol::ServerMessage;
    use bytes::Bytes;
    use parking_lot::Mutex;

    /// Records every frame a controller sends toward the watch.
    #[derive(Default)]
    pub struct RecordingWatch {
        pub frames: Mutex<Vec<String>>,
        pub binary: Mutex<Vec<Bytes>>,
        pub caregiver_frames: Mutex<Vec<String>>,
    }

    impl RecordingWatch {
        /// Whether any recorded frame (watch or caregiver side) carried
        /// the given `type` tag.
        pub fn saw_type(&self, msg_type: &str) -> bool {
            let needle = format!("\"type\":\"{}\"", msg_type);
            self.frames.lock().iter().any(|f| f.contains(&needle))
                || self
                    .caregiver_frames
                    .lock()
                    .iter()
                    .any(|f| f.contains(&needle))
        }
    }

    impl WatchLink for RecordingWatch {
        fn send(&self, msg: &ServerMessage) {
            if let Some(frame) = msg.to_frame() {
                self.frames.lock().push(frame);
            }
        }

        fn send_binary(&self, data: Bytes) {
            self.binary.lock().push(data);
        }

        fn send_to_paired_caregiver(&self, msg: &ServerMessage) {
            if let Some(frame) = msg.to_frame() {
                self.caregiver_frames.lock().push(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_context_check_in_with_instruction() {
        let (text, mode) =
            build_event_context("check_in", &json!({"instruction": "ask about lunch"}));
        assert!(text.contains("ask about lunch"));
        assert_eq!(mode, Some(SessionMode::Normal));
    }

    #[test]
    fn event_context_noise_with_distress() {
        let (text, mode) = build_event_context(
            "noise",
            &json!({"noise": "glass shatter", "distress": true}),
        );
        assert!(text.contains("glass shatter"));
        assert_eq!(mode, Some(SessionMode::Distress));
    }

    #[test]
    fn event_context_health_without_distress() {
        let (text, mode) = build_event_context("health", &json!({"description": "fell down"}));
        assert!(text.contains("fell down"));
        assert_eq!(mode, Some(SessionMode::Normal));
    }

    #[test]
    fn event_context_unknown_event() {
        let (text, mode) = build_event_context("weather", &json!({}));
        assert_eq!(text, "New caregiver event received.");
        assert_eq!(mode, None);
    }

    fn manager_with_plane() -> (SessionManager, Arc<ConnectionPlane>) {
        let plane = Arc::new(ConnectionPlane::new(16));
        let manager = SessionManager::new(
            Arc::clone(&plane),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(EnergyVad::default()),
            Arc::new(TtsClient::new(
                reqwest::Client::new(),
                AgentConfig::default(),
            )),
            AgentConfig::default(),
        );
        (manager, plane)
    }

    fn manager() -> SessionManager {
        manager_with_plane().0
    }

    #[test]
    fn get_or_create_returns_same_session() {
        let manager = manager();
        let a = manager.get_or_create("d1", "u1");
        let b = manager.get_or_create("d1", "u1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(manager.get("d2").is_none());
    }

    #[tokio::test]
    async fn caregiver_event_without_paired_device_fails() {
        let manager = manager();
        let err = manager
            .caregiver_event("u1", "check_in", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PulseguardError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_caregiver_event_is_rejected() {
        let manager = manager();
        let err = manager
            .caregiver_event("u1", "weather", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PulseguardError::InvalidRequest(_)));
    }

    #[test]
    fn monitoring_flag_round_trip() {
        let manager = manager();
        assert!(!manager.is_actively_monitored("d1"));
        manager.set_monitoring_state("d1", true);
        assert!(manager.is_actively_monitored("d1"));
        manager.set_monitoring_state("d1", false);
        assert!(!manager.is_actively_monitored("d1"));
    }

    #[tokio::test]
    async fn caregiver_event_with_mode_change_swaps_persona_without_new_session() {
        use crate::services::connection_plane::Role;

        let (manager, plane) = manager_with_plane();
        let (conn, _rx) = plane.accept();
        plane.authenticate_device(&conn, Role::Watch, "d1", "u1", &[], &[]);

        let session = manager.get_or_create("d1", "u1");
        session.ensure_session_started("test", "command").await;
        assert_eq!(session.session_mode().await, SessionMode::Normal);

        manager
            .caregiver_event(
                "u1",
                "noise",
                &json!({"noise": "glass shatter", "distress": true}),
            )
            .await
            .unwrap();

        // Mode switched in place; the session survived.
        assert_eq!(session.session_mode().await, SessionMode::Distress);
        assert!(session.has_active_session().await);
    }

    #[tokio::test]
    async fn watch_disconnected_forgets_session() {
        let manager = manager();
        manager.get_or_create("d1", "u1");
        manager.watch_disconnected("d1");
        assert!(manager.get("d1").is_none());
    }
}
