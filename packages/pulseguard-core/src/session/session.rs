//! Per-device session engine.
//!
//! Binds one wearer's audio stream to one conversational-agent stream and
//! to the wearer's watch. All session state transitions are serialized
//! behind one async mutex; controllers (gate, dead-man switch, media) hold
//! only the narrow capability surfaces they need and never the session
//! itself.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::AbortHandle;

use crate::error::{PulseguardError, PulseguardResult};
use crate::protocol::ServerMessage;
use crate::session::agent_stream::{AgentEvent, AgentLink, AgentStream};
use crate::session::audio_gate::AudioGate;
use crate::session::context::{
    build_init_payload, conversation_opener, conversation_refresher, InitContext, SessionLog,
    SessionMode, CONVERSATION_CLOSED_REASON, DEFAULT_DISTRESS_START_REASON,
    DEFAULT_REGULAR_START_REASON, DEFAULT_USER_SPEECH_START_REASON, WATCH_DISCONNECTED_REASON,
};
use crate::session::deadman::{CancelReason, DeadmanAction, DeadmanSwitch};
use crate::session::media::{MediaAction, MediaAutomation, MediaEffect, MediaStopAction};
use crate::session::store::SessionStore;
use crate::session::tts::TtsClient;
use crate::session::vad::{VadEngine, VAD_START_FRAMES, VAD_STOP_FRAMES};
use crate::session::{tools, WatchLink};
use crate::state::AgentConfig;

/// Tool results worth recording in the session log.
const LOGGED_TOOL_CALLS: &[&str] = &[
    "media_control",
    "transfer_to_caregiver",
    "transfer_to_regular",
    "transfer_to_distress",
];

/// Pending tool-call map bound; overflow evicts the oldest half.
const MAX_PENDING_TOOL_CALLS: usize = 100;

/// How long to wait for the watch to acknowledge TTS playback.
const TTS_COMPLETE_TIMEOUT: Duration = Duration::from_secs(3);

/// No watch audio for this long while speech-active forces speech end.
const SPEECH_IDLE_TIMEOUT: Duration = Duration::from_secs(3);
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Agent conversation state; transitions are linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Inactive,
    Connecting,
    Active,
}

/// Bounded map of in-flight tool-call ids to tool names.
#[derive(Default)]
struct ToolCallLog {
    names: HashMap<String, String>,
    order: VecDeque<String>,
}

impl ToolCallLog {
    fn insert(&mut self, call_id: String, tool_name: String) {
        if self.names.len() >= MAX_PENDING_TOOL_CALLS {
            let evict = self.names.len() / 2;
            for _ in 0..evict {
                if let Some(old) = self.order.pop_front() {
                    self.names.remove(&old);
                }
            }
            log::warn!("[Session] Evicted {} stale tool call entries", evict);
        }
        if self.names.insert(call_id.clone(), tool_name).is_none() {
            self.order.push_back(call_id);
        }
    }

    fn take(&mut self, call_id: &str) -> Option<String> {
        let name = self.names.remove(call_id);
        if name.is_some() {
            self.order.retain(|id| id != call_id);
        }
        name
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    fn clear(&mut self) {
        self.names.clear();
        self.order.clear();
    }
}

struct SessionInner {
    session_id: Option<String>,
    mode: SessionMode,
    start_reason: Option<String>,
    last_start_reason: String,
    pending_first_message: Option<String>,
    suppress_session_end_on_close: bool,
    had_conversation: bool,
    patient_name: String,
    caregiver_name: String,
    profile_loaded: bool,
    tool_calls: ToolCallLog,
    speech_streak: u32,
    silence_streak: u32,
    last_probability: f64,
    audio_chunk_count: u64,
    init_payload: Option<Value>,
    tts_complete: Option<Arc<Notify>>,
    log: SessionLog,
    watchdog: Option<AbortHandle>,
}

/// Long-lived per-device session.
pub struct Session {
    pub device_id: String,
    pub user_id: String,
    watch: Arc<dyn WatchLink>,
    store: Arc<dyn SessionStore>,
    vad: Arc<dyn VadEngine>,
    tts: Arc<TtsClient>,
    agent_config: AgentConfig,
    link: Arc<AgentLink>,
    gate: Arc<AudioGate>,
    deadman: Arc<DeadmanSwitch>,
    media: Arc<MediaAutomation>,
    agent_state: watch::Sender<AgentState>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(
        device_id: &str,
        user_id: &str,
        watch: Arc<dyn WatchLink>,
        store: Arc<dyn SessionStore>,
        vad: Arc<dyn VadEngine>,
        tts: Arc<TtsClient>,
        agent_config: AgentConfig,
    ) -> Arc<Self> {
        let link = Arc::new(AgentLink::new());
        let gate = Arc::new(AudioGate::new(Arc::clone(&link)));
        let deadman = Arc::new(DeadmanSwitch::new(Arc::clone(&watch)));
        let media = Arc::new(MediaAutomation::new(Arc::clone(&watch)));
        let (agent_state, _) = watch::channel(AgentState::Inactive);

        Arc::new(Self {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            watch,
            store,
            vad,
            tts,
            agent_config,
            link,
            gate,
            deadman,
            media,
            agent_state,
            inner: Mutex::new(SessionInner {
                session_id: None,
                mode: SessionMode::Normal,
                start_reason: None,
                last_start_reason: "unknown".to_string(),
                pending_first_message: None,
                suppress_session_end_on_close: false,
                had_conversation: false,
                patient_name: "Patient".to_string(),
                caregiver_name: "Caregiver".to_string(),
                profile_loaded: false,
                tool_calls: ToolCallLog::default(),
                speech_streak: 0,
                silence_streak: 0,
                last_probability: 0.0,
                audio_chunk_count: 0,
                init_payload: None,
                tts_complete: None,
                log: SessionLog::default(),
                watchdog: None,
            }),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // State queries
    // ─────────────────────────────────────────────────────────────────────

    pub async fn has_active_session(&self) -> bool {
        self.inner.lock().await.session_id.is_some()
    }

    pub fn has_active_conversation(&self) -> bool {
        matches!(
            *self.agent_state.borrow(),
            AgentState::Active | AgentState::Connecting
        )
    }

    pub fn agent_state_now(&self) -> AgentState {
        *self.agent_state.borrow()
    }

    pub fn is_user_speaking(&self) -> bool {
        self.gate.speech_active()
    }

    pub async fn session_mode(&self) -> SessionMode {
        self.inner.lock().await.mode
    }

    pub async fn pending_tool_calls(&self) -> usize {
        self.inner.lock().await.tool_calls.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Opens the logical session if none is open. Idempotent; concurrent
    /// callers serialize on the session lock and observe the first
    /// caller's session.
    pub async fn ensure_session_started(&self, reason: &str, trigger_type: &str) {
        let mut inner = self.inner.lock().await;
        if inner.session_id.is_some() {
            return;
        }

        if !inner.profile_loaded {
            inner.profile_loaded = true;
            if let Some(profile) = self.store.profile(&self.device_id, &self.user_id).await {
                inner.patient_name = profile.patient_name;
                inner.caregiver_name = profile.caregiver_name;
            }
        }

        let mode = inner.mode;
        let session_id = self
            .store
            .start_session(&self.device_id, reason, trigger_type, mode.as_str())
            .await;
        inner.log.push(format!("Session started: {}", reason));
        inner.session_id = Some(session_id);
    }

    /// Ends the logical session: tears down the conversation, media, and
    /// pending actions, and closes the session in the store.
    pub async fn end_session(&self, reason: &str) {
        // Paired caregiver hears about it before any teardown.
        self.watch
            .send_to_paired_caregiver(&ServerMessage::RingEpisodeResolved {
                device_id: self.device_id.clone(),
                member_name: self.user_id.clone(),
                resolution: reason.to_string(),
            });

        let (session_id, ending_mode) = {
            let mut inner = self.inner.lock().await;
            let session_id = inner.session_id.take();
            let ending_mode = inner.mode;

            self.media.deactivate();
            self.deadman
                .cancel_if_action(DeadmanAction::PlayMusic, CancelReason::Stopped);
            self.deadman
                .cancel_if_action(DeadmanAction::DisplayImages, CancelReason::Stopped);

            self.pause_conversation_locked(&mut inner, reason, false);

            inner.mode = SessionMode::Normal;
            inner.start_reason = None;
            inner.pending_first_message = None;
            inner.had_conversation = false;
            inner.tool_calls.clear();
            inner.speech_streak = 0;
            inner.silence_streak = 0;
            inner.last_probability = 0.0;
            inner.log.clear();
            if let Some(watchdog) = inner.watchdog.take() {
                watchdog.abort();
            }
            (session_id, ending_mode)
        };
        self.gate.reset();

        let resolved = match session_id {
            Some(id) => Some(id),
            None => self.store.active_session_id(&self.device_id).await,
        };
        if let Some(id) = resolved {
            self.store
                .end_session(&id, reason, Some(ending_mode.as_str()))
                .await;
        }
    }

    /// Sets the session mode, logging the change while a session is open.
    pub async fn set_session_mode(&self, mode: SessionMode, reason: Option<&str>) {
        let mut inner = self.inner.lock().await;
        self.set_session_mode_locked(&mut inner, mode, reason);
    }

    fn set_session_mode_locked(
        &self,
        inner: &mut SessionInner,
        mode: SessionMode,
        reason: Option<&str>,
    ) {
        if mode == inner.mode {
            return;
        }
        let previous = inner.mode;
        inner.mode = mode;
        if inner.session_id.is_some() {
            inner.log.push(format!(
                "Mode change: {} -> {} ({})",
                previous.as_str(),
                mode.as_str(),
                reason.unwrap_or("unspecified")
            ));
        }
    }

    /// Sets the start reason the next conversation will carry.
    pub async fn set_start_reason(&self, reason: &str) {
        self.inner.lock().await.start_reason = Some(reason.to_string());
    }

    /// Appends a line to the session log.
    pub async fn log_event(&self, line: &str) {
        self.inner.lock().await.log.push(line);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Conversation lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Ensures an agent conversation is live. Returns true once the agent
    /// socket reports active.
    ///
    /// Idempotent under concurrency: callers finding a connect in flight
    /// wait on the state channel; at most one connect attempt runs.
    pub async fn ensure_conversation_active(self: &Arc<Self>, silence_on_init: bool) -> bool {
        let mut state_rx = self.agent_state.subscribe();

        {
            let mut inner = self.inner.lock().await;
            if inner.session_id.is_none() {
                return false;
            }
            let current = self.agent_state_now();
            match current {
                AgentState::Active => return true,
                AgentState::Connecting => {} // wait below
                AgentState::Inactive => {
                    if !self.agent_config.agent_available() {
                        log::debug!(
                            "[Session {}] Agent not configured; conversation degraded to no-op",
                            self.device_id
                        );
                        return false;
                    }
                    self.begin_connect_locked(&mut inner, silence_on_init);
                }
            }
        }

        loop {
            let current = *state_rx.borrow_and_update();
            if current != AgentState::Connecting {
                return current == AgentState::Active;
            }
            if state_rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Pre-computes the init payload and spawns the connect task. Must be
    /// called with the lock held and state `Inactive`.
    fn begin_connect_locked(self: &Arc<Self>, inner: &mut SessionInner, silence_on_init: bool) {
        let reason = inner
            .start_reason
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_SPEECH_START_REASON.to_string());
        inner.last_start_reason = reason.clone();
        inner.suppress_session_end_on_close = false;

        // The full init payload is computed before the socket opens so the
        // `open` handler never stalls the first exchange.
        let first_message = if silence_on_init {
            Some(String::new())
        } else if let Some(pending) = inner.pending_first_message.take() {
            Some(pending)
        } else if !inner.had_conversation {
            Some(conversation_opener(&inner.patient_name, &reason, inner.mode))
        } else {
            Some(conversation_refresher(&inner.patient_name, &reason, inner.mode))
        };
        inner.init_payload = Some(build_init_payload(&InitContext {
            patient_name: &inner.patient_name,
            caregiver_name: &inner.caregiver_name,
            music_playing: self.media.is_music_playing(),
            images_displaying: self.media.is_images_displaying(),
            start_reason: &reason,
            session_logs: inner.log.render(),
            first_message,
        }));

        self.agent_state.send_replace(AgentState::Connecting);
        let agent_id = self
            .agent_config
            .agent_id_for_distress(inner.mode == SessionMode::Distress)
            .to_string();
        let endpoint = self.agent_config.endpoint.clone();
        let api_key = self.agent_config.api_key.clone();
        log::info!(
            "[Session {}] Connecting conversation (reason={:?})",
            self.device_id,
            reason
        );

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AgentEvent>();
            match AgentStream::connect(&endpoint, &agent_id, &api_key, event_tx).await {
                Ok(stream) => {
                    session.link.install(stream);
                    while let Some(event) = event_rx.recv().await {
                        session.handle_agent_event(event).await;
                    }
                }
                Err(e) => {
                    log::warn!("[Session {}] Agent connect failed: {}", session.device_id, e);
                    session.on_agent_connect_failed().await;
                }
            }
        });
    }

    async fn on_agent_connect_failed(&self) {
        let mut inner = self.inner.lock().await;
        inner.init_payload = None;
        self.link.take();
        self.gate.set_not_ready(false);
        self.agent_state.send_replace(AgentState::Inactive);
    }

    /// Closes the current conversation without ending the logical session.
    pub async fn pause_conversation(&self, reason: &str, preserve_pending: bool) {
        let mut inner = self.inner.lock().await;
        self.pause_conversation_locked(&mut inner, reason, preserve_pending);
    }

    fn pause_conversation_locked(
        &self,
        inner: &mut SessionInner,
        reason: &str,
        preserve_pending: bool,
    ) {
        inner.suppress_session_end_on_close = true;
        inner.init_payload = None;
        if let Some(stream) = self.link.take() {
            stream.close(reason);
        }
        self.gate.stop_silence_fill();
        self.gate.set_not_ready(preserve_pending);
        self.agent_state.send_replace(AgentState::Inactive);
    }

    /// Switches the session mode mid-conversation: pause, reconnect with
    /// the mode's agent id, carry over the reason and optional first
    /// message.
    pub async fn transfer_session(
        self: &Arc<Self>,
        mode: SessionMode,
        reason: Option<&str>,
        first_message: Option<&str>,
    ) {
        {
            let mut inner = self.inner.lock().await;
            let has_conversation = self.has_active_conversation();
            if mode == inner.mode && !has_conversation {
                return;
            }

            let effective_reason = reason
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    match mode {
                        SessionMode::Distress => DEFAULT_DISTRESS_START_REASON,
                        SessionMode::Normal => DEFAULT_REGULAR_START_REASON,
                    }
                    .to_string()
                });

            self.set_session_mode_locked(&mut inner, mode, Some(&effective_reason));
            inner.start_reason = Some(effective_reason.clone());
            if let Some(first_message) = first_message.map(str::trim).filter(|m| !m.is_empty()) {
                inner.pending_first_message = Some(first_message.to_string());
            }
            inner.log.push(format!(
                "Switched to {} support. {}",
                mode.as_str(),
                effective_reason
            ));

            if has_conversation {
                let close_reason = match mode {
                    SessionMode::Distress => "Switching to distress support",
                    SessionMode::Normal => "Switching to regular support",
                };
                self.pause_conversation_locked(&mut inner, close_reason, true);
            }
        }
        self.ensure_conversation_active(false).await;
    }

    /// Sends a contextual update into the live conversation.
    pub fn send_contextual_update(&self, text: &str) {
        if self.agent_state_now() == AgentState::Active {
            self.link
                .send_json(json!({"type": "contextual_update", "text": text}));
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Agent events
    // ─────────────────────────────────────────────────────────────────────

    async fn handle_agent_event(self: &Arc<Self>, event: AgentEvent) {
        match event {
            AgentEvent::Open => {
                let mut inner = self.inner.lock().await;
                if let Some(payload) = inner.init_payload.take() {
                    self.link.send_json(payload);
                }
                inner.start_reason = None;
                inner.had_conversation = true;
                log::info!(
                    "[Session {}] Conversation active (reason={:?})",
                    self.device_id,
                    inner.last_start_reason
                );
                self.agent_state.send_replace(AgentState::Active);
                self.gate.set_ready();
            }
            AgentEvent::Message(text) => {
                self.handle_agent_message(&text).await;
            }
            AgentEvent::Close { code, reason } => {
                let end_logical_session = {
                    let mut inner = self.inner.lock().await;
                    self.link.take();
                    self.gate.stop_silence_fill();
                    self.gate.set_not_ready(false);
                    self.agent_state.send_replace(AgentState::Inactive);
                    log::info!(
                        "[Session {}] Conversation ended code={:?} reason={:?}",
                        self.device_id,
                        code,
                        reason
                    );
                    !inner.suppress_session_end_on_close && inner.session_id.is_some()
                };
                // A close we did not request ends the logical session too.
                if end_logical_session {
                    let session = Arc::clone(self);
                    tokio::spawn(async move {
                        session.end_session(CONVERSATION_CLOSED_REASON).await;
                    });
                }
            }
            AgentEvent::Error(e) => {
                log::warn!("[Session {}] Agent stream error: {}", self.device_id, e);
                self.gate.stop_silence_fill();
            }
        }
    }

    /// Dispatches one inbound agent message: ping, audio, or tool call.
    async fn handle_agent_message(self: &Arc<Self>, text: &str) {
        let Ok(payload) = serde_json::from_str::<Value>(text) else {
            return;
        };
        match payload.get("type").and_then(Value::as_str) {
            Some("ping") => {
                let event_id = payload
                    .pointer("/ping_event/event_id")
                    .and_then(Value::as_i64);
                let delay_ms = payload
                    .pointer("/ping_event/ping_ms")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let Some(event_id) = event_id else { return };

                let link = Arc::clone(&self.link);
                if delay_ms > 0.0 {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
                        link.send_json(json!({"type": "pong", "event_id": event_id}));
                    });
                } else {
                    link.send_json(json!({"type": "pong", "event_id": event_id}));
                }
            }
            Some("audio") => {
                let Some(b64) = payload
                    .pointer("/audio_event/audio_base_64")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                else {
                    return;
                };
                match BASE64.decode(b64) {
                    Ok(pcm) if !pcm.is_empty() => {
                        {
                            let mut inner = self.inner.lock().await;
                            inner.audio_chunk_count += 1;
                        }
                        self.watch.send_binary(Bytes::from(pcm));
                        self.media.on_agent_audio_chunk();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("[Session {}] Bad agent audio chunk: {}", self.device_id, e);
                    }
                }
            }
            Some("client_tool_call") => {
                let call = payload.get("client_tool_call");
                let tool_name = call
                    .and_then(|c| c.get("tool_name"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let tool_call_id = call
                    .and_then(|c| c.get("tool_call_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let parameters = call
                    .and_then(|c| c.get("parameters"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));

                let (Some(tool_name), Some(tool_call_id)) = (tool_name, tool_call_id) else {
                    return;
                };
                log::info!(
                    "[Session {}] Tool call name={} id={}",
                    self.device_id,
                    tool_name,
                    tool_call_id
                );
                {
                    let mut inner = self.inner.lock().await;
                    inner
                        .tool_calls
                        .insert(tool_call_id.clone(), tool_name.clone());
                }
                if tools::should_handle(&tool_name) {
                    let session = Arc::clone(self);
                    tokio::spawn(async move {
                        tools::handle_tool_call(session, tool_name, tool_call_id, parameters).await;
                    });
                }
            }
            _ => {}
        }
    }

    /// Returns a tool result to the agent, logging recognized tools.
    pub async fn send_tool_result(&self, tool_call_id: &str, result: &str, is_error: bool) {
        let mut inner = self.inner.lock().await;
        let tool_name = inner.tool_calls.take(tool_call_id).or_else(|| {
            tool_call_id
                .rsplit_once('_')
                .map(|(name, _)| name.to_string())
        });
        if !is_error && inner.session_id.is_some() {
            if let Some(name) = &tool_name {
                if LOGGED_TOOL_CALLS.contains(&name.as_str()) {
                    inner.log.push(format!("Tool {}: {}", name, result));
                }
            }
        }
        drop(inner);

        self.link.send_json(json!({
            "type": "client_tool_result",
            "tool_call_id": tool_call_id,
            "result": result,
            "is_error": is_error,
        }));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Upstream audio
    // ─────────────────────────────────────────────────────────────────────

    /// Feeds one PCM16 chunk from the watch through VAD and the gate.
    pub async fn handle_audio_chunk(self: &Arc<Self>, pcm: Bytes) {
        if pcm.is_empty() {
            return;
        }
        self.ensure_session_started("User audio received from the watch.", "user_audio")
            .await;
        self.gate.mark_activity();

        let b64 = BASE64.encode(&pcm);
        let decision = self.vad.assess(&pcm);

        let mut inner = self.inner.lock().await;
        if inner.session_id.is_none() {
            return;
        }
        inner.audio_chunk_count += 1;
        inner.last_probability = decision.probability;

        if !self.gate.speech_active() {
            self.gate.queue_pre_roll(b64.clone(), pcm.len());
        }

        if decision.is_speech {
            inner.speech_streak += 1;
            inner.silence_streak = 0;
        } else {
            inner.silence_streak += 1;
            inner.speech_streak = 0;
        }

        if !self.gate.speech_active() && inner.speech_streak >= VAD_START_FRAMES {
            self.start_speech_locked(&mut inner);
            self.gate.flush_pre_roll();
            return;
        }

        if self.gate.speech_active() {
            if !self.has_active_conversation() {
                if inner
                    .start_reason
                    .as_deref()
                    .map_or(true, |r| r.trim().is_empty())
                {
                    inner.start_reason = Some(DEFAULT_USER_SPEECH_START_REASON.to_string());
                }
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    session.ensure_conversation_active(true).await;
                });
            }

            self.gate.queue_audio(b64);

            if inner.silence_streak >= VAD_STOP_FRAMES {
                self.end_speech_locked(&mut inner);
            }
        }
    }

    fn start_speech_locked(self: &Arc<Self>, inner: &mut SessionInner) {
        if self.gate.speech_active() || inner.session_id.is_none() {
            return;
        }
        self.gate.set_speech_active(true);
        self.gate.stop_silence_fill();
        self.media.on_user_speech_start();
        inner.log.push("User started speaking");

        if self.agent_state_now() != AgentState::Active {
            if inner
                .start_reason
                .as_deref()
                .map_or(true, |r| r.trim().is_empty())
            {
                inner.start_reason = Some(DEFAULT_USER_SPEECH_START_REASON.to_string());
            }
            let session = Arc::clone(self);
            tokio::spawn(async move {
                session.ensure_conversation_active(true).await;
            });
        }

        // Idle watchdog: force speech end if the watch stops sending.
        let session = Arc::clone(self);
        let watchdog = tokio::spawn(async move {
            loop {
                tokio::time::sleep(IDLE_CHECK_INTERVAL).await;
                if !session.gate.speech_active() {
                    return;
                }
                if session.gate.idle_for() > SPEECH_IDLE_TIMEOUT {
                    log::info!(
                        "[Session {}] Speech idle timeout, forcing speech end",
                        session.device_id
                    );
                    session.force_speech_end().await;
                    return;
                }
            }
        })
        .abort_handle();
        if let Some(old) = inner.watchdog.replace(watchdog) {
            old.abort();
        }
    }

    fn end_speech_locked(&self, inner: &mut SessionInner) {
        if !self.gate.speech_active() || inner.session_id.is_none() {
            return;
        }
        self.gate.set_speech_active(false);
        inner.speech_streak = 0;
        inner.silence_streak = 0;
        self.gate.clear_pre_roll();
        inner.log.push("User stopped speaking");
        if let Some(watchdog) = inner.watchdog.take() {
            watchdog.abort();
        }
        self.gate.send_silence_tail();
        self.gate.start_silence_fill();
        self.media.on_user_speech_end();
    }

    async fn force_speech_end(&self) {
        let mut inner = self.inner.lock().await;
        if self.gate.speech_active() {
            self.end_speech_locked(&mut inner);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tool actions
    // ─────────────────────────────────────────────────────────────────────

    /// Asks the caregiver to step in. With `command` the handoff is
    /// immediate; otherwise it is armed on the dead-man switch.
    pub async fn transfer_to_caregiver(
        self: &Arc<Self>,
        tool_call_id: &str,
        context: Option<&str>,
        command: bool,
    ) -> PulseguardResult<()> {
        let context = context
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let result_message = match &context {
            Some(c) => format!("Notified the caregiver to step in. Context: {}", c),
            None => "Notified the caregiver to step in.".to_string(),
        };

        if command {
            self.commit_caregiver_handoff(tool_call_id, context.as_deref(), &result_message)
                .await;
            return Ok(());
        }

        if self
            .deadman
            .pending_action()
            .is_some_and(DeadmanAction::is_media)
        {
            return Err(PulseguardError::ConflictingPendingAction(
                "cannot call caregiver while media is pending".to_string(),
            ));
        }

        let commit_session = Arc::clone(self);
        let commit_id = tool_call_id.to_string();
        let commit_context = context.clone();
        let commit_message = result_message.clone();
        let cancel_session = Arc::clone(self);
        let cancel_id = tool_call_id.to_string();

        self.deadman.arm(
            DeadmanAction::StartCall,
            Box::new(move || {
                tokio::spawn(async move {
                    commit_session
                        .commit_caregiver_handoff(
                            &commit_id,
                            commit_context.as_deref(),
                            &commit_message,
                        )
                        .await;
                });
            }),
            Box::new(move |reason| {
                let message = match reason {
                    CancelReason::Cancelled => "User cancelled contacting caregiver.",
                    CancelReason::Superseded => "Caregiver transfer superseded.",
                    CancelReason::Stopped => "Caregiver transfer stopped.",
                };
                tokio::spawn(async move {
                    cancel_session
                        .send_tool_result(&cancel_id, message, true)
                        .await;
                });
            }),
        );
        Ok(())
    }

    async fn commit_caregiver_handoff(
        self: &Arc<Self>,
        tool_call_id: &str,
        context: Option<&str>,
        result_message: &str,
    ) {
        {
            let mut inner = self.inner.lock().await;
            inner.log.push(match context {
                Some(c) => format!("Asked the caregiver to step in. Context: {}", c),
                None => "Asked the caregiver to step in.".to_string(),
            });
        }
        self.send_tool_result(tool_call_id, result_message, false)
            .await;
        self.watch
            .send_to_paired_caregiver(&ServerMessage::RingEpisodeAlert {
                device_id: self.device_id.clone(),
                member_name: self.user_id.clone(),
                trigger_type: "caregiver_call".to_string(),
                phase: "call_requested".to_string(),
            });

        // Brief grace so the agent's goodbye reaches the watch first.
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            session
                .pause_conversation("Handing off to caregiver", false)
                .await;
        });
    }

    /// Arms a media start on the dead-man switch. Returns the pending id.
    pub async fn arm_media_deadman(
        self: &Arc<Self>,
        tool_call_id: &str,
        action: MediaAction,
        vibe: &str,
    ) -> PulseguardResult<String> {
        if self.deadman.pending_action() == Some(DeadmanAction::StartCall) {
            return Err(PulseguardError::ConflictingPendingAction(
                "cannot start media while a call is pending".to_string(),
            ));
        }
        self.media.on_new_start_requested();

        let deadman_action = match action {
            MediaAction::PlayMusic => DeadmanAction::PlayMusic,
            MediaAction::DisplayImages => DeadmanAction::DisplayImages,
        };

        let commit_session = Arc::clone(self);
        let commit_id = tool_call_id.to_string();
        let commit_vibe = vibe.to_string();
        let cancel_session = Arc::clone(self);
        let cancel_id = tool_call_id.to_string();

        let pending_id = self.deadman.arm(
            deadman_action,
            Box::new(move || {
                tokio::spawn(async move {
                    if let Err(e) = commit_session
                        .start_media_now(&commit_id, action, &commit_vibe)
                        .await
                    {
                        commit_session
                            .send_tool_result(&commit_id, &e.to_string(), true)
                            .await;
                    }
                });
            }),
            Box::new(move |reason| {
                let message = match reason {
                    CancelReason::Cancelled => "User cancelled starting media.",
                    CancelReason::Superseded => "Media request superseded.",
                    CancelReason::Stopped => "Media request stopped.",
                };
                tokio::spawn(async move {
                    cancel_session
                        .send_tool_result(&cancel_id, message, true)
                        .await;
                });
            }),
        );
        Ok(pending_id)
    }

    /// Starts media immediately, narrates it, and reports the tool result.
    pub async fn start_media_now(
        self: &Arc<Self>,
        tool_call_id: &str,
        action: MediaAction,
        vibe: &str,
    ) -> PulseguardResult<()> {
        if self.deadman.pending_action() == Some(DeadmanAction::StartCall) {
            return Err(PulseguardError::ConflictingPendingAction(
                "cannot start media while a call is pending".to_string(),
            ));
        }
        self.media.on_new_start_requested();

        let announcement = self.media.start_media(action, vibe);
        self.send_tool_result(
            tool_call_id,
            &format!("Started {}.", action.as_str()),
            false,
        )
        .await;
        self.play_tts(&announcement).await;
        Ok(())
    }

    /// Stops media, cancelling any pending media dead-man action first.
    pub async fn stop_media(&self, action: MediaStopAction) {
        self.deadman
            .cancel_if_action(DeadmanAction::PlayMusic, CancelReason::Stopped);
        self.deadman
            .cancel_if_action(DeadmanAction::DisplayImages, CancelReason::Stopped);
        self.media.stop(action);
    }

    /// Wearer cancelled a pending action from the watch.
    pub fn cancel_deadman(&self, pending_id: &str) -> bool {
        self.deadman.cancel(pending_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Media & TTS
    // ─────────────────────────────────────────────────────────────────────

    /// Routes a media event from the watch, handling exhausted playlists.
    pub async fn handle_media_event(self: &Arc<Self>, event: &str, payload: &Value) {
        if let Some(MediaEffect::Exhausted(media_type)) = self.media.on_media_event(event, payload)
        {
            let message = format!("The {} playlist has finished.", media_type);
            self.log_event(&format!("Media exhausted: {}", media_type))
                .await;

            if self.agent_state_now() == AgentState::Active {
                self.send_contextual_update(&message);
            } else {
                self.set_start_reason(&message).await;
                self.ensure_conversation_active(false).await;
            }
        }
    }

    /// Streams TTS to the watch and waits (bounded) for the playback ack.
    pub async fn play_tts(self: &Arc<Self>, text: &str) {
        if !self.tts.available() {
            return;
        }

        let complete = Arc::new(Notify::new());
        {
            let mut inner = self.inner.lock().await;
            inner.tts_complete = Some(Arc::clone(&complete));
        }

        let watch = Arc::clone(&self.watch);
        if let Err(e) = self
            .tts
            .stream_pcm(text, move |chunk| watch.send_binary(chunk))
            .await
        {
            log::warn!("[Session {}] TTS stream failed: {}", self.device_id, e);
        }
        self.watch.send(&ServerMessage::TtsEndMarker);

        if tokio::time::timeout(TTS_COMPLETE_TIMEOUT, complete.notified())
            .await
            .is_err()
        {
            log::info!(
                "[Session {}] TTS playback ack timeout, proceeding",
                self.device_id
            );
        }
        self.inner.lock().await.tts_complete = None;
    }

    /// Watch acknowledged TTS playback completion.
    pub async fn handle_tts_playback_complete(&self) {
        if let Some(notify) = self.inner.lock().await.tts_complete.clone() {
            notify.notify_one();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────

    /// The watch socket went away: cancel pending actions and end the
    /// session.
    pub async fn on_watch_disconnected(&self) {
        self.deadman.cancel_any(CancelReason::Stopped);
        self.end_session(WATCH_DISCONNECTED_REASON).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::InMemorySessionStore;
    use crate::session::tests_support::RecordingWatch;
    use crate::session::vad::EnergyVad;

    fn session() -> (Arc<Session>, Arc<RecordingWatch>) {
        let watch = Arc::new(RecordingWatch::default());
        let session = Session::new(
            "d1",
            "u1",
            Arc::clone(&watch) as Arc<dyn WatchLink>,
            Arc::new(InMemorySessionStore::new()),
            Arc::new(EnergyVad::default()),
            Arc::new(TtsClient::new(reqwest::Client::new(), AgentConfig::default())),
            AgentConfig::default(),
        );
        (session, watch)
    }

    fn speech_chunk() -> Bytes {
        let mut pcm = Vec::with_capacity(640);
        for i in 0..320 {
            let v: i16 = if i % 2 == 0 { 9000 } else { -9000 };
            pcm.extend_from_slice(&v.to_le_bytes());
        }
        Bytes::from(pcm)
    }

    fn silence_chunk() -> Bytes {
        Bytes::from(vec![0u8; 640])
    }

    #[tokio::test]
    async fn audio_starts_logical_session() {
        let (session, _watch) = session();
        assert!(!session.has_active_session().await);
        session.handle_audio_chunk(silence_chunk()).await;
        assert!(session.has_active_session().await);
    }

    #[tokio::test]
    async fn speech_opens_gate_after_start_frames() {
        let (session, _watch) = session();
        for _ in 0..VAD_START_FRAMES {
            session.handle_audio_chunk(speech_chunk()).await;
        }
        assert!(session.is_user_speaking());

        // Silence closes it again after the stop streak.
        for _ in 0..VAD_STOP_FRAMES {
            session.handle_audio_chunk(silence_chunk()).await;
        }
        assert!(!session.is_user_speaking());
    }

    #[tokio::test]
    async fn speech_buffers_while_agent_unconfigured() {
        let (session, _watch) = session();
        for _ in 0..VAD_START_FRAMES + 4 {
            session.handle_audio_chunk(speech_chunk()).await;
        }
        // Gate open, no agent: pre-roll plus live chunks buffered.
        assert!(session.gate.pending_len() > 0);
    }

    #[tokio::test]
    async fn ensure_conversation_without_session_is_false() {
        let (session, _watch) = session();
        assert!(!session.ensure_conversation_active(false).await);
    }

    #[tokio::test]
    async fn ensure_conversation_degrades_without_credentials() {
        let (session, _watch) = session();
        session.ensure_session_started("test", "command").await;
        assert!(!session.ensure_conversation_active(false).await);
        assert_eq!(session.agent_state_now(), AgentState::Inactive);
    }

    #[tokio::test]
    async fn end_session_resets_state_and_notifies_caregiver() {
        let (session, watch) = session();
        session.ensure_session_started("test", "command").await;
        session
            .set_session_mode(SessionMode::Distress, Some("test"))
            .await;

        session.end_session("done").await;

        assert!(!session.has_active_session().await);
        assert_eq!(session.session_mode().await, SessionMode::Normal);
        assert!(watch.saw_type("ring-episode-resolved"));
    }

    #[tokio::test]
    async fn tool_call_log_is_bounded() {
        let (session, _watch) = session();
        {
            let mut inner = session.inner.lock().await;
            for i in 0..MAX_PENDING_TOOL_CALLS + 40 {
                inner
                    .tool_calls
                    .insert(format!("call_{}", i), "media_control".to_string());
            }
            assert!(inner.tool_calls.len() <= MAX_PENDING_TOOL_CALLS);
        }
    }

    #[tokio::test]
    async fn media_start_call_exclusion() {
        let (session, _watch) = session();
        session.ensure_session_started("test", "command").await;

        session
            .transfer_to_caregiver("call_1", Some("check on them"), false)
            .await
            .unwrap();

        let err = session
            .arm_media_deadman("call_2", MediaAction::PlayMusic, "calm")
            .await
            .unwrap_err();
        assert!(matches!(err, PulseguardError::ConflictingPendingAction(_)));
    }

    #[tokio::test]
    async fn immediate_media_while_call_pending_is_rejected() {
        let (session, _watch) = session();
        session.ensure_session_started("test", "command").await;

        session
            .transfer_to_caregiver("call_1", None, false)
            .await
            .unwrap();

        let err = session
            .start_media_now("call_2", MediaAction::PlayMusic, "calm")
            .await
            .unwrap_err();
        assert!(matches!(err, PulseguardError::ConflictingPendingAction(_)));
        assert!(!session.media.is_music_playing());
    }

    #[tokio::test]
    async fn call_while_media_pending_is_rejected() {
        let (session, _watch) = session();
        session.ensure_session_started("test", "command").await;

        session
            .arm_media_deadman("call_1", MediaAction::PlayMusic, "calm")
            .await
            .unwrap();

        let err = session
            .transfer_to_caregiver("call_2", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, PulseguardError::ConflictingPendingAction(_)));
    }

    #[tokio::test]
    async fn deadman_cancel_from_watch() {
        let (session, _watch) = session();
        session.ensure_session_started("test", "command").await;

        let pending_id = session
            .arm_media_deadman("call_1", MediaAction::PlayMusic, "calm")
            .await
            .unwrap();
        assert!(session.cancel_deadman(&pending_id));
        assert!(!session.cancel_deadman(&pending_id));
    }

    #[tokio::test]
    async fn tts_ack_wait_is_bounded() {
        // Unconfigured TTS: play_tts is a no-op and must return promptly.
        let (session, watch) = session();
        session.play_tts("hello").await;
        assert!(!watch.saw_type("tts-end-marker"));
    }
}
