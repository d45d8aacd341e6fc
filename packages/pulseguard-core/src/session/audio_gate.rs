//! VAD-gated upstream audio buffering.
//!
//! Sits between the watch's PCM stream and the agent stream. While the
//! gate is closed it keeps a short pre-roll so the agent hears the leading
//! phoneme once speech starts; while the agent is not yet ready, speech
//! chunks buffer (bounded) and flush FIFO on ready. After speech ends a
//! short silence tail is sent and periodic silence fill keeps the agent
//! stream alive.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::session::agent_stream::AgentLink;

/// 16 kHz mono PCM16: bytes per millisecond of audio.
const BYTES_PER_MS: usize = 32;

/// Pre-roll kept ahead of speech onset.
const PRE_ROLL_TARGET_MS: usize = 320;
const PRE_ROLL_TARGET_BYTES: usize = PRE_ROLL_TARGET_MS * BYTES_PER_MS;

/// Chunks buffered while the agent stream is not yet ready; beyond this
/// the oldest chunks are dropped.
const PENDING_CAP: usize = 256;

/// Trailing silence sent when speech ends.
const SILENCE_TAIL_MS: usize = 100;

/// Cadence and size of keep-alive silence during pauses.
const SILENCE_FILL_INTERVAL: Duration = Duration::from_millis(250);
const SILENCE_FILL_MS: usize = 250;

struct GateState {
    speech_active: bool,
    /// Agent stream is open and the init payload went out.
    ready: bool,
    pre_roll: VecDeque<(String, usize)>,
    pre_roll_bytes: usize,
    pending: VecDeque<String>,
    silence_fill: Option<AbortHandle>,
    last_activity: Instant,
}

/// Gate between watch audio and the agent stream.
pub struct AudioGate {
    link: Arc<AgentLink>,
    inner: Mutex<GateState>,
    silence_tail: String,
    silence_frame: String,
}

impl AudioGate {
    pub fn new(link: Arc<AgentLink>) -> Self {
        Self {
            link,
            inner: Mutex::new(GateState {
                speech_active: false,
                ready: false,
                pre_roll: VecDeque::new(),
                pre_roll_bytes: 0,
                pending: VecDeque::new(),
                silence_fill: None,
                last_activity: Instant::now(),
            }),
            silence_tail: BASE64.encode(vec![0u8; SILENCE_TAIL_MS * BYTES_PER_MS]),
            silence_frame: BASE64.encode(vec![0u8; SILENCE_FILL_MS * BYTES_PER_MS]),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Activity & state
    // ─────────────────────────────────────────────────────────────────────

    /// Records that audio arrived from the watch (idle watchdog input).
    pub fn mark_activity(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    /// Time since the last watch audio chunk.
    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }

    pub fn speech_active(&self) -> bool {
        self.inner.lock().speech_active
    }

    pub fn set_speech_active(&self, active: bool) {
        self.inner.lock().speech_active = active;
    }

    /// Marks the agent stream ready (init payload sent) and flushes any
    /// buffered speech.
    ///
    /// The buffer drains under the gate lock, so a chunk queued
    /// concurrently cannot overtake older buffered audio.
    pub fn set_ready(&self) {
        let mut state = self.inner.lock();
        state.ready = true;
        while let Some(chunk) = state.pending.pop_front() {
            self.link.send_audio_chunk(chunk);
        }
    }

    /// Marks the agent stream gone; buffered audio is dropped unless the
    /// caller asked to preserve it for an imminent reconnect.
    pub fn set_not_ready(&self, preserve_pending: bool) {
        let mut state = self.inner.lock();
        state.ready = false;
        if !preserve_pending {
            state.pending.clear();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pre-roll
    // ─────────────────────────────────────────────────────────────────────

    /// Buffers a chunk into the pre-roll ring while the gate is closed.
    pub fn queue_pre_roll(&self, b64: String, pcm_len: usize) {
        let mut state = self.inner.lock();
        state.pre_roll.push_back((b64, pcm_len));
        state.pre_roll_bytes += pcm_len;
        while state.pre_roll_bytes > PRE_ROLL_TARGET_BYTES {
            match state.pre_roll.pop_front() {
                Some((_, len)) => state.pre_roll_bytes -= len,
                None => break,
            }
        }
    }

    /// Sends the pre-roll ahead of live speech so the leading phoneme
    /// survives, then clears it.
    pub fn flush_pre_roll(&self) {
        let chunks: Vec<String> = {
            let mut state = self.inner.lock();
            state.pre_roll_bytes = 0;
            state.pre_roll.drain(..).map(|(b64, _)| b64).collect()
        };
        for chunk in chunks {
            self.queue_audio(chunk);
        }
    }

    pub fn clear_pre_roll(&self) {
        let mut state = self.inner.lock();
        state.pre_roll.clear();
        state.pre_roll_bytes = 0;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Speech delivery
    // ─────────────────────────────────────────────────────────────────────

    /// Delivers a speech chunk: straight to the agent when ready, into the
    /// bounded pending buffer otherwise.
    pub fn queue_audio(&self, b64: String) {
        let ready = self.inner.lock().ready;
        if ready && self.link.send_audio_chunk(b64.clone()) {
            return;
        }
        let mut state = self.inner.lock();
        if state.pending.len() == PENDING_CAP {
            state.pending.pop_front();
        }
        state.pending.push_back(b64);
    }

    /// Number of chunks waiting for the agent stream.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Silence
    // ─────────────────────────────────────────────────────────────────────

    /// Emits the short trailing silence after speech end.
    pub fn send_silence_tail(&self) {
        if self.inner.lock().ready {
            self.link.send_audio_chunk(self.silence_tail.clone());
        }
    }

    /// Starts periodic silence fill to keep the agent stream alive during
    /// a pause. A previous fill task is replaced.
    pub fn start_silence_fill(self: &Arc<Self>) {
        let gate = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(SILENCE_FILL_INTERVAL).await;
                let state = gate.inner.lock();
                if state.speech_active || !state.ready {
                    break;
                }
                drop(state);
                gate.link.send_audio_chunk(gate.silence_frame.clone());
            }
        })
        .abort_handle();

        let mut state = self.inner.lock();
        if let Some(old) = state.silence_fill.replace(handle) {
            old.abort();
        }
    }

    pub fn stop_silence_fill(&self) {
        if let Some(handle) = self.inner.lock().silence_fill.take() {
            handle.abort();
        }
    }

    /// Clears every buffer and stops background work (session teardown).
    pub fn reset(&self) {
        let handle = {
            let mut state = self.inner.lock();
            state.speech_active = false;
            state.ready = false;
            state.pre_roll.clear();
            state.pre_roll_bytes = 0;
            state.pending.clear();
            state.silence_fill.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> AudioGate {
        AudioGate::new(Arc::new(AgentLink::new()))
    }

    #[test]
    fn pre_roll_is_bounded_to_target() {
        let g = gate();
        // 20 ms chunks: 640 bytes each; the ring holds at most 320 ms.
        for i in 0..100 {
            g.queue_pre_roll(format!("chunk-{}", i), 640);
        }
        let state = g.inner.lock();
        assert!(state.pre_roll_bytes <= PRE_ROLL_TARGET_BYTES);
        assert_eq!(state.pre_roll.len(), PRE_ROLL_TARGET_BYTES / 640);
        // Newest chunks survive.
        assert_eq!(state.pre_roll.back().unwrap().0, "chunk-99");
    }

    #[test]
    fn audio_buffers_while_not_ready() {
        let g = gate();
        g.queue_audio("a".to_string());
        g.queue_audio("b".to_string());
        assert_eq!(g.pending_len(), 2);
    }

    #[test]
    fn pending_buffer_is_bounded() {
        let g = gate();
        for i in 0..PENDING_CAP + 50 {
            g.queue_audio(format!("c{}", i));
        }
        assert_eq!(g.pending_len(), PENDING_CAP);
        // Oldest chunks were dropped.
        let state = g.inner.lock();
        assert_eq!(state.pending.front().unwrap(), "c50");
    }

    #[test]
    fn set_not_ready_preserve_keeps_pending() {
        let g = gate();
        g.queue_audio("a".to_string());
        g.set_not_ready(true);
        assert_eq!(g.pending_len(), 1);
        g.set_not_ready(false);
        assert_eq!(g.pending_len(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let g = gate();
        g.set_speech_active(true);
        g.queue_pre_roll("p".to_string(), 640);
        g.queue_audio("a".to_string());
        g.reset();
        assert!(!g.speech_active());
        assert_eq!(g.pending_len(), 0);
        assert_eq!(g.inner.lock().pre_roll.len(), 0);
    }
}
