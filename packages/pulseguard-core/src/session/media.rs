//! Media automation for the wearer device.
//!
//! Tracks what the watch is playing, sends it start/stop/duck commands,
//! and suppresses unducking while the agent is mid-sentence. Exhausted
//! playlists surface as an effect the session turns into either a
//! contextual update or a fresh conversation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol::ServerMessage;
use crate::session::WatchLink;

/// Agent audio within this window counts as "agent is talking".
const AGENT_TALK_HOLD: Duration = Duration::from_millis(1000);

/// Media the watch can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAction {
    PlayMusic,
    DisplayImages,
}

impl MediaAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlayMusic => "play_music",
            Self::DisplayImages => "display_images",
        }
    }

    fn media_type(self) -> &'static str {
        match self {
            Self::PlayMusic => "music",
            Self::DisplayImages => "images",
        }
    }
}

/// What to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStopAction {
    Music,
    Images,
    All,
}

impl MediaStopAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Music => "music",
            Self::Images => "images",
            Self::All => "all",
        }
    }
}

/// Effect of a watch media event that needs session-level handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEffect {
    /// The playlist of the given media type ran out.
    Exhausted(String),
}

#[derive(Default)]
struct MediaState {
    music: bool,
    images: bool,
    ducked: bool,
    agent_audio_at: Option<Instant>,
}

/// Controller for the wearer device's media playback.
pub struct MediaAutomation {
    watch: Arc<dyn WatchLink>,
    inner: Mutex<MediaState>,
}

impl MediaAutomation {
    pub fn new(watch: Arc<dyn WatchLink>) -> Self {
        Self {
            watch,
            inner: Mutex::new(MediaState::default()),
        }
    }

    pub fn is_music_playing(&self) -> bool {
        self.inner.lock().music
    }

    pub fn is_images_displaying(&self) -> bool {
        self.inner.lock().images
    }

    /// Called before arming a new start so stale duck state never leaks
    /// into the fresh playback.
    pub fn on_new_start_requested(&self) {
        self.inner.lock().ducked = false;
    }

    /// Starts media on the watch and returns the announcement the session
    /// narrates over TTS.
    pub fn start_media(&self, action: MediaAction, vibe: &str) -> String {
        {
            let mut state = self.inner.lock();
            match action {
                MediaAction::PlayMusic => state.music = true,
                MediaAction::DisplayImages => state.images = true,
            }
        }
        self.watch.send(&ServerMessage::MediaStart {
            action: action.as_str().to_string(),
            vibe: vibe.to_string(),
        });
        log::info!("[Media] Started {} (vibe={})", action.media_type(), vibe);
        match action {
            MediaAction::PlayMusic => format!("Starting some {} music for you.", vibe),
            MediaAction::DisplayImages => format!("Showing some {} pictures for you.", vibe),
        }
    }

    /// Stops media on the watch.
    pub fn stop(&self, action: MediaStopAction) {
        let was_playing = {
            let mut state = self.inner.lock();
            let was = state.music || state.images;
            match action {
                MediaStopAction::Music => state.music = false,
                MediaStopAction::Images => state.images = false,
                MediaStopAction::All => {
                    state.music = false;
                    state.images = false;
                }
            }
            was
        };
        if was_playing {
            self.watch.send(&ServerMessage::MediaStop {
                action: action.as_str().to_string(),
            });
            log::info!("[Media] Stopped {}", action.as_str());
        }
    }

    /// Session teardown: drop all media without further watch traffic
    /// beyond a final stop.
    pub fn deactivate(&self) {
        self.stop(MediaStopAction::All);
        self.inner.lock().ducked = false;
    }

    /// Agent produced an audio chunk; holds off unducking.
    pub fn on_agent_audio_chunk(&self) {
        self.inner.lock().agent_audio_at = Some(Instant::now());
    }

    /// Wearer started speaking: duck whatever is playing.
    pub fn on_user_speech_start(&self) {
        let mut state = self.inner.lock();
        if (state.music || state.images) && !state.ducked {
            state.ducked = true;
            drop(state);
            self.watch.send(&ServerMessage::MediaDuck);
        }
    }

    /// Wearer stopped speaking: unduck unless the agent is mid-sentence.
    pub fn on_user_speech_end(&self) {
        let mut state = self.inner.lock();
        if !state.ducked {
            return;
        }
        let agent_talking = state
            .agent_audio_at
            .is_some_and(|t| t.elapsed() < AGENT_TALK_HOLD);
        if agent_talking {
            return;
        }
        state.ducked = false;
        drop(state);
        self.watch.send(&ServerMessage::MediaUnduck);
    }

    /// Interprets a media event from the watch.
    pub fn on_media_event(&self, event: &str, payload: &serde_json::Value) -> Option<MediaEffect> {
        match event {
            "media-exhausted" | "playback-finished" => {
                let media_type = payload
                    .get("media")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        if self.is_music_playing() {
                            "music".to_string()
                        } else {
                            "images".to_string()
                        }
                    });
                {
                    let mut state = self.inner.lock();
                    match media_type.as_str() {
                        "music" => state.music = false,
                        "images" => state.images = false,
                        _ => {}
                    }
                }
                Some(MediaEffect::Exhausted(media_type))
            }
            "music-started" => {
                self.inner.lock().music = true;
                None
            }
            "images-started" => {
                self.inner.lock().images = true;
                None
            }
            other => {
                log::debug!("[Media] Ignoring media event {:?}", other);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests_support::RecordingWatch;
    use serde_json::json;

    fn media() -> (MediaAutomation, Arc<RecordingWatch>) {
        let watch = Arc::new(RecordingWatch::default());
        let media = MediaAutomation::new(Arc::clone(&watch) as Arc<dyn WatchLink>);
        (media, watch)
    }

    #[test]
    fn start_sets_flag_and_commands_watch() {
        let (media, watch) = media();
        let announcement = media.start_media(MediaAction::PlayMusic, "calm");
        assert!(media.is_music_playing());
        assert!(announcement.contains("calm"));
        assert!(watch.saw_type("media-start"));
    }

    #[test]
    fn speech_ducks_and_unducks() {
        let (media, watch) = media();
        media.start_media(MediaAction::PlayMusic, "calm");

        media.on_user_speech_start();
        assert!(watch.saw_type("media-duck"));

        media.on_user_speech_end();
        assert!(watch.saw_type("media-unduck"));
    }

    #[test]
    fn unduck_held_while_agent_talks() {
        let (media, watch) = media();
        media.start_media(MediaAction::PlayMusic, "calm");
        media.on_user_speech_start();
        media.on_agent_audio_chunk();

        media.on_user_speech_end();
        assert!(!watch.saw_type("media-unduck"));
    }

    #[test]
    fn duck_without_media_is_silent() {
        let (media, watch) = media();
        media.on_user_speech_start();
        assert!(!watch.saw_type("media-duck"));
    }

    #[test]
    fn exhausted_event_clears_flag_and_surfaces() {
        let (media, _watch) = media();
        media.start_media(MediaAction::PlayMusic, "calm");

        let effect = media.on_media_event("media-exhausted", &json!({"media": "music"}));
        assert_eq!(effect, Some(MediaEffect::Exhausted("music".to_string())));
        assert!(!media.is_music_playing());
    }

    #[test]
    fn stop_all_on_deactivate() {
        let (media, watch) = media();
        media.start_media(MediaAction::PlayMusic, "calm");
        media.start_media(MediaAction::DisplayImages, "family");
        media.deactivate();
        assert!(!media.is_music_playing());
        assert!(!media.is_images_displaying());
        assert!(watch.saw_type("media-stop"));
    }
}
