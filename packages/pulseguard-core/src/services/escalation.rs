//! Timed escalation ladder for episodes in the `escalating` phase.
//!
//! Level 1 promotes to level 2 after 120 s and level 2 to level 3 after
//! 300 s, notifying the caregiver at every step. At most one timer task is
//! alive per episode; resolving or acknowledging cancels it, and a timer
//! firing for an already-resolved episode is a no-op.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::protocol::ServerMessage;
use crate::services::connection_plane::ConnectionPlane;
use crate::services::episodes::{Episode, EpisodeEngine, EpisodePhase};
use crate::utils::now_millis;

/// Delay before level 1 promotes to level 2.
const LEVEL_2_DELAY: Duration = Duration::from_secs(120);
/// Delay before level 2 promotes to level 3.
const LEVEL_3_DELAY: Duration = Duration::from_secs(300);
/// Terminal escalation level.
const MAX_LEVEL: u8 = 3;

/// Manages timed escalation for active episodes.
pub struct EscalationService {
    episodes: Arc<EpisodeEngine>,
    plane: Arc<ConnectionPlane>,
    timers: DashMap<String, JoinHandle<()>>,
}

impl EscalationService {
    pub fn new(episodes: Arc<EpisodeEngine>, plane: Arc<ConnectionPlane>) -> Self {
        Self {
            episodes,
            plane,
            timers: DashMap::new(),
        }
    }

    /// Begins the escalation chain for an episode at its current level.
    ///
    /// Notifies the caregiver immediately and arms the promotion timer.
    /// Any previous timer for the episode is cancelled first.
    pub fn start(self: &Arc<Self>, episode: &Episode) {
        self.cancel(&episode.id);

        let level = episode.escalation_level.max(1);
        log::info!(
            "Starting escalation chain for episode {} at level {}",
            episode.id,
            level
        );
        self.notify_caregiver(episode, level);

        if level < MAX_LEVEL {
            self.arm_timer(&episode.id, promotion_delay(level), level + 1);
        }
    }

    /// Cancels the pending timer for an episode, if one is alive.
    pub fn cancel(&self, episode_id: &str) {
        if let Some((_, handle)) = self.timers.remove(episode_id) {
            handle.abort();
            log::info!("Cancelled escalation for episode {}", episode_id);
        }
    }

    /// Whether a promotion timer is currently armed for an episode.
    pub fn is_armed(&self, episode_id: &str) -> bool {
        self.timers.contains_key(episode_id)
    }

    fn arm_timer(self: &Arc<Self>, episode_id: &str, delay: Duration, next_level: u8) {
        let service = Arc::clone(self);
        let id = episode_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            service.fire(&id, next_level).await;
        });
        if let Some(old) = self.timers.insert(episode_id.to_string(), handle) {
            old.abort();
        }
    }

    /// Promotes an episode when its timer fires.
    async fn fire(self: Arc<Self>, episode_id: &str, next_level: u8) {
        self.timers.remove(episode_id);

        // The episode may have resolved while the timer slept.
        let Some(episode) = self.episodes.episode(episode_id) else {
            return;
        };
        if episode.phase == EpisodePhase::Resolved {
            return;
        }

        let Some(episode) = self.episodes.escalate(episode_id, next_level) else {
            return;
        };
        self.notify_caregiver(&episode, next_level);

        if next_level < MAX_LEVEL {
            self.arm_timer(episode_id, LEVEL_3_DELAY, next_level + 1);
        }
    }

    fn notify_caregiver(&self, episode: &Episode, level: u8) {
        let msg = ServerMessage::CaregiverAlert {
            episode_id: episode.id.clone(),
            user_id: episode.user_id.clone(),
            device_id: episode.device_id.clone(),
            escalation_level: level,
            level_label: level_label(level).to_string(),
            severity_score: episode.severity_score,
            phase: episode.phase,
            fusion_result: episode
                .fusion
                .as_ref()
                .and_then(|f| serde_json::to_value(f).ok()),
            timestamp: now_millis(),
        };

        if let Some(group_id) = &episode.group_id {
            self.plane.broadcast_to_group(group_id, &msg);
        }
        self.plane.broadcast_to_dashboards(&msg);

        log::info!(
            "Caregiver alert sent for episode {} (level={}, severity={:.2})",
            episode.id,
            level,
            episode.severity_score
        );
    }
}

fn promotion_delay(level: u8) -> Duration {
    if level == 1 {
        LEVEL_2_DELAY
    } else {
        LEVEL_3_DELAY
    }
}

fn level_label(level: u8) -> &'static str {
    match level {
        1 => "Primary Contact",
        2 => "Secondary Contacts",
        3 => "Emergency Services",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TriggerVitals;
    use crate::services::episodes::{NoAnalyst, Resolution};

    fn fixture() -> (Arc<EscalationService>, Arc<EpisodeEngine>) {
        let plane = Arc::new(ConnectionPlane::new(16));
        let episodes = Arc::new(EpisodeEngine::new(Arc::new(NoAnalyst)));
        let service = Arc::new(EscalationService::new(Arc::clone(&episodes), plane));
        (service, episodes)
    }

    fn escalating_episode(episodes: &EpisodeEngine) -> Episode {
        let ep = episodes.start("d1", "u1", TriggerVitals::default(), None);
        episodes.update_phase(&ep.id, EpisodePhase::Escalating, None);
        episodes.escalate(&ep.id, 1).unwrap()
    }

    async fn settle() {
        // Let a fired timer task run.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn promotes_on_schedule() {
        let (service, episodes) = fixture();
        let ep = escalating_episode(&episodes);
        service.start(&ep);
        tokio::task::yield_now().await;
        assert!(service.is_armed(&ep.id));

        // No promotion before the deadline.
        tokio::time::advance(Duration::from_secs(100)).await;
        settle().await;
        assert_eq!(episodes.episode(&ep.id).unwrap().escalation_level, 1);

        // 120 s: level 2, new timer armed.
        tokio::time::advance(Duration::from_secs(21)).await;
        settle().await;
        assert_eq!(episodes.episode(&ep.id).unwrap().escalation_level, 2);
        assert!(service.is_armed(&ep.id));

        // +300 s: level 3, chain complete.
        tokio::time::advance(Duration::from_secs(301)).await;
        settle().await;
        assert_eq!(episodes.episode(&ep.id).unwrap().escalation_level, 3);
        assert!(!service.is_armed(&ep.id));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_promotion() {
        let (service, episodes) = fixture();
        let ep = escalating_episode(&episodes);
        service.start(&ep);
        tokio::task::yield_now().await;

        // Caregiver acknowledges at t=100 s.
        tokio::time::advance(Duration::from_secs(100)).await;
        service.cancel(&ep.id);
        episodes.resolve(&ep.id, Resolution::CaregiverAcknowledged);

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        let resolved = episodes.find(&ep.id).unwrap();
        assert_eq!(resolved.escalation_level, 1);
        assert!(!service.is_armed(&ep.id));
    }

    #[tokio::test(start_paused = true)]
    async fn firing_for_resolved_episode_is_noop() {
        let (service, episodes) = fixture();
        let ep = escalating_episode(&episodes);
        service.start(&ep);
        tokio::task::yield_now().await;

        // Episode resolves but the timer is (incorrectly) left alive; the
        // firing must still be a no-op.
        episodes.resolve(&ep.id, Resolution::CaregiverAcknowledged);
        tokio::time::advance(Duration::from_secs(121)).await;
        settle().await;

        assert_eq!(episodes.find(&ep.id).unwrap().escalation_level, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_timer() {
        let (service, episodes) = fixture();
        let ep = escalating_episode(&episodes);
        service.start(&ep);
        service.start(&ep);
        tokio::task::yield_now().await;
        assert!(service.is_armed(&ep.id));

        tokio::time::advance(Duration::from_secs(121)).await;
        settle().await;
        // Exactly one promotion despite the double start.
        assert_eq!(episodes.episode(&ep.id).unwrap().escalation_level, 2);
    }
}
