//! Episode lifecycle engine.
//!
//! Drives each anomaly trigger through calming, re-evaluation, visual
//! check, fusion, and escalation, with at most one active episode per
//! device. Resolved episodes migrate to a bounded history.
//!
//! Fusion tries the external generative analyst first and falls back to
//! threshold fusion. The threshold constants are demo values, not
//! clinically grounded.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::protocol::{PresageReading, TriggerVitals, Vitals};
use crate::utils::{now_millis, short_id, unit_clamp};

/// History bound: on overflow the oldest entries are dropped down to
/// [`HISTORY_TRIM`].
const HISTORY_CAP: usize = 200;
const HISTORY_TRIM: usize = 100;

// Threshold-fusion constants (demo values).
const WATCH_HR_WEIGHT: f64 = 0.7;
const WATCH_HRV_WEIGHT: f64 = 0.3;
const EXPRESSION_WEIGHT: f64 = 0.6;
const EYE_WEIGHT: f64 = 0.4;
const ESCALATE_BAR: f64 = 0.6;
const FALSE_POSITIVE_BAR: f64 = 0.3;
const WATCH_ONLY_AMBIGUOUS_BAR: f64 = 0.7;

/// Lifecycle phase of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodePhase {
    Monitoring,
    AnomalyDetected,
    Calming,
    ReEvaluating,
    VisualCheck,
    Fusing,
    Escalating,
    Resolved,
}

/// Terminal resolution of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    CalmingResolved,
    FalsePositive,
    CaregiverAcknowledged,
    EmergencyDispatched,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CalmingResolved => "calming_resolved",
            Self::FalsePositive => "false_positive",
            Self::CaregiverAcknowledged => "caregiver_acknowledged",
            Self::EmergencyDispatched => "emergency_dispatched",
        }
    }
}

/// Fusion outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionDecision {
    Escalate,
    FalsePositive,
    Ambiguous,
}

/// Structured verdict from the external generative analyst.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystVerdict {
    pub decision: FusionDecision,
    pub severity_score: f64,
    pub confidence: f64,
    pub reasoning: String,
    pub caregiver_report: String,
    pub likely_cause: String,
}

/// External generative model used as the first fusion path.
///
/// Returning `None` (unavailable, invalid response, missing fields) makes
/// the engine fall through to threshold fusion.
#[async_trait]
pub trait EpisodeAnalyst: Send + Sync {
    async fn analyze(&self, episode: &Episode) -> Option<AnalystVerdict>;
}

/// Analyst stub used when no generative model is configured.
pub struct NoAnalyst;

#[async_trait]
impl EpisodeAnalyst for NoAnalyst {
    async fn analyze(&self, _episode: &Episode) -> Option<AnalystVerdict> {
        None
    }
}

/// Result of a fusion pass, whichever engine produced it.
#[derive(Debug, Clone, Serialize)]
pub struct FusionResult {
    pub decision: FusionDecision,
    pub watch_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presage_score: Option<f64>,
    pub combined_score: f64,
    pub explanation: String,
    pub analysis_engine: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caregiver_report: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likely_cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// One timeline entry. `phase` is a free-form marker: lifecycle phases plus
/// `fusion_complete` / `escalation_upgrade` waypoints.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub phase: String,
    pub t: u64,
    pub data: Value,
}

/// The full lifecycle record from trigger to resolution for one wearer.
#[derive(Debug, Clone, Serialize)]
pub struct Episode {
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub phase: EpisodePhase,
    pub trigger: TriggerVitals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calming_started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calming_ended_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calming_vitals: Option<Vitals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presage: Option<PresageReading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fusion: Option<FusionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<FusionDecision>,
    pub escalation_level: u8,
    pub severity_score: f64,
    pub timeline: Vec<TimelineEntry>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl Episode {
    fn push_timeline(&mut self, phase: &str, data: Value) {
        self.timeline.push(TimelineEntry {
            phase: phase.to_string(),
            t: now_millis(),
            data,
        });
    }
}

/// In-memory episode lifecycle manager.
pub struct EpisodeEngine {
    active: DashMap<String, String>,
    episodes: DashMap<String, Episode>,
    history: Mutex<Vec<Episode>>,
    analyst: Arc<dyn EpisodeAnalyst>,
}

impl EpisodeEngine {
    pub fn new(analyst: Arc<dyn EpisodeAnalyst>) -> Self {
        Self {
            active: DashMap::new(),
            episodes: DashMap::new(),
            history: Mutex::new(Vec::new()),
            analyst,
        }
    }

    /// Opens an episode for a device, or returns the already-active one.
    ///
    /// Idempotent per device: calling twice with no intervening resolve
    /// yields the same episode.
    pub fn start(
        &self,
        device_id: &str,
        user_id: &str,
        trigger: TriggerVitals,
        group_id: Option<String>,
    ) -> Episode {
        if let Some(existing) = self.active_for_device(device_id) {
            return existing;
        }

        let id = short_id();
        let severity = trigger.anomaly_score.map_or(0.5, unit_clamp);
        let mut episode = Episode {
            id: id.clone(),
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            group_id,
            phase: EpisodePhase::AnomalyDetected,
            trigger: trigger.clone(),
            calming_started_at: None,
            calming_ended_at: None,
            calming_vitals: None,
            presage: None,
            fusion: None,
            decision: None,
            escalation_level: 0,
            severity_score: severity,
            timeline: Vec::new(),
            created_at: now_millis(),
            resolved_at: None,
            resolution: None,
        };
        episode.push_timeline(
            "anomaly_detected",
            serde_json::to_value(&trigger).unwrap_or(Value::Null),
        );

        self.active.insert(device_id.to_string(), id.clone());
        self.episodes.insert(id.clone(), episode.clone());
        log::info!("Episode {} started for device {}", id, device_id);
        episode
    }

    /// Moves an episode to a new phase, appending a timeline entry.
    pub fn update_phase(
        &self,
        episode_id: &str,
        phase: EpisodePhase,
        data: Option<Value>,
    ) -> Option<Episode> {
        let mut episode = self.episodes.get_mut(episode_id)?;
        episode.phase = phase;
        let marker = match phase {
            EpisodePhase::Monitoring => "monitoring",
            EpisodePhase::AnomalyDetected => "anomaly_detected",
            EpisodePhase::Calming => "calming",
            EpisodePhase::ReEvaluating => "re_evaluating",
            EpisodePhase::VisualCheck => "visual_check",
            EpisodePhase::Fusing => "fusing",
            EpisodePhase::Escalating => "escalating",
            EpisodePhase::Resolved => "resolved",
        };
        episode.push_timeline(marker, data.unwrap_or_else(|| json!({})));
        if phase == EpisodePhase::Calming {
            episode.calming_started_at = Some(now_millis());
        }
        log::info!("Episode {} -> {:?}", episode_id, phase);
        Some(episode.clone())
    }

    /// Records post-calming vitals and re-evaluates.
    ///
    /// Strictly `HR < 100` and `HRV > 30` resolves the episode as
    /// `calming_resolved`; anything else moves to the visual check.
    pub fn submit_calming(&self, episode_id: &str, vitals: Vitals) -> Option<Episode> {
        let mut resolved = None;
        {
            let mut episode = self.episodes.get_mut(episode_id)?;
            let now = now_millis();
            episode.calming_ended_at = Some(now);
            episode.calming_vitals = Some(vitals.clone());

            if vitals.heart_rate < 100.0 && vitals.hrv > 30.0 {
                episode.phase = EpisodePhase::Resolved;
                episode.resolved_at = Some(now);
                episode.resolution = Some(Resolution::CalmingResolved);
                episode.severity_score = 0.1;
                episode.push_timeline(
                    "resolved",
                    json!({
                        "reason": "calming_resolved",
                        "post_vitals": vitals,
                    }),
                );
                resolved = Some(episode.clone());
                log::info!("Episode {} resolved via calming", episode_id);
            } else {
                episode.phase = EpisodePhase::VisualCheck;
                episode.push_timeline(
                    "re_evaluating",
                    json!({"post_vitals": vitals, "result": "still_elevated"}),
                );
                episode.push_timeline(
                    "visual_check",
                    json!({"reason": "post_calming_still_elevated"}),
                );
                log::info!("Episode {} -> visual_check (calming insufficient)", episode_id);
            }
        }

        if let Some(episode) = resolved {
            self.retire(&episode.device_id, episode_id);
            return Some(episode);
        }
        self.episode(episode_id)
    }

    /// Records a visual check-in result and immediately runs fusion.
    pub async fn submit_presage(
        &self,
        episode_id: &str,
        presage: PresageReading,
    ) -> Option<Episode> {
        {
            let mut episode = self.episodes.get_mut(episode_id)?;
            episode.presage = Some(presage.clone());
            episode.phase = EpisodePhase::Fusing;
            episode.push_timeline(
                "fusing",
                serde_json::to_value(&presage).unwrap_or(Value::Null),
            );
        }
        self.run_fusion(episode_id).await
    }

    /// Runs the fusion decision: analyst first, threshold fallback.
    pub async fn run_fusion(&self, episode_id: &str) -> Option<Episode> {
        let snapshot = self.episode(episode_id)?;

        let fusion = match self.analyst.analyze(&snapshot).await {
            Some(verdict) => analyst_fusion(&snapshot, verdict),
            None => threshold_fusion(&snapshot),
        };

        let mut retire_device = None;
        {
            let mut episode = self.episodes.get_mut(episode_id)?;
            let decision = fusion.decision;
            let combined = fusion.combined_score;
            episode.decision = Some(decision);
            episode.severity_score = (combined * 1000.0).round() / 1000.0;
            episode.push_timeline(
                "fusion_complete",
                serde_json::to_value(&fusion).unwrap_or(Value::Null),
            );
            episode.fusion = Some(fusion);

            match decision {
                FusionDecision::Escalate => {
                    episode.phase = EpisodePhase::Escalating;
                    episode.escalation_level = 1;
                    episode.push_timeline(
                        "escalating",
                        json!({"level": 1, "reason": "fusion_escalate"}),
                    );
                    log::info!(
                        "Episode {} -> escalating (severity={:.2})",
                        episode_id,
                        combined
                    );
                }
                FusionDecision::FalsePositive => {
                    let now = now_millis();
                    episode.phase = EpisodePhase::Resolved;
                    episode.resolved_at = Some(now);
                    episode.resolution = Some(Resolution::FalsePositive);
                    episode.push_timeline("resolved", json!({"reason": "false_positive"}));
                    retire_device = Some(episode.device_id.clone());
                    log::info!("Episode {} resolved as false positive", episode_id);
                }
                FusionDecision::Ambiguous => {
                    episode.phase = EpisodePhase::Escalating;
                    episode.escalation_level = 1;
                    episode.push_timeline(
                        "escalating",
                        json!({"level": 1, "reason": "ambiguous"}),
                    );
                    log::info!("Episode {} -> escalating (ambiguous)", episode_id);
                }
            }
        }

        if let Some(device_id) = retire_device {
            self.retire(&device_id, episode_id);
        }
        self.find(episode_id)
    }

    /// Sets the escalation level, appending a timeline entry.
    pub fn escalate(&self, episode_id: &str, level: u8) -> Option<Episode> {
        let mut episode = self.episodes.get_mut(episode_id)?;
        episode.escalation_level = level;
        episode.push_timeline("escalation_upgrade", json!({"level": level}));
        log::info!("Episode {} escalated to level {}", episode_id, level);
        Some(episode.clone())
    }

    /// Resolves an episode and retires it to history.
    pub fn resolve(&self, episode_id: &str, resolution: Resolution) -> Option<Episode> {
        let episode = {
            let mut episode = self.episodes.get_mut(episode_id)?;
            episode.phase = EpisodePhase::Resolved;
            episode.resolved_at = Some(now_millis());
            episode.resolution = Some(resolution);
            episode.push_timeline("resolved", json!({"resolution": resolution.as_str()}));
            episode.clone()
        };
        self.retire(&episode.device_id, episode_id);
        log::info!("Episode {} resolved: {}", episode_id, resolution.as_str());
        Some(episode)
    }

    /// Active episode for a device, if any.
    pub fn active_for_device(&self, device_id: &str) -> Option<Episode> {
        let id = self.active.get(device_id).map(|e| e.value().clone())?;
        self.episode(&id)
    }

    /// Episode by id, active only.
    pub fn episode(&self, episode_id: &str) -> Option<Episode> {
        self.episodes.get(episode_id).map(|e| e.clone())
    }

    /// Episode by id, searching active then history.
    pub fn find(&self, episode_id: &str) -> Option<Episode> {
        self.episode(episode_id).or_else(|| {
            self.history
                .lock()
                .iter()
                .rev()
                .find(|e| e.id == episode_id)
                .cloned()
        })
    }

    /// All active episodes.
    pub fn active_episodes(&self) -> Vec<Episode> {
        self.episodes.iter().map(|e| e.value().clone()).collect()
    }

    /// Most recent resolved episodes, oldest first.
    pub fn recent_history(&self, limit: usize) -> Vec<Episode> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    fn retire(&self, device_id: &str, episode_id: &str) {
        self.active
            .remove_if(device_id, |_, active_id| active_id == episode_id);
        if let Some((_, episode)) = self.episodes.remove(episode_id) {
            let mut history = self.history.lock();
            history.push(episode);
            if history.len() > HISTORY_CAP {
                let excess = history.len() - HISTORY_TRIM;
                history.drain(..excess);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fusion
// ─────────────────────────────────────────────────────────────────────────────

fn watch_score(trigger: &TriggerVitals) -> f64 {
    let hr = trigger.vitals.heart_rate;
    let hrv = trigger.vitals.hrv;
    let hr_score = unit_clamp((hr - 80.0) / 80.0);
    let hrv_score = unit_clamp((50.0 - hrv) / 40.0);
    hr_score * WATCH_HR_WEIGHT + hrv_score * WATCH_HRV_WEIGHT
}

fn expression_score(expression: &str) -> f64 {
    match expression {
        "calm" => 0.1,
        "confused" => 0.4,
        "distressed" => 0.8,
        "pain" => 0.95,
        _ => 0.5,
    }
}

fn eye_score(eye: &str) -> f64 {
    match eye {
        "normal" => 0.1,
        "slow" => 0.5,
        "unresponsive" => 0.95,
        _ => 0.3,
    }
}

fn analyst_fusion(episode: &Episode, verdict: AnalystVerdict) -> FusionResult {
    FusionResult {
        decision: verdict.decision,
        watch_score: round3(watch_score(&episode.trigger)),
        presage_score: None,
        combined_score: round3(unit_clamp(verdict.severity_score)),
        explanation: verdict.reasoning,
        analysis_engine: "analyst",
        caregiver_report: Some(verdict.caregiver_report),
        likely_cause: Some(verdict.likely_cause),
        confidence: Some(verdict.confidence),
    }
}

fn threshold_fusion(episode: &Episode) -> FusionResult {
    let watch = watch_score(&episode.trigger);

    if let Some(presage) = &episode.presage {
        let presage_score = (expression_score(&presage.facial_expression) * EXPRESSION_WEIGHT
            + eye_score(&presage.eye_responsiveness) * EYE_WEIGHT)
            * presage.confidence_score;
        let combined = watch * 0.5 + presage_score * 0.5;

        let decision = if combined >= ESCALATE_BAR {
            FusionDecision::Escalate
        } else if combined <= FALSE_POSITIVE_BAR {
            FusionDecision::FalsePositive
        } else {
            FusionDecision::Ambiguous
        };

        let explanation = match decision {
            FusionDecision::Escalate => format!(
                "Watch vitals elevated (HR={}) and visual check shows {} expression \
                 with {} eye response. Combined severity {:.0}% warrants escalation.",
                episode.trigger.vitals.heart_rate,
                presage.facial_expression,
                presage.eye_responsiveness,
                combined * 100.0
            ),
            FusionDecision::FalsePositive => format!(
                "Despite elevated watch readings, visual check shows {} expression \
                 with normal responsiveness. Likely exercise or stress, not a medical event.",
                presage.facial_expression
            ),
            FusionDecision::Ambiguous => format!(
                "Mixed signals: watch score {:.0}%, visual score {:.0}%. Monitoring recommended.",
                watch * 100.0,
                presage_score * 100.0
            ),
        };

        FusionResult {
            decision,
            watch_score: round3(watch),
            presage_score: Some(round3(presage_score)),
            combined_score: round3(combined),
            explanation,
            analysis_engine: "threshold",
            caregiver_report: None,
            likely_cause: None,
            confidence: None,
        }
    } else {
        let decision = if watch >= WATCH_ONLY_AMBIGUOUS_BAR {
            FusionDecision::Ambiguous
        } else {
            FusionDecision::FalsePositive
        };
        let tail = match decision {
            FusionDecision::Ambiguous => "Recommending escalation due to sustained elevated vitals.",
            _ => "Watch-only data suggests false positive.",
        };
        FusionResult {
            decision,
            watch_score: round3(watch),
            presage_score: None,
            combined_score: round3(watch),
            explanation: format!(
                "No visual check-in data available. Watch score: {:.0}%. {}",
                watch * 100.0,
                tail
            ),
            analysis_engine: "threshold",
            caregiver_report: None,
            likely_cause: None,
            confidence: None,
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> EpisodeEngine {
        EpisodeEngine::new(Arc::new(NoAnalyst))
    }

    fn trigger(hr: f64, hrv: f64, score: f64) -> TriggerVitals {
        TriggerVitals {
            vitals: Vitals {
                heart_rate: hr,
                hrv,
                acceleration: 1.0,
                skin_temp: 36.5,
            },
            anomaly_score: Some(score),
            anomaly_type: Some("elevated_hr".to_string()),
        }
    }

    fn vitals(hr: f64, hrv: f64) -> Vitals {
        Vitals {
            heart_rate: hr,
            hrv,
            acceleration: 1.0,
            skin_temp: 36.5,
        }
    }

    fn presage(expression: &str, eye: &str, confidence: f64) -> PresageReading {
        PresageReading {
            facial_expression: expression.to_string(),
            eye_responsiveness: eye.to_string(),
            confidence_score: confidence,
            ..PresageReading::default()
        }
    }

    #[test]
    fn start_seeds_timeline_and_severity() {
        let engine = engine();
        let ep = engine.start("d1", "u1", trigger(142.0, 22.0, 0.75), None);
        assert_eq!(ep.phase, EpisodePhase::AnomalyDetected);
        assert_eq!(ep.escalation_level, 0);
        assert_eq!(ep.severity_score, 0.75);
        assert_eq!(ep.timeline.len(), 1);
        assert_eq!(ep.timeline[0].phase, "anomaly_detected");
    }

    #[test]
    fn start_is_idempotent_per_device() {
        let engine = engine();
        let first = engine.start("d1", "u1", trigger(142.0, 22.0, 0.75), None);
        let second = engine.start("d1", "u1", trigger(150.0, 20.0, 0.9), None);
        assert_eq!(first.id, second.id);

        let other = engine.start("d2", "u2", trigger(142.0, 22.0, 0.75), None);
        assert_ne!(other.id, first.id);
        assert_eq!(engine.active_episodes().len(), 2);
    }

    #[test]
    fn good_post_vitals_resolve_via_calming() {
        let engine = engine();
        let ep = engine.start("d1", "u1", trigger(142.0, 22.0, 0.75), None);
        engine.update_phase(&ep.id, EpisodePhase::Calming, None);

        let result = engine.submit_calming(&ep.id, vitals(78.0, 45.0)).unwrap();
        assert_eq!(result.phase, EpisodePhase::Resolved);
        assert_eq!(result.resolution, Some(Resolution::CalmingResolved));
        assert!(result.resolved_at.is_some());
        assert!(engine.active_for_device("d1").is_none());
        assert_eq!(engine.recent_history(10).len(), 1);
    }

    #[test]
    fn boundary_vitals_do_not_resolve() {
        // Exactly HR=100 and HRV=30: strict inequalities, no resolution.
        let engine = engine();
        let ep = engine.start("d1", "u1", trigger(142.0, 22.0, 0.75), None);
        engine.update_phase(&ep.id, EpisodePhase::Calming, None);

        let result = engine.submit_calming(&ep.id, vitals(100.0, 30.0)).unwrap();
        assert_eq!(result.phase, EpisodePhase::VisualCheck);
        assert!(result.resolution.is_none());
        assert!(engine.active_for_device("d1").is_some());
    }

    #[tokio::test]
    async fn fusion_escalates_on_distressed_presage() {
        // S2: trigger {142, 22}, post-calming elevated, presage distressed/slow
        // at 0.85 confidence: watch≈0.83, presage≈0.578, combined≈0.704.
        let engine = engine();
        let ep = engine.start("d1", "u1", trigger(142.0, 22.0, 0.75), None);
        engine.update_phase(&ep.id, EpisodePhase::Calming, None);
        engine.submit_calming(&ep.id, vitals(130.0, 18.0)).unwrap();

        let result = engine
            .submit_presage(&ep.id, presage("distressed", "slow", 0.85))
            .await
            .unwrap();

        assert_eq!(result.decision, Some(FusionDecision::Escalate));
        assert_eq!(result.phase, EpisodePhase::Escalating);
        assert_eq!(result.escalation_level, 1);
        let fusion = result.fusion.as_ref().unwrap();
        assert!(fusion.combined_score >= 0.6);
        assert!((fusion.watch_score - 0.753).abs() < 0.06);
        assert_eq!(fusion.presage_score, Some(0.578));
    }

    #[tokio::test]
    async fn fusion_false_positive_on_calm_presage() {
        // S3: moderate trigger {115, 40}, calm/normal presage at 0.9:
        // watch≈0.381, presage=0.09, combined≈0.235.
        let engine = engine();
        let ep = engine.start("d1", "u1", trigger(115.0, 40.0, 0.45), None);
        engine.update_phase(&ep.id, EpisodePhase::Calming, None);
        engine.submit_calming(&ep.id, vitals(120.0, 18.0)).unwrap();

        let result = engine
            .submit_presage(&ep.id, presage("calm", "normal", 0.9))
            .await
            .unwrap();

        assert_eq!(result.decision, Some(FusionDecision::FalsePositive));
        assert_eq!(result.phase, EpisodePhase::Resolved);
        assert_eq!(result.resolution, Some(Resolution::FalsePositive));
        let fusion = result.fusion.as_ref().unwrap();
        assert!(fusion.combined_score <= 0.3);
        assert_eq!(fusion.presage_score, Some(0.09));
        assert!(engine.active_for_device("d1").is_none());
    }

    #[tokio::test]
    async fn fusion_without_presage_is_watch_only() {
        let engine = engine();
        let ep = engine.start("d1", "u1", trigger(142.0, 22.0, 0.75), None);
        engine.update_phase(&ep.id, EpisodePhase::VisualCheck, None);

        let result = engine.run_fusion(&ep.id).await.unwrap();
        let fusion = result.fusion.as_ref().unwrap();
        assert!(fusion.presage_score.is_none());
        assert!(matches!(
            fusion.decision,
            FusionDecision::Ambiguous | FusionDecision::FalsePositive
        ));
    }

    #[tokio::test]
    async fn analyst_verdict_overrides_threshold() {
        struct FixedAnalyst;
        #[async_trait]
        impl EpisodeAnalyst for FixedAnalyst {
            async fn analyze(&self, _episode: &Episode) -> Option<AnalystVerdict> {
                Some(AnalystVerdict {
                    decision: FusionDecision::Escalate,
                    severity_score: 0.91,
                    confidence: 0.8,
                    reasoning: "sustained tachycardia with poor recovery".to_string(),
                    caregiver_report: "Needs a check-in now.".to_string(),
                    likely_cause: "cardiac_event".to_string(),
                })
            }
        }

        let engine = EpisodeEngine::new(Arc::new(FixedAnalyst));
        let ep = engine.start("d1", "u1", trigger(115.0, 40.0, 0.45), None);
        let result = engine.run_fusion(&ep.id).await.unwrap();
        let fusion = result.fusion.as_ref().unwrap();
        assert_eq!(fusion.analysis_engine, "analyst");
        assert_eq!(fusion.combined_score, 0.91);
        assert_eq!(fusion.likely_cause.as_deref(), Some("cardiac_event"));
        assert_eq!(result.phase, EpisodePhase::Escalating);
    }

    #[test]
    fn escalation_levels_progress() {
        let engine = engine();
        let ep = engine.start("d1", "u1", trigger(142.0, 22.0, 0.75), None);
        for level in 1..=3u8 {
            let updated = engine.escalate(&ep.id, level).unwrap();
            assert_eq!(updated.escalation_level, level);
        }
    }

    #[test]
    fn resolve_retires_and_indexes_clear() {
        let engine = engine();
        let ep = engine.start("d1", "u1", trigger(142.0, 22.0, 0.75), None);
        let resolved = engine
            .resolve(&ep.id, Resolution::CaregiverAcknowledged)
            .unwrap();
        assert_eq!(resolved.phase, EpisodePhase::Resolved);
        assert!(engine.active_for_device("d1").is_none());
        assert!(engine.find(&ep.id).is_some());
        assert!(engine.resolve(&ep.id, Resolution::FalsePositive).is_none());
    }

    #[test]
    fn history_overflow_trims_to_newest_100() {
        let engine = engine();
        for i in 0..=HISTORY_CAP {
            let device = format!("d{}", i);
            let ep = engine.start(&device, "u1", trigger(142.0, 22.0, 0.75), None);
            engine.resolve(&ep.id, Resolution::CaregiverAcknowledged);
        }
        assert_eq!(engine.recent_history(usize::MAX).len(), HISTORY_TRIM);
    }
}
