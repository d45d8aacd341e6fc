//! Zone and group aggregation of per-device anomaly scores.
//!
//! Rolls the latest device scores up into scope-level status with the
//! pattern rule (`anomalous >= K_min` and `avg > T_pattern`), keeps a
//! bounded history of snapshots per scope, and produces the community-wide
//! summary. Family groups use a looser rule: any single anomalous member
//! is at least a warning.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::services::connection_plane::ConnectionPlane;
use crate::services::score_registry::ScoreRegistry;
use crate::state::AggregationConfig;
use crate::utils::now_millis;

/// Snapshots retained per scope.
const HISTORY_CAP: usize = 300;

/// Scope status tiers, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeStatus {
    Safe,
    Elevated,
    Warning,
    Critical,
}

/// Group cohort type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Zone,
    Family,
    Community,
}

/// One aggregation pass over a scope.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationSnapshot {
    pub scope_id: String,
    pub scope_type: GroupType,
    pub avg_score: f64,
    pub max_score: f64,
    pub status: ScopeStatus,
    pub active_devices: usize,
    pub anomalous_devices: usize,
    pub is_pattern: bool,
    pub device_scores: BTreeMap<String, f64>,
    pub computed_at: u64,
}

impl AggregationSnapshot {
    fn empty(scope_id: &str, scope_type: GroupType) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            scope_type,
            avg_score: 0.0,
            max_score: 0.0,
            status: ScopeStatus::Safe,
            active_devices: 0,
            anomalous_devices: 0,
            is_pattern: false,
            device_scores: BTreeMap::new(),
            computed_at: now_millis(),
        }
    }
}

/// Community-wide rollup across zones.
#[derive(Debug, Clone, Serialize)]
pub struct CommunitySummary {
    pub overall_status: ScopeStatus,
    pub total_devices: usize,
    pub total_anomalous: usize,
    pub pattern_zones: usize,
    pub zones: Vec<AggregationSnapshot>,
    pub computed_at: u64,
}

/// Aggregates individual anomaly scores into zone- and group-level status.
pub struct AggregationEngine {
    plane: Arc<ConnectionPlane>,
    scores: Arc<ScoreRegistry>,
    config: AggregationConfig,
    history: DashMap<String, Mutex<VecDeque<AggregationSnapshot>>>,
}

impl AggregationEngine {
    pub fn new(
        plane: Arc<ConnectionPlane>,
        scores: Arc<ScoreRegistry>,
        config: AggregationConfig,
    ) -> Self {
        Self {
            plane,
            scores,
            config,
            history: DashMap::new(),
        }
    }

    /// Computes the current status of a zone from its live devices.
    ///
    /// The snapshot is built fully before being appended to history, so a
    /// concurrent reader can never observe a partially written pass.
    pub fn compute_zone(&self, zone_id: &str) -> AggregationSnapshot {
        let devices = self.plane.devices_in_zone(zone_id);
        let snapshot = if devices.is_empty() {
            AggregationSnapshot::empty(zone_id, GroupType::Zone)
        } else {
            let device_scores: BTreeMap<String, f64> = devices
                .into_iter()
                .map(|d| {
                    let score = self.scores.score(&d);
                    (d, score)
                })
                .collect();
            self.build_snapshot(zone_id, GroupType::Zone, device_scores)
        };
        self.push_history(snapshot.clone());
        snapshot
    }

    /// Computes the current status of a group from its members' devices.
    ///
    /// Membership comes from the external store; the engine only consumes
    /// the member list.
    pub fn compute_group(
        &self,
        group_id: &str,
        group_type: GroupType,
        member_user_ids: &[String],
    ) -> AggregationSnapshot {
        let mut device_scores = BTreeMap::new();
        for user_id in member_user_ids {
            for device_id in self.plane.devices_for_user(user_id) {
                let score = self.scores.score(&device_id);
                device_scores.insert(device_id, score);
            }
        }
        let snapshot = if device_scores.is_empty() {
            AggregationSnapshot::empty(group_id, group_type)
        } else {
            self.build_snapshot(group_id, group_type, device_scores)
        };
        self.push_history(snapshot.clone());
        snapshot
    }

    fn build_snapshot(
        &self,
        scope_id: &str,
        scope_type: GroupType,
        device_scores: BTreeMap<String, f64>,
    ) -> AggregationSnapshot {
        let scores: Vec<f64> = device_scores.values().copied().collect();
        let avg_score = scores.iter().sum::<f64>() / scores.len() as f64;
        let max_score = scores.iter().copied().fold(0.0f64, f64::max);
        let anomalous = scores
            .iter()
            .filter(|s| **s > self.config.anomaly_threshold)
            .count();

        let is_pattern = anomalous >= self.config.community_min_affected
            && avg_score > self.config.community_anomaly_threshold;

        let status = match scope_type {
            GroupType::Family => {
                // Family cohorts: any anomalous member is at least a warning.
                if anomalous > 0 && max_score > 0.8 {
                    ScopeStatus::Critical
                } else if anomalous > 0 {
                    ScopeStatus::Warning
                } else {
                    ScopeStatus::Safe
                }
            }
            GroupType::Zone | GroupType::Community => {
                if is_pattern {
                    ScopeStatus::Critical
                } else if anomalous >= 2 || max_score > 0.7 {
                    ScopeStatus::Warning
                } else if anomalous >= 1 || avg_score > 0.3 {
                    ScopeStatus::Elevated
                } else {
                    ScopeStatus::Safe
                }
            }
        };

        AggregationSnapshot {
            scope_id: scope_id.to_string(),
            scope_type,
            avg_score,
            max_score,
            status,
            active_devices: device_scores.len(),
            anomalous_devices: anomalous,
            is_pattern: is_pattern && scope_type != GroupType::Family,
            device_scores,
            computed_at: now_millis(),
        }
    }

    fn push_history(&self, snapshot: AggregationSnapshot) {
        let entry = self
            .history
            .entry(snapshot.scope_id.clone())
            .or_insert_with(|| Mutex::new(VecDeque::with_capacity(HISTORY_CAP)));
        let mut ring = entry.lock();
        if ring.len() == HISTORY_CAP {
            ring.pop_front();
        }
        ring.push_back(snapshot);
    }

    /// Latest snapshot for a scope, if one has been computed.
    pub fn latest(&self, scope_id: &str) -> Option<AggregationSnapshot> {
        self.history
            .get(scope_id)
            .and_then(|ring| ring.lock().back().cloned())
    }

    /// Up to `limit` most recent snapshots for a scope, oldest first.
    pub fn scope_history(&self, scope_id: &str, limit: usize) -> Vec<AggregationSnapshot> {
        self.history
            .get(scope_id)
            .map(|ring| {
                let ring = ring.lock();
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Computes every listed zone and rolls them into a community summary.
    pub fn community_summary(&self, zone_ids: &[String]) -> CommunitySummary {
        let zones: Vec<AggregationSnapshot> =
            zone_ids.iter().map(|z| self.compute_zone(z)).collect();
        let total_devices = zones.iter().map(|z| z.active_devices).sum();
        let total_anomalous: usize = zones.iter().map(|z| z.anomalous_devices).sum();
        let pattern_zones = zones.iter().filter(|z| z.is_pattern).count();

        let overall_status = if pattern_zones > 0 {
            ScopeStatus::Critical
        } else if total_anomalous >= 3 {
            ScopeStatus::Warning
        } else if total_anomalous >= 1 {
            ScopeStatus::Elevated
        } else {
            ScopeStatus::Safe
        };

        CommunitySummary {
            overall_status,
            total_devices,
            total_anomalous,
            pattern_zones,
            zones,
            computed_at: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::connection_plane::Role;
    use crate::services::inference::InferenceOutput;

    fn engine_with_zone(scores: &[f64]) -> (AggregationEngine, Vec<String>) {
        let plane = Arc::new(ConnectionPlane::new(16));
        let registry = Arc::new(ScoreRegistry::new());
        let mut devices = Vec::new();
        for (i, score) in scores.iter().enumerate() {
            let device_id = format!("d{}", i);
            let (conn, rx) = plane.accept();
            plane.authenticate_device(
                &conn,
                Role::Device,
                &device_id,
                &format!("u{}", i),
                &["z1".to_string()],
                &[],
            );
            std::mem::forget(rx); // keep the outbound channel alive
            registry.record(
                &device_id,
                InferenceOutput {
                    overall_score: *score,
                    max_score: *score,
                    is_anomaly: *score > 0.5,
                    per_timestep: vec![*score],
                    attention_hint: 0,
                    computed_at: 0,
                },
            );
            devices.push(device_id);
        }
        let engine = AggregationEngine::new(plane, registry, AggregationConfig::default());
        (engine, devices)
    }

    #[test]
    fn empty_zone_is_safe() {
        let (engine, _) = engine_with_zone(&[]);
        let snap = engine.compute_zone("z-empty");
        assert_eq!(snap.status, ScopeStatus::Safe);
        assert_eq!(snap.active_devices, 0);
    }

    #[test]
    fn pattern_requires_min_affected_and_average() {
        // 4 anomalous of 6 but avg 0.505 < 0.6: warning, not critical.
        let (engine, _) = engine_with_zone(&[0.2, 0.3, 0.62, 0.65, 0.71, 0.55]);
        let snap = engine.compute_zone("z1");
        assert_eq!(snap.anomalous_devices, 4);
        assert!(!snap.is_pattern);
        assert_eq!(snap.status, ScopeStatus::Warning);
    }

    #[test]
    fn below_min_affected_never_critical() {
        // Only 2 anomalous (< K_min=3), even with a high average.
        let (engine, _) = engine_with_zone(&[0.95, 0.9]);
        let snap = engine.compute_zone("z1");
        assert!(snap.avg_score > 0.6);
        assert_eq!(snap.anomalous_devices, 2);
        assert!(!snap.is_pattern);
        assert_eq!(snap.status, ScopeStatus::Warning);
    }

    #[test]
    fn pattern_zone_goes_critical() {
        let (engine, _) = engine_with_zone(&[0.7, 0.75, 0.8, 0.65]);
        let snap = engine.compute_zone("z1");
        assert!(snap.is_pattern);
        assert_eq!(snap.status, ScopeStatus::Critical);
    }

    #[test]
    fn single_elevated_device_is_elevated() {
        let (engine, _) = engine_with_zone(&[0.55, 0.1, 0.1]);
        let snap = engine.compute_zone("z1");
        assert_eq!(snap.status, ScopeStatus::Elevated);
    }

    #[test]
    fn family_group_warns_on_any_anomalous_member() {
        let (engine, _) = engine_with_zone(&[0.6, 0.1]);
        let snap = engine.compute_group(
            "fam-1",
            GroupType::Family,
            &["u0".to_string(), "u1".to_string()],
        );
        assert_eq!(snap.status, ScopeStatus::Warning);

        // Above 0.8 on any member: critical.
        let (engine, _) = engine_with_zone(&[0.85, 0.1]);
        let snap = engine.compute_group(
            "fam-1",
            GroupType::Family,
            &["u0".to_string(), "u1".to_string()],
        );
        assert_eq!(snap.status, ScopeStatus::Critical);
    }

    #[test]
    fn history_is_bounded_to_cap() {
        let (engine, _) = engine_with_zone(&[0.1]);
        for _ in 0..HISTORY_CAP + 1 {
            engine.compute_zone("z1");
        }
        let history = engine.scope_history("z1", usize::MAX);
        assert_eq!(history.len(), HISTORY_CAP);
    }

    #[test]
    fn community_summary_rolls_up_zones() {
        let (engine, _) = engine_with_zone(&[0.7, 0.75, 0.8, 0.65]);
        let summary = engine.community_summary(&["z1".to_string()]);
        assert_eq!(summary.overall_status, ScopeStatus::Critical);
        assert_eq!(summary.pattern_zones, 1);
        assert_eq!(summary.total_devices, 4);
    }
}
