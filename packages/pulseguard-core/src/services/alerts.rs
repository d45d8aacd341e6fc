//! Alert generation and dispatch.
//!
//! Alerts are deduplicated by `(kind, scope_id)`: while an identical active
//! alert exists, new triggers update its score instead of creating a second
//! one. Resolution drops the alert from the active index and broadcasts
//! `alert_resolved`.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::services::aggregation::{AggregationEngine, AggregationSnapshot, GroupType};
use crate::services::connection_plane::ConnectionPlane;
use crate::utils::now_millis;

/// Retained alert records (active and resolved).
const ALERT_LOG_CAP: usize = 500;

/// Alert classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Individual,
    Group,
    Community,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Dedup key: one active alert per `(kind, scope)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AlertKey {
    kind: AlertKind,
    scope_id: String,
}

/// A raised alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub scope_id: String,
    pub title: String,
    pub description: String,
    pub score: f64,
    pub affected_devices: Vec<String>,
    pub is_active: bool,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
}

/// Generates and dispatches alerts from aggregation results.
pub struct AlertService {
    plane: Arc<ConnectionPlane>,
    aggregation: Arc<AggregationEngine>,
    anomaly_threshold: f64,
    active: DashMap<AlertKey, Alert>,
    log: Mutex<Vec<Alert>>,
}

impl AlertService {
    pub fn new(
        plane: Arc<ConnectionPlane>,
        aggregation: Arc<AggregationEngine>,
        anomaly_threshold: f64,
    ) -> Self {
        Self {
            plane,
            aggregation,
            anomaly_threshold,
            active: DashMap::new(),
            log: Mutex::new(Vec::new()),
        }
    }

    /// One alerting pass over the listed zones: a correlated pattern raises
    /// a community alert, otherwise each anomalous device raises an
    /// individual alert.
    pub fn check_zones(&self, zone_ids: &[String]) {
        for zone_id in zone_ids {
            let snapshot = self.aggregation.compute_zone(zone_id);
            if snapshot.is_pattern {
                self.upsert_community_alert(zone_id, &snapshot);
            } else if snapshot.anomalous_devices > 0 {
                for (device_id, score) in &snapshot.device_scores {
                    if *score > self.anomaly_threshold {
                        self.upsert_individual_alert(device_id, zone_id, *score);
                    }
                }
            }
        }
    }

    /// One alerting pass over a group: family groups alert on any anomalous
    /// member, community groups on the pattern rule.
    pub fn check_group(&self, group_id: &str, group_type: GroupType, member_user_ids: &[String]) {
        let snapshot = self
            .aggregation
            .compute_group(group_id, group_type, member_user_ids);
        let should_alert = match group_type {
            GroupType::Family => snapshot.anomalous_devices > 0,
            _ => snapshot.is_pattern,
        };
        if should_alert {
            self.upsert_group_alert(group_id, group_type, &snapshot);
        }
    }

    fn upsert_community_alert(&self, zone_id: &str, snapshot: &AggregationSnapshot) {
        let key = AlertKey {
            kind: AlertKind::Community,
            scope_id: zone_id.to_string(),
        };
        if self.refresh_active(&key, snapshot.avg_score) {
            return;
        }

        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            kind: AlertKind::Community,
            severity: Severity::Critical,
            scope_id: zone_id.to_string(),
            title: "Community anomaly detected in zone".to_string(),
            description: format!(
                "{} of {} devices showing elevated anomaly scores. Possible \
                 environmental hazard or coordinated distress event.",
                snapshot.anomalous_devices, snapshot.active_devices
            ),
            score: snapshot.avg_score,
            affected_devices: snapshot.device_scores.keys().cloned().collect(),
            is_active: true,
            created_at: now_millis(),
            updated_at: None,
            resolved_at: None,
            acknowledged_by: None,
        };
        self.store(key, alert.clone());

        self.plane
            .broadcast_to_dashboards(&ServerMessage::Alert { alert: alert.clone() });
        self.plane
            .broadcast_to_zone(zone_id, &ServerMessage::ZoneAlert { alert });
        log::warn!(
            "COMMUNITY ALERT: zone={}, score={:.3}",
            zone_id,
            snapshot.avg_score
        );
    }

    fn upsert_group_alert(
        &self,
        group_id: &str,
        group_type: GroupType,
        snapshot: &AggregationSnapshot,
    ) {
        let key = AlertKey {
            kind: AlertKind::Group,
            scope_id: group_id.to_string(),
        };
        if self.refresh_active(&key, snapshot.avg_score) {
            return;
        }

        let (severity, title, description) = if group_type == GroupType::Family {
            (
                if snapshot.max_score > 0.8 {
                    Severity::Critical
                } else {
                    Severity::Warning
                },
                "Family member in distress".to_string(),
                format!(
                    "{} family member(s) showing elevated anomaly scores. \
                     Immediate attention may be needed.",
                    snapshot.anomalous_devices
                ),
            )
        } else {
            (
                Severity::Critical,
                "Community group anomaly detected".to_string(),
                format!(
                    "{} of {} members showing elevated scores. Possible coordinated event.",
                    snapshot.anomalous_devices, snapshot.active_devices
                ),
            )
        };

        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            kind: AlertKind::Group,
            severity,
            scope_id: group_id.to_string(),
            title,
            description,
            score: snapshot.avg_score,
            affected_devices: snapshot.device_scores.keys().cloned().collect(),
            is_active: true,
            created_at: now_millis(),
            updated_at: None,
            resolved_at: None,
            acknowledged_by: None,
        };
        self.store(key, alert.clone());

        self.plane
            .broadcast_to_dashboards(&ServerMessage::Alert { alert: alert.clone() });
        self.plane.broadcast_to_group(
            group_id,
            &ServerMessage::GroupAlert {
                group_id: group_id.to_string(),
                alert,
            },
        );
        log::warn!(
            "GROUP ALERT: group={} ({:?}), score={:.3}",
            group_id,
            group_type,
            snapshot.avg_score
        );
    }

    fn upsert_individual_alert(&self, device_id: &str, zone_id: &str, score: f64) {
        let key = AlertKey {
            kind: AlertKind::Individual,
            scope_id: device_id.to_string(),
        };
        if self.refresh_active(&key, score) {
            return;
        }

        // Char-wise truncation: device ids come off the wire unvalidated.
        let short: String = device_id.chars().take(8).collect();
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            kind: AlertKind::Individual,
            severity: if score > 0.8 {
                Severity::Critical
            } else {
                Severity::Warning
            },
            scope_id: device_id.to_string(),
            title: "Individual distress detected".to_string(),
            description: format!(
                "Device {}... showing anomaly score of {:.2} in zone {}",
                short, score, zone_id
            ),
            score,
            affected_devices: vec![device_id.to_string()],
            is_active: true,
            created_at: now_millis(),
            updated_at: None,
            resolved_at: None,
            acknowledged_by: None,
        };
        self.store(key, alert.clone());

        self.plane
            .broadcast_to_dashboards(&ServerMessage::Alert { alert });
        log::warn!("INDIVIDUAL ALERT: device={}, score={:.3}", device_id, score);
    }

    /// Updates score and timestamp of an already-active alert. Returns
    /// whether an active alert existed.
    fn refresh_active(&self, key: &AlertKey, score: f64) -> bool {
        if let Some(mut alert) = self.active.get_mut(key) {
            alert.score = score;
            alert.updated_at = Some(now_millis());
            return true;
        }
        false
    }

    fn store(&self, key: AlertKey, alert: Alert) {
        self.active.insert(key, alert.clone());
        let mut log = self.log.lock();
        log.push(alert);
        if log.len() > ALERT_LOG_CAP {
            let excess = log.len() - ALERT_LOG_CAP;
            log.drain(..excess);
        }
    }

    /// Marks an alert inactive, drops it from the active index, and
    /// broadcasts `alert_resolved`. Returns false for an unknown id.
    pub fn resolve(&self, alert_id: &str, acknowledged_by: Option<&str>) -> bool {
        let key = self
            .active
            .iter()
            .find(|e| e.value().id == alert_id)
            .map(|e| e.key().clone());
        let Some(key) = key else { return false };
        let Some((_, mut alert)) = self.active.remove(&key) else {
            return false;
        };

        alert.is_active = false;
        alert.resolved_at = Some(now_millis());
        alert.acknowledged_by = acknowledged_by.map(str::to_string);

        if let Some(stored) = self.log.lock().iter_mut().find(|a| a.id == alert_id) {
            *stored = alert;
        }

        self.plane.broadcast_to_dashboards(&ServerMessage::AlertResolved {
            alert_id: alert_id.to_string(),
        });
        true
    }

    /// All currently active alerts.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    /// Most recent alerts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        let log = self.log.lock();
        log.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::connection_plane::Role;
    use crate::services::inference::InferenceOutput;
    use crate::services::score_registry::ScoreRegistry;
    use crate::state::AggregationConfig;

    struct Fixture {
        registry: Arc<ScoreRegistry>,
        alerts: AlertService,
        _rxs: Vec<tokio::sync::mpsc::Receiver<crate::services::connection_plane::Frame>>,
    }

    fn fixture(zone_scores: &[f64]) -> Fixture {
        let plane = Arc::new(ConnectionPlane::new(16));
        let registry = Arc::new(ScoreRegistry::new());
        let mut rxs = Vec::new();
        for (i, score) in zone_scores.iter().enumerate() {
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
            rxs.push(rx);
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
        }
        let aggregation = Arc::new(AggregationEngine::new(
            Arc::clone(&plane),
            Arc::clone(&registry),
            AggregationConfig::default(),
        ));
        let alerts = AlertService::new(plane, aggregation, 0.5);
        Fixture {
            registry,
            alerts,
            _rxs: rxs,
        }
    }

    #[test]
    fn duplicate_trigger_updates_instead_of_creating() {
        let f = fixture(&[0.9, 0.1]);
        f.alerts.check_zones(&["z1".to_string()]);
        assert_eq!(f.alerts.active_alerts().len(), 1);
        let first_id = f.alerts.active_alerts()[0].id.clone();

        // Score moves; same key must update in place.
        f.registry.record(
            "d0",
            InferenceOutput {
                overall_score: 0.95,
                max_score: 0.95,
                is_anomaly: true,
                per_timestep: vec![0.95],
                attention_hint: 0,
                computed_at: 0,
            },
        );
        f.alerts.check_zones(&["z1".to_string()]);

        let active = f.alerts.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, first_id);
        assert_eq!(active[0].score, 0.95);
        assert!(active[0].updated_at.is_some());
    }

    #[test]
    fn pattern_zone_raises_community_alert() {
        let f = fixture(&[0.7, 0.75, 0.8, 0.65]);
        f.alerts.check_zones(&["z1".to_string()]);
        let active = f.alerts.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, AlertKind::Community);
        assert_eq!(active[0].severity, Severity::Critical);
        assert_eq!(active[0].affected_devices.len(), 4);
    }

    #[test]
    fn individual_alert_severity_scales_with_score() {
        let f = fixture(&[0.85]);
        f.alerts.check_zones(&["z1".to_string()]);
        let active = f.alerts.active_alerts();
        assert_eq!(active[0].kind, AlertKind::Individual);
        assert_eq!(active[0].severity, Severity::Critical);
    }

    #[test]
    fn individual_alert_with_non_ascii_device_id() {
        // Byte offset 8 lands inside the Ω; the description must truncate
        // on a char boundary.
        let device_id = "devicesΩ-01";
        let plane = Arc::new(ConnectionPlane::new(16));
        let registry = Arc::new(ScoreRegistry::new());
        let (conn, _rx) = plane.accept();
        plane.authenticate_device(
            &conn,
            Role::Device,
            device_id,
            "u1",
            &["z1".to_string()],
            &[],
        );
        registry.record(
            device_id,
            InferenceOutput {
                overall_score: 0.9,
                max_score: 0.9,
                is_anomaly: true,
                per_timestep: vec![0.9],
                attention_hint: 0,
                computed_at: 0,
            },
        );
        let aggregation = Arc::new(AggregationEngine::new(
            Arc::clone(&plane),
            Arc::clone(&registry),
            AggregationConfig::default(),
        ));
        let alerts = AlertService::new(plane, aggregation, 0.5);

        alerts.check_zones(&["z1".to_string()]);

        let active = alerts.active_alerts();
        assert_eq!(active.len(), 1);
        assert!(active[0].description.contains("devicesΩ"));
    }

    #[test]
    fn resolve_drops_from_active_and_records_ack() {
        let f = fixture(&[0.9]);
        f.alerts.check_zones(&["z1".to_string()]);
        let id = f.alerts.active_alerts()[0].id.clone();

        assert!(f.alerts.resolve(&id, Some("caregiver-7")));
        assert!(f.alerts.active_alerts().is_empty());

        let record = f
            .alerts
            .recent(10)
            .into_iter()
            .find(|a| a.id == id)
            .unwrap();
        assert!(!record.is_active);
        assert_eq!(record.acknowledged_by.as_deref(), Some("caregiver-7"));
        assert!(record.resolved_at.is_some());

        // Resolving again is a no-op.
        assert!(!f.alerts.resolve(&id, None));
    }

    #[test]
    fn family_group_alerts_on_single_member() {
        let f = fixture(&[0.6, 0.1]);
        f.alerts.check_group(
            "fam-1",
            GroupType::Family,
            &["u0".to_string(), "u1".to_string()],
        );
        let active = f.alerts.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, AlertKind::Group);
        assert_eq!(active[0].severity, Severity::Warning);
    }
}
