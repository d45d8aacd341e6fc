//! Latest per-device anomaly scores.
//!
//! Each device's newest score overwrites the previous one; there is one
//! writer per device by construction (the device's own socket task).

use dashmap::DashMap;

use crate::services::inference::InferenceOutput;

/// Registry of the most recent inference result per device.
#[derive(Default)]
pub struct ScoreRegistry {
    results: DashMap<String, InferenceOutput>,
}

impl ScoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a device's newest result, discarding the previous one.
    pub fn record(&self, device_id: &str, result: InferenceOutput) {
        self.results.insert(device_id.to_string(), result);
    }

    /// Latest overall score for a device; 0.0 when never scored.
    pub fn score(&self, device_id: &str) -> f64 {
        self.results
            .get(device_id)
            .map_or(0.0, |r| r.overall_score)
    }

    /// Latest full result for a device.
    pub fn result(&self, device_id: &str) -> Option<InferenceOutput> {
        self.results.get(device_id).map(|r| r.clone())
    }

    /// All known `(device_id, overall_score)` pairs.
    pub fn all_scores(&self) -> Vec<(String, f64)> {
        self.results
            .iter()
            .map(|e| (e.key().clone(), e.value().overall_score))
            .collect()
    }

    /// Device ids whose latest score exceeds the threshold.
    pub fn anomalous(&self, threshold: f64) -> Vec<String> {
        self.results
            .iter()
            .filter(|e| e.value().overall_score > threshold)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drops a device's score (on disconnect cleanup).
    pub fn forget_device(&self, device_id: &str) {
        self.results.remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_millis;

    fn output(score: f64) -> InferenceOutput {
        InferenceOutput {
            overall_score: score,
            max_score: score,
            is_anomaly: score > 0.5,
            per_timestep: vec![score],
            attention_hint: 0,
            computed_at: now_millis(),
        }
    }

    #[test]
    fn newest_score_overwrites() {
        let registry = ScoreRegistry::new();
        registry.record("d1", output(0.2));
        registry.record("d1", output(0.8));
        assert_eq!(registry.score("d1"), 0.8);
    }

    #[test]
    fn unknown_device_scores_zero() {
        let registry = ScoreRegistry::new();
        assert_eq!(registry.score("ghost"), 0.0);
        assert!(registry.result("ghost").is_none());
    }

    #[test]
    fn forget_device_drops_score() {
        let registry = ScoreRegistry::new();
        registry.record("d1", output(0.7));
        registry.forget_device("d1");
        assert_eq!(registry.score("d1"), 0.0);
        assert!(registry.result("d1").is_none());
        assert!(registry.anomalous(0.5).is_empty());
    }

    #[test]
    fn anomalous_filters_by_threshold() {
        let registry = ScoreRegistry::new();
        registry.record("low", output(0.3));
        registry.record("mid", output(0.55));
        registry.record("high", output(0.9));

        let mut hot = registry.anomalous(0.5);
        hot.sort();
        assert_eq!(hot, vec!["high".to_string(), "mid".to_string()]);
    }
}
