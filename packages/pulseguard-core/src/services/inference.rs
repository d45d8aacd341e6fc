//! Model-inference collaborator proxy.
//!
//! The external anomaly model is a seam: anything implementing
//! [`ScoreModel`] can score a fixed-shape window. The proxy runs the model
//! on the blocking thread pool behind a semaphore sized to the worker
//! count, so inference never blocks socket I/O and concurrent requests
//! share the bounded pool.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::services::health_ingest::{Window, FEATURES, WINDOW_SIZE};
use crate::utils::now_millis;

/// Error from the model-inference collaborator.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The collaborator is not loaded or unreachable.
    #[error("model unavailable: {0}")]
    Unavailable(String),

    /// The window did not match the expected shape.
    #[error("bad window shape: {0}")]
    BadShape(String),
}

/// Result of scoring one window.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceOutput {
    /// Mean per-timestep anomaly score, in `[0, 1]`.
    pub overall_score: f64,
    /// Highest per-timestep score.
    pub max_score: f64,
    /// Whether the window crosses the model's anomaly bar.
    pub is_anomaly: bool,
    /// Per-timestep scores, one per window row.
    pub per_timestep: Vec<f64>,
    /// Index of the timestep the model found most anomalous.
    pub attention_hint: usize,
    /// Unix millis when the score was produced.
    pub computed_at: u64,
}

/// A model that scores a fixed-shape biometric window.
///
/// Implementations run synchronously; the proxy moves them off the async
/// runtime. The real collaborator wraps the external model process.
pub trait ScoreModel: Send + Sync {
    fn score(&self, window: &Window) -> Result<InferenceOutput, ModelError>;
}

/// Deviation-based baseline model.
///
/// Scores each timestep by its normalized distance from resting-state
/// statistics. Exists so the full pipeline runs without an external model
/// process; the production model plugs in through [`ScoreModel`].
pub struct BaselineModel {
    mean: [f32; FEATURES],
    std: [f32; FEATURES],
    anomaly_bar: f64,
}

impl Default for BaselineModel {
    fn default() -> Self {
        Self {
            // Resting-state statistics: HR, HRV, acceleration, skin temp.
            mean: [72.0, 50.0, 1.0, 36.5],
            std: [15.0, 15.0, 0.5, 0.5],
            anomaly_bar: 0.5,
        }
    }
}

impl ScoreModel for BaselineModel {
    fn score(&self, window: &Window) -> Result<InferenceOutput, ModelError> {
        let rows = window.rows();
        if rows.len() != WINDOW_SIZE {
            return Err(ModelError::BadShape(format!(
                "expected {} rows, got {}",
                WINDOW_SIZE,
                rows.len()
            )));
        }

        let mut per_timestep = Vec::with_capacity(rows.len());
        for row in rows {
            // Mean absolute z-score across features, squashed so that a
            // 3-sigma deviation on every feature saturates at 1.0.
            let mut acc = 0.0f64;
            for f in 0..FEATURES {
                let z = ((row[f] - self.mean[f]) / (self.std[f] + 1e-8)).abs() as f64;
                acc += (z / 3.0).min(1.0);
            }
            per_timestep.push(acc / FEATURES as f64);
        }

        let overall_score = per_timestep.iter().sum::<f64>() / per_timestep.len() as f64;
        let (attention_hint, max_score) = per_timestep
            .iter()
            .copied()
            .enumerate()
            .fold((0, 0.0f64), |(bi, bs), (i, s)| {
                if s > bs {
                    (i, s)
                } else {
                    (bi, bs)
                }
            });

        Ok(InferenceOutput {
            overall_score,
            max_score,
            is_anomaly: max_score > self.anomaly_bar,
            per_timestep,
            attention_hint,
            computed_at: now_millis(),
        })
    }
}

/// Async proxy in front of a [`ScoreModel`].
///
/// Permits are shared with the pool size so no more than `workers`
/// inferences run at once; excess callers queue on the semaphore.
pub struct InferenceClient {
    model: Arc<dyn ScoreModel>,
    permits: Arc<Semaphore>,
}

impl InferenceClient {
    pub fn new(model: Arc<dyn ScoreModel>, workers: usize) -> Self {
        Self {
            model,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Scores a window on the blocking pool.
    ///
    /// A failing collaborator yields `Err`; the caller treats the tick as
    /// having produced no score.
    pub async fn infer(&self, window: Window) -> Result<InferenceOutput, ModelError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ModelError::Unavailable("inference pool closed".into()))?;
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || model.score(&window))
            .await
            .map_err(|e| ModelError::Unavailable(format!("inference task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_window(hr: f32) -> Window {
        Window(vec![[hr, 50.0, 1.0, 36.5]; WINDOW_SIZE])
    }

    #[test]
    fn resting_window_scores_low() {
        let model = BaselineModel::default();
        let out = model.score(&flat_window(72.0)).unwrap();
        assert!(out.overall_score < 0.1);
        assert!(!out.is_anomaly);
        assert_eq!(out.per_timestep.len(), WINDOW_SIZE);
    }

    #[test]
    fn elevated_window_flags_anomaly() {
        let model = BaselineModel::default();
        let mut rows = vec![[72.0, 50.0, 1.0, 36.5]; WINDOW_SIZE];
        for row in rows.iter_mut().skip(WINDOW_SIZE - 10) {
            *row = [160.0, 12.0, 2.8, 37.9];
        }
        let out = model.score(&Window(rows)).unwrap();
        assert!(out.is_anomaly);
        assert!(out.max_score > 0.5);
        assert!(out.attention_hint >= WINDOW_SIZE - 10);
    }

    #[test]
    fn bad_shape_is_rejected() {
        let model = BaselineModel::default();
        let out = model.score(&Window(vec![[72.0, 50.0, 1.0, 36.5]; 3]));
        assert!(matches!(out, Err(ModelError::BadShape(_))));
    }

    #[tokio::test]
    async fn proxy_scores_through_pool() {
        let client = InferenceClient::new(Arc::new(BaselineModel::default()), 2);
        let out = client.infer(flat_window(140.0)).await.unwrap();
        assert!(out.overall_score > 0.2);
    }

    #[tokio::test]
    async fn concurrent_inferences_share_semaphore() {
        struct SlowModel;
        impl ScoreModel for SlowModel {
            fn score(&self, _window: &Window) -> Result<InferenceOutput, ModelError> {
                std::thread::sleep(std::time::Duration::from_millis(20));
                BaselineModel::default().score(&flat_window(72.0))
            }
        }

        let client = Arc::new(InferenceClient::new(Arc::new(SlowModel), 2));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let c = Arc::clone(&client);
            handles.push(tokio::spawn(async move { c.infer(flat_window(72.0)).await }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
    }
}
