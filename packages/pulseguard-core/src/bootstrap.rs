//! Application bootstrap and dependency wiring.
//!
//! This is the composition root: every service is instantiated and wired
//! here, in dependency order, so tests can stand up an isolated world by
//! calling [`bootstrap_services`] with their own config.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{PulseguardError, PulseguardResult};
use crate::services::{
    AggregationEngine, AlertService, BaselineModel, ConnectionPlane, EpisodeEngine,
    EscalationService, GenerativeAnalyst, HealthIngest, InferenceClient, ScoreRegistry,
};
use crate::session::{EnergyVad, InMemorySessionStore, SessionManager, TtsClient};
use crate::state::Config;

/// Timeout for outbound HTTP calls (analyst, TTS connect).
const HTTP_TIMEOUT_SECS: u64 = 15;

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Socket indexes and fan-out.
    pub plane: Arc<ConnectionPlane>,
    /// Per-device reading rings.
    pub ingest: Arc<HealthIngest>,
    /// Model-inference proxy.
    pub inference: Arc<InferenceClient>,
    /// Latest per-device scores.
    pub scores: Arc<ScoreRegistry>,
    /// Zone/group rollups.
    pub aggregation: Arc<AggregationEngine>,
    /// Alert upserts and dispatch.
    pub alerts: Arc<AlertService>,
    /// Episode lifecycle engine.
    pub episodes: Arc<EpisodeEngine>,
    /// Escalation timer ladder.
    pub escalation: Arc<EscalationService>,
    /// Per-device session engine.
    pub sessions: Arc<SessionManager>,
    /// Shared HTTP client for connection pooling.
    http_client: Client,
    /// Tracks long-lived background tasks so shutdown can drain them.
    pub tracker: TaskTracker,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Returns the shared HTTP client.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Spawns the periodic aggregation sweep over live zones.
    pub fn start_background_tasks(&self) {
        let interval = Duration::from_secs(self.config.aggregation.zone_aggregation_window_secs);
        let plane = Arc::clone(&self.plane);
        let alerts = Arc::clone(&self.alerts);
        let cancel = self.cancel_token.clone();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh server
            // does not alert on an empty world.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let zones = plane.live_zones();
                        if !zones.is_empty() {
                            alerts.check_zones(&zones);
                        }
                    }
                }
            }
        });
    }

    /// Initiates graceful shutdown: cancels background tasks and waits for
    /// them to drain.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        log::info!("[Bootstrap] Shutdown complete");
    }
}

fn create_http_client() -> PulseguardResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| PulseguardError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Bootstraps all application services with their dependencies.
///
/// Wiring order matters: the connection plane and score registry feed the
/// aggregation engine, which feeds alerts; the episode engine feeds
/// escalation; sessions sit on top of the plane.
pub fn bootstrap_services(config: Config) -> PulseguardResult<BootstrappedServices> {
    config
        .validate()
        .map_err(PulseguardError::Configuration)?;
    let config = Arc::new(config);

    let http_client = create_http_client()?;
    let cancel_token = CancellationToken::new();
    let tracker = TaskTracker::new();

    let plane = Arc::new(ConnectionPlane::new(config.outbound_queue_capacity));
    let ingest = Arc::new(HealthIngest::new());
    let scores = Arc::new(ScoreRegistry::new());
    let inference = Arc::new(InferenceClient::new(
        Arc::new(BaselineModel::default()),
        config.inference_workers,
    ));

    let aggregation = Arc::new(AggregationEngine::new(
        Arc::clone(&plane),
        Arc::clone(&scores),
        config.aggregation.clone(),
    ));
    let alerts = Arc::new(AlertService::new(
        Arc::clone(&plane),
        Arc::clone(&aggregation),
        config.aggregation.anomaly_threshold,
    ));

    let analyst = Arc::new(GenerativeAnalyst::new(
        http_client.clone(),
        config.analyst.clone(),
    ));
    let episodes = Arc::new(EpisodeEngine::new(analyst));
    let escalation = Arc::new(EscalationService::new(
        Arc::clone(&episodes),
        Arc::clone(&plane),
    ));

    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&plane),
        Arc::new(InMemorySessionStore::new()),
        Arc::new(EnergyVad::default()),
        Arc::new(TtsClient::new(http_client.clone(), config.agent.clone())),
        config.agent.clone(),
    ));

    Ok(BootstrappedServices {
        config,
        plane,
        ingest,
        inference,
        scores,
        aggregation,
        alerts,
        episodes,
        escalation,
        sessions,
        http_client,
        tracker,
        cancel_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_wires_a_world() {
        let services = bootstrap_services(Config::default()).unwrap();
        assert_eq!(services.plane.device_count(), 0);
        services.shutdown().await;
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_config() {
        let mut config = Config::default();
        config.inference_workers = 0;
        assert!(bootstrap_services(config).is_err());
    }

    #[tokio::test]
    async fn background_tasks_drain_on_shutdown() {
        let services = bootstrap_services(Config::default()).unwrap();
        services.start_background_tasks();
        services.shutdown().await;
        assert!(services.tracker.is_closed());
    }
}
