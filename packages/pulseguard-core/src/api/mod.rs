//! HTTP/WebSocket API layer.
//!
//! Thin handlers that delegate to services. Provides router construction
//! and server startup.

use std::sync::Arc;

use thiserror::Error;

use crate::bootstrap::BootstrappedServices;
use crate::services::{
    AggregationEngine, AlertService, ConnectionPlane, EpisodeEngine, EscalationService,
    HealthIngest, InferenceClient, ScoreRegistry,
};
use crate::session::SessionManager;
use crate::state::Config;

pub mod http;
pub mod ws;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),

    /// No available ports in the specified range.
    #[error("No available ports in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },
}

/// Shared application state for the API layer.
///
/// This is a thin wrapper holding references to services; all business
/// logic lives in the services themselves.
#[derive(Clone)]
pub struct AppState {
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
}

impl AppState {
    /// Builds the API state from the bootstrapped service container.
    pub fn new(services: &BootstrappedServices) -> Self {
        Self {
            config: Arc::clone(&services.config),
            plane: Arc::clone(&services.plane),
            ingest: Arc::clone(&services.ingest),
            inference: Arc::clone(&services.inference),
            scores: Arc::clone(&services.scores),
            aggregation: Arc::clone(&services.aggregation),
            alerts: Arc::clone(&services.alerts),
            episodes: Arc::clone(&services.episodes),
            escalation: Arc::clone(&services.escalation),
            sessions: Arc::clone(&services.sessions),
        }
    }
}

async fn find_available_port(
    start: u16,
    end: u16,
) -> Result<(u16, tokio::net::TcpListener), ServerError> {
    for port in start..=end {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => return Ok((port, listener)),
            Err(_) => continue,
        }
    }
    Err(ServerError::NoAvailablePort { start, end })
}

/// Starts the HTTP/WS server on the configured or auto-discovered port.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let preferred_port = state.config.preferred_port;
    let (port, listener) = if preferred_port > 0 {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], preferred_port));
        (preferred_port, tokio::net::TcpListener::bind(&addr).await?)
    } else {
        find_available_port(8000, 8010).await?
    };

    log::info!("Server listening on http://0.0.0.0:{}", port);
    let app = http::create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
