//! Pulseguard Core - shared library for the Pulseguard coordination server.
//!
//! This crate provides the core of a real-time health-event coordination
//! service for wearable devices and paired caregiver/mobile clients: an
//! authenticated multi-role socket fabric, per-device anomaly scoring,
//! zone/group aggregation, the episode lifecycle engine with its timed
//! escalation ladder, and the per-device session engine that bridges a
//! wearer's audio to an external conversational agent.
//!
//! # Architecture
//!
//! - [`state`]: validated configuration
//! - [`protocol`]: the tagged socket message grammar
//! - [`services`]: connection plane, ingestion, inference proxy, score
//!   registry, aggregation, alerts, episodes, escalation
//! - [`session`]: per-device session engine (VAD gate, agent stream,
//!   dead-man switch, media automation)
//! - [`api`]: HTTP/WS surface
//! - [`bootstrap`]: the composition root
//! - [`error`]: centralized error types
//!
//! External collaborators (the anomaly model, the generative fusion
//! analyst, the conversational agent, the TTS endpoint, the session store)
//! are all behind traits so tests can stand up an isolated world.

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod error;
pub mod protocol;
pub mod services;
pub mod session;
pub mod state;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use error::{ErrorCode, PulseguardError, PulseguardResult};
pub use protocol::{ClientMessage, ServerMessage};
pub use services::{
    AggregationEngine, AggregationSnapshot, Alert, AlertService, ConnectionPlane, Episode,
    EpisodeEngine, EpisodePhase, EscalationService, FusionDecision, GroupType, HealthIngest,
    InferenceClient, Resolution, ScopeStatus, ScoreRegistry,
};
pub use session::{Session, SessionManager, SessionMode};
pub use state::{AgentConfig, AggregationConfig, AnalystConfig, Config};
pub use utils::now_millis;
