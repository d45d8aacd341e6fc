//! Application services layer.
//!
//! This module contains the domain services that orchestrate between the
//! API layer and the external collaborators (model inference, generative
//! analyst, conversational agent).

pub mod aggregation;
pub mod alerts;
pub mod connection_plane;
pub mod episodes;
pub mod escalation;
pub mod fusion_analyst;
pub mod health_ingest;
pub mod inference;
pub mod score_registry;

pub use aggregation::{AggregationEngine, AggregationSnapshot, GroupType, ScopeStatus};
pub use alerts::{Alert, AlertKind, AlertService, Severity};
pub use connection_plane::{Connection, ConnectionPlane, Frame, Role};
pub use episodes::{Episode, EpisodeEngine, EpisodePhase, FusionDecision, Resolution};
pub use escalation::EscalationService;
pub use fusion_analyst::GenerativeAnalyst;
pub use health_ingest::{HealthIngest, Reading, Window};
pub use inference::{BaselineModel, InferenceClient, InferenceOutput, ScoreModel};
pub use score_registry::ScoreRegistry;
