//! Logical session store collaborator.
//!
//! The transactional store owning session rows is external; the core only
//! needs to open and close logical sessions and fetch the wearer profile.
//! [`InMemorySessionStore`] is the default used by the standalone server
//! and by tests.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::utils::{now_millis, short_id};

/// Names used in the agent's dynamic context.
#[derive(Debug, Clone)]
pub struct WearerProfile {
    pub patient_name: String,
    pub caregiver_name: String,
}

/// External store for logical agent sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Opens a session and returns its opaque id.
    async fn start_session(
        &self,
        device_id: &str,
        reason: &str,
        trigger_type: &str,
        initial_mode: &str,
    ) -> String;

    /// Closes a session.
    async fn end_session(&self, session_id: &str, reason: &str, ending_mode: Option<&str>);

    /// The open session id for a device, if any.
    async fn active_session_id(&self, device_id: &str) -> Option<String>;

    /// Wearer and caregiver display names for the device, if known.
    async fn profile(&self, device_id: &str, user_id: &str) -> Option<WearerProfile>;
}

#[derive(Debug, Clone)]
struct StoredSession {
    device_id: String,
    started_at: u64,
}

/// In-memory session store.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, StoredSession>,
    by_device: DashMap<String, String>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn start_session(
        &self,
        device_id: &str,
        reason: &str,
        trigger_type: &str,
        initial_mode: &str,
    ) -> String {
        let id = short_id();
        self.sessions.insert(
            id.clone(),
            StoredSession {
                device_id: device_id.to_string(),
                started_at: now_millis(),
            },
        );
        self.by_device.insert(device_id.to_string(), id.clone());
        log::info!(
            "[Store] Session {} started for {} (trigger={}, mode={}, reason={:?})",
            id,
            device_id,
            trigger_type,
            initial_mode,
            reason
        );
        id
    }

    async fn end_session(&self, session_id: &str, reason: &str, ending_mode: Option<&str>) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            self.by_device
                .remove_if(&session.device_id, |_, id| id == session_id);
            log::info!(
                "[Store] Session {} ended after {} ms (mode={:?}, reason={:?})",
                session_id,
                now_millis().saturating_sub(session.started_at),
                ending_mode,
                reason
            );
        }
    }

    async fn active_session_id(&self, device_id: &str) -> Option<String> {
        self.by_device.get(device_id).map(|e| e.value().clone())
    }

    async fn profile(&self, _device_id: &str, _user_id: &str) -> Option<WearerProfile> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_end_round_trip() {
        let store = InMemorySessionStore::new();
        let id = store.start_session("d1", "test", "command", "normal").await;
        assert_eq!(store.active_session_id("d1").await, Some(id.clone()));

        store.end_session(&id, "done", Some("normal")).await;
        assert_eq!(store.active_session_id("d1").await, None);
    }

    #[tokio::test]
    async fn newer_session_survives_old_end() {
        let store = InMemorySessionStore::new();
        let old = store.start_session("d1", "a", "command", "normal").await;
        let new = store.start_session("d1", "b", "command", "normal").await;

        store.end_session(&old, "stale", None).await;
        assert_eq!(store.active_session_id("d1").await, Some(new));
    }
}
