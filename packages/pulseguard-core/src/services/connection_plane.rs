//! Multi-role socket connection plane.
//!
//! Tracks every live socket, authenticates it exactly once, and indexes it
//! by device, user, zone, and group for selective fan-out. The socket task
//! owns the actual sink; the plane only ever enqueues frames onto each
//! connection's outbound channel, so a stalled or dead peer can never block
//! another peer's delivery.
//!
//! Fan-out is best-effort: a full queue drops the frame, a closed channel
//! removes the connection from every index lazily.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc;

use crate::protocol::{ServerMessage, CLOSE_SUPERSEDED};
use crate::utils::now_millis;

/// Opaque connection identifier, unique for the process lifetime.
pub type ConnectionId = u64;

/// A frame queued for delivery to one socket.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    /// Instructs the socket task to close with the given code and stop.
    Close { code: u16, reason: String },
}

/// Role a connection holds after authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Biometric-only wearable.
    Device,
    /// Wearable that also runs the session engine (audio, dead-man, media).
    Watch,
    /// Paired caregiver app.
    Caregiver,
    /// Observer dashboard.
    Dashboard,
    /// Legacy relay mobile client.
    Mobile,
    /// Legacy relay shim.
    Relay,
}

impl Role {
    /// Whether this role is indexed as a device socket.
    pub fn is_device(self) -> bool {
        matches!(self, Role::Device | Role::Watch)
    }

    /// Whether this role receives paired-caregiver messages.
    pub fn is_caregiver_side(self) -> bool {
        matches!(self, Role::Caregiver | Role::Mobile)
    }
}

/// Identity assigned at authentication; immutable afterwards.
#[derive(Debug, Clone)]
pub struct Identity {
    pub role: Role,
    pub device_id: Option<String>,
    pub user_id: Option<String>,
    pub zones: Vec<String>,
    pub groups: Vec<String>,
}

/// One live socket connection.
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    identity: RwLock<Option<Identity>>,
    pub connected_at: u64,
}

impl Connection {
    /// Connection id (for logs and index bookkeeping).
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Role after authentication; `None` while pending.
    pub fn role(&self) -> Option<Role> {
        self.identity.read().as_ref().map(|i| i.role)
    }

    /// Device id for device-indexed roles.
    pub fn device_id(&self) -> Option<String> {
        self.identity.read().as_ref().and_then(|i| i.device_id.clone())
    }

    /// User id after authentication.
    pub fn user_id(&self) -> Option<String> {
        self.identity.read().as_ref().and_then(|i| i.user_id.clone())
    }

    /// Whether the connection has authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.identity.read().is_some()
    }

    /// Zones the connection was authenticated into.
    pub fn zones(&self) -> Vec<String> {
        self.identity
            .read()
            .as_ref()
            .map(|i| i.zones.clone())
            .unwrap_or_default()
    }

    /// Groups the connection was authenticated into (not including later
    /// `subscribe-group` additions, which live only in the plane index).
    pub fn groups(&self) -> Vec<String> {
        self.identity
            .read()
            .as_ref()
            .map(|i| i.groups.clone())
            .unwrap_or_default()
    }

    fn snapshot_identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }
}

/// Outcome of authenticating a device socket.
pub struct DeviceAuthOutcome {
    /// The older connection that held this device id, already closed and
    /// deindexed, if any.
    pub superseded: Option<Arc<Connection>>,
}

/// Indexes and delivers frames for all live connections.
pub struct ConnectionPlane {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    pending: DashMap<ConnectionId, ()>,
    devices: DashMap<String, ConnectionId>,
    user_devices: DashMap<String, HashSet<String>>,
    users: DashMap<String, HashSet<ConnectionId>>,
    zones: DashMap<String, HashSet<ConnectionId>>,
    groups: DashMap<String, HashSet<ConnectionId>>,
    dashboards: DashMap<ConnectionId, ()>,
    next_id: AtomicU64,
    outbound_capacity: usize,
}

impl ConnectionPlane {
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            pending: DashMap::new(),
            devices: DashMap::new(),
            user_devices: DashMap::new(),
            users: DashMap::new(),
            zones: DashMap::new(),
            groups: DashMap::new(),
            dashboards: DashMap::new(),
            next_id: AtomicU64::new(1),
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accept / authenticate / disconnect
    // ─────────────────────────────────────────────────────────────────────

    /// Registers a newly accepted socket as pending.
    ///
    /// Returns the connection handle and the receiving end of its outbound
    /// queue; the socket task drains the receiver into the sink.
    pub fn accept(&self) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        let conn = Arc::new(Connection {
            id,
            outbound: tx,
            identity: RwLock::new(None),
            connected_at: now_millis(),
        });
        self.connections.insert(id, Arc::clone(&conn));
        self.pending.insert(id, ());
        log::info!("[Plane] Connection {} accepted (pending)", id);
        (conn, rx)
    }

    /// Moves a pending socket into the device indexes.
    ///
    /// If another connection already holds `device_id`, the older one is
    /// closed with code 4002 and removed; the newer connection wins.
    /// Emits `device_connected` to dashboards.
    pub fn authenticate_device(
        &self,
        conn: &Arc<Connection>,
        role: Role,
        device_id: &str,
        user_id: &str,
        zones: &[String],
        groups: &[String],
    ) -> DeviceAuthOutcome {
        debug_assert!(role.is_device());

        // Evict an older socket holding the same device id.
        let superseded = self
            .devices
            .get(device_id)
            .map(|e| *e.value())
            .filter(|old_id| *old_id != conn.id)
            .and_then(|old_id| self.connections.get(&old_id).map(|e| Arc::clone(e.value())));
        if let Some(ref old) = superseded {
            log::warn!(
                "[Plane] Device {} superseded: closing connection {}",
                device_id,
                old.id
            );
            self.send_frame(
                old,
                Frame::Close {
                    code: CLOSE_SUPERSEDED,
                    reason: "superseded".to_string(),
                },
            );
            self.disconnect(old);
        }

        self.install_identity(
            conn,
            Identity {
                role,
                device_id: Some(device_id.to_string()),
                user_id: Some(user_id.to_string()),
                zones: zones.to_vec(),
                groups: groups.to_vec(),
            },
        );

        self.devices.insert(device_id.to_string(), conn.id);
        self.user_devices
            .entry(user_id.to_string())
            .or_default()
            .insert(device_id.to_string());

        log::info!(
            "[Plane] Device {} authenticated (user={}, zones={:?})",
            device_id,
            user_id,
            zones
        );

        self.broadcast_to_dashboards(&ServerMessage::DeviceConnected {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            zone_ids: zones.to_vec(),
            total_devices: self.device_count(),
        });

        DeviceAuthOutcome { superseded }
    }

    /// Moves a pending socket into the caregiver/mobile indexes.
    pub fn authenticate_client(
        &self,
        conn: &Arc<Connection>,
        role: Role,
        user_id: &str,
        groups: &[String],
    ) {
        debug_assert!(!role.is_device());
        self.install_identity(
            conn,
            Identity {
                role,
                device_id: None,
                user_id: Some(user_id.to_string()),
                zones: Vec::new(),
                groups: groups.to_vec(),
            },
        );
        log::info!(
            "[Plane] {:?} connection {} authenticated (user={})",
            role,
            conn.id,
            user_id
        );
    }

    /// Registers an observer dashboard.
    pub fn authenticate_dashboard(&self, conn: &Arc<Connection>) {
        self.install_identity(
            conn,
            Identity {
                role: Role::Dashboard,
                device_id: None,
                user_id: None,
                zones: Vec::new(),
                groups: Vec::new(),
            },
        );
        self.dashboards.insert(conn.id, ());
        log::info!(
            "[Plane] Dashboard connected (total={})",
            self.dashboards.len()
        );
    }

    fn install_identity(&self, conn: &Arc<Connection>, identity: Identity) {
        self.pending.remove(&conn.id);
        if let Some(user_id) = identity.user_id.clone().filter(|u| !u.is_empty()) {
            self.users.entry(user_id).or_default().insert(conn.id);
        }
        for zone in &identity.zones {
            self.zones.entry(zone.clone()).or_default().insert(conn.id);
        }
        for group in &identity.groups {
            self.groups.entry(group.clone()).or_default().insert(conn.id);
        }
        *conn.identity.write() = Some(identity);
    }

    /// Subscribes an authenticated connection to a group. Idempotent;
    /// failures are silent.
    pub fn subscribe_group(&self, conn: &Arc<Connection>, group_id: &str) {
        if !conn.is_authenticated() {
            return;
        }
        self.groups
            .entry(group_id.to_string())
            .or_default()
            .insert(conn.id);
        log::info!("[Plane] Connection {} subscribed to group {}", conn.id, group_id);
    }

    /// Removes a connection from every index.
    ///
    /// Returns the device id if the connection was a device socket and was
    /// still the indexed socket for that id.
    pub fn disconnect(&self, conn: &Arc<Connection>) -> Option<String> {
        if self.connections.remove(&conn.id).is_none() {
            return None; // already disconnected
        }
        self.pending.remove(&conn.id);
        self.dashboards.remove(&conn.id);

        let identity = conn.snapshot_identity();
        let Some(identity) = identity else {
            log::info!("[Plane] Pending connection {} closed", conn.id);
            return None;
        };

        for zone in &identity.zones {
            if let Some(mut set) = self.zones.get_mut(zone) {
                set.remove(&conn.id);
            }
        }
        self.zones.retain(|_, set| !set.is_empty());
        self.groups.iter_mut().for_each(|mut set| {
            set.remove(&conn.id);
        });
        self.groups.retain(|_, set| !set.is_empty());

        if let Some(user_id) = &identity.user_id {
            if let Some(mut set) = self.users.get_mut(user_id) {
                set.remove(&conn.id);
            }
            self.users.retain(|_, set| !set.is_empty());
        }

        let mut removed_device = None;
        if let Some(device_id) = &identity.device_id {
            // Only deindex if this connection is still the active socket;
            // a superseding socket may have replaced the entry already.
            let was_active = self
                .devices
                .remove_if(device_id, |_, conn_id| *conn_id == conn.id)
                .is_some();
            if was_active {
                if let Some(user_id) = &identity.user_id {
                    if let Some(mut set) = self.user_devices.get_mut(user_id) {
                        set.remove(device_id);
                    }
                    self.user_devices.retain(|_, set| !set.is_empty());
                }
                removed_device = Some(device_id.clone());
                log::info!("[Plane] Device {} disconnected", device_id);
                self.broadcast_to_dashboards(&ServerMessage::DeviceDisconnected {
                    device_id: device_id.clone(),
                    total_devices: self.device_count(),
                });
            }
        }
        removed_device
    }

    // ─────────────────────────────────────────────────────────────────────
    // Delivery
    // ─────────────────────────────────────────────────────────────────────

    /// Enqueues a frame on one connection. Returns false when the channel
    /// is closed (socket task gone); the caller deindexes lazily.
    fn send_frame(&self, conn: &Arc<Connection>, frame: Frame) -> bool {
        match conn.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Slow consumer: best-effort delivery, drop the frame.
                log::debug!("[Plane] Outbound queue full for connection {}", conn.id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Sends a message to one connection, deindexing it if dead.
    pub fn send(&self, conn: &Arc<Connection>, msg: &ServerMessage) {
        if let Some(body) = msg.to_frame() {
            if !self.send_frame(conn, Frame::Text(body)) {
                self.disconnect(conn);
            }
        }
    }

    /// Requests the socket task close the connection.
    pub fn close(&self, conn: &Arc<Connection>, code: u16, reason: &str) {
        self.send_frame(
            conn,
            Frame::Close {
                code,
                reason: reason.to_string(),
            },
        );
    }

    fn send_to_id(&self, id: ConnectionId, frame: Frame) {
        let Some(conn) = self.connections.get(&id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        if !self.send_frame(&conn, frame) {
            self.disconnect(&conn);
        }
    }

    /// Sends a message to a device's active socket.
    pub fn send_to_device(&self, device_id: &str, msg: &ServerMessage) {
        let Some(body) = msg.to_frame() else { return };
        if let Some(id) = self.devices.get(device_id).map(|e| *e.value()) {
            self.send_to_id(id, Frame::Text(body));
        }
    }

    /// Sends raw audio bytes to a device's active socket.
    pub fn send_binary_to_device(&self, device_id: &str, data: Bytes) {
        if let Some(id) = self.devices.get(device_id).map(|e| *e.value()) {
            self.send_to_id(id, Frame::Binary(data));
        }
    }

    /// Sends a message to every connection of one user.
    pub fn send_to_user(&self, user_id: &str, msg: &ServerMessage) {
        let Some(body) = msg.to_frame() else { return };
        let ids: Vec<ConnectionId> = self
            .users
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            self.send_to_id(id, Frame::Text(body.clone()));
        }
    }

    /// Sends a message to the caregiver/mobile connections paired with a
    /// device (same user as the wearer).
    pub fn send_to_paired_caregiver(&self, device_id: &str, msg: &ServerMessage) {
        let Some(body) = msg.to_frame() else { return };
        let user_id = self
            .devices
            .get(device_id)
            .map(|e| *e.value())
            .and_then(|id| self.connections.get(&id).map(|e| Arc::clone(e.value())))
            .and_then(|conn| conn.user_id());
        let Some(user_id) = user_id else { return };

        let ids: Vec<ConnectionId> = self
            .users
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            let Some(conn) = self.connections.get(&id).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            if conn.role().is_some_and(Role::is_caregiver_side)
                && !self.send_frame(&conn, Frame::Text(body.clone()))
            {
                self.disconnect(&conn);
            }
        }
    }

    /// Fan-out to every connection in a zone.
    pub fn broadcast_to_zone(&self, zone_id: &str, msg: &ServerMessage) {
        let Some(body) = msg.to_frame() else { return };
        let ids: Vec<ConnectionId> = self
            .zones
            .get(zone_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            self.send_to_id(id, Frame::Text(body.clone()));
        }
    }

    /// Fan-out to every subscriber of a group.
    pub fn broadcast_to_group(&self, group_id: &str, msg: &ServerMessage) {
        let Some(body) = msg.to_frame() else { return };
        let ids: Vec<ConnectionId> = self
            .groups
            .get(group_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            self.send_to_id(id, Frame::Text(body.clone()));
        }
    }

    /// Fan-out to every dashboard.
    pub fn broadcast_to_dashboards(&self, msg: &ServerMessage) {
        let Some(body) = msg.to_frame() else { return };
        let ids: Vec<ConnectionId> = self.dashboards.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.send_to_id(id, Frame::Text(body.clone()));
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Number of indexed device sockets.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Device ids currently indexed in a zone.
    pub fn devices_in_zone(&self, zone_id: &str) -> Vec<String> {
        let ids: Vec<ConnectionId> = self
            .zones
            .get(zone_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.connections.get(&id).map(|e| Arc::clone(e.value())))
            .filter_map(|conn| conn.device_id())
            .collect()
    }

    /// Device ids belonging to a user.
    pub fn devices_for_user(&self, user_id: &str) -> Vec<String> {
        self.user_devices
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Zone ids with at least one live connection.
    pub fn live_zones(&self) -> Vec<String> {
        self.zones.iter().map(|e| e.key().clone()).collect()
    }

    /// Distinct user ids across a group's live subscribers.
    pub fn users_in_group(&self, group_id: &str) -> Vec<String> {
        let ids: Vec<ConnectionId> = self
            .groups
            .get(group_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let mut users: Vec<String> = ids
            .into_iter()
            .filter_map(|id| self.connections.get(&id).map(|e| Arc::clone(e.value())))
            .filter_map(|conn| conn.user_id())
            .collect();
        users.sort();
        users.dedup();
        users
    }

    /// Whether a device currently has an active socket.
    pub fn device_online(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// The device id's active connection, if any.
    pub fn device_connection(&self, device_id: &str) -> Option<Arc<Connection>> {
        let id = self.devices.get(device_id).map(|e| *e.value())?;
        self.connections.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Status snapshot for dashboards and the status endpoint.
    pub fn status(&self) -> serde_json::Value {
        let devices: serde_json::Map<String, serde_json::Value> = self
            .devices
            .iter()
            .filter_map(|e| {
                let conn = self.connections.get(e.value()).map(|c| Arc::clone(c.value()))?;
                let identity = conn.snapshot_identity()?;
                Some((
                    e.key().clone(),
                    json!({
                        "user_id": identity.user_id,
                        "zones": identity.zones,
                        "connected_at": conn.connected_at,
                    }),
                ))
            })
            .collect();

        json!({
            "active_devices": self.devices.len(),
            "dashboard_clients": self.dashboards.len(),
            "pending_connections": self.pending.len(),
            "group_subscriptions": self
                .groups
                .iter()
                .map(|e| (e.key().clone(), json!(e.value().len())))
                .collect::<serde_json::Map<_, _>>(),
            "devices": devices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane() -> ConnectionPlane {
        ConnectionPlane::new(16)
    }

    fn auth_device(
        plane: &ConnectionPlane,
        device: &str,
        user: &str,
        zones: &[&str],
    ) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (conn, rx) = plane.accept();
        let zones: Vec<String> = zones.iter().map(|z| z.to_string()).collect();
        plane.authenticate_device(&conn, Role::Watch, device, user, &zones, &[]);
        (conn, rx)
    }

    fn drain_text(rx: &mut mpsc::Receiver<Frame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Text(body) = frame {
                out.push(body);
            }
        }
        out
    }

    #[test]
    fn at_most_one_connection_per_device_id() {
        let plane = plane();
        let (_old, mut old_rx) = auth_device(&plane, "d1", "u1", &[]);
        let (new, _new_rx) = auth_device(&plane, "d1", "u1", &[]);

        assert_eq!(plane.device_count(), 1);
        assert_eq!(plane.device_connection("d1").unwrap().id(), new.id());

        // Old socket received a superseded close.
        let close = old_rx.try_recv().ok();
        assert!(matches!(
            close,
            Some(Frame::Close { code, .. }) if code == CLOSE_SUPERSEDED
        ));
    }

    #[test]
    fn disconnect_clears_every_index() {
        let plane = plane();
        let (conn, _rx) = auth_device(&plane, "d1", "u1", &["z1"]);
        plane.subscribe_group(&conn, "g1");

        assert_eq!(plane.devices_in_zone("z1"), vec!["d1".to_string()]);
        let removed = plane.disconnect(&conn);
        assert_eq!(removed, Some("d1".to_string()));
        assert!(plane.devices_in_zone("z1").is_empty());
        assert!(plane.devices_for_user("u1").is_empty());
        assert!(!plane.device_online("d1"));
    }

    #[test]
    fn superseded_old_socket_disconnect_keeps_new_index() {
        let plane = plane();
        let (old, _old_rx) = auth_device(&plane, "d1", "u1", &[]);
        let (new, _new_rx) = auth_device(&plane, "d1", "u1", &[]);

        // Old socket's task eventually observes the close and disconnects;
        // the new socket must stay indexed.
        plane.disconnect(&old);
        assert!(plane.device_online("d1"));
        assert_eq!(plane.device_connection("d1").unwrap().id(), new.id());
    }

    #[test]
    fn zone_fanout_skips_dead_sockets() {
        let plane = plane();
        let (_a, mut a_rx) = auth_device(&plane, "d1", "u1", &["z1"]);
        let (_b, b_rx) = auth_device(&plane, "d2", "u2", &["z1"]);
        drop(b_rx); // d2's socket task is gone

        plane.broadcast_to_zone("z1", &ServerMessage::Pong { timestamp: 1 });

        let delivered = drain_text(&mut a_rx);
        assert!(delivered.iter().any(|m| m.contains("pong")));
        // Dead socket was lazily deindexed.
        assert!(!plane.device_online("d2"));
        assert!(plane.device_online("d1"));
    }

    #[test]
    fn subscribe_group_is_idempotent() {
        let plane = plane();
        let (conn, mut rx) = auth_device(&plane, "d1", "u1", &[]);
        plane.subscribe_group(&conn, "g1");
        plane.subscribe_group(&conn, "g1");

        drain_text(&mut rx);
        plane.broadcast_to_group("g1", &ServerMessage::Pong { timestamp: 2 });
        let delivered = drain_text(&mut rx);
        assert_eq!(delivered.len(), 1);
    }

    #[test]
    fn paired_caregiver_receives_by_shared_user() {
        let plane = plane();
        let (_watch, _watch_rx) = auth_device(&plane, "d1", "u1", &[]);

        let (caregiver, mut caregiver_rx) = plane.accept();
        plane.authenticate_client(&caregiver, Role::Caregiver, "u1", &[]);

        let (stranger, mut stranger_rx) = plane.accept();
        plane.authenticate_client(&stranger, Role::Caregiver, "u2", &[]);

        plane.send_to_paired_caregiver(
            "d1",
            &ServerMessage::RingPulseCheckin {
                device_id: "d1".into(),
                member_name: "u1".into(),
                photo_url: String::new(),
                message: "I'm okay!".into(),
            },
        );

        assert_eq!(drain_text(&mut caregiver_rx).len(), 1);
        assert!(drain_text(&mut stranger_rx).is_empty());
    }

    #[test]
    fn dashboards_get_connect_disconnect_events() {
        let plane = plane();
        let (dash, mut dash_rx) = plane.accept();
        plane.authenticate_dashboard(&dash);

        let (conn, _rx) = auth_device(&plane, "d1", "u1", &[]);
        plane.disconnect(&conn);

        let events = drain_text(&mut dash_rx);
        assert!(events.iter().any(|m| m.contains("device_connected")));
        assert!(events.iter().any(|m| m.contains("device_disconnected")));
    }

    #[test]
    fn unauthenticated_subscribe_is_silent() {
        let plane = plane();
        let (conn, _rx) = plane.accept();
        plane.subscribe_group(&conn, "g1");
        plane.broadcast_to_group("g1", &ServerMessage::Pong { timestamp: 3 });
        // No panic, no delivery, no index entry.
        assert!(plane.groups.get("g1").is_none());
    }
}
