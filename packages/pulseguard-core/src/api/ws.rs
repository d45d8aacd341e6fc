//! WebSocket handler: accept, authenticate, route.
//!
//! Each socket runs one task that owns the sink. Outbound fan-out from
//! services arrives on the connection's frame queue; inbound frames are
//! parsed into the tagged message grammar and routed to services. A
//! pending socket that does not authenticate within the configured window
//! is closed with code 4001.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;

use crate::api::AppState;
use crate::protocol::{
    AuthRole, ClientMessage, ParseOutcome, PresageReading, RelayRole, ServerMessage, TriggerVitals,
    Vitals, CLOSE_AUTH_TIMEOUT, CLOSE_PAIRING_CANCELLED,
};
use crate::services::connection_plane::{Connection, Frame, Role};
use crate::services::episodes::{Episode, EpisodePhase, Resolution};
use crate::services::health_ingest::{Reading, Window};
use crate::services::{GroupType, InferenceOutput};
use crate::utils::now_millis;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Main socket loop: one task owns the sink, multiplexing outbound frames,
/// inbound messages, and the authentication deadline.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbound) = state.plane.accept();

    let auth_deadline = tokio::time::sleep(Duration::from_secs(state.config.ws_auth_timeout_secs));
    tokio::pin!(auth_deadline);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(Frame::Text(body)) => {
                        if sender.send(Message::Text(body.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Frame::Binary(data)) => {
                        if sender.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Frame::Close { code, reason }) => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut auth_deadline, if !conn.is_authenticated() => {
                log::info!("[WS] Connection {} authentication timeout", conn.id());
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_AUTH_TIMEOUT,
                        reason: "authentication timeout".into(),
                    })))
                    .await;
                break;
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&state, &conn, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle_binary(&state, &conn, data).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    if let Some(device_id) = state.plane.disconnect(&conn) {
        state.sessions.watch_disconnected(&device_id);
        // A superseded socket returns None above, so a reconnecting
        // device keeps its ring and score; only a departed one is purged.
        state.ingest.forget_device(&device_id);
        state.scores.forget_device(&device_id);
    }
}

/// Binary frames are 16 kHz PCM16 from a watch, upstream to the agent.
async fn handle_binary(state: &AppState, conn: &Arc<Connection>, data: Bytes) {
    if conn.role() != Some(Role::Watch) {
        return;
    }
    let (Some(device_id), Some(user_id)) = (conn.device_id(), conn.user_id()) else {
        return;
    };
    state.sessions.watch_audio(&device_id, &user_id, data).await;
}

async fn handle_text(state: &AppState, conn: &Arc<Connection>, text: &str) {
    match ClientMessage::parse(text) {
        ParseOutcome::Message(msg) => route_message(state, conn, *msg).await,
        ParseOutcome::InvalidJson => {
            state.plane.send(
                conn,
                &ServerMessage::Error {
                    message: "Invalid JSON".to_string(),
                },
            );
        }
        ParseOutcome::Malformed { msg_type, detail } => {
            log::debug!("[WS] Malformed {} message: {}", msg_type, detail);
            state.plane.send(
                conn,
                &ServerMessage::Error {
                    message: format!("Invalid {} message", msg_type),
                },
            );
        }
        ParseOutcome::UnknownType(msg_type) => {
            log::warn!("[WS] Unknown message type: {}", msg_type);
        }
    }
}

fn send_error(state: &AppState, conn: &Arc<Connection>, message: &str) {
    state.plane.send(
        conn,
        &ServerMessage::Error {
            message: message.to_string(),
        },
    );
}

/// Requires the connection to be a watch with a device id.
fn watch_identity(conn: &Arc<Connection>) -> Option<(String, String)> {
    if conn.role() != Some(Role::Watch) {
        return None;
    }
    Some((conn.device_id()?, conn.user_id()?))
}

async fn route_message(state: &AppState, conn: &Arc<Connection>, msg: ClientMessage) {
    // Pre-auth, only authenticate/register/ping/dashboard_subscribe are
    // meaningful; everything else is rejected on the offending socket.
    if !conn.is_authenticated()
        && !matches!(
            msg,
            ClientMessage::Authenticate { .. }
                | ClientMessage::Register { .. }
                | ClientMessage::Ping
                | ClientMessage::DashboardSubscribe
        )
    {
        send_error(state, conn, "Not authenticated");
        return;
    }

    match msg {
        ClientMessage::Authenticate {
            device_id,
            user_id,
            zone_ids,
            group_ids,
            role,
            token: _,
        } => {
            handle_authenticate(state, conn, device_id, user_id, zone_ids, group_ids, role);
        }

        ClientMessage::Register { role } => {
            let plane_role = match role {
                RelayRole::Watch => Role::Relay,
                RelayRole::Mobile => Role::Mobile,
            };
            state.plane.authenticate_client(conn, plane_role, "", &[]);
        }

        ClientMessage::SubscribeGroup { group_id } => {
            state.plane.subscribe_group(conn, &group_id);
            state
                .plane
                .send(conn, &ServerMessage::GroupSubscribed { group_id });
        }

        ClientMessage::Ping => {
            state.plane.send(
                conn,
                &ServerMessage::Pong {
                    timestamp: now_millis(),
                },
            );
        }

        ClientMessage::HealthData { vitals, timestamp } => {
            handle_health_data(state, conn, vitals, timestamp).await;
        }

        ClientMessage::HealthBatch { window } => {
            handle_health_batch(state, conn, window).await;
        }

        ClientMessage::Command => {
            let Some((device_id, user_id)) = watch_identity(conn) else {
                send_error(state, conn, "Commands must come from a watch");
                return;
            };
            state.sessions.patient_command(&device_id, &user_id).await;
        }

        ClientMessage::CaregiverEvent { event, payload } => {
            if conn.role() != Some(Role::Caregiver) {
                send_error(state, conn, "Only caregivers can send events");
                return;
            }
            let Some(user_id) = conn.user_id() else {
                send_error(state, conn, "Only caregivers can send events");
                return;
            };
            if let Err(e) = state.sessions.caregiver_event(&user_id, &event, &payload).await {
                send_error(state, conn, &e.to_string());
            }
        }

        ClientMessage::CaregiverCallStart => {
            if conn.role() != Some(Role::Caregiver) {
                send_error(state, conn, "Only caregivers can start calls");
                return;
            }
            let Some(user_id) = conn.user_id() else { return };
            // The wearer's conversation yields to the live call.
            for device_id in state.plane.devices_for_user(&user_id) {
                if let Some(session) = state.sessions.get(&device_id) {
                    session
                        .pause_conversation("Caregiver call in progress", false)
                        .await;
                    session.log_event("Caregiver call started").await;
                }
            }
        }

        ClientMessage::CaregiverCallEnd => {
            if conn.role() != Some(Role::Caregiver) {
                send_error(state, conn, "Only caregivers can end calls");
                return;
            }
            let Some(user_id) = conn.user_id() else { return };
            for device_id in state.plane.devices_for_user(&user_id) {
                if let Some(session) = state.sessions.get(&device_id) {
                    session.log_event("Caregiver call ended").await;
                }
            }
        }

        ClientMessage::CancelPairing { pairing_code } => {
            handle_cancel_pairing(state, conn, &pairing_code);
        }

        ClientMessage::ReconnectRequest => {
            if watch_identity(conn).is_none() {
                send_error(state, conn, "Only watches can request reconnection");
                return;
            }
            state.plane.send(conn, &ServerMessage::ReconnectApproved);
        }

        ClientMessage::ReconnectApprove { device_id } => {
            if conn.role() != Some(Role::Caregiver) {
                send_error(state, conn, "Only caregivers can approve reconnection");
                return;
            }
            state
                .plane
                .send_to_device(&device_id, &ServerMessage::ReconnectApproved);
        }

        ClientMessage::ReconnectReject { device_id } => {
            if conn.role() != Some(Role::Caregiver) {
                send_error(state, conn, "Only caregivers can reject reconnection");
                return;
            }
            state
                .plane
                .send_to_device(&device_id, &ServerMessage::ReconnectRejected);
        }

        ClientMessage::DeadmanCancel { pending_id } => {
            let Some((device_id, _)) = watch_identity(conn) else {
                send_error(state, conn, "Only watches can cancel");
                return;
            };
            state
                .sessions
                .deadman_cancel(&device_id, pending_id.trim())
                .await;
        }

        ClientMessage::MediaEvent { event, payload } => {
            let Some((device_id, _)) = watch_identity(conn) else {
                send_error(state, conn, "Only watches can send media events");
                return;
            };
            state
                .sessions
                .media_event(&device_id, event.trim(), &payload)
                .await;
        }

        ClientMessage::TtsPlaybackComplete => {
            if let Some((device_id, _)) = watch_identity(conn) {
                state.sessions.tts_playback_complete(&device_id).await;
            }
        }

        ClientMessage::PulseCheckin { photo_url, message } => {
            let Some((device_id, user_id)) = watch_identity(conn) else {
                send_error(state, conn, "Only watches can send pulse check-ins");
                return;
            };
            state.plane.send_to_paired_caregiver(
                &device_id,
                &ServerMessage::RingPulseCheckin {
                    device_id: device_id.clone(),
                    member_name: user_id,
                    photo_url,
                    message,
                },
            );
        }

        ClientMessage::EpisodeStart { trigger, group_id } => {
            handle_episode_start(state, conn, trigger, group_id).await;
        }

        ClientMessage::EpisodeCalmingDone { episode_id, vitals } => {
            handle_episode_calming_done(state, conn, episode_id, vitals).await;
        }

        ClientMessage::EpisodePresageResult {
            episode_id,
            presage,
        } => {
            handle_episode_presage(state, conn, episode_id, presage).await;
        }

        ClientMessage::EpisodeResolve {
            episode_id,
            resolution,
        } => {
            handle_episode_resolve(state, conn, episode_id, resolution).await;
        }

        ClientMessage::DashboardSubscribe => {
            state.plane.authenticate_dashboard(conn);
            state.plane.send(
                conn,
                &ServerMessage::DashboardSubscribed {
                    status: state.plane.status(),
                },
            );
        }
    }
}

fn handle_authenticate(
    state: &AppState,
    conn: &Arc<Connection>,
    device_id: String,
    user_id: String,
    zone_ids: Vec<String>,
    group_ids: Vec<String>,
    role: AuthRole,
) {
    if conn.is_authenticated() {
        send_error(state, conn, "Already authenticated");
        return;
    }
    if device_id.is_empty() || user_id.is_empty() {
        state.plane.send(
            conn,
            &ServerMessage::AuthError {
                message: "device_id and user_id required".to_string(),
            },
        );
        return;
    }

    match role {
        AuthRole::Device | AuthRole::Watch => {
            let plane_role = if role == AuthRole::Watch {
                Role::Watch
            } else {
                Role::Device
            };
            state
                .plane
                .authenticate_device(conn, plane_role, &device_id, &user_id, &zone_ids, &group_ids);
        }
        AuthRole::Caregiver | AuthRole::Mobile => {
            let plane_role = if role == AuthRole::Caregiver {
                Role::Caregiver
            } else {
                Role::Mobile
            };
            state
                .plane
                .authenticate_client(conn, plane_role, &user_id, &group_ids);
        }
    }

    state.plane.send(
        conn,
        &ServerMessage::Authenticated {
            device_id,
            user_id,
            zone_ids,
            group_ids,
        },
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Health data
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_health_data(
    state: &AppState,
    conn: &Arc<Connection>,
    vitals: Vitals,
    timestamp: Option<u64>,
) {
    if conn.role().filter(|r| r.is_device()).is_none() {
        send_error(state, conn, "Only devices can push readings");
        return;
    }
    let (Some(device_id), Some(user_id)) = (conn.device_id(), conn.user_id()) else {
        return;
    };

    let reading = Reading::new(&device_id, &user_id, vitals, timestamp);
    state.ingest.ingest(reading.clone());

    let window = match state.ingest.window(&device_id) {
        Some(w) => w,
        None => match state.ingest.partial_window(&device_id) {
            Some(w) => w,
            None => return,
        },
    };

    match state.inference.infer(window).await {
        Ok(result) => {
            publish_score(state, conn, &device_id, &reading, result).await;
        }
        Err(e) => {
            // Degrade: this tick produced no score.
            log::warn!("[WS] Inference failed for {}: {}", device_id, e);
        }
    }
}

async fn handle_health_batch(state: &AppState, conn: &Arc<Connection>, rows: Vec<Vec<f32>>) {
    if conn.role().filter(|r| r.is_device()).is_none() {
        send_error(state, conn, "Only devices can push readings");
        return;
    }
    let (Some(device_id), Some(user_id)) = (conn.device_id(), conn.user_id()) else {
        return;
    };

    let Some(window) = Window::from_rows(&rows) else {
        send_error(state, conn, "Invalid window shape");
        return;
    };
    let latest = window.rows().last().copied().unwrap_or_default();
    let reading = Reading::new(
        &device_id,
        &user_id,
        Vitals {
            heart_rate: latest[0] as f64,
            hrv: latest[1] as f64,
            acceleration: latest[2] as f64,
            skin_temp: latest[3] as f64,
        },
        None,
    );

    match state.inference.infer(window).await {
        Ok(result) => {
            publish_score(state, conn, &device_id, &reading, result).await;
        }
        Err(e) => {
            log::warn!("[WS] Batch inference failed for {}: {}", device_id, e);
            send_error(state, conn, "Inference unavailable");
        }
    }
}

/// Records a fresh score and fans it out: the device gets its result,
/// dashboards the full update, and the device's scopes are re-aggregated.
async fn publish_score(
    state: &AppState,
    conn: &Arc<Connection>,
    device_id: &str,
    reading: &Reading,
    result: InferenceOutput,
) {
    state.scores.record(device_id, result.clone());

    state.plane.send(
        conn,
        &ServerMessage::AnomalyResult {
            device_id: device_id.to_string(),
            score: result.overall_score,
            status: if result.is_anomaly { "anomaly" } else { "normal" }.to_string(),
            is_anomaly: result.is_anomaly,
        },
    );

    state.plane.broadcast_to_dashboards(&ServerMessage::HealthUpdate {
        device_id: device_id.to_string(),
        reading: serde_json::to_value(reading).unwrap_or(serde_json::Value::Null),
        anomaly: serde_json::to_value(&result).unwrap_or(serde_json::Value::Null),
    });

    // Re-aggregate the scopes this device belongs to.
    state.alerts.check_zones(&conn.zones());

    for group_id in conn.groups() {
        let members = state.plane.users_in_group(&group_id);
        let snapshot = state
            .aggregation
            .compute_group(&group_id, GroupType::Community, &members);
        state.plane.broadcast_to_group(
            &group_id,
            &ServerMessage::GroupHealthUpdate {
                group_id: group_id.clone(),
                snapshot,
            },
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pairing
// ─────────────────────────────────────────────────────────────────────────────

/// Pairing rows live in the external store; the plane only relays the
/// cancellation to both sides and drops the watch socket.
fn handle_cancel_pairing(state: &AppState, conn: &Arc<Connection>, pairing_code: &str) {
    let Some(user_id) = conn.user_id() else {
        send_error(state, conn, "Not authenticated");
        return;
    };
    let cancelled_by = if conn.role() == Some(Role::Caregiver) {
        "phone"
    } else {
        "watch"
    };

    state.plane.send_to_user(
        &user_id,
        &ServerMessage::PairingCancelled {
            pairing_code: pairing_code.to_string(),
            cancelled_by: cancelled_by.to_string(),
        },
    );

    if cancelled_by == "phone" {
        for device_id in state.plane.devices_for_user(&user_id) {
            if let Some(device_conn) = state.plane.device_connection(&device_id) {
                state.plane.close(
                    &device_conn,
                    CLOSE_PAIRING_CANCELLED,
                    "Pairing cancelled by caregiver",
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Episodes
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves which episode a message targets: an explicit id, or the active
/// episode of the sender's (or the caregiver's paired) device.
fn resolve_episode(
    state: &AppState,
    conn: &Arc<Connection>,
    episode_id: Option<&str>,
) -> Option<Episode> {
    if let Some(id) = episode_id {
        return state.episodes.episode(id);
    }
    let device_id = conn.device_id().or_else(|| {
        let user_id = conn.user_id()?;
        state.plane.devices_for_user(&user_id).into_iter().next()
    })?;
    state.episodes.active_for_device(&device_id)
}

async fn handle_episode_start(
    state: &AppState,
    conn: &Arc<Connection>,
    trigger: TriggerVitals,
    group_id: Option<String>,
) {
    let (Some(device_id), Some(user_id)) = (conn.device_id(), conn.user_id()) else {
        send_error(state, conn, "Episodes require a device connection");
        return;
    };

    let already_active = state.episodes.active_for_device(&device_id).is_some();
    let episode = state
        .episodes
        .start(&device_id, &user_id, trigger.clone(), group_id);

    if !already_active {
        // Fresh episode: the wearer goes straight into guided calming.
        state
            .episodes
            .update_phase(&episode.id, EpisodePhase::Calming, None);

        state.plane.send_to_paired_caregiver(
            &device_id,
            &ServerMessage::RingEpisodeAlert {
                device_id: device_id.clone(),
                member_name: user_id.clone(),
                trigger_type: trigger
                    .anomaly_type
                    .unwrap_or_else(|| "elevated_hr".to_string()),
                phase: "anomaly_detected".to_string(),
            },
        );
    }

    let episode = state.episodes.episode(&episode.id).unwrap_or(episode);
    if let Some(group_id) = &episode.group_id {
        state.plane.broadcast_to_group(
            group_id,
            &ServerMessage::EpisodeStarted {
                episode: episode.clone(),
            },
        );
    }
    state
        .plane
        .broadcast_to_dashboards(&ServerMessage::EpisodeStarted { episode });
}

async fn handle_episode_calming_done(
    state: &AppState,
    conn: &Arc<Connection>,
    episode_id: Option<String>,
    vitals: Vitals,
) {
    let Some(episode) = resolve_episode(state, conn, episode_id.as_deref()) else {
        send_error(state, conn, "Episode not found");
        return;
    };

    let Some(updated) = state.episodes.submit_calming(&episode.id, vitals) else {
        send_error(state, conn, "Failed to process calming result");
        return;
    };

    if updated.phase == EpisodePhase::Escalating {
        state.escalation.start(&updated);
    }
    broadcast_episode_progress(state, &updated);
}

async fn handle_episode_presage(
    state: &AppState,
    conn: &Arc<Connection>,
    episode_id: Option<String>,
    presage: PresageReading,
) {
    let Some(episode) = resolve_episode(state, conn, episode_id.as_deref()) else {
        send_error(state, conn, "Episode not found");
        return;
    };

    let Some(updated) = state.episodes.submit_presage(&episode.id, presage).await else {
        send_error(state, conn, "Failed to process presage data");
        return;
    };

    match updated.phase {
        EpisodePhase::Escalating => state.escalation.start(&updated),
        EpisodePhase::Resolved => state.escalation.cancel(&updated.id),
        _ => {}
    }
    broadcast_episode_progress(state, &updated);
}

async fn handle_episode_resolve(
    state: &AppState,
    conn: &Arc<Connection>,
    episode_id: Option<String>,
    resolution: Resolution,
) {
    let Some(episode) = resolve_episode(state, conn, episode_id.as_deref()) else {
        send_error(state, conn, "Episode not found");
        return;
    };

    state.escalation.cancel(&episode.id);
    let Some(resolved) = state.episodes.resolve(&episode.id, resolution) else {
        send_error(state, conn, "Failed to resolve episode");
        return;
    };
    broadcast_episode_progress(state, &resolved);
}

/// Fans an episode's current state out to its group, the dashboards, and
/// (for terminal states) the paired caregiver.
fn broadcast_episode_progress(state: &AppState, episode: &Episode) {
    let update = ServerMessage::EpisodeUpdate {
        episode: episode.clone(),
    };
    if let Some(group_id) = &episode.group_id {
        state.plane.broadcast_to_group(group_id, &update);
    }
    state.plane.broadcast_to_dashboards(&update);

    state.plane.broadcast_to_dashboards(&ServerMessage::EpisodePhaseUpdate {
        episode_id: episode.id.clone(),
        phase: episode.phase,
        data: None,
    });

    if episode.phase == EpisodePhase::Resolved {
        let resolution = episode.resolution.unwrap_or(Resolution::FalsePositive);
        let resolved = ServerMessage::EpisodeResolved {
            episode_id: episode.id.clone(),
            resolution,
        };
        if let Some(group_id) = &episode.group_id {
            state.plane.broadcast_to_group(group_id, &resolved);
        }
        state.plane.broadcast_to_dashboards(&resolved);
        state.plane.send_to_paired_caregiver(
            &episode.device_id,
            &ServerMessage::RingEpisodeResolved {
                device_id: episode.device_id.clone(),
                member_name: episode.user_id.clone(),
                resolution: resolution.as_str().to_string(),
            },
        );
    }
}
