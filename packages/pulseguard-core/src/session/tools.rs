//! Client tool-call dispatch.
//!
//! The agent invokes tools by name with loose JSON parameters; each is
//! validated here and mapped onto session operations. Results flow back
//! as `client_tool_result` frames, with `is_error` for rejected calls.

use std::sync::Arc;

use serde_json::Value;

use crate::session::context::SessionMode;
use crate::session::media::{MediaAction, MediaStopAction};
use crate::session::session::Session;

/// Tools this server handles; anything else is acknowledged as an error.
const HANDLED_TOOLS: &[&str] = &[
    "transfer_to_caregiver",
    "transfer_to_regular",
    "transfer_to_distress",
    "media_control",
    "end_session",
];

/// Whether a tool call should be dispatched at all.
pub fn should_handle(tool_name: &str) -> bool {
    HANDLED_TOOLS.contains(&tool_name)
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn bool_param(params: &Value, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Executes one tool call against the session.
pub async fn handle_tool_call(
    session: Arc<Session>,
    tool_name: String,
    tool_call_id: String,
    params: Value,
) {
    match tool_name.as_str() {
        "transfer_to_caregiver" => {
            let context = str_param(&params, "context");
            let command = bool_param(&params, "command");
            if let Err(e) = session
                .transfer_to_caregiver(&tool_call_id, context, command)
                .await
            {
                session
                    .send_tool_result(&tool_call_id, &e.to_string(), true)
                    .await;
            }
        }
        "transfer_to_regular" | "transfer_to_distress" => {
            let mode = if tool_name == "transfer_to_distress" {
                SessionMode::Distress
            } else {
                SessionMode::Normal
            };
            let reason = str_param(&params, "reason");
            let first_message = str_param(&params, "first_message");
            session.transfer_session(mode, reason, first_message).await;
            session
                .send_tool_result(
                    &tool_call_id,
                    &format!("Switched to {} support.", mode.as_str()),
                    false,
                )
                .await;
        }
        "media_control" => {
            handle_media_control(session, &tool_call_id, &params).await;
        }
        "end_session" => {
            let reason = str_param(&params, "reason").unwrap_or("Session ended by agent.");
            session
                .send_tool_result(&tool_call_id, "Ending the session.", false)
                .await;
            session.end_session(reason).await;
        }
        other => {
            session
                .send_tool_result(&tool_call_id, &format!("Unknown tool: {}", other), true)
                .await;
        }
    }
}

async fn handle_media_control(session: Arc<Session>, tool_call_id: &str, params: &Value) {
    let action = str_param(params, "action").unwrap_or_default();
    let vibe = str_param(params, "vibe").unwrap_or("calm");
    // Starts default to a confirmable countdown on the watch; the agent
    // can bypass it for direct wearer requests.
    let immediate = bool_param(params, "immediate");

    match action {
        "play_music" | "display_images" => {
            let media_action = if action == "play_music" {
                MediaAction::PlayMusic
            } else {
                MediaAction::DisplayImages
            };
            let result = if immediate {
                session
                    .start_media_now(tool_call_id, media_action, vibe)
                    .await
            } else {
                session
                    .arm_media_deadman(tool_call_id, media_action, vibe)
                    .await
                    .map(|_| ())
            };
            if let Err(e) = result {
                session
                    .send_tool_result(tool_call_id, &e.to_string(), true)
                    .await;
            }
        }
        "stop_music" | "stop_images" | "stop_all" => {
            let stop = match action {
                "stop_music" => MediaStopAction::Music,
                "stop_images" => MediaStopAction::Images,
                _ => MediaStopAction::All,
            };
            session.stop_media(stop).await;
            session
                .send_tool_result(tool_call_id, &format!("Stopped {}.", stop.as_str()), false)
                .await;
        }
        other => {
            session
                .send_tool_result(
                    tool_call_id,
                    &format!("Unknown media action: {}", other),
                    true,
                )
                .await;
        }
    }
}
