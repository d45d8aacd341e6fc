//! Outbound WebSocket stream to the external conversational agent.
//!
//! The socket is split into writer and reader halves. The writer drains a
//! command channel so any task can enqueue frames without owning the sink;
//! the reader forwards raw events to the session, which owns all protocol
//! interpretation. One `AgentStream` equals one conversation attempt; a
//! reconnect builds a fresh stream.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Error opening the agent stream.
#[derive(Debug, Error)]
pub enum AgentStreamError {
    #[error("invalid agent endpoint: {0}")]
    BadEndpoint(String),

    #[error("agent connect failed: {0}")]
    Connect(String),
}

/// Frame queued for delivery to the agent.
#[derive(Debug)]
pub enum AgentCommand {
    /// Arbitrary JSON message (init payload, pong, tool result, ...).
    Json(Value),
    /// Base64 PCM16 chunk, wrapped into the agent's audio envelope.
    AudioChunk(String),
    /// Close the stream from our side.
    Close { reason: String },
}

/// Raw event from the agent socket.
#[derive(Debug)]
pub enum AgentEvent {
    /// Socket is open; the init payload must be sent now.
    Open,
    /// Inbound text frame (ping / audio / tool call grammar).
    Message(String),
    /// Socket closed, by either side.
    Close { code: Option<u16>, reason: String },
    /// Transport error; a close event follows.
    Error(String),
}

/// Handle to one live agent conversation.
pub struct AgentStream {
    commands: mpsc::UnboundedSender<AgentCommand>,
}

impl AgentStream {
    /// Connects to the agent endpoint and spawns the writer/reader tasks.
    ///
    /// `Open`, `Message`, `Close`, and `Error` events arrive on `events`
    /// in socket order.
    pub async fn connect(
        endpoint: &str,
        agent_id: &str,
        api_key: &str,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<AgentStream, AgentStreamError> {
        let url = format!("{}?agent_id={}", endpoint, agent_id);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentStreamError::BadEndpoint(e.to_string()))?;
        request.headers_mut().insert(
            "xi-api-key",
            api_key
                .parse()
                .map_err(|_| AgentStreamError::BadEndpoint("bad api key header".to_string()))?,
        );

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| AgentStreamError::Connect(e.to_string()))?;
        log::info!("[Agent] Stream connected (agent={})", agent_id);

        let (mut writer, mut reader) = ws.split();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<AgentCommand>();

        // Writer: drain commands into the sink until close or channel drop.
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let result = match cmd {
                    AgentCommand::Json(value) => match serde_json::to_string(&value) {
                        Ok(body) => writer.send(Message::Text(body.into())).await,
                        Err(e) => {
                            log::error!("[Agent] Unserializable command: {}", e);
                            Ok(())
                        }
                    },
                    AgentCommand::AudioChunk(b64) => {
                        let envelope = json!({"user_audio_chunk": b64});
                        match serde_json::to_string(&envelope) {
                            Ok(body) => writer.send(Message::Text(body.into())).await,
                            Err(_) => Ok(()),
                        }
                    }
                    AgentCommand::Close { reason } => {
                        let _ = writer
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                };
                if let Err(e) = result {
                    log::warn!("[Agent] Write failed: {}", e);
                    break;
                }
            }
        });

        // Reader: forward socket events to the session.
        tokio::spawn(async move {
            if events.send(AgentEvent::Open).is_err() {
                return;
            }
            loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(AgentEvent::Message(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, "closed".to_string()));
                        let _ = events.send(AgentEvent::Close { code, reason });
                        return;
                    }
                    Some(Ok(_)) => {} // binary/ping/pong handled by the library
                    Some(Err(e)) => {
                        let _ = events.send(AgentEvent::Error(e.to_string()));
                        let _ = events.send(AgentEvent::Close {
                            code: None,
                            reason: format!("transport error: {}", e),
                        });
                        return;
                    }
                    None => {
                        let _ = events.send(AgentEvent::Close {
                            code: None,
                            reason: "stream ended".to_string(),
                        });
                        return;
                    }
                }
            }
        });

        Ok(AgentStream { commands: cmd_tx })
    }

    /// Enqueues a JSON message. Returns false once the stream is gone.
    pub fn send_json(&self, value: Value) -> bool {
        self.commands.send(AgentCommand::Json(value)).is_ok()
    }

    /// Enqueues an upstream audio chunk.
    pub fn send_audio_chunk(&self, b64: String) -> bool {
        self.commands.send(AgentCommand::AudioChunk(b64)).is_ok()
    }

    /// Requests a close from our side.
    pub fn close(&self, reason: &str) {
        let _ = self.commands.send(AgentCommand::Close {
            reason: reason.to_string(),
        });
    }
}

/// Shared handle to the session's current agent stream.
///
/// Controllers (audio gate, tool results) hold this instead of the session
/// itself; the session swaps the underlying stream on connect and pause.
#[derive(Default)]
pub struct AgentLink {
    inner: parking_lot::Mutex<Option<AgentStream>>,
}

impl AgentLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the stream for a freshly connected conversation.
    pub fn install(&self, stream: AgentStream) {
        *self.inner.lock() = Some(stream);
    }

    /// Detaches the current stream, if any.
    pub fn take(&self) -> Option<AgentStream> {
        self.inner.lock().take()
    }

    /// Whether a stream is currently attached.
    pub fn is_attached(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Sends a JSON message on the current stream. Returns false when no
    /// stream is attached or the stream is gone.
    pub fn send_json(&self, value: Value) -> bool {
        self.inner
            .lock()
            .as_ref()
            .is_some_and(|s| s.send_json(value))
    }

    /// Sends an upstream audio chunk on the current stream.
    pub fn send_audio_chunk(&self, b64: String) -> bool {
        self.inner
            .lock()
            .as_ref()
            .is_some_and(|s| s.send_audio_chunk(b64))
    }
}
