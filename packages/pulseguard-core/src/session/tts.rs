//! Streaming TTS collaborator.
//!
//! Streams synthesized PCM16 straight through to the watch as chunks
//! arrive. Missing credentials make every call a no-op, per the degrade
//! rule for voice features.

use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use thiserror::Error;

use crate::state::AgentConfig;

/// Error from the TTS collaborator.
#[derive(Debug, Error)]
pub enum TtsError {
    #[error("tts not configured")]
    NotConfigured,

    #[error("tts request failed: {0}")]
    Request(String),

    #[error("tts returned status {0}")]
    Status(u16),
}

/// HTTP streaming client for the TTS endpoint.
pub struct TtsClient {
    http: reqwest::Client,
    config: AgentConfig,
}

impl TtsClient {
    pub fn new(http: reqwest::Client, config: AgentConfig) -> Self {
        Self { http, config }
    }

    /// Whether TTS playback is configured at all.
    pub fn available(&self) -> bool {
        self.config.tts_available()
    }

    /// Streams synthesized audio for `text`, handing each PCM chunk to
    /// `sink` in arrival order.
    pub async fn stream_pcm<F>(&self, text: &str, mut sink: F) -> Result<(), TtsError>
    where
        F: FnMut(Bytes) + Send,
    {
        if !self.available() {
            return Err(TtsError::NotConfigured);
        }

        let url = format!(
            "{}/{}/stream?output_format={}",
            self.config.tts_endpoint, self.config.tts_voice_id, self.config.tts_output_format
        );
        let response = self
            .http
            .post(&url)
            .header("xi-api-key", &self.config.api_key)
            .json(&json!({
                "text": text,
                "model_id": self.config.tts_model_id,
            }))
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TtsError::Status(response.status().as_u16()));
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TtsError::Request(e.to_string()))?;
            if !chunk.is_empty() {
                sink(chunk);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_tts_is_noop() {
        let client = TtsClient::new(reqwest::Client::new(), AgentConfig::default());
        assert!(!client.available());
        let result = client.stream_pcm("hello", |_| {}).await;
        assert!(matches!(result, Err(TtsError::NotConfigured)));
    }
}
