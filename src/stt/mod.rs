//! Speech-to-text provider adapter (spec §4.3) and resilient router (§4.4).

pub mod rolling;
pub mod router;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::{GatewayError, Result};

const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// One recognized segment of a transcription result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSegment {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// The result of a single `transcribe` call (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttResult {
    pub text: String,
    pub confidence: f32,
    pub segments: Vec<SttSegment>,
}

impl SttResult {
    /// The sentinel the router falls back to when its breaker refuses a
    /// request (spec §4.4).
    pub fn unavailable_sentinel() -> Self {
        Self {
            text: "[STT unavailable — local provider offline]".to_string(),
            confidence: 0.0,
            segments: Vec::new(),
        }
    }
}

/// An STT backend reachable over HTTP (spec §4.3, §6).
#[async_trait]
pub trait SttAdapter: Send + Sync {
    /// A short identifier used in logs and `provider_switched` events.
    fn name(&self) -> &str;

    /// `transcribe(audio_bytes, mime_type)` with a 5 s wall-clock timeout,
    /// applied by this trait's default `call_with_timeout` helper in
    /// implementors. Fails with [`GatewayError::Stt`] on non-2xx or timeout.
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<SttResult>;

    /// `healthCheck()` with a 3 s timeout.
    async fn health_check(&self) -> bool;
}

/// HTTP adapter for a Parakeet-compatible STT endpoint (spec §6
/// `POST /transcribe`, `multipart/form-data; name="audio"`).
pub struct HttpSttAdapter {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpSttAdapter {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SttAdapter for HttpSttAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<SttResult> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("audio.wav")
            .mime_str(mime_type)
            .map_err(|e| GatewayError::Stt(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("audio", part);

        let url = format!("{}/transcribe", self.base_url);
        let send = self.client.post(&url).multipart(form).send();

        let resp = tokio::time::timeout(TRANSCRIBE_TIMEOUT, send)
            .await
            .map_err(|_| GatewayError::Stt(format!("{} timed out", self.name)))?
            .map_err(|e| GatewayError::Stt(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Stt(format!(
                "{} returned {}",
                self.name,
                resp.status()
            )));
        }

        resp.json::<SttResult>()
            .await
            .map_err(|e| GatewayError::Stt(e.to_string()))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        let send = self.client.get(&url).send();
        match tokio::time::timeout(HEALTH_TIMEOUT, send).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            Ok(Err(e)) => {
                warn!(provider = self.name.as_str(), error = %e, "STT health check failed");
                false
            }
            Err(_) => {
                warn!(provider = self.name.as_str(), "STT health check timed out");
                false
            }
        }
    }
}
