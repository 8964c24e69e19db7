//! Text-to-speech provider adapters (spec §6) and the resilient router
//! (spec §4.5). [`pipeline`] builds on the router to deliver audio strictly
//! in order while synthesizing chunks concurrently (spec §4.9).

pub mod pipeline;
pub mod router;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{GatewayError, Result};

const SYNTHESIZE_TIMEOUT: Duration = Duration::from_secs(15);

/// A TTS backend reachable over HTTP.
#[async_trait]
pub trait TtsAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// `synthesize(text, voice?) -> raw audio bytes`, bounded by a
    /// 10-15 s timeout (spec §5 "Suspension points").
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>>;
}

/// Kokoro HTTP adapter (`POST /api/tts`, spec §6).
pub struct KokoroAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl KokoroAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TtsAdapter for KokoroAdapter {
    fn name(&self) -> &str {
        "kokoro"
    }

    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>> {
        let url = format!("{}/api/tts", self.base_url);
        let body = serde_json::json!({ "text": text, "voice": voice.unwrap_or("default") });
        let send = self.client.post(&url).json(&body).send();

        let resp = tokio::time::timeout(SYNTHESIZE_TIMEOUT, send)
            .await
            .map_err(|_| GatewayError::Tts("kokoro timed out".to_string()))?
            .map_err(|e| GatewayError::Tts(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Tts(format!("kokoro returned {}", resp.status())));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| GatewayError::Tts(e.to_string()))
    }
}

/// OpenAI-compatible HTTP adapter (`POST /v1/audio/speech`, bearer token,
/// spec §6).
pub struct OpenAiTtsAdapter {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiTtsAdapter {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: "tts-1".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl TtsAdapter for OpenAiTtsAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>> {
        let url = format!("{}/v1/audio/speech", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "voice": voice.unwrap_or("alloy"),
            "input": text,
            "response_format": "wav",
        });
        let send = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let resp = tokio::time::timeout(SYNTHESIZE_TIMEOUT, send)
            .await
            .map_err(|_| GatewayError::Tts("openai timed out".to_string()))?
            .map_err(|e| GatewayError::Tts(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Tts(format!("openai returned {}", resp.status())));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| GatewayError::Tts(e.to_string()))
    }
}
