//! Configuration types for the gateway.
//!
//! [`GatewayConfig`] is process-wide and loaded once at startup from the
//! environment variables in spec §6. [`SessionConfig`] is the smaller,
//! per-connection negotiable subset (spec §3) seeded from the gateway
//! defaults and mutated by `config` wire messages.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Process-wide settings, loaded once from the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP port for the `/ws` listener (`PORT`, default 8788).
    pub port: u16,
    /// WebSocket path (fixed at `/ws` per spec §6).
    pub ws_path: &'static str,
    /// Maximum inbound frame payload in bytes (5 MB per spec §6).
    pub max_frame_bytes: usize,
    /// Hard cap on accumulated audio bytes per turn (10 MB per spec §4.11).
    pub max_audio_bytes_per_turn: usize,
    /// Base URL of the local STT provider (`PARAKEET_URL`).
    pub parakeet_url: String,
    /// Base URL of the local TTS provider (`KOKORO_URL`).
    pub kokoro_url: String,
    /// Bearer token for the OpenAI-compatible TTS endpoint.
    pub openai_api_key: Option<String>,
    /// Base URL for the OpenAI-compatible TTS endpoint (`OPENAI_BASE_URL`).
    pub openai_base_url: String,
    /// Base URL of the upstream LLM transport (`LLM_GATEWAY_URL`).
    pub llm_gateway_url: String,
    /// Bearer token for the upstream LLM transport (`LLM_GATEWAY_API_KEY`).
    pub llm_gateway_api_key: Option<String>,
    /// Default chat-completions model (`LLM_GATEWAY_MODEL`).
    pub llm_gateway_model: String,
    /// `tracing_subscriber::EnvFilter` directive (`LOG_LEVEL`).
    pub log_level: String,
    breaker: BreakerDefaults,
    rate_limits: RateLimitDefaults,
}

/// Circuit breaker tuning constants (spec §4.1).
#[derive(Debug, Clone, Copy)]
pub struct BreakerDefaults {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    pub backoff_multiplier: u32,
}

impl Default for BreakerDefaults {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(120),
            backoff_multiplier: 2,
        }
    }
}

/// Sliding-window rate limiter tuning (spec §4.2).
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDefaults {
    pub message_max: u32,
    pub message_window: Duration,
    pub llm_max: u32,
    pub llm_window: Duration,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self {
            message_max: 100,
            message_window: Duration::from_secs(1),
            llm_max: 30,
            llm_window: Duration::from_secs(60),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8788,
            ws_path: "/ws",
            max_frame_bytes: 5 * 1024 * 1024,
            max_audio_bytes_per_turn: 10 * 1024 * 1024,
            parakeet_url: "http://localhost:8000".to_string(),
            kokoro_url: "http://localhost:8880".to_string(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com".to_string(),
            llm_gateway_url: "http://localhost:8790".to_string(),
            llm_gateway_api_key: None,
            llm_gateway_model: "default".to_string(),
            log_level: "info".to_string(),
            breaker: BreakerDefaults::default(),
            rate_limits: RateLimitDefaults::default(),
        }
    }
}

impl GatewayConfig {
    /// Build configuration from the environment variables in spec §6,
    /// falling back to [`Default`] values for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(port) = std::env::var("PORT")
            && let Ok(parsed) = port.parse()
        {
            cfg.port = parsed;
        }
        if let Ok(url) = std::env::var("PARAKEET_URL") {
            cfg.parakeet_url = url;
        }
        if let Ok(url) = std::env::var("KOKORO_URL") {
            cfg.kokoro_url = url;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            cfg.openai_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            cfg.openai_base_url = url;
        }
        if let Ok(url) = std::env::var("LLM_GATEWAY_URL") {
            cfg.llm_gateway_url = url;
        }
        if let Ok(key) = std::env::var("LLM_GATEWAY_API_KEY") {
            cfg.llm_gateway_api_key = Some(key);
        }
        if let Ok(model) = std::env::var("LLM_GATEWAY_MODEL") {
            cfg.llm_gateway_model = model;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            cfg.log_level = level;
        }
        cfg
    }

    pub fn breaker(&self) -> BreakerDefaults {
        self.breaker
    }

    pub fn rate_limits(&self) -> RateLimitDefaults {
        self.rate_limits
    }

    /// Seed a [`SessionConfig`] with this gateway's defaults.
    pub fn default_session(&self) -> SessionConfig {
        SessionConfig::default()
    }
}

/// Preferred TTS backend (spec §3 `ttsProvider`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    Kokoro,
    Openai,
}

/// Preferred STT backend (spec §3 `sttProvider`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    Parakeet,
    Cloud,
}

/// Per-connection negotiable options (spec §3 `SessionConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay in ms before an unedited pending transcript auto-sends (0 = instant).
    pub auto_send_delay_ms: u64,
    pub tts_provider: TtsProvider,
    pub tts_voice: Option<String>,
    pub stt_provider: SttProvider,
    /// 0.0–1.0, forwarded to the client's VAD; the gateway does not interpret it.
    pub vad_sensitivity: f32,
    pub llm_model: String,
    pub agent_id: String,
    /// Routing key for upstream LLM history persistence.
    pub session_key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_send_delay_ms: 0,
            tts_provider: TtsProvider::Kokoro,
            tts_voice: None,
            stt_provider: SttProvider::Parakeet,
            vad_sensitivity: 0.5,
            llm_model: "default".to_string(),
            agent_id: "default".to_string(),
            session_key: "main".to_string(),
        }
    }
}

/// A partial update to [`SessionConfig`], as received in a `config` wire
/// message. `merge` only overwrites fields that are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfigPatch {
    pub auto_send_delay_ms: Option<u64>,
    pub tts_provider: Option<TtsProvider>,
    pub tts_voice: Option<String>,
    pub stt_provider: Option<SttProvider>,
    pub vad_sensitivity: Option<f32>,
    pub llm_model: Option<String>,
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
}

impl SessionConfig {
    /// Merge a patch in place. Returns `true` if `session_key` changed, so
    /// the caller knows to re-hydrate chat history (spec §4.11).
    pub fn apply_patch(&mut self, patch: SessionConfigPatch) -> bool {
        let mut session_key_changed = false;
        if let Some(v) = patch.auto_send_delay_ms {
            self.auto_send_delay_ms = v;
        }
        if let Some(v) = patch.tts_provider {
            self.tts_provider = v;
        }
        if let Some(v) = patch.tts_voice {
            self.tts_voice = Some(v);
        }
        if let Some(v) = patch.stt_provider {
            self.stt_provider = v;
        }
        if let Some(v) = patch.vad_sensitivity {
            self.vad_sensitivity = v;
        }
        if let Some(v) = patch.llm_model {
            self.llm_model = v;
        }
        if let Some(v) = patch.agent_id {
            self.agent_id = v;
        }
        if let Some(v) = patch.session_key
            && v != self.session_key
        {
            self.session_key = v;
            session_key_changed = true;
        }
        session_key_changed
    }
}
