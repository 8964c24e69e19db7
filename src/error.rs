//! Error taxonomy for the voice gateway.
//!
//! `code()` renders the stable machine-readable string from spec §7 so the
//! connection handler can forward it verbatim in an `error` wire message.

/// Top-level error type for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed JSON frame from the client.
    #[error("malformed message: {0}")]
    Parse(String),

    /// Unrecognized JSON message `type`.
    #[error("unknown message type: {0}")]
    UnknownMessage(String),

    /// Message-rate limiter denied the frame.
    #[error("rate limited")]
    RateLimited,

    /// LLM-submission rate limiter denied the request.
    #[error("LLM rate limited")]
    LlmRateLimited,

    /// Per-turn audio buffer exceeded the 10 MB cap.
    #[error("audio buffer overflow")]
    AudioBufferOverflow,

    /// STT adapter or router failure.
    #[error("STT error: {0}")]
    Stt(String),

    /// Single TTS chunk synthesis failure.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Every chunk in a turn failed to synthesize.
    #[error("all TTS providers failed for this turn")]
    TtsAllFailed,

    /// Upstream LLM failure.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Upstream LLM request exceeded its deadline.
    #[error("LLM request timed out")]
    LlmTimeout,

    /// Both TTS providers refused or failed a single request.
    #[error("all TTS providers unavailable")]
    TtsAllProvidersUnavailable,

    /// Transport-level I/O failure (connection is about to close).
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP client error reaching a provider.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// I/O error (e.g. WAV framing).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// The stable `code` field from spec §7's error taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "PARSE_ERROR",
            Self::UnknownMessage(_) => "UNKNOWN_MESSAGE",
            Self::RateLimited => "RATE_LIMITED",
            Self::LlmRateLimited => "LLM_RATE_LIMITED",
            Self::AudioBufferOverflow => "AUDIO_BUFFER_OVERFLOW",
            Self::Stt(_) => "stt_error",
            Self::Tts(_) => "tts_error",
            Self::TtsAllFailed => "tts_all_failed",
            Self::Llm(_) => "llm_error",
            Self::LlmTimeout => "llm_timeout",
            Self::TtsAllProvidersUnavailable => "tts_all_providers_unavailable",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Http(_) => "stt_error",
            Self::Io(_) => "stt_error",
        }
    }

    /// Whether the connection stays usable after this error (spec §7
    /// "Propagation policy"). Only transport failures are not recoverable.
    pub fn recoverable(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, GatewayError>;
