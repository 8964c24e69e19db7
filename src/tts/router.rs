//! TTS router: owns two independent provider breakers and a preferred
//! provider pointer, failing over on refusal or error (spec §4.5).

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::breaker::CircuitBreaker;
use crate::config::TtsProvider;
use crate::error::{GatewayError, Result};
use crate::tts::TtsAdapter;

pub struct TtsRouter {
    kokoro: Arc<dyn TtsAdapter>,
    kokoro_breaker: Arc<CircuitBreaker>,
    openai: Arc<dyn TtsAdapter>,
    openai_breaker: Arc<CircuitBreaker>,
    preferred: Mutex<TtsProvider>,
}

impl TtsRouter {
    pub fn new(
        kokoro: Arc<dyn TtsAdapter>,
        kokoro_breaker: Arc<CircuitBreaker>,
        openai: Arc<dyn TtsAdapter>,
        openai_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            kokoro,
            kokoro_breaker,
            openai,
            openai_breaker,
            preferred: Mutex::new(TtsProvider::Kokoro),
        }
    }

    /// Changed only by an explicit `/tts` command; never mutates breaker
    /// state (spec §4.5).
    pub async fn set_preferred(&self, provider: TtsProvider) {
        *self.preferred.lock().await = provider;
    }

    pub async fn preferred(&self) -> TtsProvider {
        *self.preferred.lock().await
    }

    fn provider(&self, which: TtsProvider) -> (&Arc<dyn TtsAdapter>, &Arc<CircuitBreaker>) {
        match which {
            TtsProvider::Kokoro => (&self.kokoro, &self.kokoro_breaker),
            TtsProvider::Openai => (&self.openai, &self.openai_breaker),
        }
    }

    fn other(which: TtsProvider) -> TtsProvider {
        match which {
            TtsProvider::Kokoro => TtsProvider::Openai,
            TtsProvider::Openai => TtsProvider::Kokoro,
        }
    }

    /// `synthesize(text, voice?)` from spec §4.5.
    pub async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>> {
        let preferred = self.preferred().await;
        if let Some(audio) = self.try_provider(preferred, text, voice).await {
            return Ok(audio);
        }
        let fallback = Self::other(preferred);
        if let Some(audio) = self.try_provider(fallback, text, voice).await {
            return Ok(audio);
        }
        Err(GatewayError::TtsAllProvidersUnavailable)
    }

    /// Returns `Some(audio)` on success, `None` on refusal or failure
    /// (after recording the outcome on that provider's breaker).
    async fn try_provider(
        &self,
        which: TtsProvider,
        text: &str,
        voice: Option<&str>,
    ) -> Option<Vec<u8>> {
        let (adapter, breaker) = self.provider(which);
        if !breaker.can_request().await {
            return None;
        }
        match adapter.synthesize(text, voice).await {
            Ok(audio) => {
                breaker.record_success().await;
                Some(audio)
            }
            Err(err) => {
                warn!(provider = adapter.name(), error = %err, "TTS synthesis failed");
                breaker.record_failure().await;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerDefaults;
    use async_trait::async_trait;
    use std::time::Duration;

    struct StubAdapter {
        name: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl TtsAdapter for StubAdapter {
        fn name(&self) -> &str {
            self.name
        }

        async fn synthesize(&self, _text: &str, _voice: Option<&str>) -> Result<Vec<u8>> {
            if self.fail {
                Err(GatewayError::Tts("boom".into()))
            } else {
                Ok(vec![self.name.len() as u8])
            }
        }
    }

    fn fast_cfg() -> BreakerDefaults {
        BreakerDefaults {
            failure_threshold: 1,
            window: Duration::from_secs(60),
            cooldown: Duration::from_millis(50),
            max_cooldown: Duration::from_millis(400),
            backoff_multiplier: 2,
        }
    }

    fn router(kokoro_fails: bool, openai_fails: bool) -> TtsRouter {
        TtsRouter::new(
            Arc::new(StubAdapter {
                name: "kokoro",
                fail: kokoro_fails,
            }),
            Arc::new(CircuitBreaker::new("tts:kokoro", fast_cfg())),
            Arc::new(StubAdapter {
                name: "openai",
                fail: openai_fails,
            }),
            Arc::new(CircuitBreaker::new("tts:openai", fast_cfg())),
        )
    }

    #[tokio::test]
    async fn preferred_provider_succeeds_directly() {
        let r = router(false, false);
        assert!(r.synthesize("hi", None).await.is_ok());
    }

    #[tokio::test]
    async fn falls_over_to_other_provider_on_failure() {
        let r = router(true, false);
        let audio = r.synthesize("hi", None).await.unwrap();
        assert_eq!(audio, vec!["openai".len() as u8]);
    }

    #[tokio::test]
    async fn both_unavailable_fails() {
        let r = router(true, true);
        let err = r.synthesize("hi", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::TtsAllProvidersUnavailable));
    }

    #[tokio::test]
    async fn preferred_can_be_changed_without_touching_breakers() {
        let r = router(false, false);
        r.set_preferred(TtsProvider::Openai).await;
        assert_eq!(r.preferred().await, TtsProvider::Openai);
        assert_eq!(r.kokoro_breaker.state().await, crate::breaker::CircuitState::Closed);
    }
}
