//! Resilient STT router: wraps a primary adapter with a circuit breaker and
//! falls back to a sentinel result under sustained failure (spec §4.4).

use std::sync::Arc;
use tracing::{info, warn};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::error::Result;
use crate::stt::{SttAdapter, SttResult};

/// A provider-health transition the connection handler should forward to
/// the client (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Switched { from: String, to: String },
    Recovered { provider: String },
}

pub struct SttRouter {
    primary: Arc<dyn SttAdapter>,
    breaker: Arc<CircuitBreaker>,
    /// Name reported as the fallback target in `provider_switched` (spec
    /// §8 scenario 5 names it `cloud_stub`).
    fallback_name: String,
}

impl SttRouter {
    pub fn new(primary: Arc<dyn SttAdapter>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            primary,
            breaker,
            fallback_name: "cloud_stub".to_string(),
        }
    }

    pub fn with_fallback_name(mut self, name: impl Into<String>) -> Self {
        self.fallback_name = name.into();
        self
    }

    /// `transcribe(audio)` from spec §4.4.
    pub async fn transcribe(
        &self,
        audio: &[u8],
        mime_type: &str,
    ) -> (Result<SttResult>, Option<ProviderEvent>) {
        if !self.breaker.can_request().await {
            return (Ok(SttResult::unavailable_sentinel()), None);
        }

        let before = self.breaker.state().await;
        match self.primary.transcribe(audio, mime_type).await {
            Ok(result) => {
                self.breaker.record_success().await;
                let after = self.breaker.state().await;
                let event = if before != CircuitState::Closed && after == CircuitState::Closed {
                    info!(provider = self.primary.name(), "STT provider recovered");
                    Some(ProviderEvent::Recovered {
                        provider: self.primary.name().to_string(),
                    })
                } else {
                    None
                };
                (Ok(result), event)
            }
            Err(err) => {
                let tripped = self.breaker.record_failure().await;
                if tripped {
                    warn!(
                        from = self.primary.name(),
                        to = self.fallback_name.as_str(),
                        "STT breaker tripped, switching provider"
                    );
                    (
                        Ok(SttResult::unavailable_sentinel()),
                        Some(ProviderEvent::Switched {
                            from: self.primary.name().to_string(),
                            to: self.fallback_name.clone(),
                        }),
                    )
                } else {
                    (Err(err), None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerDefaults;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyAdapter {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SttAdapter for FlakyAdapter {
        fn name(&self) -> &str {
            "parakeet"
        }

        async fn transcribe(&self, _audio: &[u8], _mime_type: &str) -> Result<SttResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(crate::error::GatewayError::Stt("boom".into()))
            } else {
                Ok(SttResult {
                    text: "hello".into(),
                    confidence: 0.9,
                    segments: vec![],
                })
            }
        }

        async fn health_check(&self) -> bool {
            !self.fail
        }
    }

    fn fast_cfg() -> BreakerDefaults {
        BreakerDefaults {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_millis(50),
            max_cooldown: Duration::from_millis(400),
            backoff_multiplier: 2,
        }
    }

    #[tokio::test]
    async fn success_passes_through_result() {
        let adapter = Arc::new(FlakyAdapter {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let breaker = Arc::new(CircuitBreaker::new("stt:parakeet", fast_cfg()));
        let router = SttRouter::new(adapter, breaker);
        let (result, event) = router.transcribe(b"pcm", "audio/wav").await;
        assert_eq!(result.unwrap().text, "hello");
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn third_failure_trips_and_returns_sentinel_with_switched_event() {
        let adapter = Arc::new(FlakyAdapter {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let breaker = Arc::new(CircuitBreaker::new("stt:parakeet", fast_cfg()));
        let router = SttRouter::new(adapter, breaker).with_fallback_name("cloud_stub");

        for _ in 0..2 {
            let (result, event) = router.transcribe(b"pcm", "audio/wav").await;
            assert!(result.is_err());
            assert!(event.is_none());
        }
        let (result, event) = router.transcribe(b"pcm", "audio/wav").await;
        assert_eq!(result.unwrap().text, SttResult::unavailable_sentinel().text);
        assert_eq!(
            event,
            Some(ProviderEvent::Switched {
                from: "parakeet".into(),
                to: "cloud_stub".into(),
            })
        );
    }

    #[tokio::test]
    async fn once_tripped_subsequent_calls_never_hit_adapter() {
        let adapter = Arc::new(FlakyAdapter {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let breaker = Arc::new(CircuitBreaker::new("stt:parakeet", fast_cfg()));
        let router = SttRouter::new(adapter.clone(), breaker);

        for _ in 0..3 {
            router.transcribe(b"pcm", "audio/wav").await;
        }
        let calls_after_trip = adapter.calls.load(Ordering::SeqCst);
        router.transcribe(b"pcm", "audio/wav").await;
        assert_eq!(adapter.calls.load(Ordering::SeqCst), calls_after_trip);
    }
}
