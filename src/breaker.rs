//! Generic three-state circuit breaker with a sliding failure window and
//! jittered exponential backoff (spec §4.1).
//!
//! Grounded on the retry/backoff shape of the teacher's
//! `LocalProbeService::probe_with_retry` (bounded exponential delay capped
//! at a maximum), generalized here into a stateful object with an explicit
//! half-open probe gate instead of a bounded retry loop.

use rand::Rng;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};

use crate::config::BreakerDefaults;

/// The three states a breaker can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct Inner {
    state: CircuitState,
    failures: Vec<Instant>,
    cooldown: Duration,
    /// Set while a half-open probe is outstanding; cleared when it resolves.
    probe_in_flight: bool,
    /// Monotone counter bumped on every state change, so a cooldown timer
    /// scheduled for a stale `open` episode can tell it has been superseded.
    epoch: u64,
}

/// A single breaker, identified by `name` for logging (spec §4.4/§4.5 name
/// each instance `stt:parakeet`, `tts:kokoro`, `tts:openai`).
pub struct CircuitBreaker {
    name: String,
    cfg: BreakerDefaults,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerDefaults) -> Self {
        let (state_tx, _rx) = watch::channel(CircuitState::Closed);
        Self {
            name: name.into(),
            cfg,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: Vec::new(),
                cooldown: cfg.cooldown,
                probe_in_flight: false,
                epoch: 0,
            }),
            state_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Observe state transitions (`state_change` events in spec §4.1).
    pub fn subscribe(&self) -> watch::Receiver<CircuitState> {
        self.state_tx.subscribe()
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// `canRequest()` from spec §4.1.
    pub async fn can_request(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// `recordSuccess()` from spec §4.1.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.failures.clear();
            }
            CircuitState::HalfOpen => {
                inner.cooldown = self.cfg.cooldown;
                inner.failures.clear();
                inner.probe_in_flight = false;
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    /// `recordFailure()` from spec §4.1. Returns `true` if this call just
    /// tripped the breaker from `closed` to `open` (used by the STT/TTS
    /// routers to decide whether to fall back immediately).
    ///
    /// Takes `Arc<Self>` because a trip schedules a cooldown timer on a
    /// detached task (spec §4.1 "Cooldown scheduler").
    pub async fn record_failure(self: &std::sync::Arc<Self>) -> bool {
        let tripped = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CircuitState::Closed => {
                    let now = Instant::now();
                    inner.failures.push(now);
                    let window = self.cfg.window;
                    inner.failures.retain(|t| now.duration_since(*t) <= window);
                    if inner.failures.len() as u32 >= self.cfg.failure_threshold {
                        inner.failures.clear();
                        inner.cooldown = self.cfg.cooldown;
                        self.transition(&mut inner, CircuitState::Open);
                        true
                    } else {
                        false
                    }
                }
                CircuitState::HalfOpen => {
                    inner.probe_in_flight = false;
                    let doubled = inner.cooldown.saturating_mul(self.cfg.backoff_multiplier);
                    inner.cooldown = doubled.min(self.cfg.max_cooldown);
                    self.transition(&mut inner, CircuitState::Open);
                    true
                }
                CircuitState::Open => false,
            }
        };
        if tripped {
            self.spawn_cooldown();
        }
        tripped
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        inner.state = to;
        inner.epoch = inner.epoch.wrapping_add(1);
        let _ = self.state_tx.send(to);
    }

    /// Arc-based cooldown scheduler; fires after `cooldown * (1 +/- 0.15)`
    /// jitter and flips `open -> half_open` if nothing has superseded this
    /// episode (spec §4.1 "Cooldown scheduler").
    pub fn spawn_cooldown(self: &std::sync::Arc<Self>) {
        let breaker = self.clone();
        tokio::spawn(async move {
            let (delay, epoch_at_schedule) = {
                let inner = breaker.inner.lock().await;
                if inner.state != CircuitState::Open {
                    return;
                }
                let jitter = rand::thread_rng().gen_range(-0.15..=0.15);
                (inner.cooldown.mul_f64(1.0 + jitter), inner.epoch)
            };
            tokio::time::sleep(delay).await;
            let mut inner = breaker.inner.lock().await;
            if inner.state == CircuitState::Open && inner.epoch == epoch_at_schedule {
                breaker.transition(&mut inner, CircuitState::HalfOpen);
            }
        });
    }
}
