//! Rolling-window STT: produces partial transcripts while audio is still
//! arriving, and a final transcript on explicit finalization (spec §4.6).

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::Result;
use crate::stt::router::{ProviderEvent, SttRouter};
use crate::stt::SttResult;
use crate::wav;

const WINDOW_SECONDS: usize = 6;
const SAMPLE_RATE: u32 = 16_000;
const STABILITY_THRESHOLD: usize = 2;

/// `{ stable, unstable, text }` emitted as `transcript_partial` (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptPartial {
    pub text: String,
    pub stable: String,
    pub unstable: String,
}

/// `{ text }` emitted as `transcript_final` on `finalize()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFinal {
    pub text: String,
}

pub struct RollingWindowStt {
    router: Arc<SttRouter>,
    audio: Vec<u8>,
    history: VecDeque<String>,
    stable_prefix: String,
    in_flight: bool,
}

impl RollingWindowStt {
    pub fn new(router: Arc<SttRouter>) -> Self {
        Self {
            router,
            audio: Vec::new(),
            history: VecDeque::new(),
            stable_prefix: String::new(),
            in_flight: false,
        }
    }

    pub fn append_audio(&mut self, bytes: &[u8]) {
        self.audio.extend_from_slice(bytes);
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// One decode cycle, fired every `intervalMs` by the caller's timer.
    /// Skips if already in-flight or no audio is buffered.
    pub async fn tick(&mut self) -> Option<(Result<TranscriptPartial>, Option<ProviderEvent>)> {
        let (wav_bytes, router) = self.begin_decode()?;
        let (result, event) = router.transcribe(&wav_bytes, "audio/wav").await;
        Some((self.finish_decode(result), event))
    }

    /// First half of a decode cycle: checks the in-flight/empty-buffer
    /// guards, marks a decode in flight, and hands back the windowed WAV
    /// bytes plus the router to call. Split from [`Self::tick`] so a caller
    /// holding a lock on the owning `Turn` (e.g. the partial-decode ticker
    /// in `turn::mod`) can release it before awaiting the STT call, the
    /// same way `turn::transcribe` releases its lock before `finalize`.
    pub fn begin_decode(&mut self) -> Option<(Vec<u8>, Arc<SttRouter>)> {
        if self.in_flight || self.audio.is_empty() {
            return None;
        }
        self.in_flight = true;
        let window_bytes = WINDOW_SECONDS * SAMPLE_RATE as usize * 2;
        let start = self.audio.len().saturating_sub(window_bytes);
        let slice = &self.audio[start..];
        let wav_bytes = wav::wrap_pcm16_mono(slice, SAMPLE_RATE);
        Some((wav_bytes, self.router.clone()))
    }

    /// Second half of a decode cycle: clears the in-flight flag and runs
    /// the stable-prefix algorithm over the result of the call started by
    /// [`Self::begin_decode`].
    pub fn finish_decode(&mut self, result: Result<SttResult>) -> Result<TranscriptPartial> {
        self.in_flight = false;
        result.map(|r| {
            let (stable, unstable) = self.update_stable_prefix(&r.text);
            TranscriptPartial {
                text: r.text,
                stable,
                unstable,
            }
        })
    }

    /// Stops the timer (caller-side), does one blocking decode over the
    /// full buffer, and returns the final transcript.
    pub async fn finalize(&mut self) -> Result<TranscriptFinal> {
        let wav_bytes = wav::wrap_pcm16_mono(&self.audio, SAMPLE_RATE);
        let (result, _event) = self.router.transcribe(&wav_bytes, "audio/wav").await;
        result.map(|r| TranscriptFinal { text: r.text })
    }

    pub fn audio_bytes(&self) -> usize {
        self.audio.len()
    }

    pub fn router(&self) -> Arc<SttRouter> {
        self.router.clone()
    }

    /// Takes ownership of the accumulated audio (for a final decode the
    /// caller drives itself) and resets the rolling-window state for the
    /// next segment.
    pub fn take_and_clear(&mut self) -> Vec<u8> {
        self.history.clear();
        self.stable_prefix.clear();
        std::mem::take(&mut self.audio)
    }

    /// The stable-prefix algorithm from spec §4.6.
    fn update_stable_prefix(&mut self, text: &str) -> (String, String) {
        self.history.push_back(text.to_string());
        if self.history.len() < STABILITY_THRESHOLD {
            return (self.stable_prefix.clone(), text.to_string());
        }
        while self.history.len() > STABILITY_THRESHOLD {
            self.history.pop_front();
        }
        let common = char_wise_common_prefix(self.history.iter());
        if let Some(last_space) = common.rfind(' ') {
            if last_space > self.stable_prefix.chars().count() {
                let trimmed: String = common[..last_space].trim_end().to_string();
                self.stable_prefix = trimmed;
            }
        }
        let stable_len = self.stable_prefix.chars().count();
        let unstable: String = text.chars().skip(stable_len).collect();
        (self.stable_prefix.clone(), unstable)
    }
}

/// Character-wise longest common prefix across an arbitrary number of strings.
fn char_wise_common_prefix<'a>(mut strings: impl Iterator<Item = &'a String> + Clone) -> String {
    let first = match strings.next() {
        Some(s) => s,
        None => return String::new(),
    };
    let rest: Vec<&String> = strings.collect();
    let mut out = String::new();
    for (i, ch) in first.chars().enumerate() {
        if rest
            .iter()
            .all(|s| s.chars().nth(i).map(|c| c == ch).unwrap_or(false))
        {
            out.push(ch);
        } else {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::config::BreakerDefaults;
    use crate::stt::{SttAdapter, SttResult};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedAdapter {
        replies: Mutex<VecDeque<String>>,
    }

    #[async_trait]
    impl SttAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            "parakeet"
        }

        async fn transcribe(&self, _audio: &[u8], _mime_type: &str) -> Result<SttResult> {
            let text = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            Ok(SttResult {
                text,
                confidence: 0.9,
                segments: vec![],
            })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn breaker_cfg() -> BreakerDefaults {
        BreakerDefaults {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(120),
            backoff_multiplier: 2,
        }
    }

    #[tokio::test]
    async fn stable_prefix_snaps_to_word_boundary() {
        let adapter = Arc::new(ScriptedAdapter {
            replies: Mutex::new(VecDeque::from([
                "the quick brown fox".to_string(),
                "the quick brown fox jumps".to_string(),
            ])),
        });
        let breaker = Arc::new(CircuitBreaker::new("stt:parakeet", breaker_cfg()));
        let router = Arc::new(SttRouter::new(adapter, breaker));
        let mut rolling = RollingWindowStt::new(router);

        rolling.append_audio(&[0u8; 100]);
        let (first, _) = rolling.tick().await.unwrap();
        let first = first.unwrap();
        assert_eq!(first.stable, "");

        let (second, _) = rolling.tick().await.unwrap();
        let second = second.unwrap();
        assert_eq!(second.stable, "the quick brown");
        assert_eq!(second.unstable, " fox jumps");
    }

    #[tokio::test]
    async fn skips_tick_when_no_audio_buffered() {
        let adapter = Arc::new(ScriptedAdapter {
            replies: Mutex::new(VecDeque::new()),
        });
        let breaker = Arc::new(CircuitBreaker::new("stt:parakeet", breaker_cfg()));
        let router = Arc::new(SttRouter::new(adapter, breaker));
        let mut rolling = RollingWindowStt::new(router);
        assert!(rolling.tick().await.is_none());
    }

    #[tokio::test]
    async fn finalize_decodes_full_buffer() {
        let adapter = Arc::new(ScriptedAdapter {
            replies: Mutex::new(VecDeque::from(["hello world".to_string()])),
        });
        let breaker = Arc::new(CircuitBreaker::new("stt:parakeet", breaker_cfg()));
        let router = Arc::new(SttRouter::new(adapter, breaker));
        let mut rolling = RollingWindowStt::new(router);
        rolling.append_audio(&[0u8; 64]);
        let result = rolling.finalize().await.unwrap();
        assert_eq!(result.text, "hello world");
    }
}
