//! Owns one conversational turn: the FSM, the per-segment STT decode, and
//! orchestration of the LLM and TTS pipelines (spec §4.10).
//!
//! Concurrency follows Design Notes §9: the Turn is a plain struct behind
//! `Arc<Mutex<_>>`; every operation is a free function taking that handle,
//! so a long-running `think()` can be interrupted by a concurrent `cancel()`
//! without holding the lock across the whole call.

pub mod fsm;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::llm::pipeline::{LlmPipeline, LlmPipelineEvent};
use crate::stt::router::{ProviderEvent, SttRouter};
use crate::stt::rolling::RollingWindowStt;
use crate::tts::pipeline::TtsPipeline;
use crate::turn::fsm::{transition, TurnEvent, TurnState};
use crate::wav;

const SILENCE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Rolling-window decode interval from spec §4.6.
const PARTIAL_DECODE_INTERVAL: Duration = Duration::from_millis(500);

const NOISE_WORDS: &[&str] = &["m", "mm", "mmm", "mhm", "hm", "hmm", "hn", "uh", "um", "ah", "oh", "eh", "er"];

/// Typed outbound events a Turn produces (Design Notes §9: "replace
/// untyped event names with a tagged union"). The connection handler maps
/// these onto wire JSON / binary frames.
#[derive(Debug, Clone)]
pub enum TurnMessage {
    TurnState {
        state: TurnState,
        turn_id: Option<String>,
    },
    TranscriptPartial {
        text: String,
        stable: String,
        unstable: String,
    },
    TranscriptFinal {
        text: String,
        turn_id: String,
    },
    LlmToken {
        token: String,
        full_text: String,
    },
    LlmDone {
        full_text: String,
    },
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
    Completed {
        turn_id: String,
    },
    Cancelled {
        turn_id: String,
    },
    ProviderSwitched {
        from: String,
        to: String,
    },
    ProviderRecovered {
        provider: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    Active,
    Completed,
    Cancelled,
}

pub struct Turn {
    id: String,
    state: TurnState,
    phase: TurnPhase,
    rolling: RollingWindowStt,
    pending_transcript: String,
    silence_handle: Option<tokio::task::AbortHandle>,
    partial_ticker_handle: Option<tokio::task::AbortHandle>,
    tx: mpsc::UnboundedSender<TurnMessage>,
}

impl Turn {
    pub fn new(id: impl Into<String>, stt_router: Arc<SttRouter>, tx: mpsc::UnboundedSender<TurnMessage>) -> Self {
        Self {
            id: id.into(),
            state: TurnState::Idle,
            phase: TurnPhase::Active,
            rolling: RollingWindowStt::new(stt_router),
            pending_transcript: String::new(),
            silence_handle: None,
            partial_ticker_handle: None,
            tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.phase == TurnPhase::Active
    }

    pub fn audio_bytes(&self) -> usize {
        self.rolling.audio_bytes()
    }

    fn emit(&self, msg: TurnMessage) {
        let _ = self.tx.send(msg);
    }

    /// `transition(event)` from spec §4.10.
    fn apply_transition(&mut self, event: TurnEvent) -> bool {
        let Some(next) = transition(self.state, event) else {
            tracing::debug!(turn_id = %self.id, state = ?self.state, event = ?event, "FSM event ignored");
            return false;
        };
        self.state = next;
        self.emit(TurnMessage::TurnState {
            state: next,
            turn_id: Some(self.id.clone()),
        });
        if next == TurnState::Idle {
            self.phase = TurnPhase::Completed;
            self.emit(TurnMessage::Completed {
                turn_id: self.id.clone(),
            });
        }
        true
    }
}

fn clean_text(raw: &str) -> String {
    raw.replace("<unk>", " ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_noise(text: &str) -> bool {
    if text.is_empty() {
        return true;
    }
    let words: Vec<String> = text.split_whitespace().map(|w| w.to_lowercase()).collect();
    if words.iter().all(|w| NOISE_WORDS.contains(&w.as_str())) {
        return true;
    }
    let mut seen_short: HashMap<String, u32> = HashMap::new();
    for w in &words {
        if w.chars().count() <= 3 {
            let count = seen_short.entry(w.clone()).or_insert(0);
            *count += 1;
            if *count >= 2 {
                return true;
            }
        }
    }
    false
}

fn combine(pending: &str, new_segment: &str) -> String {
    if pending.is_empty() {
        new_segment.to_string()
    } else if new_segment.is_empty() {
        pending.to_string()
    } else {
        format!("{pending} {new_segment}")
    }
}

fn provider_event_to_message(event: ProviderEvent) -> TurnMessage {
    match event {
        ProviderEvent::Switched { from, to } => TurnMessage::ProviderSwitched { from, to },
        ProviderEvent::Recovered { provider } => TurnMessage::ProviderRecovered { provider },
    }
}

/// Fires an FSM event directly. Used by the connection handler for the
/// events that originate outside Turn's own control flow (`AUDIO_START`,
/// `AUDIO_RESUME` on frame resumption, `TEXT_SEND`, `SEND`). Returns the
/// resulting state, whether or not the transition was actually listed.
pub async fn fire(turn: &Arc<Mutex<Turn>>, event: TurnEvent) -> TurnState {
    let mut t = turn.lock().await;
    t.apply_transition(event);
    t.state
}

/// `appendAudio(bytes)` from spec §4.10. No-op if the turn isn't active;
/// otherwise appends and (re)schedules the 1500ms silence timer, and makes
/// sure the 500ms partial-decode ticker (spec §4.6) is running alongside it.
pub async fn append_audio(turn: &Arc<Mutex<Turn>>, bytes: &[u8]) {
    {
        let mut t = turn.lock().await;
        if !t.is_active() {
            return;
        }
        t.rolling.append_audio(bytes);
    }
    schedule_silence_timer(turn).await;
    ensure_partial_ticker(turn).await;
}

/// Spawns the periodic rolling-window decode cycle once per turn if it
/// isn't already running. Idempotent: later `append_audio` calls on the
/// same turn find `partial_ticker_handle` already set and do nothing.
async fn ensure_partial_ticker(turn: &Arc<Mutex<Turn>>) {
    let mut t = turn.lock().await;
    if t.partial_ticker_handle.is_some() {
        return;
    }
    let handle = spawn_partial_decode_ticker(turn.clone());
    t.partial_ticker_handle = Some(handle);
}

/// Runs for the lifetime of a turn's `Listening` phase(s), decoding the
/// rolling window every `PARTIAL_DECODE_INTERVAL` and emitting
/// `TranscriptPartial` messages (spec §4.6). Mirrors `transcribe`'s own
/// lock discipline: the STT call itself runs with the turn lock released,
/// so a concurrent `cancel()`/`barge_in` is never blocked behind it.
fn spawn_partial_decode_ticker(turn: Arc<Mutex<Turn>>) -> tokio::task::AbortHandle {
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PARTIAL_DECODE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;

            let decode = {
                let mut t = turn.lock().await;
                if !t.is_active() {
                    break;
                }
                if t.state != TurnState::Listening {
                    None
                } else {
                    t.rolling.begin_decode()
                }
            };
            let Some((wav_bytes, router)) = decode else {
                continue;
            };

            let (result, event) = router.transcribe(&wav_bytes, "audio/wav").await;

            let mut t = turn.lock().await;
            if !t.is_active() {
                break;
            }
            let partial = t.rolling.finish_decode(result);
            if let Some(event) = event {
                t.emit(provider_event_to_message(event));
            }
            if let Ok(partial) = partial {
                t.emit(TurnMessage::TranscriptPartial {
                    text: partial.text,
                    stable: partial.stable,
                    unstable: partial.unstable,
                });
            }
        }
    });
    handle.abort_handle()
}

fn schedule_silence_timer<'a>(turn: &'a Arc<Mutex<Turn>>) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(schedule_silence_timer_inner(turn))
}

async fn schedule_silence_timer_inner(turn: &Arc<Mutex<Turn>>) {
    let watched = turn.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(SILENCE_TIMEOUT).await;
        let should_fire = {
            let t = watched.lock().await;
            t.is_active() && t.state == TurnState::Listening && t.rolling.audio_bytes() > 0
        };
        if should_fire {
            transcribe(&watched).await;
        }
    });

    let mut t = turn.lock().await;
    if let Some(old) = t.silence_handle.take() {
        old.abort();
    }
    t.silence_handle = Some(handle.abort_handle());
}

/// `transcribe()` from spec §4.10: the decision tree after silence fires
/// or after an explicit final decode is requested.
pub async fn transcribe(turn: &Arc<Mutex<Turn>>) {
    let has_audio = {
        let t = turn.lock().await;
        t.rolling.audio_bytes() > 0
    };

    if !has_audio {
        let mut t = turn.lock().await;
        t.apply_transition(TurnEvent::SilenceDetected);
        t.pending_transcript.clear();
        t.apply_transition(TurnEvent::SttEmpty);
        return;
    }

    let (raw, router) = {
        let mut t = turn.lock().await;
        t.apply_transition(TurnEvent::SilenceDetected);
        (t.rolling.take_and_clear(), t.rolling.router())
    };

    let wav_bytes = wav::wrap_pcm16_mono(&raw, 16_000);
    let (result, provider_event) = router.transcribe(&wav_bytes, "audio/wav").await;

    let mut t = turn.lock().await;
    if !t.is_active() {
        return;
    }

    if let Some(event) = provider_event {
        t.emit(provider_event_to_message(event));
    }

    match result {
        Ok(stt_result) => {
            let cleaned = clean_text(&stt_result.text);
            let noisy = is_noise(&cleaned);
            let new_segment = if noisy { String::new() } else { cleaned };
            let combined = combine(&t.pending_transcript, &new_segment);
            let more_audio_arrived = t.rolling.audio_bytes() > 0;

            if combined.is_empty() {
                t.pending_transcript.clear();
                t.apply_transition(TurnEvent::SttEmpty);
            } else if noisy && !t.pending_transcript.is_empty() {
                let text = t.pending_transcript.clone();
                let turn_id = t.id.clone();
                t.emit(TurnMessage::TranscriptFinal { text, turn_id });
                t.apply_transition(TurnEvent::SttDone);
            } else if more_audio_arrived {
                t.pending_transcript = combined;
                t.apply_transition(TurnEvent::AudioResume);
                drop(t);
                schedule_silence_timer(turn).await;
            } else {
                t.pending_transcript = combined.clone();
                let turn_id = t.id.clone();
                t.emit(TurnMessage::TranscriptFinal { text: combined, turn_id });
                t.apply_transition(TurnEvent::SttDone);
            }
        }
        Err(err) => {
            t.emit(TurnMessage::Error {
                code: err.code().to_string(),
                message: err.to_string(),
                recoverable: true,
            });
            t.apply_transition(TurnEvent::Error);
        }
    }
}

/// `think(text, sessionKey)` from spec §4.10. Drives the LLM pipeline to
/// completion, forwarding deltas and submitting phrases to the TTS
/// pipeline, and fires the matching FSM events along the way.
pub async fn think(
    turn: &Arc<Mutex<Turn>>,
    text: String,
    llm_pipeline: Arc<LlmPipeline>,
    llm_rx: &mut mpsc::UnboundedReceiver<LlmPipelineEvent>,
    tts_pipeline: Arc<TtsPipeline>,
) {
    let id = { turn.lock().await.id.clone() };

    tts_pipeline.reset().await;

    let send_task = {
        let llm_pipeline = llm_pipeline.clone();
        let id = id.clone();
        tokio::spawn(async move {
            llm_pipeline.send_transcript(&text, id).await;
        })
    };

    let mut first_chunk_fired = false;
    loop {
        match llm_rx.recv().await {
            Some(LlmPipelineEvent::Token { token, full_text }) => {
                let t = turn.lock().await;
                if t.is_active() {
                    t.emit(TurnMessage::LlmToken { token, full_text });
                }
            }
            Some(LlmPipelineEvent::PhraseReady { text, index, turn_id }) => {
                if turn_id != id {
                    continue;
                }
                tts_pipeline.process_chunk(text, index, turn_id).await;
                if !first_chunk_fired {
                    first_chunk_fired = true;
                    let mut t = turn.lock().await;
                    t.apply_transition(TurnEvent::LlmFirstChunk);
                }
            }
            Some(LlmPipelineEvent::Done { full_text, cancelled }) => {
                if cancelled {
                    break;
                }
                {
                    let t = turn.lock().await;
                    t.emit(TurnMessage::LlmDone { full_text });
                }
                tts_pipeline.finish().await;
                let mut t = turn.lock().await;
                t.apply_transition(TurnEvent::LlmDone);
                break;
            }
            Some(LlmPipelineEvent::Error { error, turn_id }) => {
                if turn_id != id {
                    continue;
                }
                let mut t = turn.lock().await;
                t.emit(TurnMessage::Error {
                    code: "llm_error".to_string(),
                    message: error,
                    recoverable: true,
                });
                t.apply_transition(TurnEvent::Error);
                break;
            }
            None => break,
        }
    }

    let _ = send_task.await;
}

/// `cancel()` from spec §4.10. Idempotent; bypasses the FSM table
/// entirely (phase becomes `Cancelled`, not `Completed`) and emits its own
/// terminal signal. Unlike the upstream source, the emitted `turn_state`
/// carries the cancelled turn's id, so the client can reconcile which turn
/// was abandoned (Open Question a).
pub async fn cancel(turn: &Arc<Mutex<Turn>>, llm_pipeline: &Arc<LlmPipeline>, tts_pipeline: &Arc<TtsPipeline>) {
    let (already_done, id) = {
        let mut t = turn.lock().await;
        if !t.is_active() {
            (true, t.id.clone())
        } else {
            t.phase = TurnPhase::Cancelled;
            if let Some(h) = t.silence_handle.take() {
                h.abort();
            }
            if let Some(h) = t.partial_ticker_handle.take() {
                h.abort();
            }
            (false, t.id.clone())
        }
    };
    if already_done {
        return;
    }

    llm_pipeline.cancel().await;
    tts_pipeline.cancel().await;

    let t = turn.lock().await;
    t.emit(TurnMessage::TurnState {
        state: TurnState::Idle,
        turn_id: Some(id.clone()),
    });
    t.emit(TurnMessage::Cancelled { turn_id: id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::config::BreakerDefaults;
    use crate::error::Result;
    use crate::llm::UpstreamLlmClient;
    use crate::stt::{SttAdapter, SttResult};
    use crate::tts::router::TtsRouter;
    use crate::tts::TtsAdapter;
    use async_trait::async_trait;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct ScriptedStt {
        text: String,
    }

    #[async_trait]
    impl SttAdapter for ScriptedStt {
        fn name(&self) -> &str {
            "parakeet"
        }

        async fn transcribe(&self, _audio: &[u8], _mime_type: &str) -> Result<SttResult> {
            Ok(SttResult {
                text: self.text.clone(),
                confidence: 0.9,
                segments: vec![],
            })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    struct StubTts;

    #[async_trait]
    impl TtsAdapter for StubTts {
        fn name(&self) -> &str {
            "kokoro"
        }

        async fn synthesize(&self, text: &str, _voice: Option<&str>) -> Result<Vec<u8>> {
            Ok(crate::wav::wrap_pcm16_mono(text.as_bytes(), 16_000))
        }
    }

    fn fast_breaker_cfg() -> BreakerDefaults {
        BreakerDefaults {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(120),
            backoff_multiplier: 2,
        }
    }

    fn stt_router(text: &str) -> Arc<SttRouter> {
        Arc::new(SttRouter::new(
            Arc::new(ScriptedStt { text: text.to_string() }),
            Arc::new(CircuitBreaker::new("stt:parakeet", fast_breaker_cfg())),
        ))
    }

    fn tts_pipeline() -> (Arc<TtsPipeline>, mpsc::UnboundedReceiver<crate::tts::pipeline::TtsPipelineEvent>) {
        let router = Arc::new(TtsRouter::new(
            Arc::new(StubTts),
            Arc::new(CircuitBreaker::new("tts:kokoro", fast_breaker_cfg())),
            Arc::new(StubTts),
            Arc::new(CircuitBreaker::new("tts:openai", fast_breaker_cfg())),
        ));
        let (pipeline, rx) = TtsPipeline::new(router);
        (Arc::new(pipeline), rx)
    }

    #[tokio::test]
    async fn transcribe_with_no_audio_emits_stt_empty_and_stays_idle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let turn = Arc::new(Mutex::new(Turn::new("t1", stt_router("unused"), tx)));
        {
            let mut t = turn.lock().await;
            t.apply_transition(TurnEvent::AudioStart);
        }
        transcribe(&turn).await;

        assert_eq!(turn.lock().await.state(), TurnState::Idle);
        let mut saw_idle = false;
        while let Ok(msg) = rx.try_recv() {
            if let TurnMessage::TurnState { state: TurnState::Idle, .. } = msg {
                saw_idle = true;
            }
        }
        assert!(saw_idle);
    }

    #[tokio::test]
    async fn transcribe_with_audio_emits_transcript_final_and_pending_send() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let turn = Arc::new(Mutex::new(Turn::new("t2", stt_router("hello world"), tx)));
        {
            let mut t = turn.lock().await;
            t.apply_transition(TurnEvent::AudioStart);
            t.rolling.append_audio(&[0u8; 256]);
        }
        transcribe(&turn).await;

        assert_eq!(turn.lock().await.state(), TurnState::PendingSend);
        let mut saw_final = false;
        while let Ok(msg) = rx.try_recv() {
            if let TurnMessage::TranscriptFinal { text, .. } = msg {
                assert_eq!(text, "hello world");
                saw_final = true;
            }
        }
        assert!(saw_final);
    }

    #[tokio::test]
    async fn transcribe_classifies_filler_words_as_noise() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let turn = Arc::new(Mutex::new(Turn::new("t3", stt_router("um uh"), tx)));
        {
            let mut t = turn.lock().await;
            t.apply_transition(TurnEvent::AudioStart);
            t.rolling.append_audio(&[0u8; 256]);
        }
        transcribe(&turn).await;
        assert_eq!(turn.lock().await.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn text_turn_runs_to_completion_through_llm_and_tts() {
        let mock_server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello there. \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"All done.\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&mock_server)
            .await;

        let client = Arc::new(UpstreamLlmClient::new(mock_server.uri(), None, "test-model"));
        let (llm_pipeline, mut llm_rx) = LlmPipeline::new(client);
        let llm_pipeline = Arc::new(llm_pipeline);
        let (tts_pipeline, mut tts_rx) = tts_pipeline();

        let (tx, mut turn_rx) = mpsc::unbounded_channel();
        let turn = Arc::new(Mutex::new(Turn::new("t4", stt_router("unused"), tx)));
        {
            let mut t = turn.lock().await;
            t.apply_transition(TurnEvent::TextSend);
        }

        think(&turn, "hi".to_string(), llm_pipeline, &mut llm_rx, tts_pipeline).await;

        assert_eq!(turn.lock().await.state(), TurnState::Idle);
        let mut saw_llm_done = false;
        while let Ok(msg) = turn_rx.try_recv() {
            if matches!(msg, TurnMessage::LlmDone { .. }) {
                saw_llm_done = true;
            }
        }
        assert!(saw_llm_done);

        let mut saw_meta = false;
        while let Ok(event) = tts_rx.try_recv() {
            if matches!(event, crate::tts::pipeline::TtsPipelineEvent::Meta { .. }) {
                saw_meta = true;
            }
        }
        assert!(saw_meta);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_emits_turn_state_with_id() {
        let mock_server = MockServer::start().await;
        let client = Arc::new(UpstreamLlmClient::new(mock_server.uri(), None, "test-model"));
        let (llm_pipeline, _llm_rx) = LlmPipeline::new(client);
        let llm_pipeline = Arc::new(llm_pipeline);
        let (tts_pipeline, _tts_rx) = tts_pipeline();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let turn = Arc::new(Mutex::new(Turn::new("t5", stt_router("unused"), tx)));
        {
            let mut t = turn.lock().await;
            t.apply_transition(TurnEvent::TextSend);
        }

        cancel(&turn, &llm_pipeline, &tts_pipeline).await;
        cancel(&turn, &llm_pipeline, &tts_pipeline).await;

        let mut cancelled_count = 0;
        let mut turn_state_with_id = false;
        while let Ok(msg) = rx.try_recv() {
            match msg {
                TurnMessage::Cancelled { .. } => cancelled_count += 1,
                TurnMessage::TurnState { state: TurnState::Idle, turn_id: Some(_) } => {
                    turn_state_with_id = true;
                }
                _ => {}
            }
        }
        assert_eq!(cancelled_count, 1);
        assert!(turn_state_with_id);
    }

    #[tokio::test]
    async fn append_audio_emits_partial_transcripts_while_listening() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let turn = Arc::new(Mutex::new(Turn::new("t6", stt_router("hello world"), tx)));
        {
            let mut t = turn.lock().await;
            t.apply_transition(TurnEvent::AudioStart);
        }

        append_audio(&turn, &[0u8; 256]).await;
        tokio::time::sleep(PARTIAL_DECODE_INTERVAL + Duration::from_millis(200)).await;

        let mut saw_partial = false;
        while let Ok(msg) = rx.try_recv() {
            if let TurnMessage::TranscriptPartial { text, .. } = msg {
                assert_eq!(text, "hello world");
                saw_partial = true;
            }
        }
        assert!(saw_partial);

        cancel(
            &turn,
            &Arc::new(LlmPipeline::new(Arc::new(UpstreamLlmClient::new("http://127.0.0.1:0", None, "m"))).0),
            &tts_pipeline().0,
        )
        .await;
    }

    #[test]
    fn noise_detection_matches_spec_examples() {
        assert!(is_noise(""));
        assert!(is_noise("um uh"));
        assert!(is_noise("the the"));
        assert!(!is_noise("hello world"));
    }

    #[test]
    fn combine_joins_with_single_space() {
        assert_eq!(combine("", "hello"), "hello");
        assert_eq!(combine("hello", ""), "hello");
        assert_eq!(combine("hello", "world"), "hello world");
    }
}
