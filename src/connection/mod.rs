//! Per-connection orchestration (spec §4.11): wires together the STT/TTS
//! routers, the LLM/TTS pipelines, and the `Turn` FSM around one duplex
//! `/ws` socket.

pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::config::{BreakerDefaults, RateLimitDefaults, SessionConfig};
use crate::connection::protocol::{execute_command, ChatHistoryMessage, ClientMessage, ServerMessage};
use crate::error::GatewayError;
use crate::llm::pipeline::LlmPipeline;
use crate::llm::UpstreamLlmClient;
use crate::ratelimit::SlidingWindowRateLimiter;
use crate::stt::router::SttRouter;
use crate::stt::SttAdapter;
use crate::tts::pipeline::{TtsPipeline, TtsPipelineEvent};
use crate::tts::router::TtsRouter;
use crate::tts::TtsAdapter;
use crate::turn::fsm::{TurnEvent, TurnState};
use crate::turn::{self, Turn, TurnMessage};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// TTS provider breakers trip on a shorter cooldown than STT's (spec §4.5:
/// kokoro 5 s, openai 15 s — a faster-failing local backend gets shorter
/// backoff than the remote one).
const KOKORO_COOLDOWN: Duration = Duration::from_secs(5);
const OPENAI_COOLDOWN: Duration = Duration::from_secs(15);

/// Process-wide singletons constructed once at startup and shared by every
/// connection (spec §5 "Shared resources": one upstream LLM transport,
/// independent per-connection provider breakers).
pub struct SharedProviders {
    pub stt: Arc<dyn SttAdapter>,
    pub kokoro: Arc<dyn TtsAdapter>,
    pub openai: Arc<dyn TtsAdapter>,
    pub llm: Arc<UpstreamLlmClient>,
    pub breaker_defaults: BreakerDefaults,
    pub rate_limits: RateLimitDefaults,
    pub max_audio_bytes_per_turn: usize,
}

enum OutboundMessage {
    Json(ServerMessage),
    Binary(Vec<u8>),
    Ping,
}

/// A request to drive one turn's LLM/TTS pipeline to completion, handed off
/// to the dedicated think task so the receive loop stays free to process
/// `barge_in`/`cancel` concurrently.
struct ThinkRequest {
    turn: Arc<Mutex<Turn>>,
    text: String,
}

struct ConnectionState {
    stt_router: Arc<SttRouter>,
    llm_pipeline: Arc<LlmPipeline>,
    tts_pipeline: Arc<TtsPipeline>,
    think_tx: mpsc::UnboundedSender<ThinkRequest>,
    message_limiter: SlidingWindowRateLimiter,
    llm_limiter: SlidingWindowRateLimiter,
    session_config: SessionConfig,
    current_turn: Option<Arc<Mutex<Turn>>>,
    out_tx: mpsc::Sender<OutboundMessage>,
}

/// Accepts one upgraded `/ws` socket and runs it to completion.
pub async fn handle_socket(socket: WebSocket, shared: Arc<SharedProviders>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundMessage>(64);

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(m) => {
                    let text = serde_json::to_string(&m).unwrap_or_default();
                    ws_tx.send(Message::Text(text.into())).await
                }
                OutboundMessage::Binary(bytes) => ws_tx.send(Message::Binary(bytes.into())).await,
                OutboundMessage::Ping => ws_tx.send(Message::Ping(Vec::new().into())).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    let stt_breaker = Arc::new(CircuitBreaker::new("stt:parakeet", shared.breaker_defaults));
    let stt_router = Arc::new(SttRouter::new(shared.stt.clone(), stt_breaker));

    let kokoro_breaker = Arc::new(CircuitBreaker::new(
        "tts:kokoro",
        BreakerDefaults { cooldown: KOKORO_COOLDOWN, ..shared.breaker_defaults },
    ));
    let openai_breaker = Arc::new(CircuitBreaker::new(
        "tts:openai",
        BreakerDefaults { cooldown: OPENAI_COOLDOWN, ..shared.breaker_defaults },
    ));
    let tts_router = Arc::new(TtsRouter::new(
        shared.kokoro.clone(),
        kokoro_breaker,
        shared.openai.clone(),
        openai_breaker,
    ));

    let (llm_pipeline, mut llm_rx) = LlmPipeline::new(shared.llm.clone());
    let llm_pipeline = Arc::new(llm_pipeline);

    let (tts_pipeline, mut tts_rx) = TtsPipeline::new(tts_router);
    let tts_pipeline = Arc::new(tts_pipeline);

    let tts_forwarder_task = spawn_tts_forwarder(tts_rx, out_tx.clone());

    let (think_tx, mut think_rx) = mpsc::unbounded_channel::<ThinkRequest>();
    {
        let llm_pipeline = llm_pipeline.clone();
        let tts_pipeline = tts_pipeline.clone();
        tokio::spawn(async move {
            while let Some(ThinkRequest { turn, text }) = think_rx.recv().await {
                turn::think(&turn, text, llm_pipeline.clone(), &mut llm_rx, tts_pipeline.clone()).await;
            }
        });
    }

    let mut state = ConnectionState {
        stt_router,
        llm_pipeline,
        tts_pipeline,
        think_tx,
        message_limiter: SlidingWindowRateLimiter::new(
            shared.rate_limits.message_max,
            shared.rate_limits.message_window,
        ),
        llm_limiter: SlidingWindowRateLimiter::new(shared.rate_limits.llm_max, shared.rate_limits.llm_window),
        session_config: SessionConfig::default(),
        current_turn: None,
        out_tx,
    };

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(&mut state, &text, &shared).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle_binary_frame(&mut state, data.into(), &shared).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "websocket transport error");
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                tracing::trace!(since_last_pong = ?last_pong.elapsed(), "sending keepalive ping");
                let _ = state.out_tx.send(OutboundMessage::Ping).await;
            }
        }
    }

    if let Some(turn) = state.current_turn.take() {
        turn::cancel(&turn, &state.llm_pipeline, &state.tts_pipeline).await;
    }
    sender_task.abort();
    tts_forwarder_task.abort();
}

async fn send_error(state: &ConnectionState, code: &str, message: impl Into<String>, recoverable: bool) {
    let _ = state
        .out_tx
        .send(OutboundMessage::Json(ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
            recoverable,
        }))
        .await;
}

/// `Global admission` (spec §4.11): every frame passes the message rate
/// limiter first.
async fn handle_text_frame(state: &mut ConnectionState, raw: &str, shared: &Arc<SharedProviders>) {
    if !state.message_limiter.check() {
        send_error(state, "RATE_LIMITED", "message rate limit exceeded", true).await;
        return;
    }

    let parsed = parse_client_message(raw);
    match parsed {
        Ok(ClientMessage::Ping { ts }) => {
            let server_ts = now_ms();
            let _ = state
                .out_tx
                .send(OutboundMessage::Json(ServerMessage::Pong { ts, server_ts }))
                .await;
        }
        Ok(ClientMessage::TranscriptSend { text, turn_id: _ }) => {
            handle_transcript_send(state, text, shared).await;
        }
        Ok(ClientMessage::Command { name, args }) => {
            let result = execute_command(&name, &args, &mut state.session_config)
                .unwrap_or_else(|msg| msg);
            let _ = state
                .out_tx
                .send(OutboundMessage::Json(ServerMessage::CommandResult { name, result }))
                .await;
        }
        Ok(ClientMessage::BargeIn) | Ok(ClientMessage::Cancel) => {
            if let Some(turn) = state.current_turn.take() {
                turn::cancel(&turn, &state.llm_pipeline, &state.tts_pipeline).await;
            }
        }
        Ok(ClientMessage::Config { settings }) => {
            let session_key_changed = state.session_config.apply_patch(settings);
            if session_key_changed {
                // No persisted history store exists on the gateway side; the
                // upstream LLM owns history, so a key switch re-hydrates to
                // an empty transcript until the next turn populates it.
                let messages: Vec<ChatHistoryMessage> = Vec::new();
                let _ = state
                    .out_tx
                    .send(OutboundMessage::Json(ServerMessage::ChatHistory {
                        session_key: state.session_config.session_key.clone(),
                        messages,
                    }))
                    .await;
            }
        }
        Err(err) => {
            send_error(state, err.code(), err.to_string(), err.recoverable()).await;
        }
    }
}

async fn handle_transcript_send(state: &mut ConnectionState, text: String, shared: &Arc<SharedProviders>) {
    if !state.llm_limiter.check() {
        send_error(state, "LLM_RATE_LIMITED", "LLM submission rate limit exceeded", true).await;
        return;
    }

    let turn = get_or_create_turn(state, shared);
    let current_state = turn.lock().await.state();
    let fired = match current_state {
        TurnState::Idle => {
            turn::fire(&turn, TurnEvent::TextSend).await;
            true
        }
        TurnState::PendingSend => {
            turn::fire(&turn, TurnEvent::Send).await;
            true
        }
        _ => false,
    };
    if !fired {
        let turn_id = turn.lock().await.id().to_string();
        tracing::debug!(turn_id, "transcript_send ignored, turn already busy");
        return;
    }
    let _ = state.think_tx.send(ThinkRequest { turn, text });
}

async fn handle_binary_frame(state: &mut ConnectionState, data: Vec<u8>, shared: &Arc<SharedProviders>) {
    let turn = match &state.current_turn {
        Some(existing) => {
            let current_state = existing.lock().await.state();
            match current_state {
                TurnState::Listening => Some(existing.clone()),
                TurnState::PendingSend | TurnState::Transcribing => {
                    turn::fire(existing, TurnEvent::AudioResume).await;
                    Some(existing.clone())
                }
                _ => {
                    tracing::warn!("dropping audio frame: turn not accepting audio in this state");
                    None
                }
            }
        }
        None => {
            let new_turn = get_or_create_turn(state, shared);
            turn::fire(&new_turn, TurnEvent::AudioStart).await;
            Some(new_turn)
        }
    };

    let Some(turn) = turn else { return };

    let prospective_total = turn.lock().await.audio_bytes() + data.len();
    if prospective_total > shared.max_audio_bytes_per_turn {
        send_error(state, "AUDIO_BUFFER_OVERFLOW", "per-turn audio buffer exceeded", true).await;
        turn::cancel(&turn, &state.llm_pipeline, &state.tts_pipeline).await;
        state.current_turn = None;
        return;
    }

    turn::append_audio(&turn, &data).await;
}

/// Creates a fresh Turn if none is active, and spawns the task that
/// forwards its `TurnMessage`s onto the wire. The forwarder ends on its own
/// once the Turn is dropped and its sender closes.
fn get_or_create_turn(state: &mut ConnectionState, _shared: &Arc<SharedProviders>) -> Arc<Mutex<Turn>> {
    if let Some(existing) = &state.current_turn {
        return existing.clone();
    }
    let id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    let turn = Arc::new(Mutex::new(Turn::new(id, state.stt_router.clone(), tx)));
    spawn_turn_forwarder(rx, state.out_tx.clone());
    state.current_turn = Some(turn.clone());
    turn
}

fn spawn_turn_forwarder(mut rx: mpsc::UnboundedReceiver<TurnMessage>, out_tx: mpsc::Sender<OutboundMessage>) {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Some(server_msg) = map_turn_message(msg) {
                let _ = out_tx.send(OutboundMessage::Json(server_msg)).await;
            }
        }
    });
}

fn map_turn_message(msg: TurnMessage) -> Option<ServerMessage> {
    Some(match msg {
        TurnMessage::TurnState { state, turn_id } => ServerMessage::TurnState { state, turn_id },
        TurnMessage::TranscriptPartial { text, stable, unstable } => {
            ServerMessage::TranscriptPartial { text, stable, unstable }
        }
        TurnMessage::TranscriptFinal { text, turn_id } => ServerMessage::TranscriptFinal { text, turn_id },
        TurnMessage::LlmToken { token, full_text } => ServerMessage::LlmToken { token, full_text },
        TurnMessage::LlmDone { full_text } => ServerMessage::LlmDone { full_text },
        TurnMessage::Error { code, message, recoverable } => ServerMessage::Error { code, message, recoverable },
        TurnMessage::ProviderSwitched { from, to } => ServerMessage::ProviderSwitched { from, to },
        TurnMessage::ProviderRecovered { provider } => ServerMessage::ProviderRecovered { provider },
        // Purely internal bookkeeping; nothing on the wire corresponds to them.
        TurnMessage::Completed { .. } | TurnMessage::Cancelled { .. } => return None,
    })
}

/// Drains [`TtsPipelineEvent`]s onto the wire for the lifetime of the
/// connection, independently of whichever Turn is currently active — audio
/// delivery is not routed through `TurnMessage` (see [`map_turn_message`]).
fn spawn_tts_forwarder(
    mut rx: mpsc::UnboundedReceiver<TtsPipelineEvent>,
    out_tx: mpsc::Sender<OutboundMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let outbound = match event {
                TtsPipelineEvent::Meta { index, sample_rate, duration_ms } => Some(OutboundMessage::Json(
                    ServerMessage::TtsMeta { format: "wav", index, sample_rate, duration_ms },
                )),
                TtsPipelineEvent::Audio(bytes) => Some(OutboundMessage::Binary(bytes)),
                TtsPipelineEvent::Done => Some(OutboundMessage::Json(ServerMessage::TtsDone)),
                TtsPipelineEvent::AllFailed => Some(OutboundMessage::Json(ServerMessage::AllFailed)),
                TtsPipelineEvent::Cancelled => None,
            };
            if let Some(outbound) = outbound {
                let _ = out_tx.send(outbound).await;
            }
        }
    })
}

/// `PARSE_ERROR` for malformed JSON, `UNKNOWN_MESSAGE` for a well-formed
/// frame whose `type` isn't one of the recognized client message kinds
/// (spec §4.11, §7).
fn parse_client_message(raw: &str) -> Result<ClientMessage, GatewayError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| GatewayError::Parse(e.to_string()))?;
    let msg_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string();
    const KNOWN: &[&str] = &["transcript_send", "command", "barge_in", "cancel", "config", "ping"];
    if !KNOWN.contains(&msg_type.as_str()) {
        return Err(GatewayError::UnknownMessage(msg_type));
    }
    serde_json::from_value(value).map_err(|e| GatewayError::Parse(e.to_string()))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_message_type() {
        let msg = parse_client_message(r#"{"type":"ping","ts":42}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping { ts: 42 }));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = parse_client_message("{not json").unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
    }

    #[test]
    fn unrecognized_type_is_unknown_message() {
        let err = parse_client_message(r#"{"type":"frobnicate"}"#).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_MESSAGE");
    }

    #[test]
    fn well_formed_type_with_bad_shape_is_parse_error() {
        let err = parse_client_message(r#"{"type":"command"}"#).unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
    }
}
