//! End-to-end scenarios over a live `/ws` socket (spec §8 "End-to-end
//! scenarios"), backed by `wiremock` stand-ins for the STT/TTS/LLM HTTP
//! contracts.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use voicegate::config::{BreakerDefaults, RateLimitDefaults};
use voicegate::connection::SharedProviders;
use voicegate::llm::UpstreamLlmClient;
use voicegate::server::GatewayServer;
use voicegate::stt::HttpSttAdapter;
use voicegate::tts::{KokoroAdapter, OpenAiTtsAdapter};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn fast_breaker() -> BreakerDefaults {
    BreakerDefaults {
        failure_threshold: 3,
        window: Duration::from_secs(60),
        cooldown: Duration::from_millis(50),
        max_cooldown: Duration::from_millis(400),
        backoff_multiplier: 2,
    }
}

async fn start_gateway(llm_body: &str) -> (GatewayServer, MockServer, MockServer, MockServer) {
    let stt_mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "hello world",
            "confidence": 0.9,
            "segments": [],
        })))
        .mount(&stt_mock)
        .await;

    let tts_mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            voicegate::wav::wrap_pcm16_mono(&[0u8; 320], 16_000),
            "audio/wav",
        ))
        .mount(&tts_mock)
        .await;

    let llm_mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(llm_body.to_string(), "text/event-stream"))
        .mount(&llm_mock)
        .await;

    let providers = Arc::new(SharedProviders {
        stt: Arc::new(HttpSttAdapter::new("parakeet", stt_mock.uri())),
        kokoro: Arc::new(KokoroAdapter::new(tts_mock.uri())),
        openai: Arc::new(OpenAiTtsAdapter::new(tts_mock.uri(), "test-key")),
        llm: Arc::new(UpstreamLlmClient::new(llm_mock.uri(), None, "test-model")),
        breaker_defaults: fast_breaker(),
        rate_limits: RateLimitDefaults {
            message_max: 100,
            message_window: Duration::from_secs(1),
            llm_max: 30,
            llm_window: Duration::from_secs(60),
        },
        max_audio_bytes_per_turn: 10 * 1024 * 1024,
    });

    let server = GatewayServer::start(0, providers).await.unwrap();
    (server, stt_mock, tts_mock, llm_mock)
}

async fn connect(server: &GatewayServer) -> Client {
    let url = format!("ws://{}/ws", server.addr());
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

async fn recv_json(ws: &mut Client) -> Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Binary(_) | WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Collects JSON `server` messages for up to `timeout`, ignoring binary
/// audio frames, stopping early once `stop_type` is observed.
async fn collect_until(ws: &mut Client, stop_type: &str, timeout: Duration) -> Vec<Value> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                let v: Value = serde_json::from_str(&text).unwrap();
                let is_stop = v.get("type").and_then(Value::as_str) == Some(stop_type);
                out.push(v);
                if is_stop {
                    break;
                }
            }
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }
    out
}

#[tokio::test]
async fn text_send_streams_tokens_then_tts_then_idle() {
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" world.\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    let (server, ..) = start_gateway(body).await;
    let mut ws = connect(&server).await;

    ws.send(WsMessage::Text(
        json!({"type": "transcript_send", "text": "Hello", "turnId": "T1"}).to_string().into(),
    ))
    .await
    .unwrap();

    let messages = collect_until(&mut ws, "turn_state", Duration::from_secs(5)).await;
    let types: Vec<&str> = messages.iter().filter_map(|m| m.get("type").and_then(Value::as_str)).collect();

    assert!(types.contains(&"llm_token"));
    assert!(types.contains(&"llm_done"));
    assert!(types.contains(&"tts_meta"));
    assert!(types.contains(&"tts_done"));
    let last = messages.last().unwrap();
    assert_eq!(last["type"], "turn_state");
    assert_eq!(last["state"], "idle");
}

#[tokio::test]
async fn audio_turn_silence_timeout_produces_transcript() {
    let (server, ..) = start_gateway("data: [DONE]\n\n").await;
    let mut ws = connect(&server).await;

    ws.send(WsMessage::Binary(vec![0u8; 1000].into())).await.unwrap();

    let listening = recv_json(&mut ws).await;
    assert_eq!(listening["type"], "turn_state");
    assert_eq!(listening["state"], "listening");

    let messages = collect_until(&mut ws, "turn_state", Duration::from_secs(3)).await;
    let types: Vec<&str> = messages.iter().filter_map(|m| m.get("type").and_then(Value::as_str)).collect();
    assert!(types.contains(&"transcript_final"));

    let final_msg = messages
        .iter()
        .find(|m| m.get("type").and_then(Value::as_str) == Some("transcript_final"))
        .unwrap();
    assert_eq!(final_msg["text"], "hello world");
}

#[tokio::test]
async fn excess_transcript_sends_trigger_llm_rate_limit() {
    let (server, ..) = start_gateway("data: [DONE]\n\n").await;
    let mut ws = connect(&server).await;

    for i in 0..31 {
        let turn_id = format!("T{i}");
        ws.send(WsMessage::Text(
            json!({"type": "transcript_send", "text": "hi", "turnId": turn_id}).to_string().into(),
        ))
        .await
        .unwrap();
    }

    let mut saw_rate_limited = false;
    for _ in 0..64 {
        let Ok(Some(Ok(WsMessage::Text(text)))) =
            tokio::time::timeout(Duration::from_millis(500), ws.next()).await
        else {
            break;
        };
        let v: Value = serde_json::from_str(&text).unwrap();
        if v.get("type").and_then(Value::as_str) == Some("error")
            && v.get("code").and_then(Value::as_str) == Some("LLM_RATE_LIMITED")
        {
            saw_rate_limited = true;
            break;
        }
    }
    assert!(saw_rate_limited);
}
