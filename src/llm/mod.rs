//! Upstream LLM transport: a streaming chat-completions client built on
//! [`sse`] (spec §6 "upstream LLM transport"). [`pipeline`] drives this
//! with cancellation and the phrase [`chunker`].

pub mod chunker;
pub mod pipeline;
pub mod sse;

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::llm::sse::{SseEvent, SseLineParser};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: ChatStreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

fn extract_delta(event: &SseEvent) -> Option<String> {
    let chunk: ChatStreamChunk = serde_json::from_str(&event.data).ok()?;
    chunk.choices.into_iter().next()?.delta.content
}

fn queue_events(pending: &mut VecDeque<Result<String>>, events: Vec<SseEvent>) {
    for event in events {
        if event.is_done() {
            continue;
        }
        if let Some(delta) = extract_delta(&event) {
            if !delta.is_empty() {
                pending.push_back(Ok(delta));
            }
        }
    }
}

struct StreamState {
    byte_stream: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    parser: SseLineParser,
    pending: VecDeque<Result<String>>,
    done: bool,
}

/// An HTTP client for an OpenAI-compatible chat-completions endpoint,
/// used as this gateway's upstream LLM.
pub struct UpstreamLlmClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl UpstreamLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Opens a streaming chat completion and returns a stream of text
    /// deltas as they arrive. Dropping the returned stream aborts the
    /// underlying socket, which is how cancellation propagates upstream.
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send>>> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = tokio::time::timeout(CONNECT_TIMEOUT, req.send())
            .await
            .map_err(|_| GatewayError::Llm("connection to upstream LLM timed out".to_string()))?
            .map_err(|e| GatewayError::Llm(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Llm(format!("upstream returned {}", resp.status())));
        }

        let state = StreamState {
            byte_stream: Box::pin(resp.bytes_stream()),
            parser: SseLineParser::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let stream = futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }
                match state.byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        let events = state.parser.push(&bytes);
                        queue_events(&mut state.pending, events);
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(GatewayError::Llm(e.to_string())), state));
                    }
                    None => {
                        state.done = true;
                        if let Some(event) = state.parser.flush() {
                            queue_events(&mut state.pending, vec![event]);
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn stream_chat_yields_ordered_deltas() {
        let mock_server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&mock_server)
            .await;

        let client = UpstreamLlmClient::new(mock_server.uri(), None, "test-model");
        let messages = vec![ChatMessage::user("hi")];
        let mut stream = client.stream_chat(&messages).await.unwrap();

        let mut deltas = Vec::new();
        while let Some(item) = stream.next().await {
            deltas.push(item.unwrap());
        }
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn stream_chat_errors_on_non_success_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let client = UpstreamLlmClient::new(mock_server.uri(), None, "test-model");
        let err = match client.stream_chat(&[ChatMessage::user("hi")]).await {
            Ok(_) => panic!("expected stream_chat to fail on a 500 response"),
            Err(err) => err,
        };
        assert!(matches!(err, GatewayError::Llm(_)));
    }
}
