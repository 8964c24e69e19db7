//! LLM streaming pipeline: turns a transcript into `llm_token` /
//! `phrase_ready` / `llm_done` events, with idempotent cancellation and a
//! server-side stall timeout (spec §4.8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::llm::chunker::PhraseChunker;
use crate::llm::{ChatMessage, UpstreamLlmClient};

/// Guards against a stalled upstream response hanging a turn forever.
/// Not part of the original turn-taking design; added so a wedged
/// upstream can't leave a connection stuck in `thinking`.
const LLM_TIMEOUT: Duration = Duration::from_secs(120);

const VOICE_INSTRUCTION: &str = "[[voice]] Be brief.\n";

#[derive(Debug, Clone)]
pub enum LlmPipelineEvent {
    Token { token: String, full_text: String },
    PhraseReady { text: String, index: u32, turn_id: String },
    Done { full_text: String, cancelled: bool },
    Error { error: String, turn_id: String },
}

pub struct LlmPipeline {
    client: Arc<UpstreamLlmClient>,
    chunker: Mutex<PhraseChunker>,
    cancelled: Arc<AtomicBool>,
    cancel_token: Mutex<Option<CancellationToken>>,
    full_text: Mutex<String>,
    tx: mpsc::UnboundedSender<LlmPipelineEvent>,
}

impl LlmPipeline {
    pub fn new(client: Arc<UpstreamLlmClient>) -> (Self, mpsc::UnboundedReceiver<LlmPipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Self {
            client,
            chunker: Mutex::new(PhraseChunker::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_token: Mutex::new(None),
            full_text: Mutex::new(String::new()),
            tx,
        };
        (pipeline, rx)
    }

    /// `sendTranscript(text, sessionKey, turnId)` from spec §4.8. Prepends
    /// the voice-mode instruction, streams deltas as `Token` events, feeds
    /// them through the phrase chunker, and emits exactly one `Done` (or
    /// nothing, if [`cancel`](Self::cancel) already emitted it).
    pub async fn send_transcript(&self, text: &str, turn_id: impl Into<String>) {
        let turn_id = turn_id.into();

        self.cancelled.store(false, Ordering::SeqCst);
        let token = CancellationToken::new();
        *self.cancel_token.lock().await = Some(token.clone());
        self.chunker.lock().await.reset();
        *self.full_text.lock().await = String::new();

        let prompt = format!("{VOICE_INSTRUCTION}{text}");
        let messages = vec![ChatMessage::user(prompt)];

        let run = self.run_stream(&messages, &turn_id);

        let outcome = tokio::select! {
            res = run => res,
            _ = token.cancelled() => {
                // cancel() already emitted Done; the upstream socket is
                // dropped along with `run`.
                return;
            }
            _ = tokio::time::sleep(LLM_TIMEOUT) => Err(GatewayError::LlmTimeout),
        };

        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }

        match outcome {
            Ok(()) => {
                let remaining = self.chunker.lock().await.feed("", true);
                for chunk in remaining {
                    let _ = self.tx.send(LlmPipelineEvent::PhraseReady {
                        text: chunk.text,
                        index: chunk.index,
                        turn_id: turn_id.clone(),
                    });
                }
                let full_text = self.full_text.lock().await.clone();
                let _ = self.tx.send(LlmPipelineEvent::Done {
                    full_text,
                    cancelled: false,
                });
            }
            Err(err) => {
                let _ = self.tx.send(LlmPipelineEvent::Error {
                    error: err.to_string(),
                    turn_id,
                });
            }
        }
    }

    async fn run_stream(
        &self,
        messages: &[ChatMessage],
        turn_id: &str,
    ) -> crate::error::Result<()> {
        let mut stream = self.client.stream_chat(messages).await?;

        while let Some(delta) = stream.next().await {
            let piece = delta?;
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }

            let full_text = {
                let mut guard = self.full_text.lock().await;
                guard.push_str(&piece);
                guard.clone()
            };

            let _ = self.tx.send(LlmPipelineEvent::Token {
                token: piece.clone(),
                full_text,
            });

            let chunks = self.chunker.lock().await.feed(&piece, false);
            for chunk in chunks {
                let _ = self.tx.send(LlmPipelineEvent::PhraseReady {
                    text: chunk.text,
                    index: chunk.index,
                    turn_id: turn_id.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Idempotent: a second call is a no-op. Aborts the upstream request
    /// (by cancelling the token that `send_transcript`'s `select!` races
    /// against), discards any partially-chunked phrase, and emits exactly
    /// one `Done{cancelled: true}`.
    pub async fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.cancel_token.lock().await.take() {
            token.cancel();
        }
        self.chunker.lock().await.reset();
        let full_text = self.full_text.lock().await.clone();
        let _ = self.tx.send(LlmPipelineEvent::Done {
            full_text,
            cancelled: true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(mock_server: &MockServer) -> Arc<UpstreamLlmClient> {
        Arc::new(UpstreamLlmClient::new(mock_server.uri(), None, "test-model"))
    }

    #[tokio::test]
    async fn send_transcript_emits_tokens_phrases_and_one_done() {
        let mock_server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello there. \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"How are you?\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&mock_server)
            .await;

        let (pipeline, mut rx) = LlmPipeline::new(client_for(&mock_server).await);
        pipeline.send_transcript("hi", "turn-1").await;

        let mut done_count = 0;
        let mut saw_phrase = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                LlmPipelineEvent::Done { cancelled, .. } => {
                    done_count += 1;
                    assert!(!cancelled);
                }
                LlmPipelineEvent::PhraseReady { .. } => saw_phrase = true,
                _ => {}
            }
        }
        assert_eq!(done_count, 1);
        assert!(saw_phrase);
    }

    #[tokio::test]
    async fn cancel_before_send_is_idempotent_and_emits_single_done() {
        let mock_server = MockServer::start().await;
        let (pipeline, mut rx) = LlmPipeline::new(client_for(&mock_server).await);

        pipeline.cancel().await;
        pipeline.cancel().await;

        let mut done_count = 0;
        while let Ok(event) = rx.try_recv() {
            if let LlmPipelineEvent::Done { cancelled, .. } = event {
                done_count += 1;
                assert!(cancelled);
            }
        }
        assert_eq!(done_count, 1);
    }

    #[tokio::test]
    async fn upstream_error_emits_error_event_not_done() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let (pipeline, mut rx) = LlmPipeline::new(client_for(&mock_server).await);
        pipeline.send_transcript("hi", "turn-1").await;

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, LlmPipelineEvent::Error { .. }) {
                saw_error = true;
            }
            assert!(!matches!(event, LlmPipelineEvent::Done { .. }));
        }
        assert!(saw_error);
    }
}
