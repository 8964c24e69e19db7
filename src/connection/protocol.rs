//! Wire protocol: the JSON message shapes exchanged over `/ws` (spec §6)
//! and the slash-command dispatch table.

use serde::{Deserialize, Serialize};

use crate::config::{SessionConfig, SessionConfigPatch, SttProvider, TtsProvider};
use crate::turn::fsm::TurnState;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    TranscriptSend {
        text: String,
        turn_id: String,
    },
    Command {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
    BargeIn,
    Cancel,
    Config {
        settings: SessionConfigPatch,
    },
    Ping {
        ts: i64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatHistoryMessage {
    pub role: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
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
    TtsMeta {
        format: &'static str,
        index: u32,
        sample_rate: u32,
        duration_ms: u64,
    },
    TtsDone,
    AllFailed,
    TurnState {
        state: TurnState,
        #[serde(skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
    },
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
    CommandResult {
        name: String,
        result: String,
    },
    ChatHistory {
        session_key: String,
        messages: Vec<ChatHistoryMessage>,
    },
    Pong {
        ts: i64,
        server_ts: i64,
    },
    ProviderSwitched {
        from: String,
        to: String,
    },
    ProviderRecovered {
        provider: String,
    },
}

/// Runs one `/`-prefixed slash command against the session config (spec §6).
/// Returns the `result` text for `command_result`, or an error message for
/// an unrecognized command.
pub fn execute_command(name: &str, args: &[String], cfg: &mut SessionConfig) -> Result<String, String> {
    match name {
        "model" => {
            let Some(model) = args.first() else {
                return Err("Usage: /model <name>".to_string());
            };
            cfg.llm_model = model.clone();
            Ok(format!("Model set to {model}"))
        }
        "agent" => {
            let Some(agent) = args.first() else {
                return Err("Usage: /agent <name>".to_string());
            };
            cfg.agent_id = agent.clone();
            Ok(format!("Agent set to {agent}"))
        }
        "voice" => {
            let Some(voice) = args.first() else {
                return Err("Usage: /voice <name>".to_string());
            };
            cfg.tts_voice = Some(voice.clone());
            Ok(format!("Voice set to {voice}"))
        }
        "tts" => match args.first().map(String::as_str) {
            Some("kokoro") => {
                cfg.tts_provider = TtsProvider::Kokoro;
                Ok("TTS provider set to kokoro".to_string())
            }
            Some("openai") => {
                cfg.tts_provider = TtsProvider::Openai;
                Ok("TTS provider set to openai".to_string())
            }
            _ => Err("Usage: /tts {kokoro|openai}".to_string()),
        },
        "stt" => match args.first().map(String::as_str) {
            Some("parakeet") => {
                cfg.stt_provider = SttProvider::Parakeet;
                Ok("STT provider set to parakeet".to_string())
            }
            Some("cloud") => {
                cfg.stt_provider = SttProvider::Cloud;
                Ok("STT provider set to cloud".to_string())
            }
            _ => Err("Usage: /stt {parakeet|cloud}".to_string()),
        },
        "clear" => Ok("Conversation cleared".to_string()),
        "help" => Ok(
            "Available commands: /model <name>, /agent <name>, /voice <name>, \
             /tts {kokoro|openai}, /stt {parakeet|cloud}, /clear, /help"
                .to_string(),
        ),
        other => Err(format!("Unknown command: /{other}. Type /help for available commands.")),
    }
}
