//! The turn state machine as a pure function (spec §4.10, Design Notes §9:
//! "the FSM table... is a pure function `transition(state, event) -> state?`
//! and belongs in a standalone module").

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Listening,
    Transcribing,
    PendingSend,
    Thinking,
    Speaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnEvent {
    AudioStart,
    SilenceDetected,
    SttDone,
    SttEmpty,
    AudioResume,
    Send,
    TextSend,
    LlmFirstChunk,
    LlmDone,
    BargeIn,
    Cancel,
    Error,
}

/// Looks up `(state, event)` in the FSM table. Returns `None` for any pair
/// not listed — such pairs are silently ignored by the caller.
pub fn transition(state: TurnState, event: TurnEvent) -> Option<TurnState> {
    use TurnEvent::*;
    use TurnState::*;

    match (state, event) {
        (Idle, AudioStart) => Some(Listening),
        (Idle, TextSend) => Some(Thinking),

        (Listening, SilenceDetected) => Some(Transcribing),
        (Listening, Cancel) | (Listening, Error) => Some(Idle),

        (Transcribing, SttDone) => Some(PendingSend),
        (Transcribing, SttEmpty) => Some(Idle),
        (Transcribing, AudioResume) => Some(Listening),
        (Transcribing, Cancel) | (Transcribing, Error) => Some(Idle),

        (PendingSend, Send) | (PendingSend, TextSend) => Some(Thinking),
        (PendingSend, AudioResume) => Some(Listening),
        (PendingSend, Cancel) => Some(Idle),

        (Thinking, LlmFirstChunk) => Some(Speaking),
        (Thinking, LlmDone) | (Thinking, Cancel) | (Thinking, BargeIn) | (Thinking, Error) => Some(Idle),

        (Speaking, LlmDone) | (Speaking, Cancel) | (Speaking, BargeIn) | (Speaking, Error) => Some(Idle),

        _ => None,
    }
}
