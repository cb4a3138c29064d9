//! Streaming events emitted by the stream multiplexer

use crate::types::response::Choice;
use serde::{Deserialize, Serialize};

pub const OBJECT_CHAT_CHUNK: &str = "chat.completion.chunk";
pub const FINISH_STOP: &str = "stop";

/// One element of a token stream.
///
/// A stream is any number of `Delta`s followed by exactly one `Terminal`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(Choice),
    Terminal,
}

impl StreamEvent {
    pub fn token(text: impl Into<String>) -> Self {
        StreamEvent::Delta(Choice::delta(text))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Terminal)
    }

    /// The choice carried on the wire for this event.
    pub fn into_choice(self) -> Choice {
        match self {
            StreamEvent::Delta(choice) => choice,
            StreamEvent::Terminal => Choice {
                finish_reason: Some(FINISH_STOP.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn into_chunk(self, id: &str, model: &str, created: u64) -> ChatChunk {
        ChatChunk {
            id: id.to_string(),
            object: OBJECT_CHAT_CHUNK.to_string(),
            created,
            model: model.to_string(),
            choices: vec![self.into_choice()],
        }
    }
}

/// `chat.completion.chunk` body sent for every stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
}
