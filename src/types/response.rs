//! OpenAI-compatible response bodies

use crate::types::message::ChatMessage;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const OBJECT_CHAT_COMPLETION: &str = "chat.completion";
pub const OBJECT_TEXT_COMPLETION: &str = "text_completion";

/// One generated alternative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl Choice {
    pub fn message(content: impl Into<String>) -> Self {
        Self {
            message: Some(ChatMessage::assistant(content)),
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text: Some(content.into()),
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        }
    }

    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            delta: Some(ChatMessage::assistant(content)),
            ..Default::default()
        }
    }

    /// Generated text regardless of which field carries it.
    pub fn content(&self) -> &str {
        if let Some(m) = &self.message {
            return &m.content;
        }
        if let Some(t) = &self.text {
            return t;
        }
        self.delta.as_ref().map(|d| d.content.as_str()).unwrap_or("")
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        // Counts come from remote services; never let them overflow.
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatResponse {
    pub fn new(model: impl Into<String>, choices: Vec<Choice>) -> Self {
        Self {
            id: completion_id("chatcmpl"),
            object: OBJECT_CHAT_COMPLETION.to_string(),
            created: unix_now(),
            model: model.into(),
            choices,
            usage: Usage::default(),
        }
    }

    /// Concatenated message contents of every choice.
    pub fn content(&self) -> String {
        self.choices.iter().map(Choice::content).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl CompletionResponse {
    pub fn new(model: impl Into<String>, choices: Vec<Choice>) -> Self {
        Self {
            id: completion_id("cmpl"),
            object: OBJECT_TEXT_COMPLETION.to_string(),
            created: unix_now(),
            model: model.into(),
            choices,
            usage: Usage::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingData {
    #[serde(default = "embedding_object")]
    pub object: String,
    #[serde(default)]
    pub index: u32,
    pub embedding: Vec<f32>,
}

impl EmbeddingData {
    pub fn new(index: u32, embedding: Vec<f32>) -> Self {
        Self {
            object: embedding_object(),
            index,
            embedding,
        }
    }
}

fn embedding_object() -> String {
    "embedding".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub data: Vec<EmbeddingData>,
    #[serde(default)]
    pub usage: Usage,
}

impl EmbeddingsResponse {
    pub fn new(model: impl Into<String>, data: Vec<EmbeddingData>) -> Self {
        Self {
            object: "list".to_string(),
            model: model.into(),
            data,
            usage: Usage::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

/// Body of `GET /v1/models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

impl ModelList {
    pub fn from_names(mut names: Vec<String>) -> Self {
        names.sort();
        Self {
            object: "list".to_string(),
            data: names
                .into_iter()
                .map(|id| ModelCard {
                    id,
                    object: "model".to_string(),
                    owned_by: "llm-chain-gateway".to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
    pub r#type: String,
}

/// `{"error": {...}}` envelope returned for request-time failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

pub(crate) fn completion_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
