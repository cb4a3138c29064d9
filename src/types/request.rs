//! Inbound request types.
//!
//! [`UnifiedRequest`] is what the transport layer hands to the gateway. It is validated
//! once while deserializing: the string-or-list fields become [`PromptInput`] and exactly
//! one [`RequestBody`] is selected. The backend-facing requests ([`ChatRequest`],
//! [`CompletionRequest`], [`EmbeddingsRequest`]) carry already-merged
//! [`EffectiveOptions`].

use crate::options::{EffectiveOptions, GenerationOverrides};
use crate::types::message::ChatMessage;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// A field that accepts either a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Single(String),
    Many(Vec<String>),
}

impl PromptInput {
    /// Normalize to a list; a single string becomes a one-element list.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            PromptInput::Single(s) => vec![s],
            PromptInput::Many(v) => v,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PromptInput::Single(s) => s.is_empty(),
            PromptInput::Many(v) => v.is_empty(),
        }
    }
}

impl From<&str> for PromptInput {
    fn from(s: &str) -> Self {
        PromptInput::Single(s.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(s: String) -> Self {
        PromptInput::Single(s)
    }
}

impl From<Vec<String>> for PromptInput {
    fn from(v: Vec<String>) -> Self {
        PromptInput::Many(v)
    }
}

/// What the request asks the model to work on.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Messages(Vec<ChatMessage>),
    Prompt(PromptInput),
    Input(PromptInput),
}

impl RequestBody {
    fn describe(&self) -> &'static str {
        match self {
            RequestBody::Messages(_) => "messages",
            RequestBody::Prompt(_) => "prompt",
            RequestBody::Input(_) => "input",
        }
    }
}

/// OpenAI-compatible inbound request.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawRequest")]
pub struct UnifiedRequest {
    pub model: String,
    /// Optional prompt chain to route through (`chain` or `langchain` on the wire).
    pub chain: Option<String>,
    pub body: RequestBody,
    pub stream: bool,
    /// Number of choices; 0 is treated as 1.
    pub n: u32,
    pub overrides: GenerationOverrides,
}

#[derive(Deserialize)]
struct RawRequest {
    #[serde(default)]
    model: String,
    #[serde(default, alias = "langchain")]
    chain: Option<String>,
    #[serde(default)]
    messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    prompt: Option<PromptInput>,
    #[serde(default)]
    input: Option<PromptInput>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    n: u32,
    #[serde(flatten)]
    overrides: GenerationOverrides,
}

impl TryFrom<RawRequest> for UnifiedRequest {
    type Error = String;

    fn try_from(raw: RawRequest) -> std::result::Result<Self, Self::Error> {
        if raw.model.trim().is_empty() {
            return Err("field 'model' is required".to_string());
        }
        let body = match (raw.messages, raw.prompt, raw.input) {
            (Some(messages), _, _) => RequestBody::Messages(messages),
            (None, Some(prompt), _) => RequestBody::Prompt(prompt),
            (None, None, Some(input)) => RequestBody::Input(input),
            (None, None, None) => {
                return Err("one of 'messages', 'prompt' or 'input' is required".to_string())
            }
        };
        Ok(Self {
            model: raw.model,
            chain: raw.chain.filter(|c| !c.is_empty()),
            body,
            stream: raw.stream,
            n: raw.n,
            overrides: raw.overrides,
        })
    }
}

impl UnifiedRequest {
    /// Parse a JSON request body. Malformed bodies surface as [`Error::Protocol`].
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            Error::protocol_with_context(
                "malformed request body",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("request"),
            )
        })
    }

    pub fn chat(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self::with_body(model, RequestBody::Messages(messages))
    }

    pub fn completion(model: impl Into<String>, prompt: impl Into<PromptInput>) -> Self {
        Self::with_body(model, RequestBody::Prompt(prompt.into()))
    }

    pub fn embeddings(model: impl Into<String>, input: impl Into<PromptInput>) -> Self {
        Self::with_body(model, RequestBody::Input(input.into()))
    }

    fn with_body(model: impl Into<String>, body: RequestBody) -> Self {
        Self {
            model: model.into(),
            chain: None,
            body,
            stream: false,
            n: 0,
            overrides: GenerationOverrides::default(),
        }
    }

    pub fn with_chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = Some(chain.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_n(mut self, n: u32) -> Self {
        self.n = n;
        self
    }

    pub fn with_overrides(mut self, overrides: GenerationOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Number of choices to generate, never zero.
    pub fn choice_count(&self) -> u32 {
        self.n.max(1)
    }

    pub(crate) fn expect_messages(&mut self) -> Result<Vec<ChatMessage>> {
        match &mut self.body {
            RequestBody::Messages(m) => Ok(std::mem::take(m)),
            other => Err(wrong_body("messages", other)),
        }
    }

    pub(crate) fn expect_prompt(&mut self) -> Result<PromptInput> {
        match &mut self.body {
            RequestBody::Prompt(p) => Ok(std::mem::replace(p, PromptInput::Many(Vec::new()))),
            other => Err(wrong_body("prompt", other)),
        }
    }

    pub(crate) fn expect_input(&mut self) -> Result<PromptInput> {
        match &mut self.body {
            RequestBody::Input(i) => Ok(std::mem::replace(i, PromptInput::Many(Vec::new()))),
            other => Err(wrong_body("input", other)),
        }
    }
}

fn wrong_body(expected: &str, got: &RequestBody) -> Error {
    Error::protocol_with_context(
        format!("field '{}' is required for this endpoint", expected),
        ErrorContext::new()
            .with_field_path(expected)
            .with_details(format!("request carries '{}'", got.describe())),
    )
}

/// Chat request handed to a backend.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub options: EffectiveOptions,
}

impl ChatRequest {
    pub fn new(
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
        options: EffectiveOptions,
    ) -> Self {
        Self {
            model: model.into(),
            messages,
            options,
        }
    }

    /// One user message, used by `Backend::call`.
    pub fn single_turn(model: impl Into<String>, prompt: &str, options: EffectiveOptions) -> Self {
        Self::new(model, vec![ChatMessage::user(prompt)], options)
    }

    pub fn is_streaming(&self) -> bool {
        self.options.sink.is_some()
    }
}

/// Completion request handed to a backend; prompts live in `options.prompts`.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub options: EffectiveOptions,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, options: EffectiveOptions) -> Self {
        Self {
            model: model.into(),
            options,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.options.sink.is_some()
    }
}

/// Embeddings request handed to a backend; texts live in `options.inputs`.
#[derive(Debug, Clone)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub options: EffectiveOptions,
}

impl EmbeddingsRequest {
    pub fn new(model: impl Into<String>, options: EffectiveOptions) -> Self {
        Self {
            model: model.into(),
            options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::Role;

    #[test]
    fn chat_request_from_openai_json() {
        let req = UnifiedRequest::from_json(
            br####"{
                "model": "gpt-3.5-turbo",
                "langchain": "base_chat_chain",
                "messages": [{"role": "system", "content": "be brief"}, {"role": "user", "content": "hi"}],
                "temperature": 0.2,
                "stop": "###",
                "stream": true,
                "n": 2
            }"####,
        )
        .unwrap();

        assert_eq!(req.model, "gpt-3.5-turbo");
        assert_eq!(req.chain.as_deref(), Some("base_chat_chain"));
        assert!(req.stream);
        assert_eq!(req.choice_count(), 2);
        assert_eq!(req.overrides.temperature, 0.2);
        assert_eq!(req.overrides.stop, Some(PromptInput::Single("###".into())));
        match &req.body {
            RequestBody::Messages(m) => {
                assert_eq!(m.len(), 2);
                assert_eq!(m[0].role, Role::System);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn prompt_accepts_string_or_list() {
        let single = UnifiedRequest::from_json(br#"{"model":"m","prompt":"once"}"#).unwrap();
        assert_eq!(single.body, RequestBody::Prompt(PromptInput::Single("once".into())));

        let many = UnifiedRequest::from_json(br#"{"model":"m","prompt":["a","b"]}"#).unwrap();
        match many.body {
            RequestBody::Prompt(p) => assert_eq!(p.into_vec(), vec!["a", "b"]),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn missing_model_or_body_is_protocol_error() {
        let err = UnifiedRequest::from_json(br#"{"prompt":"x"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));

        let err = UnifiedRequest::from_json(br#"{"model":"m"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert_eq!(err.status_code(), 400);

        let err = UnifiedRequest::from_json(b"not json").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn zero_n_means_one_choice() {
        let req = UnifiedRequest::completion("m", "p");
        assert_eq!(req.n, 0);
        assert_eq!(req.choice_count(), 1);
    }

    #[test]
    fn endpoint_body_mismatch_is_rejected() {
        let mut req = UnifiedRequest::embeddings("m", "text");
        let err = req.expect_messages().unwrap_err();
        assert!(err.to_string().contains("messages"));
        assert!(req.expect_input().is_ok());
    }
}
