//! Frames exchanged with the remote model service.
//!
//! One JSON document per line. The client sends one [`RpcCall`]; the server answers
//! `chat` and `completion` with [`GenerationReply`] frames until one carries a
//! `finish_reason`, and `embeddings` with a single [`EmbeddingsReply`].

use crate::options::EffectiveOptions;
use crate::types::message::ChatMessage;
use crate::types::response::Usage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcCall {
    Chat(GenerationRequest),
    Completion(GenerationRequest),
    Embeddings(EmbeddingsCall),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub n: u32,
    pub max_new_tokens: u32,
    pub top_k: i32,
    pub repetition_penalty: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default)]
    pub echo: bool,
    #[serde(default)]
    pub stream: bool,
}

impl GenerationRequest {
    /// Server-side defaults for a remote model, before request options apply.
    pub fn defaults_for(model: &str) -> Self {
        let base = Self {
            model: model.to_string(),
            n: 1,
            max_new_tokens: 7000,
            ..Default::default()
        };
        match model {
            "chatglm2-6b" => Self {
                temperature: 0.7,
                top_p: 2.0,
                repetition_penalty: 1.0,
                ..base
            },
            _ => Self {
                temperature: 0.8,
                top_p: 1.0,
                ..base
            },
        }
    }

    /// Overlay the non-zero request options.
    pub fn apply(mut self, options: &EffectiveOptions) -> Self {
        if options.temperature != 0.0 {
            self.temperature = options.temperature;
        }
        if options.top_p != 0.0 {
            self.top_p = options.top_p;
        }
        if options.top_k != 0 {
            self.top_k = options.top_k;
        }
        if options.max_tokens > 0 {
            self.max_new_tokens = options.max_tokens as u32;
        }
        if options.repeat_penalty != 0.0 {
            self.repetition_penalty = options.repeat_penalty;
        }
        self.echo = self.echo || options.echo;
        self.stop.extend(options.stop.iter().cloned());
        self.stream = options.sink.is_some();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationReply {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsCall {
    pub model: String,
    pub input: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsReply {
    #[serde(default)]
    pub embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_is_tagged_by_method() {
        let call = RpcCall::Embeddings(EmbeddingsCall {
            model: "bge".into(),
            input: vec!["a".into()],
        });
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["method"], "embeddings");
        assert_eq!(json["params"]["input"][0], "a");
    }

    #[test]
    fn per_model_defaults() {
        let d = GenerationRequest::defaults_for("anything");
        assert_eq!(d.temperature, 0.8);
        assert_eq!(d.max_new_tokens, 7000);
        let glm = GenerationRequest::defaults_for("chatglm2-6b");
        assert_eq!(glm.temperature, 0.7);
        assert_eq!(glm.repetition_penalty, 1.0);
    }

    #[test]
    fn apply_overlays_only_set_options() {
        let options = EffectiveOptions {
            temperature: 0.2,
            max_tokens: 64,
            stop: vec!["\n".into()],
            ..Default::default()
        };
        let req = GenerationRequest::defaults_for("m").apply(&options);
        assert_eq!(req.temperature, 0.2);
        assert_eq!(req.top_p, 1.0);
        assert_eq!(req.max_new_tokens, 64);
        assert_eq!(req.stop, vec!["\n"]);
        assert!(!req.stream);
    }
}
