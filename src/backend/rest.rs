//! Remote OpenAI-compatible REST backend.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::env;
use std::time::Duration;
use tracing::{debug, error};

use super::{Backend, BackendKind};
use crate::config::ModelDescriptor;
use crate::options::{EffectiveOptions, GenerationDefaults};
use crate::stream::TokenSink;
use crate::transport::SseDecoder;
use crate::types::request::{ChatRequest, CompletionRequest, EmbeddingsRequest};
use crate::types::response::{ChatResponse, Choice, CompletionResponse, EmbeddingsResponse};
use crate::{BoxStream, Error, ErrorContext, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// `settings` block of a REST model descriptor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RestSettings {
    #[serde(alias = "api_host")]
    pub base_url: String,
    /// Falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    pub organization: Option<String>,
    /// Model name sent upstream when it differs from the configured name.
    #[serde(alias = "model")]
    pub upstream_model: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            organization: None,
            upstream_model: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorEnvelope {
    error: UpstreamError,
}

#[derive(Debug, Deserialize)]
struct UpstreamError {
    message: String,
}

#[derive(Debug, Clone, Copy)]
enum StreamField {
    Delta,
    Text,
}

#[derive(Debug)]
pub struct RestBackend {
    name: String,
    defaults: GenerationDefaults,
    upstream_model: String,
    base_url: String,
    api_key: Option<String>,
    organization: Option<String>,
    client: reqwest::Client,
}

impl RestBackend {
    pub fn new(
        name: impl Into<String>,
        settings: RestSettings,
        defaults: GenerationDefaults,
    ) -> Result<Self> {
        let name = name.into();
        let base_url = settings.base_url.trim_end_matches('/').to_string();
        url::Url::parse(&base_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid base_url for '{}'", name),
                ErrorContext::new()
                    .with_field_path(format!("models.{}.settings.base_url", name))
                    .with_details(e.to_string()),
            )
        })?;

        // Minimal production-friendly defaults (env-overridable).
        let timeout_secs = settings
            .timeout_secs
            .or_else(|| {
                env::var("GATEWAY_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
            })
            .unwrap_or(60);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(
                env::var("GATEWAY_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(32),
            )
            .build()?;

        Ok(Self {
            upstream_model: settings.upstream_model.unwrap_or_else(|| name.clone()),
            name,
            defaults,
            base_url,
            api_key: settings
                .api_key
                .or_else(|| env::var("OPENAI_API_KEY").ok())
                .filter(|k| !k.is_empty()),
            organization: settings.organization,
            client,
        })
    }

    pub fn from_descriptor(desc: &ModelDescriptor) -> Result<Self> {
        Self::new(desc.name.clone(), desc.settings()?, desc.parameters.clone())
    }

    fn generation_body(&self, options: &EffectiveOptions, stream: bool) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("model".into(), json!(self.upstream_model));
        if options.temperature != 0.0 {
            body.insert("temperature".into(), json!(options.temperature));
        }
        if options.top_p != 0.0 {
            body.insert("top_p".into(), json!(options.top_p));
        }
        if options.max_tokens > 0 {
            body.insert("max_tokens".into(), json!(options.max_tokens));
        }
        if !options.stop.is_empty() {
            body.insert("stop".into(), json!(options.stop));
        }
        if options.echo {
            body.insert("echo".into(), json!(true));
        }
        body.insert("stream".into(), json!(stream));
        body
    }

    async fn post(
        &self,
        path: &str,
        body: &Map<String, Value>,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(org) = &self.organization {
            req = req.header("OpenAI-Organization", org);
        }
        if stream {
            req = req.header("accept", "text/event-stream");
        }

        let response = req.send().await.map_err(|e| {
            error!(url = %url, error = %e, "upstream request failed (transport)");
            self.send_error(e)
        })?;
        check_status(response).await
    }

    fn send_error(&self, e: reqwest::Error) -> Error {
        if e.is_connect() || e.is_timeout() {
            Error::unavailable(self.name.as_str(), e.to_string())
        } else {
            Error::Transport(e)
        }
    }

    /// Re-emit upstream SSE tokens through the sink; returns the accumulated text.
    async fn relay_stream(
        &self,
        response: reqwest::Response,
        sink: &TokenSink,
        field: StreamField,
    ) -> Result<(String, Option<String>)> {
        let bytes: BoxStream<'static, Bytes> =
            Box::pin(response.bytes_stream().map_err(Error::Transport));
        let mut frames = SseDecoder::default().decode(bytes);
        let mut text = String::new();
        let mut finish_reason = None;

        while let Some(frame) = frames.next().await {
            let frame = frame?;
            let choice = &frame["choices"][0];
            if let Some(reason) = choice["finish_reason"].as_str() {
                finish_reason = Some(reason.to_string());
            }
            let token = match field {
                StreamField::Delta => choice["delta"]["content"].as_str(),
                StreamField::Text => choice["text"].as_str(),
            };
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                text.push_str(token);
                if !sink.emit(token).await {
                    debug!(model = %self.name, "consumer gone, closing upstream stream");
                    break;
                }
            }
        }
        Ok((text, finish_reason))
    }
}

/// Return the response if successful, or the upstream error message.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());
    let message = match serde_json::from_str::<UpstreamErrorEnvelope>(&body) {
        Ok(env) => env.error.message,
        Err(_) => body,
    };
    error!(%status, %message, "upstream returned HTTP error");
    Err(Error::Remote {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Backend for RestBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Rest
    }

    fn defaults(&self) -> &GenerationDefaults {
        &self.defaults
    }

    async fn free(&self) -> Result<()> {
        Ok(())
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let streaming = req.is_streaming();
        let mut body = self.generation_body(&req.options, streaming);
        body.insert("messages".into(), serde_json::to_value(&req.messages)?);
        let response = self.post("/chat/completions", &body, streaming).await?;

        match &req.options.sink {
            Some(sink) => {
                let (text, finish_reason) =
                    self.relay_stream(response, sink, StreamField::Delta).await?;
                let mut choice = Choice::message(text);
                choice.finish_reason = finish_reason.or(choice.finish_reason);
                Ok(ChatResponse::new(self.name.clone(), vec![choice]))
            }
            None => Ok(response.json::<ChatResponse>().await?),
        }
    }

    async fn completion(&self, req: CompletionRequest) -> Result<CompletionResponse> {
        let streaming = req.is_streaming();
        let mut body = self.generation_body(&req.options, streaming);
        body.insert("prompt".into(), json!(req.options.prompts));
        let response = self.post("/completions", &body, streaming).await?;

        match &req.options.sink {
            Some(sink) => {
                let (text, finish_reason) =
                    self.relay_stream(response, sink, StreamField::Text).await?;
                let mut choice = Choice::text(text);
                choice.finish_reason = finish_reason.or(choice.finish_reason);
                Ok(CompletionResponse::new(self.name.clone(), vec![choice]))
            }
            None => Ok(response.json::<CompletionResponse>().await?),
        }
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let mut body = Map::new();
        body.insert("model".into(), json!(self.upstream_model));
        body.insert("input".into(), json!(req.options.inputs));
        let response = self.post("/embeddings", &body, false).await?;
        Ok(response.json::<EmbeddingsResponse>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> RestBackend {
        RestBackend::new(
            "gpt-3.5-turbo",
            RestSettings {
                base_url: "http://localhost:9/v1/".into(),
                api_key: Some("sk-test".into()),
                ..Default::default()
            },
            GenerationDefaults::default(),
        )
        .unwrap()
    }

    #[test]
    fn body_skips_unset_parameters() {
        let b = backend();
        let options = EffectiveOptions {
            temperature: 0.5,
            stop: vec!["###".into()],
            ..Default::default()
        };
        let body = b.generation_body(&options, false);
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["stop"], json!(["###"]));
        assert!(!body.contains_key("top_p"));
        assert!(!body.contains_key("max_tokens"));
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        assert_eq!(backend().base_url, "http://localhost:9/v1");
    }

    #[test]
    fn invalid_base_url_is_configuration_error() {
        let err = RestBackend::new(
            "m",
            RestSettings {
                base_url: "not a url".into(),
                ..Default::default()
            },
            GenerationDefaults::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        let err = backend().call("hi").await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable { .. }), "got {:?}", err);
    }
}
