//! Remote RPC model service backend.
//!
//! Each call picks one configured endpoint uniformly at random and talks to it over a
//! persistent newline-delimited JSON channel. Channels that finish an exchange cleanly
//! go back to a per-endpoint idle pool; a channel abandoned mid-reply is dropped.

mod pool;
pub mod wire;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::env;
use std::time::Duration;
use tracing::{debug, warn};

use self::pool::{Channel, ChannelPool};
use self::wire::{EmbeddingsCall, EmbeddingsReply, GenerationReply, GenerationRequest, RpcCall};
use super::{Backend, BackendKind};
use crate::config::ModelDescriptor;
use crate::options::{EffectiveOptions, GenerationDefaults};
use crate::types::request::{ChatRequest, CompletionRequest, EmbeddingsRequest};
use crate::types::response::{
    ChatResponse, Choice, CompletionResponse, EmbeddingData, EmbeddingsResponse, Usage,
};
use crate::{Error, ErrorContext, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1:50051";

/// `settings` block of an RPC model descriptor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub hosts: Vec<String>,
    /// Model name sent to the service when it differs from the configured name.
    #[serde(alias = "model")]
    pub upstream_model: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    /// Longest wait for any single reply frame.
    pub read_timeout_secs: Option<u64>,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            hosts: vec![DEFAULT_HOST.to_string()],
            upstream_model: None,
            connect_timeout_secs: None,
            read_timeout_secs: None,
        }
    }
}

/// Outcome of one generation exchange.
struct Generated {
    text: String,
    finish_reason: Option<String>,
    usage: Usage,
}

pub struct RpcBackend {
    name: String,
    defaults: GenerationDefaults,
    upstream_model: String,
    hosts: Vec<String>,
    pool: ChannelPool,
    read_timeout: Duration,
}

impl std::fmt::Debug for RpcBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcBackend")
            .field("name", &self.name)
            .field("hosts", &self.hosts)
            .finish()
    }
}

impl RpcBackend {
    pub fn new(
        name: impl Into<String>,
        settings: RpcSettings,
        defaults: GenerationDefaults,
    ) -> Result<Self> {
        let name = name.into();
        if settings.hosts.is_empty() || settings.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(Error::configuration_with_context(
                format!("model '{}' needs at least one RPC host", name),
                ErrorContext::new().with_field_path(format!("models.{}.settings.hosts", name)),
            ));
        }

        let connect_timeout = settings
            .connect_timeout_secs
            .or_else(|| {
                env::var("GATEWAY_RPC_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
            })
            .unwrap_or(5);
        let read_timeout = settings
            .read_timeout_secs
            .or_else(|| {
                env::var("GATEWAY_RPC_READ_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
            })
            .unwrap_or(120);
        let max_idle = env::var("GATEWAY_RPC_POOL_MAX_IDLE_PER_HOST")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(8);

        Ok(Self {
            upstream_model: settings.upstream_model.unwrap_or_else(|| name.clone()),
            name,
            defaults,
            hosts: settings.hosts,
            pool: ChannelPool::new(Duration::from_secs(connect_timeout), max_idle),
            read_timeout: Duration::from_secs(read_timeout),
        })
    }

    pub fn from_descriptor(desc: &ModelDescriptor) -> Result<Self> {
        Self::new(desc.name.clone(), desc.settings()?, desc.parameters.clone())
    }

    /// Idle channels currently pooled for `host`.
    pub fn idle_channels(&self, host: &str) -> usize {
        self.pool.idle_count(host)
    }

    fn pick_host(&self) -> &str {
        &self.hosts[fastrand::usize(..self.hosts.len())]
    }

    fn channel_error(&self, host: &str, e: impl std::fmt::Display) -> Error {
        Error::unavailable(self.name.as_str(), format!("{}: {}", host, e))
    }

    /// Dial (or reuse) a channel to a random endpoint and send `call` on it.
    async fn open(&self, call: &RpcCall) -> Result<(String, Channel)> {
        let host = self.pick_host().to_string();
        let mut channel = self
            .pool
            .checkout(&host)
            .await
            .map_err(|e| self.channel_error(&host, e))?;
        let frame = serde_json::to_string(call)?;
        channel
            .send(frame)
            .await
            .map_err(|e| self.channel_error(&host, e))?;
        debug!(model = %self.name, host = %host, "rpc call sent");
        Ok((host, channel))
    }

    async fn read_reply<T: DeserializeOwned>(
        &self,
        host: &str,
        channel: &mut Channel,
    ) -> Result<T> {
        let next = tokio::time::timeout(self.read_timeout, channel.next())
            .await
            .map_err(|_| self.channel_error(host, "timed out waiting for a reply"))?;
        match next {
            Some(Ok(line)) => Ok(serde_json::from_str(&line)?),
            Some(Err(e)) => Err(self.channel_error(host, e)),
            None => Err(self.channel_error(host, "channel closed before the reply finished")),
        }
    }

    /// Run one chat or completion exchange, relaying text through the sink if present.
    async fn generate(&self, call: RpcCall, options: &EffectiveOptions) -> Result<Generated> {
        let (host, mut channel) = self.open(&call).await?;
        let mut out = Generated {
            text: String::new(),
            finish_reason: None,
            usage: Usage::default(),
        };

        loop {
            let reply: GenerationReply = self.read_reply(&host, &mut channel).await?;
            if reply.error_code != 0 {
                warn!(model = %self.name, code = reply.error_code, "rpc service reported failure");
                return Err(Error::inference(self.name.as_str(), reply.error_code, reply.text));
            }
            if let Some(usage) = reply.usage {
                out.usage = usage;
            }
            if !reply.text.is_empty() {
                out.text.push_str(&reply.text);
                if let Some(sink) = &options.sink {
                    if !sink.emit(reply.text).await {
                        // Channel is mid-reply; dropping it keeps the pool in sync.
                        debug!(model = %self.name, "consumer gone, abandoning rpc channel");
                        return Ok(out);
                    }
                }
            }
            if reply.finish_reason.is_some() {
                out.finish_reason = reply.finish_reason;
                self.pool.checkin(&host, channel);
                return Ok(out);
            }
        }
    }

    fn request_for(&self, options: &EffectiveOptions) -> GenerationRequest {
        GenerationRequest::defaults_for(&self.upstream_model).apply(options)
    }
}

#[async_trait]
impl Backend for RpcBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Rpc
    }

    fn defaults(&self) -> &GenerationDefaults {
        &self.defaults
    }

    async fn free(&self) -> Result<()> {
        self.pool.clear();
        Ok(())
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let mut request = self.request_for(&req.options);
        request.messages = req.messages;
        let generated = self.generate(RpcCall::Chat(request), &req.options).await?;

        let mut choice = Choice::message(generated.text);
        choice.finish_reason = generated.finish_reason.or(choice.finish_reason);
        let mut resp = ChatResponse::new(self.name.clone(), vec![choice]);
        resp.usage = generated.usage;
        Ok(resp)
    }

    async fn completion(&self, req: CompletionRequest) -> Result<CompletionResponse> {
        if req.options.prompts.is_empty() {
            return Err(Error::protocol("prompt must not be empty"));
        }
        let mut choices = Vec::with_capacity(req.options.prompts.len());
        let mut usage = Usage::default();
        for (i, prompt) in req.options.prompts.iter().enumerate() {
            let mut request = self.request_for(&req.options);
            request.prompt = prompt.clone();
            let generated = self.generate(RpcCall::Completion(request), &req.options).await?;
            usage.add(&generated.usage);
            let mut choice = Choice::text(generated.text).with_index(i as u32);
            choice.finish_reason = generated.finish_reason.or(choice.finish_reason);
            choices.push(choice);
        }
        let mut resp = CompletionResponse::new(self.name.clone(), choices);
        resp.usage = usage;
        Ok(resp)
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let call = RpcCall::Embeddings(EmbeddingsCall {
            model: self.upstream_model.clone(),
            input: req.options.inputs,
        });
        let (host, mut channel) = self.open(&call).await?;
        let reply: EmbeddingsReply = self.read_reply(&host, &mut channel).await?;
        if reply.error_code != 0 {
            return Err(Error::inference(
                self.name.as_str(),
                reply.error_code,
                reply.message,
            ));
        }
        self.pool.checkin(&host, channel);

        let data = reply
            .embeddings
            .into_iter()
            .enumerate()
            .map(|(i, v)| EmbeddingData::new(i as u32, v))
            .collect();
        let mut resp = EmbeddingsResponse::new(self.name.clone(), data);
        resp.usage = reply.usage.unwrap_or_default();
        Ok(resp)
    }
}
