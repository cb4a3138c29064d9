//! 推理后端抽象层 — 本地引擎、远程 RPC 与远程 REST 共享同一能力集合
//!
//! Backend abstraction. Every configured model is served through `Arc<dyn Backend>`,
//! so the registry, chains and the gateway never care which variant they talk to:
//!
//! - [`NativeBackend`]: an in-process engine behind the [`NativeEngine`] trait,
//!   one generation at a time.
//! - [`RpcBackend`]: a remote model service reached over persistent framed TCP channels.
//! - [`RestBackend`]: a remote OpenAI-compatible HTTP service.

pub mod native;
pub mod rest;
pub mod rpc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ModelDescriptor;
use crate::options::{EffectiveOptions, GenerationDefaults};
use crate::prompts::{PromptRenderer, TemplateStore};
use crate::types::request::{ChatRequest, CompletionRequest, EmbeddingsRequest};
use crate::types::response::{ChatResponse, CompletionResponse, EmbeddingsResponse};
use crate::{Error, ErrorContext, Result};

pub use native::{
    EngineFailure, EngineLoader, EngineParams, NativeBackend, NativeEngine, TokenCallback,
};
pub use rest::RestBackend;
pub use rpc::RpcBackend;

/// The capability set every backend variant provides.
///
/// The trait is object-safe; the registry stores `Arc<dyn Backend>` and hands out clones.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Configured model name.
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Generation defaults from the model descriptor.
    fn defaults(&self) -> &GenerationDefaults;

    /// Release engine handles or channels. Called once at shutdown.
    async fn free(&self) -> Result<()>;

    /// Single-turn convenience: one user message, message contents concatenated.
    async fn call(&self, prompt: &str) -> Result<String> {
        let options = EffectiveOptions::from_defaults(self.defaults());
        let resp = self
            .chat(ChatRequest::single_turn(self.name(), prompt, options))
            .await?;
        Ok(resp.content())
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    async fn completion(&self, req: CompletionRequest) -> Result<CompletionResponse>;

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse>;
}

/// Which variant serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[serde(alias = "llamacpp", alias = "llama.cpp")]
    Native,
    #[serde(alias = "local", alias = "grpc")]
    Rpc,
    #[serde(alias = "openai")]
    Rest,
}

const REST_PREFIXES: &[&str] = &["gpt-4", "gpt-3.5-turbo", "text-", "code-"];
const REST_NAMES: &[&str] = &["ada", "babbage", "curie", "davinci"];
const NATIVE_NAMES: &[&str] = &["ggml-llama-7b", "ggml-llama-13b", "ggml-vicuna-13b"];

impl BackendKind {
    /// Kind implied by a well-known model name, if any.
    pub fn infer(model: &str) -> Option<Self> {
        if NATIVE_NAMES.contains(&model) || model.starts_with("ggml-") {
            return Some(BackendKind::Native);
        }
        if REST_NAMES.contains(&model) || REST_PREFIXES.iter().any(|p| model.starts_with(p)) {
            return Some(BackendKind::Rest);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Rpc => "rpc",
            BackendKind::Rest => "rest",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds backends from model descriptors.
///
/// Native models need an [`EngineLoader`]; relative model files resolve against `model_path`.
#[derive(Clone)]
pub struct BackendFactory {
    model_path: PathBuf,
    engine_loader: Option<Arc<dyn EngineLoader>>,
    renderer: Arc<dyn PromptRenderer>,
}

impl fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendFactory")
            .field("model_path", &self.model_path)
            .field("engine_loader", &self.engine_loader.is_some())
            .finish()
    }
}

impl BackendFactory {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            engine_loader: None,
            renderer: Arc::new(TemplateStore::new()),
        }
    }

    pub fn with_engine_loader(mut self, loader: Arc<dyn EngineLoader>) -> Self {
        self.engine_loader = Some(loader);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PromptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub async fn create(&self, desc: &ModelDescriptor) -> Result<Arc<dyn Backend>> {
        let backend: Arc<dyn Backend> = match desc.resolved_kind()? {
            BackendKind::Native => {
                let loader = self.engine_loader.clone().ok_or_else(|| {
                    Error::configuration_with_context(
                        format!("model '{}' needs a native engine but none is linked", desc.name),
                        ErrorContext::new()
                            .with_field_path(format!("models.{}.kind", desc.name))
                            .with_source("backend_factory"),
                    )
                })?;
                Arc::new(
                    NativeBackend::load(desc, &self.model_path, loader, self.renderer.clone())
                        .await?,
                )
            }
            BackendKind::Rpc => Arc::new(RpcBackend::from_descriptor(desc)?),
            BackendKind::Rest => Arc::new(RestBackend::from_descriptor(desc)?),
        };
        Ok(backend)
    }
}
