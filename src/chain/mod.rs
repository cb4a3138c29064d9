//! 提示词链：在请求到达后端之前改写提示词或消息。
//!
//! Prompt chains. A [`Chain`] rewrites the prompt (single-turn) or the message list
//! (chat) before the request reaches a backend. Wrapped in a [`ChainedBackend`] it is
//! itself a [`Backend`], so the rest of the pipeline cannot tell the difference.
//!
//! Chains are created per dispatch from constructors held by a [`ChainRegistry`].

mod base;
mod registry;
mod template;

pub use base::{BaseChain, BASE_CHAT_CHAIN};
pub use registry::{ChainConstructor, ChainRegistry};
pub use template::TemplateChain;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{Backend, BackendKind};
use crate::options::GenerationDefaults;
use crate::types::message::ChatMessage;
use crate::types::request::{ChatRequest, CompletionRequest, EmbeddingsRequest};
use crate::types::response::{ChatResponse, CompletionResponse, EmbeddingsResponse};
use crate::{Error, Result};

/// A prompt transformation bound to one backend.
pub trait Chain: Send + Sync {
    fn name(&self) -> &str;

    /// Bind the backend this chain serves. Called once, before any transform.
    fn with_llm(&mut self, llm: Arc<dyn Backend>);

    /// The bound backend, `None` until [`Chain::with_llm`] ran.
    fn llm(&self) -> Option<&Arc<dyn Backend>>;

    /// Rewrite a single-turn prompt.
    fn prompt(&self, input: &str) -> Result<String>;

    /// Rewrite a chat conversation. Roles and ordering must be preserved.
    fn chat_prompt(&self, messages: Vec<ChatMessage>) -> Result<Vec<ChatMessage>>;
}

/// A backend whose inputs pass through a chain first.
///
/// A failing transform aborts the call before the backend sees anything.
pub struct ChainedBackend {
    chain: Box<dyn Chain>,
    // Snapshot of the bound model; generation goes through `chain.llm()`.
    name: String,
    kind: BackendKind,
    defaults: GenerationDefaults,
}

impl std::fmt::Debug for ChainedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedBackend")
            .field("chain", &self.chain.name())
            .field("model", &self.name)
            .finish()
    }
}

impl ChainedBackend {
    pub fn new(mut chain: Box<dyn Chain>, llm: Arc<dyn Backend>) -> Self {
        let name = llm.name().to_string();
        let kind = llm.kind();
        let defaults = llm.defaults().clone();
        chain.with_llm(llm);
        Self {
            chain,
            name,
            kind,
            defaults,
        }
    }

    fn llm(&self) -> Result<&Arc<dyn Backend>> {
        self.chain.llm().ok_or_else(|| {
            Error::configuration(format!(
                "chain '{}' has no backend bound for '{}'",
                self.chain.name(),
                self.name
            ))
        })
    }
}

#[async_trait]
impl Backend for ChainedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn defaults(&self) -> &GenerationDefaults {
        &self.defaults
    }

    /// The registry owns the wrapped backend and frees it.
    async fn free(&self) -> Result<()> {
        Ok(())
    }

    async fn call(&self, prompt: &str) -> Result<String> {
        let prompt = self.chain.prompt(prompt)?;
        self.llm()?.call(&prompt).await
    }

    async fn chat(&self, mut req: ChatRequest) -> Result<ChatResponse> {
        req.messages = self.chain.chat_prompt(req.messages)?;
        debug!(chain = self.chain.name(), model = %self.name, "chat transformed");
        self.llm()?.chat(req).await
    }

    async fn completion(&self, mut req: CompletionRequest) -> Result<CompletionResponse> {
        req.options.prompts = req
            .options
            .prompts
            .iter()
            .map(|p| self.chain.prompt(p))
            .collect::<Result<Vec<_>>>()?;
        self.llm()?.completion(req).await
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        self.llm()?.embeddings(req).await
    }
}
