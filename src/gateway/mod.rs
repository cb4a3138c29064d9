//! 网关入口 — 接收统一请求，解析模型与链，选择同步 / N 次 / 流式路径
//!
//! Gateway boundary. [`Gateway`] takes a [`UnifiedRequest`], resolves the model (and
//! optional chain) through the [`ModelRegistry`], merges generation options, and runs
//! the backend once per choice or behind the [`StreamMultiplexer`].
//!
//! Request-time failures come back as [`Error`]; the transport layer turns them into
//! an [`ErrorResponse`](crate::types::ErrorResponse) with [`Error::to_response`].

mod state;

pub use state::{RequestPhase, RequestTrace};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendFactory, EngineLoader};
use crate::chain::ChainRegistry;
use crate::config::GatewayConfig;
use crate::options::merge;
use crate::prompts::{PromptRenderer, TemplateStore};
use crate::registry::ModelRegistry;
use crate::stream::{compute_choices, EventStream, StreamMultiplexer};
use crate::transport::encode_event;
use crate::types::events::{ChatChunk, StreamEvent};
use crate::types::request::{ChatRequest, CompletionRequest, EmbeddingsRequest, UnifiedRequest};
use crate::types::response::{
    completion_id, unix_now, ChatResponse, CompletionResponse, EmbeddingsResponse, ModelList,
};
use crate::{Error, ErrorContext, Result};

/// Operations exposed to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Chat,
    Completion,
    Embeddings,
    Models,
}

/// Path to endpoint table. Unprefixed aliases are kept for older clients.
pub const ROUTES: &[(&str, Endpoint)] = &[
    ("/v1/chat/completions", Endpoint::Chat),
    ("/chat/completions", Endpoint::Chat),
    ("/v1/completions", Endpoint::Completion),
    ("/completions", Endpoint::Completion),
    ("/v1/embeddings", Endpoint::Embeddings),
    ("/embeddings", Endpoint::Embeddings),
    ("/v1/models", Endpoint::Models),
    ("/models", Endpoint::Models),
];

impl Endpoint {
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };
        ROUTES.iter().find(|(p, _)| *p == path).map(|(_, e)| *e)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Chat => "chat",
            Endpoint::Completion => "completion",
            Endpoint::Embeddings => "embeddings",
            Endpoint::Models => "models",
        }
    }
}

/// Result of a generation request: a full response, or a token stream.
#[derive(Debug)]
pub enum GatewayReply<T> {
    Complete(T),
    Stream(ChatStream),
}

impl<T> GatewayReply<T> {
    pub fn is_stream(&self) -> bool {
        matches!(self, GatewayReply::Stream(_))
    }

    pub fn into_complete(self) -> Option<T> {
        match self {
            GatewayReply::Complete(t) => Some(t),
            GatewayReply::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<ChatStream> {
        match self {
            GatewayReply::Complete(_) => None,
            GatewayReply::Stream(s) => Some(s),
        }
    }
}

impl<T: Serialize> GatewayReply<T> {
    fn into_json(self) -> Result<GatewayReply<Value>> {
        Ok(match self {
            GatewayReply::Complete(body) => GatewayReply::Complete(serde_json::to_value(body)?),
            GatewayReply::Stream(s) => GatewayReply::Stream(s),
        })
    }
}

/// A streaming reply: deltas in emission order, then one terminal event.
///
/// Every chunk of the stream shares `id`, `model` and `created`.
pub struct ChatStream {
    pub id: String,
    pub model: String,
    pub created: u64,
    events: EventStream,
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("created", &self.created)
            .finish()
    }
}

impl ChatStream {
    fn new(mut trace: RequestTrace, model: String, events: EventStream) -> Self {
        let id = trace.id().to_string();
        let events = events
            .map(move |event| {
                let next = if event.is_terminal() {
                    RequestPhase::Terminal
                } else {
                    RequestPhase::Emitting
                };
                trace.advance(next);
                event
            })
            .boxed();
        Self {
            id,
            model,
            created: unix_now(),
            events,
        }
    }

    pub fn into_events(self) -> EventStream {
        self.events
    }

    /// `chat.completion.chunk` bodies, one per event.
    pub fn into_chunks(self) -> BoxStream<'static, ChatChunk> {
        let Self {
            id,
            model,
            created,
            events,
        } = self;
        events
            .map(move |event| event.into_chunk(&id, &model, created))
            .boxed()
    }

    /// Chunks framed as server-sent events.
    pub fn into_sse(self) -> BoxStream<'static, Result<Bytes>> {
        self.into_chunks().map(|chunk| encode_event(&chunk)).boxed()
    }
}

impl Stream for ChatStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

/// Records a failure on the trace before handing the error back.
fn traced<T>(trace: &mut RequestTrace, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        trace.fail(e);
    }
    result
}

fn empty_field(field: &str) -> Error {
    Error::protocol_with_context(
        format!("field '{}' must not be empty", field),
        ErrorContext::new().with_field_path(field).with_source("gateway"),
    )
}

/// Dispatch boundary shared by every transport.
#[derive(Debug, Clone)]
pub struct Gateway {
    registry: Arc<ModelRegistry>,
    chains: Arc<ChainRegistry>,
}

impl Gateway {
    pub fn new(registry: ModelRegistry, chains: ChainRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            chains: Arc::new(chains),
        }
    }

    /// Load templates and every configured model, then register configured chains.
    ///
    /// A missing prompt directory is not an error; any model failing to load is.
    pub async fn from_config(
        config: &GatewayConfig,
        engine_loader: Option<Arc<dyn EngineLoader>>,
    ) -> Result<Self> {
        let store = load_templates(&config.prompt_path)?;
        let renderer: Arc<dyn PromptRenderer> = Arc::new(store);

        let mut factory = BackendFactory::new(&config.model_path).with_renderer(renderer.clone());
        if let Some(loader) = engine_loader {
            factory = factory.with_engine_loader(loader);
        }
        let registry = ModelRegistry::load(&config.models, &factory).await?;

        let mut chains = ChainRegistry::with_defaults();
        for chain in &config.chains {
            chains.register_template(chain.name.clone(), chain.template.clone(), renderer.clone());
        }
        info!(
            models = registry.len(),
            chains = chains.len(),
            "gateway ready"
        );
        Ok(Self::new(registry, chains))
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    /// Dispatch a chat request.
    pub async fn chat(&self, req: UnifiedRequest) -> Result<GatewayReply<ChatResponse>> {
        self.chat_with_cancel(req, CancellationToken::new()).await
    }

    /// Like [`Gateway::chat`]; cancelling `cancel` stops a streaming generation.
    pub async fn chat_with_cancel(
        &self,
        mut req: UnifiedRequest,
        cancel: CancellationToken,
    ) -> Result<GatewayReply<ChatResponse>> {
        let mut trace = RequestTrace::new(completion_id("chatcmpl"), "chat", req.model.clone());

        let messages = traced(&mut trace, req.expect_messages())?;
        if messages.is_empty() {
            return traced(&mut trace, Err(empty_field("messages")));
        }
        let backend = traced(
            &mut trace,
            self.registry.dispatch(&req.model, req.chain.as_deref(), &self.chains),
        )?;
        trace.advance(RequestPhase::Resolved);

        let options = merge(backend.defaults(), &req.overrides, None, None, None);
        trace.advance(RequestPhase::OptionsBuilt);
        trace.advance(RequestPhase::Dispatched);

        if req.stream {
            let model = req.model.clone();
            let events = StreamMultiplexer::spawn(cancel, move |sink| async move {
                let req = ChatRequest::new(model, messages, options.with_sink(sink));
                backend.chat(req).await.map(|_| ())
            });
            let events = traced(&mut trace, events.await)?;
            return Ok(GatewayReply::Stream(ChatStream::new(trace, req.model, events)));
        }

        let generated = compute_choices(req.choice_count(), |_| {
            let backend = backend.clone();
            let call = ChatRequest::new(req.model.clone(), messages.clone(), options.clone());
            async move { backend.chat(call).await }
        })
        .await;
        let generated = traced(&mut trace, generated)?;

        let mut resp = ChatResponse::new(req.model, generated.choices);
        resp.id = trace.id().to_string();
        resp.usage = generated.usage;
        trace.advance(RequestPhase::Completed);
        Ok(GatewayReply::Complete(resp))
    }

    /// Dispatch a text completion request.
    pub async fn completion(
        &self,
        req: UnifiedRequest,
    ) -> Result<GatewayReply<CompletionResponse>> {
        self.completion_with_cancel(req, CancellationToken::new()).await
    }

    pub async fn completion_with_cancel(
        &self,
        mut req: UnifiedRequest,
        cancel: CancellationToken,
    ) -> Result<GatewayReply<CompletionResponse>> {
        let mut trace = RequestTrace::new(completion_id("cmpl"), "completion", req.model.clone());

        let prompt = traced(&mut trace, req.expect_prompt())?;
        if prompt.is_empty() {
            return traced(&mut trace, Err(empty_field("prompt")));
        }
        let backend = traced(
            &mut trace,
            self.registry.dispatch(&req.model, req.chain.as_deref(), &self.chains),
        )?;
        trace.advance(RequestPhase::Resolved);

        let options = merge(backend.defaults(), &req.overrides, Some(prompt), None, None);
        trace.advance(RequestPhase::OptionsBuilt);
        trace.advance(RequestPhase::Dispatched);

        if req.stream {
            let model = req.model.clone();
            let events = StreamMultiplexer::spawn(cancel, move |sink| async move {
                let req = CompletionRequest::new(model, options.with_sink(sink));
                backend.completion(req).await.map(|_| ())
            });
            let events = traced(&mut trace, events.await)?;
            return Ok(GatewayReply::Stream(ChatStream::new(trace, req.model, events)));
        }

        let generated = compute_choices(req.choice_count(), |_| {
            let backend = backend.clone();
            let call = CompletionRequest::new(req.model.clone(), options.clone());
            async move { backend.completion(call).await }
        })
        .await;
        let generated = traced(&mut trace, generated)?;

        let mut resp = CompletionResponse::new(req.model, generated.choices);
        resp.id = trace.id().to_string();
        resp.usage = generated.usage;
        trace.advance(RequestPhase::Completed);
        Ok(GatewayReply::Complete(resp))
    }

    /// Dispatch an embeddings request. Always answered in full.
    pub async fn embeddings(&self, mut req: UnifiedRequest) -> Result<EmbeddingsResponse> {
        let mut trace = RequestTrace::new(completion_id("emb"), "embeddings", req.model.clone());

        let input = traced(&mut trace, req.expect_input())?;
        let backend = traced(
            &mut trace,
            self.registry.dispatch(&req.model, req.chain.as_deref(), &self.chains),
        )?;
        trace.advance(RequestPhase::Resolved);

        let options = merge(backend.defaults(), &req.overrides, None, Some(input), None);
        if options.inputs.is_empty() {
            return traced(&mut trace, Err(empty_field("input")));
        }
        trace.advance(RequestPhase::OptionsBuilt);
        trace.advance(RequestPhase::Dispatched);

        let resp = backend
            .embeddings(EmbeddingsRequest::new(req.model.clone(), options))
            .await;
        let resp = traced(&mut trace, resp)?;
        trace.advance(RequestPhase::Completed);
        Ok(resp)
    }

    /// Every configured model, sorted by id.
    pub fn list_models(&self) -> ModelList {
        ModelList::from_names(self.registry.list())
    }

    /// Parse `body` and run it against `endpoint`, with complete replies as JSON.
    pub async fn handle(&self, endpoint: Endpoint, body: &[u8]) -> Result<GatewayReply<Value>> {
        match endpoint {
            Endpoint::Models => Ok(GatewayReply::Complete(serde_json::to_value(
                self.list_models(),
            )?)),
            Endpoint::Chat => self.chat(UnifiedRequest::from_json(body)?).await?.into_json(),
            Endpoint::Completion => self
                .completion(UnifiedRequest::from_json(body)?)
                .await?
                .into_json(),
            Endpoint::Embeddings => {
                let resp = self.embeddings(UnifiedRequest::from_json(body)?).await?;
                Ok(GatewayReply::Complete(serde_json::to_value(resp)?))
            }
        }
    }

    /// Free every backend.
    pub async fn shutdown(&self) {
        info!(models = self.registry.len(), "gateway shutting down");
        self.registry.free().await;
    }
}

fn load_templates(dir: &Path) -> Result<TemplateStore> {
    if dir.is_dir() {
        let store = TemplateStore::load_dir(dir)?;
        info!(path = %dir.display(), templates = store.len(), "prompt templates loaded");
        Ok(store)
    } else {
        warn!(path = %dir.display(), "prompt directory not found, no templates loaded");
        Ok(TemplateStore::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendKind};
    use crate::chain::BASE_CHAT_CHAIN;
    use crate::options::GenerationDefaults;
    use crate::types::message::ChatMessage;
    use crate::types::response::{Choice, EmbeddingData};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Echo {
        defaults: GenerationDefaults,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Backend for Echo {
        fn name(&self) -> &str {
            "echo"
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
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let last = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            if let Some(sink) = &req.options.sink {
                for word in last.split(' ') {
                    if !sink.emit(word).await {
                        break;
                    }
                }
            }
            Ok(ChatResponse::new(&req.model, vec![Choice::message(format!("{}#{}", last, n))]))
        }
        async fn completion(&self, req: CompletionRequest) -> Result<CompletionResponse> {
            let choices = req
                .options
                .prompts
                .iter()
                .map(|p| Choice::text(p.to_uppercase()))
                .collect();
            Ok(CompletionResponse::new(&req.model, choices))
        }
        async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
            let data = req
                .options
                .inputs
                .iter()
                .enumerate()
                .map(|(i, s)| EmbeddingData::new(i as u32, vec![s.len() as f32]))
                .collect();
            Ok(EmbeddingsResponse::new(&req.model, data))
        }
    }

    fn gateway() -> Gateway {
        let registry = ModelRegistry::from_backends(vec![Arc::new(Echo::default())]).unwrap();
        Gateway::new(registry, ChainRegistry::with_defaults())
    }

    #[test]
    fn routes_resolve_with_and_without_prefix() {
        assert_eq!(Endpoint::from_path("/v1/chat/completions"), Some(Endpoint::Chat));
        assert_eq!(Endpoint::from_path("/completions/"), Some(Endpoint::Completion));
        assert_eq!(Endpoint::from_path("/v1/models?x=1"), Some(Endpoint::Models));
        assert_eq!(Endpoint::from_path("/v1/unknown"), None);
    }

    #[tokio::test]
    async fn chat_n_choices_share_one_id() {
        let req = UnifiedRequest::chat("echo", vec![ChatMessage::user("hi")]).with_n(3);
        let resp = gateway().chat(req).await.unwrap().into_complete().unwrap();
        let texts: Vec<_> = resp.choices.iter().map(|c| c.content().to_string()).collect();
        assert_eq!(texts, ["hi#0", "hi#1", "hi#2"]);
        assert!(resp.id.starts_with("chatcmpl-"));
    }

    #[tokio::test]
    async fn chat_through_base_chain_is_transparent() {
        let gw = gateway();
        let plain = UnifiedRequest::chat("echo", vec![ChatMessage::user("q")]);
        let chained = plain.clone().with_chain(BASE_CHAT_CHAIN);
        let a = gw.chat(plain).await.unwrap().into_complete().unwrap();
        let b = gw.chat(chained).await.unwrap().into_complete().unwrap();
        assert_eq!(
            a.content().trim_end_matches(char::is_numeric),
            b.content().trim_end_matches(char::is_numeric)
        );
    }

    #[tokio::test]
    async fn streaming_chat_yields_deltas_then_terminal() {
        let req = UnifiedRequest::chat("echo", vec![ChatMessage::user("a b c")]).with_stream(true);
        let stream = gateway().chat(req).await.unwrap().into_stream().unwrap();
        let id = stream.id.clone();
        let chunks: Vec<_> = stream.into_chunks().collect().await;
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.id == id));
        assert_eq!(chunks[3].choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn empty_messages_and_inputs_are_rejected() {
        let gw = gateway();
        let err = gw.chat(UnifiedRequest::chat("echo", vec![])).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let err = gw.embeddings(UnifiedRequest::embeddings("echo", "")).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn handle_routes_json_bodies() {
        let gw = gateway();
        let reply = gw
            .handle(Endpoint::Completion, br#"{"model":"echo","prompt":["a","b"]}"#)
            .await
            .unwrap()
            .into_complete()
            .unwrap();
        assert_eq!(reply["choices"][1]["text"], "B");
        assert_eq!(reply["choices"][1]["index"], 1);

        let models = gw.handle(Endpoint::Models, b"").await.unwrap().into_complete().unwrap();
        assert_eq!(models["data"][0]["id"], "echo");

        let body = br#"{"model":"nope","messages":[{"role":"user","content":"x"}]}"#;
        let err = gw
            .handle(Endpoint::Chat, body)
            .await
            .unwrap_err();
        assert_eq!(err.to_response().error.code, 1000);
    }
}
