//! In-process native inference backend.
//!
//! The engine itself (tokenizer, sampling, weights) sits behind [`NativeEngine`]; this
//! module owns the lifecycle around it. One generation runs at a time per backend: the
//! engine lives behind a mutex that is held for the whole call, streaming included.
//! Generation runs on a blocking thread, and streamed tokens reach the consumer through
//! a per-call callback that a scoped guard removes on every exit path.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::{Backend, BackendKind};
use crate::config::ModelDescriptor;
use crate::options::{EffectiveOptions, GenerationDefaults};
use crate::prompts::{PromptRenderer, TemplateStore, INPUT_VAR};
use crate::types::message::ChatMessage;
use crate::types::request::{ChatRequest, CompletionRequest, EmbeddingsRequest};
use crate::types::response::{
    ChatResponse, Choice, CompletionResponse, EmbeddingData, EmbeddingsResponse,
};
use crate::{Error, ErrorContext, Result};

/// Per-token callback; returning `false` asks the engine to stop.
pub type TokenCallback = Box<dyn FnMut(&str) -> bool + Send>;

/// Non-zero status reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub code: i32,
    pub message: String,
}

impl EngineFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Parameters the engine is loaded with.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParams {
    pub context_size: u32,
    pub gpu_layers: u32,
    pub mlock: bool,
    pub embeddings: bool,
    pub seed: i32,
    pub f16: bool,
    pub threads: i32,
}

/// A loaded model. Calls are synchronous and happen on a blocking thread.
pub trait NativeEngine: Send {
    fn set_token_callback(&mut self, callback: Option<TokenCallback>);

    /// Generate text for `prompt`; `options.max_tokens == 0` means unlimited.
    fn predict(
        &mut self,
        prompt: &str,
        options: &EffectiveOptions,
    ) -> std::result::Result<String, EngineFailure>;

    fn embed(
        &mut self,
        text: &str,
        options: &EffectiveOptions,
    ) -> std::result::Result<Vec<f32>, EngineFailure>;

    fn free(&mut self);
}

/// Opens model files.
pub trait EngineLoader: Send + Sync {
    fn load(
        &self,
        path: &Path,
        params: &EngineParams,
    ) -> std::result::Result<Box<dyn NativeEngine>, EngineFailure>;
}

/// `settings` block of a native model descriptor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NativeSettings {
    /// Model file, relative to the configured model directory. Defaults to the model name.
    #[serde(alias = "model")]
    pub model_file: String,
    pub context_size: u32,
    pub gpu_layers: u32,
    pub mlock: bool,
    pub embeddings: bool,
    pub f16: bool,
    pub threads: i32,
    /// Template applied to completion prompts (and chat, unless `chat_template` is set).
    pub template: Option<String>,
    pub chat_template: Option<String>,
    /// Prefix written before each message of a role when flattening a chat.
    pub roles: HashMap<String, String>,
}

impl Default for NativeSettings {
    fn default() -> Self {
        Self {
            model_file: String::new(),
            context_size: 512,
            gpu_layers: 0,
            mlock: false,
            embeddings: false,
            f16: false,
            threads: 4,
            template: None,
            chat_template: None,
            roles: HashMap::new(),
        }
    }
}

impl NativeSettings {
    fn engine_params(&self, defaults: &GenerationDefaults) -> EngineParams {
        EngineParams {
            context_size: self.context_size,
            gpu_layers: self.gpu_layers,
            mlock: self.mlock,
            embeddings: self.embeddings,
            seed: defaults.seed,
            f16: self.f16 || defaults.f16,
            threads: if defaults.threads != 0 {
                defaults.threads
            } else {
                self.threads
            },
        }
    }
}

type EngineSlot = Arc<Mutex<Option<Box<dyn NativeEngine>>>>;

pub struct NativeBackend {
    name: String,
    defaults: GenerationDefaults,
    settings: NativeSettings,
    engine: EngineSlot,
    renderer: Arc<dyn PromptRenderer>,
}

impl fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBackend")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Keeps a token callback installed for exactly one generation.
struct ScopedCallback<'a> {
    engine: &'a mut Box<dyn NativeEngine>,
}

impl<'a> ScopedCallback<'a> {
    fn install(engine: &'a mut Box<dyn NativeEngine>, callback: TokenCallback) -> Self {
        engine.set_token_callback(Some(callback));
        Self { engine }
    }

    fn engine(&mut self) -> &mut Box<dyn NativeEngine> {
        &mut *self.engine
    }
}

impl Drop for ScopedCallback<'_> {
    fn drop(&mut self) {
        self.engine.set_token_callback(None);
    }
}

impl NativeBackend {
    /// Wrap an already-loaded engine.
    pub fn new(name: impl Into<String>, engine: Box<dyn NativeEngine>) -> Self {
        Self {
            name: name.into(),
            defaults: GenerationDefaults::default(),
            settings: NativeSettings::default(),
            engine: Arc::new(Mutex::new(Some(engine))),
            renderer: Arc::new(TemplateStore::new()),
        }
    }

    pub fn with_defaults(mut self, defaults: GenerationDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_settings(mut self, settings: NativeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PromptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Load the model file named by the descriptor.
    pub async fn load(
        desc: &ModelDescriptor,
        model_path: &Path,
        loader: Arc<dyn EngineLoader>,
        renderer: Arc<dyn PromptRenderer>,
    ) -> Result<Self> {
        let settings: NativeSettings = desc.settings()?;
        let file = if settings.model_file.is_empty() {
            desc.name.as_str()
        } else {
            settings.model_file.as_str()
        };
        let path = model_path.join(file);
        if !path.is_file() {
            return Err(Error::configuration_with_context(
                format!("model file for '{}' not found", desc.name),
                ErrorContext::new()
                    .with_field_path(format!("models.{}.settings.model_file", desc.name))
                    .with_details(path.display().to_string()),
            ));
        }

        let params = settings.engine_params(&desc.parameters);
        let load_path = path.clone();
        let engine = tokio::task::spawn_blocking(move || loader.load(&load_path, &params))
            .await
            .map_err(|e| Error::configuration(format!("engine loader task failed: {}", e)))?
            .map_err(|f| {
                Error::configuration_with_context(
                    format!("failed to load model '{}': {}", desc.name, f.message),
                    ErrorContext::new()
                        .with_details(format!("engine status {}", f.code))
                        .with_source("native_engine"),
                )
            })?;

        info!(model = %desc.name, path = %path.display(), "native model loaded");
        Ok(Self::new(desc.name.clone(), engine)
            .with_defaults(desc.parameters.clone())
            .with_settings(settings)
            .with_renderer(renderer))
    }

    /// Run `f` against the engine on a blocking thread, holding the engine lock throughout.
    async fn run_engine<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Box<dyn NativeEngine>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = self.engine.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| Error::inference(name.as_str(), -1, "engine lock poisoned"))?;
            let engine = guard
                .as_mut()
                .ok_or_else(|| Error::unavailable(name.as_str(), "model has been freed"))?;
            f(engine)
        })
        .await
        .map_err(|e| {
            Error::inference(self.name.as_str(), -1, format!("engine task failed: {}", e))
        })?
    }

    fn flatten_chat(&self, messages: &[ChatMessage]) -> String {
        messages
            .iter()
            .map(|m| match self.settings.roles.get(m.role.as_str()) {
                Some(prefix) => format!("{} {}", prefix, m.content),
                None => m.content.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn apply_template(&self, template: Option<&str>, input: String) -> Result<String> {
        match template {
            Some(name) => {
                let mut vars = HashMap::new();
                vars.insert(INPUT_VAR.to_string(), input);
                self.renderer.render(name, &vars)
            }
            None => Ok(input),
        }
    }
}

fn predict_one(
    engine: &mut Box<dyn NativeEngine>,
    backend: &str,
    prompt: &str,
    options: &EffectiveOptions,
) -> Result<String> {
    let raw = match &options.sink {
        Some(sink) => {
            let sink = sink.clone();
            let mut scoped = ScopedCallback::install(
                engine,
                Box::new(move |token: &str| sink.emit_blocking(token)),
            );
            scoped.engine().predict(prompt, options)
        }
        None => engine.predict(prompt, options),
    };
    let text = raw.map_err(|f| Error::inference(backend, f.code, f.message))?;
    Ok(clean_output(&text, prompt, options))
}

/// Strip the artifacts engines leave around generated text.
fn clean_output(raw: &str, prompt: &str, options: &EffectiveOptions) -> String {
    let mut out = raw.strip_prefix(' ').unwrap_or(raw);
    if !options.echo && !prompt.is_empty() {
        out = out.strip_prefix(prompt).unwrap_or(out);
    }
    out = out.strip_prefix('\n').unwrap_or(out);
    for stop in options.stop.iter().filter(|s| !s.is_empty()) {
        out = out.strip_suffix(stop.as_str()).unwrap_or(out);
    }
    out.to_string()
}

fn trim_trailing_zeros(mut embedding: Vec<f32>) -> Vec<f32> {
    while embedding.last() == Some(&0.0) {
        embedding.pop();
    }
    embedding
}

#[async_trait]
impl Backend for NativeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn defaults(&self) -> &GenerationDefaults {
        &self.defaults
    }

    async fn free(&self) -> Result<()> {
        let slot = self.engine.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| Error::inference(name.as_str(), -1, "engine lock poisoned"))?;
            if let Some(mut engine) = guard.take() {
                engine.free();
                debug!(model = %name, "native engine released");
            }
            Ok(())
        })
        .await
        .map_err(|e| {
            Error::inference(self.name.as_str(), -1, format!("engine task failed: {}", e))
        })?
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let template = self
            .settings
            .chat_template
            .as_deref()
            .or(self.settings.template.as_deref());
        let prompt = self.apply_template(template, self.flatten_chat(&req.messages))?;
        let options = req.options;
        let name = self.name.clone();
        debug!(model = %self.name, streaming = options.sink.is_some(), "native chat");

        let text = self
            .run_engine(move |engine| predict_one(engine, &name, &prompt, &options))
            .await?;
        Ok(ChatResponse::new(self.name.clone(), vec![Choice::message(text)]))
    }

    async fn completion(&self, req: CompletionRequest) -> Result<CompletionResponse> {
        let options = req.options;
        if options.prompts.is_empty() {
            return Err(Error::protocol("prompt must not be empty"));
        }
        let prompts = options
            .prompts
            .iter()
            .map(|p| self.apply_template(self.settings.template.as_deref(), p.clone()))
            .collect::<Result<Vec<_>>>()?;
        let name = self.name.clone();

        let texts = self
            .run_engine(move |engine| {
                prompts
                    .iter()
                    .map(|p| predict_one(engine, &name, p, &options))
                    .collect::<Result<Vec<_>>>()
            })
            .await?;

        let choices = texts
            .into_iter()
            .enumerate()
            .map(|(i, t)| Choice::text(t).with_index(i as u32))
            .collect();
        Ok(CompletionResponse::new(self.name.clone(), choices))
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        if !self.settings.embeddings {
            warn!(model = %self.name, "embeddings requested from a model loaded without them");
            return Err(Error::protocol_with_context(
                format!("model '{}' does not serve embeddings", self.name),
                ErrorContext::new().with_field_path("model"),
            ));
        }
        let options = req.options;
        let name = self.name.clone();

        let vectors = self
            .run_engine(move |engine| {
                options
                    .inputs
                    .iter()
                    .map(|text| {
                        engine
                            .embed(text, &options)
                            .map(trim_trailing_zeros)
                            .map_err(|f| Error::inference(name.as_str(), f.code, f.message))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .await?;

        let data = vectors
            .into_iter()
            .enumerate()
            .map(|(i, v)| EmbeddingData::new(i as u32, v))
            .collect();
        Ok(EmbeddingsResponse::new(self.name.clone(), data))
    }
}
