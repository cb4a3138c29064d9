//! Gateway configuration.
//!
//! Loaded from YAML, then adjusted from the environment:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `GATEWAY_API_ADDR` | `api_addr` |
//! | `GATEWAY_LOG_LEVEL` | `log_level` |
//! | `GATEWAY_MODEL_PATH` | `model_path` |
//! | `GATEWAY_PROMPT_PATH` | `prompt_path` |
//!
//! ```yaml
//! api_addr: 0.0.0.0:8080
//! model_path: ./models
//! models:
//!   - name: gpt-3.5-turbo
//!     settings: { api_key: sk-..., base_url: https://api.openai.com/v1 }
//!   - name: ggml-vicuna-13b
//!     settings: { model_file: vicuna-13b.bin, template: vicuna }
//!     parameters: { temperature: 0.7, stopwords: ["User:"] }
//!   - name: chatglm2-6b
//!     kind: rpc
//!     settings: { hosts: ["10.0.0.5:50051"] }
//! chains:
//!   - name: qa_chain
//!     template: qa
//! ```

use crate::backend::BackendKind;
use crate::options::GenerationDefaults;
use crate::{Error, ErrorContext, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_MODEL_PATH: &str = "./models";
pub const DEFAULT_PROMPT_PATH: &str = "./prompts";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// One configured model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    /// Explicit backend kind; inferred from well-known names when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<BackendKind>,
    /// Backend-specific settings, parsed by the chosen variant.
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub parameters: GenerationDefaults,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            settings: Map::new(),
            parameters: GenerationDefaults::default(),
        }
    }

    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn with_parameters(mut self, parameters: GenerationDefaults) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn resolved_kind(&self) -> Result<BackendKind> {
        self.kind
            .or_else(|| BackendKind::infer(&self.name))
            .ok_or_else(|| {
                Error::configuration_with_context(
                    format!("cannot tell which backend serves '{}'", self.name),
                    ErrorContext::new()
                        .with_field_path(format!("models.{}.kind", self.name))
                        .with_details("set kind to native, rpc or rest"),
                )
            })
    }

    /// Parse the settings bag into the variant's typed settings.
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.settings.clone())).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid settings for '{}'", self.name),
                ErrorContext::new()
                    .with_field_path(format!("models.{}.settings", self.name))
                    .with_details(e.to_string()),
            )
        })
    }
}

/// A template-backed chain declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainDescriptor {
    pub name: String,
    pub template: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub api_addr: String,
    pub model_path: PathBuf,
    /// Directory of `*.tmpl` prompt templates.
    pub prompt_path: PathBuf,
    pub log_level: String,
    pub models: Vec<ModelDescriptor>,
    pub chains: Vec<ChainDescriptor>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            prompt_path: PathBuf::from(DEFAULT_PROMPT_PATH),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            models: Vec::new(),
            chains: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Read, apply env overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                "cannot read config file",
                ErrorContext::new()
                    .with_details(format!("{}: {}", path.display(), e))
                    .with_source("config"),
            )
        })?;
        let mut config = Self::from_yaml_str(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| {
            Error::configuration_with_context(
                "malformed config",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("config"),
            )
        })
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("GATEWAY_API_ADDR") {
            self.api_addr = v;
        }
        if let Ok(v) = env::var("GATEWAY_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = env::var("GATEWAY_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("GATEWAY_PROMPT_PATH") {
            self.prompt_path = PathBuf::from(v);
        }
    }

    /// Names unique, every kind resolvable, chain names unique.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (i, model) in self.models.iter().enumerate() {
            if model.name.trim().is_empty() {
                return Err(Error::configuration_with_context(
                    "model name must not be empty",
                    ErrorContext::new().with_field_path(format!("models[{}].name", i)),
                ));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(Error::configuration_with_context(
                    format!("duplicate model '{}'", model.name),
                    ErrorContext::new().with_field_path(format!("models[{}].name", i)),
                ));
            }
            model.resolved_kind()?;
        }

        let mut chains = HashSet::new();
        for (i, chain) in self.chains.iter().enumerate() {
            if !chains.insert(chain.name.as_str()) {
                return Err(Error::configuration_with_context(
                    format!("duplicate chain '{}'", chain.name),
                    ErrorContext::new().with_field_path(format!("chains[{}].name", i)),
                ));
            }
        }
        Ok(())
    }
}
