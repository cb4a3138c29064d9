//! 提示词模板：占位符替换与按名称查找。
//!
//! Prompt templates. Placeholders are written `{{.name}}` or `{{ name }}`; rendering
//! fails when a referenced variable is missing. A [`TemplateStore`] holds named
//! templates, usually loaded from a directory of `*.tmpl` files, and is the default
//! [`PromptRenderer`].

use crate::{Error, ErrorContext, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*\.?([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

pub const TEMPLATE_EXTENSION: &str = "tmpl";

/// Variable most templates are rendered with.
pub const INPUT_VAR: &str = "input";

/// Anything that can render a named template with variables.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, name: &str, vars: &HashMap<String, String>) -> Result<String>;
}

/// One parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
    variables: Vec<String>,
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let mut variables: Vec<String> = Vec::new();
        for cap in PLACEHOLDER.captures_iter(&source) {
            let name = cap[1].to_string();
            if !variables.contains(&name) {
                variables.push(name);
            }
        }
        Self { source, variables }
    }

    /// Variables referenced by the template, in first-use order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn render(&self, vars: &HashMap<String, String>) -> Result<String> {
        if let Some(missing) = self.variables.iter().find(|v| !vars.contains_key(*v)) {
            return Err(Error::template_with_context(
                format!("field '{}' not set", missing),
                ErrorContext::new().with_field_path(missing.clone()),
            ));
        }
        Ok(PLACEHOLDER
            .replace_all(&self.source, |cap: &regex::Captures| {
                vars.get(&cap[1]).cloned().unwrap_or_default()
            })
            .into_owned())
    }

    /// Render with the single `input` variable.
    pub fn render_input(&self, input: &str) -> Result<String> {
        let mut vars = HashMap::new();
        vars.insert(INPUT_VAR.to_string(), input.to_string());
        self.render(&vars)
    }
}

/// Named templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<String, PromptTemplate>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.tmpl` file in `dir`; the file stem becomes the template name.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut store = Self::new();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::configuration_with_context(
                "cannot read prompt directory",
                ErrorContext::new()
                    .with_field_path("prompt_path")
                    .with_details(format!("{}: {}", dir.display(), e)),
            )
        })?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = std::fs::read_to_string(&path)?;
            debug!(template = name, "loaded prompt template");
            store.insert(name, source);
        }
        Ok(store)
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.templates
            .insert(name.into(), PromptTemplate::new(source));
    }

    pub fn with_template(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(name, source);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PromptTemplate> {
        let name = name
            .strip_suffix(&format!(".{}", TEMPLATE_EXTENSION))
            .unwrap_or(name);
        self.templates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl PromptRenderer for TemplateStore {
    fn render(&self, name: &str, vars: &HashMap<String, String>) -> Result<String> {
        let template = self.get(name).ok_or_else(|| {
            Error::template_with_context(
                format!("template '{}' not found", name),
                ErrorContext::new().with_source("template_store"),
            )
        })?;
        template.render(vars)
    }
}
