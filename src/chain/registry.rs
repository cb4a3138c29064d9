//! Chain registry.

use super::{BaseChain, Chain, TemplateChain, BASE_CHAT_CHAIN};
use crate::prompts::PromptRenderer;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a fresh, unbound chain instance.
pub type ChainConstructor = Arc<dyn Fn() -> Box<dyn Chain> + Send + Sync>;

/// Chain name to constructor. Built at startup and read-only afterwards.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    constructors: HashMap<String, ChainConstructor>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `base_chat_chain` registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            BASE_CHAT_CHAIN,
            Arc::new(|| Box::new(BaseChain::new()) as Box<dyn Chain>),
        );
        registry
    }

    /// Register a constructor. A later registration under the same name replaces the
    /// earlier one.
    pub fn register(&mut self, name: impl Into<String>, constructor: ChainConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn register_template(
        &mut self,
        name: impl Into<String>,
        template: impl Into<String>,
        renderer: Arc<dyn PromptRenderer>,
    ) {
        let name = name.into();
        let template = template.into();
        let chain_name = name.clone();
        self.register(
            name,
            Arc::new(move || {
                let chain =
                    TemplateChain::new(chain_name.clone(), template.clone(), renderer.clone());
                Box::new(chain) as Box<dyn Chain>
            }),
        );
    }

    /// A new instance of the named chain, or `None` when unknown.
    pub fn create(&self, name: &str) -> Option<Box<dyn Chain>> {
        self.constructors.get(name).map(|c| c())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl std::fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRegistry").field("chains", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::TemplateStore;
    use crate::types::message::ChatMessage;

    #[test]
    fn defaults_include_base_chat_chain() {
        let registry = ChainRegistry::with_defaults();
        let chain = registry.create(BASE_CHAT_CHAIN).unwrap();
        assert_eq!(chain.name(), BASE_CHAT_CHAIN);
        assert_eq!(chain.prompt("same").unwrap(), "same");
        assert!(registry.create("nope").is_none());
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let store: Arc<dyn PromptRenderer> =
            Arc::new(TemplateStore::new().with_template("shout", "{{.input}}!"));
        let mut registry = ChainRegistry::with_defaults();
        registry.register_template(BASE_CHAT_CHAIN, "shout", store);
        assert_eq!(registry.len(), 1);
        let chain = registry.create(BASE_CHAT_CHAIN).unwrap();
        assert_eq!(chain.prompt("hi").unwrap(), "hi!");
    }

    #[test]
    fn template_chain_rewrites_only_last_user_message() {
        let store: Arc<dyn PromptRenderer> =
            Arc::new(TemplateStore::new().with_template("qa", "Q: {{.input}}"));
        let mut registry = ChainRegistry::new();
        registry.register_template("qa_chain", "qa", store);
        let chain = registry.create("qa_chain").unwrap();

        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ];
        let out = chain.chat_prompt(messages.clone()).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[..3], messages[..3]);
        assert_eq!(out[3], ChatMessage::user("Q: second"));
    }

    #[test]
    fn each_create_is_a_fresh_instance() {
        let registry = ChainRegistry::with_defaults();
        let a = registry.create(BASE_CHAT_CHAIN).unwrap();
        let b = registry.create(BASE_CHAT_CHAIN).unwrap();
        let pa = &*a as *const dyn Chain as *const u8;
        let pb = &*b as *const dyn Chain as *const u8;
        assert_ne!(pa, pb);
    }
}
