use super::Chain;
use crate::backend::Backend;
use crate::prompts::{PromptRenderer, INPUT_VAR};
use crate::types::message::ChatMessage;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Renders a named template around the user's input.
///
/// For chat only the last user message is rewritten; every other message keeps its
/// role, content and position.
pub struct TemplateChain {
    name: String,
    template: String,
    renderer: Arc<dyn PromptRenderer>,
    llm: Option<Arc<dyn Backend>>,
}

impl TemplateChain {
    pub fn new(
        name: impl Into<String>,
        template: impl Into<String>,
        renderer: Arc<dyn PromptRenderer>,
    ) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            renderer,
            llm: None,
        }
    }
}

impl Chain for TemplateChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn with_llm(&mut self, llm: Arc<dyn Backend>) {
        self.llm = Some(llm);
    }

    fn llm(&self) -> Option<&Arc<dyn Backend>> {
        self.llm.as_ref()
    }

    fn prompt(&self, input: &str) -> Result<String> {
        let mut vars = HashMap::new();
        vars.insert(INPUT_VAR.to_string(), input.to_string());
        self.renderer.render(&self.template, &vars)
    }

    fn chat_prompt(&self, mut messages: Vec<ChatMessage>) -> Result<Vec<ChatMessage>> {
        if let Some(last_user) = messages.iter_mut().rev().find(|m| m.is_user()) {
            last_user.content = self.prompt(&last_user.content)?;
        }
        Ok(messages)
    }
}
