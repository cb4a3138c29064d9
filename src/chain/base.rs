use super::Chain;
use crate::backend::Backend;
use crate::types::message::ChatMessage;
use crate::Result;
use std::sync::Arc;

pub const BASE_CHAT_CHAIN: &str = "base_chat_chain";

/// Identity chain: prompts and messages pass through unchanged.
#[derive(Default)]
pub struct BaseChain {
    llm: Option<Arc<dyn Backend>>,
}

impl BaseChain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Chain for BaseChain {
    fn name(&self) -> &str {
        BASE_CHAT_CHAIN
    }

    fn with_llm(&mut self, llm: Arc<dyn Backend>) {
        self.llm = Some(llm);
    }

    fn llm(&self) -> Option<&Arc<dyn Backend>> {
        self.llm.as_ref()
    }

    fn prompt(&self, input: &str) -> Result<String> {
        Ok(input.to_string())
    }

    fn chat_prompt(&self, messages: Vec<ChatMessage>) -> Result<Vec<ChatMessage>> {
        Ok(messages)
    }
}
