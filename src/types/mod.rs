//! 类型系统模块：网关对外的 OpenAI 兼容数据类型。
//!
//! # Types Module
//!
//! Wire-level types shared by every backend and by the transport layer.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ChatMessage`] | Chat message with role and content |
//! | [`UnifiedRequest`] | Inbound OpenAI-compatible request, validated once at the boundary |
//! | [`PromptInput`] | String-or-list field normalized with [`PromptInput::into_vec`] |
//! | [`ChatRequest`] / [`CompletionRequest`] / [`EmbeddingsRequest`] | Typed backend requests |
//! | [`Choice`] | One generated alternative (message, delta or text) |
//! | [`StreamEvent`] | Delta or the single terminal marker of a stream |
//!
//! ## Example
//!
//! ```rust
//! use llm_chain_gateway::types::{ChatMessage, PromptInput};
//!
//! let user = ChatMessage::user("What's the weather?");
//! assert_eq!(PromptInput::from("hi").into_vec(), vec!["hi".to_string()]);
//! # let _ = user;
//! ```

pub mod events;
pub mod message;
pub mod request;
pub mod response;

pub use events::{ChatChunk, StreamEvent};
pub use message::{ChatMessage, Role};
pub use request::{
    ChatRequest, CompletionRequest, EmbeddingsRequest, PromptInput, RequestBody, UnifiedRequest,
};
pub use response::{
    ChatResponse, Choice, CompletionResponse, EmbeddingData, EmbeddingsResponse, ErrorBody,
    ErrorResponse, ModelCard, ModelList, Usage,
};
