//! # llm-chain-gateway
//!
//! 统一的 OpenAI 兼容网关：本地推理、远程 RPC 与远程 REST 后端共享同一套生成接口。
//!
//! An OpenAI-compatible generation gateway over heterogeneous inference backends.
//!
//! ## Overview
//!
//! Every configured model is served by a [`backend::Backend`]: an in-process native
//! engine, a remote RPC model service or a remote OpenAI-compatible REST service.
//! Requests may pass through a prompt-transformation [`chain::Chain`] before they
//! reach the backend. Synchronous, N-completion and token-streaming generation all
//! share the same observable contract.
//!
//! ## Request flow
//!
//! 1. [`registry::ModelRegistry`] resolves the model name (and optional chain) to a backend.
//! 2. [`options::merge`] combines the model defaults with the request overrides.
//! 3. The backend runs once, N times via [`stream::compute_choices`], or behind the
//!    [`stream::StreamMultiplexer`] which turns per-token emission into an ordered stream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use llm_chain_gateway::config::GatewayConfig;
//! use llm_chain_gateway::gateway::{Gateway, GatewayReply};
//! use llm_chain_gateway::UnifiedRequest;
//!
//! #[tokio::main]
//! async fn main() -> llm_chain_gateway::Result<()> {
//!     let config = GatewayConfig::load("gateway.yaml")?;
//!     let gateway = Gateway::from_config(&config, None).await?;
//!
//!     let request = UnifiedRequest::from_json(
//!         br#"{"model": "gpt-3.5-turbo", "messages": [{"role": "user", "content": "Hello"}]}"#,
//!     )?;
//!     if let GatewayReply::Complete(resp) = gateway.chat(request).await? {
//!         println!("{}", resp.content());
//!     }
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`backend`] | Backend capability trait and the native / RPC / REST variants |
//! | [`chain`] | Prompt-transformation chains and the chain registry |
//! | [`config`] | YAML gateway configuration and model descriptors |
//! | [`gateway`] | Request dispatch boundary and per-request state machine |
//! | [`options`] | Generation defaults, request overrides and the merge rule |
//! | [`prompts`] | Placeholder templates and the template store |
//! | [`registry`] | Model registry: load, resolve, dispatch, free |
//! | [`stream`] | Token sink, stream multiplexer and N-completion loop |
//! | [`transport`] | SSE encoding and decoding |
//! | [`types`] | Wire types (messages, requests, responses, stream events) |

pub mod backend;
pub mod chain;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod options;
pub mod prompts;
pub mod registry;
pub mod stream;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use backend::{Backend, BackendKind};
pub use chain::{Chain, ChainRegistry};
pub use gateway::{Gateway, GatewayReply};
pub use options::{merge, EffectiveOptions, GenerationDefaults, GenerationOverrides};
pub use registry::ModelRegistry;
pub use stream::{StreamMultiplexer, TokenSink};
pub use types::{
    events::StreamEvent,
    message::{ChatMessage, Role},
    request::{PromptInput, UnifiedRequest},
};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
