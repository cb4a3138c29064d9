use crate::types::response::{ErrorBody, ErrorResponse};
use thiserror::Error;

/// Error code carried in the response body for malformed requests.
pub const CODE_BAD_REQUEST: u32 = 400;
/// Error code carried in the response body when the model is not configured.
pub const CODE_MODEL_NOT_FOUND: u32 = 1000;
/// Error code for everything else.
pub const CODE_INTERNAL: u32 = 500;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "models[2].settings.hosts")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config", "prompt_template")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the gateway.
///
/// Startup failures surface as [`Error::Configuration`]; everything raised while
/// serving a request converts to an [`ErrorResponse`] through [`Error::to_response`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Backend '{backend}' unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    #[error("Inference failed on '{backend}' (code {code}): {message}")]
    Inference {
        backend: String,
        code: i32,
        message: String,
    },

    #[error("Template error: {message}{}", format_context(.context))]
    Template {
        message: String,
        context: ErrorContext,
    },

    #[error("Invalid request: {message}{}", format_context(.context))]
    Protocol {
        message: String,
        context: ErrorContext,
    },

    #[error("Remote error: HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Network transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::configuration_with_context(msg, ErrorContext::new())
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::protocol_with_context(msg, ErrorContext::new())
    }

    /// Create a new request validation error with structured context
    pub fn protocol_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Protocol {
            message: msg.into(),
            context,
        }
    }

    pub fn template_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Template {
            message: msg.into(),
            context,
        }
    }

    pub fn model_not_found(model: impl Into<String>) -> Self {
        Error::ModelNotFound {
            model: model.into(),
        }
    }

    pub fn unavailable(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::BackendUnavailable {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    pub fn inference(backend: impl Into<String>, code: i32, msg: impl Into<String>) -> Self {
        Error::Inference {
            backend: backend.into(),
            code,
            message: msg.into(),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Template { context, .. }
            | Error::Protocol { context, .. } => Some(context),
            _ => None,
        }
    }

    /// HTTP status the transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Protocol { .. } | Error::Template { .. } => 400,
            Error::ModelNotFound { .. } => 404,
            Error::BackendUnavailable { .. } => 503,
            Error::Remote { .. } => 502,
            _ => 500,
        }
    }

    /// Code carried inside the error body.
    pub fn code(&self) -> u32 {
        match self {
            Error::Protocol { .. } | Error::Template { .. } => CODE_BAD_REQUEST,
            Error::ModelNotFound { .. } => CODE_MODEL_NOT_FOUND,
            _ => CODE_INTERNAL,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Error::Protocol { .. } | Error::Template { .. } => "invalid_request_error",
            Error::ModelNotFound { .. } => "model_not_found",
            Error::BackendUnavailable { .. } | Error::Transport(_) => "backend_unavailable",
            Error::Inference { .. } | Error::Remote { .. } => "inference_error",
            _ => "server_error",
        }
    }

    /// Convert a request-time error into the OpenAI-style error envelope.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
                r#type: self.kind().to_string(),
            },
        }
    }
}
