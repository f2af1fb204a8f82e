//! Error types for the client.
//!
//! Integration-time misuse (`ClientError`, `ConfigError`) is returned
//! synchronously. Runtime outcomes (`TokenError`, `FrameError`) are delivered
//! exactly once through the completion callback or frame event.

use securepay_shared::{ErrorPayload, FieldType};
use thiserror::Error;

/// Invalid client configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("public key is required")]
    MissingPublicKey,

    #[error("invalid API URL '{url}': {source}")]
    InvalidApiUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The API URL has no tuple origin (e.g. `data:` URLs), so cross-context
    /// messages could never be validated against it.
    #[error("API URL '{0}' has no usable origin")]
    OpaqueOrigin(String),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Synchronous misuse of the public lifecycle surface.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not configured")]
    NotConfigured,

    #[error("client has been destroyed")]
    Destroyed,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("frame could not be prepared: {0}")]
    Frame(#[from] FrameError),
}

/// One offending input in a validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub field: String,
    pub reason: String,
}

impl ValidationFailure {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failure reported by the HTTP collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server error {status}: {payload}")]
    Server { status: u16, payload: ErrorPayload },
}

/// Outcome delivered to a tokenization completion callback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TokenError {
    #[error("validation failed for: {}", field_names(.0).join(", "))]
    Validation(Vec<ValidationFailure>),

    #[error(transparent)]
    ConnectionOrServer(#[from] ApiError),

    /// The secure field context reported a failure.
    #[error("remote error: {0}")]
    Remote(ErrorPayload),

    #[error("secure fields are not ready")]
    NotReady,

    #[error("tokenization timed out")]
    Timeout,

    /// The owning client was destroyed before a reply arrived.
    #[error("tokenization was cancelled")]
    Cancelled,
}

impl TokenError {
    pub fn invalid_fields(fields: &[FieldType]) -> Self {
        TokenError::Validation(
            fields
                .iter()
                .map(|field| ValidationFailure::new(field.as_str(), "invalid"))
                .collect(),
        )
    }

    /// Names of the offending fields for a validation error.
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            TokenError::Validation(failures) => field_names(failures),
            _ => Vec::new(),
        }
    }
}

fn field_names(failures: &[ValidationFailure]) -> Vec<&str> {
    failures.iter().map(|f| f.field.as_str()).collect()
}

/// Failure of a popup transaction, surfaced as its error event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("frame error {code}: {message}")]
pub struct FrameError {
    pub code: String,
    pub message: String,
}

impl FrameError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<ErrorPayload> for FrameError {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            code: payload.code,
            message: payload.message,
        }
    }
}

/// A port could not deliver to or open a browsing context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("browsing context is closed")]
    Closed,

    #[error("popup was blocked by the browser")]
    Blocked,

    #[error("post failed: {0}")]
    Post(String),
}
