//! Error payloads that cross context boundaries, and framing errors.

use serde::{Deserialize, Serialize};

/// Error reported by a remote context (field frame or popup).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    #[serde(default)]
    pub message: String,
    /// Offending field names, when the error concerns specific fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// A cross-context frame could not be decoded into a message.
#[derive(Debug, thiserror::Error)]
pub enum MessageDecodeError {
    #[error("frame is neither an object nor a relay string")]
    UnsupportedFrame,

    #[error("relay frame is missing its event name")]
    MissingRelayEvent,

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}
