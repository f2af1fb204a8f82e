//! Tokenization and readiness payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorPayload;
use crate::fields::FieldType;
use crate::ids::CorrelationId;

/// Body of `token:init`: the sensitive submission is performed by the field
/// context, which replies on `token:done:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInit {
    pub id: CorrelationId,
    pub inputs: Map<String, Value>,
}

/// A token returned by the payment API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Token {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
        }
    }
}

/// Body of `token:done:<id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenDone {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    #[serde(default, alias = "err", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Body of `hostedField:ready` and the focus/blur/submit signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldReady {
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// Body of `hostedFields:ready`. An empty list means no secure field could
/// be attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedFieldsReady {
    #[serde(default)]
    pub fields: Vec<FieldType>,
}
