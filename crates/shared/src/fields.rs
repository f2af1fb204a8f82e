//! Secure field configuration and state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Logical secure field. Declaration order is the tab order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Number,
    Month,
    Year,
    Cvv,
    PostalCode,
}

impl FieldType {
    pub const ALL: [FieldType; 5] = [
        FieldType::Number,
        FieldType::Month,
        FieldType::Year,
        FieldType::Cvv,
        FieldType::PostalCode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Number => "number",
            FieldType::Month => "month",
            FieldType::Year => "year",
            FieldType::Cvv => "cvv",
            FieldType::PostalCode => "postal_code",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where one secure field is mounted and how it is styled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub selector: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub style: BTreeMap<String, String>,
}

impl FieldConfig {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            style: BTreeMap::new(),
        }
    }

    pub fn with_style(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.style.insert(property.into(), value.into());
        self
    }
}

/// Selector/style set for every configured field.
///
/// Two configurations are equal only when the same fields are present with
/// identical selectors and styles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldsConfig(BTreeMap<FieldType, FieldConfig>);

impl FieldsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: FieldType, config: FieldConfig) -> Self {
        self.0.insert(field, config);
        self
    }

    pub fn get(&self, field: FieldType) -> Option<&FieldConfig> {
        self.0.get(&field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldType, &FieldConfig)> {
        self.0.iter().map(|(field, config)| (*field, config))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Published state of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldState {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub valid: bool,
    pub empty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default)]
    pub focused: bool,
}

impl FieldState {
    /// Initial state of a freshly attached field.
    pub fn blank(field_type: FieldType) -> Self {
        Self {
            field_type,
            valid: false,
            empty: true,
            brand: None,
            focused: false,
        }
    }
}

/// Read-only snapshot of every field's last reported state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldStateSnapshot(BTreeMap<FieldType, FieldState>);

impl FieldStateSnapshot {
    pub fn get(&self, field: FieldType) -> Option<&FieldState> {
        self.0.get(&field)
    }

    pub fn insert(&mut self, state: FieldState) {
        self.0.insert(state.field_type, state);
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldState> {
        self.0.values()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fields currently reporting a validation error.
    pub fn invalid_fields(&self) -> Vec<FieldType> {
        self.0
            .values()
            .filter(|state| !state.valid)
            .map(|state| state.field_type)
            .collect()
    }
}
