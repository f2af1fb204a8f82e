//! Client configuration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use securepay_shared::FieldsConfig;

use crate::error::ConfigError;

/// Default payment API endpoint.
pub const DEFAULT_API: &str = "https://api.securepay.dev/js/v1";

/// Default timeout for correlated requests, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Client protocol version sent to popups.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

fn default_api() -> String {
    DEFAULT_API.to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_required() -> Vec<String> {
    ["number", "month", "year", "first_name", "last_name"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Everything `Client::configure` accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub public_key: String,
    #[serde(default = "default_api")]
    pub api: String,
    /// Whether this context orchestrates secure field contexts.
    #[serde(default = "default_true")]
    pub parent: bool,
    #[serde(default)]
    pub fields: FieldsConfig,
    /// Inputs that must be present in direct mode.
    #[serde(default = "default_required")]
    pub required: Vec<String>,
    /// Fraud-collector parameters handed to the field context as-is.
    #[serde(default)]
    pub fraud: Map<String, Value>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ClientConfig {
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            api: default_api(),
            parent: true,
            fields: FieldsConfig::default(),
            required: default_required(),
            fraud: Map::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn with_api(mut self, api: impl Into<String>) -> Self {
        self.api = api.into();
        self
    }

    pub fn with_parent(mut self, parent: bool) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_fields(mut self, fields: FieldsConfig) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_required(mut self, required: Vec<String>) -> Self {
        self.required = required;
        self
    }

    pub fn with_fraud(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fraud.insert(key.into(), value);
        self
    }

    /// Create configuration from environment variables.
    ///
    /// Uses `SECUREPAY_PUBLIC_KEY`, `SECUREPAY_API`, `SECUREPAY_PARENT` and
    /// `SECUREPAY_TIMEOUT_MS`, falling back to defaults if not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let public_key = std::env::var("SECUREPAY_PUBLIC_KEY").unwrap_or_default();
        let api = std::env::var("SECUREPAY_API").unwrap_or_else(|_| default_api());

        let mut config = Self::new(public_key).with_api(api);

        if let Ok(value) = std::env::var("SECUREPAY_PARENT") {
            config.parent = match value.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "SECUREPAY_PARENT",
                        value,
                    })
                }
            };
        }

        if let Ok(value) = std::env::var("SECUREPAY_TIMEOUT_MS") {
            config.timeout_ms = value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "SECUREPAY_TIMEOUT_MS",
                value,
            })?;
        }

        Ok(config)
    }

    /// Check the configuration and derive the message origin.
    pub fn validate(&self) -> Result<Origin, ConfigError> {
        if self.public_key.trim().is_empty() {
            return Err(ConfigError::MissingPublicKey);
        }
        Origin::from_api(&self.api)
    }

    /// Absolute URL for an API path.
    pub fn api_url(&self, path: &str) -> Result<Url, ConfigError> {
        let base = self.api.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        let joined = format!("{base}/{path}");
        Url::parse(&joined).map_err(|source| ConfigError::InvalidApiUrl {
            url: joined,
            source,
        })
    }
}

/// Scheme, host and port of the API endpoint. Cross-context messages are
/// posted to, and accepted only from, this origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin(String);

impl Origin {
    pub fn from_api(api: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(api).map_err(|source| ConfigError::InvalidApiUrl {
            url: api.to_string(),
            source,
        })?;
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(ConfigError::OpaqueOrigin(api.to_string()));
        }
        Ok(Self(origin.ascii_serialization()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, origin: &str) -> bool {
        self.0 == origin
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
