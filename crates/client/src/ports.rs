//! Ports to the host environment and external collaborators.
//!
//! These traits abstract everything the core does not own, so that:
//! 1. Bus, field lifecycle, frames and token dispatch stay platform-agnostic
//! 2. Browser-specific code is isolated in `platform`
//! 3. Every component is testable with the in-memory doubles in `testing`
//!
//! Browsing contexts are single-threaded, so none of these ports require
//! `Send` or `Sync`.

use std::rc::Rc;

use serde_json::{Map, Value};
use url::Url;

use securepay_shared::{FieldConfig, FieldType, MemberId, Token};

use crate::error::{ApiError, TransportError, ValidationFailure};

/// Another browsing context reachable through a postable channel: a secure
/// field frame or a popup window.
pub trait BrowsingContext {
    fn id(&self) -> MemberId;

    /// Post a structured frame, restricted to `target_origin`.
    fn post_message(&self, frame: &Value, target_origin: &str) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;

    /// Close the context (window.close / iframe removal). Idempotent.
    fn close(&self);

    /// Register a one-shot closure notification.
    ///
    /// Returns false when the host cannot notify, in which case callers fall
    /// back to polling [`BrowsingContext::is_closed`].
    fn on_close(&self, _notify: Box<dyn FnOnce()>) -> bool {
        false
    }
}

/// Error mounting a secure field into the host document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("no element matches selector '{0}'")]
    MissingTarget(String),

    #[error("field could not be mounted: {0}")]
    Mount(String),
}

/// The host document in which secure field contexts are mounted.
pub trait FieldHost {
    /// Mount a secure field context inside the element matching the
    /// field's selector.
    fn attach(
        &self,
        field: FieldType,
        config: &FieldConfig,
    ) -> Result<Rc<dyn BrowsingContext>, AttachError>;

    /// Whether an element matching `selector` is still in the document.
    fn contains(&self, selector: &str) -> bool;
}

/// Opener screen size in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenGeometry {
    pub width: u32,
    pub height: u32,
}

/// Window management in the opening context.
pub trait WindowHost {
    fn screen(&self) -> ScreenGeometry;

    /// Capability probe: can a popup post messages directly to its opener?
    fn supports_cross_window_messaging(&self) -> bool;

    fn open_popup(
        &self,
        url: &Url,
        name: &str,
        features: &str,
    ) -> Result<Rc<dyn BrowsingContext>, TransportError>;

    /// Insert an invisible same-origin relay document.
    fn insert_relay(&self, name: &str, url: &Url) -> Result<(), TransportError>;

    fn remove_relay(&self, name: &str);
}

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Timer scheduling in the current context.
pub trait Scheduler {
    fn set_interval(&self, period_ms: u32, tick: Box<dyn FnMut()>) -> TimerId;

    fn set_timeout(&self, delay_ms: u32, fire: Box<dyn FnOnce()>) -> TimerId;

    /// Cancel a timer. Unknown or already-fired ids are ignored.
    fn clear(&self, timer: TimerId);
}

pub type TokenApiCallback = Box<dyn FnOnce(Result<Token, ApiError>)>;

/// HTTP collaborator used for direct (non-parent) tokenization.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait TokenApi {
    /// POST the inputs to the token route; `done` is invoked exactly once.
    fn create_token(&self, inputs: &Map<String, Value>, done: TokenApiCallback);
}

/// Input checks applied before a direct tokenization request.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Validator {
    fn validate(&self, inputs: &Map<String, Value>, required: &[String]) -> Vec<ValidationFailure>;
}

/// Presence check: every required input must be a non-blank value.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredFields;

impl Validator for RequiredFields {
    fn validate(&self, inputs: &Map<String, Value>, required: &[String]) -> Vec<ValidationFailure> {
        required
            .iter()
            .filter(|name| is_blank(inputs.get(name.as_str())))
            .map(|name| ValidationFailure::new(name.as_str(), "blank"))
            .collect()
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// A host form the caller tokenizes from.
pub trait FormSource {
    /// Current named input values.
    fn values(&self) -> Map<String, Value>;

    /// Hidden input that receives the token id on success, if bound.
    fn token_output(&self) -> Option<Rc<dyn TokenOutput>>;
}

/// Writable token output field.
pub trait TokenOutput {
    fn write(&self, token_id: &str);
}
