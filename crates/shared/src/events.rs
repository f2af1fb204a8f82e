//! Event names exchanged between browsing contexts.
//!
//! Names are matched exactly and case-sensitively. Names that carry an
//! identifier (`token:done:<id>`, `relay:<id>`, frame completion names) are
//! parsed into their own variants so receivers can match them without string
//! surgery. Anything unrecognised becomes [`EventKind::Other`] and is ignored
//! by receivers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::{CorrelationId, FrameId, MemberId};

const TOKEN_DONE_PREFIX: &str = "token:done:";
const RELAY_PREFIX: &str = "relay:";
const FRAME_PREFIX: &str = "securepay-frame-";

/// Every event kind the bus knows how to route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Parent -> field contexts: selector, style and key for one field.
    HostedFieldsConfigure,
    /// Every attached field context reported ready (or none could attach).
    HostedFieldsReady,
    /// Aggregate field-state snapshot, published once fields are ready.
    HostedFieldsStateChange,
    /// One field context finished loading.
    HostedFieldReady,
    /// One field's state changed.
    HostedFieldStateChange,
    HostedFieldFocus,
    HostedFieldBlur,
    HostedFieldSubmit,
    /// Parent -> field context: take focus.
    HostedFieldFocusRequest,
    HostedFieldTabNext,
    HostedFieldTabPrevious,
    HostedFieldError,
    TokenInit,
    TokenDone(CorrelationId),
    /// Completion of a popup transaction, named per transaction.
    FrameDone(FrameEventName),
    /// The relay document for a popup transaction has loaded.
    RelayLoaded(FrameId),
    /// Local-only notification delivered to a member when it joins a bus.
    BusAdded,
    /// Terminal broadcast.
    Destroy,
    Other(String),
}

impl EventKind {
    /// Emitted only inside the owning context. Frames from other contexts
    /// carrying these are not dispatched.
    pub fn is_local_only(&self) -> bool {
        matches!(
            self,
            EventKind::Destroy
                | EventKind::BusAdded
                | EventKind::HostedFieldsReady
                | EventKind::HostedFieldsStateChange
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::HostedFieldsConfigure => f.write_str("hostedFields:configure"),
            EventKind::HostedFieldsReady => f.write_str("hostedFields:ready"),
            EventKind::HostedFieldsStateChange => f.write_str("hostedFields:state:change"),
            EventKind::HostedFieldReady => f.write_str("hostedField:ready"),
            EventKind::HostedFieldStateChange => f.write_str("hostedField:state:change"),
            EventKind::HostedFieldFocus => f.write_str("hostedField:focus"),
            EventKind::HostedFieldBlur => f.write_str("hostedField:blur"),
            EventKind::HostedFieldSubmit => f.write_str("hostedField:submit"),
            EventKind::HostedFieldFocusRequest => f.write_str("hostedField:focus!"),
            EventKind::HostedFieldTabNext => f.write_str("hostedField:tab:next"),
            EventKind::HostedFieldTabPrevious => f.write_str("hostedField:tab:previous"),
            EventKind::HostedFieldError => f.write_str("hostedField:error"),
            EventKind::TokenInit => f.write_str("token:init"),
            EventKind::TokenDone(id) => write!(f, "{TOKEN_DONE_PREFIX}{id}"),
            EventKind::FrameDone(name) => f.write_str(name.as_str()),
            EventKind::RelayLoaded(id) => write!(f, "{RELAY_PREFIX}{id}"),
            EventKind::BusAdded => f.write_str("bus:added"),
            EventKind::Destroy => f.write_str("destroy"),
            EventKind::Other(name) => f.write_str(name),
        }
    }
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "hostedFields:configure" => EventKind::HostedFieldsConfigure,
            "hostedFields:ready" => EventKind::HostedFieldsReady,
            "hostedFields:state:change" => EventKind::HostedFieldsStateChange,
            "hostedField:ready" => EventKind::HostedFieldReady,
            "hostedField:state:change" => EventKind::HostedFieldStateChange,
            "hostedField:focus" => EventKind::HostedFieldFocus,
            "hostedField:blur" => EventKind::HostedFieldBlur,
            "hostedField:submit" => EventKind::HostedFieldSubmit,
            "hostedField:focus!" => EventKind::HostedFieldFocusRequest,
            "hostedField:tab:next" => EventKind::HostedFieldTabNext,
            "hostedField:tab:previous" => EventKind::HostedFieldTabPrevious,
            "hostedField:error" => EventKind::HostedFieldError,
            "token:init" => EventKind::TokenInit,
            "bus:added" => EventKind::BusAdded,
            "destroy" => EventKind::Destroy,
            other => parse_dynamic(other),
        };
        Ok(kind)
    }
}

fn parse_dynamic(name: &str) -> EventKind {
    if let Some(id) = name.strip_prefix(TOKEN_DONE_PREFIX) {
        if let Ok(id) = id.parse() {
            return EventKind::TokenDone(id);
        }
    } else if let Some(id) = name.strip_prefix(RELAY_PREFIX) {
        if let Ok(id) = id.parse() {
            return EventKind::RelayLoaded(id);
        }
    } else if name.len() > FRAME_PREFIX.len() && name.starts_with(FRAME_PREFIX) {
        return EventKind::FrameDone(FrameEventName(name.to_string()));
    }
    EventKind::Other(name.to_string())
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(EventKind::from(name.as_str()))
    }
}

/// The one-shot completion event a popup must emit back to its opener.
///
/// Format: `securepay-frame-<owner member id>-<frame id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameEventName(String);

impl FrameEventName {
    pub fn new(owner: &MemberId, frame: &FrameId) -> Self {
        Self(format!("{FRAME_PREFIX}{owner}-{frame}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
