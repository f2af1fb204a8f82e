//! Message envelope and cross-context framing.
//!
//! Two framings reach a receiving context:
//! - **Structured**: the envelope posted as an object.
//! - **Relay**: a JSON string `{"securepay_event": .., "securepay_message": ..}`
//!   forwarded by the relay document when direct cross-window messaging is
//!   unavailable.
//!
//! Both decode into the same [`Message`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MessageDecodeError;
use crate::events::EventKind;
use crate::ids::MemberId;

/// A routed message: event name, plain key/value body, optional sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub event: EventKind,
    #[serde(default = "empty_body")]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<MemberId>,
}

fn empty_body() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Message {
    pub fn new(event: EventKind, body: Value) -> Self {
        Self {
            event,
            body,
            source_id: None,
        }
    }

    /// A message with an empty object body.
    pub fn signal(event: EventKind) -> Self {
        Self::new(event, empty_body())
    }

    pub fn with_source(mut self, source: MemberId) -> Self {
        self.source_id = Some(source);
        self
    }

    /// Decode the body into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageDecodeError> {
        Ok(T::deserialize(&self.body)?)
    }
}

#[derive(Serialize, Deserialize)]
struct RelayEnvelope {
    #[serde(default)]
    securepay_event: Option<EventKind>,
    #[serde(default = "empty_body")]
    securepay_message: Value,
}

/// Structured framing for posting to another context.
pub fn encode_structured(message: &Message) -> Value {
    serde_json::json!({
        "event": message.event,
        "body": message.body,
        "source_id": message.source_id,
    })
}

/// Relay framing, as forwarded by the relay document.
pub fn encode_relay(message: &Message) -> Result<String, MessageDecodeError> {
    Ok(serde_json::to_string(&RelayEnvelope {
        securepay_event: Some(message.event.clone()),
        securepay_message: message.body.clone(),
    })?)
}

/// Decode a frame received from another context in either framing.
pub fn decode_frame(data: &Value) -> Result<Message, MessageDecodeError> {
    match data {
        Value::Object(_) => Ok(Message::deserialize(data)?),
        Value::String(raw) => {
            let relay: RelayEnvelope = serde_json::from_str(raw)?;
            let event = relay
                .securepay_event
                .ok_or(MessageDecodeError::MissingRelayEvent)?;
            Ok(Message::new(event, relay.securepay_message))
        }
        _ => Err(MessageDecodeError::UnsupportedFrame),
    }
}
