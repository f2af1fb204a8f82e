//! SecurePay Shared - wire vocabulary for cross-context messaging
//!
//! This crate contains every type that crosses a browsing-context boundary:
//! - Event names (`EventKind`) and the one-shot names derived from identifiers
//! - The message envelope and its two framings (structured and relay string)
//! - Identifiers (correlation, member, frame)
//! - Field configuration and field-state snapshots
//! - Tokenization payloads and the cross-context error payload
//!
//! # Design Principles
//!
//! 1. **Minimal dependencies** - Only serde, serde_json, uuid, and thiserror
//! 2. **No behaviour** - Pure data types, parsing and formatting
//! 3. **WASM compatible** - Must compile for both native and wasm32 targets
//! 4. **Forward compatible** - Unknown event names parse to `EventKind::Other`

pub mod error;
pub mod events;
pub mod fields;
pub mod ids;
pub mod message;
pub mod token;

pub use error::{ErrorPayload, MessageDecodeError};
pub use events::{EventKind, FrameEventName};
pub use fields::{FieldConfig, FieldState, FieldStateSnapshot, FieldType, FieldsConfig};
pub use ids::{CorrelationId, FrameId, MemberId};
pub use message::{decode_frame, encode_relay, encode_structured, Message};
pub use token::{FieldReady, HostedFieldsReady, Token, TokenDone, TokenInit};
