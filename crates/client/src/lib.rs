//! SecurePay Client.
//!
//! Embeds secure payment fields into a host page and talks to them, and to
//! payment popups, over a role-addressed cross-context message bus.
//!
//! Platform-specific code is isolated behind the traits in [`ports`]; the
//! browser implementations live in `platform` and are selected at compile
//! time for `wasm32`.

pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod hosted_fields;
pub mod ports;
pub mod token;

#[cfg(target_arch = "wasm32")]
pub mod platform;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use bus::{Bus, BusHandle, InboundRejection, Member};
pub use client::{Client, ClientEvent, ClientServices, TokenInputs};
pub use config::{ClientConfig, Origin};
pub use error::{
    ApiError, ClientError, ConfigError, FrameError, TokenError, TransportError, ValidationFailure,
};
pub use frame::{FrameEvent, FrameOptions, FrameStatus, FrameTransaction};
pub use hosted_fields::{HostedFields, IntegrityMismatch, ReadyState};
pub use token::{completion_channel, DispatchMode, TokenDispatcher, TokenReceiver, TokenRequest};
