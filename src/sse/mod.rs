//! # Instant Updates
//!
//! Server-sent-event plumbing for the Infisical project event stream:
//! wire-format decoding and the per-resource connection registry.

mod parser;
mod registry;

pub use parser::{Event, EventParser};
pub use registry::{
    is_permanent_error_message, ConnectionRegistry, OpenFn, RegistryCallbacks, RegistryConfig,
    SubscriptionParams,
};
