//! Event bus for workflow transition notifications.
//!
//! Provides an `EventBus` that distributes `WorkflowEvent` records to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
