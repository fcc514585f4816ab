//! Shared domain types for phasegate.
//!
//! This crate contains the data model of the orchestration core: phases,
//! the per-instance `WorkflowState`, checkpoints, interrupt/resume payloads,
//! failure reasons, transition events, configuration, and error types.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod failure;
pub mod gate;
pub mod workflow;
