//! Orchestration logic and repository trait definitions for phasegate.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus the phase state machine, sub-workflow invoker,
//! retry controller, gate manager and the `WorkflowEngine` that drives them.
//! It depends only on `phasegate-types` -- never on `phasegate-infra` or any
//! database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
