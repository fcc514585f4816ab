//! Workflow orchestration core: phase state machine, sub-workflow invocation,
//! bounded retries, human-in-the-loop gates, and durable checkpointing.
//!
//! - `transition` -- Fixed adjacency table of legal phase transitions
//! - `orchestrator` -- Pure `advance` function and authoritative state merges
//! - `invoker` -- Phase handler contract and isolated sub-workflow execution
//! - `retry` -- Bounded retry/self-heal controller with escalation
//! - `gate` -- HITL gate manager (request, validate, resume)
//! - `checkpoint` -- Sequenced checkpoint writes over `CheckpointRepository`
//! - `engine` -- `WorkflowEngine` driving instances through start/resume/recover

pub mod checkpoint;
pub mod engine;
pub mod gate;
pub mod invoker;
pub mod orchestrator;
pub mod retry;
pub mod transition;

pub use engine::{EngineError, WorkflowEngine};
pub use invoker::{BoxPhaseHandler, HandlerRegistry, PhaseHandler, PhaseInput, PhaseOutcome};
pub use orchestrator::{Action, Orchestrator, OrchestratorError};
