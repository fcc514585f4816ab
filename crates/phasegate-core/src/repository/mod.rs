//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (phasegate-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides an in-process
//! implementation for tests and ephemeral runs.

pub mod checkpoint;
pub mod memory;

pub use checkpoint::CheckpointRepository;
pub use memory::InMemoryCheckpointRepository;
