//! SQLite storage layer.
//!
//! Checkpoint persistence backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod checkpoint;
pub mod pool;
