//! Infrastructure layer for phasegate.
//!
//! Contains implementations of the ports defined in `phasegate-core`:
//! SQLite checkpoint storage, the `config.toml` loader, data directory
//! resolution, and phase handlers that shell out to external commands.

pub mod config;
pub mod handler;
pub mod sqlite;
