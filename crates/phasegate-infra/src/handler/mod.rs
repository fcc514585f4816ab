//! Phase handlers built from configuration.
//!
//! `build_registry` turns the `[handlers.<phase>]` tables of `config.toml`
//! into a `HandlerRegistry`. Working phases without a configured handler get
//! the passthrough handler, and a warning is logged for each.

pub mod command;
pub mod passthrough;

use std::path::Path;

use phasegate_core::workflow::invoker::HandlerRegistry;
use phasegate_types::config::{GlobalConfig, HandlerConfig};
use phasegate_types::workflow::Phase;

pub use command::{CommandPhaseHandler, CommandReply};
pub use passthrough::PassthroughHandler;

/// Build the handler registry for every working phase.
///
/// Command handlers run with `working_dir` as their current directory.
pub fn build_registry(config: &GlobalConfig, working_dir: &Path) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    for phase in Phase::WORKING {
        match config.handler_for(phase) {
            Some(HandlerConfig::Command {
                program,
                args,
                timeout_secs,
                remediate_args,
            }) => {
                let mut handler = CommandPhaseHandler::new(program.clone(), args.clone(), *timeout_secs)
                    .with_working_dir(working_dir);
                if let Some(remediate_args) = remediate_args {
                    handler = handler.with_remediation(remediate_args.clone());
                }
                tracing::debug!(phase = %phase, program = program.as_str(), "registered command handler");
                registry.register(phase, handler);
            }
            Some(HandlerConfig::Passthrough) => registry.register(phase, PassthroughHandler),
            None => {
                tracing::warn!(phase = %phase, "no handler configured, using passthrough");
                registry.register(phase, PassthroughHandler);
            }
        }
    }

    registry
}
