//! CLI command definitions for the `pgate` binary.
//!
//! Uses clap derive macros for argument parsing. Each subcommand operates on
//! a single workflow instance identified by its instance ID, except `list`,
//! `serve`, and `completions`.

pub mod instance;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use phasegate_observe::tracing_setup::LogFormat;
use phasegate_types::gate::Decision;
use phasegate_types::workflow::InstanceStatus;

/// Drive resumable multi-phase workflows with human review gates.
#[derive(Parser)]
#[command(name = "pgate", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line encoding on stderr (pretty or json).
    #[arg(long, global = true, default_value = "pretty", env = "PHASEGATE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new workflow instance and drive it to its first gate.
    Start {
        /// Instance ID (a UUID v7 is generated when omitted).
        instance_id: Option<String>,

        /// Initial input as a JSON object.
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the initial input from a JSON file.
        #[arg(long)]
        input_file: Option<PathBuf>,
    },

    /// Answer the gate a suspended instance is waiting on.
    Resume {
        /// Instance ID.
        instance_id: String,

        /// approve, reject, or modify.
        #[arg(short, long)]
        decision: Decision,

        /// Gate being answered; rejected if the instance waits on another.
        #[arg(long)]
        gate: Option<String>,

        /// Optional JSON payload (edits for `modify`).
        #[arg(long)]
        payload: Option<String>,
    },

    /// Cancel a suspended instance.
    Cancel {
        /// Instance ID.
        instance_id: String,

        /// Reason recorded with the rejection.
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Show the status of an instance.
    Status {
        /// Instance ID.
        instance_id: String,
    },

    /// List workflow instances.
    #[command(alias = "ls")]
    List {
        /// Only instances with this status (running, awaiting_input, complete, failed).
        #[arg(long)]
        status: Option<InstanceStatus>,
    },

    /// Show retained checkpoints of an instance.
    History {
        /// Instance ID.
        instance_id: String,

        /// Maximum number of checkpoints to display.
        #[arg(long, default_value = "20")]
        limit: u32,

        /// Show the full state captured at this sequence number.
        #[arg(long)]
        at: Option<u64>,
    },

    /// Re-drive instances interrupted mid-phase.
    Recover {
        /// Instance ID (omit to recover every running instance).
        instance_id: Option<String>,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on.
        #[arg(long, short, default_value = "3000", env = "PHASEGATE_PORT")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }

    #[test]
    fn resume_parses_decision_and_gate() {
        let cli = Cli::try_parse_from([
            "pgate", "resume", "I1", "--decision", "approve", "--gate", "generation_review",
        ])
        .unwrap();
        match cli.command {
            Commands::Resume {
                instance_id,
                decision,
                gate,
                payload,
            } => {
                assert_eq!(instance_id, "I1");
                assert_eq!(decision, Decision::Approve);
                assert_eq!(gate.as_deref(), Some("generation_review"));
                assert!(payload.is_none());
            }
            _ => panic!("expected resume"),
        }
    }

    #[test]
    fn list_rejects_unknown_status() {
        assert!(Cli::try_parse_from(["pgate", "list", "--status", "sleeping"]).is_err());
        let cli = Cli::try_parse_from(["pgate", "--json", "list", "--status", "awaiting_input"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::List {
                status: Some(InstanceStatus::AwaitingInput)
            }
        ));
    }

    #[test]
    fn start_input_sources_conflict() {
        assert!(
            Cli::try_parse_from(["pgate", "start", "--input", "{}", "--input-file", "in.json"])
                .is_err()
        );
    }
}
