//! External-command phase handler.
//!
//! Runs a configured program once per attempt. The `PhaseInput` is written to
//! its stdin as JSON and a single JSON reply is read from stdout:
//!
//! ```json
//! {"status": "completed", "output": {...}}
//! {"status": "suspend", "gate_name": "namespace", "question": "...", "context": {...}}
//! {"status": "failed", "kind": "validation", "message": "...", "detail": {...}}
//! {"status": "rework", "target": "generation", "reason": "..."}
//! ```
//!
//! Failure mapping: timeouts and non-zero exits are `transient`, a program
//! that cannot be spawned is `fatal`, and output that is not a valid reply is
//! `validation`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use phasegate_core::workflow::invoker::{PhaseHandler, PhaseInput, PhaseOutcome};
use phasegate_types::failure::{FailureKind, FailureReason};
use phasegate_types::gate::{Decision, InterruptRequest};
use phasegate_types::workflow::Phase;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Bytes of command output kept in failure details.
const STDERR_TAIL_BYTES: usize = 2048;

/// Reply a phase command prints on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandReply {
    Completed {
        #[serde(default)]
        output: Value,
    },
    Suspend {
        gate_name: String,
        question: String,
        #[serde(default)]
        context: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_decisions: Option<Vec<Decision>>,
    },
    Failed {
        kind: FailureKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    Rework {
        target: Phase,
        reason: String,
    },
}

impl CommandReply {
    fn into_outcome(self, phase: Phase) -> PhaseOutcome {
        match self {
            CommandReply::Completed { output } => PhaseOutcome::Completed(output),
            CommandReply::Suspend {
                gate_name,
                question,
                context,
                allowed_decisions,
            } => {
                let mut request = InterruptRequest::new(gate_name, phase, question).with_context(context);
                if let Some(decisions) = allowed_decisions {
                    request = request.with_decisions(decisions);
                }
                PhaseOutcome::Suspend(request)
            }
            CommandReply::Failed {
                kind,
                message,
                detail,
            } => {
                let mut failure = FailureReason::new(kind, message);
                if let Some(detail) = detail {
                    failure = failure.with_detail(detail);
                }
                PhaseOutcome::Failed(failure)
            }
            CommandReply::Rework { target, reason } => PhaseOutcome::Rework { target, reason },
        }
    }
}

/// Captured result of one command run.
struct CommandRun {
    success: bool,
    status: String,
    stdout: String,
    stderr: String,
}

/// Phase handler backed by an external program.
#[derive(Debug, Clone)]
pub struct CommandPhaseHandler {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    remediate_args: Option<Vec<String>>,
    working_dir: Option<PathBuf>,
}

impl CommandPhaseHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            remediate_args: None,
            working_dir: None,
        }
    }

    /// Enable remediation: the same program is run with these arguments
    /// before each automatic retry.
    pub fn with_remediation(mut self, args: Vec<String>) -> Self {
        self.remediate_args = Some(args);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Spawn the program, feed `stdin`, and wait up to the timeout.
    async fn run(&self, args: &[String], stdin_json: &str) -> Result<CommandRun, FailureReason> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            FailureReason::fatal(format!("failed to spawn '{}': {e}", self.program))
        })?;

        // Stdin is fed from its own task while stdout and stderr drain.
        let writer = child.stdin.take().map(|mut stdin| {
            let program = self.program.clone();
            let payload = stdin_json.as_bytes().to_vec();
            tokio::spawn(async move {
                // A program that exits without reading its input is not an error.
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(program = program.as_str(), error = %e, "phase command closed stdin early");
                }
            })
        });
        let exchange = child.wait_with_output();

        // Dropping the exchange on timeout kills the child (`kill_on_drop`).
        let waited = tokio::time::timeout(self.timeout, exchange).await;
        if let Some(writer) = writer {
            writer.abort();
        }
        let output = match waited {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(FailureReason::transient(format!(
                    "failed to wait for '{}': {e}",
                    self.program
                )));
            }
            Err(_) => {
                return Err(FailureReason::transient(format!(
                    "'{}' timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                )));
            }
        };

        Ok(CommandRun {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn exit_failure(&self, run: &CommandRun) -> FailureReason {
        FailureReason::transient(format!("'{}' exited with {}", self.program, run.status))
            .with_detail(json!({ "stderr": output_tail(&run.stderr) }))
    }
}

impl PhaseHandler for CommandPhaseHandler {
    async fn execute(&self, input: &PhaseInput) -> PhaseOutcome {
        let stdin_json = match serde_json::to_string(input) {
            Ok(json) => json,
            Err(e) => return PhaseOutcome::Failed(FailureReason::fatal(format!("serialize phase input: {e}"))),
        };

        tracing::debug!(
            program = self.program.as_str(),
            phase = %input.phase,
            attempt = input.attempt,
            "running phase command"
        );

        let run = match self.run(&self.args, &stdin_json).await {
            Ok(run) => run,
            Err(failure) => return PhaseOutcome::Failed(failure),
        };
        if !run.success {
            return PhaseOutcome::Failed(self.exit_failure(&run));
        }

        match serde_json::from_str::<CommandReply>(run.stdout.trim()) {
            Ok(reply) => reply.into_outcome(input.phase),
            Err(e) => PhaseOutcome::Failed(
                FailureReason::validation(format!("unparseable reply from '{}': {e}", self.program))
                    .with_detail(json!({ "stdout": output_tail(&run.stdout) })),
            ),
        }
    }

    async fn remediate(
        &self,
        input: &PhaseInput,
        failure: &FailureReason,
    ) -> Result<Option<Value>, FailureReason> {
        let Some(args) = &self.remediate_args else {
            return Ok(None);
        };

        let stdin_json = serde_json::to_string(&json!({ "input": input, "failure": failure }))
            .map_err(|e| FailureReason::fatal(format!("serialize remediation input: {e}")))?;

        let run = self.run(args, &stdin_json).await?;
        if !run.success {
            return Err(self.exit_failure(&run));
        }

        let stdout = run.stdout.trim();
        if stdout.is_empty() {
            return Ok(None);
        }
        // Plain-text notes are kept as strings.
        Ok(Some(
            serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())),
        ))
    }
}

fn output_tail(s: &str) -> &str {
    let s = s.trim();
    if s.len() <= STDERR_TAIL_BYTES {
        return s;
    }
    let mut start = s.len() - STDERR_TAIL_BYTES;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
