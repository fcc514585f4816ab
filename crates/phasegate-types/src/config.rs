//! Global configuration types for phasegate.
//!
//! `GlobalConfig` represents the top-level `config.toml` that controls the
//! orchestrator's retry and loop budgets, the declared approval gates, and
//! which external handler runs each phase.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::gate::Decision;
use crate::workflow::Phase;

/// Top-level configuration for phasegate.
///
/// Loaded from `~/.phasegate/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Phase handler definitions keyed by phase name (e.g. "generation").
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerConfig>,
}

impl GlobalConfig {
    /// Handler configured for `phase`, if any.
    pub fn handler_for(&self, phase: Phase) -> Option<&HandlerConfig> {
        self.handlers.get(phase.as_str())
    }
}

/// Budgets and gates governing every workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Automatic retries per operation before escalating to a human.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// `advance` calls after which an instance is forced to `failed`.
    #[serde(default = "default_loop_ceiling")]
    pub loop_ceiling: u32,

    /// Checkpoint history rows kept per instance for time travel.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    /// Approval gates placed after completed phases.
    #[serde(default = "default_gates")]
    pub gates: Vec<GateDefinition>,
}

fn default_max_retries() -> u32 {
    2
}

fn default_loop_ceiling() -> u32 {
    30
}

fn default_history_limit() -> u32 {
    20
}

fn default_gates() -> Vec<GateDefinition> {
    vec![GateDefinition {
        name: "generation_review".to_string(),
        after: Phase::Generation,
        question: "Review the generated artifacts before validation.".to_string(),
        allowed_decisions: default_decisions(),
    }]
}

fn default_decisions() -> Vec<Decision> {
    Decision::ALL.to_vec()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            loop_ceiling: default_loop_ceiling(),
            history_limit: default_history_limit(),
            gates: default_gates(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_loop_ceiling(mut self, loop_ceiling: u32) -> Self {
        self.loop_ceiling = loop_ceiling;
        self
    }

    pub fn with_gates(mut self, gates: Vec<GateDefinition>) -> Self {
        self.gates = gates;
        self
    }

    pub fn gate(&self, name: &str) -> Option<&GateDefinition> {
        self.gates.iter().find(|g| g.name == name)
    }

    /// Gates declared after `phase`, in declaration order.
    pub fn gates_after(&self, phase: Phase) -> impl Iterator<Item = &GateDefinition> {
        self.gates.iter().filter(move |g| g.after == phase)
    }
}

/// A named approval gate that blocks progress after a phase completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDefinition {
    pub name: String,
    /// Phase whose completion opens this gate.
    pub after: Phase,
    pub question: String,
    #[serde(default = "default_decisions")]
    pub allowed_decisions: Vec<Decision>,
}

/// How a phase handler is provided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerConfig {
    /// Run an external program speaking JSON over stdin/stdout.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        /// Arguments for the remediation invocation; no remediation if unset.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remediate_args: Option<Vec<String>>,
    },
    /// Echo the phase input back as its output.
    Passthrough,
}

fn default_timeout_secs() -> u64 {
    300
}
