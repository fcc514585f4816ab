//! Human-in-the-loop gate types.
//!
//! An `InterruptRequest` is the question an instance is suspended on; a
//! `ResumeSignal` is the caller's answer. Gate outcomes are recorded as
//! `ApprovalStatus` flags plus a `GateResolution` per gate.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{InstanceId, Phase};

/// A caller's answer to a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Modify,
}

impl Decision {
    pub const ALL: [Decision; 3] = [Decision::Approve, Decision::Reject, Decision::Modify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::Modify => "modify",
        }
    }

    /// The approval flag value this decision produces.
    pub fn approval_status(&self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
            Decision::Modify => ApprovalStatus::Modified,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" | "approved" => Ok(Decision::Approve),
            "reject" | "rejected" => Ok(Decision::Reject),
            "modify" | "modified" => Ok(Decision::Modify),
            other => Err(format!("unknown decision '{other}'")),
        }
    }
}

/// State of a named approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
}

impl ApprovalStatus {
    /// Whether the gate lets the workflow move past it.
    pub fn allows_progress(&self) -> bool {
        matches!(self, ApprovalStatus::Approved | ApprovalStatus::Modified)
    }
}

/// Where an interrupt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    /// A declared review gate after a completed phase.
    Approval,
    /// Raised by the retry controller once an operation's budget is spent.
    Escalation,
    /// Raised by a phase handler that needs human input to continue.
    Phase,
}

/// The question an instance is suspended on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptRequest {
    pub gate_name: String,
    pub kind: GateKind,
    /// Phase the gate belongs to.
    pub phase: Phase,
    pub question: String,
    #[serde(default)]
    pub structured_context: Value,
    pub allowed_decisions: Vec<Decision>,
    pub raised_at: DateTime<Utc>,
}

impl InterruptRequest {
    /// A phase-raised interrupt accepting every decision.
    pub fn new(gate_name: impl Into<String>, phase: Phase, question: impl Into<String>) -> Self {
        Self {
            gate_name: gate_name.into(),
            kind: GateKind::Phase,
            phase,
            question: question.into(),
            structured_context: Value::Null,
            allowed_decisions: Decision::ALL.to_vec(),
            raised_at: Utc::now(),
        }
    }

    pub fn with_kind(mut self, kind: GateKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.structured_context = context;
        self
    }

    pub fn with_decisions(mut self, decisions: Vec<Decision>) -> Self {
        self.allowed_decisions = decisions;
        self
    }

    pub fn allows(&self, decision: Decision) -> bool {
        self.allowed_decisions.contains(&decision)
    }
}

/// Caller-supplied answer to a suspended instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeSignal {
    pub instance_id: InstanceId,
    /// Gate the caller believes it is answering; checked when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_name: Option<String>,
    pub decision: Decision,
    #[serde(default)]
    pub payload: Value,
}

impl ResumeSignal {
    pub fn new(instance_id: impl Into<InstanceId>, decision: Decision) -> Self {
        Self {
            instance_id: instance_id.into(),
            gate_name: None,
            decision,
            payload: Value::Null,
        }
    }

    pub fn for_gate(mut self, gate_name: impl Into<String>) -> Self {
        self.gate_name = Some(gate_name.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Record of how a gate was closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResolution {
    pub kind: GateKind,
    pub phase: Phase,
    pub decision: Decision,
    #[serde(default)]
    pub payload: Value,
    pub resolved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decision_parses_loosely() {
        assert_eq!("approve".parse::<Decision>().unwrap(), Decision::Approve);
        assert_eq!("Rejected".parse::<Decision>().unwrap(), Decision::Reject);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn decision_maps_to_approval_status() {
        assert!(Decision::Approve.approval_status().allows_progress());
        assert!(Decision::Modify.approval_status().allows_progress());
        assert!(!Decision::Reject.approval_status().allows_progress());
        assert!(!ApprovalStatus::Pending.allows_progress());
    }

    #[test]
    fn resume_signal_deserializes_with_defaults() {
        let signal: ResumeSignal =
            serde_json::from_value(json!({"instance_id": "I2", "decision": "reject"})).unwrap();
        assert_eq!(signal.instance_id.as_str(), "I2");
        assert!(signal.gate_name.is_none());
        assert!(signal.payload.is_null());
    }

    #[test]
    fn interrupt_builder_restricts_decisions() {
        let req = InterruptRequest::new("values_review", Phase::Generation, "Keep defaults?")
            .with_decisions(vec![Decision::Approve, Decision::Reject]);
        assert!(req.allows(Decision::Approve));
        assert!(!req.allows(Decision::Modify));
        assert_eq!(req.kind, GateKind::Phase);
    }
}
