//! Workflow instance types for phasegate.
//!
//! `WorkflowState` is the single source of truth for one workflow instance.
//! It is exclusively owned by the orchestrator; phase handlers only ever see
//! a transformed copy of the fields their phase is allowed to read. This
//! module also contains the persisted `Checkpoint` record and the
//! caller-facing status views.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventKind;
use crate::failure::{FailureKind, FailureReason};
use crate::gate::{ApprovalStatus, GateResolution, InterruptRequest};

// ---------------------------------------------------------------------------
// InstanceId
// ---------------------------------------------------------------------------

/// Opaque identifier of a workflow instance; primary key for checkpointing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One of the fixed, ordered stages of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Requirements,
    Planning,
    Generation,
    Validation,
    Complete,
    Failed,
}

impl Phase {
    /// Phases that run a sub-workflow, in execution order.
    pub const WORKING: [Phase; 4] = [
        Phase::Requirements,
        Phase::Planning,
        Phase::Generation,
        Phase::Validation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Requirements => "requirements",
            Phase::Planning => "planning",
            Phase::Generation => "generation",
            Phase::Validation => "validation",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        }
    }

    /// Name of the retryable operation backing this phase.
    pub fn operation(&self) -> &'static str {
        self.as_str()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }

    pub fn is_working(&self) -> bool {
        !self.is_terminal()
    }

    /// Phases that must be `complete` before this one may be entered.
    pub fn prerequisites(&self) -> &'static [Phase] {
        match self {
            Phase::Requirements | Phase::Failed => &[],
            Phase::Planning => &[Phase::Requirements],
            Phase::Generation => &[Phase::Planning],
            Phase::Validation => &[Phase::Generation],
            Phase::Complete => &Phase::WORKING,
        }
    }

    /// Working phases that come after this one in execution order.
    pub fn successors(&self) -> &'static [Phase] {
        match self {
            Phase::Requirements => &Phase::WORKING[1..],
            Phase::Planning => &Phase::WORKING[2..],
            Phase::Generation => &Phase::WORKING[3..],
            _ => &[],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requirements" => Ok(Phase::Requirements),
            "planning" => Ok(Phase::Planning),
            "generation" => Ok(Phase::Generation),
            "validation" => Ok(Phase::Validation),
            "complete" => Ok(Phase::Complete),
            "failed" => Ok(Phase::Failed),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// Completion flag for a working phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    Complete,
}

// ---------------------------------------------------------------------------
// History and blocking issues
// ---------------------------------------------------------------------------

/// One audit entry in an instance's transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub phase: Phase,
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// A problem descriptor raised by a failed operation.
///
/// Issues are append-only. Resolving one stamps `resolved_at` instead of
/// removing it, so the audit trail of prior failures survives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingIssue {
    /// 1-based position in the instance's issue list.
    pub id: u32,
    pub operation: String,
    pub phase: Phase,
    pub kind: FailureKind,
    pub message: String,
    /// Attempt number (1-based) that produced this issue.
    pub attempt: u32,
    /// Note returned by the handler's remediation step, if one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Value>,
    pub raised_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl BlockingIssue {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// The complete state of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub instance_id: InstanceId,
    pub phase: Phase,
    pub phase_flags: BTreeMap<Phase, PhaseStatus>,
    #[serde(default)]
    pub approval_flags: BTreeMap<String, ApprovalStatus>,
    #[serde(default)]
    pub artifact_payloads: BTreeMap<Phase, Value>,
    #[serde(default)]
    pub retry_counters: BTreeMap<String, u32>,
    #[serde(default)]
    pub blocking_issues: Vec<BlockingIssue>,
    #[serde(default)]
    pub loop_counter: u32,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Caller input: the start payload plus payloads merged in by resumes.
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    /// How each closed gate was answered, keyed by gate name.
    #[serde(default)]
    pub resolutions: BTreeMap<String, GateResolution>,
    /// The question the instance is suspended on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<InterruptRequest>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Create the initial state for a freshly started instance.
    ///
    /// An object `initial_input` becomes `inputs` as-is; any other JSON value
    /// is stored under the `input` key.
    pub fn new(instance_id: InstanceId, initial_input: Value, now: DateTime<Utc>) -> Self {
        let inputs = match initial_input {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };

        let phase_flags = Phase::WORKING
            .iter()
            .map(|p| (*p, PhaseStatus::NotStarted))
            .collect();

        let mut state = Self {
            instance_id,
            phase: Phase::Requirements,
            phase_flags,
            approval_flags: BTreeMap::new(),
            artifact_payloads: BTreeMap::new(),
            retry_counters: BTreeMap::new(),
            blocking_issues: Vec::new(),
            loop_counter: 0,
            history: Vec::new(),
            inputs,
            resolutions: BTreeMap::new(),
            pending_interrupt: None,
            created_at: now,
            updated_at: now,
        };
        state.record(EventKind::InstanceStarted, None, now);
        state
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn is_suspended(&self) -> bool {
        self.pending_interrupt.is_some()
    }

    /// Caller-visible status derived from phase and suspension.
    pub fn status(&self) -> InstanceStatus {
        match self.phase {
            Phase::Complete => InstanceStatus::Complete,
            Phase::Failed => InstanceStatus::Failed,
            _ if self.is_suspended() => InstanceStatus::AwaitingInput,
            _ => InstanceStatus::Running,
        }
    }

    pub fn is_phase_complete(&self, phase: Phase) -> bool {
        self.phase_flags.get(&phase) == Some(&PhaseStatus::Complete)
    }

    pub fn prerequisites_met(&self, phase: Phase) -> bool {
        phase
            .prerequisites()
            .iter()
            .all(|p| self.is_phase_complete(*p))
    }

    pub fn approval(&self, gate: &str) -> Option<ApprovalStatus> {
        self.approval_flags.get(gate).copied()
    }

    pub fn retry_count(&self, operation: &str) -> u32 {
        self.retry_counters.get(operation).copied().unwrap_or(0)
    }

    /// Unresolved issues raised by `operation`.
    pub fn open_issues<'a>(&'a self, operation: &'a str) -> impl Iterator<Item = &'a BlockingIssue> + 'a {
        self.blocking_issues
            .iter()
            .filter(move |i| i.operation == operation && i.is_open())
    }

    pub fn has_open_issues(&self) -> bool {
        self.blocking_issues.iter().any(BlockingIssue::is_open)
    }

    /// `phase_flags[p] == complete` iff `artifact_payloads[p]` is present.
    pub fn flags_consistent(&self) -> bool {
        Phase::WORKING
            .iter()
            .all(|p| self.is_phase_complete(*p) == self.artifact_payloads.contains_key(p))
    }

    /// Append a history entry for the current phase.
    pub fn record(&mut self, event: EventKind, detail: Option<String>, now: DateTime<Utc>) {
        self.history.push(HistoryEntry {
            phase: self.phase,
            event,
            detail,
            at: now,
        });
        self.updated_at = now;
    }

    /// Append a blocking issue and return its id.
    pub fn raise_issue(
        &mut self,
        operation: &str,
        phase: Phase,
        failure: &FailureReason,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> u32 {
        let id = self.blocking_issues.len() as u32 + 1;
        self.blocking_issues.push(BlockingIssue {
            id,
            operation: operation.to_string(),
            phase,
            kind: failure.kind,
            message: failure.message.clone(),
            attempt,
            remediation: None,
            raised_at: now,
            resolved_at: None,
            resolution: None,
        });
        id
    }

    /// Mark every open issue of `operation` resolved.
    pub fn resolve_issues(&mut self, operation: &str, resolution: &str, now: DateTime<Utc>) -> usize {
        let mut resolved = 0;
        for issue in self
            .blocking_issues
            .iter_mut()
            .filter(|i| i.operation == operation && i.is_open())
        {
            issue.resolved_at = Some(now);
            issue.resolution = Some(resolution.to_string());
            resolved += 1;
        }
        resolved
    }
}

// ---------------------------------------------------------------------------
// Status views
// ---------------------------------------------------------------------------

/// What a caller polling an instance observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    AwaitingInput,
    Complete,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::AwaitingInput => "awaiting_input",
            InstanceStatus::Complete => "complete",
            InstanceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "running" => Ok(InstanceStatus::Running),
            "awaiting_input" => Ok(InstanceStatus::AwaitingInput),
            "complete" => Ok(InstanceStatus::Complete),
            "failed" => Ok(InstanceStatus::Failed),
            other => Err(format!("unknown instance status '{other}'")),
        }
    }
}

/// Status report returned by status queries.
///
/// Exactly one of the payload fields is populated, matching `status`:
/// the interrupt when awaiting input, the artifacts when complete, and the
/// blocking issues when failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub instance_id: InstanceId,
    pub status: InstanceStatus,
    pub phase: Phase,
    pub sequence_no: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<InterruptRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<BTreeMap<Phase, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking_issues: Vec<BlockingIssue>,
    pub updated_at: DateTime<Utc>,
}

impl StatusReport {
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let state = &checkpoint.state;
        let status = state.status();
        Self {
            instance_id: state.instance_id.clone(),
            status,
            phase: state.phase,
            sequence_no: checkpoint.sequence_no,
            interrupt: state.pending_interrupt.clone(),
            artifacts: (status == InstanceStatus::Complete)
                .then(|| state.artifact_payloads.clone()),
            blocking_issues: if status == InstanceStatus::Failed {
                state.blocking_issues.clone()
            } else {
                Vec::new()
            },
            updated_at: state.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Immutable snapshot of a `WorkflowState` plus its sequence number.
///
/// Serializes flat: `{instance_id, sequence_no, phase, phase_flags, ...,
/// pending_interrupt?, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence_no: u64,
    #[serde(flatten)]
    pub state: WorkflowState,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(sequence_no: u64, state: WorkflowState, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence_no,
            state,
            timestamp,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.state.instance_id
    }
}

/// Lightweight listing row for an instance's latest checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub instance_id: InstanceId,
    pub phase: Phase,
    pub status: InstanceStatus,
    pub sequence_no: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fresh() -> WorkflowState {
        WorkflowState::new(InstanceId::from("I1"), json!({"chart": "nginx"}), Utc::now())
    }

    #[test]
    fn new_state_starts_in_requirements() {
        let state = fresh();
        assert_eq!(state.phase, Phase::Requirements);
        assert_eq!(state.phase_flags.len(), 4);
        assert!(state.phase_flags.values().all(|f| *f == PhaseStatus::NotStarted));
        assert_eq!(state.inputs["chart"], "nginx");
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.status(), InstanceStatus::Running);
    }

    #[test]
    fn scalar_input_is_wrapped() {
        let state = WorkflowState::new(InstanceId::from("x"), json!("free text"), Utc::now());
        assert_eq!(state.inputs["input"], "free text");
    }

    #[test]
    fn prerequisites_follow_phase_order() {
        let mut state = fresh();
        assert!(state.prerequisites_met(Phase::Requirements));
        assert!(!state.prerequisites_met(Phase::Planning));

        state.phase_flags.insert(Phase::Requirements, PhaseStatus::Complete);
        assert!(state.prerequisites_met(Phase::Planning));
        assert!(!state.prerequisites_met(Phase::Complete));
    }

    #[test]
    fn issues_resolve_without_removal() {
        let mut state = fresh();
        let now = Utc::now();
        state.raise_issue("validation", Phase::Validation, &FailureReason::validation("bad"), 1, now);
        state.raise_issue("validation", Phase::Validation, &FailureReason::validation("worse"), 2, now);
        assert_eq!(state.open_issues("validation").count(), 2);

        let resolved = state.resolve_issues("validation", "succeeded on attempt 3", now);
        assert_eq!(resolved, 2);
        assert_eq!(state.blocking_issues.len(), 2);
        assert!(!state.has_open_issues());
    }

    #[test]
    fn phase_round_trips_through_str() {
        for phase in Phase::WORKING {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn checkpoint_serializes_flat() {
        let checkpoint = Checkpoint::new(3, fresh(), Utc::now());
        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["instance_id"], "I1");
        assert_eq!(value["sequence_no"], 3);
        assert_eq!(value["phase"], "requirements");
        assert!(value.get("timestamp").is_some());
        assert!(value["phase_flags"].get("requirements").is_some());

        let back: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn status_report_exposes_issues_only_when_failed() {
        let mut state = fresh();
        state.raise_issue("planning", Phase::Planning, &FailureReason::fatal("boom"), 1, Utc::now());
        let report = StatusReport::from_checkpoint(&Checkpoint::new(1, state.clone(), Utc::now()));
        assert_eq!(report.status, InstanceStatus::Running);
        assert!(report.blocking_issues.is_empty());

        state.phase = Phase::Failed;
        let report = StatusReport::from_checkpoint(&Checkpoint::new(2, state, Utc::now()));
        assert_eq!(report.status, InstanceStatus::Failed);
        assert_eq!(report.blocking_issues.len(), 1);
    }
}
