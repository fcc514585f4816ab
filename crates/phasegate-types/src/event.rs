//! Transition events emitted by the orchestrator.
//!
//! Every phase transition and gate event produces a `WorkflowEvent` on the
//! event bus. Events are one-way notifications for logging and metrics; they
//! are not part of the durability contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::{InstanceId, Phase};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InstanceStarted,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    RetryScheduled,
    Escalated,
    GateRequested,
    GateResumed,
    Reworked,
    Recovered,
    Completed,
    Failed,
}

/// Structured record for one transition or gate event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub instance_id: InstanceId,
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub event_kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WorkflowEvent {
    pub fn new(
        instance_id: InstanceId,
        from_phase: Phase,
        to_phase: Phase,
        event_kind: EventKind,
    ) -> Self {
        Self {
            instance_id,
            from_phase,
            to_phase,
            event_kind,
            timestamp: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
