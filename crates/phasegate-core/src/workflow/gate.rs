//! Human-in-the-loop gate manager.
//!
//! A gate moves `Open -> Suspended -> Resumed -> Closed`. Suspending writes
//! both the `pending` approval flag and the `InterruptRequest` into state, so
//! the checkpoint that captures the suspension also captures the exact
//! question. Resuming validates the signal against that stored question
//! before anything in state is touched.

use chrono::{DateTime, Utc};
use phasegate_types::config::OrchestratorConfig;
use phasegate_types::error::ProtocolError;
use phasegate_types::event::EventKind;
use phasegate_types::gate::{
    ApprovalStatus, Decision, GateKind, GateResolution, InterruptRequest, ResumeSignal,
};
use phasegate_types::workflow::{Phase, WorkflowState};
use serde_json::{Value, json};

/// Result of asking for a gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Already approved or modified; nothing to ask.
    Passed,
    /// Already rejected; the instance must fail.
    Rejected,
    /// The instance is now suspended on this interrupt.
    Suspended(InterruptRequest),
}

/// Effect of an applied resume signal on the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeEffect {
    /// Continue driving the instance.
    Continue,
    /// The decision rejects the gate; the instance must fail.
    Fail(String),
}

/// Opens, validates and closes HITL gates.
#[derive(Debug, Clone, Default)]
pub struct GateManager {
    config: OrchestratorConfig,
}

impl GateManager {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    /// Ask the named declared gate.
    ///
    /// Idempotent: an approved/modified gate returns `Passed` without raising
    /// a new interrupt, and a gate that is already pending re-surfaces the
    /// stored question instead of asking a new one.
    pub fn request_gate(
        &self,
        state: &mut WorkflowState,
        name: &str,
        now: DateTime<Utc>,
    ) -> GateOutcome {
        match state.approval(name) {
            Some(status) if status.allows_progress() => return GateOutcome::Passed,
            Some(ApprovalStatus::Rejected) => return GateOutcome::Rejected,
            _ => {}
        }

        if let Some(existing) = state
            .pending_interrupt
            .as_ref()
            .filter(|i| i.gate_name == name)
        {
            return GateOutcome::Suspended(existing.clone());
        }

        let request = match self.config.gate(name) {
            Some(def) => InterruptRequest {
                gate_name: def.name.clone(),
                kind: GateKind::Approval,
                phase: def.after,
                question: def.question.clone(),
                structured_context: json!({
                    "phase": def.after,
                    "artifact": state.artifact_payloads.get(&def.after),
                }),
                allowed_decisions: def.allowed_decisions.clone(),
                raised_at: now,
            },
            None => InterruptRequest {
                gate_name: name.to_string(),
                kind: GateKind::Approval,
                phase: state.phase,
                question: format!("Gate '{name}' is pending. Approve to continue?"),
                structured_context: Value::Null,
                allowed_decisions: Decision::ALL.to_vec(),
                raised_at: now,
            },
        };

        self.suspend(state, request.clone(), now);
        GateOutcome::Suspended(request)
    }

    /// Ask a gate raised by a phase handler.
    ///
    /// A handler re-raising a gate that was already answered gets `Passed`
    /// back; the engine treats that as a phase failure rather than asking
    /// the same question twice.
    pub fn request_phase_gate(
        &self,
        state: &mut WorkflowState,
        request: InterruptRequest,
        now: DateTime<Utc>,
    ) -> GateOutcome {
        match state.approval(&request.gate_name) {
            Some(status) if status.allows_progress() => GateOutcome::Passed,
            Some(ApprovalStatus::Rejected) => GateOutcome::Rejected,
            _ => {
                self.suspend(state, request.clone(), now);
                GateOutcome::Suspended(request)
            }
        }
    }

    /// Suspend the instance on `request`.
    pub fn suspend(&self, state: &mut WorkflowState, request: InterruptRequest, now: DateTime<Utc>) {
        let event = match request.kind {
            GateKind::Escalation => EventKind::Escalated,
            GateKind::Approval | GateKind::Phase => EventKind::GateRequested,
        };
        state
            .approval_flags
            .insert(request.gate_name.clone(), ApprovalStatus::Pending);
        let detail = request.gate_name.clone();
        state.pending_interrupt = Some(request);
        state.record(event, Some(detail), now);
    }

    /// Check `signal` against the question the instance is suspended on.
    ///
    /// `enforce_decisions` is false only for cancellation, which may reject
    /// any gate.
    pub fn validate_resume(
        &self,
        state: &WorkflowState,
        signal: &ResumeSignal,
        enforce_decisions: bool,
    ) -> Result<InterruptRequest, ProtocolError> {
        let interrupt = match (&state.pending_interrupt, state.is_terminal()) {
            (Some(interrupt), false) => interrupt,
            _ => return Err(ProtocolError::NotSuspended(state.instance_id.clone())),
        };

        if let Some(gate) = &signal.gate_name {
            if gate != &interrupt.gate_name {
                return Err(ProtocolError::SignalMismatch {
                    expected: interrupt.gate_name.clone(),
                    actual: gate.clone(),
                });
            }
        }

        if enforce_decisions && !interrupt.allows(signal.decision) {
            let expected = interrupt
                .allowed_decisions
                .iter()
                .map(Decision::as_str)
                .collect::<Vec<_>>()
                .join("|");
            return Err(ProtocolError::SignalMismatch {
                expected,
                actual: signal.decision.to_string(),
            });
        }

        Ok(interrupt.clone())
    }

    /// Close the gate `interrupt` with the caller's answer.
    ///
    /// Must only be called with the interrupt returned by `validate_resume`.
    pub fn apply_resume(
        &self,
        state: &mut WorkflowState,
        interrupt: &InterruptRequest,
        signal: &ResumeSignal,
        now: DateTime<Utc>,
    ) -> ResumeEffect {
        let name = interrupt.gate_name.clone();
        state.pending_interrupt = None;
        state.resolutions.insert(
            name.clone(),
            GateResolution {
                kind: interrupt.kind,
                phase: interrupt.phase,
                decision: signal.decision,
                payload: signal.payload.clone(),
                resolved_at: now,
            },
        );

        let replaces_artifact = signal.decision == Decision::Modify
            && interrupt.kind == GateKind::Approval
            && state.is_phase_complete(interrupt.phase);
        merge_payload(state, &signal.payload, interrupt.phase, replaces_artifact);

        state.record(
            EventKind::GateResumed,
            Some(format!("{name}: {}", signal.decision)),
            now,
        );

        if signal.decision == Decision::Reject {
            state
                .approval_flags
                .insert(name.clone(), ApprovalStatus::Rejected);
            return ResumeEffect::Fail(format!("gate '{name}' was rejected"));
        }

        match interrupt.kind {
            GateKind::Escalation => {
                // A later exhaustion must be able to ask again.
                state.approval_flags.remove(&name);
                state
                    .retry_counters
                    .insert(interrupt.phase.operation().to_string(), 0);
            }
            GateKind::Approval | GateKind::Phase => {
                state
                    .approval_flags
                    .insert(name, signal.decision.approval_status());
            }
        }
        ResumeEffect::Continue
    }
}

/// Shallow-merge an object payload into `inputs`.
///
/// When `replaces_artifact` is set, an `artifact` key replaces the artifact
/// of `phase` instead of being merged.
fn merge_payload(state: &mut WorkflowState, payload: &Value, phase: Phase, replaces_artifact: bool) {
    let Value::Object(map) = payload else {
        return;
    };
    for (key, value) in map {
        if replaces_artifact && key == "artifact" {
            state.artifact_payloads.insert(phase, value.clone());
        } else {
            state.inputs.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasegate_types::workflow::{InstanceId, PhaseStatus};

    fn manager() -> GateManager {
        GateManager::new(OrchestratorConfig::default())
    }

    fn at_review() -> WorkflowState {
        let mut state = WorkflowState::new(InstanceId::from("I2"), json!({}), Utc::now());
        for phase in [Phase::Requirements, Phase::Planning, Phase::Generation] {
            state.artifact_payloads.insert(phase, json!({"v": 1}));
            state.phase_flags.insert(phase, PhaseStatus::Complete);
        }
        state.phase = Phase::Generation;
        state
    }

    #[test]
    fn request_gate_suspends_with_declared_question() {
        let mut state = at_review();
        let outcome = manager().request_gate(&mut state, "generation_review", Utc::now());

        let GateOutcome::Suspended(req) = outcome else {
            panic!("expected suspension");
        };
        assert_eq!(req.phase, Phase::Generation);
        assert_eq!(req.structured_context["artifact"], json!({"v": 1}));
        assert_eq!(state.approval("generation_review"), Some(ApprovalStatus::Pending));
        assert_eq!(state.pending_interrupt.as_ref(), Some(&req));
    }

    #[test]
    fn approved_gate_is_not_asked_again() {
        let mut state = at_review();
        state
            .approval_flags
            .insert("generation_review".to_string(), ApprovalStatus::Approved);
        let history_len = state.history.len();

        let outcome = manager().request_gate(&mut state, "generation_review", Utc::now());
        assert_eq!(outcome, GateOutcome::Passed);
        assert!(state.pending_interrupt.is_none());
        assert_eq!(state.history.len(), history_len);
    }

    #[test]
    fn pending_gate_resurfaces_same_question() {
        let gm = manager();
        let mut state = at_review();
        let GateOutcome::Suspended(first) = gm.request_gate(&mut state, "generation_review", Utc::now())
        else {
            panic!("expected suspension");
        };
        let GateOutcome::Suspended(second) = gm.request_gate(&mut state, "generation_review", Utc::now())
        else {
            panic!("expected suspension");
        };
        assert_eq!(first, second);
    }

    #[test]
    fn resume_requires_suspension() {
        let state = at_review();
        let signal = ResumeSignal::new("I2", Decision::Approve);
        assert!(matches!(
            manager().validate_resume(&state, &signal, true),
            Err(ProtocolError::NotSuspended(_))
        ));
    }

    #[test]
    fn resume_rejects_wrong_gate_and_disallowed_decision() {
        let gm = manager();
        let mut state = at_review();
        let request = InterruptRequest::new("namespace", Phase::Generation, "Namespace?")
            .with_decisions(vec![Decision::Approve]);
        gm.suspend(&mut state, request, Utc::now());

        let wrong_gate = ResumeSignal::new("I2", Decision::Approve).for_gate("generation_review");
        assert!(matches!(
            gm.validate_resume(&state, &wrong_gate, true),
            Err(ProtocolError::SignalMismatch { .. })
        ));

        let wrong_decision = ResumeSignal::new("I2", Decision::Reject);
        assert!(matches!(
            gm.validate_resume(&state, &wrong_decision, true),
            Err(ProtocolError::SignalMismatch { .. })
        ));
        assert!(gm.validate_resume(&state, &wrong_decision, false).is_ok());
    }

    #[test]
    fn approve_merges_payload_and_closes_gate() {
        let gm = manager();
        let mut state = at_review();
        gm.request_gate(&mut state, "generation_review", Utc::now());

        let signal = ResumeSignal::new("I2", Decision::Approve).with_payload(json!({"reviewer": "ops"}));
        let interrupt = gm.validate_resume(&state, &signal, true).unwrap();
        let effect = gm.apply_resume(&mut state, &interrupt, &signal, Utc::now());

        assert_eq!(effect, ResumeEffect::Continue);
        assert!(state.pending_interrupt.is_none());
        assert_eq!(state.approval("generation_review"), Some(ApprovalStatus::Approved));
        assert_eq!(state.inputs["reviewer"], "ops");
        assert_eq!(state.resolutions["generation_review"].decision, Decision::Approve);
    }

    #[test]
    fn modify_replaces_reviewed_artifact() {
        let gm = manager();
        let mut state = at_review();
        gm.request_gate(&mut state, "generation_review", Utc::now());

        let signal = ResumeSignal::new("I2", Decision::Modify)
            .with_payload(json!({"artifact": {"v": 2}, "note": "bumped"}));
        let interrupt = gm.validate_resume(&state, &signal, true).unwrap();
        gm.apply_resume(&mut state, &interrupt, &signal, Utc::now());

        assert_eq!(state.artifact_payloads[&Phase::Generation], json!({"v": 2}));
        assert!(!state.inputs.contains_key("artifact"));
        assert_eq!(state.inputs["note"], "bumped");
        assert_eq!(state.approval("generation_review"), Some(ApprovalStatus::Modified));
        assert!(state.flags_consistent());
    }

    #[test]
    fn reject_marks_flag_and_requests_failure() {
        let gm = manager();
        let mut state = at_review();
        gm.request_gate(&mut state, "generation_review", Utc::now());

        let signal = ResumeSignal::new("I2", Decision::Reject);
        let interrupt = gm.validate_resume(&state, &signal, true).unwrap();
        let effect = gm.apply_resume(&mut state, &interrupt, &signal, Utc::now());

        assert!(matches!(effect, ResumeEffect::Fail(_)));
        assert_eq!(state.approval("generation_review"), Some(ApprovalStatus::Rejected));
    }

    #[test]
    fn approved_escalation_resets_budget_and_clears_flag() {
        let gm = manager();
        let mut state = at_review();
        state.retry_counters.insert("validation".to_string(), 2);
        let request = InterruptRequest::new("validation_escalation", Phase::Validation, "Retry?")
            .with_kind(GateKind::Escalation);
        gm.suspend(&mut state, request, Utc::now());

        let signal = ResumeSignal::new("I2", Decision::Approve);
        let interrupt = gm.validate_resume(&state, &signal, true).unwrap();
        gm.apply_resume(&mut state, &interrupt, &signal, Utc::now());

        assert_eq!(state.retry_count("validation"), 0);
        assert!(state.approval("validation_escalation").is_none());
        assert!(state.resolutions.contains_key("validation_escalation"));
    }
}
