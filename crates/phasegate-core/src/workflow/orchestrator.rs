//! Phase state machine.
//!
//! `Orchestrator::advance` decides the next action for an instance purely from
//! its flags: the same state (and clock reading) always yields the same
//! action. The orchestrator is also the only place that merges phase results
//! into `WorkflowState`, so `phase_flags` and `artifact_payloads` always move
//! together.

use chrono::{DateTime, Utc};
use phasegate_types::config::OrchestratorConfig;
use phasegate_types::event::EventKind;
use phasegate_types::failure::FailureReason;
use phasegate_types::gate::ApprovalStatus;
use phasegate_types::workflow::{Phase, PhaseStatus, WorkflowState};
use serde_json::Value;

use super::transition;

/// Operation name used for issues raised by the orchestrator itself.
pub const ORCHESTRATOR_OPERATION: &str = "orchestrator";

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// The single next step selected by `advance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run the sub-workflow for this phase.
    InvokePhase(Phase),
    /// Open (or re-surface) the named HITL gate.
    RequestGate(String),
    /// The instance reached `Complete`.
    Complete,
    /// The instance was forced to `Failed` for the given reason.
    Fail(String),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("instance is already {0}")]
    Terminal(Phase),

    #[error("instance is suspended at gate '{0}'")]
    Suspended(String),

    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },

    #[error("prerequisites of phase {0} are not complete")]
    PrerequisitesNotMet(Phase),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Deterministic driver of the phase state machine.
#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Select the next action for `state`.
    ///
    /// Returns the updated state (loop counter bumped, phase moved when a
    /// phase is entered or the instance finishes) alongside the action.
    pub fn advance(
        &self,
        state: &WorkflowState,
        now: DateTime<Utc>,
    ) -> Result<(WorkflowState, Action), OrchestratorError> {
        if state.is_terminal() {
            return Err(OrchestratorError::Terminal(state.phase));
        }
        if let Some(interrupt) = &state.pending_interrupt {
            return Err(OrchestratorError::Suspended(interrupt.gate_name.clone()));
        }

        let mut next = state.clone();
        next.loop_counter += 1;

        let ceiling = self.config.loop_ceiling.max(1);
        if next.loop_counter >= ceiling {
            let reason = format!("loop counter reached ceiling of {ceiling}");
            let attempt = next.loop_counter;
            let phase = next.phase;
            next.raise_issue(
                ORCHESTRATOR_OPERATION,
                phase,
                &FailureReason::fatal(reason.clone()),
                attempt,
                now,
            );
            self.fail(&mut next, &reason, now);
            return Ok((next, Action::Fail(reason)));
        }

        if let Some(gate) = first_with_status(&next, ApprovalStatus::Rejected) {
            let reason = format!("gate '{gate}' was rejected");
            self.fail(&mut next, &reason, now);
            return Ok((next, Action::Fail(reason)));
        }

        if let Some(gate) = first_with_status(&next, ApprovalStatus::Pending) {
            return Ok((next, Action::RequestGate(gate)));
        }

        for phase in Phase::WORKING {
            if next.is_phase_complete(phase) {
                if let Some(gate) = self
                    .config
                    .gates_after(phase)
                    .find(|g| next.approval(&g.name).is_none())
                {
                    return Ok((next, Action::RequestGate(gate.name.clone())));
                }
                continue;
            }

            self.enter(&mut next, phase, now)?;
            return Ok((next, Action::InvokePhase(phase)));
        }

        self.enter(&mut next, Phase::Complete, now)?;
        Ok((next, Action::Complete))
    }

    /// Move `state` into `phase`, enforcing prerequisites and the
    /// transition table.
    fn enter(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        if !state.prerequisites_met(phase) {
            return Err(OrchestratorError::PrerequisitesNotMet(phase));
        }
        transition::check(state.phase, phase)?;

        state.phase = phase;
        if phase == Phase::Complete {
            state.record(EventKind::Completed, None, now);
        } else {
            let attempt = state.retry_count(phase.operation()) + 1;
            state.record(EventKind::PhaseStarted, Some(format!("attempt {attempt}")), now);
        }
        Ok(())
    }

    /// Force the instance into `Failed`.
    ///
    /// Every working phase has an edge to `Failed`, so this cannot be illegal.
    pub fn fail(&self, state: &mut WorkflowState, reason: &str, now: DateTime<Utc>) {
        if state.is_terminal() {
            return;
        }
        state.phase = Phase::Failed;
        state.pending_interrupt = None;
        state.record(EventKind::Failed, Some(reason.to_string()), now);
    }

    /// Merge a successful phase's output into state.
    ///
    /// The artifact and the completion flag are written together.
    pub fn apply_delta(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        artifact: Value,
        now: DateTime<Utc>,
    ) {
        state.artifact_payloads.insert(phase, artifact);
        state.phase_flags.insert(phase, PhaseStatus::Complete);
        state.record(EventKind::PhaseCompleted, None, now);
    }

    /// Send the instance back to `target` on behalf of the phase `from`.
    ///
    /// Resets `target` and every later phase to `not_started`, drops their
    /// artifacts, clears the approval flags and resolutions of gates tied to
    /// those phases, and raises an issue for `from`. Returns the reset phases.
    pub fn apply_rework(
        &self,
        state: &mut WorkflowState,
        from: Phase,
        target: Phase,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Phase>, OrchestratorError> {
        if !target.is_working() || target >= from {
            return Err(OrchestratorError::IllegalTransition { from, to: target });
        }
        transition::check(from, target)?;

        let mut reset = vec![target];
        reset.extend_from_slice(target.successors());

        for phase in &reset {
            state.phase_flags.insert(*phase, PhaseStatus::NotStarted);
            state.artifact_payloads.remove(phase);
        }

        for gate in self.config.gates.iter().filter(|g| reset.contains(&g.after)) {
            state.approval_flags.remove(&gate.name);
            state.resolutions.remove(&gate.name);
        }
        let stale: Vec<String> = state
            .resolutions
            .iter()
            .filter(|(_, r)| reset.contains(&r.phase))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            state.resolutions.remove(&name);
            state.approval_flags.remove(&name);
        }

        let attempt = state.retry_count(from.operation()) + 1;
        state.raise_issue(
            from.operation(),
            from,
            &FailureReason::validation(reason),
            attempt,
            now,
        );
        state.record(
            EventKind::Reworked,
            Some(format!("{from} -> {target}: {reason}")),
            now,
        );
        Ok(reset)
    }
}

fn first_with_status(state: &WorkflowState, status: ApprovalStatus) -> Option<String> {
    state
        .approval_flags
        .iter()
        .find(|(_, s)| **s == status)
        .map(|(name, _)| name.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use phasegate_types::gate::{Decision, GateKind, GateResolution, InterruptRequest};
    use phasegate_types::workflow::InstanceId;
    use serde_json::json;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::default())
    }

    fn fresh() -> WorkflowState {
        WorkflowState::new(InstanceId::from("I1"), json!({}), Utc::now())
    }

    fn complete(state: &mut WorkflowState, phase: Phase) {
        state.artifact_payloads.insert(phase, json!({ "phase": phase.as_str() }));
        state.phase_flags.insert(phase, PhaseStatus::Complete);
        state.phase = phase;
    }

    #[test]
    fn fresh_instance_invokes_requirements() {
        let (next, action) = orchestrator().advance(&fresh(), Utc::now()).unwrap();
        assert_eq!(action, Action::InvokePhase(Phase::Requirements));
        assert_eq!(next.loop_counter, 1);
        assert_eq!(next.phase, Phase::Requirements);
    }

    #[test]
    fn advance_is_deterministic() {
        let orch = orchestrator();
        let now = Utc::now();
        let mut state = fresh();
        complete(&mut state, Phase::Requirements);

        let (a, action_a) = orch.advance(&state, now).unwrap();
        let (b, action_b) = orch.advance(&state, now).unwrap();
        assert_eq!(action_a, action_b);
        assert_eq!(a, b);
        assert_eq!(action_a, Action::InvokePhase(Phase::Planning));
    }

    #[test]
    fn gate_after_generation_blocks_validation() {
        let mut state = fresh();
        complete(&mut state, Phase::Requirements);
        complete(&mut state, Phase::Planning);
        complete(&mut state, Phase::Generation);

        let (next, action) = orchestrator().advance(&state, Utc::now()).unwrap();
        assert_eq!(action, Action::RequestGate("generation_review".to_string()));
        assert_eq!(next.phase, Phase::Generation);
    }

    #[test]
    fn approved_gate_lets_validation_run() {
        let mut state = fresh();
        complete(&mut state, Phase::Requirements);
        complete(&mut state, Phase::Planning);
        complete(&mut state, Phase::Generation);
        state
            .approval_flags
            .insert("generation_review".to_string(), ApprovalStatus::Approved);

        let (next, action) = orchestrator().advance(&state, Utc::now()).unwrap();
        assert_eq!(action, Action::InvokePhase(Phase::Validation));
        assert_eq!(next.phase, Phase::Validation);
    }

    #[test]
    fn pending_flag_requests_gate_again() {
        let mut state = fresh();
        state
            .approval_flags
            .insert("generation_review".to_string(), ApprovalStatus::Pending);

        let (_, action) = orchestrator().advance(&state, Utc::now()).unwrap();
        assert_eq!(action, Action::RequestGate("generation_review".to_string()));
    }

    #[test]
    fn rejected_flag_fails_instance() {
        let mut state = fresh();
        state
            .approval_flags
            .insert("generation_review".to_string(), ApprovalStatus::Rejected);

        let (next, action) = orchestrator().advance(&state, Utc::now()).unwrap();
        assert!(matches!(action, Action::Fail(_)));
        assert_eq!(next.phase, Phase::Failed);
    }

    #[test]
    fn all_phases_complete_finishes_instance() {
        let mut state = fresh();
        for phase in Phase::WORKING {
            complete(&mut state, phase);
        }
        state
            .approval_flags
            .insert("generation_review".to_string(), ApprovalStatus::Modified);

        let (next, action) = orchestrator().advance(&state, Utc::now()).unwrap();
        assert_eq!(action, Action::Complete);
        assert_eq!(next.phase, Phase::Complete);
        assert!(next.flags_consistent());
    }

    #[test]
    fn terminal_and_suspended_states_are_rejected() {
        let orch = orchestrator();
        let mut state = fresh();
        state.phase = Phase::Complete;
        assert_eq!(
            orch.advance(&state, Utc::now()).unwrap_err(),
            OrchestratorError::Terminal(Phase::Complete)
        );

        let mut state = fresh();
        state.pending_interrupt = Some(InterruptRequest::new(
            "clarify",
            Phase::Requirements,
            "Which namespace?",
        ));
        assert_eq!(
            orch.advance(&state, Utc::now()).unwrap_err(),
            OrchestratorError::Suspended("clarify".to_string())
        );
    }

    #[test]
    fn loop_ceiling_fails_at_exact_count() {
        let orch = Orchestrator::new(OrchestratorConfig::default().with_loop_ceiling(3));
        let mut state = fresh();

        for expected in 1..3 {
            let (next, action) = orch.advance(&state, Utc::now()).unwrap();
            assert_eq!(action, Action::InvokePhase(Phase::Requirements));
            assert_eq!(next.loop_counter, expected);
            state = next;
        }

        let (next, action) = orch.advance(&state, Utc::now()).unwrap();
        assert!(matches!(action, Action::Fail(_)));
        assert_eq!(next.loop_counter, 3);
        assert_eq!(next.phase, Phase::Failed);
        assert_eq!(next.open_issues(ORCHESTRATOR_OPERATION).count(), 1);
    }

    #[test]
    fn apply_delta_keeps_flags_and_artifacts_together() {
        let orch = orchestrator();
        let mut state = fresh();
        orch.apply_delta(&mut state, Phase::Requirements, json!({"chart": "nginx"}), Utc::now());
        assert!(state.is_phase_complete(Phase::Requirements));
        assert!(state.flags_consistent());
    }

    #[test]
    fn rework_resets_target_and_later_phases() {
        let orch = orchestrator();
        let now = Utc::now();
        let mut state = fresh();
        for phase in Phase::WORKING {
            complete(&mut state, phase);
        }
        state
            .approval_flags
            .insert("generation_review".to_string(), ApprovalStatus::Approved);
        state.resolutions.insert(
            "generation_review".to_string(),
            GateResolution {
                kind: GateKind::Approval,
                phase: Phase::Generation,
                decision: Decision::Approve,
                payload: json!({}),
                resolved_at: now,
            },
        );

        let reset = orch
            .apply_rework(&mut state, Phase::Validation, Phase::Generation, "lint failed", now)
            .unwrap();
        assert_eq!(reset, vec![Phase::Generation, Phase::Validation]);
        assert!(state.is_phase_complete(Phase::Planning));
        assert!(!state.is_phase_complete(Phase::Generation));
        assert!(!state.artifact_payloads.contains_key(&Phase::Validation));
        assert!(state.approval("generation_review").is_none());
        assert!(state.resolutions.is_empty());
        assert!(state.flags_consistent());
        assert_eq!(state.open_issues("validation").count(), 1);

        let (next, action) = orch.advance(&state, now).unwrap();
        assert_eq!(action, Action::InvokePhase(Phase::Generation));
        assert_eq!(next.phase, Phase::Generation);
    }

    #[test]
    fn rework_cannot_skip_the_table() {
        let orch = orchestrator();
        let mut state = fresh();
        let err = orch
            .apply_rework(&mut state, Phase::Validation, Phase::Planning, "redo", Utc::now())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));

        let err = orch
            .apply_rework(&mut state, Phase::Planning, Phase::Validation, "ahead", Utc::now())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));
    }
}
