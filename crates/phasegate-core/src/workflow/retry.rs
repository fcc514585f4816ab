//! Bounded retry / self-heal controller.
//!
//! Per operation the controller walks `Idle(0) -> Attempting(n) -> {Success,
//! Attempting(n+1), Escalated}`. The counter lives in
//! `WorkflowState::retry_counters`, so the budget survives restarts. Once the
//! budget is spent the failure becomes a human-facing escalation interrupt;
//! no further automatic attempts happen until that interrupt is resumed.

use chrono::{DateTime, Utc};
use phasegate_types::event::EventKind;
use phasegate_types::failure::{FailureKind, FailureReason};
use phasegate_types::gate::{Decision, GateKind, InterruptRequest};
use phasegate_types::workflow::{Phase, WorkflowState};
use serde_json::{Value, json};

/// Suffix of escalation gate names (`"<operation>_escalation"`).
pub const ESCALATION_SUFFIX: &str = "_escalation";

/// Escalation gate name for an operation.
pub fn escalation_gate(operation: &str) -> String {
    format!("{operation}{ESCALATION_SUFFIX}")
}

/// What the engine should do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-invoke the phase. `issue_id` is the issue raised for this failure.
    Retry { attempt: u32, issue_id: u32 },
    /// Budget exhausted: suspend on this interrupt.
    Escalate(InterruptRequest),
    /// Unrecoverable: the instance must fail.
    Fail(String),
}

/// Stateless retry policy; all per-operation state lives in `WorkflowState`.
#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    max_retries: u32,
}

impl RetryController {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Record a failed attempt of `phase` and decide what happens next.
    pub fn on_failure(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        failure: &FailureReason,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let operation = phase.operation();
        let count = state.retry_count(operation);
        let attempt = count + 1;
        let issue_id = state.raise_issue(operation, phase, failure, attempt, now);
        state.record(EventKind::PhaseFailed, Some(failure.to_string()), now);

        if failure.kind == FailureKind::Fatal {
            return RetryDecision::Fail(format!("{operation}: {}", failure.message));
        }

        if count < self.max_retries {
            state
                .retry_counters
                .insert(operation.to_string(), count + 1);
            state.record(
                EventKind::RetryScheduled,
                Some(format!("retry {} of {}", count + 1, self.max_retries)),
                now,
            );
            return RetryDecision::Retry { attempt, issue_id };
        }

        RetryDecision::Escalate(self.escalation_request(state, phase, attempt, now))
    }

    /// Reset the operation's budget after a successful attempt.
    ///
    /// Prior issues stay in `blocking_issues` for audit, marked resolved.
    pub fn on_success(&self, state: &mut WorkflowState, phase: Phase, now: DateTime<Utc>) {
        let operation = phase.operation();
        let attempt = state.retry_count(operation) + 1;
        let resolved = state.resolve_issues(
            operation,
            &format!("succeeded on attempt {attempt}"),
            now,
        );
        if resolved > 0 {
            tracing::debug!(operation, resolved, "resolved blocking issues after success");
        }
        state.retry_counters.insert(operation.to_string(), 0);
    }

    /// Grant a fresh budget after a human approves an escalation.
    pub fn reset(&self, state: &mut WorkflowState, phase: Phase) {
        state
            .retry_counters
            .insert(phase.operation().to_string(), 0);
    }

    /// Attach a remediation note to the issue raised for the failed attempt.
    pub fn record_remediation(&self, state: &mut WorkflowState, issue_id: u32, note: Value) {
        if let Some(issue) = state.blocking_issues.iter_mut().find(|i| i.id == issue_id) {
            issue.remediation = Some(note);
        }
    }

    fn escalation_request(
        &self,
        state: &WorkflowState,
        phase: Phase,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> InterruptRequest {
        let operation = phase.operation();
        let issues: Vec<&_> = state.open_issues(operation).collect();
        let context = json!({
            "operation": operation,
            "attempts": attempts,
            "max_retries": self.max_retries,
            "issues": issues,
        });

        InterruptRequest {
            gate_name: escalation_gate(operation),
            kind: GateKind::Escalation,
            phase,
            question: format!(
                "{operation} failed {attempts} time(s) and exhausted its automatic retries. \
                 Approve to grant another round of attempts or reject to fail the workflow."
            ),
            structured_context: context,
            allowed_decisions: vec![Decision::Approve, Decision::Reject, Decision::Modify],
            raised_at: now,
        }
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasegate_types::workflow::InstanceId;

    fn fresh() -> WorkflowState {
        WorkflowState::new(InstanceId::from("I1"), json!({}), Utc::now())
    }

    /// Count attempts until escalation for a handler that always fails.
    fn attempts_until_escalation(max_retries: u32) -> u32 {
        let controller = RetryController::new(max_retries);
        let mut state = fresh();
        let failure = FailureReason::transient("rate limited");
        let mut attempts = 0;
        loop {
            attempts += 1;
            match controller.on_failure(&mut state, Phase::Validation, &failure, Utc::now()) {
                RetryDecision::Retry { .. } => continue,
                RetryDecision::Escalate(req) => {
                    assert_eq!(req.gate_name, "validation_escalation");
                    assert_eq!(req.kind, GateKind::Escalation);
                    return attempts;
                }
                RetryDecision::Fail(reason) => panic!("unexpected fail: {reason}"),
            }
        }
    }

    #[test]
    fn escalates_after_exactly_max_retries_plus_one_attempts() {
        for max_retries in [0, 1, 2, 5] {
            assert_eq!(attempts_until_escalation(max_retries), max_retries + 1);
        }
    }

    #[test]
    fn fatal_failure_skips_retries() {
        let controller = RetryController::default();
        let mut state = fresh();
        let decision = controller.on_failure(
            &mut state,
            Phase::Planning,
            &FailureReason::fatal("disk gone"),
            Utc::now(),
        );
        assert!(matches!(decision, RetryDecision::Fail(_)));
        assert_eq!(state.retry_count("planning"), 0);
        assert_eq!(state.open_issues("planning").count(), 1);
    }

    #[test]
    fn success_resets_counter_and_resolves_issues() {
        let controller = RetryController::default();
        let mut state = fresh();
        let failure = FailureReason::validation("schema mismatch");
        controller.on_failure(&mut state, Phase::Validation, &failure, Utc::now());
        controller.on_failure(&mut state, Phase::Validation, &failure, Utc::now());
        assert_eq!(state.retry_count("validation"), 2);

        controller.on_success(&mut state, Phase::Validation, Utc::now());
        assert_eq!(state.retry_counters["validation"], 0);
        assert_eq!(state.blocking_issues.len(), 2);
        assert!(!state.has_open_issues());
        assert_eq!(
            state.blocking_issues[1].resolution.as_deref(),
            Some("succeeded on attempt 3")
        );
    }

    #[test]
    fn escalation_context_carries_failure_history() {
        let controller = RetryController::new(1);
        let mut state = fresh();
        let failure = FailureReason::validation("bad values");
        controller.on_failure(&mut state, Phase::Generation, &failure, Utc::now());
        let decision = controller.on_failure(&mut state, Phase::Generation, &failure, Utc::now());

        let RetryDecision::Escalate(req) = decision else {
            panic!("expected escalation");
        };
        assert_eq!(req.structured_context["attempts"], 2);
        assert_eq!(req.structured_context["issues"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn remediation_note_lands_on_issue() {
        let controller = RetryController::default();
        let mut state = fresh();
        let decision = controller.on_failure(
            &mut state,
            Phase::Validation,
            &FailureReason::validation("missing tag"),
            Utc::now(),
        );
        let RetryDecision::Retry { issue_id, attempt } = decision else {
            panic!("expected retry");
        };
        assert_eq!(attempt, 1);
        controller.record_remediation(&mut state, issue_id, json!({"patched": "image.tag"}));
        assert_eq!(
            state.blocking_issues[0].remediation,
            Some(json!({"patched": "image.tag"}))
        );
    }
}
