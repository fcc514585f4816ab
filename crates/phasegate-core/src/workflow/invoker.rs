//! Sub-workflow invoker and the phase handler contract.
//!
//! A phase handler is the external collaborator that does the actual work of
//! a phase. It never sees `WorkflowState`: the invoker builds a `PhaseInput`
//! from an explicit per-phase allow-list, runs the handler on its own task
//! with a fresh execution id, and hands the outcome back to the engine, which
//! performs the single authoritative merge.
//!
//! `PhaseHandler` uses RPITIT and therefore cannot be a trait object. The
//! registry stores handlers as `BoxPhaseHandler`, following the same
//! blanket-impl pattern as the other dynamic-dispatch wrappers:
//! 1. `PhaseHandlerDyn` is an object-safe trait with boxed futures
//! 2. Blanket-impl `PhaseHandlerDyn` for all `T: PhaseHandler`
//! 3. `BoxPhaseHandler` wraps `Box<dyn PhaseHandlerDyn>` and delegates

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use phasegate_types::failure::FailureReason;
use phasegate_types::gate::{GateKind, GateResolution, InterruptRequest};
use phasegate_types::workflow::{BlockingIssue, Phase, WorkflowState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PhaseInput / PhaseOutcome
// ---------------------------------------------------------------------------

/// The private, transformed view of state a phase handler receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseInput {
    /// Fresh per invocation; handlers must not reuse execution state across ids.
    pub execution_id: Uuid,
    pub phase: Phase,
    /// 1-based attempt number for this phase's operation.
    pub attempt: u32,
    /// Caller input, for phases that are allowed to read it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Map<String, Value>>,
    /// Artifacts of the upstream phases this phase may read.
    #[serde(default)]
    pub artifacts: BTreeMap<Phase, Value>,
    /// Unresolved issues relevant to this phase (e.g. validation findings
    /// for a regeneration).
    #[serde(default)]
    pub open_issues: Vec<BlockingIssue>,
    /// Answers to gates this phase owns.
    #[serde(default)]
    pub resolutions: BTreeMap<String, GateResolution>,
}

/// What a phase handler reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    /// The phase finished; the value becomes `artifact_payloads[phase]`.
    Completed(Value),
    /// The phase needs human input before it can finish.
    Suspend(InterruptRequest),
    /// The phase failed; consumed by the retry controller.
    Failed(FailureReason),
    /// An upstream artifact must be regenerated starting at `target`.
    Rework { target: Phase, reason: String },
}

/// Fields of `WorkflowState` a phase is allowed to read.
struct Contract {
    inputs: bool,
    artifacts: &'static [Phase],
    issue_operations: &'static [&'static str],
}

fn contract(phase: Phase) -> Contract {
    match phase {
        Phase::Requirements => Contract {
            inputs: true,
            artifacts: &[],
            issue_operations: &["requirements"],
        },
        Phase::Planning => Contract {
            inputs: true,
            artifacts: &[Phase::Requirements],
            issue_operations: &["planning"],
        },
        Phase::Generation => Contract {
            inputs: false,
            artifacts: &[Phase::Requirements, Phase::Planning],
            issue_operations: &["generation", "validation"],
        },
        Phase::Validation => Contract {
            inputs: false,
            artifacts: &[Phase::Planning, Phase::Generation],
            issue_operations: &["validation"],
        },
        Phase::Complete | Phase::Failed => Contract {
            inputs: false,
            artifacts: &[],
            issue_operations: &[],
        },
    }
}

// ---------------------------------------------------------------------------
// PhaseHandler
// ---------------------------------------------------------------------------

/// External collaborator that performs one phase's work.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait PhaseHandler: Send + Sync {
    /// Run the phase against its transformed input.
    fn execute(&self, input: &PhaseInput) -> impl Future<Output = PhaseOutcome> + Send;

    /// Idempotent corrective action applied before an automatic retry.
    ///
    /// Returns an optional note recorded on the blocking issue. The default
    /// does nothing.
    fn remediate(
        &self,
        _input: &PhaseInput,
        _failure: &FailureReason,
    ) -> impl Future<Output = Result<Option<Value>, FailureReason>> + Send {
        async { Ok(None) }
    }
}

/// Object-safe version of [`PhaseHandler`] with boxed futures.
pub trait PhaseHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        input: &'a PhaseInput,
    ) -> Pin<Box<dyn Future<Output = PhaseOutcome> + Send + 'a>>;

    fn remediate_boxed<'a>(
        &'a self,
        input: &'a PhaseInput,
        failure: &'a FailureReason,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, FailureReason>> + Send + 'a>>;
}

impl<T: PhaseHandler> PhaseHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        input: &'a PhaseInput,
    ) -> Pin<Box<dyn Future<Output = PhaseOutcome> + Send + 'a>> {
        Box::pin(self.execute(input))
    }

    fn remediate_boxed<'a>(
        &'a self,
        input: &'a PhaseInput,
        failure: &'a FailureReason,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, FailureReason>> + Send + 'a>> {
        Box::pin(self.remediate(input, failure))
    }
}

/// Type-erased phase handler for runtime handler selection.
pub struct BoxPhaseHandler {
    inner: Box<dyn PhaseHandlerDyn + Send + Sync>,
}

impl BoxPhaseHandler {
    pub fn new<T: PhaseHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn execute(&self, input: &PhaseInput) -> PhaseOutcome {
        self.inner.execute_boxed(input).await
    }

    pub async fn remediate(
        &self,
        input: &PhaseInput,
        failure: &FailureReason,
    ) -> Result<Option<Value>, FailureReason> {
        self.inner.remediate_boxed(input, failure).await
    }
}

impl std::fmt::Debug for BoxPhaseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxPhaseHandler").finish_non_exhaustive()
    }
}

/// Adapts a synchronous closure into a `PhaseHandler`.
pub struct FnPhaseHandler<F> {
    func: F,
}

impl<F> FnPhaseHandler<F>
where
    F: Fn(&PhaseInput) -> PhaseOutcome + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> PhaseHandler for FnPhaseHandler<F>
where
    F: Fn(&PhaseInput) -> PhaseOutcome + Send + Sync,
{
    fn execute(&self, input: &PhaseInput) -> impl Future<Output = PhaseOutcome> + Send {
        let outcome = (self.func)(input);
        async move { outcome }
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Phase handlers keyed by the phase they serve.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Phase, Arc<BoxPhaseHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: PhaseHandler + 'static>(&mut self, phase: Phase, handler: T) {
        self.handlers
            .insert(phase, Arc::new(BoxPhaseHandler::new(handler)));
    }

    pub fn register_boxed(&mut self, phase: Phase, handler: BoxPhaseHandler) {
        self.handlers.insert(phase, Arc::new(handler));
    }

    /// Builder-style `register`.
    pub fn with<T: PhaseHandler + 'static>(mut self, phase: Phase, handler: T) -> Self {
        self.register(phase, handler);
        self
    }

    pub fn get(&self, phase: Phase) -> Option<Arc<BoxPhaseHandler>> {
        self.handlers.get(&phase).cloned()
    }

    /// Working phases with no registered handler.
    pub fn missing(&self) -> Vec<Phase> {
        Phase::WORKING
            .into_iter()
            .filter(|p| !self.handlers.contains_key(p))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// SubWorkflowInvoker
// ---------------------------------------------------------------------------

/// Builds isolated phase inputs and runs handlers on their own tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubWorkflowInvoker;

impl SubWorkflowInvoker {
    /// Project `state` onto the allow-listed input shape for `phase`.
    pub fn build_input(&self, state: &WorkflowState, phase: Phase) -> PhaseInput {
        let contract = contract(phase);

        let artifacts = contract
            .artifacts
            .iter()
            .filter_map(|p| state.artifact_payloads.get(p).map(|v| (*p, v.clone())))
            .collect();

        let open_issues = state
            .blocking_issues
            .iter()
            .filter(|i| i.is_open() && contract.issue_operations.contains(&i.operation.as_str()))
            .cloned()
            .collect();

        let resolutions = state
            .resolutions
            .iter()
            .filter(|(_, r)| r.phase == phase)
            .map(|(name, r)| (name.clone(), r.clone()))
            .collect();

        PhaseInput {
            execution_id: Uuid::now_v7(),
            phase,
            attempt: state.retry_count(phase.operation()) + 1,
            inputs: contract.inputs.then(|| state.inputs.clone()),
            artifacts,
            open_issues,
            resolutions,
        }
    }

    /// Run `handler` to completion (or its own suspend point).
    ///
    /// A panicking handler is reported as a transient failure. A suspend is
    /// passed upward unchanged apart from being stamped with the phase.
    pub async fn invoke(&self, handler: Arc<BoxPhaseHandler>, input: PhaseInput) -> PhaseOutcome {
        let phase = input.phase;
        let execution_id = input.execution_id;
        tracing::debug!(phase = %phase, execution_id = %execution_id, attempt = input.attempt, "invoking phase handler");

        let task = tokio::spawn(async move { handler.execute(&input).await });
        match task.await {
            Ok(PhaseOutcome::Suspend(mut interrupt)) => {
                interrupt.phase = phase;
                interrupt.kind = GateKind::Phase;
                PhaseOutcome::Suspend(interrupt)
            }
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(phase = %phase, execution_id = %execution_id, error = %e, "phase handler task aborted");
                PhaseOutcome::Failed(FailureReason::transient(format!(
                    "phase handler for {phase} panicked: {e}"
                )))
            }
        }
    }

    /// Run the handler's remediation step on its own task.
    pub async fn remediate(
        &self,
        handler: Arc<BoxPhaseHandler>,
        input: PhaseInput,
        failure: FailureReason,
    ) -> Result<Option<Value>, FailureReason> {
        let phase = input.phase;
        let task = tokio::spawn(async move { handler.remediate(&input, &failure).await });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(FailureReason::transient(format!(
                "remediation for {phase} panicked: {e}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use phasegate_types::gate::Decision;
    use phasegate_types::workflow::{InstanceId, PhaseStatus};
    use serde_json::json;

    fn populated() -> WorkflowState {
        let now = Utc::now();
        let mut state = WorkflowState::new(
            InstanceId::from("I1"),
            json!({"chart": "nginx", "replicas": 2}),
            now,
        );
        for phase in [Phase::Requirements, Phase::Planning, Phase::Generation] {
            state
                .artifact_payloads
                .insert(phase, json!({ "from": phase.as_str() }));
            state.phase_flags.insert(phase, PhaseStatus::Complete);
        }
        state.raise_issue("validation", Phase::Validation, &FailureReason::validation("missing healthcheck"), 1, now);
        state.raise_issue("planning", Phase::Planning, &FailureReason::transient("timeout"), 1, now);
        state.resolutions.insert(
            "values_question".to_string(),
            GateResolution {
                kind: GateKind::Phase,
                phase: Phase::Generation,
                decision: Decision::Modify,
                payload: json!({"port": 8080}),
                resolved_at: now,
            },
        );
        state
    }

    #[test]
    fn requirements_sees_only_inputs() {
        let input = SubWorkflowInvoker.build_input(&populated(), Phase::Requirements);
        assert_eq!(input.inputs.as_ref().unwrap()["chart"], "nginx");
        assert!(input.artifacts.is_empty());
        assert!(input.open_issues.is_empty());
        assert!(input.resolutions.is_empty());
        assert_eq!(input.attempt, 1);
    }

    #[test]
    fn generation_sees_upstream_artifacts_and_validation_findings() {
        let input = SubWorkflowInvoker.build_input(&populated(), Phase::Generation);
        assert!(input.inputs.is_none());
        let phases: Vec<Phase> = input.artifacts.keys().copied().collect();
        assert_eq!(phases, vec![Phase::Requirements, Phase::Planning]);
        assert_eq!(input.open_issues.len(), 1);
        assert_eq!(input.open_issues[0].operation, "validation");
        assert!(input.resolutions.contains_key("values_question"));
    }

    #[test]
    fn validation_does_not_see_requirements() {
        let input = SubWorkflowInvoker.build_input(&populated(), Phase::Validation);
        assert!(!input.artifacts.contains_key(&Phase::Requirements));
        assert!(input.artifacts.contains_key(&Phase::Generation));
        assert!(input.resolutions.is_empty());
    }

    #[test]
    fn each_invocation_gets_a_fresh_execution_id() {
        let state = populated();
        let a = SubWorkflowInvoker.build_input(&state, Phase::Planning);
        let b = SubWorkflowInvoker.build_input(&state, Phase::Planning);
        assert_ne!(a.execution_id, b.execution_id);
    }

    #[tokio::test]
    async fn invoke_returns_handler_outcome() {
        let handler = Arc::new(BoxPhaseHandler::new(FnPhaseHandler::new(|input: &PhaseInput| {
            PhaseOutcome::Completed(json!({ "attempt": input.attempt }))
        })));
        let input = SubWorkflowInvoker.build_input(&populated(), Phase::Planning);
        let outcome = SubWorkflowInvoker.invoke(handler, input).await;
        assert_eq!(outcome, PhaseOutcome::Completed(json!({"attempt": 1})));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_transient_failure() {
        let handler = Arc::new(BoxPhaseHandler::new(FnPhaseHandler::new(|_: &PhaseInput| {
            panic!("handler blew up")
        })));
        let input = SubWorkflowInvoker.build_input(&populated(), Phase::Validation);
        match SubWorkflowInvoker.invoke(handler, input).await {
            PhaseOutcome::Failed(reason) => {
                assert_eq!(reason.kind, phasegate_types::failure::FailureKind::Transient)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn suspend_is_stamped_with_invoking_phase() {
        let handler = Arc::new(BoxPhaseHandler::new(FnPhaseHandler::new(|_: &PhaseInput| {
            PhaseOutcome::Suspend(
                InterruptRequest::new("namespace", Phase::Requirements, "Which namespace?")
                    .with_kind(GateKind::Approval),
            )
        })));
        let input = SubWorkflowInvoker.build_input(&populated(), Phase::Planning);
        match SubWorkflowInvoker.invoke(handler, input).await {
            PhaseOutcome::Suspend(req) => {
                assert_eq!(req.phase, Phase::Planning);
                assert_eq!(req.kind, GateKind::Phase);
                assert_eq!(req.gate_name, "namespace");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn registry_reports_missing_phases() {
        let registry = HandlerRegistry::new().with(
            Phase::Requirements,
            FnPhaseHandler::new(|_: &PhaseInput| PhaseOutcome::Completed(json!({}))),
        );
        assert!(registry.get(Phase::Requirements).is_some());
        assert_eq!(
            registry.missing(),
            vec![Phase::Planning, Phase::Generation, Phase::Validation]
        );
    }
}
