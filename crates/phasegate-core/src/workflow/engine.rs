//! Workflow engine: drives instances through the phase state machine with
//! durable checkpointing.
//!
//! The `WorkflowEngine` owns the start/resume/cancel/recover APIs. Each
//! instance runs on a single logical thread of control: a per-instance mutex
//! serialises everything that touches one instance, and every write goes
//! through an optimistic sequence check so that a second process cannot
//! double-apply a resume either.
//!
//! # Drive loop
//!
//! 1. `Orchestrator::advance` picks the next action from the flags.
//! 2. The action runs: a phase is invoked (with retries/escalation on
//!    failure), a gate is requested, or the instance finishes.
//! 3. The resulting state is committed as the next checkpoint.
//! 4. Repeat until the instance is suspended or terminal.
//!
//! Mutating calls run on their own tokio task, so a caller that gives up
//! (a dropped HTTP request, a timeout) never cancels a phase in flight. The
//! drive continues and the instance still reaches its next stable point.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use phasegate_types::config::OrchestratorConfig;
use phasegate_types::error::ProtocolError;
use phasegate_types::event::{EventKind, WorkflowEvent};
use phasegate_types::failure::FailureReason;
use phasegate_types::gate::{Decision, GateKind, InterruptRequest, ResumeSignal};
use phasegate_types::workflow::{
    Checkpoint, InstanceId, InstanceStatus, InstanceSummary, Phase, StatusReport, WorkflowState,
};
use serde_json::{Value, json};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::event::bus::EventBus;
use crate::repository::checkpoint::CheckpointRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::gate::{GateManager, GateOutcome, ResumeEffect};
use super::invoker::{BoxPhaseHandler, HandlerRegistry, PhaseInput, PhaseOutcome, SubWorkflowInvoker};
use super::orchestrator::{Action, Orchestrator, OrchestratorError};
use super::retry::{RetryController, RetryDecision};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by `WorkflowEngine` operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Caller misuse; state was not modified.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// The detached task driving the instance panicked or was aborted.
    #[error("engine task failed: {0}")]
    Task(String),
}

/// Run `task` on its own tokio task and wait for it.
///
/// Dropping the returned future detaches the task instead of cancelling it.
async fn detached<T: Send + 'static>(
    task: impl Future<Output = Result<T, EngineError>> + Send + 'static,
) -> Result<T, EngineError> {
    tokio::spawn(task)
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?
}

/// Exclusive hold on one instance.
///
/// Dropping it releases the mutex and removes the lock table entry when no
/// other caller is holding or waiting on it.
struct InstanceGuard<'a> {
    locks: &'a DashMap<InstanceId, Arc<Mutex<()>>>,
    instance_id: InstanceId,
    mutex: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // The table and this guard hold the only references.
        self.locks.remove_if(&self.instance_id, |_, mutex| {
            Arc::ptr_eq(mutex, &self.mutex) && Arc::strong_count(mutex) == 2
        });
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Drives workflow instances and exposes the caller-facing APIs.
///
/// Generic over `R: CheckpointRepository` for storage flexibility.
pub struct WorkflowEngine<R: CheckpointRepository> {
    checkpoints: CheckpointManager<R>,
    handlers: HandlerRegistry,
    orchestrator: Orchestrator,
    retry: RetryController,
    gates: GateManager,
    invoker: SubWorkflowInvoker,
    event_bus: EventBus,
    /// Per-instance execution locks, present only while held or awaited.
    locks: DashMap<InstanceId, Arc<Mutex<()>>>,
}

impl<R: CheckpointRepository + 'static> WorkflowEngine<R> {
    pub fn new(repo: Arc<R>, handlers: HandlerRegistry, config: OrchestratorConfig) -> Self {
        Self {
            checkpoints: CheckpointManager::new(repo),
            handlers,
            retry: RetryController::new(config.max_retries),
            gates: GateManager::new(config.clone()),
            orchestrator: Orchestrator::new(config),
            invoker: SubWorkflowInvoker,
            event_bus: EventBus::default(),
            locks: DashMap::new(),
        }
    }

    /// Publish transition events on `event_bus` instead of a private bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &OrchestratorConfig {
        self.orchestrator.config()
    }

    // -----------------------------------------------------------------------
    // Start / resume / cancel
    // -----------------------------------------------------------------------

    /// Create an instance and drive it until it suspends or finishes.
    pub async fn start(
        self: &Arc<Self>,
        instance_id: InstanceId,
        initial_input: Value,
    ) -> Result<WorkflowState, EngineError> {
        let engine = Arc::clone(self);
        detached(async move { engine.start_attached(instance_id, initial_input).await }).await
    }

    /// Answer the gate an instance is suspended on and keep driving it.
    pub async fn resume(self: &Arc<Self>, signal: ResumeSignal) -> Result<WorkflowState, EngineError> {
        let engine = Arc::clone(self);
        detached(async move { engine.resume_attached(signal, true).await }).await
    }

    /// Cancel a suspended instance: a `reject` of whatever gate it waits on.
    pub async fn cancel(
        self: &Arc<Self>,
        instance_id: &InstanceId,
        reason: &str,
    ) -> Result<WorkflowState, EngineError> {
        let signal = ResumeSignal::new(instance_id.clone(), Decision::Reject)
            .with_payload(json!({ "reason": reason }));
        let engine = Arc::clone(self);
        detached(async move { engine.resume_attached(signal, false).await }).await
    }

    /// Re-drive an instance whose latest checkpoint is still `running`.
    ///
    /// Suspended and terminal instances are returned unchanged.
    pub async fn recover(self: &Arc<Self>, instance_id: &InstanceId) -> Result<WorkflowState, EngineError> {
        let engine = Arc::clone(self);
        let instance_id = instance_id.clone();
        detached(async move { engine.recover_attached(&instance_id).await }).await
    }

    /// Recover every instance left `running` (e.g. after a crash).
    ///
    /// Failures are logged and skipped so one bad instance does not block the
    /// rest.
    pub async fn recover_all(self: &Arc<Self>) -> Result<Vec<WorkflowState>, EngineError> {
        let engine = Arc::clone(self);
        detached(async move { engine.recover_all_attached().await }).await
    }

    async fn start_attached(
        &self,
        instance_id: InstanceId,
        initial_input: Value,
    ) -> Result<WorkflowState, EngineError> {
        let state = WorkflowState::new(instance_id.clone(), initial_input, Utc::now());

        let _guard = self.lock_instance(&instance_id).await;

        let sequence_no = self.checkpoints.create(&state).await.map_err(|e| match e {
            CheckpointError::AlreadyExists(id) => ProtocolError::DuplicateInstance(id).into(),
            other => EngineError::from(other),
        })?;

        tracing::info!(instance_id = %instance_id, "workflow instance started");
        self.emit(&instance_id, state.phase, state.phase, EventKind::InstanceStarted, None);

        self.drive(state, sequence_no).await
    }

    async fn resume_attached(
        &self,
        mut signal: ResumeSignal,
        enforce_decisions: bool,
    ) -> Result<WorkflowState, EngineError> {
        let instance_id = signal.instance_id.clone();

        // Bind the signal to the gate pending when the call was made, so a
        // caller that lost a race cannot answer the next question by accident.
        let observed = self.load(&instance_id).await?;
        if signal.gate_name.is_none() {
            signal.gate_name = observed
                .state
                .pending_interrupt
                .as_ref()
                .map(|i| i.gate_name.clone());
        }

        let _guard = self.lock_instance(&instance_id).await;

        let current = self.load(&instance_id).await?;
        let interrupt = self
            .gates
            .validate_resume(&current.state, &signal, enforce_decisions)?;
        if current.sequence_no != observed.sequence_no {
            return Err(ProtocolError::AlreadyResumed(instance_id).into());
        }

        let now = Utc::now();
        let mut state = current.state;
        let phase = state.phase;
        let effect = self.gates.apply_resume(&mut state, &interrupt, &signal, now);

        tracing::info!(
            instance_id = %instance_id,
            gate = interrupt.gate_name.as_str(),
            decision = %signal.decision,
            "gate resumed"
        );
        self.emit(
            &instance_id,
            phase,
            phase,
            EventKind::GateResumed,
            Some(format!("{}: {}", interrupt.gate_name, signal.decision)),
        );

        if let ResumeEffect::Fail(reason) = effect {
            state.raise_issue(
                &interrupt.gate_name,
                interrupt.phase,
                &FailureReason::fatal(reason.clone()),
                1,
                now,
            );
            self.fail(&mut state, &reason);
        }

        let sequence_no = self
            .checkpoints
            .commit(&state, current.sequence_no)
            .await
            .map_err(|e| match e {
                CheckpointError::Stale { instance_id, .. } => {
                    ProtocolError::AlreadyResumed(instance_id).into()
                }
                other => EngineError::from(other),
            })?;

        self.drive(state, sequence_no).await
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    async fn recover_attached(&self, instance_id: &InstanceId) -> Result<WorkflowState, EngineError> {
        let _guard = self.lock_instance(instance_id).await;

        let current = self.load(instance_id).await?;
        if current.state.status() != InstanceStatus::Running {
            return Ok(current.state);
        }

        let mut state = current.state;
        state.record(EventKind::Recovered, Some(format!("from checkpoint {}", current.sequence_no)), Utc::now());
        tracing::info!(
            instance_id = %instance_id,
            sequence_no = current.sequence_no,
            phase = %state.phase,
            "recovering workflow instance"
        );
        self.emit(instance_id, state.phase, state.phase, EventKind::Recovered, None);

        let sequence_no = self.checkpoints.commit(&state, current.sequence_no).await?;
        self.drive(state, sequence_no).await
    }

    async fn recover_all_attached(&self) -> Result<Vec<WorkflowState>, EngineError> {
        let running = self.checkpoints.list(Some(InstanceStatus::Running)).await?;
        if !running.is_empty() {
            tracing::info!(count = running.len(), "recovering interrupted workflow instances");
        }

        let mut recovered = Vec::with_capacity(running.len());
        for summary in running {
            match self.recover_attached(&summary.instance_id).await {
                Ok(state) => recovered.push(state),
                Err(e) => tracing::warn!(
                    instance_id = %summary.instance_id,
                    error = %e,
                    "failed to recover workflow instance"
                ),
            }
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn status(&self, instance_id: &InstanceId) -> Result<StatusReport, EngineError> {
        let checkpoint = self.load(instance_id).await?;
        Ok(StatusReport::from_checkpoint(&checkpoint))
    }

    pub async fn list(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceSummary>, EngineError> {
        Ok(self.checkpoints.list(status).await?)
    }

    /// Retained checkpoints for time travel, newest first.
    pub async fn checkpoints(
        &self,
        instance_id: &InstanceId,
        limit: u32,
    ) -> Result<Vec<Checkpoint>, EngineError> {
        self.load(instance_id).await?;
        Ok(self.checkpoints.history(instance_id, limit).await?)
    }

    pub async fn checkpoint_at(
        &self,
        instance_id: &InstanceId,
        sequence_no: u64,
    ) -> Result<Checkpoint, EngineError> {
        self.load(instance_id).await?;
        Ok(self.checkpoints.at(instance_id, sequence_no).await?)
    }

    // -----------------------------------------------------------------------
    // Drive loop
    // -----------------------------------------------------------------------

    /// Advance `state` step by step, committing after each, until it is
    /// suspended or terminal. Callers must hold the instance lock.
    async fn drive(
        &self,
        mut state: WorkflowState,
        mut sequence_no: u64,
    ) -> Result<WorkflowState, EngineError> {
        while !state.is_terminal() && !state.is_suspended() {
            let now = Utc::now();
            let from = state.phase;
            let (next, action) = self.orchestrator.advance(&state, now)?;
            state = next;

            match action {
                Action::InvokePhase(phase) => {
                    self.emit(&state.instance_id, from, phase, EventKind::PhaseStarted, None);
                    self.run_phase(&mut state, phase).await;
                }
                Action::RequestGate(name) => match self.gates.request_gate(&mut state, &name, now) {
                    GateOutcome::Suspended(request) => self.announce_suspension(&state, &request),
                    GateOutcome::Rejected => {
                        self.fail(&mut state, &format!("gate '{name}' was rejected"));
                    }
                    GateOutcome::Passed => {}
                },
                Action::Complete => {
                    tracing::info!(
                        instance_id = %state.instance_id,
                        loop_counter = state.loop_counter,
                        "workflow instance complete"
                    );
                    self.emit(&state.instance_id, from, Phase::Complete, EventKind::Completed, None);
                }
                Action::Fail(reason) => {
                    tracing::warn!(instance_id = %state.instance_id, reason = reason.as_str(), "workflow instance failed");
                    self.emit(&state.instance_id, from, Phase::Failed, EventKind::Failed, Some(reason));
                }
            }

            sequence_no = self.checkpoints.commit(&state, sequence_no).await?;
        }

        Ok(state)
    }

    /// Invoke one phase and fold its outcome into `state`.
    async fn run_phase(&self, state: &mut WorkflowState, phase: Phase) {
        let Some(handler) = self.handlers.get(phase) else {
            let failure = FailureReason::fatal(format!("no handler registered for phase {phase}"));
            self.handle_failure(state, phase, None, failure).await;
            return;
        };

        let input = self.invoker.build_input(state, phase);
        let outcome = self
            .invoker
            .invoke(Arc::clone(&handler), input.clone())
            .await;
        let now = Utc::now();

        match outcome {
            PhaseOutcome::Completed(artifact) => {
                self.retry.on_success(state, phase, now);
                self.orchestrator.apply_delta(state, phase, artifact, now);
                tracing::info!(
                    instance_id = %state.instance_id,
                    phase = %phase,
                    attempt = input.attempt,
                    "phase completed"
                );
                self.emit(&state.instance_id, phase, phase, EventKind::PhaseCompleted, None);
            }
            PhaseOutcome::Suspend(request) => {
                let gate = request.gate_name.clone();
                match self.gates.request_phase_gate(state, request, now) {
                    GateOutcome::Suspended(request) => self.announce_suspension(state, &request),
                    GateOutcome::Passed => {
                        let failure = FailureReason::validation(format!(
                            "phase re-raised gate '{gate}' which was already answered"
                        ));
                        self.handle_failure(state, phase, Some((handler, input)), failure)
                            .await;
                    }
                    GateOutcome::Rejected => {
                        self.fail(state, &format!("gate '{gate}' was rejected"));
                    }
                }
            }
            PhaseOutcome::Failed(failure) => {
                self.handle_failure(state, phase, Some((handler, input)), failure)
                    .await;
            }
            PhaseOutcome::Rework { target, reason } => {
                match self
                    .orchestrator
                    .apply_rework(state, phase, target, &reason, now)
                {
                    Ok(reset) => {
                        tracing::info!(
                            instance_id = %state.instance_id,
                            from = %phase,
                            target = %target,
                            reset = reset.len(),
                            reason = reason.as_str(),
                            "phase requested rework"
                        );
                        self.emit(&state.instance_id, phase, target, EventKind::Reworked, Some(reason));
                    }
                    Err(e) => {
                        let failure = FailureReason::fatal(format!("invalid rework request: {e}"));
                        self.handle_failure(state, phase, None, failure).await;
                    }
                }
            }
        }
    }

    /// Route a failed attempt through the retry controller.
    async fn handle_failure(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        remediation: Option<(Arc<BoxPhaseHandler>, PhaseInput)>,
        failure: FailureReason,
    ) {
        let now = Utc::now();
        tracing::warn!(
            instance_id = %state.instance_id,
            phase = %phase,
            kind = %failure.kind,
            error = failure.message.as_str(),
            "phase attempt failed"
        );
        self.emit(&state.instance_id, phase, phase, EventKind::PhaseFailed, Some(failure.to_string()));

        match self.retry.on_failure(state, phase, &failure, now) {
            RetryDecision::Retry { attempt, issue_id } => {
                tracing::info!(
                    instance_id = %state.instance_id,
                    phase = %phase,
                    attempt,
                    max_retries = self.retry.max_retries(),
                    "scheduling automatic retry"
                );
                self.emit(
                    &state.instance_id,
                    phase,
                    phase,
                    EventKind::RetryScheduled,
                    Some(format!("attempt {attempt} failed")),
                );

                if let Some((handler, input)) = remediation {
                    match self.invoker.remediate(handler, input, failure).await {
                        Ok(Some(note)) => self.retry.record_remediation(state, issue_id, note),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(
                                instance_id = %state.instance_id,
                                phase = %phase,
                                error = %e,
                                "remediation step failed"
                            );
                            self.retry.record_remediation(
                                state,
                                issue_id,
                                json!({ "error": e.to_string() }),
                            );
                        }
                    }
                }
            }
            RetryDecision::Escalate(request) => {
                tracing::warn!(
                    instance_id = %state.instance_id,
                    phase = %phase,
                    gate = request.gate_name.as_str(),
                    "retry budget exhausted, escalating"
                );
                self.gates.suspend(state, request.clone(), now);
                self.announce_suspension(state, &request);
            }
            RetryDecision::Fail(reason) => self.fail(state, &reason),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load(&self, instance_id: &InstanceId) -> Result<Checkpoint, EngineError> {
        self.checkpoints
            .latest(instance_id)
            .await?
            .ok_or_else(|| ProtocolError::NoSuchInstance(instance_id.clone()).into())
    }

    async fn lock_instance(&self, instance_id: &InstanceId) -> InstanceGuard<'_> {
        let mutex = self
            .locks
            .entry(instance_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = Arc::clone(&mutex).lock_owned().await;
        InstanceGuard {
            locks: &self.locks,
            instance_id: instance_id.clone(),
            mutex,
            guard: Some(guard),
        }
    }

    fn fail(&self, state: &mut WorkflowState, reason: &str) {
        let from = state.phase;
        self.orchestrator.fail(state, reason, Utc::now());
        tracing::warn!(instance_id = %state.instance_id, phase = %from, reason, "workflow instance failed");
        self.emit(
            &state.instance_id,
            from,
            Phase::Failed,
            EventKind::Failed,
            Some(reason.to_string()),
        );
    }

    fn announce_suspension(&self, state: &WorkflowState, request: &InterruptRequest) {
        let kind = match request.kind {
            GateKind::Escalation => EventKind::Escalated,
            GateKind::Approval | GateKind::Phase => EventKind::GateRequested,
        };
        tracing::info!(
            instance_id = %state.instance_id,
            phase = %state.phase,
            gate = request.gate_name.as_str(),
            "workflow instance awaiting input"
        );
        self.emit(
            &state.instance_id,
            state.phase,
            state.phase,
            kind,
            Some(request.gate_name.clone()),
        );
    }

    fn emit(
        &self,
        instance_id: &InstanceId,
        from: Phase,
        to: Phase,
        kind: EventKind,
        detail: Option<String>,
    ) {
        let mut event = WorkflowEvent::new(instance_id.clone(), from, to, kind);
        event.detail = detail;
        self.event_bus.publish(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
