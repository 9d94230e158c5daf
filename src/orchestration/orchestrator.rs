//! Plan execution.
//!
//! The [`Orchestrator`] walks an [`ExecutionPlan`] and drives a state machine:
//!
//! ```text
//! Idle -> Running -> (Halted <-> Running) -> Completed | Failed
//! ```
//!
//! Before each step it honours the halt gate, takes the planned checkpoint
//! and waits for the planned decision, then checks the halt gate again and
//! dispatches the skill to the backend. A run halted after its last step
//! completes only once resumed. Lifecycle events go to an optional [`EventSink`]; a misbehaving
//! sink is logged and otherwise ignored.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;

use futures::future::{join_all, FutureExt};

use crate::core::{SkillDescriptor, SkillRegistry};
use crate::error::{Error, Result};
use crate::state::{CheckpointId, StateManager};
use crate::util::duration_secs;
use crate::{clog, clog_debug, clog_error, clog_warn};

use super::backend::{ExecutionContext, Parameters, SkillBackend, StepResult};
use super::decision::{DecisionAction, DecisionEngine};
use super::events::{self, EventSink};
use super::planner::{ExecutionPlan, PlanId};

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Idle,
    Running,
    Halted,
    Completed,
    Failed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Running => "running",
            ExecutionState::Halted => "halted",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Failed)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How plan steps are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// One step at a time, in plan order.
    #[default]
    Sequential,
    /// Each parallel group runs concurrently, with a barrier between groups.
    Parallel,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub mode: ExecutionMode,
    /// Upper bound on a single event-sink call.
    pub event_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            event_timeout: Duration::from_secs(5),
        }
    }
}

/// Recorded result of one plan step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step_index: usize,
    pub skill_name: String,
    pub result: StepResult,
    /// Skipped by a decision; never dispatched.
    pub skipped: bool,
    pub attempts: u32,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorResult {
    pub success: bool,
    pub plan_id: PlanId,
    /// Steps with a recorded outcome, excluding the one that failed the run.
    pub steps_completed: usize,
    pub steps_total: usize,
    pub checkpoints_created: Vec<CheckpointId>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// First fatal error.
    pub error: Option<String>,
    /// Index of the step the run failed at.
    pub failed_step: Option<usize>,
    /// Step outcomes in plan order.
    pub results: Vec<StepOutcome>,
}

/// State shared between the orchestrator and its handles.
struct Control {
    state: watch::Sender<ExecutionState>,
    abort: CancellationToken,
    abort_reason: OnceCell<String>,
    /// First step of the group being prepared or run; `steps_total` once
    /// every group is done.
    current_step: AtomicUsize,
    steps_total: usize,
}

impl Control {
    fn new(steps_total: usize) -> Self {
        let (state, _) = watch::channel(ExecutionState::Idle);
        Self {
            state,
            abort: CancellationToken::new(),
            abort_reason: OnceCell::new(),
            current_step: AtomicUsize::new(0),
            steps_total,
        }
    }

    fn current_step(&self) -> usize {
        self.current_step.load(Ordering::SeqCst)
    }

    fn set_current_step(&self, index: usize) {
        self.current_step.store(index, Ordering::SeqCst);
    }

    fn current(&self) -> ExecutionState {
        *self.state.borrow()
    }

    /// Atomically move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[ExecutionState], to: ExecutionState, operation: &str) -> Result<()> {
        let mut previous = to;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });

        if changed {
            clog_debug!("Orchestrator: {} -> {}", previous, to);
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation: operation.to_string(),
                state: previous.to_string(),
            })
        }
    }

    /// Move to `Failed` unless already terminal.
    fn fail(&self) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ExecutionState::Failed;
                true
            }
        });
    }

    fn cancelled(&self) -> Error {
        let reason = self
            .abort_reason
            .get()
            .cloned()
            .unwrap_or_else(|| "aborted".to_string());
        Error::Cancelled(reason)
    }

    /// Suspend while halted. Returns early with a cancellation error on abort.
    async fn halt_gate(&self) -> Result<()> {
        if self.abort.is_cancelled() {
            return Err(self.cancelled());
        }
        let mut rx = self.state.subscribe();
        tokio::select! {
            _ = self.abort.cancelled() => Err(self.cancelled()),
            waited = rx.wait_for(|s| *s != ExecutionState::Halted).map(|r| r.map(|_| ())) => {
                waited.map_err(|_| self.cancelled())?;
                if self.abort.is_cancelled() {
                    return Err(self.cancelled());
                }
                Ok(())
            }
        }
    }

    /// Move to `Completed`, first waiting out a halt.
    async fn finish(&self) -> Result<()> {
        loop {
            self.halt_gate().await?;
            match self.transition(&[ExecutionState::Running], ExecutionState::Completed, "complete") {
                Ok(()) => return Ok(()),
                // halted between the gate and the transition
                Err(_) if self.current() == ExecutionState::Halted => continue,
                Err(_) => return Err(self.cancelled()),
            }
        }
    }
}

/// Best-effort event delivery with a timeout per call.
#[derive(Clone)]
struct Emitter {
    sink: Option<Arc<dyn EventSink>>,
    timeout: Duration,
    plan_id: PlanId,
}

impl Emitter {
    async fn init(&self) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        match tokio::time::timeout(self.timeout, sink.init()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::EventSink(format!("initialization failed: {}", e))),
            Err(_) => Err(Error::EventSink("initialization timed out".to_string())),
        }
    }

    async fn emit(&self, event_type: &str, mut data: Value) {
        if let Value::Object(map) = &mut data {
            map.insert("plan_id".to_string(), json!(self.plan_id.to_string()));
        }
        let Some(sink) = &self.sink else {
            return;
        };
        match tokio::time::timeout(self.timeout, sink.emit(event_type, data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => clog_warn!("Event sink failed on {}: {}", event_type, e),
            Err(_) => clog_warn!("Event sink timed out on {}", event_type),
        }
    }
}

/// Cloneable control surface for a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    control: Arc<Control>,
    emitter: Emitter,
}

impl OrchestratorHandle {
    pub fn state(&self) -> ExecutionState {
        self.control.current()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ExecutionState> {
        self.control.state.subscribe()
    }

    /// Pause before the next dispatch. Valid only while running.
    ///
    /// Steps already in flight finish; nothing new is dispatched and the run
    /// does not complete until [`resume`](Self::resume).
    pub async fn halt(&self, reason: &str) -> Result<()> {
        self.control
            .transition(&[ExecutionState::Running], ExecutionState::Halted, "halt")?;
        let current_step = self.control.current_step();
        clog!("Execution halted at step {}: {}", current_step, reason);
        self.emitter
            .emit(
                events::EXECUTION_HALTED,
                json!({
                    "reason": reason,
                    "current_step": current_step,
                    "steps_total": self.control.steps_total,
                }),
            )
            .await;
        Ok(())
    }

    /// Continue a halted run. Valid only while halted.
    pub async fn resume(&self) -> Result<()> {
        self.control
            .transition(&[ExecutionState::Halted], ExecutionState::Running, "resume")?;
        let current_step = self.control.current_step();
        let steps_total = self.control.steps_total;
        clog!("Execution resumed at step {}", current_step);
        self.emitter
            .emit(
                events::EXECUTION_RESUMED,
                json!({
                    "current_step": current_step,
                    "steps_total": steps_total,
                    "steps_remaining": steps_total.saturating_sub(current_step),
                }),
            )
            .await;
        Ok(())
    }

    /// Cancel the run: pending decision waits and in-flight group tasks are
    /// abandoned and the orchestrator fails with a cancellation error.
    ///
    /// Returns `false` if the run had already finished.
    pub fn abort(&self, reason: &str) -> bool {
        if self.control.current().is_terminal() {
            return false;
        }
        let _ = self.control.abort_reason.set(reason.to_string());
        self.control.abort.cancel();
        self.control.fail();
        clog_warn!("Execution aborted: {}", reason);
        true
    }
}

struct RunState {
    results: Vec<StepOutcome>,
    checkpoints: Vec<CheckpointId>,
    /// `data` of successful steps, by skill name.
    previous: HashMap<String, Value>,
    failed_step: Option<usize>,
}

/// A step cleared for dispatch.
struct Prepared {
    index: usize,
    skill: SkillDescriptor,
    parameters: Parameters,
}

enum Gate {
    Proceed(Option<Parameters>),
    Skip(String),
}

/// Executes one plan.
///
/// `execute` may be called once; use [`handle`](Self::handle) to halt,
/// resume or abort from other tasks while it runs.
pub struct Orchestrator {
    plan: ExecutionPlan,
    registry: Arc<SkillRegistry>,
    backend: Arc<dyn SkillBackend>,
    state: Arc<StateManager>,
    decisions: DecisionEngine,
    config: OrchestratorConfig,
    control: Arc<Control>,
    emitter: Emitter,
}

impl Orchestrator {
    pub fn new(
        plan: ExecutionPlan,
        registry: Arc<SkillRegistry>,
        backend: Arc<dyn SkillBackend>,
        state: Arc<StateManager>,
        decisions: DecisionEngine,
    ) -> Self {
        let config = OrchestratorConfig::default();
        let emitter = Emitter {
            sink: None,
            timeout: config.event_timeout,
            plan_id: plan.plan_id,
        };
        let control = Arc::new(Control::new(plan.steps.len()));
        Self {
            plan,
            registry,
            backend,
            state,
            decisions,
            config,
            control,
            emitter,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.emitter.sink = Some(sink);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.emitter.timeout = config.event_timeout;
        self.config = config;
        self
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn state(&self) -> ExecutionState {
        self.control.current()
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            control: self.control.clone(),
            emitter: self.emitter.clone(),
        }
    }

    pub async fn halt(&self, reason: &str) -> Result<()> {
        self.handle().halt(reason).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.handle().resume().await
    }

    pub fn abort(&self, reason: &str) -> bool {
        self.handle().abort(reason)
    }

    /// Restore a checkpoint. Allowed in any state.
    pub async fn rollback(&self, checkpoint_id: &CheckpointId) -> Result<()> {
        let id = checkpoint_id.to_string();
        self.emitter
            .emit(events::EXECUTION_ROLLBACK_STARTED, json!({ "checkpoint_id": id }))
            .await;

        match self.state.restore_checkpoint(checkpoint_id).await {
            Ok(()) => {
                self.emitter
                    .emit(events::EXECUTION_ROLLBACK_COMPLETED, json!({ "checkpoint_id": id }))
                    .await;
                Ok(())
            }
            Err(e) => {
                clog_error!("Rollback to {} failed: {}", id, e);
                self.emitter
                    .emit(
                        events::EXECUTION_ROLLBACK_FAILED,
                        json!({ "checkpoint_id": id, "error": e.to_string() }),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Run the plan to completion.
    ///
    /// # Errors
    /// Only `InvalidState` when called more than once. Failures of the run
    /// itself are reported in the returned [`OrchestratorResult`].
    pub async fn execute(&self) -> Result<OrchestratorResult> {
        self.control
            .transition(&[ExecutionState::Idle], ExecutionState::Running, "execute")?;

        let started = Instant::now();
        let mut run = RunState {
            results: Vec::new(),
            checkpoints: Vec::new(),
            previous: HashMap::new(),
            failed_step: None,
        };
        clog!(
            "Executing plan {} for '{}' ({} steps, {:?})",
            self.plan.plan_id.short(),
            self.plan.task,
            self.plan.steps.len(),
            self.config.mode
        );

        let outcome = match self.emitter.init().await {
            Ok(()) => {
                self.emitter
                    .emit(
                        events::EXECUTION_STARTED,
                        json!({
                            "task": self.plan.task,
                            "steps_total": self.plan.steps.len(),
                            "parallel": self.config.mode == ExecutionMode::Parallel,
                        }),
                    )
                    .await;
                self.run_groups(&mut run).await
            }
            Err(e) => Err(e),
        };

        let error = match outcome {
            Ok(()) => self.control.finish().await.err(),
            Err(e) => Some(e),
        };
        if error.is_some() {
            self.control.fail();
        }

        run.results.sort_by_key(|o| o.step_index);
        let steps_completed = run
            .results
            .iter()
            .filter(|o| Some(o.step_index) != run.failed_step)
            .count();

        let result = OrchestratorResult {
            success: error.is_none(),
            plan_id: self.plan.plan_id,
            steps_completed,
            steps_total: self.plan.steps.len(),
            checkpoints_created: run.checkpoints,
            duration: started.elapsed(),
            error: error.as_ref().map(|e| e.to_string()),
            failed_step: run.failed_step,
            results: run.results,
        };

        match &error {
            None => {
                clog!(
                    "Plan {} completed: {}/{} steps in {:?}",
                    self.plan.plan_id.short(),
                    result.steps_completed,
                    result.steps_total,
                    result.duration
                );
                self.emitter
                    .emit(
                        events::EXECUTION_COMPLETED,
                        json!({
                            "steps_completed": result.steps_completed,
                            "duration_ms": result.duration.as_millis() as u64,
                        }),
                    )
                    .await;
            }
            Some(e) => {
                clog_error!("Plan {} failed: {}", self.plan.plan_id.short(), e);
                self.emitter
                    .emit(
                        events::EXECUTION_FAILED,
                        json!({
                            "error": e.to_string(),
                            "failed_step": result.failed_step,
                            "steps_completed": result.steps_completed,
                        }),
                    )
                    .await;
            }
        }
        Ok(result)
    }

    /// Step indices grouped by scheduling unit.
    fn groups(&self) -> Vec<Vec<usize>> {
        let total = self.plan.steps.len();
        if self.config.mode == ExecutionMode::Parallel {
            let groups = self.plan.step_groups();
            if groups.iter().map(Vec::len).sum::<usize>() == total {
                return groups;
            }
            clog_warn!("Parallel groups do not cover the plan; running sequentially");
        }
        (0..total).map(|i| vec![i]).collect()
    }

    async fn run_groups(&self, run: &mut RunState) -> Result<()> {
        for group in self.groups() {
            if let Some(&first) = group.first() {
                self.control.set_current_step(first);
            }
            if let Err(e) = self.control.halt_gate().await {
                run.failed_step = group.first().copied();
                return Err(e);
            }

            let mut ready = Vec::with_capacity(group.len());
            for &index in &group {
                match self.prepare(index, run).await {
                    Ok(Some(prepared)) => ready.push(prepared),
                    Ok(None) => {}
                    Err(e) => {
                        run.failed_step = Some(index);
                        return Err(e);
                    }
                }
            }
            if ready.is_empty() {
                continue;
            }
            // a halt may have arrived during a checkpoint or decision wait
            if let Err(e) = self.control.halt_gate().await {
                run.failed_step = ready.first().map(|p| p.index);
                return Err(e);
            }

            let group_token = self.control.abort.child_token();
            let previous = run.previous.clone();
            let dispatches = ready
                .iter()
                .map(|prepared| self.dispatch(prepared, &group_token, &previous));
            let outcomes = tokio::select! {
                biased;
                _ = self.control.abort.cancelled() => {
                    group_token.cancel();
                    run.failed_step = ready.first().map(|p| p.index);
                    return Err(self.control.cancelled());
                }
                outcomes = join_all(dispatches) => outcomes,
            };

            let mut fatal = None;
            for (prepared, (result, attempts)) in ready.into_iter().zip(outcomes) {
                let step = &self.plan.steps[prepared.index];
                if result.success {
                    run.previous.insert(step.skill_name.clone(), result.data.clone());
                } else if step.critical && fatal.is_none() {
                    run.failed_step = Some(prepared.index);
                    fatal = Some(Error::CriticalStepFailure {
                        step: prepared.index,
                        skill: step.skill_name.clone(),
                        error: result.error_message().to_string(),
                    });
                }
                run.results.push(StepOutcome {
                    step_index: prepared.index,
                    skill_name: step.skill_name.clone(),
                    result,
                    skipped: false,
                    attempts,
                });
            }
            if let Some(e) = fatal {
                return Err(e);
            }
        }
        self.control.set_current_step(self.plan.steps.len());
        Ok(())
    }

    /// Checkpoint and decision handling ahead of dispatch.
    ///
    /// Returns `None` when a decision skipped the step.
    async fn prepare(&self, index: usize, run: &mut RunState) -> Result<Option<Prepared>> {
        let step = &self.plan.steps[index];
        let skill = self
            .registry
            .get(&step.skill_name)
            .cloned()
            .ok_or_else(|| Error::SkillNotFound(step.skill_name.clone()))?;

        if step.checkpoint_before {
            self.checkpoint(index, run).await?;
        }

        let mut parameters = step.parameters.clone();
        if let Some(decision_id) = &step.decision_before {
            match self.gate(index, decision_id).await? {
                Gate::Proceed(Some(extra)) => parameters.extend(extra),
                Gate::Proceed(None) => {}
                Gate::Skip(reason) => {
                    clog!("Step {} ({}) skipped: {}", index, step.skill_name, reason);
                    self.emitter
                        .emit(
                            events::SKILL_SKIPPED,
                            json!({
                                "skill_name": step.skill_name,
                                "step_index": index,
                                "reason": reason,
                            }),
                        )
                        .await;
                    run.results.push(StepOutcome {
                        step_index: index,
                        skill_name: step.skill_name.clone(),
                        result: StepResult::skipped(reason),
                        skipped: true,
                        attempts: 0,
                    });
                    return Ok(None);
                }
            }
        }

        Ok(Some(Prepared {
            index,
            skill,
            parameters,
        }))
    }

    async fn checkpoint(&self, index: usize, run: &mut RunState) -> Result<()> {
        let step = &self.plan.steps[index];
        let label = self
            .plan
            .checkpoint_for(index)
            .map(|c| c.label.clone())
            .unwrap_or_else(|| format!("before_{}", step.skill_name));

        let checkpoint = self
            .state
            .create_checkpoint(&label, Some(&step.skill_name))
            .await
            .inspect_err(|e| {
                clog_error!("Checkpoint before step {} failed: {}", index, e);
            })?;
        run.checkpoints.push(checkpoint.id.clone());

        self.emitter
            .emit(
                events::CHECKPOINT_CREATED,
                json!({
                    "checkpoint_id": checkpoint.id.to_string(),
                    "label": label,
                    "step_index": index,
                    "files": checkpoint.file_count(),
                    "skill_stack": checkpoint.skill_stack,
                }),
            )
            .await;
        Ok(())
    }

    /// Present the planned decision for a step and wait for its outcome.
    async fn gate(&self, index: usize, planned_id: &str) -> Result<Gate> {
        let step = &self.plan.steps[index];
        let planned = self.plan.decision(planned_id).ok_or_else(|| {
            Error::Validation(format!(
                "step {} references unknown decision {}",
                index, planned_id
            ))
        })?;

        let mut context = Parameters::new();
        context.insert("plan_id".to_string(), json!(self.plan.plan_id.to_string()));
        context.insert("task".to_string(), json!(self.plan.task));
        context.insert("step_index".to_string(), json!(index));
        context.insert("skill_name".to_string(), json!(step.skill_name));

        let decision_id = self
            .decisions
            .present_decision(planned.to_request(context))
            .await?;
        self.emitter
            .emit(
                events::DECISION_PRESENTED,
                json!({
                    "decision_id": decision_id,
                    "title": planned.title,
                    "skill_name": step.skill_name,
                    "step_index": index,
                }),
            )
            .await;

        let response = tokio::select! {
            biased;
            _ = self.control.abort.cancelled() => return Err(self.control.cancelled()),
            response = self.decisions.wait_for_decision(&decision_id) => response?,
        };
        self.emitter
            .emit(
                events::DECISION_RESOLVED,
                json!({
                    "decision_id": decision_id,
                    "selected_option": response.selected_option_id,
                    "action": response.action.as_str(),
                    "reason": response.reason,
                }),
            )
            .await;

        match response.action {
            DecisionAction::Skip => Ok(Gate::Skip(
                response
                    .reason
                    .unwrap_or_else(|| format!("skipped by {}", decision_id)),
            )),
            DecisionAction::Abort => Err(Error::Cancelled(format!(
                "decision {} aborted the run",
                decision_id
            ))),
            DecisionAction::Inject | DecisionAction::Override => {
                Ok(Gate::Proceed(match response.data {
                    Some(Value::Object(data)) => Some(data),
                    _ => None,
                }))
            }
            DecisionAction::Approve | DecisionAction::Redirect => Ok(Gate::Proceed(None)),
        }
    }

    /// Dispatch a step, retrying failures up to the step's retry budget.
    ///
    /// A critical failure cancels `group` so siblings can stop cooperatively.
    async fn dispatch(
        &self,
        prepared: &Prepared,
        group: &CancellationToken,
        previous: &HashMap<String, Value>,
    ) -> (StepResult, u32) {
        let step = &self.plan.steps[prepared.index];
        let max_attempts = step.retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            self.emitter
                .emit(
                    events::SKILL_STARTED,
                    json!({
                        "skill_name": step.skill_name,
                        "step_index": prepared.index,
                        "attempt": attempt,
                    }),
                )
                .await;
            clog_debug!(
                "Dispatching step {} ({}) attempt {}/{}",
                prepared.index,
                step.skill_name,
                attempt,
                max_attempts
            );

            let context = ExecutionContext {
                plan_id: self.plan.plan_id,
                task: self.plan.task.clone(),
                step_index: prepared.index,
                attempt,
                previous_results: previous.clone(),
                cancellation: group.clone(),
            };
            let started = Instant::now();
            let mut result = self
                .backend
                .execute(&prepared.skill, &prepared.parameters, &context)
                .await;
            if result.duration.is_zero() {
                result.duration = started.elapsed();
            }

            if result.success {
                self.emitter
                    .emit(
                        events::SKILL_COMPLETED,
                        json!({
                            "skill_name": step.skill_name,
                            "step_index": prepared.index,
                            "attempts": attempt,
                            "duration_ms": result.duration.as_millis() as u64,
                        }),
                    )
                    .await;
                return (result, attempt);
            }

            if attempt >= max_attempts || group.is_cancelled() {
                clog_warn!(
                    "Step {} ({}) failed after {} attempt(s): {}",
                    prepared.index,
                    step.skill_name,
                    attempt,
                    result.error_message()
                );
                if step.critical {
                    group.cancel();
                }
                self.emitter
                    .emit(
                        events::SKILL_FAILED,
                        json!({
                            "skill_name": step.skill_name,
                            "step_index": prepared.index,
                            "attempts": attempt,
                            "critical": step.critical,
                            "error": result.error_message(),
                        }),
                    )
                    .await;
                return (result, attempt);
            }

            self.emitter
                .emit(
                    events::SKILL_RETRYING,
                    json!({
                        "skill_name": step.skill_name,
                        "step_index": prepared.index,
                        "attempt": attempt,
                        "error": result.error_message(),
                    }),
                )
                .await;
            attempt += 1;
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("plan_id", &self.plan.plan_id)
            .field("state", &self.state())
            .field("mode", &self.config.mode)
            .finish()
    }
}
