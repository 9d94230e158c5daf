//! Orchestration layer.
//!
//! Planning turns candidate skills into an [`ExecutionPlan`]; the
//! [`Orchestrator`] runs it, checkpointing through the state manager and
//! pausing on decisions managed by the [`DecisionEngine`].

mod backend;
mod decision;
pub mod events;
mod orchestrator;
mod planner;

pub use backend::{ContextBinder, ExecutionContext, ParameterBinder, Parameters, SkillBackend, StepResult};
pub use decision::{
    DecisionAction, DecisionEngine, DecisionOption, DecisionPoint, DecisionPriority,
    DecisionRequest, DecisionResponse, DecisionStatistics, AUTO_RESOLVE_REASON,
};
pub use events::{ChannelEventSink, Event, EventSink, LogEventSink};
pub use orchestrator::{
    ExecutionMode, ExecutionState, Orchestrator, OrchestratorConfig, OrchestratorHandle,
    OrchestratorResult, StepOutcome,
};
pub use planner::{
    CheckpointPlan, CheckpointPolicy, ConfidenceThresholdPolicy, DecisionPolicy, ExecutionPlan,
    ExecutionPlanner, MutatingCheckpointPolicy, PlanId, PlanRequest, PlannedDecision,
    PlannerConfig, SkillHints, SkillStep, DEFAULT_STEP_DURATION, INITIAL_CHECKPOINT_LABEL,
};
