//! Execution planning.
//!
//! The planner turns a task and a list of candidate skills into an
//! [`ExecutionPlan`]: steps in dependency order, annotated with where to
//! checkpoint and where to stop for a decision. Both annotations come from
//! pluggable policies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::{DependencyResolver, SkillDescriptor, SkillRegistry};
use crate::error::{Error, Result};
use crate::util::{duration_secs, option_duration_secs};
use crate::{clog, clog_debug, clog_warn};

use super::backend::{ContextBinder, ParameterBinder, Parameters};
use super::decision::{
    DecisionAction, DecisionOption, DecisionPriority, DecisionRequest,
};

/// Duration assumed for a step nobody gave an estimate for.
pub const DEFAULT_STEP_DURATION: Duration = Duration::from_secs(30);

/// Label of the optional checkpoint taken before the first step.
pub const INITIAL_CHECKPOINT_LABEL: &str = "initial_state";

/// Unique identifier for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PlanId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// External metadata about one candidate skill.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillHints {
    /// Confidence in selecting this skill for the task, 0.0 to 1.0.
    pub confidence: Option<f64>,
    #[serde(default, with = "option_duration_secs")]
    pub estimated_duration: Option<Duration>,
    pub critical: Option<bool>,
    pub retries: Option<u32>,
}

impl SkillHints {
    pub fn confidence(confidence: f64) -> Self {
        Self {
            confidence: Some(confidence),
            ..Self::default()
        }
    }
}

/// Input to [`ExecutionPlanner::create_plan`].
#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    /// Opaque task description carried into the plan.
    pub task: String,
    /// Skills selected for the task. Dependencies are added automatically.
    pub candidates: Vec<String>,
    pub hints: HashMap<String, SkillHints>,
    /// Values available to the parameter binder.
    pub context: Parameters,
}

impl PlanRequest {
    pub fn new<I, S>(task: impl Into<String>, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            task: task.into(),
            candidates: candidates.into_iter().map(Into::into).collect(),
            hints: HashMap::new(),
            context: Parameters::new(),
        }
    }

    pub fn with_hints(mut self, skill: impl Into<String>, hints: SkillHints) -> Self {
        self.hints.insert(skill.into(), hints);
        self
    }

    pub fn with_context(mut self, context: Parameters) -> Self {
        self.context = context;
        self
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillStep {
    pub skill_name: String,
    pub parameters: Parameters,
    pub checkpoint_before: bool,
    /// Id of the [`PlannedDecision`] gating this step.
    pub decision_before: Option<String>,
    /// Failure of a critical step halts the plan.
    pub critical: bool,
    /// Extra attempts after a failed dispatch.
    #[serde(default)]
    pub retries: u32,
    #[serde(with = "duration_secs")]
    pub estimated_duration: Duration,
}

/// A checkpoint the plan calls for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPlan {
    pub label: String,
    pub step_index: usize,
    pub reason: String,
}

/// A decision to present before a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedDecision {
    pub id: String,
    pub step_index: usize,
    pub title: String,
    pub description: String,
    pub options: Vec<DecisionOption>,
    pub priority: DecisionPriority,
    pub auto_resolve_seconds: Option<u64>,
}

impl PlannedDecision {
    /// Request for presenting this decision, with `context` attached.
    pub fn to_request(&self, context: Parameters) -> DecisionRequest {
        DecisionRequest {
            title: self.title.clone(),
            description: self.description.clone(),
            options: self.options.clone(),
            context,
            priority: self.priority,
            auto_resolve_seconds: self.auto_resolve_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: PlanId,
    pub task: String,
    pub steps: Vec<SkillStep>,
    pub checkpoints: Vec<CheckpointPlan>,
    pub decision_points: Vec<PlannedDecision>,
    /// Dependency layers from the resolver; steps in one group may run together.
    pub parallel_groups: Vec<Vec<String>>,
    #[serde(with = "duration_secs")]
    pub estimated_duration: Duration,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn decision(&self, id: &str) -> Option<&PlannedDecision> {
        self.decision_points.iter().find(|d| d.id == id)
    }

    /// The planned checkpoint taken before `step_index`, if any.
    pub fn checkpoint_for(&self, step_index: usize) -> Option<&CheckpointPlan> {
        self.checkpoints.iter().find(|c| c.step_index == step_index)
    }

    pub fn step_index(&self, skill_name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.skill_name == skill_name)
    }

    /// Step indices grouped by parallel group, in plan order.
    pub fn step_groups(&self) -> Vec<Vec<usize>> {
        self.parallel_groups
            .iter()
            .map(|group| group.iter().filter_map(|name| self.step_index(name)).collect::<Vec<_>>())
            .filter(|group: &Vec<usize>| !group.is_empty())
            .collect()
    }
}

/// Decides which steps get a checkpoint before them.
pub trait CheckpointPolicy: Send + Sync {
    fn checkpoint_before(&self, step_index: usize, skill: &SkillDescriptor) -> Option<CheckpointPlan>;
}

/// Checkpoints before every mutating skill, and optionally before the first step.
#[derive(Debug, Clone, Default)]
pub struct MutatingCheckpointPolicy {
    pub initial_checkpoint: bool,
}

impl CheckpointPolicy for MutatingCheckpointPolicy {
    fn checkpoint_before(&self, step_index: usize, skill: &SkillDescriptor) -> Option<CheckpointPlan> {
        if step_index == 0 && self.initial_checkpoint {
            return Some(CheckpointPlan {
                label: INITIAL_CHECKPOINT_LABEL.to_string(),
                step_index,
                reason: "state before any step runs".to_string(),
            });
        }
        skill.mutating.then(|| CheckpointPlan {
            label: format!("before_{}", skill.name),
            step_index,
            reason: format!("{} modifies tracked state", skill.name),
        })
    }
}

/// Decides which steps are gated by a decision.
pub trait DecisionPolicy: Send + Sync {
    fn gate(
        &self,
        step_index: usize,
        skill: &SkillDescriptor,
        hints: &SkillHints,
    ) -> Option<PlannedDecision>;
}

/// Gates a step when the selection confidence is below a threshold.
///
/// Steps without a confidence signal are never gated.
#[derive(Debug, Clone)]
pub struct ConfidenceThresholdPolicy {
    pub threshold: f64,
    pub timeout: Option<Duration>,
}

impl DecisionPolicy for ConfidenceThresholdPolicy {
    fn gate(
        &self,
        step_index: usize,
        skill: &SkillDescriptor,
        hints: &SkillHints,
    ) -> Option<PlannedDecision> {
        let confidence = hints.confidence?;
        if confidence >= self.threshold {
            return None;
        }

        let priority = if skill.is_critical() {
            DecisionPriority::High
        } else {
            DecisionPriority::Medium
        };
        Some(PlannedDecision {
            id: format!("gate-{}-{}", step_index, skill.name),
            step_index,
            title: format!("Run {}?", skill.name),
            description: format!(
                "Confidence {:.2} for {} is below the threshold of {:.2}",
                confidence, skill.name, self.threshold
            ),
            options: vec![
                DecisionOption::new("approve", "Run the skill", DecisionAction::Approve).recommended(),
                DecisionOption::new("skip", "Skip the skill", DecisionAction::Skip),
            ],
            priority,
            auto_resolve_seconds: self.timeout.map(|t| t.as_secs().max(1)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Confidence below which the default policy inserts a decision gate.
    pub confidence_threshold: f64,
    /// Auto-resolve timeout for gates; `None` waits for a human.
    pub decision_timeout: Option<Duration>,
    /// Checkpoint before the first step.
    pub initial_checkpoint: bool,
    pub default_step_duration: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            decision_timeout: Some(Duration::from_secs(300)),
            initial_checkpoint: false,
            default_step_duration: DEFAULT_STEP_DURATION,
        }
    }
}

/// Builds execution plans from candidate skills.
pub struct ExecutionPlanner {
    registry: Arc<SkillRegistry>,
    resolver: DependencyResolver,
    config: PlannerConfig,
    binder: Arc<dyn ParameterBinder>,
    checkpoint_policy: Arc<dyn CheckpointPolicy>,
    decision_policy: Arc<dyn DecisionPolicy>,
}

impl ExecutionPlanner {
    /// Create a planner with the default binder and policies.
    pub fn new(registry: Arc<SkillRegistry>, config: PlannerConfig) -> Self {
        let checkpoint_policy = Arc::new(MutatingCheckpointPolicy {
            initial_checkpoint: config.initial_checkpoint,
        });
        let decision_policy = Arc::new(ConfidenceThresholdPolicy {
            threshold: config.confidence_threshold,
            timeout: config.decision_timeout,
        });
        Self {
            registry,
            resolver: DependencyResolver::new(),
            config,
            binder: Arc::new(ContextBinder),
            checkpoint_policy,
            decision_policy,
        }
    }

    pub fn with_binder(mut self, binder: impl ParameterBinder + 'static) -> Self {
        self.binder = Arc::new(binder);
        self
    }

    pub fn with_checkpoint_policy(mut self, policy: impl CheckpointPolicy + 'static) -> Self {
        self.checkpoint_policy = Arc::new(policy);
        self
    }

    pub fn with_decision_policy(mut self, policy: impl DecisionPolicy + 'static) -> Self {
        self.decision_policy = Arc::new(policy);
        self
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    /// Plan a task.
    ///
    /// Unknown candidates are skipped with a warning. Dependencies of the
    /// selected skills are pulled in from the registry.
    ///
    /// # Errors
    /// `Planning` when no candidate is known, otherwise whatever the
    /// dependency resolver reports. No plan is produced on error.
    pub fn create_plan(&self, request: &PlanRequest) -> Result<ExecutionPlan> {
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for name in &request.candidates {
            if !self.registry.contains(name) {
                clog_warn!("Planner: skipping unknown skill '{}'", name);
                continue;
            }
            if seen.insert(name.as_str()) {
                selected.push(name.clone());
            }
        }
        if selected.is_empty() {
            return Err(Error::Planning(format!(
                "no known skills among candidates for task '{}'",
                request.task
            )));
        }

        let skills = self.registry.with_dependencies(&selected);
        if skills.len() > selected.len() {
            clog_debug!(
                "Planner: pulled in {} dependencies",
                skills.len() - selected.len()
            );
        }
        let order = self.resolver.resolve(&skills)?;
        let by_name: HashMap<&str, &SkillDescriptor> =
            skills.iter().map(|s| (s.name.as_str(), s)).collect();

        let no_hints = SkillHints::default();
        let mut steps = Vec::with_capacity(order.len());
        let mut checkpoints = Vec::new();
        let mut decision_points = Vec::new();

        for (index, name) in order.execution_order.iter().enumerate() {
            let skill = by_name
                .get(name.as_str())
                .copied()
                .ok_or_else(|| Error::SkillNotFound(name.clone()))?;
            let hints = request.hints.get(name).unwrap_or(&no_hints);

            let checkpoint = self.checkpoint_policy.checkpoint_before(index, skill);
            let decision = self.decision_policy.gate(index, skill, hints);

            steps.push(SkillStep {
                skill_name: name.clone(),
                parameters: self.binder.bind(skill, &request.context),
                checkpoint_before: checkpoint.is_some(),
                decision_before: decision.as_ref().map(|d| d.id.clone()),
                critical: hints.critical.unwrap_or_else(|| skill.is_critical()),
                retries: hints.retries.unwrap_or(0),
                estimated_duration: hints
                    .estimated_duration
                    .or(skill.estimated_duration)
                    .unwrap_or(self.config.default_step_duration),
            });
            checkpoints.extend(checkpoint);
            decision_points.extend(decision);
        }

        let plan = ExecutionPlan {
            plan_id: PlanId::new(),
            task: request.task.clone(),
            estimated_duration: steps.iter().map(|s| s.estimated_duration).sum(),
            steps,
            checkpoints,
            decision_points,
            parallel_groups: order.parallel_groups,
            created_at: Utc::now(),
        };

        clog!(
            "Plan {} created for '{}': {} steps, {} checkpoints, {} decisions",
            plan.plan_id.short(),
            plan.task,
            plan.steps.len(),
            plan.checkpoints.len(),
            plan.decision_points.len()
        );
        Ok(plan)
    }
}

impl std::fmt::Debug for ExecutionPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlanner")
            .field("skills", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}
