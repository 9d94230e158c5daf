//! Seams to the outside world: skill execution and parameter binding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::SkillDescriptor;
use crate::util::duration_secs;

use super::planner::PlanId;

pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Outcome of one dispatch of a skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    pub error: Option<String>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl StepResult {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(error.into()),
            duration: Duration::ZERO,
        }
    }

    /// Result recorded for a step skipped by a decision.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::success(serde_json::json!({ "skipped": true, "reason": reason.into() }))
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown error")
    }
}

/// What a backend knows about the run a step belongs to.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub plan_id: PlanId,
    pub task: String,
    pub step_index: usize,
    /// 1-based attempt number; above 1 only on retries.
    pub attempt: u32,
    /// `data` of the steps that completed before this one, by skill name.
    pub previous_results: HashMap<String, serde_json::Value>,
    /// Cancelled when the run is aborted or a critical sibling fails.
    /// Backends should stop cooperatively when it fires.
    pub cancellation: CancellationToken,
}

/// Executes skills on behalf of the orchestrator.
///
/// Failures are reported through [`StepResult::success`]; the backend never
/// aborts the run itself.
#[async_trait]
pub trait SkillBackend: Send + Sync {
    async fn execute(
        &self,
        skill: &SkillDescriptor,
        parameters: &Parameters,
        context: &ExecutionContext,
    ) -> StepResult;
}

/// Maps a skill's declared parameter names to values at planning time.
pub trait ParameterBinder: Send + Sync {
    fn bind(&self, skill: &SkillDescriptor, context: &Parameters) -> Parameters;
}

impl<F> ParameterBinder for F
where
    F: Fn(&SkillDescriptor, &Parameters) -> Parameters + Send + Sync,
{
    fn bind(&self, skill: &SkillDescriptor, context: &Parameters) -> Parameters {
        self(skill, context)
    }
}

/// Copies each declared parameter that the planning context provides.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextBinder;

impl ParameterBinder for ContextBinder {
    fn bind(&self, skill: &SkillDescriptor, context: &Parameters) -> Parameters {
        skill
            .parameters
            .iter()
            .filter_map(|name| context.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }
}
