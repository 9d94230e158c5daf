//! Interactive decision points.
//!
//! A decision is presented with a set of options and resolves exactly once,
//! either through [`DecisionEngine::resolve_decision`] or, when an
//! auto-resolve timeout is set, by a background timer picking the
//! recommended option. Any number of tasks may wait on the same decision.

use chrono::{DateTime, Utc};
use futures::future::{FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::{clog, clog_debug};

/// Reason recorded when the timer resolves a decision.
pub const AUTO_RESOLVE_REASON: &str = "auto-resolved after timeout";

/// What choosing an option means to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
    Approve,
    Skip,
    Abort,
    Redirect,
    Inject,
    Override,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::Approve => "approve",
            DecisionAction::Skip => "skip",
            DecisionAction::Abort => "abort",
            DecisionAction::Redirect => "redirect",
            DecisionAction::Inject => "inject",
            DecisionAction::Override => "override",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub action: DecisionAction,
    #[serde(default)]
    pub recommended: bool,
}

impl DecisionOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>, action: DecisionAction) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: String::new(),
            action,
            recommended: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn recommended(mut self) -> Self {
        self.recommended = true;
        self
    }
}

/// A decision and its resolution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPoint {
    pub id: String,
    pub title: String,
    pub description: String,
    pub options: Vec<DecisionOption>,
    pub context: serde_json::Map<String, serde_json::Value>,
    pub priority: DecisionPriority,
    pub auto_resolve_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub selected_option: Option<String>,
    pub resolution_reason: Option<String>,
}

impl DecisionPoint {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn option(&self, id: &str) -> Option<&DecisionOption> {
        self.options.iter().find(|o| o.id == id)
    }

    /// The option the timer picks: the first recommended one, else the first.
    pub fn default_option(&self) -> Option<&DecisionOption> {
        self.options
            .iter()
            .find(|o| o.recommended)
            .or_else(|| self.options.first())
    }
}

/// Everything needed to present a decision.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub title: String,
    pub description: String,
    pub options: Vec<DecisionOption>,
    pub context: serde_json::Map<String, serde_json::Value>,
    pub priority: DecisionPriority,
    pub auto_resolve_seconds: Option<u64>,
}

impl DecisionRequest {
    pub fn new(title: impl Into<String>, options: Vec<DecisionOption>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            options,
            context: serde_json::Map::new(),
            priority: DecisionPriority::default(),
            auto_resolve_seconds: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn context(mut self, context: serde_json::Map<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }

    pub fn priority(mut self, priority: DecisionPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn auto_resolve_after(mut self, seconds: u64) -> Self {
        self.auto_resolve_seconds = Some(seconds);
        self
    }
}

/// The outcome delivered to everyone waiting on a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub decision_id: String,
    pub selected_option_id: String,
    pub action: DecisionAction,
    pub reason: Option<String>,
    pub data: Option<serde_json::Value>,
    pub resolved_at: DateTime<Utc>,
}

impl DecisionResponse {
    pub fn is_auto_resolved(&self) -> bool {
        self.reason.as_deref() == Some(AUTO_RESOLVE_REASON)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionStatistics {
    pub total: usize,
    pub pending: usize,
    pub resolved: usize,
    pub by_action: BTreeMap<DecisionAction, usize>,
}

type ResponseFuture = Shared<oneshot::Receiver<DecisionResponse>>;

struct Entry {
    point: DecisionPoint,
    sender: Option<oneshot::Sender<DecisionResponse>>,
    response: ResponseFuture,
    /// Stops this decision's auto-resolve timer.
    timer: Option<CancellationToken>,
}

#[derive(Default)]
struct Decisions {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
    next_id: u64,
}

impl Decisions {
    fn get(&self, id: &str) -> Result<&Entry> {
        self.entries
            .get(id)
            .ok_or_else(|| Error::DecisionNotFound(id.to_string()))
    }

    fn points(&self) -> impl Iterator<Item = &DecisionPoint> {
        self.order.iter().filter_map(|id| self.entries.get(id)).map(|e| &e.point)
    }
}

/// Registry of decision points with shared, future-based waiting.
///
/// Cloning yields another handle to the same decisions.
#[derive(Clone)]
pub struct DecisionEngine {
    decisions: Arc<Mutex<Decisions>>,
    timers: CancellationToken,
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionEngine {
    pub fn new() -> Self {
        Self {
            decisions: Arc::new(Mutex::new(Decisions::default())),
            timers: CancellationToken::new(),
        }
    }

    /// Register a pending decision and return its id.
    ///
    /// # Errors
    /// `Validation` when there are no options or option ids repeat.
    pub async fn present_decision(&self, request: DecisionRequest) -> Result<String> {
        if request.options.is_empty() {
            return Err(Error::Validation(format!(
                "decision '{}' has no options",
                request.title
            )));
        }
        let mut seen = HashSet::new();
        for option in &request.options {
            if !seen.insert(option.id.as_str()) {
                return Err(Error::Validation(format!(
                    "decision '{}' repeats option id {}",
                    request.title, option.id
                )));
            }
        }

        let (tx, rx) = oneshot::channel();
        let timer = request
            .auto_resolve_seconds
            .map(|secs| (Duration::from_secs(secs), self.timers.child_token()));
        let id = {
            let mut decisions = self.decisions.lock().await;
            decisions.next_id += 1;
            let id = format!("decision-{}", decisions.next_id);

            let point = DecisionPoint {
                id: id.clone(),
                title: request.title,
                description: request.description,
                options: request.options,
                context: request.context,
                priority: request.priority,
                auto_resolve_seconds: request.auto_resolve_seconds,
                created_at: Utc::now(),
                resolved_at: None,
                selected_option: None,
                resolution_reason: None,
            };
            clog!("Decision presented: {} '{}'", id, point.title);

            decisions.entries.insert(
                id.clone(),
                Entry {
                    point,
                    sender: Some(tx),
                    response: rx.shared(),
                    timer: timer.as_ref().map(|(_, token)| token.clone()),
                },
            );
            decisions.order.push(id.clone());
            id
        };

        if let Some((after, token)) = timer {
            self.spawn_timer(id.clone(), after, token);
        }
        Ok(id)
    }

    fn spawn_timer(&self, id: String, after: Duration, cancelled: CancellationToken) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    clog_debug!("Auto-resolve timer for {} cancelled", id);
                }
                _ = tokio::time::sleep(after) => {
                    engine.auto_resolve(&id).await;
                }
            }
        });
    }

    /// Resolve with the default option if still pending; otherwise do nothing.
    async fn auto_resolve(&self, id: &str) {
        let mut decisions = self.decisions.lock().await;
        let Some(entry) = decisions.entries.get_mut(id) else {
            return;
        };
        if entry.point.is_resolved() {
            clog_debug!("Auto-resolve for {} skipped: already resolved", id);
            return;
        }
        let Some(option_id) = entry.point.default_option().map(|o| o.id.clone()) else {
            return;
        };
        let response = Self::settle(entry, &option_id, Some(AUTO_RESOLVE_REASON.to_string()), None);
        clog!(
            "Decision auto-resolved: {} -> {}",
            response.decision_id,
            response.selected_option_id
        );
    }

    /// Mark an entry resolved and fulfil its future. The option must exist.
    fn settle(
        entry: &mut Entry,
        option_id: &str,
        reason: Option<String>,
        data: Option<serde_json::Value>,
    ) -> DecisionResponse {
        let action = entry
            .point
            .option(option_id)
            .map(|o| o.action)
            .unwrap_or(DecisionAction::Approve);
        let now = Utc::now();

        entry.point.resolved_at = Some(now);
        entry.point.selected_option = Some(option_id.to_string());
        entry.point.resolution_reason = reason.clone();
        if let Some(timer) = entry.timer.take() {
            timer.cancel();
        }

        let response = DecisionResponse {
            decision_id: entry.point.id.clone(),
            selected_option_id: option_id.to_string(),
            action,
            reason,
            data,
            resolved_at: now,
        };
        if let Some(tx) = entry.sender.take() {
            // No receiver only means nobody holds the shared future any more.
            let _ = tx.send(response.clone());
        }
        response
    }

    /// Resolve a pending decision with the chosen option.
    ///
    /// # Errors
    /// `DecisionNotFound` for an unknown id, `AlreadyResolved` when it has
    /// already been resolved (manually or by timeout), `UnknownOption` when
    /// the option does not exist; in that case the decision stays pending.
    pub async fn resolve_decision(
        &self,
        decision_id: &str,
        option_id: &str,
        reason: Option<String>,
        data: Option<serde_json::Value>,
    ) -> Result<DecisionResponse> {
        let mut decisions = self.decisions.lock().await;
        let entry = decisions
            .entries
            .get_mut(decision_id)
            .ok_or_else(|| Error::DecisionNotFound(decision_id.to_string()))?;

        if entry.point.is_resolved() {
            return Err(Error::AlreadyResolved(decision_id.to_string()));
        }
        if entry.point.option(option_id).is_none() {
            return Err(Error::UnknownOption {
                decision_id: decision_id.to_string(),
                option_id: option_id.to_string(),
            });
        }

        let response = Self::settle(entry, option_id, reason, data);
        clog!("Decision resolved: {} -> {}", decision_id, option_id);
        Ok(response)
    }

    /// Wait until the decision resolves.
    ///
    /// Returns immediately for an already-resolved decision.
    pub async fn wait_for_decision(&self, decision_id: &str) -> Result<DecisionResponse> {
        let response = self.decisions.lock().await.get(decision_id)?.response.clone();
        response
            .await
            .map_err(|_| Error::Cancelled(format!("decision {} was abandoned", decision_id)))
    }

    pub async fn get_decision(&self, decision_id: &str) -> Option<DecisionPoint> {
        self.decisions
            .lock()
            .await
            .entries
            .get(decision_id)
            .map(|e| e.point.clone())
    }

    /// Pending decisions in presentation order.
    pub async fn pending_decisions(&self) -> Vec<DecisionPoint> {
        let decisions = self.decisions.lock().await;
        decisions.points().filter(|p| !p.is_resolved()).cloned().collect()
    }

    /// Resolved decisions in presentation order.
    pub async fn resolved_decisions(&self) -> Vec<DecisionPoint> {
        let decisions = self.decisions.lock().await;
        decisions.points().filter(|p| p.is_resolved()).cloned().collect()
    }

    pub async fn statistics(&self) -> DecisionStatistics {
        let decisions = self.decisions.lock().await;
        let mut stats = DecisionStatistics::default();
        for point in decisions.points() {
            stats.total += 1;
            match point.selected_option.as_deref().and_then(|id| point.option(id)) {
                Some(option) => {
                    stats.resolved += 1;
                    *stats.by_action.entry(option.action).or_insert(0) += 1;
                }
                None => stats.pending += 1,
            }
        }
        stats
    }

    /// Forget resolved decisions and return how many were dropped.
    ///
    /// Pruned decisions no longer appear in listings or statistics and can
    /// no longer be looked up or waited on by id.
    pub async fn prune_resolved(&self) -> usize {
        let mut decisions = self.decisions.lock().await;
        let Decisions { entries, order, .. } = &mut *decisions;
        let before = entries.len();
        entries.retain(|_, entry| !entry.point.is_resolved());
        order.retain(|id| entries.contains_key(id));
        let pruned = before - entries.len();
        if pruned > 0 {
            clog_debug!("Pruned {} resolved decisions", pruned);
        }
        pruned
    }

    /// Cancel every outstanding auto-resolve timer.
    ///
    /// Pending decisions stay pending and can still be resolved manually.
    pub fn shutdown(&self) {
        self.timers.cancel();
    }
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("timers_cancelled", &self.timers.is_cancelled())
            .finish()
    }
}
