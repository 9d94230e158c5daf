//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary project directories with an on-disk state manager
//! - A scripted skill backend with per-skill behavior
//! - Recording and failing event sinks
//! - Predefined skill sets

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};

use conductor::core::{SkillDescriptor, SkillRegistry};
use conductor::orchestration::{
    ChannelEventSink, DecisionEngine, Event, EventSink, ExecutionContext, ExecutionPlan,
    ExecutionPlanner, Orchestrator, OrchestratorConfig, Parameters, PlanRequest, PlannerConfig,
    SkillBackend, StepResult,
};
use conductor::state::{BlobStore, StateManager};
use conductor::{Error, Result};

/// Shared, ordered record of what happened during a run.
///
/// The backend logs `dispatch:<skill>` and the recording sink logs
/// `event:<type>` so tests can check relative ordering.
pub type Timeline = Arc<Mutex<Vec<String>>>;

pub fn timeline() -> Timeline {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn position(timeline: &Timeline, entry: &str) -> usize {
    timeline
        .lock()
        .unwrap()
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{} not in timeline", entry))
}

/// A temporary project directory with a persistent state manager.
pub struct TestProject {
    /// Keeps the directory alive.
    pub temp_dir: TempDir,
    /// Project root (tracked files live here).
    pub root: PathBuf,
    /// Checkpoint state directory.
    pub state_dir: PathBuf,
}

impl TestProject {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().join("project");
        let state_dir = temp_dir.path().join("state");
        std::fs::create_dir_all(&root).expect("Failed to create project root");
        Self {
            temp_dir,
            root,
            state_dir,
        }
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).expect("Failed to write file");
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root.join(rel)).expect("Failed to read file")
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.root.join(rel).exists()
    }

    pub async fn state_manager(&self) -> Arc<StateManager> {
        Arc::new(
            StateManager::open(&self.root, &self.state_dir)
                .await
                .expect("Failed to open state manager"),
        )
    }
}

/// How the scripted backend handles one skill.
#[derive(Clone)]
pub enum Behavior {
    Succeed,
    Fail(&'static str),
    /// Fail this many times, then succeed.
    FailTimes(u32),
    /// Succeed after a delay.
    Delay(Duration),
    /// Succeed once the notify fires.
    WaitFor(Arc<Notify>),
    /// Fail once the step's cancellation token fires.
    WaitForCancel,
    /// Write a file relative to the root, then succeed.
    WriteFile(PathBuf, String),
}

/// One recorded dispatch.
#[derive(Debug, Clone)]
pub struct Call {
    pub skill: String,
    pub step_index: usize,
    pub attempt: u32,
    pub parameters: Parameters,
}

/// Skill backend whose behavior is scripted per skill name.
pub struct ScriptedBackend {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<String, u32>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: Option<mpsc::UnboundedSender<String>>,
    timeline: Option<Timeline>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            started: None,
            timeline: None,
        }
    }

    pub fn with(mut self, skill: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(skill.to_string(), behavior);
        self
    }

    pub fn with_timeline(mut self, timeline: &Timeline) -> Self {
        self.timeline = Some(timeline.clone());
        self
    }

    /// Receive each skill name as it is dispatched.
    pub fn notify_started(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.started = Some(tx);
        rx
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.skill).collect()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SkillBackend for ScriptedBackend {
    async fn execute(
        &self,
        skill: &SkillDescriptor,
        parameters: &Parameters,
        context: &ExecutionContext,
    ) -> StepResult {
        self.calls.lock().unwrap().push(Call {
            skill: skill.name.clone(),
            step_index: context.step_index,
            attempt: context.attempt,
            parameters: parameters.clone(),
        });
        if let Some(timeline) = &self.timeline {
            timeline.lock().unwrap().push(format!("dispatch:{}", skill.name));
        }
        if let Some(tx) = &self.started {
            let _ = tx.send(skill.name.clone());
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .get(&skill.name)
            .cloned()
            .unwrap_or(Behavior::Succeed);
        let result = match behavior {
            Behavior::Succeed => StepResult::success(serde_json::json!({ "skill": skill.name })),
            Behavior::Fail(msg) => StepResult::failure(msg),
            Behavior::FailTimes(n) => {
                let mut failures = self.failures.lock().unwrap();
                let count = failures.entry(skill.name.clone()).or_insert(0);
                if *count < n {
                    *count += 1;
                    StepResult::failure(format!("transient failure {}", count))
                } else {
                    StepResult::success(serde_json::json!({ "recovered": true }))
                }
            }
            Behavior::Delay(d) => {
                tokio::time::sleep(d).await;
                StepResult::success(serde_json::json!({ "slept_ms": d.as_millis() as u64 }))
            }
            Behavior::WaitFor(notify) => {
                notify.notified().await;
                StepResult::success(serde_json::Value::Null)
            }
            Behavior::WaitForCancel => {
                context.cancellation.cancelled().await;
                StepResult::failure("cancelled by sibling failure")
            }
            Behavior::WriteFile(path, contents) => match tokio::fs::write(&path, contents).await {
                Ok(()) => StepResult::success(serde_json::Value::Null),
                Err(e) => StepResult::failure(e.to_string()),
            },
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Event sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
    timeline: Option<Timeline>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_timeline(timeline: &Timeline) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            timeline: Some(timeline.clone()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn types(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.event_type).collect()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event_type: &str, data: serde_json::Value) -> Result<()> {
        if let Some(timeline) = &self.timeline {
            timeline.lock().unwrap().push(format!("event:{}", event_type));
        }
        self.events.lock().unwrap().push(Event::new(event_type, data));
        Ok(())
    }
}

/// Event sink that fails every call, optionally including `init`.
pub struct FailingSink {
    pub fail_init: bool,
}

#[async_trait]
impl EventSink for FailingSink {
    async fn init(&self) -> Result<()> {
        if self.fail_init {
            Err(Error::EventSink("sink unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    async fn emit(&self, _event_type: &str, _data: serde_json::Value) -> Result<()> {
        Err(Error::EventSink("emit rejected".to_string()))
    }
}

/// Blob store whose writes always fail.
pub struct BrokenBlobStore;

#[async_trait]
impl BlobStore for BrokenBlobStore {
    async fn put(&self, _hash: &str, _bytes: &[u8]) -> Result<()> {
        Err(Error::Io(std::io::Error::other("disk full")))
    }

    async fn get(&self, _hash: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn exists(&self, _hash: &str) -> Result<bool> {
        Ok(false)
    }
}

/// `{A:[]},{B:[A]},{C:[A]},{D:[B,C]}`
pub fn diamond() -> Vec<SkillDescriptor> {
    vec![
        SkillDescriptor::new("A"),
        SkillDescriptor::new("B").depends_on(["A"]),
        SkillDescriptor::new("C").depends_on(["A"]),
        SkillDescriptor::new("D").depends_on(["B", "C"]),
    ]
}

/// `s1 <- s2 <- ... <- sN`
pub fn chain(n: usize) -> Vec<SkillDescriptor> {
    (1..=n)
        .map(|i| {
            let skill = SkillDescriptor::new(format!("s{}", i));
            if i > 1 {
                skill.depends_on([format!("s{}", i - 1)])
            } else {
                skill
            }
        })
        .collect()
}

pub fn registry(skills: Vec<SkillDescriptor>) -> Arc<SkillRegistry> {
    Arc::new(SkillRegistry::from_skills(skills).expect("Failed to build registry"))
}

/// Plan every skill in the registry with the given config.
pub fn plan_all(registry: &Arc<SkillRegistry>, config: PlannerConfig, request: PlanRequest) -> ExecutionPlan {
    ExecutionPlanner::new(registry.clone(), config)
        .create_plan(&request)
        .expect("Failed to plan")
}

pub fn all_names(registry: &SkillRegistry) -> Vec<String> {
    registry.skills().iter().map(|s| s.name.clone()).collect()
}

/// Everything a test needs to run a plan.
pub struct Harness {
    pub project: TestProject,
    pub registry: Arc<SkillRegistry>,
    pub backend: Arc<ScriptedBackend>,
    pub sink: Arc<RecordingSink>,
    pub decisions: DecisionEngine,
    pub state: Arc<StateManager>,
}

impl Harness {
    pub async fn new(skills: Vec<SkillDescriptor>, backend: ScriptedBackend) -> Self {
        Self::with_sink(skills, backend, RecordingSink::new()).await
    }

    pub async fn with_sink(
        skills: Vec<SkillDescriptor>,
        backend: ScriptedBackend,
        sink: Arc<RecordingSink>,
    ) -> Self {
        Self::in_project(TestProject::new(), skills, backend, sink).await
    }

    /// Build a harness around an existing project, for backends that need
    /// to know the project root up front.
    pub async fn in_project(
        project: TestProject,
        skills: Vec<SkillDescriptor>,
        backend: ScriptedBackend,
        sink: Arc<RecordingSink>,
    ) -> Self {
        let state = project.state_manager().await;
        Self {
            project,
            registry: registry(skills),
            backend: Arc::new(backend),
            sink,
            decisions: DecisionEngine::new(),
            state,
        }
    }

    pub fn plan(&self, config: PlannerConfig, request: PlanRequest) -> ExecutionPlan {
        plan_all(&self.registry, config, request)
    }

    /// Plan every registered skill with default planner settings.
    pub fn default_plan(&self) -> ExecutionPlan {
        self.plan(
            PlannerConfig::default(),
            PlanRequest::new("integration task", all_names(&self.registry)),
        )
    }

    pub fn orchestrator(&self, plan: ExecutionPlan, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(
            plan,
            self.registry.clone(),
            self.backend.clone(),
            self.state.clone(),
            self.decisions.clone(),
        )
        .with_event_sink(self.sink.clone())
        .with_config(config)
    }
}

/// Channel sink plus receiver, for tests that wait on specific events.
pub fn channel_sink() -> (Arc<ChannelEventSink>, mpsc::UnboundedReceiver<Event>) {
    let (sink, rx) = ChannelEventSink::new();
    (Arc::new(sink), rx)
}

/// Receive events until one of `event_type` arrives.
pub async fn wait_for_event(rx: &mut mpsc::UnboundedReceiver<Event>, event_type: &str) -> Event {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if event.event_type == event_type {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", event_type))
}

pub fn rel(path: &str) -> &Path {
    Path::new(path)
}
