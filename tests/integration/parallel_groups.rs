//! Parallel group execution tests.
//!
//! In parallel mode every dependency layer is dispatched concurrently;
//! layers still run strictly one after another.

use std::time::Duration;

use conductor::core::SkillDescriptor;
use conductor::orchestration::{ExecutionMode, ExecutionState, OrchestratorConfig};

use crate::fixtures::{
    diamond, position, timeline, wait_for_event, Behavior, Harness, RecordingSink,
    ScriptedBackend,
};

fn parallel() -> OrchestratorConfig {
    OrchestratorConfig {
        mode: ExecutionMode::Parallel,
        ..OrchestratorConfig::default()
    }
}

fn slow_middle() -> ScriptedBackend {
    ScriptedBackend::new()
        .with("B", Behavior::Delay(Duration::from_millis(50)))
        .with("C", Behavior::Delay(Duration::from_millis(50)))
}

/// Test: Diamond in parallel mode
/// Given the diamond A -> {B, C} -> D
/// When it runs in parallel mode
/// Then B and C overlap while A runs first and D last
#[tokio::test]
async fn test_diamond_runs_middle_layer_concurrently() {
    let harness = Harness::new(diamond(), slow_middle()).await;
    let orchestrator = harness.orchestrator(harness.default_plan(), parallel());

    let result = orchestrator.execute().await.unwrap();

    assert!(result.success);
    assert_eq!(result.steps_completed, 4);
    assert_eq!(harness.backend.max_concurrency(), 2);
    let dispatched = harness.backend.dispatched();
    assert_eq!(dispatched.first().map(String::as_str), Some("A"));
    assert_eq!(dispatched.last().map(String::as_str), Some("D"));

    let order: Vec<_> = result.results.iter().map(|o| o.step_index).collect();
    assert_eq!(order, vec![0, 1, 2, 3]);
}

/// Test: Diamond in sequential mode
/// Given the same diamond
/// When it runs in the default sequential mode
/// Then at most one step is ever in flight
#[tokio::test]
async fn test_sequential_mode_never_overlaps() {
    let harness = Harness::new(diamond(), slow_middle()).await;
    let orchestrator = harness.orchestrator(harness.default_plan(), OrchestratorConfig::default());

    let result = orchestrator.execute().await.unwrap();

    assert!(result.success);
    assert_eq!(harness.backend.max_concurrency(), 1);
    assert_eq!(harness.backend.dispatched(), vec!["A", "B", "C", "D"]);
}

/// Test: Critical failure inside a group
/// Given B is critical and fails while its sibling C waits for cancellation
/// When the diamond runs in parallel mode
/// Then C is cancelled, D is never dispatched and the run fails at B
#[tokio::test]
async fn test_critical_failure_cancels_siblings() {
    let mut skills = diamond();
    skills[1] = SkillDescriptor::new("B").depends_on(["A"]).critical(true);
    let backend = ScriptedBackend::new()
        .with("B", Behavior::Fail("schema mismatch"))
        .with("C", Behavior::WaitForCancel);
    let harness = Harness::new(skills, backend).await;
    let orchestrator = harness.orchestrator(harness.default_plan(), parallel());

    let result = tokio::time::timeout(Duration::from_secs(10), orchestrator.execute())
        .await
        .expect("sibling was not cancelled")
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.failed_step, Some(1));
    assert!(result.error.unwrap().contains("schema mismatch"));
    assert!(!harness.backend.dispatched().contains(&"D".to_string()));

    let c = result.results.iter().find(|o| o.skill_name == "C").unwrap();
    assert!(!c.result.success);
    assert_eq!(result.steps_completed, 2);
    assert_eq!(orchestrator.state(), ExecutionState::Failed);
}

/// Test: Non-critical failure inside a group
/// Given C fails and is not critical
/// When the diamond runs in parallel mode
/// Then the failure is recorded and D still runs
#[tokio::test]
async fn test_non_critical_group_failure_continues() {
    let backend = ScriptedBackend::new().with("C", Behavior::Fail("optional docs step"));
    let harness = Harness::new(diamond(), backend).await;
    let orchestrator = harness.orchestrator(harness.default_plan(), parallel());

    let result = orchestrator.execute().await.unwrap();

    assert!(result.success);
    assert_eq!(result.steps_completed, 4);
    assert!(!result.results[2].result.success);
    assert!(harness.backend.dispatched().contains(&"D".to_string()));
    assert_eq!(harness.sink.of_type("skill:failed").len(), 1);
}

/// Test: Checkpoints before a group
/// Given B and C both mutate tracked state
/// When the diamond runs in parallel mode
/// Then both checkpoints exist before either step is dispatched
#[tokio::test]
async fn test_group_checkpoints_precede_dispatch() {
    let skills = vec![
        SkillDescriptor::new("A"),
        SkillDescriptor::new("B").depends_on(["A"]).mutating(),
        SkillDescriptor::new("C").depends_on(["A"]).mutating(),
        SkillDescriptor::new("D").depends_on(["B", "C"]),
    ];
    let timeline = timeline();
    let backend = ScriptedBackend::new().with_timeline(&timeline);
    let sink = RecordingSink::with_timeline(&timeline);
    let harness = Harness::with_sink(skills, backend, sink).await;
    let orchestrator = harness.orchestrator(harness.default_plan(), parallel());

    let result = orchestrator.execute().await.unwrap();
    assert!(result.success);
    assert_eq!(result.checkpoints_created.len(), 2);

    let entries = timeline.lock().unwrap().clone();
    let last_checkpoint = entries
        .iter()
        .rposition(|e| e == "event:checkpoint:created")
        .unwrap();
    assert!(last_checkpoint < position(&timeline, "dispatch:B"));
    assert!(last_checkpoint < position(&timeline, "dispatch:C"));
}

/// Test: Abort during a group
/// Given B and C both wait for cancellation
/// When the run is aborted while they are in flight
/// Then both are cancelled, D never runs and the run fails
#[tokio::test]
async fn test_abort_cancels_in_flight_group() {
    let mut backend = ScriptedBackend::new()
        .with("B", Behavior::WaitForCancel)
        .with("C", Behavior::WaitForCancel);
    let mut started = backend.notify_started();
    let harness = Harness::new(diamond(), backend).await;
    let orchestrator = harness.orchestrator(harness.default_plan(), parallel());
    let handle = orchestrator.handle();

    let run = tokio::spawn(async move { orchestrator.execute().await });
    let mut seen = Vec::new();
    while seen.len() < 3 {
        seen.push(started.recv().await.unwrap());
    }
    assert_eq!(seen[0], "A");

    assert!(handle.abort("deadline moved"));
    let result = run.await.unwrap().unwrap();

    assert!(!result.success);
    assert!(result.error.unwrap().contains("deadline moved"));
    assert_eq!(result.failed_step, Some(1));
    assert!(!harness.backend.dispatched().contains(&"D".to_string()));
    assert_eq!(handle.state(), ExecutionState::Failed);
}

/// Test: Parallel events
/// Given a diamond in parallel mode
/// When it completes
/// Then the started event reports parallel execution
#[tokio::test]
async fn test_started_event_reports_mode() {
    let (sink, mut rx) = crate::fixtures::channel_sink();
    let harness = Harness::new(diamond(), ScriptedBackend::new()).await;
    let orchestrator = harness
        .orchestrator(harness.default_plan(), parallel())
        .with_event_sink(sink);

    orchestrator.execute().await.unwrap();
    let started = wait_for_event(&mut rx, "execution:started").await;
    assert_eq!(started.data["parallel"], true);
    assert_eq!(started.data["steps_total"], 4);
}
