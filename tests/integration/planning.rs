//! Dependency resolution and planning integration tests.
//!
//! These tests verify ordering guarantees through the public resolver and
//! planner APIs, including manifests loaded from TOML.

use std::sync::Arc;

use conductor::core::{resolve_dependencies, SkillDescriptor, SkillManifest};
use conductor::orchestration::{ExecutionPlanner, PlanRequest, PlannerConfig, SkillHints};
use conductor::Error;

use crate::fixtures::{chain, diamond, registry};

fn groups(names: &[&[&str]]) -> Vec<Vec<String>> {
    names
        .iter()
        .map(|g| g.iter().map(|s| s.to_string()).collect())
        .collect()
}

/// Test: Diamond dependencies
/// Given {A:[]},{B:[A]},{C:[A]},{D:[B,C]}
/// When dependencies are resolved
/// Then the parallel groups are [[A],[B,C],[D]]
#[test]
fn test_diamond_parallel_groups() {
    let order = resolve_dependencies(&diamond()).unwrap();
    assert_eq!(order.parallel_groups, groups(&[&["A"], &["B", "C"], &["D"]]));
    assert_eq!(order.execution_order, vec!["A", "B", "C", "D"]);
    assert_eq!(order.dependency_levels(), 3);
}

/// Test: Dependencies precede dependents
/// Given a skill set declared in reverse order
/// When dependencies are resolved
/// Then every skill appears after all of its dependencies
#[test]
fn test_every_skill_after_its_dependencies() {
    let mut skills = chain(6);
    skills.reverse();
    skills.push(SkillDescriptor::new("side").depends_on(["s2", "s5"]));

    let order = resolve_dependencies(&skills).unwrap();
    for skill in &skills {
        let at = order.position(&skill.name).unwrap();
        for dep in &skill.dependencies {
            assert!(order.position(dep).unwrap() < at, "{} must precede {}", dep, skill.name);
        }
    }

    let flattened: Vec<String> = order.parallel_groups.concat();
    assert_eq!(flattened.len(), order.execution_order.len());
    for skill in &skills {
        let at = flattened.iter().position(|n| n == &skill.name).unwrap();
        for dep in &skill.dependencies {
            assert!(flattened.iter().position(|n| n == dep).unwrap() < at);
        }
    }
}

/// Test: Two-skill cycle
/// Given A depends on B and B depends on A
/// When dependencies are resolved
/// Then a circular dependency error names both members
#[test]
fn test_cycle_is_rejected() {
    let skills = vec![
        SkillDescriptor::new("A").depends_on(["B"]),
        SkillDescriptor::new("B").depends_on(["A"]),
    ];
    let err = resolve_dependencies(&skills).unwrap_err();
    match err {
        Error::CircularDependency { cycle } => {
            assert!(cycle.contains(&"A".to_string()));
            assert!(cycle.contains(&"B".to_string()));
        }
        other => panic!("expected a cycle, got {:?}", other),
    }
}

/// Test: Undeclared dependency
/// Given a skill that depends on a skill not in the set
/// When dependencies are resolved
/// Then a missing dependency error names both skills
#[test]
fn test_missing_dependency() {
    let err = resolve_dependencies(&[SkillDescriptor::new("deploy").depends_on(["build"])])
        .unwrap_err();
    assert_eq!(err.to_string(), "Skill deploy depends on undeclared skill build");
}

/// Test: Planning from a manifest
/// Given a TOML manifest with a mutating skill
/// When a plan is created for the final skill
/// Then dependencies are pulled in and the mutating step is checkpointed
#[test]
fn test_plan_from_manifest() {
    let manifest = SkillManifest::from_toml_str(
        r#"
        [[skills]]
        name = "analyze"
        estimated_duration = 10

        [[skills]]
        name = "refactor"
        dependencies = ["analyze"]
        mutating = true

        [[skills]]
        name = "verify"
        dependencies = ["refactor"]
        "#,
    )
    .unwrap();
    let registry = Arc::new(manifest.into_registry().unwrap());

    let plan = ExecutionPlanner::new(registry, PlannerConfig::default())
        .create_plan(&PlanRequest::new("tidy up", ["verify"]))
        .unwrap();

    let names: Vec<_> = plan.steps.iter().map(|s| s.skill_name.as_str()).collect();
    assert_eq!(names, vec!["analyze", "refactor", "verify"]);
    assert!(plan.steps[1].checkpoint_before);
    assert!(plan.steps[1].critical);
    assert_eq!(plan.checkpoints.len(), 1);
    assert_eq!(plan.estimated_duration.as_secs(), 10 + 30 + 30);
}

/// Test: Confidence threshold
/// Given a configurable threshold of 0.8
/// When one skill has confidence 0.7 and another 0.9
/// Then only the low-confidence step is decision-gated
#[test]
fn test_threshold_is_configurable() {
    let registry = registry(diamond());
    let config = PlannerConfig {
        confidence_threshold: 0.8,
        ..PlannerConfig::default()
    };
    let request = PlanRequest::new("t", ["D"])
        .with_hints("B", SkillHints::confidence(0.7))
        .with_hints("C", SkillHints::confidence(0.9));
    let plan = ExecutionPlanner::new(registry, config).create_plan(&request).unwrap();

    let gated: Vec<_> = plan
        .steps
        .iter()
        .filter(|s| s.decision_before.is_some())
        .map(|s| s.skill_name.as_str())
        .collect();
    assert_eq!(gated, vec!["B"]);
    assert_eq!(plan.decision_points.len(), 1);
}
