//! Skill descriptors and the registry they are planned from.
//!
//! A skill is a named unit of work. Its descriptor declares which other
//! skills must run first and whether it mutates the project, which drives
//! the default checkpoint policy.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::option_duration_secs;

/// Static description of a skill, immutable for the duration of a planning pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillDescriptor {
    /// Unique skill name.
    pub name: String,
    /// Names of skills that must complete before this one.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Whether the skill modifies tracked state (advisory, used for checkpointing).
    #[serde(default)]
    pub mutating: bool,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Declared parameter names, filled in by the parameter binder.
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Criticality override; when absent, mutating skills are critical.
    #[serde(default)]
    pub critical: Option<bool>,
    /// Default duration estimate.
    #[serde(default, with = "option_duration_secs")]
    pub estimated_duration: Option<Duration>,
}

impl SkillDescriptor {
    /// Create a descriptor with no dependencies.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: BTreeSet::new(),
            mutating: false,
            description: String::new(),
            parameters: Vec::new(),
            critical: None,
            estimated_duration: None,
        }
    }

    /// Builder: add dependencies.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Builder: mark the skill as mutating.
    pub fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }

    /// Builder: set the criticality override.
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = Some(critical);
        self
    }

    /// Builder: declare parameter names.
    pub fn with_parameters<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters.extend(params.into_iter().map(Into::into));
        self
    }

    /// Builder: set the default duration estimate.
    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration = Some(estimate);
        self
    }

    /// Whether a failure of this skill should halt a plan.
    pub fn is_critical(&self) -> bool {
        self.critical.unwrap_or(self.mutating)
    }
}

/// Explicitly constructed set of known skills.
///
/// Registration order is preserved; it is the tie-break order the resolver
/// uses when several skills become ready at once.
#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    skills: Vec<SkillDescriptor>,
    index: HashMap<String, usize>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from descriptors, rejecting duplicate names.
    pub fn from_skills(skills: impl IntoIterator<Item = SkillDescriptor>) -> Result<Self> {
        let mut registry = Self::new();
        for skill in skills {
            registry.register(skill)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, skill: SkillDescriptor) -> Result<()> {
        if skill.name.trim().is_empty() {
            return Err(Error::Validation("skill name must not be empty".to_string()));
        }
        if self.index.contains_key(&skill.name) {
            return Err(Error::DuplicateSkill(skill.name));
        }
        self.index.insert(skill.name.clone(), self.skills.len());
        self.skills.push(skill);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SkillDescriptor> {
        self.index.get(name).map(|&i| &self.skills[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// All descriptors in registration order.
    pub fn skills(&self) -> &[SkillDescriptor] {
        &self.skills
    }

    /// The given skills plus everything they transitively depend on.
    ///
    /// Requested names come first in request order, then pulled-in
    /// dependencies in discovery order. Dependencies the registry does not
    /// know are left for the resolver to report.
    pub fn with_dependencies(&self, names: &[String]) -> Vec<SkillDescriptor> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut out = Vec::new();
        let mut queue: std::collections::VecDeque<&str> = names.iter().map(String::as_str).collect();

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name) {
                continue;
            }
            if let Some(skill) = self.get(name) {
                out.push(skill.clone());
                queue.extend(skill.dependencies.iter().map(String::as_str));
            }
        }
        out
    }
}

/// TOML manifest listing skills as `[[skills]]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillManifest {
    #[serde(default)]
    pub skills: Vec<SkillDescriptor>,
}

impl SkillManifest {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn into_registry(self) -> Result<SkillRegistry> {
        SkillRegistry::from_skills(self.skills)
    }
}
