//! Core domain models for skill planning.
//!
//! This module contains the skill descriptors, the injected registry and the
//! dependency graph that every plan is derived from.

pub mod dag;
pub mod skill;

pub use dag::{resolve_dependencies, DependencyResolver, ExecutionOrder, SkillGraph};
pub use skill::{SkillDescriptor, SkillManifest, SkillRegistry};
