//! Skill dependency graph resolution.
//!
//! This module turns a set of skill descriptors into a directed acyclic graph
//! (edges run dependency -> dependent), rejects undeclared dependencies and
//! cycles, and produces a deterministic execution order plus a layering into
//! groups that may run concurrently.

use crate::core::skill::{SkillDescriptor, SkillRegistry};
use crate::error::{Error, Result};
use crate::{clog_debug, clog_warn};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Result of dependency resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOrder {
    /// Skill names in a dependency-consistent order.
    pub execution_order: Vec<String>,
    /// Layers of skills whose dependencies are satisfied by earlier layers.
    ///
    /// Concatenating the groups yields a valid topological order, and every
    /// skill appears in exactly one group.
    pub parallel_groups: Vec<Vec<String>>,
}

impl ExecutionOrder {
    /// Depth of the dependency graph.
    pub fn dependency_levels(&self) -> usize {
        self.parallel_groups.len()
    }

    pub fn len(&self) -> usize {
        self.execution_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.execution_order.is_empty()
    }

    /// Position of a skill in `execution_order`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.execution_order.iter().position(|n| n == name)
    }
}

/// Graph of skills keyed by name.
///
/// Node indices follow input order, which is what makes tie-breaking
/// reproducible.
pub struct SkillGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl SkillGraph {
    /// Build the graph, validating names and declared dependencies.
    ///
    /// # Errors
    /// - `DuplicateSkill` if a name appears twice
    /// - `MissingDependency` if a dependency is not among the given skills
    pub fn build(skills: &[SkillDescriptor]) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(skills.len(), skills.len());
        let mut index = HashMap::with_capacity(skills.len());

        for skill in skills {
            if index.contains_key(&skill.name) {
                return Err(Error::DuplicateSkill(skill.name.clone()));
            }
            let node = graph.add_node(skill.name.clone());
            index.insert(skill.name.clone(), node);
        }

        for skill in skills {
            let to = index[&skill.name];
            for dep in &skill.dependencies {
                let from = *index.get(dep).ok_or_else(|| Error::MissingDependency {
                    skill: skill.name.clone(),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(from, to, ());
            }
        }

        Ok(Self { graph, index })
    }

    pub fn skill_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Skills that depend directly on `name`.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(&node) = self.index.get(name) else {
            return Vec::new();
        };
        let mut out: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        out.sort();
        out.into_iter().map(|n| self.graph[n].as_str()).collect()
    }

    /// Find a dependency cycle, if any.
    ///
    /// Returns the cycle as a closed path (`a -> b -> a`), starting from the
    /// member that was declared first. When several cycles exist the one
    /// containing the earliest-declared skill is reported.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut cyclic: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || (scc.len() == 1 && self.graph.contains_edge(scc[0], scc[0]))
            })
            .collect();

        for scc in cyclic.iter_mut() {
            scc.sort();
        }
        cyclic.sort_by_key(|scc| scc[0]);

        let scc = cyclic.first()?;
        let members: HashSet<NodeIndex> = scc.iter().copied().collect();
        let start = scc[0];
        let path = self.cycle_path(start, &members)?;

        let mut names: Vec<String> = path.into_iter().map(|n| self.graph[n].clone()).collect();
        names.push(self.graph[start].clone());
        Some(names)
    }

    /// Depth-first search inside one strongly connected component for a path
    /// leading back to `start`.
    fn cycle_path(&self, start: NodeIndex, members: &HashSet<NodeIndex>) -> Option<Vec<NodeIndex>> {
        let mut path = vec![start];
        let mut visited: HashSet<NodeIndex> = HashSet::from([start]);
        let mut stack: Vec<Vec<NodeIndex>> = vec![self.sorted_successors(start, members)];

        while let Some(frontier) = stack.last_mut() {
            let Some(next) = frontier.pop() else {
                stack.pop();
                path.pop();
                continue;
            };
            if next == start {
                return Some(path);
            }
            if visited.insert(next) {
                path.push(next);
                stack.push(self.sorted_successors(next, members));
            }
        }
        None
    }

    // Reverse-sorted so that `pop()` visits lower indices first.
    fn sorted_successors(&self, node: NodeIndex, members: &HashSet<NodeIndex>) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by(|a, b| b.cmp(a));
        next.dedup();
        next
    }

    /// Kahn's algorithm with a min-heap on input position.
    ///
    /// Also computes each node's layer as the longest path from a source.
    fn kahn(&self) -> Result<(Vec<NodeIndex>, Vec<usize>)> {
        let n = self.graph.node_count();
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();
        let mut level = vec![0usize; n];

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|i| in_degree[i.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for succ in self.graph.neighbors_directed(node, Direction::Outgoing) {
                let s = succ.index();
                level[s] = level[s].max(level[node.index()] + 1);
                in_degree[s] -= 1;
                if in_degree[s] == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }

        if order.len() != n {
            let cycle = self.find_cycle().unwrap_or_else(|| {
                self.graph
                    .node_indices()
                    .filter(|i| in_degree[i.index()] > 0)
                    .map(|i| self.graph[i].clone())
                    .collect()
            });
            return Err(Error::CircularDependency { cycle });
        }

        Ok((order, level))
    }

    /// Compute the execution order and parallel groups.
    ///
    /// # Errors
    /// Returns `CircularDependency` naming the cycle if the graph is cyclic.
    pub fn execution_order(&self) -> Result<ExecutionOrder> {
        if let Some(cycle) = self.find_cycle() {
            return Err(Error::CircularDependency { cycle });
        }

        let (order, level) = self.kahn()?;

        let depth = level.iter().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut parallel_groups: Vec<Vec<String>> = vec![Vec::new(); depth];
        for node in self.graph.node_indices() {
            parallel_groups[level[node.index()]].push(self.graph[node].clone());
        }

        Ok(ExecutionOrder {
            execution_order: order.into_iter().map(|n| self.graph[n].clone()).collect(),
            parallel_groups,
        })
    }
}

impl std::fmt::Debug for SkillGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillGraph")
            .field("skills", &self.skill_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

/// Resolves skill sets into execution orders.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a collection of descriptors.
    ///
    /// # Errors
    /// `DuplicateSkill`, `MissingDependency` or `CircularDependency`. All are
    /// fatal; nothing should be executed from a set that fails here.
    pub fn resolve(&self, skills: &[SkillDescriptor]) -> Result<ExecutionOrder> {
        let graph = SkillGraph::build(skills).inspect_err(|e| {
            clog_warn!("Dependency resolution failed: {}", e);
        })?;
        let order = graph.execution_order().inspect_err(|e| {
            clog_warn!("Dependency resolution failed: {}", e);
        })?;

        clog_debug!(
            "Resolved {} skills into {} levels ({} edges)",
            order.len(),
            order.dependency_levels(),
            graph.dependency_count()
        );
        Ok(order)
    }

    /// Resolve named skills from a registry, without pulling in dependencies.
    ///
    /// # Errors
    /// `SkillNotFound` for an unknown name, then as [`resolve`](Self::resolve).
    pub fn resolve_names(&self, registry: &SkillRegistry, names: &[String]) -> Result<ExecutionOrder> {
        let skills = names
            .iter()
            .map(|name| {
                registry
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::SkillNotFound(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        self.resolve(&skills)
    }
}

/// Resolve a collection of descriptors with the default resolver.
pub fn resolve_dependencies(skills: &[SkillDescriptor]) -> Result<ExecutionOrder> {
    DependencyResolver::new().resolve(skills)
}
