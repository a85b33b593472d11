//! Dependency-graph validation and execution-plan construction.
//!
//! A dependency graph is a set of `(parent, child)` edges over a playbook's
//! agents. Accepted graphs satisfy four structural rules, checked in this
//! order at write time:
//!
//! 1. Every edge endpoint is one of the playbook's agents (`DanglingEdge`).
//! 2. Every node has at most one incoming edge (`MultiParent`).
//! 3. No cycles (`Cycle`).
//! 4. A node with a parent is never itself a parent (`MultiLevel`); the
//!    graph is one parent layer deep, never a chain.
//!
//! [`assign_levels`] then layers the graph with Kahn's algorithm: level 0
//! holds the parentless agents, each later level holds agents whose sole
//! parent sits in a prior level. Ties are broken by lexicographic agent id
//! so the same inputs always produce the same plan, byte for byte.
//!
//! The [`Plan`] snapshot captured by a job embeds the agent definitions,
//! the edges, and the precomputed levels; [`ExecutionPlan::build`] is a
//! pure function over it.

use crate::domainflow::error::{EngineError, EngineResult};
use crate::domainflow::types::{AgentClass, AgentDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Validate a graph's edges against the owning playbook's agent set.
///
/// Runs the four structural checks in documented order and returns the
/// first violation found.
///
/// # Example
///
/// ```rust
/// use domainflow::graph::validate_graph;
///
/// let agents = vec!["a".to_string(), "b".to_string(), "c".to_string()];
/// let edges = vec![("a".to_string(), "b".to_string())];
/// assert!(validate_graph(&edges, &agents).is_ok());
///
/// let cycle = vec![
///     ("a".to_string(), "b".to_string()),
///     ("b".to_string(), "a".to_string()),
/// ];
/// assert!(validate_graph(&cycle, &agents).is_err());
/// ```
pub fn validate_graph(edges: &[(String, String)], agent_ids: &[String]) -> EngineResult<()> {
    let known: HashSet<&str> = agent_ids.iter().map(|s| s.as_str()).collect();

    for (from, to) in edges {
        if !known.contains(from.as_str()) {
            return Err(EngineError::DanglingEdge(format!(
                "edge source '{}' is not in the playbook",
                from
            )));
        }
        if !known.contains(to.as_str()) {
            return Err(EngineError::DanglingEdge(format!(
                "edge target '{}' is not in the playbook",
                to
            )));
        }
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for (_, to) in edges {
        let count = in_degree.entry(to.as_str()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Err(EngineError::MultiParent(format!(
                "agent '{}' has more than one parent",
                to
            )));
        }
    }

    detect_cycle(edges, agent_ids)?;

    // One parent layer only: a parent may not itself have a parent.
    for (from, _) in edges {
        if in_degree.contains_key(from.as_str()) {
            return Err(EngineError::MultiLevel(format!(
                "agent '{}' both has a parent and is a parent",
                from
            )));
        }
    }

    Ok(())
}

/// Depth-first search with an explicit recursion stack for cycle detection.
fn detect_cycle(edges: &[(String, String)], agent_ids: &[String]) -> EngineResult<()> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in edges {
        adjacency.entry(from.as_str()).or_default().push(to.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: HashSet<&str> = HashSet::new();

    for start in agent_ids {
        if visited.contains(start.as_str()) {
            continue;
        }
        // Iterative DFS; each stack frame tracks the next child to explore.
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        on_stack.insert(start.as_str());
        while let Some((node, child_idx)) = stack.pop() {
            let children = adjacency.get(node).map(|v| v.as_slice()).unwrap_or(&[]);
            if child_idx < children.len() {
                stack.push((node, child_idx + 1));
                let child = children[child_idx];
                if on_stack.contains(child) {
                    return Err(EngineError::Cycle(format!(
                        "cycle through agent '{}'",
                        child
                    )));
                }
                if !visited.contains(child) {
                    on_stack.insert(child);
                    stack.push((child, 0));
                }
            } else {
                on_stack.remove(node);
                visited.insert(node);
            }
        }
    }
    Ok(())
}

/// Layer an already-validated graph with Kahn's algorithm.
///
/// Level 0 contains every agent with no parent; each subsequent level
/// contains the agents whose parent sits in a prior level. Within a level,
/// agents are sorted lexicographically for reproducibility.
pub fn assign_levels(edges: &[(String, String)], agent_ids: &[String]) -> Vec<Vec<String>> {
    let parent_of: HashMap<&str, &str> = edges
        .iter()
        .map(|(from, to)| (to.as_str(), from.as_str()))
        .collect();

    let mut placed: HashSet<&str> = HashSet::new();
    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut remaining: Vec<&str> = agent_ids.iter().map(|s| s.as_str()).collect();

    while !remaining.is_empty() {
        let mut level: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| match parent_of.get(id) {
                None => true,
                Some(parent) => placed.contains(parent),
            })
            .collect();

        // A validated graph always makes progress; bail rather than spin if
        // an unvalidated graph slips through.
        if level.is_empty() {
            break;
        }

        level.sort_unstable();
        for id in &level {
            placed.insert(id);
        }
        remaining.retain(|id| !placed.contains(id));
        levels.push(level.into_iter().map(|s| s.to_string()).collect());
    }

    levels
}

/// Read-only plan snapshot produced by the config store and embedded into
/// a job at submission.
///
/// Carries everything a job needs to run without touching the catalog
/// again: the resolved agent definitions, the validated edges, and the
/// precomputed level assignment. Once captured, a plan never changes, so
/// re-runs and audits see exactly what the job saw even if the catalog is
/// edited afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub domain_id: String,
    pub playbook_id: String,
    pub class: AgentClass,
    /// Resolved definitions for every agent in the playbook, keyed by id.
    /// Ordered map so serialization is canonical.
    pub agents: BTreeMap<String, AgentDefinition>,
    /// Validated `(parent, child)` edges.
    pub edges: Vec<(String, String)>,
    /// Precomputed execution-level assignment.
    pub levels: Vec<Vec<String>>,
}

/// One agent scheduled within a level, with its resolved definition and
/// optional parent.
#[derive(Debug, Clone)]
pub struct ScheduledAgent {
    pub agent_id: String,
    pub parent_id: Option<String>,
    pub definition: Arc<AgentDefinition>,
}

/// One execution level: all agents here run in parallel, and the level
/// joins before the next begins.
#[derive(Debug, Clone)]
pub struct Level {
    pub agents: Vec<ScheduledAgent>,
}

/// The ordered levels a job executes.
///
/// Built deterministically from a [`Plan`]: identical plans yield identical
/// execution plans on every invocation.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub levels: Vec<Level>,
}

impl ExecutionPlan {
    /// Materialize the execution plan from a captured snapshot.
    ///
    /// Fails with `BadReference` if a level names an agent the snapshot has
    /// no definition for, which indicates a corrupted snapshot.
    pub fn build(plan: &Plan) -> EngineResult<ExecutionPlan> {
        let parent_of: HashMap<&str, &str> = plan
            .edges
            .iter()
            .map(|(from, to)| (to.as_str(), from.as_str()))
            .collect();

        let mut levels = Vec::with_capacity(plan.levels.len());
        for level_ids in &plan.levels {
            let mut agents = Vec::with_capacity(level_ids.len());
            for agent_id in level_ids {
                let definition = plan.agents.get(agent_id).ok_or_else(|| {
                    EngineError::BadReference(format!(
                        "plan level references unknown agent '{}'",
                        agent_id
                    ))
                })?;
                agents.push(ScheduledAgent {
                    agent_id: agent_id.clone(),
                    parent_id: parent_of.get(agent_id.as_str()).map(|p| p.to_string()),
                    definition: Arc::new(definition.clone()),
                });
            }
            levels.push(Level { agents });
        }
        Ok(ExecutionPlan { levels })
    }

    /// Total number of scheduled agents across all levels.
    pub fn agent_count(&self) -> usize {
        self.levels.iter().map(|l| l.agents.len()).sum()
    }
}
