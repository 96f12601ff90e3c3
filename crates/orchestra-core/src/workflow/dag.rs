//! Dependency graph analysis: cycle detection, ownership, and closures.
//!
//! Uses `petgraph` to model step lifecycles as a directed graph. Leaf steps
//! and conditions are a single node. Parallel groups and loops finish only
//! after their members, so they get a start node and a finish node:
//!
//! - `depends_on`: finish(dependency) -> start(dependent)
//! - ownership: start(container) -> start(member)
//! - group/loop completion: finish(member) -> finish(container)
//!
//! Every edge is an ordering constraint the scheduler enforces, so a cycle
//! anywhere in this graph is a workflow that could never finish.

use std::collections::{HashMap, HashSet};

use orchestra_types::error::WorkflowError;
use orchestra_types::workflow::{StepConfig, WorkflowStep};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Lifecycle {
    start: NodeIndex,
    finish: NodeIndex,
}

/// Whether a container's completion waits on its members.
fn finishes_after_members(config: &StepConfig) -> bool {
    matches!(config, StepConfig::Parallel { .. } | StepConfig::Loop { .. })
}

/// Build the combined dependency + ownership graph.
///
/// References to unknown steps are ignored here; field validation reports them.
fn build_graph(steps: &[WorkflowStep]) -> DiGraph<&str, ()> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut index: HashMap<&str, Lifecycle> = HashMap::new();
    for step in steps {
        let start = graph.add_node(step.id.as_str());
        let finish = if finishes_after_members(&step.config) {
            let finish = graph.add_node(step.id.as_str());
            graph.add_edge(start, finish, ());
            finish
        } else {
            start
        };
        index.insert(step.id.as_str(), Lifecycle { start, finish });
    }

    for step in steps {
        let Some(&node) = index.get(step.id.as_str()) else {
            continue;
        };
        for dep in &step.depends_on {
            if let Some(dep_node) = index.get(dep.as_str()) {
                graph.add_edge(dep_node.finish, node.start, ());
            }
        }
        for member in step.config.members() {
            let Some(&member_node) = index.get(member) else {
                continue;
            };
            graph.add_edge(node.start, member_node.start, ());
            if node.finish != node.start {
                graph.add_edge(member_node.finish, node.finish, ());
            }
        }
    }

    graph
}

// ---------------------------------------------------------------------------
// DAG validation
// ---------------------------------------------------------------------------

/// Validate that steps form a DAG, returning the offending cycle otherwise.
///
/// The cycle is reported as a closed path (`a -> b -> a`).
pub fn validate_dag(steps: &[WorkflowStep]) -> Result<(), WorkflowError> {
    let graph = build_graph(steps);

    let Err(cycle) = toposort(&graph, None) else {
        return Ok(());
    };

    let start = cycle.node_id();
    Err(WorkflowError::DependencyCycle {
        cycle: cycle_path(&graph, start),
    })
}

/// Walk edges inside the strongly connected component of `start` until a
/// node repeats, yielding one concrete cycle.
fn cycle_path(graph: &DiGraph<&str, ()>, start: NodeIndex) -> Vec<String> {
    let component: HashSet<NodeIndex> = tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.contains(&start))
        .map(|scc| scc.into_iter().collect())
        .unwrap_or_default();

    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(next) = graph
            .neighbors(current)
            .find(|n| component.contains(n))
        else {
            // Only a self-loop-free singleton reaches here; report it alone.
            return vec![graph[start].to_string()];
        };
        if let Some(pos) = path.iter().position(|&n| n == next) {
            let mut ids: Vec<String> = Vec::new();
            let mut previous: Option<NodeIndex> = None;
            for &n in path[pos..].iter().chain(std::iter::once(&next)) {
                // start -> finish of the same container reads as one step.
                let same_step = previous.is_some_and(|p| p != n && graph[p] == graph[n]);
                if !same_step {
                    ids.push(graph[n].to_string());
                }
                previous = Some(n);
            }
            return ids;
        }
        path.push(next);
        current = next;
    }
}

// ---------------------------------------------------------------------------
// Ownership and closures
// ---------------------------------------------------------------------------

/// Map each container member to the container that owns it.
pub fn owners(steps: &[WorkflowStep]) -> HashMap<String, String> {
    let mut owners = HashMap::new();
    for step in steps {
        for member in step.config.members() {
            owners.insert(member.to_string(), step.id.clone());
        }
    }
    owners
}

/// Transitive ancestors of every step over dependency and ownership edges.
///
/// Assumes the graph is acyclic.
pub fn ancestors(steps: &[WorkflowStep]) -> HashMap<String, HashSet<String>> {
    let owner_of = owners(steps);
    let by_id: HashMap<&str, &WorkflowStep> = steps.iter().map(|s| (s.id.as_str(), s)).collect();

    steps
        .iter()
        .map(|step| {
            let mut visited = HashSet::new();
            let mut stack = vec![step.id.as_str()];
            while let Some(current) = stack.pop() {
                let Some(node) = by_id.get(current) else {
                    continue;
                };
                let parents = node
                    .depends_on
                    .iter()
                    .map(String::as_str)
                    .chain(owner_of.get(current).map(String::as_str));
                for parent in parents {
                    if visited.insert(parent.to_string()) {
                        stack.push(parent);
                    }
                }
            }
            (step.id.clone(), visited)
        })
        .collect()
}

/// Every step transitively owned by each container, in declaration order.
pub fn descendants(steps: &[WorkflowStep]) -> HashMap<String, Vec<String>> {
    let owner_of = owners(steps);
    let mut result: HashMap<String, Vec<String>> = HashMap::new();

    for step in steps {
        let mut current = owner_of.get(&step.id);
        let mut guard = 0;
        while let Some(owner) = current {
            result.entry(owner.clone()).or_default().push(step.id.clone());
            current = owner_of.get(owner);
            guard += 1;
            if guard > steps.len() {
                break;
            }
        }
    }

    result
}
