use crate::types::{StepId, StepSpec, StepStatus, TriggerRule, WorkflowSpec};
use anyhow::{anyhow, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A fan-in dependency: `successor` waits on every step in `predecessors`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub predecessors: Vec<StepId>,
    pub successor: StepId,
}

/// Whether a pending step may start, given its predecessors' statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Some predecessor has not finished yet
    Waiting,
    /// The trigger rule is satisfied
    Ready,
    /// The trigger rule can no longer be satisfied
    Blocked,
}

/// DAG representation of a workflow
pub struct WorkflowDag {
    graph: DiGraph<StepSpec, ()>,
    step_indices: HashMap<StepId, NodeIndex>,
}

impl WorkflowDag {
    /// Build a DAG from a workflow specification
    pub fn from_workflow(workflow: &WorkflowSpec) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        for step in &workflow.steps {
            if step_indices.contains_key(&step.id) {
                return Err(anyhow!("Step {} is defined more than once", step.id));
            }
            let node = graph.add_node(step.clone());
            step_indices.insert(step.id.clone(), node);
        }

        for (step_id, dependencies) in &workflow.dependencies {
            let step_idx = step_indices
                .get(step_id)
                .ok_or_else(|| anyhow!("Step {} referenced in dependencies but not defined", step_id))?;

            for dep_id in dependencies {
                let dep_idx = step_indices
                    .get(dep_id)
                    .ok_or_else(|| anyhow!("Dependency {} not found for step {}", dep_id, step_id))?;

                // dep -> step
                graph.update_edge(*dep_idx, *step_idx, ());
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(anyhow!("Workflow contains circular dependencies"));
        }

        Ok(Self {
            graph,
            step_indices,
        })
    }

    fn node(&self, step_id: &StepId) -> Result<NodeIndex> {
        self.step_indices
            .get(step_id)
            .copied()
            .ok_or_else(|| anyhow!("Step {} not found", step_id))
    }

    fn neighbors(&self, step_id: &StepId, direction: Direction) -> Result<Vec<StepId>> {
        let node = self.node(step_id)?;

        let mut ids: Vec<StepId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].id.clone())
            .collect();
        ids.sort();

        Ok(ids)
    }

    /// All steps, in definition order
    pub fn steps(&self) -> Vec<StepSpec> {
        self.graph.node_weights().cloned().collect()
    }

    pub fn step(&self, step_id: &StepId) -> Option<&StepSpec> {
        self.step_indices.get(step_id).map(|n| &self.graph[*n])
    }

    /// Get steps in topological order (dependencies first)
    pub fn topological_order(&self) -> Vec<StepSpec> {
        let mut topo = Topo::new(&self.graph);
        let mut steps = Vec::new();

        while let Some(node) = topo.next(&self.graph) {
            steps.push(self.graph[node].clone());
        }

        steps
    }

    /// Get dependencies for a step
    pub fn dependencies(&self, step_id: &StepId) -> Result<Vec<StepId>> {
        self.neighbors(step_id, Direction::Incoming)
    }

    /// Get steps that depend on the given step
    pub fn dependents(&self, step_id: &StepId) -> Result<Vec<StepId>> {
        self.neighbors(step_id, Direction::Outgoing)
    }

    /// Fan-in edges, one per step that has predecessors, sorted by successor
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = self
            .graph
            .node_indices()
            .filter_map(|n| {
                let mut predecessors: Vec<StepId> = self
                    .graph
                    .neighbors_directed(n, Direction::Incoming)
                    .map(|p| self.graph[p].id.clone())
                    .collect();
                if predecessors.is_empty() {
                    return None;
                }
                predecessors.sort();
                Some(DependencyEdge {
                    predecessors,
                    successor: self.graph[n].id.clone(),
                })
            })
            .collect();

        edges.sort_by(|a, b| a.successor.cmp(&b.successor));
        edges
    }

    /// Evaluate the step's trigger rule against the current step statuses.
    /// Steps missing from `statuses` count as pending.
    pub fn readiness(
        &self,
        step_id: &StepId,
        statuses: &HashMap<StepId, StepStatus>,
    ) -> Result<Readiness> {
        let node = self.node(step_id)?;
        let rule = self.graph[node].trigger_rule;

        let upstream: Vec<StepStatus> = self
            .dependencies(step_id)?
            .iter()
            .map(|dep| statuses.get(dep).copied().unwrap_or(StepStatus::Pending))
            .collect();

        let readiness = match rule {
            TriggerRule::AllSuccess => {
                if upstream
                    .iter()
                    .any(|s| matches!(s, StepStatus::Failed | StepStatus::Skipped))
                {
                    Readiness::Blocked
                } else if upstream.iter().all(|s| *s == StepStatus::Completed) {
                    Readiness::Ready
                } else {
                    Readiness::Waiting
                }
            }
            TriggerRule::AllDone => {
                if upstream.iter().all(|s| s.is_terminal()) {
                    Readiness::Ready
                } else {
                    Readiness::Waiting
                }
            }
        };

        Ok(readiness)
    }

    /// Check if all dependencies of a step are satisfied
    pub fn can_execute(
        &self,
        step_id: &StepId,
        statuses: &HashMap<StepId, StepStatus>,
    ) -> Result<bool> {
        Ok(self.readiness(step_id, statuses)? == Readiness::Ready)
    }

    /// Get all steps with no dependencies (can start immediately)
    pub fn entry_steps(&self) -> Vec<StepSpec> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].clone())
            .collect()
    }
}
