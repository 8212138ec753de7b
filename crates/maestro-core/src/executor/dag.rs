//! Execution DAG bookkeeping.
//!
//! Tracks per-node scheduling state and the ready queue. Ready order follows
//! plan order so sibling scheduling stays deterministic.

use std::collections::{HashMap, VecDeque};

use crate::types::{NodeSpec, Plan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DagNodeState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl DagNodeState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            DagNodeState::Completed | DagNodeState::Failed | DagNodeState::Skipped
        )
    }
}

#[derive(Debug)]
pub(crate) struct DagNode {
    pub spec: NodeSpec,
    pub state: DagNodeState,
    pub depends_on: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct ExecutionDag {
    nodes: HashMap<String, DagNode>,
    /// Node ids in plan order.
    order: Vec<String>,
    ready: VecDeque<String>,
}

impl ExecutionDag {
    /// Build the scheduling structure from a plan. The plan is expected to
    /// have passed planner validation; this only re-checks referential
    /// integrity.
    pub fn from_plan(plan: &Plan) -> Result<Self, String> {
        let mut nodes = HashMap::new();
        let mut order = Vec::new();
        for spec in &plan.nodes {
            if nodes.contains_key(&spec.node_id) {
                return Err(format!("duplicate node id '{}'", spec.node_id));
            }
            order.push(spec.node_id.clone());
            nodes.insert(
                spec.node_id.clone(),
                DagNode {
                    depends_on: spec.upstream.clone(),
                    spec: spec.clone(),
                    state: DagNodeState::Pending,
                },
            );
        }

        for spec in &plan.nodes {
            for dep in &spec.upstream {
                if !nodes.contains_key(dep) {
                    return Err(format!(
                        "node '{}' depends on unknown node '{}'",
                        spec.node_id, dep
                    ));
                }
            }
        }

        let mut dag = Self {
            nodes,
            order,
            ready: VecDeque::new(),
        };
        dag.refresh_ready();
        Ok(dag)
    }

    fn dependencies_satisfied(&self, node: &DagNode) -> bool {
        node.depends_on.iter().all(|dep| {
            self.nodes
                .get(dep)
                .map(|n| n.state == DagNodeState::Completed)
                .unwrap_or(false)
        })
    }

    fn refresh_ready(&mut self) {
        let newly_ready: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                let node = &self.nodes[*id];
                node.state == DagNodeState::Pending && self.dependencies_satisfied(node)
            })
            .cloned()
            .collect();
        for id in newly_ready {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.state = DagNodeState::Ready;
            }
            self.ready.push_back(id);
        }
    }

    /// Pop the next ready node, in plan order.
    pub fn take_ready(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    pub fn spec(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.get(node_id).map(|n| &n.spec)
    }

    pub fn mark_running(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.state = DagNodeState::Running;
        }
    }

    pub fn mark_completed(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.state = DagNodeState::Completed;
        }
        self.refresh_ready();
    }

    pub fn mark_failed(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.state = DagNodeState::Failed;
        }
    }

    pub fn mark_skipped(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.state = DagNodeState::Skipped;
        }
    }

    /// Ids of nodes that never reached a terminal state, in plan order.
    /// Ready-queue members count: they were never dispatched.
    pub fn non_terminal_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| !self.nodes[*id].state.is_terminal())
            .cloned()
            .collect()
    }

    pub fn all_successful(&self) -> bool {
        self.nodes
            .values()
            .all(|n| n.state == DagNodeState::Completed)
    }

    pub fn any_failed(&self) -> bool {
        self.nodes.values().any(|n| n.state == DagNodeState::Failed)
    }
}
