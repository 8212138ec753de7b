//! Plan and node definitions
//!
//! A Plan is the materialized DAG the planner hands to the executor. It is
//! immutable once stored; node ids are unique within a plan and stable
//! across retries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{FlowKind, Value};

pub const DEFAULT_NODE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Node flavor: an external tool process or an in-process agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Tool,
    Agent,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Tool => "tool",
            NodeKind::Agent => "agent",
        }
    }
}

/// A single unit of work in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub node_id: String,
    pub kind: NodeKind,
    /// Tool method name (e.g. `sql.query`) or agent name (e.g. `reducer`).
    pub name: String,
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
    /// Node ids this node depends on.
    #[serde(default)]
    pub upstream: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_NODE_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl NodeSpec {
    pub fn tool(node_id: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(node_id, NodeKind::Tool, method)
    }

    pub fn agent(node_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(node_id, NodeKind::Agent, name)
    }

    fn new(node_id: impl Into<String>, kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            name: name.into(),
            args: BTreeMap::new(),
            upstream: Vec::new(),
            timeout_ms: DEFAULT_NODE_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    pub fn with_upstream(mut self, upstream: Vec<String>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A materialized DAG of nodes with argument bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub flow: FlowKind,
    /// Nodes in planner order; the executor preserves this order when
    /// several nodes are ready at once.
    pub nodes: Vec<NodeSpec>,
    /// Edge set `(from, to)`; consistent with each node's `upstream` list.
    pub edges: Vec<(String, String)>,
}

impl Plan {
    /// Assemble a plan, deriving the edge set from node upstream lists.
    pub fn new(flow: FlowKind, nodes: Vec<NodeSpec>) -> Self {
        let edges = nodes
            .iter()
            .flat_map(|node| {
                node.upstream
                    .iter()
                    .map(|up| (up.clone(), node.node_id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        Self {
            plan_id: format!("pln_{}", uuid::Uuid::new_v4().simple()),
            flow,
            nodes,
            edges,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Node ids with no outgoing edges.
    pub fn sink_ids(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| !self.edges.iter().any(|(from, _)| from == &n.node_id))
            .map(|n| n.node_id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_derives_edges_from_upstream() {
        let plan = Plan::new(
            FlowKind::Plot,
            vec![
                NodeSpec::tool("sql", "sql.query"),
                NodeSpec::tool("tfm", "dataframe.transform")
                    .with_upstream(vec!["sql".to_string()]),
                NodeSpec::agent("reduce", "reducer").with_upstream(vec!["tfm".to_string()]),
            ],
        );

        assert_eq!(
            plan.edges,
            vec![
                ("sql".to_string(), "tfm".to_string()),
                ("tfm".to_string(), "reduce".to_string()),
            ]
        );
        assert_eq!(plan.sink_ids(), vec!["reduce"]);
    }

    #[test]
    fn test_node_spec_defaults() {
        let node = NodeSpec::tool("sql", "sql.query");
        assert_eq!(node.timeout_ms, DEFAULT_NODE_TIMEOUT_MS);
        assert_eq!(node.max_retries, DEFAULT_MAX_RETRIES);
        assert!(node.args.is_empty());
    }
}
