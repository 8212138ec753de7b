//! Agent abstraction
//!
//! Agents are in-process pure-data transforms: deterministic functions from
//! resolved JSON arguments to a JSON output. The executor dispatches them
//! through the registry with a supervising timeout; they never touch the
//! stores directly.

mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

pub use builtin::{ExtractionAgent, ReducerAgent, ValidatorAgent, VizSpecAgent};

pub const DEFAULT_AGENT_VERSION: &str = "v1";

/// Agent failure. Fatal unless the agent opts into retry.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
    pub retryable: bool,
}

impl AgentError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// A pure transform over resolved node arguments.
///
/// Implementations must be deterministic: equal inputs produce equal
/// outputs, which is what makes the idempotency cache sound for agent
/// nodes.
pub trait Agent: Send + Sync {
    /// Registry name (must be unique).
    fn name(&self) -> &str;

    /// Version tag folded into idempotency keys; bump on behavior change.
    fn version(&self) -> &str {
        DEFAULT_AGENT_VERSION
    }

    fn run(&self, args: &Map<String, Value>) -> Result<Value, AgentError>;
}

/// In-process registry of agents, indexed by name.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in agents.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(VizSpecAgent));
        registry.register(Arc::new(ExtractionAgent));
        registry.register(Arc::new(ValidatorAgent));
        registry.register(Arc::new(ReducerAgent));
        registry
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }
}
