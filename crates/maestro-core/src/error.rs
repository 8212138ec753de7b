//! Node-level error taxonomy.
//!
//! Retry policy hangs off the error class: `Timeout`, `Spawn` and
//! tool-declared transient codes are retryable; protocol violations,
//! schema-violating output, dangling artifacts and agent failures are fatal
//! unless the agent opts into retry.

use thiserror::Error;

use crate::types::NodeErrorInfo;

/// Everything that can go wrong while dispatching one node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("failed to spawn tool process: {message}")]
    Spawn { message: String },

    #[error("tool did not respond within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("tool error {code}: {message}")]
    Tool {
        code: i64,
        message: String,
        retryable: bool,
    },

    #[error("artifact not resolvable: {uri}")]
    MissingArtifact { uri: String },

    #[error("placeholder {reference} did not resolve against upstream output")]
    UnresolvedPlaceholder { reference: String },

    #[error("unknown tool method: {name}")]
    UnknownTool { name: String },

    #[error("tool unavailable: {name}")]
    ToolUnavailable { name: String },

    #[error("unknown agent: {name}")]
    UnknownAgent { name: String },

    #[error("agent error: {message}")]
    Agent { message: String, retryable: bool },

    #[error("agent did not return within {timeout_ms} ms")]
    AgentTimeout { timeout_ms: u64 },

    #[error("output violates declared schema: {message}")]
    Schema { message: String },

    #[error("store error: {message}")]
    Store { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    /// One retry is allowed inside the executor for these classes.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Timeout { .. } | NodeError::Spawn { .. } => true,
            NodeError::Tool { retryable, .. } => *retryable,
            NodeError::Agent { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Stable kind label surfaced in the run view.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::Spawn { .. } => "SpawnError",
            NodeError::Timeout { .. } => "Timeout",
            NodeError::Protocol { .. } => "ProtocolError",
            NodeError::Tool { .. } => "ToolError",
            NodeError::MissingArtifact { .. } => "MissingArtifact",
            NodeError::UnresolvedPlaceholder { .. } => "UnresolvedPlaceholder",
            NodeError::UnknownTool { .. } => "UnknownTool",
            NodeError::ToolUnavailable { .. } => "ToolUnavailable",
            NodeError::UnknownAgent { .. } => "UnknownAgent",
            NodeError::Agent { .. } => "AgentError",
            NodeError::AgentTimeout { .. } => "AgentTimeout",
            NodeError::Schema { .. } => "SchemaError",
            NodeError::Store { .. } => "StoreError",
            NodeError::Cancelled => "Cancelled",
        }
    }
}

/// A node failure together with the captured tool stderr, if any.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub error: NodeError,
    pub stderr: Option<String>,
}

impl NodeFailure {
    pub fn new(error: NodeError) -> Self {
        Self {
            error,
            stderr: None,
        }
    }

    pub fn with_stderr(error: NodeError, stderr: Option<String>) -> Self {
        let stderr = stderr.filter(|s| !s.trim().is_empty());
        Self { error, stderr }
    }

    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }

    pub fn to_info(&self) -> NodeErrorInfo {
        NodeErrorInfo {
            kind: self.error.kind().to_string(),
            message: self.error.to_string(),
            stderr: self.stderr.clone(),
        }
    }
}

impl From<NodeError> for NodeFailure {
    fn from(error: NodeError) -> Self {
        Self::new(error)
    }
}
