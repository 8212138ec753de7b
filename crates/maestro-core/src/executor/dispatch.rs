//! Uniform node dispatch.
//!
//! The scheduler never branches on node kind; it hands a resolved argument
//! object to the dispatcher, which routes tool nodes through the
//! `ToolInvoker` transport (bounded by the global process semaphore) and
//! agent nodes through the in-process registry under a supervising timer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::timeout;
// Re-exported so transport crates can build invocations without a direct
// tokio-util dependency.
pub use tokio_util::sync::CancellationToken;

use crate::agent::AgentRegistry;
use crate::capability::{CapabilityIndex, DEFAULT_TOOL_VERSION};
use crate::error::{NodeError, NodeFailure};
use crate::types::{NodeKind, NodeSpec};

/// Cap on concurrently running tool processes across all runs.
pub const DEFAULT_PROCESS_SLOTS: usize = 16;

/// One tool call: method, resolved params, deadline, cancellation.
#[derive(Debug)]
pub struct ToolInvocation {
    pub method: String,
    pub params: serde_json::Value,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// Transport that executes a single JSON-RPC call against a tool server.
/// The stdio implementation lives in `maestro-tools`.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, invocation: ToolInvocation) -> Result<serde_json::Value, NodeFailure>;
}

/// Shared dispatch surface over tools and agents.
pub struct NodeDispatcher {
    index: Arc<CapabilityIndex>,
    tools: Arc<dyn ToolInvoker>,
    agents: Arc<AgentRegistry>,
    process_slots: Arc<Semaphore>,
}

impl NodeDispatcher {
    pub fn new(
        index: Arc<CapabilityIndex>,
        tools: Arc<dyn ToolInvoker>,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        Self::with_process_slots(index, tools, agents, DEFAULT_PROCESS_SLOTS)
    }

    pub fn with_process_slots(
        index: Arc<CapabilityIndex>,
        tools: Arc<dyn ToolInvoker>,
        agents: Arc<AgentRegistry>,
        slots: usize,
    ) -> Self {
        Self {
            index,
            tools,
            agents,
            process_slots: Arc::new(Semaphore::new(slots.max(1))),
        }
    }

    /// Version tag for idempotency keys: tool entry version or agent
    /// version.
    pub fn version_tag(&self, spec: &NodeSpec) -> String {
        match spec.kind {
            NodeKind::Tool => self
                .index
                .resolve_method(&spec.name)
                .map(|(_, entry, _)| entry.version.clone())
                .unwrap_or_else(|| DEFAULT_TOOL_VERSION.to_string()),
            NodeKind::Agent => self
                .agents
                .get(&spec.name)
                .map(|a| a.version().to_string())
                .unwrap_or_else(|| DEFAULT_TOOL_VERSION.to_string()),
        }
    }

    /// Whether the consuming tool asked for inlined artifact bytes.
    pub fn wants_inline(&self, spec: &NodeSpec) -> bool {
        spec.kind == NodeKind::Tool
            && self
                .index
                .resolve_method(&spec.name)
                .is_some_and(|(_, _, method)| method.wants_inline)
    }

    /// Execute one attempt of a node with fully resolved params.
    pub async fn dispatch(
        &self,
        spec: &NodeSpec,
        params: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, NodeFailure> {
        match spec.kind {
            NodeKind::Tool => self.dispatch_tool(spec, params, cancel).await,
            NodeKind::Agent => self.dispatch_agent(spec, params).await,
        }
    }

    async fn dispatch_tool(
        &self,
        spec: &NodeSpec,
        params: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, NodeFailure> {
        if self.index.resolve_method(&spec.name).is_none() {
            return Err(NodeFailure::new(NodeError::UnknownTool {
                name: spec.name.clone(),
            }));
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NodeFailure::new(NodeError::Cancelled)),
            permit = self.process_slots.clone().acquire_owned() => permit
                .map_err(|_| NodeFailure::new(NodeError::Store {
                    message: "process slot semaphore closed".to_string(),
                }))?,
        };
        let _permit = permit;

        self.tools
            .invoke(ToolInvocation {
                method: spec.name.clone(),
                params,
                timeout: Duration::from_millis(spec.timeout_ms),
                cancel: cancel.child_token(),
            })
            .await
    }

    async fn dispatch_agent(
        &self,
        spec: &NodeSpec,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, NodeFailure> {
        let agent = self
            .agents
            .get(&spec.name)
            .ok_or_else(|| NodeFailure::new(NodeError::UnknownAgent {
                name: spec.name.clone(),
            }))?;
        let args = match params {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(NodeFailure::new(NodeError::Agent {
                    message: format!("agent params must be an object, got {}", other),
                    retryable: false,
                }))
            }
        };

        // Agents are pure and are not interrupted mid-call; the supervising
        // timer bounds how long the scheduler waits for them.
        let handle = tokio::task::spawn_blocking(move || agent.run(&args));
        match timeout(Duration::from_millis(spec.timeout_ms), handle).await {
            Err(_) => Err(NodeFailure::new(NodeError::AgentTimeout {
                timeout_ms: spec.timeout_ms,
            })),
            Ok(Err(join_err)) => Err(NodeFailure::new(NodeError::Agent {
                message: format!("agent task aborted: {}", join_err),
                retryable: false,
            })),
            Ok(Ok(Err(agent_err))) => Err(NodeFailure::new(NodeError::Agent {
                message: agent_err.message,
                retryable: agent_err.retryable,
            })),
            Ok(Ok(Ok(output))) => Ok(output),
        }
    }
}
