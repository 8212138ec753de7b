//! Run and node-run state machines
//!
//! Runs transition only forward: `created -> running -> terminal`. A node
//! run is `pending -> running -> (succeeded | failed | cached)`; a failed
//! node may re-enter `running` exactly once while its retry budget lasts,
//! and `skipped` marks nodes whose upstream run never reached them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub plan_id: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// First failing node's error, promoted for the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeErrorInfo>,
    /// Reducer sink output, promoted on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Run {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4().simple()),
            plan_id: plan_id.into(),
            state: RunState::Created,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
            result: None,
        }
    }
}

/// Node run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cached,
    Skipped,
}

impl NodeRunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeRunState::Succeeded
                | NodeRunState::Failed
                | NodeRunState::Cached
                | NodeRunState::Skipped
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NodeRunState::Succeeded | NodeRunState::Cached)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRunState::Pending => "pending",
            NodeRunState::Running => "running",
            NodeRunState::Succeeded => "succeeded",
            NodeRunState::Failed => "failed",
            NodeRunState::Cached => "cached",
            NodeRunState::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NodeRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error record persisted on a failed node run. `stderr` carries the tool
/// process diagnostics and never contaminates the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeErrorInfo {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Execution record of a single node within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRun {
    pub run_id: String,
    pub node_id: String,
    pub state: NodeRunState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeErrorInfo>,
}

impl NodeRun {
    pub fn pending(
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            state: NodeRunState::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            idempotency_key: idempotency_key.into(),
            output: None,
            error: None,
        }
    }

    pub fn start_attempt(&mut self) {
        self.state = NodeRunState::Running;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn succeed(&mut self, output: Value) {
        self.state = NodeRunState::Succeeded;
        self.output = Some(output);
        self.finished_at = Some(Utc::now());
    }

    pub fn cache_hit(&mut self, output: Value) {
        self.state = NodeRunState::Cached;
        self.output = Some(output);
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: NodeErrorInfo) {
        self.state = NodeRunState::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    pub fn skip(&mut self) {
        self.state = NodeRunState::Skipped;
        self.finished_at = Some(Utc::now());
    }
}
