//! Executor
//!
//! Topological scheduling with bounded parallelism: ready nodes are
//! dispatched as futures, each completion updates the DAG and tops the
//! in-flight set back up, with no batch barrier. Per-node work goes through
//! the idempotency cache, placeholder resolution, the shared dispatcher,
//! and a fixed-backoff retry budget. The run/node store is the single
//! source of truth for state transitions.

mod dag;
mod dispatch;
mod resolve;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::error::{NodeError, NodeFailure};
use crate::store::{ArtifactStore, ArtifactUri, RunStore, StoreError};
use crate::types::{NodeErrorInfo, NodeRun, NodeSpec, Plan, Run, RunState};

use dag::ExecutionDag;

pub use dispatch::{
    CancellationToken, NodeDispatcher, ToolInvocation, ToolInvoker, DEFAULT_PROCESS_SLOTS,
};
pub use resolve::idempotency_key;

const DEFAULT_MAX_PARALLEL: usize = 4;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);
const MAX_LOG_TEXT_CHARS: usize = 2_000;

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("run {run_id} is already {state}")]
    Conflict { run_id: String, state: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

/// Realtime execution event for observers (metrics, progress displays).
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub run_id: String,
    pub node_id: Option<String>,
    /// Phase label, e.g. node_started / node_cached / run_completed.
    pub phase: String,
    pub message: Option<String>,
}

impl ExecutionEvent {
    fn run(run_id: &str, phase: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            node_id: None,
            phase: phase.to_string(),
            message: None,
        }
    }

    fn node(run_id: &str, node_id: &str, phase: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            node_id: Some(node_id.to_string()),
            phase: phase.to_string(),
            message: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Sink interface for execution events.
#[async_trait]
pub trait ExecutionListener: Send + Sync {
    async fn on_event(&self, event: ExecutionEvent);
}

enum NodeOutcome {
    Cached { output: serde_json::Value },
    Succeeded { output: serde_json::Value },
    Failed { info: NodeErrorInfo },
}

/// Orchestrates DAG execution over the run/node store.
pub struct Executor {
    run_store: Arc<dyn RunStore>,
    artifact_store: Arc<dyn ArtifactStore>,
    dispatcher: Arc<NodeDispatcher>,
    max_parallel: usize,
    retry_backoff: Duration,
    listener: Option<Arc<dyn ExecutionListener>>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl Executor {
    pub fn new(
        run_store: Arc<dyn RunStore>,
        artifact_store: Arc<dyn ArtifactStore>,
        dispatcher: Arc<NodeDispatcher>,
    ) -> Self {
        Self {
            run_store,
            artifact_store,
            dispatcher,
            max_parallel: DEFAULT_MAX_PARALLEL,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            listener: None,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Request cooperative cancellation of a running run. Returns whether a
    /// run was listening.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let cancellations = self.cancellations.lock().await;
        match cancellations.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute a created run to completion. The returned `Run` is the final
    /// persisted record; progress is observable through the store while the
    /// run is in flight.
    pub async fn execute(&self, run_id: &str) -> Result<Run, ExecuteError> {
        let cancel = CancellationToken::new();
        self.cancellations
            .lock()
            .await
            .insert(run_id.to_string(), cancel.clone());
        let result = self.execute_inner(run_id, cancel).await;
        self.cancellations.lock().await.remove(run_id);
        result
    }

    async fn execute_inner(
        &self,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<Run, ExecuteError> {
        let mut run = self
            .run_store
            .load_run(run_id)
            .await?
            .ok_or_else(|| ExecuteError::RunNotFound(run_id.to_string()))?;
        if run.state != RunState::Created {
            return Err(ExecuteError::Conflict {
                run_id: run_id.to_string(),
                state: run.state.to_string(),
            });
        }
        let plan = self
            .run_store
            .load_plan(&run.plan_id)
            .await?
            .ok_or_else(|| ExecuteError::PlanNotFound(run.plan_id.clone()))?;
        let mut dag = ExecutionDag::from_plan(&plan).map_err(ExecuteError::InvalidPlan)?;

        let node_keys = self.compute_node_keys(&plan)?;
        for spec in &plan.nodes {
            self.run_store
                .put_node_run(&NodeRun::pending(
                    run_id,
                    &spec.node_id,
                    node_keys[&spec.node_id].clone(),
                ))
                .await?;
        }

        run.state = RunState::Running;
        self.run_store.update_run(&run).await?;
        tracing::info!(run_id = %run_id, plan_id = %run.plan_id, "run execution started");

        // Failures abort in-flight siblings without flipping the external
        // cancel flag; external cancellation trips both.
        let abort = cancel.child_token();
        let mut outputs: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut in_flight = FuturesUnordered::new();
        let mut first_failure: Option<NodeErrorInfo> = None;

        loop {
            if !abort.is_cancelled() {
                while in_flight.len() < self.max_parallel {
                    let Some(node_id) = dag.take_ready() else {
                        break;
                    };
                    let Some(spec) = dag.spec(&node_id).cloned() else {
                        continue;
                    };
                    let upstream: BTreeMap<String, serde_json::Value> = spec
                        .upstream
                        .iter()
                        .filter_map(|up| outputs.get(up).map(|v| (up.clone(), v.clone())))
                        .collect();
                    dag.mark_running(&node_id);
                    in_flight.push(self.run_node(run_id.to_string(), spec, upstream, abort.clone()));
                }
            }

            let Some((node_id, outcome)) = in_flight.next().await else {
                break;
            };
            match outcome {
                NodeOutcome::Succeeded { output } | NodeOutcome::Cached { output } => {
                    outputs.insert(node_id.clone(), output);
                    dag.mark_completed(&node_id);
                }
                NodeOutcome::Failed { info } => {
                    dag.mark_failed(&node_id);
                    if first_failure.is_none() && !cancel.is_cancelled() {
                        first_failure = Some(info);
                    }
                    abort.cancel();
                }
            }
        }

        for node_id in dag.non_terminal_ids() {
            if let Some(mut record) = self.run_store.load_node_run(run_id, &node_id).await? {
                record.skip();
                self.run_store.put_node_run(&record).await?;
            }
            dag.mark_skipped(&node_id);
            self.emit(ExecutionEvent::node(run_id, &node_id, "node_skipped"))
                .await;
        }

        run.finished_at = Some(Utc::now());
        if cancel.is_cancelled() {
            run.state = RunState::Cancelled;
            tracing::info!(run_id = %run_id, "run cancelled");
            self.emit(ExecutionEvent::run(run_id, "run_cancelled")).await;
        } else if let Some(info) = first_failure.or_else(|| {
            dag.any_failed().then(|| NodeErrorInfo {
                kind: "Internal".to_string(),
                message: "node failed without recorded error".to_string(),
                stderr: None,
            })
        }) {
            run.state = RunState::Failed;
            tracing::error!(
                run_id = %run_id,
                kind = %info.kind,
                error = %truncate_for_log(&info.message, MAX_LOG_TEXT_CHARS),
                "run failed"
            );
            run.error = Some(info);
            self.emit(ExecutionEvent::run(run_id, "run_failed")).await;
        } else if dag.all_successful() {
            run.state = RunState::Succeeded;
            run.result = promote_result(&plan, &outputs);
            tracing::info!(run_id = %run_id, "run completed");
            self.emit(ExecutionEvent::run(run_id, "run_completed")).await;
        } else {
            run.state = RunState::Failed;
            run.error = Some(NodeErrorInfo {
                kind: "Internal".to_string(),
                message: "no ready nodes but plan not complete".to_string(),
                stderr: None,
            });
            self.emit(ExecutionEvent::run(run_id, "run_failed")).await;
        }
        self.run_store.update_run(&run).await?;
        Ok(run)
    }

    async fn run_node(
        &self,
        run_id: String,
        spec: NodeSpec,
        upstream: BTreeMap<String, serde_json::Value>,
        abort: CancellationToken,
    ) -> (String, NodeOutcome) {
        let node_id = spec.node_id.clone();
        let outcome = self.run_node_inner(&run_id, &spec, &upstream, &abort).await;
        (node_id, outcome)
    }

    async fn run_node_inner(
        &self,
        run_id: &str,
        spec: &NodeSpec,
        upstream: &BTreeMap<String, serde_json::Value>,
        abort: &CancellationToken,
    ) -> NodeOutcome {
        let mut record = match self.run_store.load_node_run(run_id, &spec.node_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return NodeOutcome::Failed {
                    info: NodeFailure::new(NodeError::Store {
                        message: format!("node run record for '{}' missing", spec.node_id),
                    })
                    .to_info(),
                }
            }
            Err(err) => {
                return NodeOutcome::Failed {
                    info: NodeFailure::new(NodeError::Store {
                        message: err.to_string(),
                    })
                    .to_info(),
                }
            }
        };

        match self.try_cache_hit(run_id, &mut record).await {
            Ok(Some(output)) => {
                tracing::info!(run_id = %run_id, node_id = %spec.node_id, "node served from idempotency cache");
                self.emit(ExecutionEvent::node(run_id, &spec.node_id, "node_cached"))
                    .await;
                return NodeOutcome::Cached { output };
            }
            Ok(None) => {}
            // A flaky cache lookup is not fatal; fall through to dispatch.
            Err(err) => {
                tracing::warn!(run_id = %run_id, node_id = %spec.node_id, error = %err, "idempotency cache lookup failed");
            }
        }

        let attempt_budget = spec.max_retries.saturating_add(1);
        loop {
            if abort.is_cancelled() {
                let info = NodeFailure::new(NodeError::Cancelled).to_info();
                record.fail(info.clone());
                let _ = self.run_store.put_node_run(&record).await;
                return NodeOutcome::Failed { info };
            }

            record.start_attempt();
            if let Err(err) = self.run_store.put_node_run(&record).await {
                return NodeOutcome::Failed {
                    info: NodeFailure::new(NodeError::Store {
                        message: err.to_string(),
                    })
                    .to_info(),
                };
            }
            tracing::info!(
                run_id = %run_id,
                node_id = %spec.node_id,
                name = %spec.name,
                attempt = record.attempts,
                "node dispatch started"
            );
            self.emit(ExecutionEvent::node(run_id, &spec.node_id, "node_started"))
                .await;

            match self.attempt(run_id, spec, upstream, abort).await {
                Ok(output) => {
                    record.succeed(output.clone());
                    if let Err(err) = self.run_store.put_node_run(&record).await {
                        return NodeOutcome::Failed {
                            info: NodeFailure::new(NodeError::Store {
                                message: err.to_string(),
                            })
                            .to_info(),
                        };
                    }
                    tracing::info!(run_id = %run_id, node_id = %spec.node_id, "node succeeded");
                    self.emit(ExecutionEvent::node(run_id, &spec.node_id, "node_completed"))
                        .await;
                    return NodeOutcome::Succeeded { output };
                }
                Err(failure) => {
                    let info = failure.to_info();
                    record.fail(info.clone());
                    let _ = self.run_store.put_node_run(&record).await;

                    let retry_allowed = failure.is_retryable()
                        && record.attempts < attempt_budget
                        && !abort.is_cancelled();
                    if retry_allowed {
                        tracing::warn!(
                            run_id = %run_id,
                            node_id = %spec.node_id,
                            attempt = record.attempts,
                            error = %truncate_for_log(&info.message, MAX_LOG_TEXT_CHARS),
                            "retrying node after retryable error"
                        );
                        self.emit(
                            ExecutionEvent::node(run_id, &spec.node_id, "node_retrying")
                                .with_message(info.message.clone()),
                        )
                        .await;
                        sleep(self.retry_backoff).await;
                        continue;
                    }

                    tracing::error!(
                        run_id = %run_id,
                        node_id = %spec.node_id,
                        kind = %info.kind,
                        error = %truncate_for_log(&info.message, MAX_LOG_TEXT_CHARS),
                        "node failed"
                    );
                    self.emit(
                        ExecutionEvent::node(run_id, &spec.node_id, "node_failed")
                            .with_message(info.message.clone()),
                    )
                    .await;
                    return NodeOutcome::Failed { info };
                }
            }
        }
    }

    async fn attempt(
        &self,
        run_id: &str,
        spec: &NodeSpec,
        upstream: &BTreeMap<String, serde_json::Value>,
        abort: &CancellationToken,
    ) -> Result<serde_json::Value, NodeFailure> {
        let resolver = resolve::Resolver {
            run_id,
            upstream_outputs: upstream,
            artifacts: self.artifact_store.as_ref(),
            inline_artifacts: self.dispatcher.wants_inline(spec),
        };
        let params = resolver.resolve_args(&spec.args).await?;
        let output = self.dispatcher.dispatch(spec, params, abort).await?;
        self.materialize_output(run_id, &spec.node_id, output).await
    }

    /// Persist binary payloads to the artifact store and rewrite the output
    /// to reference them by URI.
    async fn materialize_output(
        &self,
        run_id: &str,
        node_id: &str,
        mut output: serde_json::Value,
    ) -> Result<serde_json::Value, NodeFailure> {
        if let Some(obj) = output.as_object_mut() {
            let encoded = obj
                .get("image_base64")
                .and_then(|v| v.as_str())
                .map(ToString::to_string);
            if let Some(encoded) = encoded {
                let bytes = BASE64.decode(encoded.as_bytes()).map_err(|e| {
                    NodeFailure::new(NodeError::Schema {
                        message: format!("invalid image_base64 payload: {}", e),
                    })
                })?;
                let uri = self
                    .artifact_store
                    .write(run_id, node_id, "output.png", "image/png", bytes)
                    .await
                    .map_err(|e| {
                        NodeFailure::new(NodeError::Store {
                            message: e.to_string(),
                        })
                    })?;
                obj.remove("image_base64");
                obj.insert(
                    "image".to_string(),
                    serde_json::Value::String(uri.to_string()),
                );
            }
        }
        Ok(output)
    }

    /// Reuse a prior succeeded node run with the same idempotency key,
    /// provided its artifacts still resolve. Artifacts are re-materialized
    /// into this run's scope so resolution stays run-local.
    async fn try_cache_hit(
        &self,
        run_id: &str,
        record: &mut NodeRun,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let Some(prior) = self.run_store.find_cached(&record.idempotency_key).await? else {
            return Ok(None);
        };
        let Some(output) = prior.output.clone() else {
            return Ok(None);
        };
        if self
            .copy_artifacts(&prior.run_id, run_id, &output)
            .await
            .is_err()
        {
            return Ok(None);
        }
        record.cache_hit(output.clone());
        self.run_store.put_node_run(record).await?;
        Ok(Some(output))
    }

    async fn copy_artifacts(
        &self,
        source_run_id: &str,
        target_run_id: &str,
        output: &serde_json::Value,
    ) -> Result<(), NodeFailure> {
        let mut uris = Vec::new();
        collect_artifact_strings(output, &mut uris);
        for raw in uris {
            let uri: ArtifactUri = raw.parse().map_err(|_| {
                NodeFailure::new(NodeError::MissingArtifact { uri: raw.clone() })
            })?;
            let stored = self
                .artifact_store
                .read(source_run_id, &uri)
                .await
                .map_err(|_| NodeFailure::new(NodeError::MissingArtifact { uri: raw.clone() }))?;
            if source_run_id != target_run_id {
                self.artifact_store
                    .write(
                        target_run_id,
                        &uri.node_id,
                        &uri.filename,
                        &stored.content_type,
                        stored.bytes,
                    )
                    .await
                    .map_err(|e| {
                        NodeFailure::new(NodeError::Store {
                            message: e.to_string(),
                        })
                    })?;
            }
        }
        Ok(())
    }

    /// Keys chain through placeholders, so a node's key depends on its
    /// upstream keys. Resolution order follows dependency readiness; a plan
    /// that cannot settle (a cycle) is rejected.
    fn compute_node_keys(&self, plan: &Plan) -> Result<BTreeMap<String, String>, ExecuteError> {
        let mut keys: BTreeMap<String, String> = BTreeMap::new();
        let mut remaining: Vec<&NodeSpec> = plan.nodes.iter().collect();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|spec| {
                if spec.upstream.iter().all(|up| keys.contains_key(up)) {
                    let key =
                        idempotency_key(spec, &self.dispatcher.version_tag(spec), &keys);
                    keys.insert(spec.node_id.clone(), key);
                    false
                } else {
                    true
                }
            });
            if remaining.len() == before {
                return Err(ExecuteError::InvalidPlan(
                    "dependency cycle while computing idempotency keys".to_string(),
                ));
            }
        }
        Ok(keys)
    }

    async fn emit(&self, event: ExecutionEvent) {
        if let Some(listener) = &self.listener {
            listener.on_event(event).await;
        }
    }
}

/// The run-level result is the reducer sink's output; a single sink wins
/// when no reducer is present.
fn promote_result(
    plan: &Plan,
    outputs: &BTreeMap<String, serde_json::Value>,
) -> Option<serde_json::Value> {
    let sinks = plan.sink_ids();
    let chosen = sinks
        .iter()
        .find(|id| plan.node(id).is_some_and(|n| n.name == "reducer"))
        .or_else(|| sinks.first())?;
    outputs.get(*chosen).cloned()
}

fn collect_artifact_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) if s.starts_with("artifact://") => out.push(s.clone()),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_artifact_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_artifact_strings(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests;
