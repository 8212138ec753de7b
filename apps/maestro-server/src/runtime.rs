//! Runtime bootstrap: wires the capability index, tool client, stores,
//! router, planner and executor into one serving unit.

use std::sync::Arc;

use thiserror::Error;

use maestro_core::agent::AgentRegistry;
use maestro_core::capability::{CapabilityError, CapabilityIndex};
use maestro_core::executor::{ExecuteError, Executor, NodeDispatcher};
use maestro_core::planner::{PlanError, Planner};
use maestro_core::router::{RouteError, Router};
use maestro_core::store::{ArtifactStore, RunStore, StoreError};
use maestro_core::types::{FlowKind, NodeRun, Plan, Query, Run, RunState};
use maestro_stores::{InMemoryRunStore, LocalArtifactStore};
use maestro_tools::{discover_manifests, StdioToolClient};

use crate::config::ServerConfig;
use crate::metrics::Metrics;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("capability index error: {0}")]
    Capability(#[from] CapabilityError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        ApiError::InvalidArgument(err.to_string())
    }
}

impl From<PlanError> for ApiError {
    fn from(err: PlanError) -> Self {
        ApiError::InvalidArgument(err.to_string())
    }
}

/// Result of routing + planning one query.
#[derive(Debug)]
pub struct RouteOutcome {
    pub run_id: String,
    pub plan_id: String,
    pub flow: FlowKind,
}

/// Current view of one run, for the status endpoint.
pub struct RunView {
    pub run: Run,
    pub nodes: Vec<NodeRun>,
    pub artifacts: Vec<String>,
}

pub struct Runtime {
    router: Router,
    planner: Planner,
    executor: Arc<Executor>,
    run_store: Arc<dyn RunStore>,
    artifact_store: Arc<dyn ArtifactStore>,
    metrics: Arc<Metrics>,
}

impl Runtime {
    /// Build the serving unit from configuration. Tool manifest discovery
    /// runs here; tools that fail it are taken out of rotation without
    /// aborting startup.
    pub async fn from_config(config: &ServerConfig) -> Result<Self, BootstrapError> {
        let index = Arc::new(CapabilityIndex::load(&config.capability_index)?);

        let tool_client = StdioToolClient::new(index.clone());
        let report = discover_manifests(&index).await;
        tool_client.set_unavailable(report.unavailable_set());

        let run_store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let artifact_store: Arc<dyn ArtifactStore> =
            Arc::new(LocalArtifactStore::new(config.artifacts_root.clone()));

        let metrics = Arc::new(Metrics::new());
        let dispatcher = Arc::new(NodeDispatcher::with_process_slots(
            index.clone(),
            Arc::new(tool_client),
            Arc::new(AgentRegistry::with_builtins()),
            config.max_tool_processes,
        ));
        let executor = Arc::new(
            Executor::new(run_store.clone(), artifact_store.clone(), dispatcher)
                .with_max_parallel(config.max_parallel_nodes)
                .with_listener(metrics.clone()),
        );

        Ok(Self {
            router: Router::new(index.clone()),
            planner: Planner::new(index),
            executor,
            run_store,
            artifact_store,
            metrics,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Route a query, materialize its plan, and create (but not start) a
    /// run. Routing and planning failures reach the caller; no run exists
    /// afterwards.
    pub async fn route(&self, query: &Query) -> Result<RouteOutcome, ApiError> {
        let decision = self.router.route_now(query)?;
        let plan = self
            .planner
            .plan(decision.flow, &decision.context, &decision.suggested_tools)?;
        self.run_store.save_plan(&plan).await?;

        let run = Run::new(plan.plan_id.clone());
        self.run_store.create_run(&run).await?;
        tracing::info!(
            run_id = %run.run_id,
            plan_id = %plan.plan_id,
            flow = %plan.flow,
            "run created"
        );
        Ok(RouteOutcome {
            run_id: run.run_id,
            plan_id: plan.plan_id,
            flow: plan.flow,
        })
    }

    /// Kick off execution in the background; completion is observable via
    /// the run view.
    pub async fn start(&self, run_id: &str) -> Result<(), ApiError> {
        let run = self
            .run_store
            .load_run(run_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("run {}", run_id)))?;
        if run.state != RunState::Created {
            return Err(ApiError::Conflict(format!(
                "run {} already started",
                run_id
            )));
        }

        self.metrics
            .runs_started
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let executor = self.executor.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            match executor.execute(&run_id).await {
                Ok(run) => {
                    tracing::info!(run_id = %run_id, state = ?run.state, "run finished");
                }
                Err(ExecuteError::Conflict { .. }) => {
                    tracing::warn!(run_id = %run_id, "run was started twice");
                }
                Err(err) => {
                    tracing::error!(run_id = %run_id, error = %err, "run execution errored");
                }
            }
        });
        Ok(())
    }

    pub async fn cancel(&self, run_id: &str) -> Result<bool, ApiError> {
        if self.run_store.load_run(run_id).await?.is_none() {
            return Err(ApiError::NotFound(format!("run {}", run_id)));
        }
        Ok(self.executor.cancel(run_id).await)
    }

    pub async fn run_view(&self, run_id: &str) -> Result<RunView, ApiError> {
        let run = self
            .run_store
            .load_run(run_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("run {}", run_id)))?;
        let nodes = self.run_store.list_node_runs(run_id).await?;
        let artifacts = self
            .artifact_store
            .list(run_id)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .into_iter()
            .map(|uri| uri.to_string())
            .collect();
        Ok(RunView {
            run,
            nodes,
            artifacts,
        })
    }

    pub async fn load_plan(&self, plan_id: &str) -> Result<Plan, ApiError> {
        self.run_store
            .load_plan(plan_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("plan {}", plan_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObservabilityConfig;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use maestro_core::types::NodeRunState;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    /// An inline one-shot tool server: answers `--manifest`, otherwise
    /// replies with a fixed result under the caller's request id.
    fn tool_script(methods: &[&str], result: &serde_json::Value) -> String {
        let manifest = json!({
            "methods": methods.iter().map(|m| json!({"name": m, "retryable_codes": [503]})).collect::<Vec<_>>(),
        });
        let mut script = String::new();
        script.push_str(&format!(
            r#"if [ "$0" = "--manifest" ]; then printf '%s\n' '{}'; exit 0; fi"#,
            manifest
        ));
        script.push('\n');
        script.push_str("req=$(cat)\n");
        script.push_str(r#"id=$(printf %s "$req" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')"#);
        script.push('\n');
        script.push_str(&format!(
            r#"printf '{{"jsonrpc":"2.0","id":%s,"result":{}}}\n' "$id""#,
            result
        ));
        script.push('\n');
        script
    }

    fn index_entry(script: String, tags: &[&str], keywords: &[&str], methods: &[(&str, &[&str])]) -> serde_json::Value {
        json!({
            "binary_path": "sh",
            "args": ["-c", script],
            "tags": tags,
            "keywords": keywords,
            "methods": methods.iter().map(|(name, required)| json!({
                "name": name,
                "input_schema": {"type": "object", "required": required},
                "output_schema": {"type": "object", "properties": {"table": {}, "data": {}, "record": {}, "image": {}}},
                "retryable_codes": [503],
                "wants_inline": false,
            })).collect::<Vec<_>>(),
            "default_timeout_ms": 5000,
        })
    }

    fn write_index(dir: &Path) -> std::path::PathBuf {
        let table = json!({"table": {"rows": [
            {"week": "2024-W17", "sales": 100},
            {"week": "2024-W18", "sales": 120},
        ]}});
        let image = json!({"image_base64": BASE64.encode(b"png-bytes")});
        let file_data = json!({"data": {
            "filename": "inv.pdf",
            "format": "pdf",
            "bytes_base64": BASE64.encode(b"Invoice INV-42\nFrom: Acme Corp\nTotal: 99.50\n"),
        }});
        let upserted = json!({"record": {"invoice_number": "INV-42"}, "upserted": true});

        let index = json!({
            "sql": index_entry(
                tool_script(&["sql.query"], &table),
                &["data", "query", "sql", "sales"],
                &["sales"],
                &[("sql.query", &["where"][..])],
            ),
            "pandas": index_entry(
                tool_script(&["dataframe.transform"], &table),
                &["transform", "dataframe"],
                &[],
                &[("dataframe.transform", &["table"][..])],
            ),
            "plotly": index_entry(
                tool_script(&["plotly.render"], &image),
                &["plot", "chart", "visualization"],
                &["plot", "chart", "graph"],
                &[("plotly.render", &["data", "spec"][..])],
            ),
            "filesystem": index_entry(
                tool_script(&["file.read"], &file_data),
                &["file", "read", "pdf"],
                &["file", "pdf"],
                &[("file.read", &["path"][..])],
            ),
            "tracking": index_entry(
                tool_script(&["tracking.upsert"], &upserted),
                &["tracking", "update", "invoice"],
                &["invoice", "tracking"],
                &[("tracking.upsert", &["record"][..])],
            ),
        });

        let path = dir.join("capability_index.json");
        std::fs::write(&path, serde_json::to_string_pretty(&index).unwrap()).unwrap();
        path
    }

    async fn runtime(dir: &TempDir) -> Arc<Runtime> {
        let config = ServerConfig {
            capability_index: write_index(dir.path()),
            artifacts_root: dir.path().join("artifacts"),
            max_parallel_nodes: 4,
            max_tool_processes: 16,
            observability: ObservabilityConfig::default(),
        };
        Arc::new(Runtime::from_config(&config).await.unwrap())
    }

    async fn await_terminal(runtime: &Runtime, run_id: &str) -> RunView {
        for _ in 0..250 {
            let view = runtime.run_view(run_id).await.unwrap();
            if view.run.state.is_terminal() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run {} never reached a terminal state", run_id);
    }

    #[tokio::test]
    async fn test_plot_query_end_to_end_with_real_tool_processes() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        let outcome = runtime
            .route(&Query::new("Plot sales for the last 4 weeks"))
            .await
            .unwrap();
        assert_eq!(outcome.flow, FlowKind::Plot);

        runtime.start(&outcome.run_id).await.unwrap();
        let view = await_terminal(&runtime, &outcome.run_id).await;

        assert_eq!(view.run.state, RunState::Succeeded);
        assert!(view
            .artifacts
            .contains(&"artifact://plotly_render/output.png".to_string()));
        let result = view.run.result.unwrap();
        assert_eq!(result["kind"], "plot");

        let snapshot = runtime.metrics().snapshot();
        assert_eq!(snapshot["runs"]["started"], 1);
        assert_eq!(snapshot["runs"]["succeeded"], 1);
    }

    #[tokio::test]
    async fn test_pdf_query_end_to_end() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        let outcome = runtime
            .route(&Query::with_file("Extract this invoice", "/p/inv.pdf"))
            .await
            .unwrap();
        assert_eq!(outcome.flow, FlowKind::PdfTracking);

        runtime.start(&outcome.run_id).await.unwrap();
        let view = await_terminal(&runtime, &outcome.run_id).await;
        assert_eq!(view.run.state, RunState::Succeeded);

        let extraction = view
            .nodes
            .iter()
            .find(|n| n.node_id == "extraction_agent")
            .unwrap();
        assert_eq!(extraction.state, NodeRunState::Succeeded);
        let record = &extraction.output.as_ref().unwrap()["record"];
        assert_eq!(record["invoice_number"], "INV-42");
    }

    #[tokio::test]
    async fn test_ambiguous_query_creates_no_run() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        let err = runtime
            .route(&Query::new("hum a little tune"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_start_conflicts_and_missing_runs() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        assert!(matches!(
            runtime.start("run_missing").await,
            Err(ApiError::NotFound(_))
        ));

        let outcome = runtime
            .route(&Query::new("Plot sales for the last 4 weeks"))
            .await
            .unwrap();
        runtime.start(&outcome.run_id).await.unwrap();
        await_terminal(&runtime, &outcome.run_id).await;
        assert!(matches!(
            runtime.start(&outcome.run_id).await,
            Err(ApiError::Conflict(_))
        ));
    }
}
