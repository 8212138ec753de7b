use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use serde_json::json;

use super::*;
use crate::agent::AgentRegistry;
use crate::capability::test_fixtures::sample_index;
use crate::planner::Planner;
use crate::store::{ArtifactIoError, StoredArtifact};
use crate::types::{Context, FlowKind, IsoWeek, NodeRunState, Value};

// ---- in-memory fixtures ------------------------------------------------

#[derive(Default)]
struct MemoryRunStore {
    plans: StdMutex<HashMap<String, Plan>>,
    runs: StdMutex<HashMap<String, Run>>,
    node_runs: StdMutex<Vec<NodeRun>>,
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        self.plans
            .lock()
            .unwrap()
            .insert(plan.plan_id.clone(), plan.clone());
        Ok(())
    }

    async fn load_plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError> {
        Ok(self.plans.lock().unwrap().get(plan_id).cloned())
    }

    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        self.runs
            .lock()
            .unwrap()
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self.runs.lock().unwrap().get(run_id).cloned())
    }

    async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        self.runs
            .lock()
            .unwrap()
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn put_node_run(&self, node_run: &NodeRun) -> Result<(), StoreError> {
        let mut node_runs = self.node_runs.lock().unwrap();
        if let Some(existing) = node_runs
            .iter_mut()
            .find(|n| n.run_id == node_run.run_id && n.node_id == node_run.node_id)
        {
            *existing = node_run.clone();
        } else {
            node_runs.push(node_run.clone());
        }
        Ok(())
    }

    async fn load_node_run(
        &self,
        run_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeRun>, StoreError> {
        Ok(self
            .node_runs
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.run_id == run_id && n.node_id == node_id)
            .cloned())
    }

    async fn list_node_runs(&self, run_id: &str) -> Result<Vec<NodeRun>, StoreError> {
        Ok(self
            .node_runs
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn find_cached(&self, idempotency_key: &str) -> Result<Option<NodeRun>, StoreError> {
        Ok(self
            .node_runs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|n| n.idempotency_key == idempotency_key && n.state == NodeRunState::Succeeded)
            .cloned())
    }
}

#[derive(Default)]
struct MemoryArtifacts {
    blobs: StdMutex<HashMap<(String, String), StoredArtifact>>,
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn write(
        &self,
        run_id: &str,
        node_id: &str,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactUri, ArtifactIoError> {
        let uri = ArtifactUri::new(node_id, filename);
        self.blobs.lock().unwrap().insert(
            (run_id.to_string(), uri.to_string()),
            StoredArtifact {
                uri: uri.clone(),
                content_type: content_type.to_string(),
                bytes,
            },
        );
        Ok(uri)
    }

    async fn read(&self, run_id: &str, uri: &ArtifactUri) -> Result<StoredArtifact, ArtifactIoError> {
        self.blobs
            .lock()
            .unwrap()
            .get(&(run_id.to_string(), uri.to_string()))
            .cloned()
            .ok_or_else(|| ArtifactIoError::NotFound(uri.to_string()))
    }

    async fn exists(&self, run_id: &str, uri: &ArtifactUri) -> Result<bool, ArtifactIoError> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .contains_key(&(run_id.to_string(), uri.to_string())))
    }

    async fn list(&self, run_id: &str) -> Result<Vec<ArtifactUri>, ArtifactIoError> {
        let mut uris: Vec<ArtifactUri> = self
            .blobs
            .lock()
            .unwrap()
            .iter()
            .filter(|((rid, _), _)| rid == run_id)
            .map(|(_, stored)| stored.uri.clone())
            .collect();
        uris.sort_by_key(|u| u.to_string());
        Ok(uris)
    }
}

/// Scripted transport: per-method response queues, falling back to `{}`.
#[derive(Default)]
struct ScriptedInvoker {
    scripts: StdMutex<HashMap<String, VecDeque<Result<serde_json::Value, NodeError>>>>,
    dispatches: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedInvoker {
    fn script(self, method: &str, responses: Vec<Result<serde_json::Value, NodeError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(method.to_string(), responses.into());
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn dispatch_count(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(&self, invocation: ToolInvocation) -> Result<serde_json::Value, NodeFailure> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = invocation.cancel.cancelled() => {
                    return Err(NodeFailure::new(NodeError::Cancelled));
                }
                _ = sleep(delay) => {}
            }
        }
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&invocation.method)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Ok(value)) => Ok(value),
            Some(Err(error)) => Err(NodeFailure::with_stderr(
                error,
                Some("stub tool stderr".to_string()),
            )),
            None => Ok(json!({})),
        }
    }
}

struct Harness {
    executor: Arc<Executor>,
    run_store: Arc<MemoryRunStore>,
    artifacts: Arc<MemoryArtifacts>,
    invoker: Arc<ScriptedInvoker>,
}

impl Harness {
    fn new(invoker: ScriptedInvoker) -> Self {
        let run_store = Arc::new(MemoryRunStore::default());
        let artifacts = Arc::new(MemoryArtifacts::default());
        let invoker = Arc::new(invoker);
        let dispatcher = Arc::new(NodeDispatcher::new(
            Arc::new(sample_index()),
            invoker.clone(),
            Arc::new(AgentRegistry::with_builtins()),
        ));
        let executor = Arc::new(
            Executor::new(run_store.clone(), artifacts.clone(), dispatcher)
                .with_retry_backoff(Duration::from_millis(1)),
        );
        Self {
            executor,
            run_store,
            artifacts,
            invoker,
        }
    }

    async fn create_run(&self, plan: &Plan) -> String {
        self.run_store.save_plan(plan).await.unwrap();
        let run = Run::new(plan.plan_id.clone());
        let run_id = run.run_id.clone();
        self.run_store.create_run(&run).await.unwrap();
        run_id
    }

    async fn node_run(&self, run_id: &str, node_id: &str) -> NodeRun {
        self.run_store
            .load_node_run(run_id, node_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("node run {} missing", node_id))
    }
}

fn plot_plan() -> Plan {
    let planner = Planner::new(Arc::new(sample_index()));
    let context = Context {
        outlet_id: Some(42),
        week_count: Some(4),
        week_range: Some((IsoWeek::new(2024, 17), IsoWeek::new(2024, 20))),
        ..Context::default()
    };
    planner.plan(FlowKind::Plot, &context, &[]).unwrap()
}

fn pdf_plan() -> Plan {
    let planner = Planner::new(Arc::new(sample_index()));
    let context = Context {
        file_path: Some("/p/inv.pdf".to_string()),
        ..Context::default()
    };
    planner.plan(FlowKind::PdfTracking, &context, &[]).unwrap()
}

fn sales_table() -> serde_json::Value {
    json!({"table": {"rows": [
        {"week": "2024-W17", "sales": 100},
        {"week": "2024-W18", "sales": 120},
        {"week": "2024-W19", "sales": 90},
        {"week": "2024-W20", "sales": 140},
    ]}})
}

fn plot_scripts() -> ScriptedInvoker {
    ScriptedInvoker::default()
        .script("sql.query", vec![Ok(sales_table())])
        .script("dataframe.transform", vec![Ok(sales_table())])
        .script(
            "plotly.render",
            vec![Ok(json!({"image_base64": BASE64.encode(b"png-bytes")}))],
        )
}

// ---- scenarios ---------------------------------------------------------

#[test]
fn test_plot_plan_executes_to_success_with_png_artifact() {
    tokio_test::block_on(async {
        let harness = Harness::new(plot_scripts());
        let plan = plot_plan();
        let run_id = harness.create_run(&plan).await;

        let run = harness.executor.execute(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);

        for node_id in ["sql", "pandas_transform", "viz_spec", "plotly_render", "validator", "reducer"] {
            let record = harness.node_run(&run_id, node_id).await;
            assert_eq!(record.state, NodeRunState::Succeeded, "node {}", node_id);
            assert_eq!(record.attempts, 1, "node {}", node_id);
        }

        let render = harness.node_run(&run_id, "plotly_render").await;
        let image = render.output.unwrap()["image"].as_str().unwrap().to_string();
        assert_eq!(image, "artifact://plotly_render/output.png");

        let artifacts = harness.artifacts.list(&run_id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].to_string(), image);

        let result = run.result.unwrap();
        assert_eq!(result["kind"], "plot");
        assert_eq!(result["status"], "completed");
        assert_eq!(result["artifacts"], json!([image]));
        assert_eq!(result["valid"], true);

        assert_eq!(harness.invoker.dispatch_count(), 3);
    });
}

#[test]
fn test_pdf_plan_upserts_extracted_record() {
    tokio_test::block_on(async {
        let text = "Invoice INV-42\nFrom: Acme Corp\nTotal: 99.50\n";
        let invoker = ScriptedInvoker::default()
            .script(
                "file.read",
                vec![Ok(json!({"data": {
                    "filename": "inv.pdf",
                    "format": "pdf",
                    "bytes_base64": BASE64.encode(text.as_bytes()),
                }}))],
            )
            .script(
                "tracking.upsert",
                vec![Ok(json!({"record": {"invoice_number": "INV-42"}, "upserted": true}))],
            );
        let harness = Harness::new(invoker);
        let run_id = harness.create_run(&pdf_plan()).await;

        let run = harness.executor.execute(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);

        let extraction = harness.node_run(&run_id, "extraction_agent").await;
        let record = &extraction.output.unwrap()["record"];
        assert_eq!(record["invoice_number"], "INV-42");
        assert_eq!(record["vendor"], "Acme Corp");

        let result = run.result.unwrap();
        assert_eq!(result["kind"], "file_update");
        assert_eq!(result["valid"], true);
    });
}

#[test]
fn test_retryable_tool_error_retries_once_then_succeeds() {
    tokio_test::block_on(async {
        let invoker = plot_scripts().script(
            "sql.query",
            vec![
                Err(NodeError::Tool {
                    code: 503,
                    message: "busy".to_string(),
                    retryable: true,
                }),
                Ok(sales_table()),
            ],
        );
        let harness = Harness::new(invoker);
        let run_id = harness.create_run(&plot_plan()).await;

        let run = harness.executor.execute(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);

        let sql = harness.node_run(&run_id, "sql").await;
        assert_eq!(sql.attempts, 2);
        assert_eq!(sql.state, NodeRunState::Succeeded);
    });
}

#[test]
fn test_retry_budget_exhaustion_fails_run_and_skips_downstream() {
    tokio_test::block_on(async {
        let failure = || NodeError::Tool {
            code: 503,
            message: "busy".to_string(),
            retryable: true,
        };
        let invoker =
            ScriptedInvoker::default().script("sql.query", vec![Err(failure()), Err(failure())]);
        let harness = Harness::new(invoker);
        let run_id = harness.create_run(&plot_plan()).await;

        let run = harness.executor.execute(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        let error = run.error.unwrap();
        assert_eq!(error.kind, "ToolError");
        assert_eq!(error.stderr.as_deref(), Some("stub tool stderr"));

        let sql = harness.node_run(&run_id, "sql").await;
        assert_eq!(sql.state, NodeRunState::Failed);
        assert_eq!(sql.attempts, 2);

        for node_id in ["pandas_transform", "viz_spec", "plotly_render", "validator", "reducer"] {
            let record = harness.node_run(&run_id, node_id).await;
            assert_eq!(record.state, NodeRunState::Skipped, "node {}", node_id);
            assert_eq!(record.attempts, 0, "node {}", node_id);
        }

        // Only the two sql attempts reached the transport.
        assert_eq!(harness.invoker.dispatch_count(), 2);
    });
}

#[test]
fn test_fatal_tool_error_is_not_retried() {
    tokio_test::block_on(async {
        let invoker = ScriptedInvoker::default().script(
            "sql.query",
            vec![Err(NodeError::Tool {
                code: 400,
                message: "bad where clause".to_string(),
                retryable: false,
            })],
        );
        let harness = Harness::new(invoker);
        let run_id = harness.create_run(&plot_plan()).await;

        let run = harness.executor.execute(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        let sql = harness.node_run(&run_id, "sql").await;
        assert_eq!(sql.attempts, 1);
        assert_eq!(harness.invoker.dispatch_count(), 1);
    });
}

#[test]
fn test_warm_cache_rerun_spawns_no_tools_and_matches_outputs() {
    tokio_test::block_on(async {
        let harness = Harness::new(plot_scripts());
        let plan = plot_plan();

        let first_run_id = harness.create_run(&plan).await;
        let first = harness.executor.execute(&first_run_id).await.unwrap();
        assert_eq!(first.state, RunState::Succeeded);
        let dispatches_after_first = harness.invoker.dispatch_count();

        let second_run_id = harness.create_run(&plan).await;
        let second = harness.executor.execute(&second_run_id).await.unwrap();
        assert_eq!(second.state, RunState::Succeeded);

        // Zero tool dispatches on the warm path.
        assert_eq!(harness.invoker.dispatch_count(), dispatches_after_first);

        for record in harness.run_store.list_node_runs(&second_run_id).await.unwrap() {
            assert_eq!(record.state, NodeRunState::Cached, "node {}", record.node_id);
        }

        // Outputs are identical, and the artifact was re-materialized into
        // the second run's scope.
        assert_eq!(first.result, second.result);
        let uri: ArtifactUri = "artifact://plotly_render/output.png".parse().unwrap();
        assert!(harness.artifacts.exists(&second_run_id, &uri).await.unwrap());
    });
}

#[test]
fn test_changed_args_miss_the_cache() {
    tokio_test::block_on(async {
        let harness = Harness::new(plot_scripts());
        let first = plot_plan();
        let first_run = harness.create_run(&first).await;
        harness.executor.execute(&first_run).await.unwrap();
        let baseline = harness.invoker.dispatch_count();

        let planner = Planner::new(Arc::new(sample_index()));
        let other_context = Context {
            outlet_id: Some(7),
            ..Context::default()
        };
        let second = planner.plan(FlowKind::Plot, &other_context, &[]).unwrap();
        {
            let mut scripts = harness.invoker.scripts.lock().unwrap();
            scripts.insert("sql.query".to_string(), VecDeque::from([Ok(sales_table())]));
            scripts.insert(
                "dataframe.transform".to_string(),
                VecDeque::from([Ok(sales_table())]),
            );
            scripts.insert(
                "plotly.render".to_string(),
                VecDeque::from([Ok(json!({"image_base64": BASE64.encode(b"png-bytes")}))]),
            );
        }
        let second_run = harness.create_run(&second).await;
        let run = harness.executor.execute(&second_run).await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);

        // The changed where-clause invalidates the sql key, and the key
        // chain invalidates every consumer downstream of it.
        let sql = harness.node_run(&second_run, "sql").await;
        assert_eq!(sql.state, NodeRunState::Succeeded);
        let transform = harness.node_run(&second_run, "pandas_transform").await;
        assert_eq!(transform.state, NodeRunState::Succeeded);
        assert_eq!(harness.invoker.dispatch_count(), baseline + 3);
    });
}

#[test]
fn test_cancellation_reaps_inflight_and_skips_downstream() {
    tokio_test::block_on(async {
        let invoker = plot_scripts().with_delay(Duration::from_secs(5));
        let harness = Harness::new(invoker);
        let run_id = harness.create_run(&plot_plan()).await;

        let executor = harness.executor.clone();
        let task_run_id = run_id.clone();
        let handle = tokio::spawn(async move { executor.execute(&task_run_id).await });

        sleep(Duration::from_millis(50)).await;
        assert!(harness.executor.cancel(&run_id).await);

        let run = handle.await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Cancelled);

        let sql = harness.node_run(&run_id, "sql").await;
        assert_eq!(sql.state, NodeRunState::Failed);
        assert_eq!(sql.error.unwrap().kind, "Cancelled");

        for node_id in ["pandas_transform", "viz_spec", "plotly_render", "validator", "reducer"] {
            let record = harness.node_run(&run_id, node_id).await;
            assert_eq!(record.state, NodeRunState::Skipped, "node {}", node_id);
        }

        // The in-flight call never counted as a completed dispatch.
        assert_eq!(harness.invoker.dispatch_count(), 0);
    });
}

#[test]
fn test_dangling_artifact_reference_fails_consumer() {
    tokio_test::block_on(async {
        let plan = Plan::new(
            FlowKind::Dynamic,
            vec![NodeSpec::tool("tfm", "dataframe.transform")
                .with_arg("table", Value::artifact("ghost", "table.json"))],
        );
        let harness = Harness::new(ScriptedInvoker::default());
        let run_id = harness.create_run(&plan).await;

        let run = harness.executor.execute(&run_id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.error.unwrap().kind, "MissingArtifact");
    });
}

#[test]
fn test_execute_conflicts_on_non_created_run() {
    tokio_test::block_on(async {
        let harness = Harness::new(plot_scripts());
        let run_id = harness.create_run(&plot_plan()).await;
        harness.executor.execute(&run_id).await.unwrap();

        let err = harness.executor.execute(&run_id).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Conflict { .. }));
    });
}

#[test]
fn test_attempts_never_exceed_budget() {
    tokio_test::block_on(async {
        let failure = || NodeError::Tool {
            code: 503,
            message: "busy".to_string(),
            retryable: true,
        };
        // More failures queued than the budget allows.
        let invoker = ScriptedInvoker::default().script(
            "sql.query",
            vec![Err(failure()), Err(failure()), Err(failure()), Err(failure())],
        );
        let harness = Harness::new(invoker);
        let run_id = harness.create_run(&plot_plan()).await;
        harness.executor.execute(&run_id).await.unwrap();

        for record in harness.run_store.list_node_runs(&run_id).await.unwrap() {
            let spec_budget = plot_plan()
                .node(&record.node_id)
                .map(|n| n.max_retries + 1)
                .unwrap_or(2);
            assert!(record.attempts <= spec_budget, "node {}", record.node_id);
        }
    });
}
