//! Run/node persistence contract.

use async_trait::async_trait;

use crate::types::{NodeRun, Plan, Run};

use super::StoreError;

/// Durable key-value state for plans, runs and node runs.
///
/// Plans are immutable once stored. Runs are keyed by `run_id`, node runs by
/// `(run_id, node_id)`. The idempotency cache is derived state over node
/// runs: `find_cached` returns the most recent succeeded node run carrying a
/// given key, regardless of which run produced it.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_plan(&self, plan: &Plan) -> Result<(), StoreError>;

    async fn load_plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError>;

    async fn create_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>, StoreError>;

    /// Persist the full run record; transitions only move forward.
    async fn update_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Insert or replace a node run record.
    async fn put_node_run(&self, node_run: &NodeRun) -> Result<(), StoreError>;

    async fn load_node_run(
        &self,
        run_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeRun>, StoreError>;

    /// All node runs of a run, in insertion order.
    async fn list_node_runs(&self, run_id: &str) -> Result<Vec<NodeRun>, StoreError>;

    /// Most recent succeeded node run with this idempotency key, across
    /// runs.
    async fn find_cached(&self, idempotency_key: &str) -> Result<Option<NodeRun>, StoreError>;
}
