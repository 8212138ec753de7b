//! RunStore in-memory implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;

use maestro_core::store::{RunStore, StoreError};
use maestro_core::types::{NodeRun, NodeRunState, Plan, Run};

const DEFAULT_IN_MEMORY_RUN_LIMIT: usize = 5_000;

/// In-memory implementation for development and testing.
///
/// Runs are capped; evicting a run drops its node runs with it. Plans are
/// immutable and shared across runs, so they are never evicted.
pub struct InMemoryRunStore {
    plans: RwLock<HashMap<String, Plan>>,
    runs: RwLock<HashMap<String, Run>>,
    node_runs: RwLock<Vec<NodeRun>>,
    order: RwLock<VecDeque<String>>,
    max_runs: usize,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::with_max_runs(DEFAULT_IN_MEMORY_RUN_LIMIT)
    }

    pub fn with_max_runs(max_runs: usize) -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            node_runs: RwLock::new(Vec::new()),
            order: RwLock::new(VecDeque::new()),
            max_runs: max_runs.max(1),
        }
    }

    fn lock_err(err: impl std::fmt::Display) -> StoreError {
        StoreError::Internal(err.to_string())
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        let mut plans = self.plans.write().map_err(Self::lock_err)?;
        plans.insert(plan.plan_id.clone(), plan.clone());
        Ok(())
    }

    async fn load_plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError> {
        let plans = self.plans.read().map_err(Self::lock_err)?;
        Ok(plans.get(plan_id).cloned())
    }

    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut runs = self.runs.write().map_err(Self::lock_err)?;
        let mut order = self.order.write().map_err(Self::lock_err)?;
        if runs.contains_key(&run.run_id) {
            return Err(StoreError::Conflict(format!(
                "run {} already exists",
                run.run_id
            )));
        }

        if runs.len() >= self.max_runs {
            if let Some(oldest) = order.pop_front() {
                runs.remove(&oldest);
                let mut node_runs = self.node_runs.write().map_err(Self::lock_err)?;
                node_runs.retain(|n| n.run_id != oldest);
            }
        }
        runs.insert(run.run_id.clone(), run.clone());
        order.push_back(run.run_id.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let runs = self.runs.read().map_err(Self::lock_err)?;
        Ok(runs.get(run_id).cloned())
    }

    async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut runs = self.runs.write().map_err(Self::lock_err)?;
        if !runs.contains_key(&run.run_id) {
            return Err(StoreError::NotFound(run.run_id.clone()));
        }
        runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn put_node_run(&self, node_run: &NodeRun) -> Result<(), StoreError> {
        let mut node_runs = self.node_runs.write().map_err(Self::lock_err)?;
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
        let node_runs = self.node_runs.read().map_err(Self::lock_err)?;
        Ok(node_runs
            .iter()
            .find(|n| n.run_id == run_id && n.node_id == node_id)
            .cloned())
    }

    async fn list_node_runs(&self, run_id: &str) -> Result<Vec<NodeRun>, StoreError> {
        let node_runs = self.node_runs.read().map_err(Self::lock_err)?;
        Ok(node_runs
            .iter()
            .filter(|n| n.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn find_cached(&self, idempotency_key: &str) -> Result<Option<NodeRun>, StoreError> {
        let node_runs = self.node_runs.read().map_err(Self::lock_err)?;
        Ok(node_runs
            .iter()
            .rev()
            .find(|n| n.idempotency_key == idempotency_key && n.state == NodeRunState::Succeeded)
            .cloned())
    }
}
