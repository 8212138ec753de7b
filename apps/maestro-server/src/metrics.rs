//! Monotonic runtime counters, surfaced at `/v1/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::json;

use maestro_core::executor::{ExecutionEvent, ExecutionListener};

#[derive(Default)]
pub struct Metrics {
    pub runs_started: AtomicU64,
    pub runs_succeeded: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_cancelled: AtomicU64,
    pub nodes_executed: AtomicU64,
    pub nodes_cached: AtomicU64,
    pub nodes_failed: AtomicU64,
    pub nodes_skipped: AtomicU64,
    pub node_retries: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "runs": {
                "started": self.runs_started.load(Ordering::Relaxed),
                "succeeded": self.runs_succeeded.load(Ordering::Relaxed),
                "failed": self.runs_failed.load(Ordering::Relaxed),
                "cancelled": self.runs_cancelled.load(Ordering::Relaxed),
            },
            "nodes": {
                "executed": self.nodes_executed.load(Ordering::Relaxed),
                "cached": self.nodes_cached.load(Ordering::Relaxed),
                "failed": self.nodes_failed.load(Ordering::Relaxed),
                "skipped": self.nodes_skipped.load(Ordering::Relaxed),
                "retries": self.node_retries.load(Ordering::Relaxed),
            },
        })
    }
}

#[async_trait]
impl ExecutionListener for Metrics {
    async fn on_event(&self, event: ExecutionEvent) {
        let counter = match event.phase.as_str() {
            "node_completed" => &self.nodes_executed,
            "node_cached" => &self.nodes_cached,
            "node_failed" => &self.nodes_failed,
            "node_skipped" => &self.nodes_skipped,
            "node_retrying" => &self.node_retries,
            "run_completed" => &self.runs_succeeded,
            "run_failed" => &self.runs_failed,
            "run_cancelled" => &self.runs_cancelled,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
