//! # Maestro Core
//!
//! Core abstractions and deterministic logic for the maestro orchestrator.
//!
//! This crate contains:
//! - Query / Context / Plan / Run / NodeRun definitions
//! - Capability index, router, planner
//! - Agent registry and built-in agents
//! - DAG execution with caching, retries and cancellation
//! - Run/node store and artifact store contracts
//!
//! This crate does NOT care about:
//! - How requests arrive (HTTP surface lives in `maestro-server`)
//! - How tool processes are spoken to (transport lives in `maestro-tools`)
//! - Where state is persisted (implementations live in `maestro-stores`)

pub mod agent;
pub mod capability;
pub mod error;
pub mod executor;
pub mod planner;
pub mod router;
pub mod store;
pub mod types;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::agent::{Agent, AgentError, AgentRegistry};
    pub use crate::capability::{CapabilityIndex, CapabilityMatch, MethodSpec, ToolEntry};
    pub use crate::error::{NodeError, NodeFailure};
    pub use crate::executor::{
        ExecuteError, ExecutionEvent, ExecutionListener, Executor, NodeDispatcher,
        ToolInvocation, ToolInvoker,
    };
    pub use crate::planner::{PlanError, Planner};
    pub use crate::router::{RouteDecision, RouteError, Router};
    pub use crate::store::{
        ArtifactIoError, ArtifactStore, ArtifactUri, RunStore, StoreError, StoredArtifact,
    };
    pub use crate::types::{
        Context, FlowKind, IsoWeek, NodeKind, NodeRun, NodeRunState, NodeSpec, Plan, Query, Run,
        RunState, Value,
    };
}

// Re-export key types at crate root
pub use agent::{Agent, AgentRegistry};
pub use capability::CapabilityIndex;
pub use error::{NodeError, NodeFailure};
pub use executor::{Executor, NodeDispatcher, ToolInvoker};
pub use planner::Planner;
pub use router::Router;
pub use store::{ArtifactStore, ArtifactUri, RunStore, StoreError};
pub use types::{Context, FlowKind, NodeSpec, Plan, Query, Run};
