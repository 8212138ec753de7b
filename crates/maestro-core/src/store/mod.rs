//! Storage contracts
//!
//! The run/node store is the single source of truth for state transitions;
//! the artifact store is content-addressed blob storage scoped to a run.
//! Implementations live in the `maestro-stores` crate.

mod artifact;
mod run_store;

pub use artifact::{ArtifactIoError, ArtifactStore, ArtifactUri, StoredArtifact};
pub use run_store::RunStore;

use thiserror::Error;

/// Run/node store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}
