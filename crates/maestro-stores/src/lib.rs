//! # Maestro Stores
//!
//! Minimal store implementations for the maestro runtime:
//! - in-memory run/node store
//! - local-filesystem and in-memory artifact stores

mod artifact_store;
mod run_store;

pub use artifact_store::{InMemoryArtifactStore, LocalArtifactStore};
pub use run_store::InMemoryRunStore;

// Re-export core contracts for convenience
pub use maestro_core::store::{
    ArtifactIoError, ArtifactStore, ArtifactUri, RunStore, StoreError, StoredArtifact,
};
