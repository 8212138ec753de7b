//! Artifact storage contract.
//!
//! Artifacts are immutable byte blobs produced by nodes, addressed by
//! `(run_id, node_id, filename)` and referenced through run-scoped
//! `artifact://{node_id}/{filename}` URIs. An artifact lives at least as
//! long as its run.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactIoError {
    #[error("invalid artifact uri: {0}")]
    InvalidUri(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ArtifactIoError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Run-scoped artifact address, `artifact://{node_id}/{filename}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactUri {
    pub node_id: String,
    pub filename: String,
}

impl ArtifactUri {
    pub fn new(node_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            filename: filename.into(),
        }
    }
}

impl fmt::Display for ArtifactUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "artifact://{}/{}", self.node_id, self.filename)
    }
}

impl FromStr for ArtifactUri {
    type Err = ArtifactIoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("artifact://")
            .ok_or_else(|| ArtifactIoError::InvalidUri(s.to_string()))?;
        let (node_id, filename) = rest
            .split_once('/')
            .ok_or_else(|| ArtifactIoError::InvalidUri(s.to_string()))?;
        if node_id.is_empty() || filename.is_empty() {
            return Err(ArtifactIoError::InvalidUri(s.to_string()));
        }
        Ok(Self::new(node_id, filename))
    }
}

impl Serialize for ArtifactUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtifactUri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Stored artifact payload.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub uri: ArtifactUri,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Content-addressed blob storage, resolution scoped by run.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write bytes and return the run-scoped URI.
    async fn write(
        &self,
        run_id: &str,
        node_id: &str,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactUri, ArtifactIoError>;

    /// Resolve a URI back to bytes within the given run.
    async fn read(&self, run_id: &str, uri: &ArtifactUri) -> Result<StoredArtifact, ArtifactIoError>;

    async fn exists(&self, run_id: &str, uri: &ArtifactUri) -> Result<bool, ArtifactIoError>;

    /// All artifact URIs a run has produced, sorted.
    async fn list(&self, run_id: &str) -> Result<Vec<ArtifactUri>, ArtifactIoError>;
}
