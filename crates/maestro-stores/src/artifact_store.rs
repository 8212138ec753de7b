//! Artifact store implementations.
//!
//! The local store lays blobs out as `{root}/{run_id}/{node_id}/{filename}`.
//! Content types are derived from the file extension, the way the artifact
//! tree is meant to be browsable without a metadata catalog.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::fs;

use maestro_core::store::{ArtifactIoError, ArtifactStore, ArtifactUri, StoredArtifact};

fn content_type_for(filename: &str) -> &'static str {
    match Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
    {
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("pdf") => "application/pdf",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Reject path segments that could escape the artifact root.
fn checked_relative(path: &str) -> Result<PathBuf, ArtifactIoError> {
    let rel = PathBuf::from(path);
    let safe = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if path.is_empty() || !safe {
        return Err(ArtifactIoError::InvalidUri(path.to_string()));
    }
    Ok(rel)
}

/// Filesystem-backed artifact store rooted at a single directory.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(
        &self,
        run_id: &str,
        node_id: &str,
        filename: &str,
    ) -> Result<PathBuf, ArtifactIoError> {
        let mut path = self.root.clone();
        path.push(checked_relative(run_id)?);
        path.push(checked_relative(node_id)?);
        path.push(checked_relative(filename)?);
        Ok(path)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn write(
        &self,
        run_id: &str,
        node_id: &str,
        filename: &str,
        _content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactUri, ArtifactIoError> {
        let path = self.blob_path(run_id, node_id, filename)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        tracing::debug!(run_id = %run_id, node_id = %node_id, filename = %filename, "artifact written");
        Ok(ArtifactUri::new(node_id, filename))
    }

    async fn read(&self, run_id: &str, uri: &ArtifactUri) -> Result<StoredArtifact, ArtifactIoError> {
        let path = self.blob_path(run_id, &uri.node_id, &uri.filename)?;
        let bytes = fs::read(&path)
            .await
            .map_err(|_| ArtifactIoError::NotFound(uri.to_string()))?;
        Ok(StoredArtifact {
            uri: uri.clone(),
            content_type: content_type_for(&uri.filename).to_string(),
            bytes,
        })
    }

    async fn exists(&self, run_id: &str, uri: &ArtifactUri) -> Result<bool, ArtifactIoError> {
        let path = self.blob_path(run_id, &uri.node_id, &uri.filename)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn list(&self, run_id: &str) -> Result<Vec<ArtifactUri>, ArtifactIoError> {
        let mut run_dir = self.root.clone();
        run_dir.push(checked_relative(run_id)?);
        if !fs::try_exists(&run_dir).await? {
            return Ok(Vec::new());
        }

        let mut uris = Vec::new();
        let mut nodes = fs::read_dir(&run_dir).await?;
        while let Some(node_entry) = nodes.next_entry().await? {
            if !node_entry.file_type().await?.is_dir() {
                continue;
            }
            let node_id = node_entry.file_name().to_string_lossy().into_owned();
            let mut stack = vec![(node_entry.path(), String::new())];
            while let Some((dir, prefix)) = stack.pop() {
                let mut files = fs::read_dir(&dir).await?;
                while let Some(entry) = files.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let rel = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{}/{}", prefix, name)
                    };
                    if entry.file_type().await?.is_dir() {
                        stack.push((entry.path(), rel));
                    } else {
                        uris.push(ArtifactUri::new(node_id.clone(), rel));
                    }
                }
            }
        }
        uris.sort_by_key(|u| u.to_string());
        Ok(uris)
    }
}

/// In-memory artifact store for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    blobs: RwLock<HashMap<(String, String), StoredArtifact>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err(err: impl std::fmt::Display) -> ArtifactIoError {
        ArtifactIoError::Io(err.to_string())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn write(
        &self,
        run_id: &str,
        node_id: &str,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactUri, ArtifactIoError> {
        let uri = ArtifactUri::new(node_id, filename);
        let mut blobs = self.blobs.write().map_err(Self::lock_err)?;
        blobs.insert(
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
        let blobs = self.blobs.read().map_err(Self::lock_err)?;
        blobs
            .get(&(run_id.to_string(), uri.to_string()))
            .cloned()
            .ok_or_else(|| ArtifactIoError::NotFound(uri.to_string()))
    }

    async fn exists(&self, run_id: &str, uri: &ArtifactUri) -> Result<bool, ArtifactIoError> {
        let blobs = self.blobs.read().map_err(Self::lock_err)?;
        Ok(blobs.contains_key(&(run_id.to_string(), uri.to_string())))
    }

    async fn list(&self, run_id: &str) -> Result<Vec<ArtifactUri>, ArtifactIoError> {
        let blobs = self.blobs.read().map_err(Self::lock_err)?;
        let mut uris: Vec<ArtifactUri> = blobs
            .iter()
            .filter(|((rid, _), _)| rid == run_id)
            .map(|(_, stored)| stored.uri.clone())
            .collect();
        uris.sort_by_key(|u| u.to_string());
        Ok(uris)
    }
}
