//! Placeholder and artifact resolution, idempotency keys.
//!
//! Placeholders resolve at dispatch time against recorded upstream outputs.
//! Idempotency keys hash the *key form* of every reference, so a node's key
//! is computable before any upstream node has run.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{NodeError, NodeFailure};
use crate::store::{ArtifactStore, ArtifactUri};
use crate::types::{NodeSpec, Value};

/// SHA-256 over `(kind, name, canonical args, version tag)`.
///
/// Canonical args keep map keys sorted and normalize integral floats. A
/// placeholder expands to the *idempotency key* of its producing node
/// rather than its runtime value, so keys chain through the DAG and are
/// computable before any node runs: an upstream whose own key changes
/// invalidates every consumer downstream.
pub fn idempotency_key(
    spec: &NodeSpec,
    version: &str,
    upstream_keys: &BTreeMap<String, String>,
) -> String {
    let args: serde_json::Map<String, serde_json::Value> = spec
        .args
        .iter()
        .map(|(k, v)| (k.clone(), canonical_arg(v, upstream_keys)))
        .collect();
    let canonical = json!({
        "kind": spec.kind.as_str(),
        "name": spec.name,
        "args": args,
        "version": version,
    });
    let payload = canonical.to_string();
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_arg(value: &Value, upstream_keys: &BTreeMap<String, String>) -> serde_json::Value {
    match value {
        Value::Placeholder { node_id, field } => {
            // Unknown producers keep their raw id; plan validation rejects
            // such references before execution anyway.
            let key = upstream_keys
                .get(node_id)
                .map(String::as_str)
                .unwrap_or(node_id.as_str());
            serde_json::Value::String(format!("${{{}.{}}}", key, field))
        }
        Value::List(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| canonical_arg(item, upstream_keys))
                .collect(),
        ),
        Value::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonical_arg(v, upstream_keys)))
                .collect(),
        ),
        other => other.canonical_json(),
    }
}

pub(crate) struct Resolver<'a> {
    pub run_id: &'a str,
    pub upstream_outputs: &'a BTreeMap<String, serde_json::Value>,
    pub artifacts: &'a dyn ArtifactStore,
    /// Deliver artifact arguments as inlined bytes instead of URIs.
    pub inline_artifacts: bool,
}

impl Resolver<'_> {
    /// Resolve a node's argument map into the plain JSON params handed to
    /// the tool or agent.
    pub async fn resolve_args(
        &self,
        args: &BTreeMap<String, Value>,
    ) -> Result<serde_json::Value, NodeFailure> {
        let mut out = serde_json::Map::new();
        for (key, value) in args {
            out.insert(key.clone(), self.resolve_value(value).await?);
        }
        Ok(serde_json::Value::Object(out))
    }

    async fn resolve_value(&self, value: &Value) -> Result<serde_json::Value, NodeFailure> {
        match value {
            Value::Literal(v) => Ok(v.clone()),
            Value::Placeholder { node_id, field } => {
                let output = self.upstream_outputs.get(node_id).ok_or_else(|| {
                    NodeFailure::new(NodeError::UnresolvedPlaceholder {
                        reference: format!("${{{}.{}}}", node_id, field),
                    })
                })?;
                let resolved = lookup_field(output, field).ok_or_else(|| {
                    NodeFailure::new(NodeError::UnresolvedPlaceholder {
                        reference: format!("${{{}.{}}}", node_id, field),
                    })
                })?;
                // A placeholder may land on an artifact URI emitted by the
                // producer; inline it when the consumer asked for bytes.
                if self.inline_artifacts {
                    if let Some(uri) = as_artifact_uri(&resolved) {
                        return self.inline_artifact(&uri).await;
                    }
                }
                Ok(resolved)
            }
            Value::Artifact { node_id, filename } => {
                let uri = ArtifactUri::new(node_id.clone(), filename.clone());
                if self.inline_artifacts {
                    return self.inline_artifact(&uri).await;
                }
                let exists = self
                    .artifacts
                    .exists(self.run_id, &uri)
                    .await
                    .map_err(|e| NodeFailure::new(NodeError::Store {
                        message: e.to_string(),
                    }))?;
                if !exists {
                    return Err(NodeFailure::new(NodeError::MissingArtifact {
                        uri: uri.to_string(),
                    }));
                }
                Ok(serde_json::Value::String(uri.to_string()))
            }
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Box::pin(self.resolve_value(item)).await?);
                }
                Ok(serde_json::Value::Array(out))
            }
            Value::Map(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), Box::pin(self.resolve_value(item)).await?);
                }
                Ok(serde_json::Value::Object(out))
            }
        }
    }

    async fn inline_artifact(&self, uri: &ArtifactUri) -> Result<serde_json::Value, NodeFailure> {
        let stored = self.artifacts.read(self.run_id, uri).await.map_err(|_| {
            NodeFailure::new(NodeError::MissingArtifact {
                uri: uri.to_string(),
            })
        })?;
        Ok(json!({
            "filename": uri.filename,
            "content_type": stored.content_type,
            "bytes_base64": BASE64.encode(&stored.bytes),
        }))
    }
}

/// Dotted-path lookup into a node output, e.g. `table` or `table.rows`.
fn lookup_field(output: &serde_json::Value, field: &str) -> Option<serde_json::Value> {
    let mut current = output;
    for part in field.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

fn as_artifact_uri(value: &serde_json::Value) -> Option<ArtifactUri> {
    value.as_str().and_then(|s| s.parse().ok())
}
