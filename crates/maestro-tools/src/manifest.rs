//! Tool manifest discovery.
//!
//! At startup each declared tool is invoked with `--manifest`; it emits its
//! method descriptors as JSON and exits. A tool whose manifest cannot be
//! fetched or does not cover the methods the capability index promises is
//! marked unavailable; startup continues without it.

use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;

use maestro_core::capability::{CapabilityIndex, ToolEntry};

const MANIFEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Method descriptor as the tool itself declares it.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestMethod {
    pub name: String,
    #[serde(default)]
    pub retryable_codes: Vec<i64>,
    #[serde(default)]
    pub wants_inline: bool,
}

/// Manifest payload emitted by `<binary> --manifest`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolManifest {
    #[serde(default)]
    pub tool: Option<String>,
    pub methods: Vec<ManifestMethod>,
}

/// Outcome of startup discovery across the whole index.
#[derive(Debug, Default)]
pub struct ManifestReport {
    pub available: BTreeSet<String>,
    /// Tool name -> reason it was taken out of rotation.
    pub unavailable: BTreeMap<String, String>,
}

impl ManifestReport {
    pub fn unavailable_set(&self) -> BTreeSet<String> {
        self.unavailable.keys().cloned().collect()
    }
}

/// Probe every tool in the index. Failures are recorded, never fatal.
pub async fn discover_manifests(index: &CapabilityIndex) -> ManifestReport {
    let mut report = ManifestReport::default();
    for (tool, entry) in index.entries() {
        match probe_tool(entry).await {
            Ok(manifest) => match verify_manifest(entry, &manifest) {
                Ok(()) => {
                    tracing::info!(tool = %tool, methods = manifest.methods.len(), "tool manifest verified");
                    report.available.insert(tool.to_string());
                }
                Err(reason) => {
                    tracing::warn!(tool = %tool, reason = %reason, "tool manifest mismatch, marking unavailable");
                    report.unavailable.insert(tool.to_string(), reason);
                }
            },
            Err(reason) => {
                tracing::warn!(tool = %tool, reason = %reason, "tool manifest probe failed, marking unavailable");
                report.unavailable.insert(tool.to_string(), reason);
            }
        }
    }
    report
}

async fn probe_tool(entry: &ToolEntry) -> Result<ToolManifest, String> {
    let mut cmd = Command::new(&entry.binary_path);
    cmd.args(&entry.args);
    cmd.arg("--manifest");
    if let Some(cwd) = &entry.cwd {
        cmd.current_dir(cwd);
    }
    if !entry.env.is_empty() {
        cmd.envs(entry.env.clone());
    }
    cmd.kill_on_drop(true);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn '{}': {}", entry.binary_path, e))?;
    let output = timeout(MANIFEST_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| "manifest probe timed out".to_string())?
        .map_err(|e| format!("failed to collect manifest output: {}", e))?;

    if !output.status.success() {
        return Err(format!("manifest probe exited with {}", output.status));
    }
    // Manifests may be pretty-printed; parse the whole stream, not a line.
    serde_json::from_slice(&output.stdout).map_err(|e| format!("manifest is not valid JSON: {}", e))
}

/// Every method the index promises must be served by the tool.
fn verify_manifest(entry: &ToolEntry, manifest: &ToolManifest) -> Result<(), String> {
    let served: BTreeSet<&str> = manifest.methods.iter().map(|m| m.name.as_str()).collect();
    for method in &entry.methods {
        if !served.contains(method.name.as_str()) {
            return Err(format!("method '{}' not served by tool", method.name));
        }
    }
    Ok(())
}
