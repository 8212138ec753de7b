//! JSON-RPC stdio tool client.
//!
//! Each call spawns the tool server, writes a single request line, closes
//! the write side, and reads a single response line. The child never
//! outlives the call: timeout, cancellation and drop all reap it
//! (`kill_on_drop` delivers SIGKILL).

use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use maestro_core::capability::{CapabilityIndex, ToolEntry};
use maestro_core::error::{NodeError, NodeFailure};
use maestro_core::executor::{ToolInvocation, ToolInvoker};

const STDERR_PREVIEW_CHARS: usize = 2_000;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

/// Tool transport backed by one-shot child processes.
pub struct StdioToolClient {
    index: Arc<CapabilityIndex>,
    request_ids: AtomicU64,
    unavailable: RwLock<BTreeSet<String>>,
}

impl StdioToolClient {
    pub fn new(index: Arc<CapabilityIndex>) -> Self {
        Self {
            index,
            request_ids: AtomicU64::new(0),
            unavailable: RwLock::new(BTreeSet::new()),
        }
    }

    /// Mark tools whose manifests did not line up with the index; calls to
    /// them fail fast instead of spawning.
    pub fn set_unavailable(&self, tools: BTreeSet<String>) {
        if let Ok(mut unavailable) = self.unavailable.write() {
            *unavailable = tools;
        }
    }

    pub fn is_unavailable(&self, tool: &str) -> bool {
        self.unavailable
            .read()
            .map(|set| set.contains(tool))
            .unwrap_or(false)
    }

    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl ToolInvoker for StdioToolClient {
    async fn invoke(&self, invocation: ToolInvocation) -> Result<serde_json::Value, NodeFailure> {
        let (tool, entry, method) = self
            .index
            .resolve_method(&invocation.method)
            .ok_or_else(|| {
                NodeFailure::new(NodeError::UnknownTool {
                    name: invocation.method.clone(),
                })
            })?;
        if self.is_unavailable(tool) {
            return Err(NodeFailure::new(NodeError::ToolUnavailable {
                name: tool.to_string(),
            }));
        }

        let request_id = self.next_request_id();
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: request_id,
            method: &invocation.method,
            params: &invocation.params,
        };
        let request_line = serde_json::to_string(&request).map_err(|e| {
            NodeFailure::new(NodeError::Protocol {
                message: format!("failed to serialize request: {}", e),
            })
        })?;

        let mut child = spawn_tool(entry).map_err(NodeFailure::new)?;
        if let Some(mut stdin) = child.stdin.take() {
            let write = async {
                stdin.write_all(request_line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.shutdown().await
            };
            if let Err(e) = write.await {
                return Err(NodeFailure::new(NodeError::Spawn {
                    message: format!("failed to write request to tool stdin: {}", e),
                }));
            }
        }

        tracing::debug!(
            tool = %tool,
            method = %invocation.method,
            request_id,
            timeout_ms = invocation.timeout.as_millis() as u64,
            "tool process dispatched"
        );

        // Dropping the in-flight future (cancel/timeout) drops the child
        // and kill_on_drop reaps it.
        let output = tokio::select! {
            biased;
            _ = invocation.cancel.cancelled() => {
                return Err(NodeFailure::new(NodeError::Cancelled));
            }
            waited = timeout(invocation.timeout, child.wait_with_output()) => match waited {
                Err(_) => {
                    return Err(NodeFailure::new(NodeError::Timeout {
                        timeout_ms: invocation.timeout.as_millis() as u64,
                    }));
                }
                Ok(Err(e)) => {
                    return Err(NodeFailure::new(NodeError::Spawn {
                        message: format!("failed to collect tool output: {}", e),
                    }));
                }
                Ok(Ok(output)) => output,
            },
        };

        let stderr = preview_stderr(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(line) = stdout.lines().find(|l| !l.trim().is_empty()) else {
            let message = if output.status.success() {
                "tool produced no response line".to_string()
            } else {
                format!("tool exited with {} and no response line", output.status)
            };
            return Err(NodeFailure::with_stderr(
                NodeError::Protocol { message },
                stderr,
            ));
        };

        let response: JsonRpcResponse = serde_json::from_str(line).map_err(|e| {
            NodeFailure::with_stderr(
                NodeError::Protocol {
                    message: format!("response is not valid JSON-RPC: {}", e),
                },
                stderr.clone(),
            )
        })?;

        if response.jsonrpc.as_deref() != Some("2.0") {
            return Err(NodeFailure::with_stderr(
                NodeError::Protocol {
                    message: "response is missing jsonrpc version".to_string(),
                },
                stderr,
            ));
        }
        if response.id.as_ref().and_then(|v| v.as_u64()) != Some(request_id) {
            return Err(NodeFailure::with_stderr(
                NodeError::Protocol {
                    message: format!(
                        "response id {:?} does not match request id {}",
                        response.id, request_id
                    ),
                },
                stderr,
            ));
        }

        if let Some(error) = response.error {
            let retryable = method.retryable_codes.contains(&error.code);
            return Err(NodeFailure::with_stderr(
                NodeError::Tool {
                    code: error.code,
                    message: error.message,
                    retryable,
                },
                stderr,
            ));
        }

        response.result.ok_or_else(|| {
            NodeFailure::with_stderr(
                NodeError::Protocol {
                    message: "response carries neither result nor error".to_string(),
                },
                stderr,
            )
        })
    }
}

fn spawn_tool(entry: &ToolEntry) -> Result<tokio::process::Child, NodeError> {
    let mut cmd = Command::new(&entry.binary_path);
    cmd.args(&entry.args);
    if let Some(cwd) = &entry.cwd {
        cmd.current_dir(cwd);
    }
    if !entry.env.is_empty() {
        cmd.envs(entry.env.clone());
    }
    cmd.kill_on_drop(true);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.spawn().map_err(|e| NodeError::Spawn {
        message: format!("failed to spawn '{}': {}", entry.binary_path, e),
    })
}

fn preview_stderr(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let char_count = trimmed.chars().count();
    if char_count <= STDERR_PREVIEW_CHARS {
        return Some(trimmed.to_string());
    }
    let mut preview: String = trimmed.chars().take(STDERR_PREVIEW_CHARS).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    Some(preview)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use maestro_core::capability::{CapabilityIndex, MethodSpec, ToolEntry};
    use serde_json::json;

    /// Index with a single `echo` tool backed by an inline shell script.
    /// `sh -c SCRIPT --manifest` makes the flag visible to the script as
    /// `$0`.
    pub(crate) fn script_index(script: &str) -> Arc<CapabilityIndex> {
        let tools = BTreeMap::from([(
            "echo".to_string(),
            ToolEntry {
                binary_path: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                cwd: None,
                env: BTreeMap::new(),
                version: "v1".to_string(),
                tags: vec!["echo".to_string()],
                keywords: Vec::new(),
                methods: vec![MethodSpec {
                    name: "echo.run".to_string(),
                    input_schema: json!({"type": "object"}),
                    output_schema: json!({"type": "object", "properties": {"result": {}}}),
                    retryable_codes: vec![503],
                    wants_inline: false,
                }],
                default_timeout_ms: 2_000,
            },
        )]);
        Arc::new(CapabilityIndex::new(tools).expect("valid test index"))
    }
}
