//! Capability Index
//!
//! The static registry of available tools, loaded once at startup and shared
//! read-only by every run. Each entry describes how to launch the tool
//! server, how the router should recognize it, and the JSON-RPC methods it
//! serves. There is deliberately no mutation API.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_TOOL_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("failed to read capability index {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse capability index {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("capability index is empty")]
    Empty,

    #[error("tool '{tool}' declares no methods")]
    NoMethods { tool: String },

    #[error("duplicate method name '{method}' declared by '{first}' and '{second}'")]
    DuplicateMethod {
        method: String,
        first: String,
        second: String,
    },
}

/// One JSON-RPC method a tool serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
    /// Tool-declared transient error codes; these classify as retryable.
    #[serde(default)]
    pub retryable_codes: Vec<i64>,
    /// Whether artifact arguments should be delivered as inlined bytes.
    #[serde(default)]
    pub wants_inline: bool,
}

impl MethodSpec {
    /// Field names listed as `required` in the input schema.
    pub fn required_inputs(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    /// Field names declared in the output schema.
    pub fn output_fields(&self) -> Vec<&str> {
        self.output_schema
            .get("properties")
            .and_then(|v| v.as_object())
            .map(|obj| obj.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// One tool server entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    pub binary_path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Version tag folded into idempotency keys.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Regex patterns matched against the raw query for routing.
    #[serde(default)]
    pub keywords: Vec<String>,
    pub methods: Vec<MethodSpec>,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_version() -> String {
    DEFAULT_TOOL_VERSION.to_string()
}

fn default_timeout_ms() -> u64 {
    crate::types::DEFAULT_NODE_TIMEOUT_MS
}

/// A tool matched against query tokens, with its accumulated score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityMatch {
    pub tool: String,
    pub score: u32,
}

/// The immutable registry of tools, keyed by tool name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityIndex {
    tools: BTreeMap<String, ToolEntry>,
}

impl CapabilityIndex {
    pub fn new(tools: BTreeMap<String, ToolEntry>) -> Result<Self, CapabilityError> {
        let index = Self { tools };
        index.validate()?;
        Ok(index)
    }

    /// Load and validate the index from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CapabilityError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CapabilityError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let tools: BTreeMap<String, ToolEntry> =
            serde_json::from_str(&content).map_err(|source| CapabilityError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        Self::new(tools)
    }

    fn validate(&self) -> Result<(), CapabilityError> {
        if self.tools.is_empty() {
            return Err(CapabilityError::Empty);
        }
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for (tool, entry) in &self.tools {
            if entry.methods.is_empty() {
                return Err(CapabilityError::NoMethods { tool: tool.clone() });
            }
            for method in &entry.methods {
                if let Some(first) = seen.insert(method.name.as_str(), tool.as_str()) {
                    return Err(CapabilityError::DuplicateMethod {
                        method: method.name.clone(),
                        first: first.to_string(),
                        second: tool.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, tool: &str) -> Option<&ToolEntry> {
        self.tools.get(tool)
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &ToolEntry)> {
        self.tools.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Find the tool serving a method, e.g. `sql.query`.
    pub fn resolve_method(&self, method: &str) -> Option<(&str, &ToolEntry, &MethodSpec)> {
        self.tools.iter().find_map(|(name, entry)| {
            entry
                .methods
                .iter()
                .find(|m| m.name == method)
                .map(|m| (name.as_str(), entry, m))
        })
    }

    /// Score tools against query tokens: two points per tag hit, one per
    /// keyword pattern match on the raw query. Results sorted by descending
    /// score, then tool name.
    pub fn search(&self, query: &str, tokens: &[String]) -> Vec<CapabilityMatch> {
        let mut matches: Vec<CapabilityMatch> = self
            .tools
            .iter()
            .filter_map(|(name, entry)| {
                let mut score = 0u32;
                for tag in &entry.tags {
                    if tokens.iter().any(|t| t == tag) {
                        score += 2;
                    }
                }
                for pattern in &entry.keywords {
                    if let Ok(re) = Regex::new(&format!("(?i){}", pattern)) {
                        if re.is_match(query) {
                            score += 1;
                        }
                    }
                }
                (score > 0).then(|| CapabilityMatch {
                    tool: name.clone(),
                    score,
                })
            })
            .collect();
        matches.sort_by(|a, b| b.score.cmp(&a.score).then(a.tool.cmp(&b.tool)));
        matches
    }
}
