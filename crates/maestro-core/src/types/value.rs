//! Argument value model.
//!
//! Node arguments are JSON-shaped, but two string forms carry structure the
//! executor must see: `artifact://{node_id}/{filename}` references a blob a
//! plan node produced, and `${node_id.field}` is a placeholder resolved at
//! dispatch time against the producing node's recorded output. Both are
//! tagged variants here so resolution and canonicalization can walk argument
//! trees uniformly instead of re-parsing strings at every layer.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Number;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\$\{([A-Za-z0-9_-]+)\.([A-Za-z0-9_][A-Za-z0-9_.]*)\}$").expect("valid regex")
    })
}

fn artifact_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^artifact://([A-Za-z0-9_-]+)/(.+)$").expect("valid regex"))
}

/// A node argument: a literal, an artifact reference, an upstream
/// placeholder, or a container of further values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Literal(serde_json::Value),
    Artifact { node_id: String, filename: String },
    Placeholder { node_id: String, field: String },
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn placeholder(node_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Placeholder {
            node_id: node_id.into(),
            field: field.into(),
        }
    }

    pub fn artifact(node_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self::Artifact {
            node_id: node_id.into(),
            filename: filename.into(),
        }
    }

    /// Parse a JSON tree, promoting recognized string forms to tagged
    /// variants.
    pub fn from_json(raw: serde_json::Value) -> Self {
        match raw {
            serde_json::Value::String(s) => {
                if let Some(caps) = placeholder_re().captures(&s) {
                    return Self::Placeholder {
                        node_id: caps[1].to_string(),
                        field: caps[2].to_string(),
                    };
                }
                if let Some(caps) = artifact_re().captures(&s) {
                    return Self::Artifact {
                        node_id: caps[1].to_string(),
                        filename: caps[2].to_string(),
                    };
                }
                Self::Literal(serde_json::Value::String(s))
            }
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
            other => Self::Literal(other),
        }
    }

    /// Render back to plain JSON, references in their wire form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Artifact { node_id, filename } => {
                serde_json::Value::String(format!("artifact://{}/{}", node_id, filename))
            }
            Self::Placeholder { node_id, field } => {
                serde_json::Value::String(format!("${{{}.{}}}", node_id, field))
            }
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Canonical JSON for idempotency hashing: map keys sorted, integral
    /// floats normalized to integers, references kept in key form so the
    /// hash is computable before upstream nodes run.
    pub fn canonical_json(&self) -> serde_json::Value {
        match self {
            Self::Literal(v) => canonicalize_literal(v),
            Self::Artifact { .. } | Self::Placeholder { .. } => self.to_json(),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::canonical_json).collect())
            }
            Self::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.canonical_json()))
                    .collect(),
            ),
        }
    }

    /// Placeholders reachable from this value, `(node_id, field)` pairs.
    pub fn collect_placeholders(&self, out: &mut Vec<(String, String)>) {
        match self {
            Self::Placeholder { node_id, field } => {
                out.push((node_id.clone(), field.clone()));
            }
            Self::List(items) => {
                for item in items {
                    item.collect_placeholders(out);
                }
            }
            Self::Map(map) => {
                for value in map.values() {
                    value.collect_placeholders(out);
                }
            }
            _ => {}
        }
    }

    /// Artifact references reachable from this value, `(node_id, filename)`.
    pub fn collect_artifact_refs(&self, out: &mut Vec<(String, String)>) {
        match self {
            Self::Artifact { node_id, filename } => {
                out.push((node_id.clone(), filename.clone()));
            }
            Self::List(items) => {
                for item in items {
                    item.collect_artifact_refs(out);
                }
            }
            Self::Map(map) => {
                for value in map.values() {
                    value.collect_artifact_refs(out);
                }
            }
            _ => {}
        }
    }
}

fn canonicalize_literal(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Number(n) => serde_json::Value::Number(normalize_number(n)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize_literal).collect())
        }
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, &serde_json::Value> = map.iter().collect();
            serde_json::Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize_literal(v)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

fn normalize_number(n: &Number) -> Number {
    if let Some(f) = n.as_f64() {
        if n.as_i64().is_none() && n.as_u64().is_none() && f.fract() == 0.0 {
            if f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                return Number::from(f as i64);
            }
        }
    }
    n.clone()
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_json(raw))
    }
}
