//! Planner
//!
//! Expands a routed flow into an executable plan: template expansion for the
//! known flows, greedy backward chaining over the capability index for
//! dynamic ones. The planner validates its own output and rejects anything
//! that is not a clean DAG with resolvable bindings.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;

use crate::capability::{CapabilityIndex, CapabilityMatch, MethodSpec};
use crate::types::{Context, FlowKind, NodeKind, NodeSpec, Plan, Value};

const MAX_CHAIN_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("pdf_tracking flow requires a file path in the routed context")]
    MissingFilePath,

    #[error("capability index does not serve method '{0}'")]
    UnknownMethod(String),

    #[error("no tool in the capability index satisfies the query intent")]
    NoSuitableTools,

    #[error("cannot satisfy required input '{input}' of '{method}'")]
    UnsatisfiedInput { method: String, input: String },

    #[error("plan validation failed: {0}")]
    Validation(#[from] PlanValidationError),
}

#[derive(Debug, Error)]
pub enum PlanValidationError {
    #[error("plan has no nodes")]
    Empty,

    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("node '{node}' references unknown upstream '{upstream}'")]
    UnknownUpstream { node: String, upstream: String },

    #[error("edge set contains a cycle involving node '{0}'")]
    Cycle(String),

    #[error("placeholder '{reference}' in node '{node}' targets a node absent from the plan")]
    UnknownPlaceholderTarget { node: String, reference: String },

    #[error("placeholder '{reference}' in node '{node}' targets a node that is not upstream")]
    PlaceholderNotUpstream { node: String, reference: String },

    #[error("tool node '{node}' is missing required argument '{arg}' of '{method}'")]
    MissingRequiredArg {
        node: String,
        method: String,
        arg: String,
    },

    #[error("tool node '{node}' names unknown method '{method}'")]
    UnknownMethod { node: String, method: String },
}

pub struct Planner {
    index: Arc<CapabilityIndex>,
}

impl Planner {
    pub fn new(index: Arc<CapabilityIndex>) -> Self {
        Self { index }
    }

    /// Expand a flow into a validated plan.
    pub fn plan(
        &self,
        flow: FlowKind,
        context: &Context,
        suggested_tools: &[CapabilityMatch],
    ) -> Result<Plan, PlanError> {
        let nodes = match flow {
            FlowKind::Plot => self.plot_template(context)?,
            FlowKind::PdfTracking => self.pdf_tracking_template(context)?,
            FlowKind::Dynamic => self.synthesize(context, suggested_tools)?,
        };
        let plan = Plan::new(flow, nodes);
        self.validate(&plan)?;
        tracing::info!(
            plan_id = %plan.plan_id,
            flow = %plan.flow,
            nodes = plan.nodes.len(),
            "plan materialized"
        );
        Ok(plan)
    }

    /// sql -> pandas_transform -> viz_spec -> plotly_render -> reducer, with
    /// a validator branch gated on the transform running in parallel with
    /// the render.
    fn plot_template(&self, context: &Context) -> Result<Vec<NodeSpec>, PlanError> {
        let where_clause = build_where_clause(context);
        Ok(vec![
            NodeSpec::tool("sql", "sql.query")
                .with_arg("where", Value::literal(where_clause))
                .with_timeout_ms(self.tool_timeout("sql.query")?),
            NodeSpec::tool("pandas_transform", "dataframe.transform")
                .with_arg("table", Value::placeholder("sql", "table"))
                .with_upstream(vec!["sql".to_string()])
                .with_timeout_ms(self.tool_timeout("dataframe.transform")?),
            NodeSpec::agent("viz_spec", "viz_spec")
                .with_arg("table", Value::placeholder("pandas_transform", "table"))
                .with_upstream(vec!["pandas_transform".to_string()]),
            NodeSpec::tool("plotly_render", "plotly.render")
                .with_arg("data", Value::placeholder("pandas_transform", "table"))
                .with_arg("spec", Value::placeholder("viz_spec", "spec"))
                .with_arg("format", Value::literal("png"))
                .with_upstream(vec!["pandas_transform".to_string(), "viz_spec".to_string()])
                .with_timeout_ms(self.tool_timeout("plotly.render")?),
            NodeSpec::agent("validator", "validator")
                .with_arg("table", Value::placeholder("pandas_transform", "table"))
                .with_upstream(vec!["pandas_transform".to_string()]),
            NodeSpec::agent("reducer", "reducer")
                .with_arg("kind", Value::literal("plot"))
                .with_arg("image", Value::placeholder("plotly_render", "image"))
                .with_arg("checks", Value::placeholder("validator", "checks"))
                .with_upstream(vec!["plotly_render".to_string(), "validator".to_string()]),
        ])
    }

    /// file_read -> extraction_agent -> tracking_upsert -> validator ->
    /// reducer.
    fn pdf_tracking_template(&self, context: &Context) -> Result<Vec<NodeSpec>, PlanError> {
        let path = context
            .file_path
            .clone()
            .ok_or(PlanError::MissingFilePath)?;
        let key_field = if context.tracking_id.is_some() {
            "tracking_id"
        } else {
            "invoice_number"
        };
        Ok(vec![
            NodeSpec::tool("file_read", "file.read")
                .with_arg("path", Value::literal(path))
                .with_timeout_ms(self.tool_timeout("file.read")?),
            NodeSpec::agent("extraction_agent", "extraction_agent")
                .with_arg("data", Value::placeholder("file_read", "data"))
                .with_upstream(vec!["file_read".to_string()]),
            NodeSpec::tool("tracking_upsert", "tracking.upsert")
                .with_arg("record", Value::placeholder("extraction_agent", "record"))
                .with_arg("key_field", Value::literal(key_field))
                .with_upstream(vec!["extraction_agent".to_string()])
                .with_timeout_ms(self.tool_timeout("tracking.upsert")?),
            NodeSpec::agent("validator", "validator")
                .with_arg("record", Value::placeholder("tracking_upsert", "record"))
                .with_upstream(vec!["tracking_upsert".to_string()]),
            NodeSpec::agent("reducer", "reducer")
                .with_arg("kind", Value::literal("file_update"))
                .with_arg("record", Value::placeholder("tracking_upsert", "record"))
                .with_arg("checks", Value::placeholder("validator", "checks"))
                .with_upstream(vec!["tracking_upsert".to_string(), "validator".to_string()]),
        ])
    }

    /// Greedy backward chaining: pick a terminal method from the suggested
    /// tools, then satisfy its required inputs from context literals or
    /// other tools' declared outputs. Ties prefer producers that need no
    /// further chaining, then lexicographic method name.
    fn synthesize(
        &self,
        context: &Context,
        suggested_tools: &[CapabilityMatch],
    ) -> Result<Vec<NodeSpec>, PlanError> {
        let candidates: Vec<String> = if suggested_tools.is_empty() {
            self.index.tool_names().map(ToString::to_string).collect()
        } else {
            suggested_tools.iter().map(|m| m.tool.clone()).collect()
        };

        let mut last_err: Option<PlanError> = None;
        for tool_name in &candidates {
            let Some(entry) = self.index.get(tool_name) else {
                continue;
            };
            let mut methods: Vec<&MethodSpec> = entry.methods.iter().collect();
            methods.sort_by(|a, b| a.name.cmp(&b.name));
            for method in methods {
                let mut nodes = Vec::new();
                let mut used = BTreeSet::new();
                match self.chain_method(&method.name, context, &mut nodes, &mut used, 0) {
                    Ok(terminal_id) => {
                        let checks_source =
                            terminal_output_binding(method, &terminal_id);
                        nodes.push(
                            NodeSpec::agent("validator", "validator")
                                .with_arg("data", checks_source)
                                .with_upstream(vec![terminal_id.clone()]),
                        );
                        nodes.push(
                            NodeSpec::agent("reducer", "reducer")
                                .with_arg("kind", Value::literal("dynamic"))
                                .with_arg("checks", Value::placeholder("validator", "checks"))
                                .with_upstream(vec![
                                    terminal_id.clone(),
                                    "validator".to_string(),
                                ]),
                        );
                        return Ok(nodes);
                    }
                    Err(err) => last_err = Some(err),
                }
            }
        }
        Err(last_err.unwrap_or(PlanError::NoSuitableTools))
    }

    /// Materialize the node for `method_name`, chaining producers for any
    /// required input the context cannot provide. Producers land in `nodes`
    /// before their consumers.
    fn chain_method(
        &self,
        method_name: &str,
        context: &Context,
        nodes: &mut Vec<NodeSpec>,
        used: &mut BTreeSet<String>,
        depth: usize,
    ) -> Result<String, PlanError> {
        let (_, entry, method) = self
            .index
            .resolve_method(method_name)
            .ok_or_else(|| PlanError::UnknownMethod(method_name.to_string()))?;
        let node_id = method_name.replace('.', "_");
        if let Some(existing) = nodes.iter().find(|n| n.node_id == node_id) {
            return Ok(existing.node_id.clone());
        }
        used.insert(method_name.to_string());

        let mut spec = NodeSpec::tool(node_id.clone(), method_name)
            .with_timeout_ms(entry.default_timeout_ms);
        let mut upstream = Vec::new();

        for input in method.required_inputs() {
            if let Some(literal) = context_literal(input, context) {
                spec.args
                    .insert(input.to_string(), Value::Literal(literal));
                continue;
            }
            if depth >= MAX_CHAIN_DEPTH {
                return Err(PlanError::UnsatisfiedInput {
                    method: method_name.to_string(),
                    input: input.to_string(),
                });
            }
            let producer = self.pick_producer(input, context, used).ok_or_else(|| {
                PlanError::UnsatisfiedInput {
                    method: method_name.to_string(),
                    input: input.to_string(),
                }
            })?;
            let producer_id = self.chain_method(&producer, context, nodes, used, depth + 1)?;
            spec.args.insert(
                input.to_string(),
                Value::placeholder(producer_id.clone(), input),
            );
            upstream.push(producer_id);
        }

        spec.upstream = upstream;
        nodes.push(spec);
        Ok(node_id)
    }

    /// Producers of `field`, preferring ones whose own inputs need no
    /// further chaining, then lexicographic method name.
    fn pick_producer(
        &self,
        field: &str,
        context: &Context,
        used: &BTreeSet<String>,
    ) -> Option<String> {
        let mut candidates: Vec<(bool, String)> = self
            .index
            .entries()
            .flat_map(|(_, entry)| entry.methods.iter())
            .filter(|m| !used.contains(&m.name))
            .filter(|m| m.output_fields().contains(&field))
            .map(|m| {
                let leaf = m
                    .required_inputs()
                    .iter()
                    .all(|input| context_literal(input, context).is_some());
                (!leaf, m.name.clone())
            })
            .collect();
        candidates.sort();
        candidates.into_iter().next().map(|(_, name)| name)
    }

    fn tool_timeout(&self, method: &str) -> Result<u64, PlanError> {
        self.index
            .resolve_method(method)
            .map(|(_, entry, _)| entry.default_timeout_ms)
            .ok_or_else(|| PlanError::UnknownMethod(method.to_string()))
    }

    /// Reject plans with cycles, dangling references, or unresolved
    /// required arguments.
    pub fn validate(&self, plan: &Plan) -> Result<(), PlanError> {
        if plan.nodes.is_empty() {
            return Err(PlanValidationError::Empty.into());
        }

        let mut ids = HashSet::new();
        for node in &plan.nodes {
            if !ids.insert(node.node_id.as_str()) {
                return Err(PlanValidationError::DuplicateNodeId(node.node_id.clone()).into());
            }
        }
        for node in &plan.nodes {
            for up in &node.upstream {
                if !ids.contains(up.as_str()) {
                    return Err(PlanValidationError::UnknownUpstream {
                        node: node.node_id.clone(),
                        upstream: up.clone(),
                    }
                    .into());
                }
            }
        }

        detect_cycle(plan)?;
        let ancestors = ancestor_sets(plan);

        for node in &plan.nodes {
            let mut placeholders = Vec::new();
            for value in node.args.values() {
                value.collect_placeholders(&mut placeholders);
            }
            for (target, field) in placeholders {
                let reference = format!("${{{}.{}}}", target, field);
                if !ids.contains(target.as_str()) {
                    return Err(PlanValidationError::UnknownPlaceholderTarget {
                        node: node.node_id.clone(),
                        reference,
                    }
                    .into());
                }
                let reachable = ancestors
                    .get(node.node_id.as_str())
                    .is_some_and(|set| set.contains(target.as_str()));
                if !reachable {
                    return Err(PlanValidationError::PlaceholderNotUpstream {
                        node: node.node_id.clone(),
                        reference,
                    }
                    .into());
                }
            }

            if node.kind == NodeKind::Tool {
                let Some((_, _, method)) = self.index.resolve_method(&node.name) else {
                    return Err(PlanValidationError::UnknownMethod {
                        node: node.node_id.clone(),
                        method: node.name.clone(),
                    }
                    .into());
                };
                for required in method.required_inputs() {
                    if !node.args.contains_key(required) {
                        return Err(PlanValidationError::MissingRequiredArg {
                            node: node.node_id.clone(),
                            method: node.name.clone(),
                            arg: required.to_string(),
                        }
                        .into());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Assemble the SQL predicate from routed context; `1=1` when nothing was
/// extracted.
pub fn build_where_clause(context: &Context) -> String {
    let mut predicates = Vec::new();
    if let Some(outlet_id) = context.outlet_id {
        predicates.push(format!("outlet_id = {}", outlet_id));
    }
    if let Some(product) = &context.product_filter {
        predicates.push(format!("product = '{}'", product.replace('\'', "''")));
    }
    if let Some((lo, hi)) = &context.week_range {
        predicates.push(format!("week BETWEEN '{}' AND '{}'", lo, hi));
    }
    if predicates.is_empty() {
        "1=1".to_string()
    } else {
        predicates.join(" AND ")
    }
}

fn terminal_output_binding(method: &MethodSpec, terminal_id: &str) -> Value {
    let mut fields = method.output_fields();
    fields.sort();
    match fields.first() {
        Some(field) => Value::placeholder(terminal_id, *field),
        None => Value::literal(serde_json::Value::Null),
    }
}

fn context_literal(input: &str, context: &Context) -> Option<serde_json::Value> {
    match input {
        "where" => Some(json!(build_where_clause(context))),
        "path" => context.file_path.as_ref().map(|p| json!(p)),
        "outlet_id" => context.outlet_id.map(|v| json!(v)),
        "product" => context.product_filter.as_ref().map(|p| json!(p)),
        _ => None,
    }
}

fn detect_cycle(plan: &Plan) -> Result<(), PlanValidationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in &plan.edges {
        downstream.entry(from.as_str()).or_default().push(to.as_str());
    }
    let mut colors: HashMap<&str, Color> = plan
        .nodes
        .iter()
        .map(|n| (n.node_id.as_str(), Color::White))
        .collect();

    fn visit<'a>(
        node: &'a str,
        downstream: &HashMap<&'a str, Vec<&'a str>>,
        colors: &mut HashMap<&'a str, Color>,
    ) -> Result<(), PlanValidationError> {
        colors.insert(node, Color::Gray);
        for next in downstream.get(node).into_iter().flatten() {
            match colors.get(next).copied().unwrap_or(Color::White) {
                Color::Gray => return Err(PlanValidationError::Cycle(next.to_string())),
                Color::White => visit(next, downstream, colors)?,
                Color::Black => {}
            }
        }
        colors.insert(node, Color::Black);
        Ok(())
    }

    let ids: Vec<&str> = plan.nodes.iter().map(|n| n.node_id.as_str()).collect();
    for id in ids {
        if colors.get(id).copied() == Some(Color::White) {
            visit(id, &downstream, &mut colors)?;
        }
    }
    Ok(())
}

/// Transitive upstream closure per node.
fn ancestor_sets(plan: &Plan) -> HashMap<&str, HashSet<&str>> {
    let upstream_of: HashMap<&str, &Vec<String>> = plan
        .nodes
        .iter()
        .map(|n| (n.node_id.as_str(), &n.upstream))
        .collect();

    let mut out: HashMap<&str, HashSet<&str>> = HashMap::new();
    for node in &plan.nodes {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = node.upstream.iter().map(String::as_str).collect();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(ups) = upstream_of.get(current) {
                stack.extend(ups.iter().map(String::as_str));
            }
        }
        out.insert(node.node_id.as_str(), seen);
    }
    out
}
