//! Router
//!
//! Classifies a query into a flow and extracts structured context from it.
//! Classification leans on the capability index tag/keyword scores; context
//! extraction is plain regex. The "current week" is a caller parameter so
//! routing stays deterministic under test.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use thiserror::Error;

use crate::capability::{CapabilityIndex, CapabilityMatch};
use crate::types::{Context, FlowKind, IsoWeek, Query};

/// A tag hit is worth two points; anything below this is noise.
const MIN_CAPABILITY_SCORE: u32 = 2;

const PLOT_TOKENS: [&str; 5] = ["plot", "chart", "graph", "trend", "visualize"];
const PDF_TOKENS: [&str; 4] = ["invoice", "tracking", "extract", "vendor"];
const PRODUCT_STOPWORDS: [&str; 8] = ["the", "a", "an", "last", "outlet", "this", "that", "my"];

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("query matched no flow: no capability score above threshold and no extractor fired")]
    AmbiguousFlow,
}

/// Router output: the selected flow, extracted context, and capability
/// matches ranked for the planner.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub flow: FlowKind,
    pub context: Context,
    pub suggested_tools: Vec<CapabilityMatch>,
}

pub struct Router {
    index: Arc<CapabilityIndex>,
}

fn show_over_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bshow\b.*\bover\b").expect("valid regex"))
}

fn last_n_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\blast\s+(\d+)\s+(weeks?|months?)\b").expect("valid regex"))
}

fn outlet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\boutlet\s+(\d+)\b").expect("valid regex"))
}

fn product_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bfor\s+([a-z][a-z0-9_-]*)\b").expect("valid regex"))
}

fn iso_week_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4})-W(\d{2})\b").expect("valid regex"))
}

fn invoice_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(inv-\d{2,})\b").expect("valid regex"))
}

fn tracking_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(trk-[a-z0-9]{2,})\b").expect("valid regex"))
}

impl Router {
    pub fn new(index: Arc<CapabilityIndex>) -> Self {
        Self { index }
    }

    /// Route against the current wall-clock ISO week.
    pub fn route_now(&self, query: &Query) -> Result<RouteDecision, RouteError> {
        self.route(query, IsoWeek::current())
    }

    /// Classify the query and extract context. Deterministic for a fixed
    /// `current_week`.
    pub fn route(&self, query: &Query, current_week: IsoWeek) -> Result<RouteDecision, RouteError> {
        let tokens = tokenize(&query.text);
        let suggested_tools = self.index.search(&query.text, &tokens);
        let context = extract_context(query, &tokens, current_week);

        let plot_signal = tokens.iter().any(|t| PLOT_TOKENS.contains(&t.as_str()))
            || show_over_re().is_match(&query.text)
            || viz_tool_dominates(&self.index, &suggested_tools);
        let pdf_signal = query
            .file_path
            .as_deref()
            .is_some_and(|p| p.to_ascii_lowercase().ends_with(".pdf"))
            || tokens.iter().any(|t| PDF_TOKENS.contains(&t.as_str()));

        let flow = match (plot_signal, pdf_signal) {
            (true, true) => {
                // Tie break: an attached file wins, otherwise plot.
                if query.file_path.is_some() {
                    FlowKind::PdfTracking
                } else {
                    FlowKind::Plot
                }
            }
            (true, false) => FlowKind::Plot,
            (false, true) => FlowKind::PdfTracking,
            (false, false) => FlowKind::Dynamic,
        };

        if flow == FlowKind::Dynamic {
            let best_score = suggested_tools.first().map(|m| m.score).unwrap_or(0);
            if best_score < MIN_CAPABILITY_SCORE && context.is_empty() {
                return Err(RouteError::AmbiguousFlow);
            }
        }

        tracing::debug!(
            flow = %flow,
            suggestions = suggested_tools.len(),
            "query routed"
        );

        Ok(RouteDecision {
            flow,
            context,
            suggested_tools,
        })
    }
}

fn viz_tool_dominates(index: &CapabilityIndex, matches: &[CapabilityMatch]) -> bool {
    matches.first().is_some_and(|top| {
        top.score >= MIN_CAPABILITY_SCORE
            && index.get(&top.tool).is_some_and(|entry| {
                entry
                    .tags
                    .iter()
                    .any(|t| matches!(t.as_str(), "plot" | "chart" | "visualization"))
            })
    })
}

/// Lowercase, punctuation-split tokens.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn extract_context(query: &Query, tokens: &[String], current_week: IsoWeek) -> Context {
    let mut context = Context {
        file_path: query.file_path.clone(),
        ..Context::default()
    };
    let text = &query.text;

    if let Some(caps) = last_n_re().captures(text) {
        let count: Option<u32> = caps[1].parse().ok();
        if let Some(count) = count {
            if caps[2].to_ascii_lowercase().starts_with("week") {
                context.week_count = Some(count);
            } else {
                context.month_count = Some(count);
            }
        }
    }

    if let Some(caps) = outlet_re().captures(text) {
        context.outlet_id = caps[1].parse().ok();
    }

    context.product_filter = extract_product(text, tokens);

    let mut explicit_weeks: Vec<IsoWeek> = iso_week_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let year: i32 = caps[1].parse().ok()?;
            let week: u32 = caps[2].parse().ok()?;
            (1..=53).contains(&week).then_some(IsoWeek::new(year, week))
        })
        .collect();
    explicit_weeks.sort();
    match explicit_weeks.as_slice() {
        [] => {}
        [only] => context.week_range = Some((*only, *only)),
        [first, .., last] => context.week_range = Some((*first, *last)),
    }

    // `last N weeks` wins only when no explicit range was given.
    if context.week_range.is_none() {
        if let Some(count) = context.week_count {
            if count > 0 {
                if let Some(lo) = current_week.minus_weeks(count - 1) {
                    context.week_range = Some((lo, current_week));
                }
            }
        }
    }

    if let Some(caps) = invoice_number_re().captures(text) {
        context.invoice_number = Some(caps[1].to_ascii_uppercase());
    }
    if let Some(caps) = tracking_id_re().captures(text) {
        context.tracking_id = Some(caps[1].to_ascii_uppercase());
    }

    context
}

fn extract_product(text: &str, tokens: &[String]) -> Option<String> {
    // Known product literal first, then a `for <word>` capture that skips
    // filler words and quantities.
    if tokens.iter().any(|t| t == "widget") {
        return Some("widget".to_string());
    }
    for caps in product_re().captures_iter(text) {
        let candidate = caps[1].to_lowercase();
        if PRODUCT_STOPWORDS.contains(&candidate.as_str()) {
            continue;
        }
        if candidate.starts_with("week") || candidate.starts_with("month") {
            continue;
        }
        return Some(candidate);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_fixtures::sample_index;

    fn router() -> Router {
        Router::new(Arc::new(sample_index()))
    }

    #[test]
    fn test_plot_query_extracts_week_range() {
        let decision = router()
            .route(
                &Query::new("Plot sales for the last 4 weeks"),
                IsoWeek::new(2024, 20),
            )
            .unwrap();

        assert_eq!(decision.flow, FlowKind::Plot);
        assert_eq!(decision.context.week_count, Some(4));
        assert_eq!(
            decision.context.week_range,
            Some((IsoWeek::new(2024, 17), IsoWeek::new(2024, 20)))
        );
        assert!(!decision.suggested_tools.is_empty());
    }

    #[test]
    fn test_outlet_product_and_weeks_extracted_together() {
        let decision = router()
            .route(
                &Query::new("show widget sales for outlet 42 over last 2 weeks"),
                IsoWeek::new(2024, 20),
            )
            .unwrap();

        assert_eq!(decision.flow, FlowKind::Plot);
        assert_eq!(decision.context.outlet_id, Some(42));
        assert_eq!(decision.context.product_filter.as_deref(), Some("widget"));
        assert_eq!(decision.context.week_count, Some(2));
        assert_eq!(
            decision.context.week_range,
            Some((IsoWeek::new(2024, 19), IsoWeek::new(2024, 20)))
        );
    }

    #[test]
    fn test_pdf_file_routes_to_pdf_tracking() {
        let decision = router()
            .route(
                &Query::with_file("Extract this invoice", "/p/inv.pdf"),
                IsoWeek::new(2024, 20),
            )
            .unwrap();

        assert_eq!(decision.flow, FlowKind::PdfTracking);
        assert_eq!(decision.context.file_path.as_deref(), Some("/p/inv.pdf"));
    }

    #[test]
    fn test_tie_with_file_prefers_pdf_tracking() {
        let decision = router()
            .route(
                &Query::with_file("plot the invoice totals", "/p/report.pdf"),
                IsoWeek::new(2024, 20),
            )
            .unwrap();
        assert_eq!(decision.flow, FlowKind::PdfTracking);

        let decision = router()
            .route(&Query::new("plot the invoice totals"), IsoWeek::new(2024, 20))
            .unwrap();
        assert_eq!(decision.flow, FlowKind::Plot);
    }

    #[test]
    fn test_explicit_iso_weeks_win_over_week_count() {
        let decision = router()
            .route(
                &Query::new("plot sales from 2024-W05 to 2024-W09 for the last 3 weeks"),
                IsoWeek::new(2024, 20),
            )
            .unwrap();
        assert_eq!(
            decision.context.week_range,
            Some((IsoWeek::new(2024, 5), IsoWeek::new(2024, 9)))
        );
        assert_eq!(decision.context.week_count, Some(3));
    }

    #[test]
    fn test_months_populate_month_count() {
        let decision = router()
            .route(
                &Query::new("chart revenue for the last 6 months"),
                IsoWeek::new(2024, 20),
            )
            .unwrap();
        assert_eq!(decision.context.month_count, Some(6));
        assert_eq!(decision.context.week_range, None);
    }

    #[test]
    fn test_invoice_and_tracking_ids_extracted() {
        let decision = router()
            .route(
                &Query::new("update tracking for invoice INV-42 under TRK-9F3A"),
                IsoWeek::new(2024, 20),
            )
            .unwrap();
        assert_eq!(decision.flow, FlowKind::PdfTracking);
        assert_eq!(decision.context.invoice_number.as_deref(), Some("INV-42"));
        assert_eq!(decision.context.tracking_id.as_deref(), Some("TRK-9F3A"));
    }

    #[test]
    fn test_unmatched_query_is_ambiguous() {
        let err = router()
            .route(&Query::new("hum a little tune"), IsoWeek::new(2024, 20))
            .unwrap_err();
        assert!(matches!(err, RouteError::AmbiguousFlow));
    }

    #[test]
    fn test_capability_backed_query_falls_through_to_dynamic() {
        let decision = router()
            .route(
                &Query::new("roll a weekly dataframe summary"),
                IsoWeek::new(2024, 20),
            )
            .unwrap();
        assert_eq!(decision.flow, FlowKind::Dynamic);
        assert!(decision
            .suggested_tools
            .iter()
            .any(|m| m.tool == "pandas"));
    }

    #[test]
    fn test_route_is_stable_for_fixed_current_week() {
        let query = Query::new("Plot sales for the last 4 weeks");
        let week = IsoWeek::new(2024, 20);
        let first = router().route(&query, week).unwrap();
        let second = router().route(&query, week).unwrap();
        assert_eq!(first.flow, second.flow);
        assert_eq!(first.context, second.context);
    }
}
