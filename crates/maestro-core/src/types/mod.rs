//! Core type definitions
//!
//! Query / Context / Plan / Run are the data backbone of the orchestrator:
//! a Query is routed into a (FlowKind, Context) pair, the planner turns that
//! pair into an immutable Plan, and each execution of a Plan is a Run.

mod plan;
mod run;
mod value;

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

pub use plan::{Plan, NodeKind, NodeSpec, DEFAULT_MAX_RETRIES, DEFAULT_NODE_TIMEOUT_MS};
pub use run::{NodeErrorInfo, NodeRun, NodeRunState, Run, RunState};
pub use value::Value;

/// The raw user request: free text plus an optional attached file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            file_path: None,
        }
    }

    pub fn with_file(text: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            file_path: Some(file_path.into()),
        }
    }
}

/// Workflow class a query is routed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Plot,
    PdfTracking,
    Dynamic,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowKind::Plot => "plot",
            FlowKind::PdfTracking => "pdf_tracking",
            FlowKind::Dynamic => "dynamic",
        };
        f.write_str(name)
    }
}

/// ISO-8601 week (Monday week start, week 1 contains the first Thursday).
///
/// Wire form is `YYYY-Www`, e.g. `2024-W17`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IsoWeek {
    pub year: i32,
    pub week: u32,
}

impl IsoWeek {
    pub fn new(year: i32, week: u32) -> Self {
        Self { year, week }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    /// The week containing the current UTC date.
    pub fn current() -> Self {
        Self::from_date(Utc::now().date_naive())
    }

    /// Walk back `n` weeks, crossing year boundaries per the ISO calendar.
    pub fn minus_weeks(self, n: u32) -> Option<Self> {
        let monday = NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon)?;
        let shifted = monday.checked_sub_signed(Duration::weeks(i64::from(n)))?;
        Some(Self::from_date(shifted))
    }
}

impl fmt::Display for IsoWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-W{:02}", self.year, self.week)
    }
}

impl FromStr for IsoWeek {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, week) = s
            .split_once("-W")
            .ok_or_else(|| format!("invalid ISO week '{}': expected YYYY-Www", s))?;
        let year: i32 = year
            .parse()
            .map_err(|_| format!("invalid ISO week year in '{}'", s))?;
        let week: u32 = week
            .parse()
            .map_err(|_| format!("invalid ISO week number in '{}'", s))?;
        if !(1..=53).contains(&week) {
            return Err(format!("ISO week number out of range in '{}'", s));
        }
        Ok(Self { year, week })
    }
}

impl Serialize for IsoWeek {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IsoWeek {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Structured fields the router recognizes in a query.
///
/// Unrecognized fields stay absent; consumers must not rely on null
/// sentinels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlet_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week_range: Option<(IsoWeek, IsoWeek)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_number: Option<String>,
}

impl Context {
    /// True when no extractor recognized anything.
    pub fn is_empty(&self) -> bool {
        self.outlet_id.is_none()
            && self.week_count.is_none()
            && self.week_range.is_none()
            && self.month_count.is_none()
            && self.file_path.is_none()
            && self.product_filter.is_none()
            && self.tracking_id.is_none()
            && self.invoice_number.is_none()
    }
}
