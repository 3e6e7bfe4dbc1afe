use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

/// One cell as returned by the statistical source, verbatim. The source
/// client does not interpret suppression codes or units; the normalizer does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub region_id: String,
    pub year: i32,
    pub line_code: u32,
    /// Raw cell text, e.g. "1,234" or a suppression marker like "(D)".
    pub value: String,
    pub unit: String,
    /// Source-side footnote/status marker, passed through untouched.
    pub status_flag: Option<String>,
    /// Source-reported revision ordinal, when the payload carries one.
    /// Used to resolve duplicate cells; arrival order never is.
    pub revision: Option<u32>,
}

/// Canonical tidy row, unique per (region_id, year, line_code).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TidyObservation {
    pub region_id: String,
    pub year: i32,
    pub line_code: u32,
    pub value: Option<f64>,
    pub is_suppressed: bool,
}

/// One finalized entity row of the wide panel.
///
/// `component_values` holds exactly the configured component set; a missing
/// or suppressed input stays `None` rather than zero. `shares` are derived
/// per-component shares of the row total, published but not independently
/// fingerprinted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelRow {
    pub region_id: String,
    pub year: i32,
    pub component_values: BTreeMap<String, Option<f64>>,
    pub shares: BTreeMap<String, Option<f64>>,
    pub composite_index: Option<f64>,
}

/// Release maturity of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseTag {
    Provisional,
    Final,
}

impl ReleaseTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseTag::Provisional => "provisional",
            ReleaseTag::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provisional" => Some(ReleaseTag::Provisional),
            "final" => Some(ReleaseTag::Final),
            _ => None,
        }
    }
}

impl fmt::Display for ReleaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of one immutable archived snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub year: i32,
    pub release_tag: ReleaseTag,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub source_table_version: Option<String>,
    pub row_count: usize,
}

/// Outcome of a snapshot commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitResult {
    pub archived: bool,
    pub promoted: bool,
    pub content_hash: String,
}

/// Per-year component share statistics captured when the z-score composite
/// is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YearStats {
    pub year: i32,
    pub region_count: usize,
    pub share_means: BTreeMap<String, f64>,
    pub share_stddevs: BTreeMap<String, f64>,
}

/// Core trait every raw-data source must implement. Incremental pulls and
/// historical backfills go through the same interface, differing only in
/// `years`.
#[async_trait::async_trait]
pub trait SourceClient: Send + Sync {
    /// Unique identifier for this source.
    fn source_name(&self) -> &'static str;

    /// Fetch raw cells for a table over a region scope and year range.
    async fn fetch(
        &self,
        table: &str,
        region_scope: &str,
        years: RangeInclusive<i32>,
    ) -> Result<Vec<RawRecord>>;
}
