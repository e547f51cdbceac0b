//! Per-stream statistics and analysis results.

use super::{ErrType, Key, Severity};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rolling counters of a stream box.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub checks: i64,
    pub errors: i64,
    pub last_check: Option<DateTime<Utc>>,
    pub next_check: Option<DateTime<Utc>>,
}

/// Contiguous run of failed tasks of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrRange {
    pub from_tid: i64,
    pub to_tid: i64,
    pub occured: DateTime<Utc>,
    pub discontinued: DateTime<Utc>,
    pub err: ErrType,
}

impl ErrRange {
    pub fn duration(&self) -> chrono::Duration {
        self.discontinued - self.occured
    }
}

/// How far the analyzer has progressed through a stream history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPoint {
    pub tid: i64,
    pub occured: DateTime<Utc>,
    /// Range still open at the checkpoint.
    pub opened_range: Option<ErrRange>,
}

impl CheckPoint {
    pub fn starting_at(occured: DateTime<Utc>) -> Self {
        Self {
            tid: 0,
            occured,
            opened_range: None,
        }
    }
}

/// A problem found by the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub stream_key: Key,
    pub group: String,
    pub stream_name: String,
    pub title: String,
    pub body: String,
    pub error: ErrType,
    pub severity: Severity,
    pub range: ErrRange,
    /// The range was still open when the report was generated.
    pub ongoing: bool,
    pub generated: DateTime<Utc>,
}
