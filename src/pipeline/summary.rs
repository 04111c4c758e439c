use crate::parser::ParseStats;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use uuid::Uuid;

/// Per object type totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeSummary {
    pub table: String,
    pub dates: usize,
    pub rows: usize,
    pub events: u64,
    pub dropped: u64,
    pub deleted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub claimed: Vec<String>,
    pub released: Vec<String>,
    pub dates: Vec<NaiveDate>,
    pub parse: ParseStats,
    pub types: BTreeMap<String, TypeSummary>,
    /// Object types that produced nothing, with the reason
    pub type_failures: BTreeMap<String, String>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            claimed: Vec::new(),
            released: Vec::new(),
            dates: Vec::new(),
            parse: ParseStats::default(),
            types: BTreeMap::new(),
            type_failures: BTreeMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.type_failures.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.types.values().map(|t| t.rows).sum()
    }

    /// Short text for the run notice.
    pub fn to_message(&self) -> String {
        let mut msg = String::new();
        let status = if self.is_success() { "done" } else { "finished with failures" };
        let _ = writeln!(msg, "Visit metrics run {} {}", self.run_id, status);
        let _ = writeln!(
            msg,
            "- archives: {} claimed, {} released",
            self.claimed.len(),
            self.released.len()
        );
        if !self.dates.is_empty() {
            let dates: Vec<String> = self.dates.iter().map(|d| d.to_string()).collect();
            let _ = writeln!(msg, "- dates: {}", dates.join(", "));
        }
        let _ = writeln!(
            msg,
            "- lines: {} read, {} events, {} unparsed",
            self.parse.lines, self.parse.events, self.parse.unparsed
        );
        for t in self.types.values() {
            let _ = writeln!(
                msg,
                "- {}: {} rows over {} dates ({} events, {} unknown keys dropped)",
                t.table, t.rows, t.dates, t.events, t.dropped
            );
        }
        for (name, reason) in &self.type_failures {
            let _ = writeln!(msg, "- FAILED {}: {}", name, reason);
        }
        msg.trim_end().to_string()
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_lists_failures() {
        let mut summary = RunSummary::new();
        summary.claimed.push("haproxy-01012024.tar.gz".to_string());
        summary.type_failures.insert(
            "reuses".to_string(),
            "Catalog snapshot for 'reuses' is missing columns: [\"slug\"]".to_string(),
        );
        assert!(!summary.is_success());
        let msg = summary.to_message();
        assert!(msg.contains("finished with failures"));
        assert!(msg.contains("1 claimed, 0 released"));
        assert!(msg.contains("FAILED reuses"));
    }
}
