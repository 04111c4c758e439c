//! Fixed segment taxonomy, built once from configuration.
//!
//! Each segment is a request-path prefix with a category (web, static, api or
//! other) and an optional output column. The set of named columns is frozen
//! here so every table layout and every aggregated row agree on it.

use crate::config::{SegmentCategory, SegmentConfig};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub prefix: String,
    pub category: SegmentCategory,
    pub column: Option<String>,
}

impl Segment {
    pub fn counts_as_visit(&self) -> bool {
        matches!(self.category, SegmentCategory::Web | SegmentCategory::Static)
    }
}

#[derive(Debug, Clone)]
pub struct SegmentTaxonomy {
    segments: Vec<Segment>,
    by_name: HashMap<String, usize>,
    /// Index into the named columns for each segment, if it has one
    column_slot: Vec<Option<usize>>,
    columns: Vec<String>,
}

impl SegmentTaxonomy {
    pub fn new(configs: &[SegmentConfig]) -> Self {
        let mut segments = Vec::with_capacity(configs.len());
        let mut by_name = HashMap::new();
        let mut column_slot = Vec::with_capacity(configs.len());
        let mut columns = Vec::new();

        for (idx, cfg) in configs.iter().enumerate() {
            segments.push(Segment {
                name: cfg.name.clone(),
                prefix: cfg.prefix.clone(),
                category: cfg.category,
                column: cfg.column.clone(),
            });
            by_name.insert(cfg.name.clone(), idx);
            match &cfg.column {
                Some(col) => {
                    column_slot.push(Some(columns.len()));
                    columns.push(col.clone());
                }
                None => column_slot.push(None),
            }
        }

        Self {
            segments,
            by_name,
            column_slot,
            columns,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn get(&self, name: &str) -> Option<&Segment> {
        self.by_name.get(name).map(|&idx| &self.segments[idx])
    }

    /// Named-segment columns in table order.
    pub fn named_columns(&self) -> &[String] {
        &self.columns
    }

    /// Slot of the named column fed by `name`, if any.
    pub fn column_slot(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).and_then(|&idx| self.column_slot[idx])
    }

    /// First segment whose prefix starts `path`, with the rest of the path.
    pub fn match_path<'p>(&self, path: &'p str) -> Option<(&Segment, &'p str)> {
        self.segments
            .iter()
            .find_map(|seg| path.strip_prefix(seg.prefix.as_str()).map(|rest| (seg, rest)))
    }
}
