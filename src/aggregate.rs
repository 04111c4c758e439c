//! Aggregation of intermediate event files into per-date metric rows.

use crate::catalog::CatalogSnapshot;
use crate::config::{ObjectTypeConfig, SegmentCategory};
use crate::error::Result;
use crate::found::{read_found, FoundRecord};
use crate::observability::AggregateMetrics;
use crate::taxonomy::SegmentTaxonomy;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedMetricRow {
    pub date: NaiveDate,
    pub id: String,
    /// Values for the object type's extra columns, in configured order
    pub attributes: Vec<Option<String>>,
    pub nb_visit_static: u64,
    pub nb_visit: u64,
    pub nb_visit_apis: u64,
    pub nb_visit_total: u64,
    /// One count per named segment column, in taxonomy order
    pub named: Vec<u64>,
}

/// Rows for one (object type, date).
#[derive(Debug, Clone, Serialize)]
pub struct Partition {
    pub object_type: String,
    pub date: NaiveDate,
    pub rows: Vec<AggregatedMetricRow>,
    pub events: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Default)]
struct Counts {
    nb_visit_static: u64,
    nb_visit: u64,
    nb_visit_apis: u64,
    nb_visit_total: u64,
    named: Vec<u64>,
}

impl Counts {
    fn record(&mut self, taxonomy: &SegmentTaxonomy, segment: &str) {
        self.nb_visit_total += 1;
        let Some(seg) = taxonomy.get(segment) else {
            return;
        };
        if seg.counts_as_visit() {
            self.nb_visit += 1;
        }
        match seg.category {
            SegmentCategory::Static => self.nb_visit_static += 1,
            SegmentCategory::Api => self.nb_visit_apis += 1,
            SegmentCategory::Web | SegmentCategory::Other => {}
        }
        if let Some(slot) = taxonomy.column_slot(segment) {
            self.named[slot] += 1;
        }
    }
}

pub struct Aggregator<'a> {
    taxonomy: &'a SegmentTaxonomy,
    object_type: &'a ObjectTypeConfig,
    snapshot: &'a CatalogSnapshot,
}

impl<'a> Aggregator<'a> {
    pub fn new(
        taxonomy: &'a SegmentTaxonomy,
        object_type: &'a ObjectTypeConfig,
        snapshot: &'a CatalogSnapshot,
    ) -> Self {
        Self {
            taxonomy,
            object_type,
            snapshot,
        }
    }

    /// Group events by catalog id. Keys missing from the snapshot are dropped.
    pub fn aggregate<I>(&self, date: NaiveDate, records: I) -> Result<Partition>
    where
        I: IntoIterator<Item = Result<FoundRecord>>,
    {
        let width = self.taxonomy.named_columns().len();
        let mut groups: BTreeMap<&str, Counts> = BTreeMap::new();
        let mut events = 0u64;
        let mut dropped = 0u64;

        for record in records {
            let record = record?;
            let Some(entry) = self.snapshot.resolve(&record.key) else {
                dropped += 1;
                continue;
            };
            events += 1;
            groups
                .entry(entry.id.as_str())
                .or_insert_with(|| Counts {
                    named: vec![0; width],
                    ..Default::default()
                })
                .record(self.taxonomy, &record.segment);
        }

        let rows: Vec<AggregatedMetricRow> = groups
            .into_iter()
            .map(|(id, counts)| {
                let entry = self.snapshot.by_id(id);
                let attributes = self
                    .object_type
                    .extra_columns
                    .iter()
                    .map(|col| entry.and_then(|e| e.attribute(col)).map(str::to_string))
                    .collect();
                AggregatedMetricRow {
                    date,
                    id: id.to_string(),
                    attributes,
                    nb_visit_static: counts.nb_visit_static,
                    nb_visit: counts.nb_visit,
                    nb_visit_apis: counts.nb_visit_apis,
                    nb_visit_total: counts.nb_visit_total,
                    named: counts.named,
                }
            })
            .collect();

        AggregateMetrics::record_partition(&self.object_type.name, events, dropped, rows.len());
        Ok(Partition {
            object_type: self.object_type.name.clone(),
            date,
            rows,
            events,
            dropped,
        })
    }

    /// Stream one intermediate file.
    #[instrument(skip_all, fields(object_type = %self.object_type.name, %date))]
    pub fn aggregate_file(&self, date: NaiveDate, path: &Path) -> Result<Partition> {
        let partition = self.aggregate(date, read_found(path)?)?;
        info!(
            rows = partition.rows.len(),
            events = partition.events,
            dropped = partition.dropped,
            "Aggregated partition"
        );
        Ok(partition)
    }
}
