//! Intermediate per-(date, object type) event files.
//!
//! The parser appends to these as it goes and the aggregation step streams them
//! back, so a day's events never have to fit in memory.

use crate::constants::{FOUND_DIR, METRIC_DATE_FORMAT};
use crate::error::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// One parsed log event as stored on disk. The object type is the file it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundRecord {
    pub date_metric: String,
    pub key: String,
    pub segment: String,
}

pub fn date_dir(scratch: &Path, date: NaiveDate) -> PathBuf {
    scratch
        .join(FOUND_DIR)
        .join(date.format(METRIC_DATE_FORMAT).to_string())
}

pub fn found_path(scratch: &Path, date: NaiveDate, object_type: &str) -> PathBuf {
    date_dir(scratch, date).join(format!("found_{}.csv", object_type))
}

fn csv_writer(file: File) -> csv::Writer<File> {
    csv::WriterBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .from_writer(file)
}

/// Appends events for a single date, one file per object type.
pub struct FoundSink {
    dir: PathBuf,
    date_metric: String,
    writers: HashMap<String, csv::Writer<File>>,
}

impl FoundSink {
    pub fn open(scratch: &Path, date: NaiveDate) -> Result<Self> {
        let dir = date_dir(scratch, date);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            date_metric: date.format(METRIC_DATE_FORMAT).to_string(),
            writers: HashMap::new(),
        })
    }

    pub fn append(&mut self, object_type: &str, key: &str, segment: &str) -> Result<()> {
        if !self.writers.contains_key(object_type) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(format!("found_{}.csv", object_type)))?;
            self.writers.insert(object_type.to_string(), csv_writer(file));
        }
        if let Some(writer) = self.writers.get_mut(object_type) {
            writer.write_record([self.date_metric.as_str(), key, segment])?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Streams the records of one intermediate file.
pub fn read_found(path: &Path) -> Result<impl Iterator<Item = Result<FoundRecord>>> {
    let rdr = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .from_path(path)?;
    Ok(rdr
        .into_deserialize::<FoundRecord>()
        .map(|r| r.map_err(Into::into)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_across_sinks_for_the_same_date() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

        let mut sink = FoundSink::open(dir.path(), date).unwrap();
        sink.append("datasets", "abc", "fr").unwrap();
        sink.append("reuses", "my;reuse", "api1").unwrap();
        sink.finish().unwrap();

        let mut sink = FoundSink::open(dir.path(), date).unwrap();
        sink.append("datasets", "def", "root").unwrap();
        sink.finish().unwrap();

        let path = found_path(dir.path(), date, "datasets");
        assert!(path.ends_with("found/2024-01-01/found_datasets.csv"));
        let records: Vec<FoundRecord> = read_found(&path).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].key, "def");

        let reuses: Vec<FoundRecord> = read_found(&found_path(dir.path(), date, "reuses"))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(reuses[0].key, "my;reuse");
    }
}
