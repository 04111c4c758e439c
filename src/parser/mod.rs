//! Access log parsing.
//!
//! Lines are classified by request path: the segment taxonomy picks the first
//! matching prefix, then the object-type routes configured for that segment
//! extract the natural key. Matching events go straight to the per-date
//! intermediate files.

use crate::config::{KeyExtraction, ObjectTypeConfig};
use crate::error::Result;
use crate::found::FoundSink;
use crate::observability::ParserMetrics;
use crate::taxonomy::SegmentTaxonomy;
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, instrument};

static REQUEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[A-Z]+ (\S+) HTTP/[0-9.]+""#).unwrap());

/// A line classified into an object type, not yet resolved against a catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub object_type: &'a str,
    pub key: &'a str,
    pub segment: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub archives: u64,
    pub lines: u64,
    pub events: u64,
    pub unparsed: u64,
    pub events_by_type: BTreeMap<String, u64>,
}

impl ParseStats {
    pub fn merge(&mut self, other: &ParseStats) {
        self.archives += other.archives;
        self.lines += other.lines;
        self.events += other.events;
        self.unparsed += other.unparsed;
        for (object_type, count) in &other.events_by_type {
            *self.events_by_type.entry(object_type.clone()).or_default() += count;
        }
    }
}

#[derive(Debug)]
struct Route {
    object_type: String,
    segments: HashSet<String>,
    path: String,
    key: KeyExtraction,
}

/// Request path of an access log line, without query string or fragment.
pub fn request_path(line: &str) -> Option<&str> {
    let path = REQUEST.captures(line)?.get(1)?.as_str();
    let end = path.find(['?', '#']).unwrap_or(path.len());
    Some(&path[..end])
}

fn extract_key(rest: &str, rule: KeyExtraction) -> Option<&str> {
    let key = match rule {
        KeyExtraction::FirstComponent => rest.split('/').next().unwrap_or(""),
        KeyExtraction::Remainder => rest,
    };
    (!key.is_empty()).then_some(key)
}

#[derive(Debug)]
pub struct LogParser {
    taxonomy: SegmentTaxonomy,
    routes: Vec<Route>,
}

impl LogParser {
    pub fn new(taxonomy: SegmentTaxonomy, object_types: &[ObjectTypeConfig]) -> Self {
        let routes = object_types
            .iter()
            .flat_map(|t| {
                t.routes.iter().map(move |r| Route {
                    object_type: t.name.clone(),
                    segments: r.segments.iter().cloned().collect(),
                    path: r.path.clone(),
                    key: r.key,
                })
            })
            .collect();
        Self { taxonomy, routes }
    }

    /// Classify a request path. The first segment whose prefix matches decides,
    /// even if none of its routes then match.
    pub fn classify<'a>(&'a self, path: &'a str) -> Option<ParsedLine<'a>> {
        let (segment, rest) = self.taxonomy.match_path(path)?;
        self.routes
            .iter()
            .filter(|route| route.segments.contains(&segment.name))
            .find_map(|route| {
                let tail = rest.strip_prefix(route.path.as_str())?;
                let key = extract_key(tail, route.key)?;
                Some(ParsedLine {
                    object_type: &route.object_type,
                    key,
                    segment: &segment.name,
                })
            })
    }

    pub fn parse_line<'a>(&'a self, line: &'a str) -> Option<ParsedLine<'a>> {
        self.classify(request_path(line)?)
    }

    /// Stream every line of `reader` into `sink`.
    pub fn parse_reader<R: BufRead>(
        &self,
        mut reader: R,
        sink: &mut FoundSink,
        stats: &mut ParseStats,
    ) -> Result<()> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let raw = buf.strip_suffix(b"\n").unwrap_or(&buf);
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }
            stats.lines += 1;
            let parsed = std::str::from_utf8(raw).ok().and_then(|line| self.parse_line(line));
            match parsed {
                Some(event) => {
                    sink.append(event.object_type, event.key, event.segment)?;
                    stats.events += 1;
                    *stats
                        .events_by_type
                        .entry(event.object_type.to_string())
                        .or_default() += 1;
                }
                None => stats.unparsed += 1,
            }
        }
        Ok(())
    }

    /// Stream a `.tar.gz` archive. Members ending in `.gz` are decompressed too.
    #[instrument(skip(self, sink), fields(archive = %path.display()))]
    pub fn parse_archive(&self, path: &Path, sink: &mut FoundSink) -> Result<ParseStats> {
        let started = Instant::now();
        let mut stats = ParseStats {
            archives: 1,
            ..Default::default()
        };
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));
        for entry in archive.entries()? {
            let entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            debug!("Reading archive member {}", name);
            let reader: Box<dyn Read + '_> = if name.ends_with(".gz") {
                Box::new(GzDecoder::new(entry))
            } else {
                Box::new(entry)
            };
            self.parse_reader(BufReader::new(reader), sink, &mut stats)?;
        }

        ParserMetrics::record_archive(
            stats.lines,
            stats.events,
            stats.unparsed,
            started.elapsed().as_secs_f64(),
        );
        info!(
            lines = stats.lines,
            events = stats.events,
            unparsed = stats.unparsed,
            "Parsed archive"
        );
        Ok(stats)
    }

    /// Parse all archives of one date into the intermediate files under `scratch`.
    pub fn parse_date<P: AsRef<Path>>(
        &self,
        scratch: &Path,
        date: NaiveDate,
        archives: &[P],
    ) -> Result<ParseStats> {
        let mut sink = FoundSink::open(scratch, date)?;
        let mut total = ParseStats::default();
        for archive in archives {
            let stats = self.parse_archive(archive.as_ref(), &mut sink)?;
            total.merge(&stats);
        }
        sink.finish()?;
        Ok(total)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::Config;
    use crate::found::{found_path, read_found};
    use flate2::write::GzEncoder;
    use flate2::Compression;

    pub(crate) fn sample_parser() -> LogParser {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        LogParser::new(SegmentTaxonomy::new(&config.segments), &config.object_types)
    }

    pub(crate) fn log_line(path: &str) -> String {
        format!(
            r#"203.0.113.7 - - [01/Jan/2024:10:00:00 +0100] "GET {} HTTP/1.1" 200 512 "-" "curl/8.0""#,
            path
        )
    }

    /// Build a `.tar.gz` with one member per (name, contents).
    pub(crate) fn write_archive(path: &Path, members: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, contents) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn extracts_request_path_without_query() {
        let line = log_line("/fr/datasets/abc/?page=2#top");
        assert_eq!(request_path(&line), Some("/fr/datasets/abc/"));
        assert_eq!(request_path("garbage"), None);
    }

    #[test]
    fn classifies_paths_through_segments_and_routes() {
        let parser = sample_parser();

        let web = parser.classify("/fr/datasets/abc/").unwrap();
        assert_eq!((web.object_type, web.key, web.segment), ("datasets", "abc", "fr"));

        let api = parser.classify("/api/1/datasets/abc/resources/").unwrap();
        assert_eq!((api.key, api.segment), ("abc", "api1"));

        let other = parser.classify("/datasets/abc").unwrap();
        assert_eq!(other.segment, "root");

        let resource = parser.classify("/resources/ds/20240101-000000/file.csv").unwrap();
        assert_eq!(resource.object_type, "resources");
        assert_eq!(resource.key, "ds/20240101-000000/file.csv");

        assert!(parser.classify("/fr/datasets/").is_none());
        assert!(parser.classify("/fr/organizations/acme/").is_none());
        assert!(parser.classify("/resources/").is_none());
    }

    #[test]
    fn streams_archive_into_intermediate_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("haproxy-01012024.tar.gz");
        let access = [
            log_line("/fr/datasets/abc/"),
            log_line("/api/1/datasets/abc/"),
            log_line("/unknown/path"),
            "not a log line".to_string(),
        ]
        .join("\n");
        write_archive(&archive, &[("access.log", &access)]);

        let parser = sample_parser();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let stats = parser.parse_date(dir.path(), date, &[&archive]).unwrap();

        assert_eq!(stats.archives, 1);
        assert_eq!(stats.lines, 4);
        assert_eq!(stats.events, 2);
        assert_eq!(stats.unparsed, 2);
        assert_eq!(stats.events_by_type["datasets"], 2);

        let segments: Vec<String> = read_found(&found_path(dir.path(), date, "datasets"))
            .unwrap()
            .map(|r| r.unwrap().segment)
            .collect();
        assert_eq!(segments, ["fr", "api1"]);
    }

    #[test]
    fn invalid_utf8_counts_as_unparsed() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut sink = FoundSink::open(dir.path(), date).unwrap();
        let mut stats = ParseStats::default();
        let input: &[u8] = b"\xff\xfe broken\r\n\n";
        sample_parser()
            .parse_reader(BufReader::new(input), &mut sink, &mut stats)
            .unwrap();
        assert_eq!((stats.lines, stats.unparsed, stats.events), (1, 1, 0));
    }
}
