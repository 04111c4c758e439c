//! Log line parser metrics

use super::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct ParserMetrics;

impl ParserMetrics {
    pub fn record_archive(lines: u64, events: u64, unparsed: u64, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "parser", "archives_parsed")).increment(1);
        ::metrics::counter!(phase_metric!(counter, "parser", "lines_read")).increment(lines);
        ::metrics::counter!(phase_metric!(counter, "parser", "events_found")).increment(events);
        ::metrics::counter!(phase_metric!(counter, "parser", "lines_unparsed")).increment(unparsed);
        ::metrics::histogram!(phase_metric!(histogram, "parser", "archive_duration_seconds"))
            .record(duration_secs);
    }
}

impl PhaseMetrics for ParserMetrics {
    fn register_metrics() {
        let _ = ::metrics::counter!(phase_metric!(counter, "parser", "archives_parsed"));
        let _ = ::metrics::counter!(phase_metric!(counter, "parser", "lines_read"));
        let _ = ::metrics::counter!(phase_metric!(counter, "parser", "events_found"));
        let _ = ::metrics::counter!(phase_metric!(counter, "parser", "lines_unparsed"));
        let _ = ::metrics::histogram!(phase_metric!(histogram, "parser", "archive_duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "parser"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "parser", "archives_parsed"),
                metric_type: MetricType::Counter,
                help: "Archives streamed through the parser",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "parser", "lines_read"),
                metric_type: MetricType::Counter,
                help: "Raw log lines read from archives",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "parser", "events_found"),
                metric_type: MetricType::Counter,
                help: "Lines classified into a catalog object event",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "parser", "lines_unparsed"),
                metric_type: MetricType::Counter,
                help: "Lines that matched no segment or route, or were not valid UTF-8",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(histogram, "parser", "archive_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time spent parsing one archive",
                labels: vec![],
            },
        ]
    }
}
