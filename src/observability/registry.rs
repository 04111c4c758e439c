//! Registration of all phase metrics, with early detection of name conflicts

use super::{MetricDoc, PhaseMetrics};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Register all metrics from all phases
pub fn register_all_metrics() {
    let mut all_metrics = HashMap::new();

    register_phase_metrics::<super::queue::QueueMetrics>(&mut all_metrics);
    register_phase_metrics::<super::parser::ParserMetrics>(&mut all_metrics);
    register_phase_metrics::<super::aggregate::AggregateMetrics>(&mut all_metrics);
    register_phase_metrics::<super::store::StoreMetrics>(&mut all_metrics);
    register_phase_metrics::<super::matomo::MatomoMetrics>(&mut all_metrics);

    info!(
        "Registered {} total metrics across all phases",
        all_metrics.len()
    );
}

fn register_phase_metrics<T: PhaseMetrics>(all_metrics: &mut HashMap<String, MetricDoc>) {
    T::register_metrics();
    let phase_name = T::phase_name();

    for doc in T::metrics_documentation() {
        if extract_phase_from_metric_name(doc.name) != phase_name {
            warn!("Metric '{}' is registered by phase '{}' but named for another", doc.name, phase_name);
        }
        if let Some(existing) = all_metrics.get(doc.name) {
            warn!(
                "Metric name conflict detected: '{}' ({}) redefined by phase '{}'",
                doc.name, existing.help, phase_name
            );
        } else {
            debug!("metric {} ({:?}): {}", doc.name, doc.metric_type, doc.help);
            all_metrics.insert(doc.name.to_string(), doc);
        }
    }
}

/// Extract phase name from metric name (e.g., "catalog_metrics_queue_archives_claimed_total" -> "queue")
pub fn extract_phase_from_metric_name(metric_name: &str) -> &str {
    if let Some(stripped) = metric_name.strip_prefix("catalog_metrics_") {
        if let Some(next_underscore) = stripped.find('_') {
            return &stripped[..next_underscore];
        }
    }
    "unknown"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{AggregateMetrics, MatomoMetrics, ParserMetrics, QueueMetrics, StoreMetrics};

    #[test]
    fn test_extract_phase_from_metric_name() {
        assert_eq!(
            extract_phase_from_metric_name("catalog_metrics_queue_archives_claimed_total"),
            "queue"
        );
        assert_eq!(
            extract_phase_from_metric_name("catalog_metrics_parser_lines_unparsed_total"),
            "parser"
        );
        assert_eq!(extract_phase_from_metric_name("invalid_metric_name"), "unknown");
    }

    #[test]
    fn every_documented_metric_belongs_to_its_phase() {
        fn check<T: PhaseMetrics>() {
            for doc in T::metrics_documentation() {
                assert_eq!(extract_phase_from_metric_name(doc.name), T::phase_name());
            }
        }
        check::<QueueMetrics>();
        check::<ParserMetrics>();
        check::<AggregateMetrics>();
        check::<StoreMetrics>();
        check::<MatomoMetrics>();
    }
}
