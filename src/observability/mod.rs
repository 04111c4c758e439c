//! Run metrics for the visit-metrics pipeline
//!
//! Each pipeline phase defines its own metrics in a dedicated submodule, so names
//! stay unique and every metric has one owner. The recorder is a Prometheus one:
//! scraped over HTTP when `METRICS_ADDR` is set, and pushed to a Pushgateway at
//! the end of a run when `PUSHGATEWAY_URL` is set.

pub mod aggregate;
pub mod matomo;
pub mod parser;
pub mod queue;
pub mod registry;
pub mod store;

pub use aggregate::AggregateMetrics;
pub use matomo::MatomoMetrics;
pub use parser::ParserMetrics;
pub use queue::QueueMetrics;
pub use store::StoreMetrics;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

static INIT: Once = Once::new();
static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent.
///
/// Must be called from within the tokio runtime when `METRICS_ADDR` is set,
/// since the HTTP exporter is spawned onto it.
pub fn init_metrics() {
    INIT.call_once(|| {
        let listen_addr = std::env::var("METRICS_ADDR").ok().and_then(|addr_str| {
            match addr_str.parse::<std::net::SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!("Invalid METRICS_ADDR '{}', HTTP exporter disabled", addr_str);
                    None
                }
            }
        });

        let recorder = match listen_addr {
            Some(addr) => match PrometheusBuilder::new().with_http_listener(addr).build() {
                Ok((recorder, exporter)) => {
                    tokio::spawn(exporter);
                    info!("Prometheus HTTP exporter listening on http://{}/metrics", addr);
                    recorder
                }
                Err(e) => {
                    warn!("Failed to build Prometheus exporter: {}", e);
                    return;
                }
            },
            // No listener: in-process recorder used for rendering and push
            None => PrometheusBuilder::new().build_recorder(),
        };

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                let _ = HANDLE.set(handle);
                registry::register_all_metrics();
            }
            Err(e) => warn!("Failed to install Prometheus recorder: {}", e),
        }
    });
}

/// Render the current metrics snapshot in Prometheus text format.
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// Trait for phase-specific metrics collections
pub trait PhaseMetrics {
    /// Register all metrics for this phase
    fn register_metrics();

    fn phase_name() -> &'static str;

    /// Documentation for all metrics in this phase
    fn metrics_documentation() -> Vec<MetricDoc>;
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
    #[allow(dead_code)]
    pub labels: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
}

/// Builds metric names as `catalog_metrics_{phase}_{name}[_total]`
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("catalog_metrics_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("catalog_metrics_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("catalog_metrics_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;

/// Push the rendered snapshot to a Pushgateway.
///
/// Env:
/// - PUSHGATEWAY_URL: base URL to Pushgateway (e.g., http://localhost:9091)
pub async fn push_to_pushgateway(job: &str, instance: &str) {
    let base = match std::env::var("PUSHGATEWAY_URL") {
        Ok(v) if !v.trim().is_empty() => v,
        _ => {
            info!("pushgateway: PUSHGATEWAY_URL not configured, skipping push");
            return;
        }
    };
    let Some(body) = render() else {
        warn!("pushgateway: no recorder installed, skipping push");
        return;
    };

    let push_url = format!(
        "{}/metrics/job/{}/instance/{}",
        base.trim_end_matches('/'),
        job,
        instance
    );

    let client = reqwest::Client::new();
    match client
        .put(&push_url)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .send()
        .await
    {
        Ok(r) if r.status().is_success() => {
            info!("pushgateway: pushed metrics for job={} instance={}", job, instance);
        }
        Ok(r) => {
            warn!(
                "pushgateway: push failed with status={} for instance={}",
                r.status().as_u16(),
                instance
            );
        }
        Err(e) => {
            warn!("pushgateway: push request failed: {} for instance={}", e, instance);
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_metric_naming_convention() {
        assert_eq!(
            phase_metric!(counter, "parser", "lines_unparsed"),
            "catalog_metrics_parser_lines_unparsed_total"
        );
        assert_eq!(
            phase_metric!(histogram, "store", "replace_duration_seconds"),
            "catalog_metrics_store_replace_duration_seconds"
        );
        assert_eq!(
            phase_metric!(gauge, "queue", "archives_stuck"),
            "catalog_metrics_queue_archives_stuck"
        );
    }
}
