//! Matomo outlink collection for reuses, rolled up per organization.

use crate::catalog::CatalogSnapshot;
use crate::config::MatomoConfig;
use crate::constants::METRIC_DATE_FORMAT;
use crate::error::{MetricsError, Result};
use crate::observability::MatomoMetrics;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReuseOutlink {
    pub reuse_id: String,
    pub organization_id: Option<String>,
    pub nb_outlink: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganizationOutlink {
    pub organization_id: String,
    pub nb_outlink: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutlinkReport {
    pub date: Option<NaiveDate>,
    pub reuses: Vec<ReuseOutlink>,
    pub organizations: Vec<OrganizationOutlink>,
    pub queried: usize,
    pub skipped: usize,
    pub failures: usize,
}

/// One catalog object's page and the external URL it links to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlinkTarget {
    pub object_type: String,
    pub slug: String,
    pub url: String,
}

impl OutlinkTarget {
    /// Path fragment identifying the object's page, e.g. `/reuses/my-reuse/`.
    pub fn page_path(&self) -> String {
        format!("/{}/{}/", self.object_type, self.slug)
    }
}

/// Source of outbound click counts from one object's page on one day.
#[async_trait]
pub trait OutlinkSource: Send + Sync {
    async fn outlink_count(&self, target: &OutlinkTarget, date: NaiveDate) -> Result<u64>;
}

pub struct MatomoClient {
    client: reqwest::Client,
    base_url: String,
    site_id: u32,
    token: Option<String>,
}

impl MatomoClient {
    pub fn new(client: reqwest::Client, config: &MatomoConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            site_id: config.site_id,
            token: config.token.clone(),
        }
    }
}

/// Sum `nb_hits` over the rows of an `Actions.getOutlink` response.
pub fn sum_outlink_hits(body: &Value) -> Result<u64> {
    match body {
        Value::Array(rows) => Ok(rows
            .iter()
            .filter_map(|row| row.get("nb_hits"))
            .filter_map(|hits| hits.as_u64().or_else(|| hits.as_str()?.parse().ok()))
            .sum()),
        Value::Object(obj) if obj.get("result").and_then(Value::as_str) == Some("error") => {
            Err(MetricsError::Matomo {
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        }
        other => Err(MetricsError::Matomo {
            message: format!("unexpected response: {}", other),
        }),
    }
}

#[async_trait]
impl OutlinkSource for MatomoClient {
    async fn outlink_count(&self, target: &OutlinkTarget, date: NaiveDate) -> Result<u64> {
        let date = date.format(METRIC_DATE_FORMAT).to_string();
        let site_id = self.site_id.to_string();
        let segment = format!("pageUrl=@{}", target.page_path());
        let mut query = vec![
            ("module", "API"),
            ("method", "Actions.getOutlink"),
            ("idSite", site_id.as_str()),
            ("period", "day"),
            ("date", date.as_str()),
            ("format", "JSON"),
            ("outlinkUrl", target.url.as_str()),
            ("segment", segment.as_str()),
        ];
        if let Some(token) = &self.token {
            query.push(("token_auth", token.as_str()));
        }
        let resp = self
            .client
            .get(format!("{}/index.php", self.base_url))
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        sum_outlink_hits(&body)
    }
}

pub struct OutlinkCollector {
    source: Arc<dyn OutlinkSource>,
    concurrency: usize,
    timeout: Duration,
    object_type: String,
    remote_url_attribute: String,
    organization_attribute: String,
}

impl OutlinkCollector {
    pub fn new(source: Arc<dyn OutlinkSource>, concurrency: usize, config: &MatomoConfig) -> Self {
        Self {
            source,
            concurrency: concurrency.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            object_type: config.object_type.clone(),
            remote_url_attribute: config.remote_url_attribute.clone(),
            organization_attribute: config.organization_attribute.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Query every reuse with a remote URL. Failed calls count as zero; a
    /// cancelled run aborts the in-flight calls and returns `Cancelled`.
    #[instrument(skip_all, fields(%date))]
    pub async fn collect(
        &self,
        reuses: &CatalogSnapshot,
        organizations: Option<&CatalogSnapshot>,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<OutlinkReport> {
        let mut rows: BTreeMap<String, ReuseOutlink> = BTreeMap::new();
        let mut targets: Vec<(String, OutlinkTarget)> = Vec::new();
        for entry in reuses.entries() {
            if rows.contains_key(&entry.id) {
                continue;
            }
            rows.insert(
                entry.id.clone(),
                ReuseOutlink {
                    reuse_id: entry.id.clone(),
                    organization_id: entry
                        .attribute(&self.organization_attribute)
                        .map(str::to_string),
                    nb_outlink: 0,
                },
            );
            if let Some(url) = entry.attribute(&self.remote_url_attribute) {
                targets.push((
                    entry.id.clone(),
                    OutlinkTarget {
                        object_type: self.object_type.clone(),
                        slug: entry.key.clone(),
                        url: url.to_string(),
                    },
                ));
            }
        }

        let mut report = OutlinkReport {
            date: Some(date),
            queried: targets.len(),
            skipped: rows.len() - targets.len(),
            ..Default::default()
        };
        MatomoMetrics::entries_skipped(report.skipped);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (reuse_id, target) in targets {
            let semaphore = semaphore.clone();
            let source = self.source.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (reuse_id, Err(MetricsError::Cancelled));
                };
                let started = Instant::now();
                let result = match tokio::time::timeout(timeout, source.outlink_count(&target, date)).await {
                    Ok(result) => result,
                    Err(_) => Err(MetricsError::Matomo {
                        message: format!("timed out after {:?} for {}", timeout, target.url),
                    }),
                };
                if result.is_ok() {
                    MatomoMetrics::request_success(started.elapsed().as_secs_f64());
                }
                (reuse_id, result)
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    warn!("Outlink collection cancelled");
                    return Err(MetricsError::Cancelled);
                }
                next = tasks.join_next() => match next {
                    None => break,
                    Some(Ok((reuse_id, Ok(count)))) => {
                        if let Some(row) = rows.get_mut(&reuse_id) {
                            row.nb_outlink = count;
                        }
                    }
                    Some(Ok((reuse_id, Err(e)))) => {
                        MatomoMetrics::request_error();
                        report.failures += 1;
                        warn!("Outlink query for reuse {} failed, counting zero: {}", reuse_id, e);
                    }
                    Some(Err(e)) => {
                        MatomoMetrics::request_error();
                        report.failures += 1;
                        warn!("Outlink task failed, counting zero: {}", e);
                    }
                },
            }
        }

        report.reuses = rows.into_values().collect();
        report.organizations = organization_totals(&report.reuses, organizations);
        info!(
            reuses = report.reuses.len(),
            queried = report.queried,
            failures = report.failures,
            "Collected outlinks"
        );
        Ok(report)
    }
}

/// Sum reuse outlinks per owning organization. Known organizations without
/// reuses are listed with zero.
pub fn organization_totals(
    reuses: &[ReuseOutlink],
    organizations: Option<&CatalogSnapshot>,
) -> Vec<OrganizationOutlink> {
    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    if let Some(orgs) = organizations {
        for entry in orgs.entries() {
            totals.entry(entry.id.clone()).or_default();
        }
    }
    for reuse in reuses {
        if let Some(org) = &reuse.organization_id {
            *totals.entry(org.clone()).or_default() += reuse.nb_outlink;
        }
    }
    totals
        .into_iter()
        .map(|(organization_id, nb_outlink)| OrganizationOutlink {
            organization_id,
            nb_outlink,
        })
        .collect()
}
