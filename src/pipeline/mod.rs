//! Run orchestration: claim archives, parse, aggregate, write, release.
//!
//! Archives are released only when every object type was written. Any type
//! failure leaves the claimed archives in `ongoing` for an operator to look at.

pub mod summary;

pub use summary::{RunSummary, TypeSummary};

use crate::aggregate::Aggregator;
use crate::catalog::{CatalogLoader, CatalogSnapshot, CatalogSource};
use crate::config::{Config, ObjectTypeConfig};
use crate::constants::{ARCHIVE_DIR, CATALOG_DIR, FOUND_DIR, MATOMO_DIR};
use crate::error::{MetricsError, Result};
use crate::found::{found_path, FoundRecord};
use crate::matomo::{OutlinkCollector, OutlinkReport, OutlinkSource};
use crate::notify::{send_notice, Notifier};
use crate::observability::AggregateMetrics;
use crate::parser::{LogParser, ParseStats};
use crate::queue::{ArchiveKey, LogQueue};
use crate::store::{MetricsStore, ReplaceOutcome, TableLayout};
use crate::taxonomy::SegmentTaxonomy;
use chrono::{NaiveDate, Utc};
use object_store::ObjectStore;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Result of aggregating and writing one (object type, date).
#[derive(Debug)]
struct PartitionOutcome {
    object_type: String,
    rows: usize,
    events: u64,
    dropped: u64,
    replaced: ReplaceOutcome,
}

pub struct Pipeline {
    config: Arc<Config>,
    queue: LogQueue,
    catalogs: CatalogLoader,
    matomo_catalogs: CatalogLoader,
    store: Arc<MetricsStore>,
    taxonomy: Arc<SegmentTaxonomy>,
    parser: Arc<LogParser>,
    layouts: BTreeMap<String, Arc<TableLayout>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        object_store: Arc<dyn ObjectStore>,
        catalog_source: Arc<dyn CatalogSource>,
        store: Arc<MetricsStore>,
    ) -> Self {
        let taxonomy = SegmentTaxonomy::new(&config.segments);
        let parser = LogParser::new(taxonomy.clone(), &config.object_types);
        let layouts = config
            .object_types
            .iter()
            .map(|t| (t.name.clone(), Arc::new(TableLayout::new(t, &taxonomy))))
            .collect();
        let catalogs = CatalogLoader::new(catalog_source.clone(), config.scratch_dir.join(CATALOG_DIR));
        let matomo_catalogs = CatalogLoader::new(
            catalog_source,
            config.scratch_dir.join(MATOMO_DIR).join(CATALOG_DIR),
        );
        Self {
            queue: LogQueue::new(object_store),
            catalogs,
            matomo_catalogs,
            store,
            taxonomy: Arc::new(taxonomy),
            parser: Arc::new(parser),
            layouts,
            notifier: None,
            config: Arc::new(config),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn layouts(&self) -> Vec<TableLayout> {
        self.layouts.values().map(|l| l.as_ref().clone()).collect()
    }

    /// Create every table the configured object types need.
    pub async fn init_db(&self) -> Result<()> {
        let layouts = self.layouts();
        self.with_store(move |store| store.ensure_tables(&layouts)).await
    }

    /// Run synchronous database work off the async workers.
    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&MetricsStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref())).await?
    }

    /// One full pass over the `new` archives.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::new();
        let result = self.run_inner(&mut summary).await;
        summary.finished_at = Some(Utc::now());
        match &result {
            Ok(()) => send_notice(self.notifier.as_deref(), &summary.to_message()).await,
            Err(e) => {
                error!("Run {} failed: {}", summary.run_id, e);
                let text = format!(
                    "Visit metrics run {} failed: {}\nClaimed archives stay in ongoing.",
                    summary.run_id, e
                );
                send_notice(self.notifier.as_deref(), &text).await;
            }
        }
        result.map(|()| summary)
    }

    #[instrument(skip_all, fields(run_id = %summary.run_id))]
    async fn run_inner(&self, summary: &mut RunSummary) -> Result<()> {
        let scratch = self.config.scratch_dir.clone();
        prepare_scratch(&scratch).await?;
        self.init_db().await?;

        let new = self.queue.list_new().await?;
        if new.is_empty() {
            info!("No new archives");
            return Ok(());
        }
        let claimed = self.queue.claim(&new).await?;
        summary.claimed = claimed.keys().map(|k| k.to_string()).collect();
        if claimed.is_empty() {
            return Ok(());
        }

        let snapshots = self.load_snapshots(summary).await;

        let mut by_date: BTreeMap<NaiveDate, Vec<PathBuf>> = BTreeMap::new();
        let archive_dir = scratch.join(ARCHIVE_DIR);
        for (key, location) in &claimed {
            let local = self.queue.download(location, &archive_dir).await?;
            by_date.entry(key.date()).or_default().push(local);
        }
        summary.dates = by_date.keys().copied().collect();

        summary.parse = self.parse_archives(by_date).await?;

        let dates: BTreeSet<NaiveDate> = summary.dates.iter().copied().collect();
        self.aggregate_and_write(&snapshots, &dates, summary).await?;

        for name in snapshots.keys() {
            if let Some(layout) = self.layouts.get(name).cloned() {
                self.with_store(move |store| store.refresh_monthly(&layout)).await?;
            }
        }

        if summary.is_success() {
            let keys: BTreeSet<ArchiveKey> = claimed.into_keys().collect();
            let released = self.queue.release(&keys).await?;
            summary.released = released.keys().map(|k| k.to_string()).collect();
            clear_intermediate(&scratch).await?;
        } else {
            warn!(
                "Leaving {} archives in ongoing: {} object types failed",
                claimed.len(),
                summary.type_failures.len()
            );
        }
        Ok(())
    }

    /// Fetch every snapshot; failures are recorded against their type only.
    async fn load_snapshots(&self, summary: &mut RunSummary) -> BTreeMap<String, Arc<CatalogSnapshot>> {
        let mut snapshots = BTreeMap::new();
        for (name, result) in self.catalogs.load_all(&self.config.object_types).await {
            match result {
                Ok(snapshot) => {
                    snapshots.insert(name, snapshot);
                }
                Err(e) => {
                    error!("Catalog for {} unusable, skipping type: {}", name, e);
                    AggregateMetrics::catalog_failure(&name);
                    summary.type_failures.insert(name, e.to_string());
                }
            }
        }
        snapshots
    }

    async fn parse_archives(&self, by_date: BTreeMap<NaiveDate, Vec<PathBuf>>) -> Result<ParseStats> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.parse));
        let mut tasks = JoinSet::new();
        for (date, archives) in by_date {
            let parser = self.parser.clone();
            let scratch = self.config.scratch_dir.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| MetricsError::Cancelled)?;
                let stats =
                    tokio::task::spawn_blocking(move || parser.parse_date(&scratch, date, &archives))
                        .await??;
                Ok::<ParseStats, MetricsError>(stats)
            });
        }

        let mut total = ParseStats::default();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(MetricsError::from).and_then(|r| r) {
                Ok(stats) => total.merge(&stats),
                Err(e) => {
                    error!("Parsing failed: {}", e);
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Aggregate and write every (type, date). Dates a type saw no events for
    /// are still rewritten, with no rows.
    async fn aggregate_and_write(
        &self,
        snapshots: &BTreeMap<String, Arc<CatalogSnapshot>>,
        dates: &BTreeSet<NaiveDate>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.aggregate));
        let mut tasks = JoinSet::new();

        for object_type in &self.config.object_types {
            let (Some(snapshot), Some(layout)) =
                (snapshots.get(&object_type.name), self.layouts.get(&object_type.name))
            else {
                continue;
            };
            summary.types.insert(
                object_type.name.clone(),
                TypeSummary {
                    table: layout.table.clone(),
                    ..Default::default()
                },
            );
            for &date in dates {
                let job = PartitionJob {
                    object_type: object_type.clone(),
                    snapshot: snapshot.clone(),
                    layout: layout.clone(),
                    taxonomy: self.taxonomy.clone(),
                    store: self.store.clone(),
                    path: found_path(&self.config.scratch_dir, date, &object_type.name),
                    date,
                };
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| MetricsError::Cancelled)?;
                    job.execute().await
                });
            }
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(MetricsError::from).and_then(|r| r) {
                Ok(outcome) => {
                    if let Some(t) = summary.types.get_mut(&outcome.object_type) {
                        t.dates += 1;
                        t.rows += outcome.rows;
                        t.events += outcome.events;
                        t.dropped += outcome.dropped;
                        t.deleted += outcome.replaced.deleted;
                    }
                }
                Err(e) => {
                    error!("Writing metrics failed: {}", e);
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Collect yesterday's (or `date`'s) outlinks and replace that date in the
    /// Matomo tables. Nothing is written if the run is cancelled.
    pub async fn collect_outlinks(
        &self,
        source: Arc<dyn OutlinkSource>,
        date: Option<NaiveDate>,
        cancel: &CancellationToken,
    ) -> Result<OutlinkReport> {
        let matomo = self
            .config
            .matomo
            .as_ref()
            .ok_or_else(|| MetricsError::Config("no [matomo] section configured".to_string()))?;
        let date = date.unwrap_or_else(|| Utc::now().date_naive() - chrono::Duration::days(1));

        let reuses_type = self
            .config
            .object_type(&matomo.object_type)
            .ok_or_else(|| MetricsError::Config(format!("unknown object type '{}'", matomo.object_type)))?;
        let reuses = self.matomo_catalogs.load(reuses_type).await?;
        let organizations = match self.config.object_type(&matomo.organizations_type) {
            Some(t) => match self.matomo_catalogs.load(t).await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!("Organizations catalog unusable, only orgs with reuses are listed: {}", e);
                    None
                }
            },
            None => None,
        };

        let collector = OutlinkCollector::new(source, self.config.workers.matomo, matomo);
        let report = collector
            .collect(&reuses, organizations.as_deref(), date, cancel)
            .await?;

        let (report, outcome) = self
            .with_store(move |store| {
                store.ensure_tables(&[])?;
                let outcome = store.replace_matomo(date, &report.reuses, &report.organizations)?;
                Ok((report, outcome))
            })
            .await?;
        info!(
            %date,
            inserted = outcome.inserted,
            failures = report.failures,
            "Stored outlinks"
        );
        let text = format!(
            "Matomo outlinks for {}: {} reuses, {} organizations, {} failed calls",
            date,
            report.reuses.len(),
            report.organizations.len(),
            report.failures
        );
        send_notice(self.notifier.as_deref(), &text).await;
        Ok(report)
    }
}

struct PartitionJob {
    object_type: ObjectTypeConfig,
    snapshot: Arc<CatalogSnapshot>,
    layout: Arc<TableLayout>,
    taxonomy: Arc<SegmentTaxonomy>,
    store: Arc<MetricsStore>,
    path: PathBuf,
    date: NaiveDate,
}

impl PartitionJob {
    async fn execute(self) -> Result<PartitionOutcome> {
        let Self {
            object_type,
            snapshot,
            layout,
            taxonomy,
            store,
            path,
            date,
        } = self;
        let name = object_type.name.clone();
        let partition = tokio::task::spawn_blocking(move || {
            let aggregator = Aggregator::new(&taxonomy, &object_type, &snapshot);
            if path.exists() {
                aggregator.aggregate_file(date, &path)
            } else {
                aggregator.aggregate(date, std::iter::empty::<Result<FoundRecord>>())
            }
        })
        .await??;

        let rows = partition.rows.len();
        let events = partition.events;
        let dropped = partition.dropped;
        let replaced = store.replace_partition(layout, partition).await?;
        Ok(PartitionOutcome {
            object_type: name,
            rows,
            events,
            dropped,
            replaced,
        })
    }
}

/// Start every run from empty run directories. The outlink command's
/// directory is left alone.
async fn prepare_scratch(scratch: &Path) -> Result<()> {
    for dir in [CATALOG_DIR, ARCHIVE_DIR, FOUND_DIR] {
        let path = scratch.join(dir);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_dir_all(&path).await?;
        }
    }
    tokio::fs::create_dir_all(scratch).await?;
    Ok(())
}

async fn clear_intermediate(scratch: &Path) -> Result<()> {
    for dir in [FOUND_DIR, ARCHIVE_DIR] {
        let path = scratch.join(dir);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_dir_all(&path).await?;
        }
    }
    Ok(())
}
