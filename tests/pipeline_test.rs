use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use catalog_metrics::catalog::CatalogSource;
use catalog_metrics::matomo::{OutlinkSource, OutlinkTarget};
use catalog_metrics::queue::{ArchiveStatus, LogQueue};
use catalog_metrics::store::MetricsStore;
use catalog_metrics::{Config, Pipeline};
use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

const DATASETS_CSV: &str = "id;slug;title;organization_id\n42;abc;ABC;org-1\n43;def;DEF;org-2\n";
const REUSES_CSV: &str = "id;slug;title;organization_id;remote_url\n\
                          r1;my-reuse;Mine;org-1;https://reuse.example/app\n\
                          r2;no-url;Other;org-1;\n";
const RESOURCES_CSV: &str = "id;url\nres-1;https://static.data.gouv.fr/resources/abc/file.csv\n";

fn config_toml(root: &Path) -> String {
    format!(
        r#"
scratch_dir = "{scratch}"
log_dir = "{logs}"

[storage]
kind = "local"
root = "{store}"

[database]
path = "{db}"

[workers]
parse = 2
aggregate = 2
matomo = 2

[[segments]]
name = "fr"
prefix = "/fr/"
category = "web"
column = "nb_visit_fr"

[[segments]]
name = "api1"
prefix = "/api/1/"
category = "api"
column = "nb_visit_api1"

[[segments]]
name = "resources"
prefix = "/resources/"
category = "static"
column = "nb_visit_resources"

[[segments]]
name = "root"
prefix = "/"
category = "other"

[[object_types]]
name = "datasets"
id_column = "dataset_id"
extra_columns = ["organization_id"]
[object_types.catalog]
url = "https://catalog.test/datasets.csv"
file_name = "datasets.csv"
id_column = "id"
key = {{ column = "slug" }}
attributes = {{ title = "title", organization_id = "organization_id" }}
[[object_types.routes]]
segments = ["fr", "api1", "root"]
path = "datasets/"

[[object_types]]
name = "reuses"
id_column = "reuse_id"
extra_columns = ["organization_id"]
[object_types.catalog]
url = "https://catalog.test/reuses.csv"
file_name = "reuses.csv"
id_column = "id"
key = {{ column = "slug" }}
attributes = {{ organization_id = "organization_id", remote_url = "remote_url" }}
[[object_types.routes]]
segments = ["fr", "api1"]
path = "reuses/"

[[object_types]]
name = "resources"
id_column = "resource_id"
[object_types.catalog]
url = "https://catalog.test/resources.csv"
file_name = "resources.csv"
id_column = "id"
key = {{ column = "url", strip_prefix = "https://static.data.gouv.fr/resources/" }}
[[object_types.routes]]
segments = ["resources"]
key = "remainder"

[matomo]
base_url = "https://stats.test"
site_id = 1
"#,
        scratch = root.join("scratch").display(),
        logs = root.join("logs").display(),
        store = root.join("store").display(),
        db = root.join("metrics.db").display(),
    )
}

struct FakeCatalogs(HashMap<String, String>);

impl FakeCatalogs {
    fn with_reuses(reuses: &str) -> Self {
        Self(HashMap::from([
            ("https://catalog.test/datasets.csv".to_string(), DATASETS_CSV.to_string()),
            ("https://catalog.test/reuses.csv".to_string(), reuses.to_string()),
            ("https://catalog.test/resources.csv".to_string(), RESOURCES_CSV.to_string()),
        ]))
    }
}

#[async_trait]
impl CatalogSource for FakeCatalogs {
    async fn fetch(&self, url: &str, dest: &Path) -> catalog_metrics::Result<()> {
        let body = self.0.get(url).cloned().unwrap_or_default();
        tokio::fs::write(dest, body).await?;
        Ok(())
    }
}

fn log_line(path: &str) -> String {
    format!(
        r#"198.51.100.4 - - [01/Jan/2024:08:00:00 +0100] "GET {} HTTP/1.1" 200 1024 "-" "Mozilla/5.0""#,
        path
    )
}

fn archive_bytes(lines: &[String]) -> Result<Bytes> {
    let contents = lines.join("\n");
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "access.log", contents.as_bytes())?;
    Ok(Bytes::from(builder.into_inner()?.finish()?))
}

fn day_one_lines() -> Vec<String> {
    vec![
        log_line("/fr/datasets/abc/"),
        log_line("/datasets/abc/"),
        log_line("/api/1/datasets/abc/?page=1"),
        log_line("/fr/datasets/ghost/"),
        log_line("/fr/reuses/my-reuse/"),
        log_line("/resources/abc/file.csv"),
        "-- truncated line --".to_string(),
    ]
}

struct Harness {
    dir: TempDir,
    objects: Arc<InMemory>,
}

impl Harness {
    fn new() -> Result<Self> {
        Ok(Self {
            dir: tempdir()?,
            objects: Arc::new(InMemory::new()),
        })
    }

    async fn enqueue(&self, name: &str, lines: &[String]) -> Result<()> {
        let path = ObjectPath::from(format!("metrics-logs/new/{}", name));
        self.objects.put(&path, archive_bytes(lines)?).await?;
        Ok(())
    }

    fn pipeline(&self, catalogs: FakeCatalogs) -> Result<Pipeline> {
        let config = Config::from_toml_str(&config_toml(self.dir.path()))?;
        config.validate()?;
        let store = Arc::new(MetricsStore::open(&config.database)?);
        Ok(Pipeline::new(config, self.objects.clone(), Arc::new(catalogs), store))
    }

    fn db(&self) -> Result<rusqlite::Connection> {
        Ok(rusqlite::Connection::open(self.dir.path().join("metrics.db"))?)
    }

    async fn keys_in(&self, status: ArchiveStatus) -> Result<usize> {
        let queue = LogQueue::new(self.objects.clone());
        Ok(queue.snapshot().await?.keys_in(status).len())
    }
}

type DatasetRow = (String, String, Option<String>, i64, i64, i64, i64, i64, i64, i64);

fn dataset_rows(conn: &rusqlite::Connection) -> Result<Vec<DatasetRow>> {
    let mut stmt = conn.prepare(
        "SELECT date_metric, dataset_id, organization_id, nb_visit_static, nb_visit, nb_visit_apis,
                nb_visit_total, nb_visit_fr, nb_visit_api1, nb_visit_resources
         FROM visits_datasets ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
                r.get(8)?,
                r.get(9)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[tokio::test]
async fn run_processes_new_archives_end_to_end() -> Result<()> {
    let harness = Harness::new()?;
    harness.enqueue("haproxy-01012024.tar.gz", &day_one_lines()).await?;

    let pipeline = harness.pipeline(FakeCatalogs::with_reuses(REUSES_CSV))?;
    let summary = pipeline.run().await?;

    assert!(summary.is_success());
    assert_eq!(summary.claimed, vec!["haproxy-01012024.tar.gz"]);
    assert_eq!(summary.released.len(), 1);
    assert_eq!(summary.dates, vec![NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()]);
    assert_eq!(summary.parse.lines, 7);
    assert_eq!(summary.parse.events, 6);
    assert_eq!(summary.parse.unparsed, 1);
    assert_eq!(summary.types["datasets"].dropped, 1);

    assert_eq!(harness.keys_in(ArchiveStatus::New).await?, 0);
    assert_eq!(harness.keys_in(ArchiveStatus::Ongoing).await?, 0);
    assert_eq!(harness.keys_in(ArchiveStatus::Processed).await?, 1);

    let conn = harness.db()?;
    assert_eq!(
        dataset_rows(&conn)?,
        vec![(
            "2024-01-01".to_string(),
            "42".to_string(),
            Some("org-1".to_string()),
            0,
            1,
            1,
            3,
            1,
            1,
            0
        )]
    );

    let (resource_id, statics): (String, i64) = conn.query_row(
        "SELECT resource_id, nb_visit_static FROM visits_resources",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    assert_eq!((resource_id.as_str(), statics), ("res-1", 1));

    let monthly: i64 = conn.query_row(
        "SELECT nb_visit_total FROM visits_datasets_monthly WHERE month = '2024-01'",
        [],
        |r| r.get(0),
    )?;
    assert_eq!(monthly, 3);
    Ok(())
}

#[tokio::test]
async fn reprocessing_a_date_gives_identical_rows() -> Result<()> {
    let harness = Harness::new()?;
    harness.enqueue("haproxy-01012024.tar.gz", &day_one_lines()).await?;
    harness.pipeline(FakeCatalogs::with_reuses(REUSES_CSV))?.run().await?;
    let first = dataset_rows(&harness.db()?)?;

    // Same logs delivered again under another name for the same day
    harness.enqueue("haproxy-01012024-replay.tar.gz", &day_one_lines()).await?;
    let summary = harness.pipeline(FakeCatalogs::with_reuses(REUSES_CSV))?.run().await?;
    let second = dataset_rows(&harness.db()?)?;

    assert_eq!(summary.types["datasets"].deleted, 1);
    assert_eq!(first, second);
    assert_eq!(harness.keys_in(ArchiveStatus::Processed).await?, 2);
    Ok(())
}

#[tokio::test]
async fn catalog_schema_mismatch_keeps_archives_ongoing() -> Result<()> {
    let harness = Harness::new()?;
    harness.enqueue("haproxy-02012024.tar.gz", &day_one_lines()).await?;

    let broken_reuses = "id;slug;organization_id\nr1;my-reuse;org-1\n";
    let summary = harness.pipeline(FakeCatalogs::with_reuses(broken_reuses))?.run().await?;

    assert!(!summary.is_success());
    assert!(summary.type_failures.contains_key("reuses"));
    assert!(summary.released.is_empty());
    assert_eq!(harness.keys_in(ArchiveStatus::Ongoing).await?, 1);

    let conn = harness.db()?;
    let datasets: i64 = conn.query_row("SELECT COUNT(*) FROM visits_datasets", [], |r| r.get(0))?;
    let reuses: i64 = conn.query_row("SELECT COUNT(*) FROM visits_reuses", [], |r| r.get(0))?;
    assert_eq!((datasets, reuses), (1, 0));
    Ok(())
}

#[tokio::test]
async fn empty_queue_is_a_no_op() -> Result<()> {
    let harness = Harness::new()?;
    let summary = harness.pipeline(FakeCatalogs::with_reuses(REUSES_CSV))?.run().await?;
    assert!(summary.is_success());
    assert!(summary.claimed.is_empty());
    assert_eq!(summary.total_rows(), 0);
    Ok(())
}

#[derive(Default)]
struct FakeMatomo(Mutex<Vec<OutlinkTarget>>);

#[async_trait]
impl OutlinkSource for FakeMatomo {
    async fn outlink_count(&self, target: &OutlinkTarget, _date: NaiveDate) -> catalog_metrics::Result<u64> {
        self.0.lock().unwrap().push(target.clone());
        Ok(7)
    }
}

#[tokio::test]
async fn outlinks_are_stored_per_reuse_and_organization() -> Result<()> {
    let harness = Harness::new()?;
    let pipeline = harness.pipeline(FakeCatalogs::with_reuses(REUSES_CSV))?;
    let matomo = Arc::new(FakeMatomo::default());
    let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

    let report = pipeline
        .collect_outlinks(matomo.clone(), Some(date), &CancellationToken::new())
        .await?;
    assert_eq!(report.queried, 1);
    let calls = matomo.0.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "https://reuse.example/app");
    assert_eq!(calls[0].page_path(), "/reuses/my-reuse/");

    let conn = harness.db()?;
    let mut stmt = conn.prepare("SELECT reuse_id, nb_outlink FROM matomo_reuses ORDER BY reuse_id")?;
    let reuses = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    assert_eq!(reuses, vec![("r1".to_string(), 7), ("r2".to_string(), 0)]);

    let org_total: i64 = conn.query_row(
        "SELECT nb_outlink FROM matomo_organizations WHERE organization_id = 'org-1' AND date_metric = '2024-01-01'",
        [],
        |r| r.get(0),
    )?;
    assert_eq!(org_total, 7);
    Ok(())
}

#[tokio::test]
async fn cancelled_outlink_run_writes_nothing() -> Result<()> {
    let harness = Harness::new()?;
    let pipeline = harness.pipeline(FakeCatalogs::with_reuses(REUSES_CSV))?;
    pipeline.init_db().await?;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = pipeline
        .collect_outlinks(Arc::new(FakeMatomo::default()), None, &cancel)
        .await;
    assert!(matches!(result, Err(catalog_metrics::MetricsError::Cancelled)));

    let rows: i64 = harness
        .db()?
        .query_row("SELECT COUNT(*) FROM matomo_reuses", [], |r| r.get(0))?;
    assert_eq!(rows, 0);
    Ok(())
}

#[tokio::test]
async fn log_run_leaves_outlink_catalogs_alone() -> Result<()> {
    let harness = Harness::new()?;
    let pipeline = harness.pipeline(FakeCatalogs::with_reuses(REUSES_CSV))?;
    pipeline
        .collect_outlinks(Arc::new(FakeMatomo::default()), None, &CancellationToken::new())
        .await?;
    let outlink_snapshot = harness.dir.path().join("scratch/matomo/catalogs/reuses.csv");
    assert!(outlink_snapshot.exists());

    harness.enqueue("haproxy-01012024.tar.gz", &day_one_lines()).await?;
    let summary = pipeline.run().await?;
    assert!(summary.is_success());
    assert!(outlink_snapshot.exists());
    assert!(!harness.dir.path().join("scratch/found").exists());
    Ok(())
}
