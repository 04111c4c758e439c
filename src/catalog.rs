//! Catalog snapshots: one delimited export per object type, reduced to a
//! natural-key lookup. Snapshots are downloaded and rebuilt on every run.

use crate::config::{CatalogConfig, ObjectTypeConfig};
use crate::error::{MetricsError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    /// Natural key as it appears in request paths
    pub key: String,
    /// Canonical attribute name -> value; empty values are left out
    pub attributes: BTreeMap<String, String>,
}

impl CatalogEntry {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

#[derive(Debug)]
pub struct CatalogSnapshot {
    entries: Vec<CatalogEntry>,
    by_key: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
}

impl CatalogSnapshot {
    pub fn load(object_type: &str, config: &CatalogConfig, path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(object_type, config, file)
    }

    /// Parse a snapshot, checking that every configured column is present.
    pub fn from_reader<R: Read>(object_type: &str, config: &CatalogConfig, reader: R) -> Result<Self> {
        if !config.delimiter.is_ascii() {
            return Err(MetricsError::Config(format!(
                "catalog delimiter for '{}' must be ASCII",
                object_type
            )));
        }
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(config.delimiter as u8)
            .flexible(true)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        let position = |column: &str| headers.iter().position(|h| h.trim() == column);

        let missing: Vec<String> = config
            .expected_columns()
            .into_iter()
            .filter(|c| position(c).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(MetricsError::SchemaMismatch {
                object_type: object_type.to_string(),
                missing,
            });
        }

        // Checked above
        let id_idx = position(&config.id_column).unwrap_or_default();
        let key_idx = position(&config.key.column).unwrap_or_default();
        let attr_idx: Vec<(String, usize)> = config
            .attributes
            .iter()
            .filter_map(|(name, column)| position(column).map(|i| (name.clone(), i)))
            .collect();

        let mut snapshot = Self {
            entries: Vec::new(),
            by_key: HashMap::new(),
            by_id: HashMap::new(),
        };
        let mut skipped = 0usize;

        for record in rdr.records() {
            let record = record?;
            let id = record.get(id_idx).unwrap_or("").trim();
            let key = config.key.derive(record.get(key_idx).unwrap_or(""));
            if id.is_empty() || key.is_empty() {
                skipped += 1;
                continue;
            }
            let attributes = attr_idx
                .iter()
                .filter_map(|(name, idx)| {
                    let value = record.get(*idx).unwrap_or("").trim();
                    (!value.is_empty()).then(|| (name.clone(), value.to_string()))
                })
                .collect();

            let idx = snapshot.entries.len();
            snapshot.entries.push(CatalogEntry {
                id: id.to_string(),
                key: key.clone(),
                attributes,
            });
            // Later rows win, same as a plain dict built from the export
            snapshot.by_key.insert(key, idx);
            snapshot.by_id.insert(id.to_string(), idx);
        }

        if skipped > 0 {
            warn!("{}: skipped {} catalog rows without id or key", object_type, skipped);
        }
        Ok(snapshot)
    }

    /// Look up a natural key from a request path. Paths may carry the slug
    /// or the catalog id, so the id is tried when the key misses.
    pub fn resolve(&self, key: &str) -> Option<&CatalogEntry> {
        self.by_key
            .get(key)
            .or_else(|| self.by_id.get(key))
            .map(|&idx| &self.entries[idx])
    }

    pub fn by_id(&self, id: &str) -> Option<&CatalogEntry> {
        self.by_id.get(id).map(|&idx| &self.entries[idx])
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Where snapshot files come from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

pub struct HttpCatalogSource {
    client: reqwest::Client,
}

impl HttpCatalogSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpCatalogSource {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MetricsError::CatalogDownload {
                object_type: url.to_string(),
                status: status.as_u16(),
            });
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

pub struct CatalogLoader {
    source: Arc<dyn CatalogSource>,
    dir: PathBuf,
}

impl CatalogLoader {
    pub fn new(source: Arc<dyn CatalogSource>, dir: PathBuf) -> Self {
        Self { source, dir }
    }

    /// Download and parse one object type's snapshot.
    #[instrument(skip(self, object_type), fields(object_type = %object_type.name))]
    pub async fn load(&self, object_type: &ObjectTypeConfig) -> Result<Arc<CatalogSnapshot>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let dest = self.dir.join(&object_type.catalog.file_name);
        self.source
            .fetch(&object_type.catalog.url, &dest)
            .await
            .map_err(|e| match e {
                MetricsError::CatalogDownload { status, .. } => MetricsError::CatalogDownload {
                    object_type: object_type.name.clone(),
                    status,
                },
                other => other,
            })?;

        let name = object_type.name.clone();
        let config = object_type.catalog.clone();
        let snapshot = tokio::task::spawn_blocking(move || CatalogSnapshot::load(&name, &config, &dest)).await??;
        info!("Loaded {} catalog keys", snapshot.len());
        Ok(Arc::new(snapshot))
    }

    /// Load every snapshot concurrently. A failure only affects its own type.
    pub async fn load_all(
        &self,
        object_types: &[ObjectTypeConfig],
    ) -> BTreeMap<String, Result<Arc<CatalogSnapshot>>> {
        let loads = object_types.iter().map(|t| async move { (t.name.clone(), self.load(t).await) });
        futures::future::join_all(loads).await.into_iter().collect()
    }
}
