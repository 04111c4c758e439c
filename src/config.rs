use crate::constants;
use crate::error::{MetricsError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

static SQL_IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap());

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Ordered segment taxonomy; the first matching prefix wins.
    pub segments: Vec<SegmentConfig>,
    pub object_types: Vec<ObjectTypeConfig>,
    pub matomo: Option<MatomoConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    Local {
        root: PathBuf,
    },
    /// Credentials are read from the usual `AWS_*` environment variables.
    S3 {
        bucket: String,
        endpoint: Option<String>,
        region: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub parse: usize,
    #[serde(default = "default_workers")]
    pub aggregate: usize,
    #[serde(default = "default_matomo_workers")]
    pub matomo: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parse: default_workers(),
            aggregate: default_workers(),
            matomo: default_matomo_workers(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentCategory {
    Web,
    Static,
    Api,
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentConfig {
    pub name: String,
    pub prefix: String,
    pub category: SegmentCategory,
    /// Output column for this segment. Segments without one only feed the category totals.
    pub column: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectTypeConfig {
    pub name: String,
    /// Defaults to `visits_<name>`.
    pub table: Option<String>,
    /// Name of the catalog identifier column in the output table.
    pub id_column: String,
    /// Catalog attributes copied into the output table after the id column.
    #[serde(default)]
    pub extra_columns: Vec<String>,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl ObjectTypeConfig {
    pub fn table_name(&self) -> String {
        self.table
            .clone()
            .unwrap_or_else(|| format!("{}{}", constants::VISITS_TABLE_PREFIX, self.name))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub url: String,
    pub file_name: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    pub id_column: String,
    pub key: KeyRule,
    /// Canonical attribute name -> source column.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl CatalogConfig {
    /// Every source column the snapshot must carry, in a stable order.
    pub fn expected_columns(&self) -> Vec<String> {
        let mut cols = vec![self.id_column.clone(), self.key.column.clone()];
        for source in self.attributes.values() {
            if !cols.contains(source) {
                cols.push(source.clone());
            }
        }
        cols
    }
}

/// How the natural key of a catalog row is derived.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyRule {
    pub column: String,
    #[serde(default)]
    pub strip_prefix: Option<String>,
}

impl KeyRule {
    pub fn derive(&self, raw: &str) -> String {
        let raw = raw.trim();
        match &self.strip_prefix {
            Some(prefix) => raw.strip_prefix(prefix.as_str()).unwrap_or(raw).to_string(),
            None => raw.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// Taxonomy segment names this route applies to.
    pub segments: Vec<String>,
    /// Path fragment following the segment prefix, e.g. `datasets/`.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub key: KeyExtraction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyExtraction {
    #[default]
    FirstComponent,
    Remainder,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatomoConfig {
    pub base_url: String,
    pub site_id: u32,
    #[serde(default = "default_matomo_object_type")]
    pub object_type: String,
    #[serde(default = "default_matomo_organizations_type")]
    pub organizations_type: String,
    #[serde(default = "default_remote_url_attribute")]
    pub remote_url_attribute: String,
    #[serde(default = "default_organization_attribute")]
    pub organization_attribute: String,
    #[serde(default = "default_matomo_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("tmp/metrics")
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    30_000
}

fn default_workers() -> usize {
    4
}

fn default_matomo_workers() -> usize {
    8
}

fn default_delimiter() -> char {
    ';'
}

fn default_matomo_object_type() -> String {
    "reuses".to_string()
}

fn default_matomo_organizations_type() -> String {
    "organizations".to_string()
}

fn default_remote_url_attribute() -> String {
    "remote_url".to_string()
}

fn default_organization_attribute() -> String {
    "organization_id".to_string()
}

fn default_matomo_timeout_secs() -> u64 {
    10
}

impl Config {
    /// Loads `config.toml` (or the given path), then applies environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MetricsError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(matomo) = self.matomo.as_mut() {
            matomo.token = std::env::var("MATOMO_TOKEN").ok().filter(|t| !t.is_empty());
        }
        if let Ok(url) = std::env::var("NOTIFY_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                self.notify.webhook_url = Some(url);
            }
        }
        if let Ok(db) = std::env::var("CATALOG_METRICS_DB") {
            if !db.trim().is_empty() {
                self.database.path = PathBuf::from(db);
            }
        }
    }

    pub fn object_type(&self, name: &str) -> Option<&ObjectTypeConfig> {
        self.object_types.iter().find(|t| t.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let mut segment_names = HashSet::new();
        let mut columns = HashSet::new();
        for seg in &self.segments {
            if !segment_names.insert(seg.name.as_str()) {
                return Err(MetricsError::Config(format!("duplicate segment '{}'", seg.name)));
            }
            if !seg.prefix.starts_with('/') {
                return Err(MetricsError::Config(format!(
                    "segment '{}' prefix must start with '/'",
                    seg.name
                )));
            }
            if let Some(col) = &seg.column {
                check_identifier(col)?;
                if constants::COUNT_COLUMNS.contains(&col.as_str()) || !columns.insert(col.as_str())
                {
                    return Err(MetricsError::Config(format!("duplicate column '{}'", col)));
                }
            }
        }

        let mut type_names = HashSet::new();
        for obj in &self.object_types {
            if !type_names.insert(obj.name.as_str()) {
                return Err(MetricsError::Config(format!("duplicate object type '{}'", obj.name)));
            }
            check_identifier(&obj.table_name())?;
            check_identifier(&obj.id_column)?;
            for extra in &obj.extra_columns {
                check_identifier(extra)?;
                if !obj.catalog.attributes.contains_key(extra) {
                    return Err(MetricsError::Config(format!(
                        "object type '{}' outputs '{}' but the catalog does not load it",
                        obj.name, extra
                    )));
                }
            }
            for route in &obj.routes {
                if let Some(unknown) = route
                    .segments
                    .iter()
                    .find(|s| !segment_names.contains(s.as_str()))
                {
                    return Err(MetricsError::Config(format!(
                        "object type '{}' routes unknown segment '{}'",
                        obj.name, unknown
                    )));
                }
            }
        }

        if self.workers.parse == 0 || self.workers.aggregate == 0 || self.workers.matomo == 0 {
            return Err(MetricsError::Config("worker counts must be at least 1".to_string()));
        }

        if let Some(matomo) = &self.matomo {
            if self.object_type(&matomo.object_type).is_none() {
                return Err(MetricsError::Config(format!(
                    "matomo object type '{}' is not configured",
                    matomo.object_type
                )));
            }
        }
        Ok(())
    }
}

fn check_identifier(name: &str) -> Result<()> {
    if SQL_IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(MetricsError::Config(format!("'{}' is not a valid SQL identifier", name)))
    }
}
