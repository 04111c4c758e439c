//! SQLite metrics store.
//!
//! Every write replaces the rows of one `(table, date)` inside a single
//! transaction, so a reader sees either the previous rows or the new ones.

use crate::aggregate::{AggregatedMetricRow, Partition};
use crate::config::{DatabaseConfig, ObjectTypeConfig};
use crate::constants::{COUNT_COLUMNS, MATOMO_ORGANIZATIONS_TABLE, MATOMO_REUSES_TABLE, METRIC_DATE_FORMAT};
use crate::error::Result;
use crate::matomo::{OrganizationOutlink, ReuseOutlink};
use crate::observability::StoreMetrics;
use crate::taxonomy::SegmentTaxonomy;
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Column layout of one object type's table, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub object_type: String,
    pub table: String,
    pub id_column: String,
    pub extra_columns: Vec<String>,
    pub named_columns: Vec<String>,
}

impl TableLayout {
    pub fn new(object_type: &ObjectTypeConfig, taxonomy: &SegmentTaxonomy) -> Self {
        Self {
            object_type: object_type.name.clone(),
            table: object_type.table_name(),
            id_column: object_type.id_column.clone(),
            extra_columns: object_type.extra_columns.clone(),
            named_columns: taxonomy.named_columns().to_vec(),
        }
    }

    pub fn monthly_table(&self) -> String {
        format!("{}_monthly", self.table)
    }

    fn count_columns(&self) -> impl Iterator<Item = &str> {
        COUNT_COLUMNS
            .iter()
            .copied()
            .chain(self.named_columns.iter().map(String::as_str))
    }

    /// `date_metric`, id, extra attributes, then every count column.
    pub fn columns(&self) -> Vec<&str> {
        let mut cols = vec!["date_metric", self.id_column.as_str()];
        cols.extend(self.extra_columns.iter().map(String::as_str));
        cols.extend(self.count_columns());
        cols
    }

    fn create_sql(&self) -> String {
        let mut defs = vec![
            "date_metric TEXT NOT NULL".to_string(),
            format!("{} TEXT NOT NULL", self.id_column),
        ];
        defs.extend(self.extra_columns.iter().map(|c| format!("{} TEXT", c)));
        defs.extend(
            self.count_columns()
                .map(|c| format!("{} INTEGER NOT NULL DEFAULT 0", c)),
        );
        defs.push(format!("UNIQUE (date_metric, {})", self.id_column));
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);\n\
             CREATE INDEX IF NOT EXISTS idx_{}_date ON {} (date_metric);",
            self.table,
            defs.join(",\n    "),
            self.table,
            self.table
        )
    }

    fn create_monthly_sql(&self) -> String {
        let mut defs = vec![
            "month TEXT NOT NULL".to_string(),
            format!("{} TEXT NOT NULL", self.id_column),
        ];
        defs.extend(self.count_columns().map(|c| format!("{} INTEGER NOT NULL", c)));
        defs.push(format!("UNIQUE (month, {})", self.id_column));
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
            self.monthly_table(),
            defs.join(",\n    ")
        )
    }

    fn insert_sql(&self) -> String {
        let cols = self.columns();
        let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            cols.join(", "),
            placeholders.join(", ")
        )
    }

    fn refresh_monthly_sql(&self) -> String {
        let sums: Vec<String> = self
            .count_columns()
            .map(|c| format!("SUM({})", c))
            .collect();
        let targets: Vec<&str> = self.count_columns().collect();
        format!(
            "DELETE FROM {monthly};\n\
             INSERT INTO {monthly} (month, {id}, {targets})\n\
             SELECT substr(date_metric, 1, 7), {id}, {sums}\n\
             FROM {table} GROUP BY substr(date_metric, 1, 7), {id};",
            monthly = self.monthly_table(),
            id = self.id_column,
            targets = targets.join(", "),
            sums = sums.join(", "),
            table = self.table,
        )
    }

    fn row_values(&self, row: &AggregatedMetricRow) -> Vec<Value> {
        let mut values = Vec::with_capacity(self.columns().len());
        values.push(Value::Text(row.date.format(METRIC_DATE_FORMAT).to_string()));
        values.push(Value::Text(row.id.clone()));
        for attr in &row.attributes {
            values.push(attr.clone().map(Value::Text).unwrap_or(Value::Null));
        }
        for count in [
            row.nb_visit_static,
            row.nb_visit,
            row.nb_visit_apis,
            row.nb_visit_total,
        ]
        .into_iter()
        .chain(row.named.iter().copied())
        {
            values.push(Value::Integer(count as i64));
        }
        values
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub deleted: usize,
    pub inserted: usize,
}

const MATOMO_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS matomo_reuses (
    date_metric     TEXT NOT NULL,
    reuse_id        TEXT NOT NULL,
    organization_id TEXT,
    nb_outlink      INTEGER NOT NULL,
    UNIQUE (date_metric, reuse_id)
);
CREATE TABLE IF NOT EXISTS matomo_organizations (
    date_metric     TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    nb_outlink      INTEGER NOT NULL,
    UNIQUE (date_metric, organization_id)
);
"#;

type LockKey = (String, NaiveDate);

/// Handle on the metrics database. Each unit of work opens its own connection.
pub struct MetricsStore {
    path: PathBuf,
    busy_timeout: Duration,
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl MetricsStore {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            path: config.path.clone(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            locks: Mutex::new(HashMap::new()),
        };
        let conn = store.connect()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(store)
    }

    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    /// Create every metrics table, rollup and index that does not exist yet.
    pub fn ensure_tables(&self, layouts: &[TableLayout]) -> Result<()> {
        let conn = self.connect()?;
        for layout in layouts {
            conn.execute_batch(&layout.create_sql())?;
            conn.execute_batch(&layout.create_monthly_sql())?;
            let extras: Vec<(&str, &str)> = layout.extra_columns.iter().map(|c| (c.as_str(), "TEXT")).collect();
            let counts: Vec<(&str, &str)> = layout
                .count_columns()
                .map(|c| (c, "INTEGER NOT NULL DEFAULT 0"))
                .collect();
            self.add_missing_columns(&conn, &layout.table, &[extras, counts.clone()].concat())?;
            self.add_missing_columns(&conn, &layout.monthly_table(), &counts)?;
        }
        conn.execute_batch(MATOMO_DDL)?;
        info!("Ensured {} metrics tables", layouts.len());
        Ok(())
    }

    /// Add columns a table is missing, e.g. after a segment was added to the taxonomy.
    fn add_missing_columns(&self, conn: &Connection, table: &str, wanted: &[(&str, &str)]) -> Result<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let existing: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;
        for (col, kind) in wanted {
            if !existing.iter().any(|c| c == col) {
                warn!("Table {} has no column {}; adding it", table, col);
                conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, col, kind))?;
            }
        }
        Ok(())
    }

    fn lock_for(&self, table: &str, date: NaiveDate) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((table.to_string(), date))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Replace one partition's date in its table.
    #[instrument(skip(self, layout, partition), fields(table = %layout.table, date = %partition.date))]
    pub async fn replace_partition(
        self: &Arc<Self>,
        layout: Arc<TableLayout>,
        partition: Partition,
    ) -> Result<ReplaceOutcome> {
        let lock = self.lock_for(&layout.table, partition.date);
        let _guard = lock.lock().await;
        let store = Arc::clone(self);
        let table = layout.table.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = store.connect()?;
            replace_date(&mut conn, &layout, partition.date, &partition.rows)
        })
        .await?;
        if result.is_err() {
            StoreMetrics::replace_error(&table);
        }
        result
    }

    /// Rebuild the monthly rollup from the daily table.
    pub fn refresh_monthly(&self, layout: &TableLayout) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute_batch(&layout.refresh_monthly_sql())?;
        tx.commit()?;
        debug!("Refreshed {}", layout.monthly_table());
        Ok(())
    }

    /// Replace one date of both outlink tables in a single transaction.
    pub fn replace_matomo(
        &self,
        date: NaiveDate,
        reuses: &[ReuseOutlink],
        organizations: &[OrganizationOutlink],
    ) -> Result<ReplaceOutcome> {
        let started = Instant::now();
        let date_metric = date.format(METRIC_DATE_FORMAT).to_string();
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut deleted = tx.execute(
            &format!("DELETE FROM {} WHERE date_metric = ?1", MATOMO_REUSES_TABLE),
            params![date_metric],
        )?;
        deleted += tx.execute(
            &format!("DELETE FROM {} WHERE date_metric = ?1", MATOMO_ORGANIZATIONS_TABLE),
            params![date_metric],
        )?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (date_metric, reuse_id, organization_id, nb_outlink) VALUES (?1, ?2, ?3, ?4)",
                MATOMO_REUSES_TABLE
            ))?;
            for r in reuses {
                stmt.execute(params![date_metric, r.reuse_id, r.organization_id, r.nb_outlink as i64])?;
            }
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (date_metric, organization_id, nb_outlink) VALUES (?1, ?2, ?3)",
                MATOMO_ORGANIZATIONS_TABLE
            ))?;
            for o in organizations {
                stmt.execute(params![date_metric, o.organization_id, o.nb_outlink as i64])?;
            }
        }
        tx.commit()?;
        let inserted = reuses.len() + organizations.len();
        StoreMetrics::record_replace(MATOMO_REUSES_TABLE, deleted, inserted, started.elapsed().as_secs_f64());
        Ok(ReplaceOutcome { deleted, inserted })
    }
}

/// Delete every row of `date`, then insert `rows`, as one transaction.
pub fn replace_date(
    conn: &mut Connection,
    layout: &TableLayout,
    date: NaiveDate,
    rows: &[AggregatedMetricRow],
) -> Result<ReplaceOutcome> {
    let started = Instant::now();
    let date_metric = date.format(METRIC_DATE_FORMAT).to_string();
    let tx = conn.transaction()?;
    let deleted = tx.execute(
        &format!("DELETE FROM {} WHERE date_metric = ?1", layout.table),
        params![date_metric],
    )?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(&layout.insert_sql())?;
        for row in rows {
            inserted += stmt.execute(params_from_iter(layout.row_values(row)))?;
        }
    }
    tx.commit()?;

    StoreMetrics::record_replace(&layout.table, deleted, inserted, started.elapsed().as_secs_f64());
    info!(
        table = %layout.table,
        date = %date_metric,
        deleted,
        inserted,
        "Replaced date"
    );
    Ok(ReplaceOutcome { deleted, inserted })
}
