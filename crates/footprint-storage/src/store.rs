//! One SQLite database per source holding raw entity tables, the
//! `sync_state` watermark table and the derived `analysis` table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use footprint_core::{
    ColumnType, EntityDef, MetricMap, MetricQuery, SourceDefinition, SourceId, SourceRecord,
    Watermark, YearMonth,
};
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Acquire, Row, Sqlite, SqlitePool, Transaction, ValueRef};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("entity `{entity}` is not defined for {source_id}")]
    UnknownEntity { source_id: SourceId, entity: String },
    #[error("analysis column `{column}` is not defined for {source_id}")]
    UnknownColumn { source_id: SourceId, column: String },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Creates the schema a store needs. Idempotent.
#[async_trait]
pub trait Initializable {
    async fn init_tables(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ExistenceCheck {
    /// The backing database file is present on disk.
    fn exists(&self) -> bool;
    async fn tables_exist(&self) -> Result<bool, StoreError>;
}

/// Timestamps are persisted as RFC 3339 UTC text.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Dynamically typed SQLite value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    /// Numeric view of the value; text is parsed, anything else is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Null => None,
            Cell::Integer(v) => Some(*v as f64),
            Cell::Real(v) => Some(*v),
            Cell::Text(v) => v.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

fn decode_cell(row: &SqliteRow, name: &str) -> Result<Cell, sqlx::Error> {
    if row.try_get_raw(name)?.is_null() {
        return Ok(Cell::Null);
    }
    if let Ok(value) = row.try_get::<String, _>(name) {
        return Ok(Cell::Text(value));
    }
    if let Ok(value) = row.try_get::<i64, _>(name) {
        return Ok(Cell::Integer(value));
    }
    Ok(Cell::Real(row.try_get::<f64, _>(name)?))
}

/// One row of a metric query: the raw bucket timestamp and the inputs of
/// the metrics computed from it.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub bucket: Cell,
    pub values: BTreeMap<String, Cell>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRow {
    pub period: YearMonth,
    /// Every analysis column of the source; `None` is stored as NULL.
    pub metrics: BTreeMap<String, Option<f64>>,
    pub updated_at: String,
}

impl AnalysisRow {
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.metrics.get(metric).copied().flatten()
    }

    pub fn metric_map(&self) -> MetricMap {
        self.metrics
            .iter()
            .filter_map(|(name, value)| value.map(|v| (name.clone(), v)))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisSummary {
    pub rows: i64,
    pub latest: Option<YearMonth>,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

pub fn schema_statements(definition: &SourceDefinition) -> Vec<String> {
    let mut statements = Vec::new();

    for entity in definition.entities {
        let mut parts = vec![format!("{} TEXT PRIMARY KEY", entity.key_column)];
        parts.extend(
            entity
                .columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.ty.sql())),
        );
        if let Some(parent) = entity.parent {
            if let Some(parent_entity) = definition.entity(parent.entity) {
                parts.push(format!(
                    "FOREIGN KEY ({}) REFERENCES {}({})",
                    parent.column, parent_entity.table, parent_entity.key_column
                ));
            }
        }
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            entity.table,
            parts.join(", ")
        ));
        if let Some(parent) = entity.parent {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table}({column})",
                table = entity.table,
                column = parent.column
            ));
        }
    }

    statements.push(
        "CREATE TABLE IF NOT EXISTS sync_state (\
         entity_type TEXT PRIMARY KEY, \
         last_sync_at TEXT, \
         last_cursor TEXT, \
         updated_at TEXT NOT NULL)"
            .to_string(),
    );

    let mut analysis = vec![
        "year_month TEXT PRIMARY KEY".to_string(),
        "year TEXT NOT NULL".to_string(),
        "month TEXT NOT NULL".to_string(),
    ];
    analysis.extend(
        definition
            .analysis_metrics()
            .map(|m| format!("{} {}", m.column, m.ty.sql())),
    );
    analysis.push("updated_at TEXT NOT NULL".to_string());
    statements.push(format!(
        "CREATE TABLE IF NOT EXISTS analysis ({})",
        analysis.join(", ")
    ));

    statements
}

fn upsert_sql(entity: &EntityDef, columns: &[&str]) -> String {
    let mut names = vec![entity.key_column];
    names.extend_from_slice(columns);
    let placeholders = (1..=names.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict = if columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!(
            "DO UPDATE SET {}",
            columns
                .iter()
                .map(|c| format!("{c} = excluded.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        )
    };
    format!(
        "INSERT INTO {table} ({names}) VALUES ({placeholders}) ON CONFLICT({key}) {conflict}",
        table = entity.table,
        names = names.join(", "),
        key = entity.key_column,
    )
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_json<'q>(query: SqliteQuery<'q>, value: &JsonValue) -> SqliteQuery<'q> {
    match value {
        JsonValue::Null => query.bind(None::<String>),
        JsonValue::Bool(b) => query.bind(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        JsonValue::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct SourceStore {
    definition: &'static SourceDefinition,
    path: PathBuf,
    pool: SqlitePool,
}

impl SourceStore {
    pub fn database_path(data_dir: &Path, source: SourceId) -> PathBuf {
        data_dir.join(format!("{source}.db"))
    }

    /// Opens (creating if needed) the source's database under `data_dir`.
    /// Foreign keys are enforced on every connection.
    pub async fn open(
        definition: &'static SourceDefinition,
        data_dir: &Path,
    ) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: data_dir.to_path_buf(),
                source,
            })?;
        let path = Self::database_path(data_dir, definition.source);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        debug!(path = %path.display(), "opened source store");
        Ok(Self {
            definition,
            path,
            pool,
        })
    }

    pub fn definition(&self) -> &'static SourceDefinition {
        self.definition
    }

    pub fn source(&self) -> SourceId {
        self.definition.source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Starts a unit of work. Nothing it writes is visible until
    /// [`UnitOfWork::commit`]; dropping it rolls back.
    pub async fn begin(&self) -> Result<UnitOfWork<'static>, StoreError> {
        Ok(UnitOfWork {
            tx: self.pool.begin().await?,
            definition: self.definition,
        })
    }

    pub async fn watermarks(&self) -> Result<Vec<Watermark>, StoreError> {
        let rows = sqlx::query(
            "SELECT entity_type, last_sync_at, last_cursor FROM sync_state ORDER BY entity_type",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(watermark_from_row).collect()
    }

    pub async fn row_counts(&self) -> Result<Vec<(&'static str, i64)>, StoreError> {
        let mut counts = Vec::new();
        for entity in self.definition.entities {
            let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", entity.table))
                .fetch_one(&self.pool)
                .await?;
            counts.push((entity.table, row.try_get::<i64, _>("n")?));
        }
        Ok(counts)
    }

    pub async fn analysis_rows(&self) -> Result<Vec<AnalysisRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM analysis ORDER BY year_month")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .filter_map(|row| analysis_from_row(self.definition, row).transpose())
            .collect()
    }

    pub async fn analysis_row(&self, period: &YearMonth) -> Result<Option<AnalysisRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM analysis WHERE year_month = ?1")
            .bind(period.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => analysis_from_row(self.definition, &row),
            None => Ok(None),
        }
    }

    pub async fn analysis_summary(&self) -> Result<AnalysisSummary, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n, MAX(year_month) AS latest, MAX(updated_at) AS last_updated \
             FROM analysis",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(AnalysisSummary {
            rows: row.try_get("n")?,
            latest: row
                .try_get::<Option<String>, _>("latest")?
                .and_then(|v| YearMonth::parse(&v).ok()),
            last_updated: row.try_get("last_updated")?,
        })
    }
}

#[async_trait]
impl Initializable for SourceStore {
    async fn init_tables(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in schema_statements(self.definition) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }

        // Analysis tables created by older metric sets gain new columns in place.
        let existing: Vec<String> = sqlx::query("SELECT name FROM pragma_table_info('analysis')")
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()?;
        for metric in self.definition.analysis_metrics() {
            if !existing.iter().any(|name| name == metric.column) {
                debug!(column = metric.column, "adding analysis column");
                sqlx::query(&format!(
                    "ALTER TABLE analysis ADD COLUMN {} {}",
                    metric.column,
                    metric.ty.sql()
                ))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ExistenceCheck for SourceStore {
    fn exists(&self) -> bool {
        self.path.exists()
    }

    async fn tables_exist(&self) -> Result<bool, StoreError> {
        let mut expected: Vec<&str> = self.definition.entities.iter().map(|e| e.table).collect();
        expected.extend(["sync_state", "analysis"]);
        for table in expected {
            let found = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
            if found.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn watermark_from_row(row: &SqliteRow) -> Result<Watermark, StoreError> {
    Ok(Watermark {
        stream: row.try_get("entity_type")?,
        last_sync_at: row
            .try_get::<Option<String>, _>("last_sync_at")?
            .as_deref()
            .and_then(parse_timestamp),
        last_cursor: row.try_get("last_cursor")?,
    })
}

fn analysis_from_row(
    definition: &SourceDefinition,
    row: &SqliteRow,
) -> Result<Option<AnalysisRow>, StoreError> {
    let year_month: String = row.try_get("year_month")?;
    let Ok(period) = YearMonth::parse(&year_month) else {
        return Ok(None);
    };
    let mut metrics = BTreeMap::new();
    for metric in definition.analysis_metrics() {
        let value = decode_cell(row, metric.column)?.as_f64();
        metrics.insert(metric.column.to_string(), value);
    }
    Ok(Some(AnalysisRow {
        period,
        metrics,
        updated_at: row.try_get("updated_at")?,
    }))
}

/// Transaction over one source's database. Nested units are savepoints.
pub struct UnitOfWork<'c> {
    tx: Transaction<'c, Sqlite>,
    definition: &'static SourceDefinition,
}

impl<'c> UnitOfWork<'c> {
    pub fn definition(&self) -> &'static SourceDefinition {
        self.definition
    }

    /// Opens a savepoint inside this unit. Dropping the nested unit without
    /// committing undoes only its own writes.
    pub async fn nested(&mut self) -> Result<UnitOfWork<'_>, StoreError> {
        let tx = Acquire::begin(&mut *self.tx).await?;
        Ok(UnitOfWork {
            tx,
            definition: self.definition,
        })
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn entity(&self, name: &str) -> Result<&'static EntityDef, StoreError> {
        self.definition
            .entities
            .iter()
            .find(|e| e.entity == name)
            .ok_or_else(|| StoreError::UnknownEntity {
                source_id: self.definition.source,
                entity: name.to_string(),
            })
    }

    pub async fn record_exists(&mut self, entity: &str, key: &str) -> Result<bool, StoreError> {
        let entity = self.entity(entity)?;
        let found = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE {} = ?1 LIMIT 1",
            entity.table, entity.key_column
        ))
        .bind(key.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(found.is_some())
    }

    /// Inserts or updates a record by natural key. Only the columns the
    /// record carries are written, so fields it omits keep their stored
    /// values while a JSON null clears its column. Fields without a column
    /// are ignored.
    pub async fn upsert(&mut self, record: &SourceRecord) -> Result<UpsertOutcome, StoreError> {
        let entity = self.entity(record.entity)?;

        let mut values: BTreeMap<&'static str, JsonValue> = BTreeMap::new();
        for (name, value) in &record.fields {
            match entity.column(name) {
                Some(column) => {
                    values.insert(column.name, value.clone());
                }
                None => debug!(entity = entity.entity, field = %name, "dropping unmapped field"),
            }
        }
        if let (Some(parent_def), Some(link)) = (entity.parent, &record.parent) {
            match &link.key {
                Some(parent_key) if parent_def.column != entity.key_column => {
                    values.insert(parent_def.column, JsonValue::String(parent_key.clone()));
                }
                _ => {}
            }
        }

        let existed = self.record_exists(record.entity, &record.key).await?;
        let columns: Vec<&str> = values.keys().copied().collect();
        let sql = upsert_sql(entity, &columns);
        let mut query = sqlx::query(&sql).bind(record.key.clone());
        for value in values.values() {
            query = bind_json(query, value);
        }
        query.execute(&mut *self.tx).await?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    pub async fn watermark(&mut self, stream: &str) -> Result<Watermark, StoreError> {
        let row = sqlx::query(
            "SELECT entity_type, last_sync_at, last_cursor FROM sync_state WHERE entity_type = ?1",
        )
        .bind(stream.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;
        match row {
            Some(row) => watermark_from_row(&row),
            None => Ok(Watermark::empty(stream)),
        }
    }

    pub async fn put_watermark(&mut self, watermark: &Watermark) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_state (entity_type, last_sync_at, last_cursor, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(entity_type) DO UPDATE SET \
             last_sync_at = excluded.last_sync_at, \
             last_cursor = excluded.last_cursor, \
             updated_at = excluded.updated_at",
        )
        .bind(watermark.stream.clone())
        .bind(watermark.last_sync_at.map(format_timestamp))
        .bind(watermark.last_cursor.clone())
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Runs a metric query and decodes its bucket and metric input columns.
    pub async fn metric_rows(&mut self, query: &MetricQuery) -> Result<Vec<MetricRow>, StoreError> {
        let rows = sqlx::query(query.sql).fetch_all(&mut *self.tx).await?;
        let inputs: Vec<&str> = query.metrics.iter().filter_map(|m| m.input).collect();

        rows.iter()
            .map(|row| {
                let mut values = BTreeMap::new();
                for input in &inputs {
                    values.insert(input.to_string(), decode_cell(row, input)?);
                }
                Ok(MetricRow {
                    bucket: decode_cell(row, "bucket_ts")?,
                    values,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    pub async fn upsert_analysis(&mut self, row: &AnalysisRow) -> Result<(), StoreError> {
        let mut bound: Vec<(&'static str, ColumnType, Option<f64>)> = Vec::new();
        for (name, value) in &row.metrics {
            let metric = self
                .definition
                .analysis_metrics()
                .find(|m| m.column == name.as_str())
                .ok_or_else(|| StoreError::UnknownColumn {
                    source_id: self.definition.source,
                    column: name.clone(),
                })?;
            bound.push((metric.column, metric.ty, *value));
        }

        let mut columns = vec!["year_month", "year", "month"];
        columns.extend(bound.iter().map(|(name, _, _)| *name));
        columns.push("updated_at");
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = columns[1..]
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO analysis ({}) VALUES ({placeholders}) \
             ON CONFLICT(year_month) DO UPDATE SET {updates}",
            columns.join(", ")
        );

        let mut query = sqlx::query(&sql)
            .bind(row.period.to_string())
            .bind(row.period.year_str())
            .bind(row.period.month_str());
        for (_, ty, value) in &bound {
            query = match ty {
                ColumnType::Integer => query.bind(value.map(|v| v.round() as i64)),
                ColumnType::Real => query.bind(*value),
                ColumnType::Text => query.bind(value.map(|v| v.to_string())),
            };
        }
        query
            .bind(row.updated_at.clone())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}
