//! Batched, idempotent PostgreSQL loading of validated fire incidents.
//!
//! A load walks a fixed protocol: acquire a pool (with bounded retry),
//! ensure the schema and table, upsert the input in ordered batches that
//! fail fast on the first invalid record, then build secondary indexes
//! concurrently. The pool is released on every exit path.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sffire_core::{validate_record, CanonicalRow, RawIncident, ValidationError, INCIDENT_COLUMNS};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::{Connection, PgConnection};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod memory;

pub use memory::{MemoryConnector, MemoryStore, StoredIncident};

pub const CRATE_NAME: &str = "sffire-storage";

pub const DEFAULT_SCHEMA: &str = "raw";
pub const DEFAULT_TABLE: &str = "fire_incidents";
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Secondary indexes built after all batches commit.
pub const INDEXED_COLUMNS: [&str; 2] = ["battalion", "incident_date"];

const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid identifier {0:?}: expected lowercase letters, digits and underscores")]
    InvalidIdentifier(String),
    #[error("destination unreachable after {attempts} attempt(s): {source}")]
    Connection {
        attempts: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("preparing {target} failed: {source}")]
    Setup {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("batch {batch} rejected: record {record} (id {id:?}) failed validation: {source}")]
    Validation {
        batch: usize,
        record: usize,
        id: Option<String>,
        #[source]
        source: ValidationError,
    },
    #[error("writing batch {batch} into {table} failed: {source}")]
    Write {
        batch: usize,
        table: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Destination connection parameters.
#[derive(Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: String,
    pub statement_timeout: Duration,
    pub max_connections: u32,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "sf_fire_db".to_string(),
            user: "sf_fire_user".to_string(),
            password: "sf_fire_pass".to_string(),
            ssl_mode: "prefer".to_string(),
            statement_timeout: Duration::from_secs(180),
            max_connections: 4,
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssl_mode", &self.ssl_mode)
            .field("statement_timeout", &self.statement_timeout)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl ConnectionParams {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build parameters from `DB_*` keys, falling back to defaults for
    /// anything missing or unparsable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("DB_HOST").unwrap_or(defaults.host),
            port: lookup("DB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            database: lookup("DB_NAME").unwrap_or(defaults.database),
            user: lookup("DB_USER").unwrap_or(defaults.user),
            password: lookup("DB_PASS").unwrap_or(defaults.password),
            ssl_mode: lookup("DB_SSLMODE").unwrap_or(defaults.ssl_mode),
            statement_timeout: lookup("DB_STATEMENT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.statement_timeout),
            max_connections: lookup("DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.max_connections),
        }
    }

    /// Connect options carrying the statement timeout as a startup
    /// parameter, so it holds on every pooled connection.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        let ssl_mode = PgSslMode::from_str(&self.ssl_mode)?;
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
            .ssl_mode(ssl_mode)
            .options([(
                "statement_timeout",
                self.statement_timeout.as_millis().to_string(),
            )]))
    }
}

/// Check that a plain lowercase SQL identifier is safe to splice into DDL.
pub fn validate_identifier(name: &str) -> Result<&str, LoadError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(name)
    } else {
        Err(LoadError::InvalidIdentifier(name.to_string()))
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A validated `schema.table` destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    schema: String,
    table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Result<Self, LoadError> {
        Ok(Self {
            schema: validate_identifier(schema)?.to_string(),
            table: validate_identifier(table)?.to_string(),
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Quoted `"schema"."table"` for SQL text.
    pub fn qualified(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.table)
        )
    }

    pub fn index_name(&self, column: &str) -> String {
        format!("idx_{}_{}", self.table, column)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only failures to reach the destination are worth another attempt.
pub fn classify_connect_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
        // cannot_connect_now, too_many_connections
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("57P03" | "53300")) => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Opens a fresh destination handle for one load.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Store: IncidentStore;

    async fn connect(&self) -> Result<Self::Store, sqlx::Error>;

    /// Human-readable destination for logs; never includes secrets.
    fn describe(&self) -> String;
}

/// The statements one load issues against its destination.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn prepare_schema(&self, schema: &str) -> Result<(), sqlx::Error>;

    /// Idempotent create with the primary key only; no secondary indexes.
    async fn ensure_table(&self, target: &TableRef) -> Result<(), sqlx::Error>;

    /// Write the batch as one statement. Rows must have distinct ids.
    async fn upsert_batch(
        &self,
        target: &TableRef,
        rows: &[CanonicalRow],
    ) -> Result<u64, sqlx::Error>;

    async fn create_index(&self, target: &TableRef, column: &str) -> Result<(), sqlx::Error>;

    async fn close(&self);
}

pub struct PgConnector {
    params: ConnectionParams,
    schema: String,
}

impl PgConnector {
    pub fn new(params: ConnectionParams, schema: impl Into<String>) -> Self {
        Self {
            params,
            schema: schema.into(),
        }
    }

    /// Pool options with the statement timeout and the `<schema>,public`
    /// search path sent as startup parameters.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        Ok(self
            .params
            .connect_options()?
            .options([("search_path", format!("{},public", self.schema))]))
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    type Store = PgIncidentStore;

    async fn connect(&self) -> Result<PgIncidentStore, sqlx::Error> {
        let options = self.connect_options()?;
        let pool = PgPoolOptions::new()
            .max_connections(self.params.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;
        debug!(params = ?self.params, "opened destination pool");
        Ok(PgIncidentStore { pool })
    }

    fn describe(&self) -> String {
        format!("{:?}", self.params)
    }
}

pub struct PgIncidentStore {
    pool: PgPool,
}

impl PgIncidentStore {
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn create_table_sql(target: &TableRef) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            incident_number TEXT NOT NULL,
            id TEXT PRIMARY KEY,
            incident_date TIMESTAMP,
            alarm_dttm TIMESTAMP,
            arrival_dttm TIMESTAMP,
            close_dttm TIMESTAMP,
            address TEXT,
            city TEXT,
            zipcode TEXT,
            battalion TEXT,
            station_area TEXT,
            supervisor_district TEXT,
            neighborhood_district TEXT,
            point TEXT,
            data_loaded_at TIMESTAMP NOT NULL,
            _loaded_at TIMESTAMP NOT NULL DEFAULT now()
        )
        "#,
        target.qualified()
    )
}

/// One multi-row statement fed by column arrays, so a 10k-row batch needs
/// only 15 bind parameters. Conflicts overwrite the full row.
fn upsert_sql(target: &TableRef) -> String {
    let columns = INCIDENT_COLUMNS.join(", ");
    let arrays = INCIDENT_COLUMNS
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let is_timestamp = column.ends_with("_dttm")
                || column.ends_with("_date")
                || *column == "data_loaded_at";
            let ty = if is_timestamp { "timestamp" } else { "text" };
            format!("${}::{ty}[]", i + 1)
        })
        .collect::<Vec<_>>()
        .join(", ");
    let updates = INCIDENT_COLUMNS
        .iter()
        .filter(|column| **column != "id")
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({columns}) SELECT * FROM UNNEST({arrays}) \
         ON CONFLICT (id) DO UPDATE SET {updates}, _loaded_at = now()",
        target.qualified()
    )
}

fn create_index_sql(target: &TableRef, column: &str) -> String {
    format!(
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS {} ON {} ({})",
        quote_identifier(&target.index_name(column)),
        target.qualified(),
        quote_identifier(column)
    )
}

#[async_trait]
impl IncidentStore for PgIncidentStore {
    async fn prepare_schema(&self, schema: &str) -> Result<(), sqlx::Error> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_identifier(schema));
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_table(&self, target: &TableRef) -> Result<(), sqlx::Error> {
        let sql = create_table_sql(target);
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_batch(
        &self,
        target: &TableRef,
        rows: &[CanonicalRow],
    ) -> Result<u64, sqlx::Error> {
        let sql = upsert_sql(target);
        let result = sqlx::query(&sql)
            .bind(rows.iter().map(|r| r.incident_number.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.id.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.incident_date).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.alarm_dttm).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.arrival_dttm).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.close_dttm).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.address.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.city.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.zipcode.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.battalion.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.station_area.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.supervisor_district.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.neighborhood_district.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.point.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.data_loaded_at).collect::<Vec<_>>())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn create_index(&self, target: &TableRef, column: &str) -> Result<(), sqlx::Error> {
        let sql = create_index_sql(target, column);
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Open one connection, run `SELECT 1`, and close it.
pub async fn check_connection(params: &ConnectionParams) -> Result<(), LoadError> {
    let connection_error = |source| LoadError::Connection {
        attempts: 1,
        source,
    };
    let options = params.connect_options().map_err(connection_error)?;
    let result = async {
        let mut conn = PgConnection::connect_with(&options).await?;
        sqlx::query("SELECT 1").execute(&mut conn).await?;
        conn.close().await?;
        Ok::<(), sqlx::Error>(())
    }
    .await;

    match result {
        Ok(()) => {
            info!(
                host = %params.host,
                database = %params.database,
                "successfully connected to database"
            );
            Ok(())
        }
        Err(err) => {
            error!(params = ?params, error = %err, "failed to connect to database");
            Err(connection_error(err))
        }
    }
}

/// Observation emitted after each committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch: usize,
    pub batches: usize,
    pub batch_records: usize,
    pub loaded_records: usize,
}

pub trait BatchObserver: Send + Sync {
    fn on_batch(&self, progress: &BatchProgress);
}

#[derive(Default)]
pub struct NoopBatchObserver;

impl BatchObserver for NoopBatchObserver {
    fn on_batch(&self, _progress: &BatchProgress) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexFailure {
    pub index: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub input_records: usize,
    pub written_rows: u64,
    pub batches: usize,
    pub indexes_created: Vec<String>,
    pub index_failures: Vec<IndexFailure>,
}

impl LoadReport {
    fn empty(table: String) -> Self {
        Self {
            table,
            input_records: 0,
            written_rows: 0,
            batches: 0,
            indexes_created: Vec::new(),
            index_failures: Vec::new(),
        }
    }
}

pub struct BulkLoader<C> {
    connector: C,
    schema: String,
    batch_size: usize,
    backoff: BackoffPolicy,
    observer: Arc<dyn BatchObserver>,
}

impl<C: StoreConnector> BulkLoader<C> {
    pub fn new(connector: C, schema: impl Into<String>) -> Self {
        Self {
            connector,
            schema: schema.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            backoff: BackoffPolicy::default(),
            observer: Arc::new(NoopBatchObserver),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Validate and upsert `records` into `schema.table`.
    ///
    /// Batches commit independently: a failing batch aborts the rest of the
    /// load, but earlier batches stay committed. Index build failures are
    /// reported in [`LoadReport::index_failures`] and do not fail the load.
    pub async fn bulk_load(
        &self,
        records: &[RawIncident],
        table: &str,
    ) -> Result<LoadReport, LoadError> {
        if records.is_empty() {
            warn!(table, "no records to load");
            return Ok(LoadReport::empty(format!("{}.{table}", self.schema)));
        }

        let target = TableRef::new(&self.schema, table)?;
        info!(records = records.len(), table = %target, "starting bulk load");

        let store = self.acquire().await?;
        let result = self.load_into(&store, &target, records).await;
        store.close().await;
        debug!(table = %target, ok = result.is_ok(), "released destination pool");
        result
    }

    async fn acquire(&self) -> Result<C::Store, LoadError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(store) => return Ok(store),
                Err(err) => {
                    let disposition = classify_connect_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < max_attempts {
                        let delay = self.backoff.delay_for_attempt(attempt - 1);
                        warn!(
                            attempt,
                            max_attempts,
                            ?delay,
                            error = %err,
                            "destination unreachable; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    debug!(
                        attempt,
                        destination = %self.connector.describe(),
                        error = %err,
                        "giving up on destination"
                    );
                    return Err(LoadError::Connection {
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    async fn load_into(
        &self,
        store: &C::Store,
        target: &TableRef,
        records: &[RawIncident],
    ) -> Result<LoadReport, LoadError> {
        store
            .prepare_schema(target.schema())
            .await
            .map_err(|source| LoadError::Setup {
                target: format!("schema {}", target.schema()),
                source,
            })?;
        info!(schema = target.schema(), "ensured schema exists");

        store
            .ensure_table(target)
            .await
            .map_err(|source| LoadError::Setup {
                target: format!("table {target}"),
                source,
            })?;
        info!(table = %target, "table structure verified");

        let batches = records.len().div_ceil(self.batch_size);
        let mut written_rows = 0u64;
        let mut loaded_records = 0usize;

        for (index, chunk) in records.chunks(self.batch_size).enumerate() {
            let batch = index + 1;
            info!(batch, batches, batch_records = chunk.len(), "processing batch");

            let rows = validate_batch(chunk, batch, index * self.batch_size)?;
            let rows = collapse_duplicate_ids(rows);
            written_rows += store
                .upsert_batch(target, &rows)
                .await
                .map_err(|source| LoadError::Write {
                    batch,
                    table: target.to_string(),
                    source,
                })?;
            loaded_records += chunk.len();

            info!(batch, batches, batch_records = chunk.len(), loaded_records, "completed batch");
            self.observer.on_batch(&BatchProgress {
                batch,
                batches,
                batch_records: chunk.len(),
                loaded_records,
            });
        }
        info!(records = loaded_records, table = %target, "loaded all records");

        let mut indexes_created = Vec::new();
        let mut index_failures = Vec::new();
        for column in INDEXED_COLUMNS {
            let index = target.index_name(column);
            match store.create_index(target, column).await {
                Ok(()) => {
                    info!(index = %index, "index ready");
                    indexes_created.push(index);
                }
                Err(err) => {
                    warn!(
                        index = %index,
                        error = %err,
                        "index creation failed; loaded data is kept"
                    );
                    index_failures.push(IndexFailure {
                        index,
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(LoadReport {
            table: target.to_string(),
            input_records: records.len(),
            written_rows,
            batches,
            indexes_created,
            index_failures,
        })
    }
}

fn validate_batch(
    chunk: &[RawIncident],
    batch: usize,
    first_record: usize,
) -> Result<Vec<CanonicalRow>, LoadError> {
    chunk
        .iter()
        .enumerate()
        .map(|(offset, raw)| {
            validate_record(raw).map_err(|source| LoadError::Validation {
                batch,
                record: first_record + offset,
                id: raw.get("id").and_then(|v| v.as_str()).map(str::to_string),
                source,
            })
        })
        .collect()
}

/// Keep the last occurrence of each id, the outcome sequential upserts
/// would produce. A single `ON CONFLICT DO UPDATE` cannot touch a key twice.
fn collapse_duplicate_ids(rows: Vec<CanonicalRow>) -> Vec<CanonicalRow> {
    let mut seen = HashSet::with_capacity(rows.len());
    let mut kept = rows
        .into_iter()
        .rev()
        .filter(|row| seen.insert(row.id.clone()))
        .collect::<Vec<_>>();
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::json;
    use sffire_core::parse_source_timestamp;

    fn incident(id: &str, loaded_at: &str) -> RawIncident {
        json!({
            "incident_number": format!("n-{id}"),
            "id": id,
            "incident_date": "2024-03-01T08:00:00.000",
            "battalion": "B02",
            "point": {"type": "Point", "coordinates": [-122.41, 37.77]},
            "data_loaded_at": loaded_at
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn incidents(range: std::ops::Range<usize>) -> Vec<RawIncident> {
        range
            .map(|i| incident(&i.to_string(), "2024-03-02T00:00:00"))
            .collect()
    }

    fn target() -> TableRef {
        TableRef::new(DEFAULT_SCHEMA, DEFAULT_TABLE).unwrap()
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn loader(connector: MemoryConnector) -> BulkLoader<MemoryConnector> {
        BulkLoader::new(connector, DEFAULT_SCHEMA).with_backoff(fast_backoff())
    }

    /// Wraps the in-memory destination with scripted failures.
    #[derive(Default)]
    struct ScriptedConnector {
        inner: MemoryConnector,
        connect_failures: AtomicUsize,
        permanent_connect_failure: bool,
        connect_attempts: AtomicUsize,
        failing_index: Option<&'static str>,
        failing_batch: Option<usize>,
    }

    struct ScriptedStore {
        inner: MemoryStore,
        failing_index: Option<&'static str>,
        failing_batch: Option<usize>,
        upserts: AtomicUsize,
    }

    #[async_trait]
    impl StoreConnector for ScriptedConnector {
        type Store = ScriptedStore;

        async fn connect(&self) -> Result<ScriptedStore, sqlx::Error> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if self.permanent_connect_failure {
                return Err(sqlx::Error::Configuration("password authentication failed".into()));
            }
            let remaining = self.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.connect_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(sqlx::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            Ok(ScriptedStore {
                inner: self.inner.connect().await?,
                failing_index: self.failing_index,
                failing_batch: self.failing_batch,
                upserts: AtomicUsize::new(0),
            })
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    #[async_trait]
    impl IncidentStore for ScriptedStore {
        async fn prepare_schema(&self, schema: &str) -> Result<(), sqlx::Error> {
            self.inner.prepare_schema(schema).await
        }

        async fn ensure_table(&self, target: &TableRef) -> Result<(), sqlx::Error> {
            self.inner.ensure_table(target).await
        }

        async fn upsert_batch(
            &self,
            target: &TableRef,
            rows: &[CanonicalRow],
        ) -> Result<u64, sqlx::Error> {
            let batch = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing_batch == Some(batch) {
                return Err(sqlx::Error::Protocol(
                    "canceling statement due to statement timeout".into(),
                ));
            }
            self.inner.upsert_batch(target, rows).await
        }

        async fn create_index(&self, target: &TableRef, column: &str) -> Result<(), sqlx::Error> {
            if self.failing_index == Some(column) {
                return Err(sqlx::Error::Protocol(format!("could not build index on {column}")));
            }
            self.inner.create_index(target, column).await
        }

        async fn close(&self) {
            self.inner.close().await;
        }
    }

    #[derive(Default)]
    struct RecordingObserver(Mutex<Vec<BatchProgress>>);

    impl BatchObserver for RecordingObserver {
        fn on_batch(&self, progress: &BatchProgress) {
            self.0.lock().unwrap().push(*progress);
        }
    }

    #[tokio::test]
    async fn empty_input_is_a_noop() {
        let connector = MemoryConnector::new();
        let report = loader(connector.clone()).bulk_load(&[], DEFAULT_TABLE).await.unwrap();

        assert_eq!(report.batches, 0);
        assert_eq!(report.input_records, 0);
        assert_eq!(connector.connections(), 0);
        assert!(connector.events().is_empty());
    }

    #[tokio::test]
    async fn loads_batches_in_order_then_builds_indexes() {
        let connector = MemoryConnector::new();
        let observer = Arc::new(RecordingObserver::default());
        let loader = loader(connector.clone())
            .with_batch_size(2)
            .with_observer(observer.clone());

        let report = loader.bulk_load(&incidents(0..5), DEFAULT_TABLE).await.unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.written_rows, 5);
        assert_eq!(report.table, "raw.fire_incidents");
        assert_eq!(
            report.indexes_created,
            ["idx_fire_incidents_battalion", "idx_fire_incidents_incident_date"]
        );
        assert!(report.index_failures.is_empty());
        assert_eq!(
            connector.events(),
            [
                "schema raw",
                "table raw.fire_incidents",
                "upsert 2",
                "upsert 2",
                "upsert 1",
                "index idx_fire_incidents_battalion",
                "index idx_fire_incidents_incident_date",
            ]
        );
        assert_eq!(connector.rows(&target()).len(), 5);
        assert_eq!(connector.open_stores(), 0);

        let progress = observer.0.lock().unwrap().clone();
        assert_eq!(
            progress.last(),
            Some(&BatchProgress {
                batch: 3,
                batches: 3,
                batch_records: 1,
                loaded_records: 5
            })
        );
    }

    #[tokio::test]
    async fn reloading_same_id_overwrites_the_row() {
        let connector = MemoryConnector::new();
        let loader = loader(connector.clone());

        loader
            .bulk_load(&[incident("42", "2024-03-02T00:00:00")], DEFAULT_TABLE)
            .await
            .unwrap();
        let first = connector.row(&target(), "42").unwrap();

        let mut newer = incident("42", "2024-03-05T00:00:00");
        newer.insert("battalion".into(), json!("B10"));
        loader.bulk_load(&[newer], DEFAULT_TABLE).await.unwrap();

        let rows = connector.rows(&target());
        assert_eq!(rows.len(), 1);
        let second = &rows[0];
        assert_eq!(
            second.row.data_loaded_at,
            parse_source_timestamp("2024-03-05T00:00:00").unwrap()
        );
        assert_eq!(second.row.battalion.as_deref(), Some("B10"));
        assert_eq!(second.writes, 2);
        assert!(second.loaded_at >= first.loaded_at);
    }

    #[tokio::test]
    async fn duplicate_ids_within_a_batch_keep_the_last_record() {
        let connector = MemoryConnector::new();
        let records = vec![
            incident("1", "2024-03-02T00:00:00"),
            incident("2", "2024-03-02T00:00:00"),
            incident("1", "2024-03-04T00:00:00"),
        ];

        let report = loader(connector.clone())
            .bulk_load(&records, DEFAULT_TABLE)
            .await
            .unwrap();

        assert_eq!(report.input_records, 3);
        assert_eq!(report.written_rows, 2);
        let row = connector.row(&target(), "1").unwrap();
        assert_eq!(
            row.row.data_loaded_at,
            parse_source_timestamp("2024-03-04T00:00:00").unwrap()
        );
        assert_eq!(connector.rows(&target()).len(), 2);
    }

    #[tokio::test]
    async fn invalid_record_fails_its_batch_and_stops_the_load() {
        let connector = MemoryConnector::new();
        let mut records = incidents(0..20_000);
        records[15_000].remove("id");
        records.extend(incidents(20_000..20_010));

        let err = loader(connector.clone())
            .bulk_load(&records, DEFAULT_TABLE)
            .await
            .unwrap_err();

        match err {
            LoadError::Validation {
                batch,
                record,
                id,
                source,
            } => {
                assert_eq!(batch, 2);
                assert_eq!(record, 15_000);
                assert_eq!(id, None);
                assert_eq!(source.field(), "id");
            }
            other => panic!("unexpected error: {other}"),
        }
        let rows = connector.rows(&target());
        assert_eq!(rows.len(), 10_000);
        assert!(connector.row(&target(), "9999").is_some());
        assert!(connector.row(&target(), "10000").is_none());
        assert!(connector.row(&target(), "20005").is_none());
        assert!(connector.indexes().is_empty());
        assert_eq!(connector.open_stores(), 0);
    }

    #[tokio::test]
    async fn write_failure_aborts_and_releases_the_pool() {
        let scripted = ScriptedConnector {
            failing_batch: Some(2),
            ..Default::default()
        };
        let memory = scripted.inner.clone();
        let loader = BulkLoader::new(scripted, DEFAULT_SCHEMA)
            .with_batch_size(2)
            .with_backoff(fast_backoff());

        let err = loader.bulk_load(&incidents(0..6), DEFAULT_TABLE).await.unwrap_err();

        assert!(matches!(err, LoadError::Write { batch: 2, .. }));
        assert_eq!(memory.rows(&target()).len(), 2);
        assert!(memory.indexes().is_empty());
        assert_eq!(memory.open_stores(), 0);
    }

    #[tokio::test]
    async fn index_failure_does_not_fail_the_load() {
        let scripted = ScriptedConnector {
            failing_index: Some("battalion"),
            ..Default::default()
        };
        let memory = scripted.inner.clone();
        let loader = BulkLoader::new(scripted, DEFAULT_SCHEMA).with_backoff(fast_backoff());

        let report = loader.bulk_load(&incidents(0..3), DEFAULT_TABLE).await.unwrap();

        assert_eq!(report.indexes_created, ["idx_fire_incidents_incident_date"]);
        assert_eq!(report.index_failures.len(), 1);
        assert_eq!(report.index_failures[0].index, "idx_fire_incidents_battalion");
        assert_eq!(memory.rows(&target()).len(), 3);
        assert_eq!(memory.open_stores(), 0);
    }

    #[tokio::test]
    async fn transient_connect_failures_are_retried() {
        let scripted = ScriptedConnector {
            connect_failures: AtomicUsize::new(2),
            ..Default::default()
        };
        let loader = BulkLoader::new(scripted, DEFAULT_SCHEMA).with_backoff(fast_backoff());

        loader.bulk_load(&incidents(0..1), DEFAULT_TABLE).await.unwrap();

        assert_eq!(loader.connector().connect_attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connect_retries_are_bounded() {
        let scripted = ScriptedConnector {
            connect_failures: AtomicUsize::new(10),
            ..Default::default()
        };
        let loader = BulkLoader::new(scripted, DEFAULT_SCHEMA).with_backoff(fast_backoff());

        let err = loader.bulk_load(&incidents(0..1), DEFAULT_TABLE).await.unwrap_err();

        assert!(matches!(err, LoadError::Connection { attempts: 3, .. }));
        assert_eq!(loader.connector().connect_attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_connect_failure_is_not_retried() {
        let scripted = ScriptedConnector {
            permanent_connect_failure: true,
            ..Default::default()
        };
        let loader = BulkLoader::new(scripted, DEFAULT_SCHEMA).with_backoff(fast_backoff());

        let err = loader.bulk_load(&incidents(0..1), DEFAULT_TABLE).await.unwrap_err();

        assert!(matches!(err, LoadError::Connection { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn unsafe_table_names_are_rejected_before_connecting() {
        let connector = MemoryConnector::new();
        let err = loader(connector.clone())
            .bulk_load(&incidents(0..1), "fire; DROP TABLE x")
            .await
            .unwrap_err();

        assert!(matches!(err, LoadError::InvalidIdentifier(_)));
        assert_eq!(connector.connections(), 0);
    }

    #[test]
    fn identifiers_are_plain_lowercase_names() {
        assert!(validate_identifier("fire_incidents").is_ok());
        assert!(validate_identifier("_staging2").is_ok());
        for bad in ["", "2fire", "Fire", "fire-incidents", "raw.fire", "a\"b"] {
            assert!(validate_identifier(bad).is_err(), "{bad}");
        }
        assert!(validate_identifier(&"a".repeat(64)).is_err());
        assert_eq!(target().qualified(), "\"raw\".\"fire_incidents\"");
    }

    #[test]
    fn upsert_statement_overwrites_every_column_but_the_key() {
        let sql = upsert_sql(&target());
        assert!(sql.starts_with("INSERT INTO \"raw\".\"fire_incidents\" (incident_number, id, "));
        assert!(sql.contains("UNNEST($1::text[], $2::text[], $3::timestamp[]"));
        assert!(sql.contains("$15::timestamp[])"));
        assert!(sql.contains(
            "ON CONFLICT (id) DO UPDATE SET incident_number = EXCLUDED.incident_number"
        ));
        assert!(sql.contains("data_loaded_at = EXCLUDED.data_loaded_at, _loaded_at = now()"));
        assert!(!sql.contains("id = EXCLUDED.id,"));
    }

    #[test]
    fn index_statements_build_concurrently() {
        assert_eq!(
            create_index_sql(&target(), "battalion"),
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS \"idx_fire_incidents_battalion\" \
             ON \"raw\".\"fire_incidents\" (\"battalion\")"
        );
        let ddl = create_table_sql(&target());
        assert!(ddl.contains("id TEXT PRIMARY KEY"));
        assert!(!ddl.contains("INDEX"));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn connect_errors_are_classified() {
        let refused = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(classify_connect_error(&refused), RetryDisposition::Retryable);
        assert_eq!(
            classify_connect_error(&sqlx::Error::PoolTimedOut),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_connect_error(&sqlx::Error::Configuration("bad".into())),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn pooled_connections_carry_timeout_and_search_path() {
        let connector = PgConnector::new(ConnectionParams::default(), DEFAULT_SCHEMA);
        let options = connector.connect_options().unwrap();
        assert_eq!(
            options.get_options(),
            Some("-c statement_timeout=180000 -c search_path=raw,public")
        );

        let params = ConnectionParams::from_lookup(|key| {
            (key == "DB_STATEMENT_TIMEOUT_SECS").then(|| "30".to_string())
        });
        let options = PgConnector::new(params, "staging").connect_options().unwrap();
        assert_eq!(
            options.get_options(),
            Some("-c statement_timeout=30000 -c search_path=staging,public")
        );
    }

    #[test]
    fn connection_params_read_overrides_and_redact_password() {
        let params = ConnectionParams::from_lookup(|key| match key {
            "DB_HOST" => Some("db.internal".into()),
            "DB_PORT" => Some("6543".into()),
            "DB_PASS" => Some("hunter2".into()),
            "DB_STATEMENT_TIMEOUT_SECS" => Some("not-a-number".into()),
            "DB_MAX_CONNECTIONS" => Some("0".into()),
            _ => None,
        });

        assert_eq!(params.host, "db.internal");
        assert_eq!(params.port, 6543);
        assert_eq!(params.database, "sf_fire_db");
        assert_eq!(params.statement_timeout, Duration::from_secs(180));
        assert_eq!(params.max_connections, 4);
        let debug = format!("{params:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
        assert!(params.connect_options().is_ok());

        let bad_ssl = ConnectionParams {
            ssl_mode: "sometimes".into(),
            ..params
        };
        assert!(bad_ssl.connect_options().is_err());
    }
}
