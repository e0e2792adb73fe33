//! Sync pipeline orchestration: one watermark, one extraction, one load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeDelta, Utc};
use serde::Serialize;
use sffire_core::Watermark;
use sffire_source::{
    ExtractorConfig, IncidentExtractor, PageObserver, PageProgress, DEFAULT_API_URL,
    DEFAULT_PAGE_SIZE,
};
use sffire_storage::{
    BulkLoader, ConnectionParams, LoadReport, MemoryConnector, PgConnector, StoreConnector,
    TableRef, DEFAULT_BATCH_SIZE, DEFAULT_SCHEMA, DEFAULT_TABLE,
};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sffire-sync";

pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db: ConnectionParams,
    pub schema: String,
    pub table: String,
    pub api_url: String,
    pub page_size: usize,
    pub batch_size: usize,
    pub lookback_days: i64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            db: ConnectionParams::from_lookup(&lookup),
            schema: lookup("DB_SCHEMA").unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            table: lookup("SFFIRE_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            api_url: lookup("SFFIRE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            page_size: lookup("SFFIRE_PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_PAGE_SIZE),
            batch_size: lookup("SFFIRE_BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_BATCH_SIZE),
            lookback_days: lookup("SFFIRE_LOOKBACK_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LOOKBACK_DAYS),
            http_timeout_secs: lookup("SFFIRE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            user_agent: lookup("SFFIRE_USER_AGENT")
                .unwrap_or_else(|| format!("sffire-sync/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            api_url: self.api_url.clone(),
            page_size: self.page_size,
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Per-run overrides taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct SyncOverrides {
    pub lookback_days: Option<i64>,
    pub table: Option<String>,
    pub dry_run: bool,
}

impl SyncOverrides {
    pub fn apply(&self, mut config: SyncConfig) -> SyncConfig {
        if let Some(days) = self.lookback_days {
            config.lookback_days = days;
        }
        if let Some(table) = &self.table {
            config.table = table.clone();
        }
        config
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub watermark: Watermark,
    pub extracted_records: usize,
    pub pages: usize,
    pub load: LoadReport,
}

#[derive(Default)]
struct PageCounter(AtomicUsize);

impl PageObserver for PageCounter {
    fn on_page(&self, progress: &PageProgress) {
        self.0.store(progress.page, Ordering::Relaxed);
    }
}

pub struct SyncPipeline<C> {
    config: SyncConfig,
    extractor: IncidentExtractor,
    loader: BulkLoader<C>,
    pages: Arc<PageCounter>,
}

impl<C: StoreConnector> SyncPipeline<C> {
    /// Fails on a schema or table name that could never be loaded, before
    /// any request reaches the source.
    pub fn new(config: SyncConfig, connector: C) -> Result<Self> {
        TableRef::new(&config.schema, &config.table).context("destination table")?;
        let pages = Arc::new(PageCounter::default());
        let extractor =
            IncidentExtractor::new(config.extractor_config()).with_observer(pages.clone());
        let loader = BulkLoader::new(connector, config.schema.clone())
            .with_batch_size(config.batch_size);
        Ok(Self {
            config,
            extractor,
            loader,
            pages,
        })
    }

    pub fn with_loader(mut self, loader: BulkLoader<C>) -> Self {
        self.loader = loader;
        self
    }

    pub fn extractor(&self) -> &IncidentExtractor {
        &self.extractor
    }

    /// Extract everything inside the lookback window and upsert it.
    ///
    /// The source session is released whether or not either stage fails.
    pub async fn run_once(&mut self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run(&mut self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let watermark = Watermark::lookback(
            Local::now().naive_local(),
            TimeDelta::try_days(self.config.lookback_days).unwrap_or(TimeDelta::MAX),
        );
        self.pages.0.store(0, Ordering::Relaxed);
        info!(%watermark, table = %self.config.table, "starting incremental sync");

        let result = self.extract_and_load(watermark).await;
        self.extractor.close();
        let (extracted_records, load) = result?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            watermark,
            extracted_records,
            pages: self.pages.0.load(Ordering::Relaxed),
            load,
        };
        info!(
            extracted_records = summary.extracted_records,
            written_rows = summary.load.written_rows,
            batches = summary.load.batches,
            "sync run complete"
        );
        Ok(summary)
    }

    async fn extract_and_load(&mut self, watermark: Watermark) -> Result<(usize, LoadReport)> {
        let records = match self.extractor.extract_incremental(watermark).await {
            Ok(records) => records,
            Err(err) => {
                error!(stage = "extract", error = %err, "sync run failed");
                return Err(err).context("extract stage");
            }
        };

        match self.loader.bulk_load(&records, &self.config.table).await {
            Ok(report) => Ok((records.len(), report)),
            Err(err) => {
                error!(stage = "load", error = %err, "sync run failed");
                Err(err).context("load stage")
            }
        }
    }
}

/// Run one sync with configuration from the environment. A dry run goes
/// through the full protocol against an in-memory destination.
pub async fn run_sync_once_from_env(overrides: &SyncOverrides) -> Result<SyncRunSummary> {
    let config = overrides.apply(SyncConfig::from_env());
    if overrides.dry_run {
        info!("dry run: writing to in-memory destination");
        SyncPipeline::new(config, MemoryConnector::new())?
            .run_once()
            .await
    } else {
        let connector = PgConnector::new(config.db.clone(), config.schema.clone());
        SyncPipeline::new(config, connector)?.run_once().await
    }
}
