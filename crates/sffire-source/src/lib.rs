//! Incremental, paginated extraction of fire incidents from the SODA API.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sffire_core::{RawIncident, Watermark};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "sffire-source";

pub const DEFAULT_API_URL: &str = "https://data.sfgov.org/resource/wr8u-xric.json";
pub const DEFAULT_PAGE_SIZE: usize = 50_000;

/// Stable ordering so offset paging never skips or repeats rows.
const PAGE_ORDER: &str = "incident_date,id";
const LOADED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub api_url: String,
    pub page_size: usize,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

/// Progress observation emitted once per non-empty page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageProgress {
    pub page: usize,
    pub offset: usize,
    pub page_records: usize,
    pub total_records: usize,
}

/// Informational hook; it cannot influence paging.
pub trait PageObserver: Send + Sync {
    fn on_page(&self, progress: &PageProgress);
}

#[derive(Default)]
pub struct NoopPageObserver;

impl PageObserver for NoopPageObserver {
    fn on_page(&self, _progress: &PageProgress) {}
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request for offset {offset} failed: {source}")]
    Request {
        offset: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for offset {offset} at {url}")]
    HttpStatus {
        status: u16,
        offset: usize,
        url: String,
    },
    #[error("decoding page at offset {offset}: {source}")]
    Decode {
        offset: usize,
        #[source]
        source: reqwest::Error,
    },
}

/// Pulls every incident at or after a watermark, one page at a time.
///
/// The extractor owns a single HTTP session, opened lazily on the first
/// extraction and released by [`IncidentExtractor::close`].
pub struct IncidentExtractor {
    config: ExtractorConfig,
    session: Option<reqwest::Client>,
    observer: Arc<dyn PageObserver>,
}

impl IncidentExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            config,
            session: None,
            observer: Arc::new(NoopPageObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PageObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Release the HTTP session. Safe to call repeatedly or before any
    /// extraction has opened one.
    pub fn close(&mut self) {
        if self.session.take().is_some() {
            debug!("closed source session");
        }
    }

    /// Fetch all records with `incident_date >= watermark`.
    ///
    /// Pages are requested at offsets `0, page_size, 2 * page_size, ...`
    /// until the API answers with an empty page. Any non-200 status or
    /// transport failure aborts the whole extraction.
    #[tracing::instrument(skip_all, fields(watermark = %watermark))]
    pub async fn extract_incremental(
        &mut self,
        watermark: Watermark,
    ) -> Result<Vec<RawIncident>, ExtractError> {
        let client = self.session()?;
        let page_size = self.config.page_size.max(1);
        let where_clause = format!("incident_date >= '{}'", watermark.to_api_literal());
        let limit = page_size.to_string();
        let loaded_at = Utc::now().naive_utc().format(LOADED_AT_FORMAT).to_string();

        let mut records: Vec<RawIncident> = Vec::new();
        let mut offset = 0usize;
        let mut page = 0usize;

        loop {
            let offset_param = offset.to_string();
            let response = client
                .get(&self.config.api_url)
                .query(&[
                    ("$where", where_clause.as_str()),
                    ("$order", PAGE_ORDER),
                    ("$limit", limit.as_str()),
                    ("$offset", offset_param.as_str()),
                ])
                .send()
                .await
                .map_err(|source| ExtractError::Request { offset, source })?;

            let status = response.status();
            if status != StatusCode::OK {
                return Err(ExtractError::HttpStatus {
                    status: status.as_u16(),
                    offset,
                    url: response.url().to_string(),
                });
            }

            let batch: Vec<RawIncident> = response
                .json()
                .await
                .map_err(|source| ExtractError::Decode { offset, source })?;
            if batch.is_empty() {
                break;
            }

            page += 1;
            let page_records = batch.len();
            records.extend(batch.into_iter().map(|mut record| {
                stamp_loaded_at(&mut record, &loaded_at);
                record
            }));

            info!(
                page,
                offset,
                page_records,
                total_records = records.len(),
                "fetched incident page"
            );
            self.observer.on_page(&PageProgress {
                page,
                offset,
                page_records,
                total_records: records.len(),
            });

            offset += page_size;
        }

        info!(pages = page, total_records = records.len(), "extraction complete");
        Ok(records)
    }

    fn session(&mut self) -> Result<reqwest::Client, ExtractError> {
        if let Some(client) = &self.session {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.config.timeout);
        if let Some(user_agent) = &self.config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(ExtractError::Client)?;
        debug!(api_url = %self.config.api_url, "opened source session");
        self.session = Some(client.clone());
        Ok(client)
    }
}

/// Give records without a source-reported `data_loaded_at` the extraction time.
fn stamp_loaded_at(record: &mut RawIncident, loaded_at: &str) {
    let slot = record
        .entry("data_loaded_at")
        .or_insert(JsonValue::Null);
    if slot.is_null() {
        *slot = JsonValue::String(loaded_at.to_owned());
    }
}
