//! data.gov.sg datastore client
//!
//! Fetches the complete HDB resale transaction dataset from the paginated
//! `datastore_search` endpoint, assembling pages into a single [`Dataset`].
//! The fetcher performs network I/O only; it never touches the filesystem.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Dataset, Month, ResaleRecord};

/// Base URL for the data.gov.sg datastore search endpoint
const BASE_URL: &str = "https://data.gov.sg/api/action/datastore_search";

/// Resource identifier of the HDB resale flat prices dataset
const DATASET_ID: &str = "d_8b84c4ee58e3cfc0ece0d773c8ca6abc";

/// Rows requested per page by default
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Errors that can occur when fetching resale data
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP request failed (transient; retried per page before surfacing)
    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Response payload did not have the expected shape (never retried)
    #[error("Unexpected response from data.gov.sg: {0}")]
    UpstreamFormat(String),

    /// The fetch was cancelled before completing
    #[error("Fetch cancelled")]
    Cancelled,
}

/// Progress updates emitted while a fetch is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchProgress {
    /// The fetch has begun
    Started,
    /// A page arrived; `fetched` is the running row count, `total` the
    /// upstream-reported total when the source provides one
    Page { fetched: usize, total: Option<u64> },
    /// All pages have been assembled
    Completed { rows: usize },
}

/// Cooperative cancellation flag shared between a fetch and its caller
///
/// Cancelling stops the fetcher from issuing further page requests; any
/// existing cache is left untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token in the not-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Retry behaviour for individual page requests
///
/// A single transient HTTP error should not abort a multi-thousand-row fetch,
/// so each page is retried with backoff before the failure surfaces.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per page before giving up (1 = no retries)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Double the delay after each failed attempt
    pub exponential: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            exponential: true,
        }
    }
}

/// Configuration for a [`Fetcher`]
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Endpoint to query
    pub base_url: String,
    /// Upstream resource identifier
    pub dataset_id: String,
    /// Rows requested per page
    pub page_size: usize,
    /// Per-request timeout, if any
    pub timeout: Option<Duration>,
    /// Per-page retry behaviour
    pub retry: RetryConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            dataset_id: DATASET_ID.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            timeout: Some(Duration::from_secs(30)),
            retry: RetryConfig::default(),
        }
    }
}

/// Envelope returned by the datastore_search endpoint
#[derive(Debug, Deserialize)]
struct DatastoreResponse {
    success: bool,
    result: Option<DatastoreResult>,
}

#[derive(Debug, Deserialize)]
struct DatastoreResult {
    records: Vec<RawRecord>,
    total: Option<u64>,
}

/// A single record as serialized by the upstream source
///
/// The datastore serves every value as a string; numeric fields are parsed
/// into the domain type afterwards. The upstream `_id` column carries no
/// stable identity and is ignored.
#[derive(Debug, Deserialize)]
struct RawRecord {
    month: String,
    town: String,
    flat_type: String,
    block: String,
    street_name: String,
    storey_range: String,
    floor_area_sqm: String,
    flat_model: String,
    lease_commence_date: String,
    #[serde(default)]
    remaining_lease: Option<String>,
    resale_price: String,
}

impl RawRecord {
    /// Converts the string-typed upstream record into a [`ResaleRecord`]
    fn parse(self) -> Result<ResaleRecord, FetchError> {
        let month = Month::parse(&self.month).ok_or_else(|| {
            FetchError::UpstreamFormat(format!("invalid month '{}'", self.month))
        })?;

        let floor_area_sqm: f64 = self.floor_area_sqm.trim().parse().map_err(|_| {
            FetchError::UpstreamFormat(format!("invalid floor_area_sqm '{}'", self.floor_area_sqm))
        })?;

        let lease_commence_date: i32 = self.lease_commence_date.trim().parse().map_err(|_| {
            FetchError::UpstreamFormat(format!(
                "invalid lease_commence_date '{}'",
                self.lease_commence_date
            ))
        })?;

        let resale_price: f64 = self.resale_price.trim().parse().map_err(|_| {
            FetchError::UpstreamFormat(format!("invalid resale_price '{}'", self.resale_price))
        })?;

        Ok(ResaleRecord {
            month,
            town: self.town,
            flat_type: self.flat_type,
            block: self.block,
            street_name: self.street_name,
            storey_range: self.storey_range,
            floor_area_sqm,
            flat_model: self.flat_model,
            lease_commence_date,
            remaining_lease: self.remaining_lease.unwrap_or_default(),
            resale_price,
            price_per_sqm: None,
            flat_age: None,
        })
    }
}

/// One parsed page of upstream records
struct Page {
    records: Vec<ResaleRecord>,
    total: Option<u64>,
}

/// Whether the page just received is the last one
///
/// A short page always terminates; when the source reports a total, reaching
/// it terminates too (so an exact-multiple row count costs no extra request).
fn is_final_page(page_len: usize, page_size: usize, fetched: u64, total: Option<u64>) -> bool {
    page_len < page_size || total.is_some_and(|t| fetched >= t)
}

/// Floors a configured page size at one row
///
/// A zero page size could never satisfy the short-page terminal condition
/// and would re-request offset 0 forever.
fn effective_page_size(configured: usize) -> usize {
    configured.max(1)
}

/// Client for fetching the resale dataset from data.gov.sg
#[derive(Debug, Clone)]
pub struct Fetcher {
    /// HTTP client for making requests
    client: Client,
    /// Endpoint, pagination and retry configuration
    config: FetcherConfig,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    /// Creates a Fetcher with the default endpoint and pagination settings
    pub fn new() -> Self {
        Self::with_config(FetcherConfig::default())
    }

    /// Creates a Fetcher with custom configuration
    pub fn with_config(config: FetcherConfig) -> Self {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        Self {
            // Builder only fails on malformed TLS config, which we never set
            client: builder.build().unwrap_or_default(),
            config,
        }
    }

    /// Fetches the complete dataset, page by page
    ///
    /// Progress is reported on `progress` when supplied. On any failure the
    /// rows fetched so far are discarded; use [`Fetcher::fetch_all_best_effort`]
    /// to keep them.
    ///
    /// # Returns
    /// * `Ok(Dataset)` - Every upstream row, in arrival order
    /// * `Err(FetchError)` - Network failure after retries, malformed payload,
    ///   or cancellation
    pub async fn fetch_all(
        &self,
        progress: Option<mpsc::Sender<FetchProgress>>,
        cancel: &CancelToken,
    ) -> Result<Dataset, FetchError> {
        let mut records = Vec::new();
        self.fetch_into(&mut records, progress, cancel).await?;
        Ok(Dataset::new(records))
    }

    /// Fetches the complete dataset, returning whatever was assembled before
    /// a failure instead of discarding it
    ///
    /// The error, when present, reports why the fetch stopped short. Callers
    /// opting in accept that the dataset may be a prefix of the upstream data.
    pub async fn fetch_all_best_effort(
        &self,
        progress: Option<mpsc::Sender<FetchProgress>>,
        cancel: &CancelToken,
    ) -> (Dataset, Option<FetchError>) {
        let mut records = Vec::new();
        let outcome = self.fetch_into(&mut records, progress, cancel).await;
        (Dataset::new(records), outcome.err())
    }

    /// Pagination loop shared by the two fetch entry points
    async fn fetch_into(
        &self,
        records: &mut Vec<ResaleRecord>,
        progress: Option<mpsc::Sender<FetchProgress>>,
        cancel: &CancelToken,
    ) -> Result<(), FetchError> {
        let page_size = effective_page_size(self.config.page_size);
        let mut offset = 0usize;

        if let Some(tx) = &progress {
            let _ = tx.send(FetchProgress::Started).await;
        }
        info!(page_size, "starting full dataset fetch");

        loop {
            if cancel.is_cancelled() {
                info!(fetched = records.len(), "fetch cancelled");
                return Err(FetchError::Cancelled);
            }

            let page = self.fetch_page(page_size, offset).await?;
            let page_len = page.records.len();
            records.extend(page.records);

            debug!(offset, page_len, fetched = records.len(), "page received");
            if let Some(tx) = &progress {
                let _ = tx
                    .send(FetchProgress::Page {
                        fetched: records.len(),
                        total: page.total,
                    })
                    .await;
            }

            if is_final_page(page_len, page_size, records.len() as u64, page.total) {
                break;
            }
            offset += page_size;
        }

        info!(rows = records.len(), "fetch complete");
        if let Some(tx) = &progress {
            let _ = tx
                .send(FetchProgress::Completed {
                    rows: records.len(),
                })
                .await;
        }
        Ok(())
    }

    /// Fetches one page, retrying transient failures per the retry config
    async fn fetch_page(&self, limit: usize, offset: usize) -> Result<Page, FetchError> {
        let mut backoff = self.config.retry.initial_backoff;
        let mut attempt = 1;

        loop {
            match self.fetch_page_once(limit, offset).await {
                Ok(page) => return Ok(page),
                Err(FetchError::Network(e)) if attempt < self.config.retry.max_attempts => {
                    warn!(
                        offset,
                        attempt,
                        error = %e,
                        "page request failed, retrying after {:?}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    if self.config.retry.exponential {
                        backoff *= 2;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Issues a single page request with no retry
    async fn fetch_page_once(&self, limit: usize, offset: usize) -> Result<Page, FetchError> {
        let url = format!(
            "{}?resource_id={}&limit={}&offset={}",
            self.config.base_url, self.config.dataset_id, limit, offset
        );

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let text = response.text().await?;

        let body: DatastoreResponse = serde_json::from_str(&text)
            .map_err(|e| FetchError::UpstreamFormat(format!("malformed payload: {}", e)))?;

        if !body.success {
            return Err(FetchError::UpstreamFormat(
                "upstream reported success=false".to_string(),
            ));
        }
        let result = body
            .result
            .ok_or_else(|| FetchError::UpstreamFormat("missing result object".to_string()))?;

        let records = result
            .records
            .into_iter()
            .map(RawRecord::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            records,
            total: result.total,
        })
    }
}
