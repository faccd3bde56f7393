//! Acquisition flow: load-or-fetch with explicit session states
//!
//! Wires the [`Fetcher`] and [`CacheManager`] together behind the state
//! machine a consumer (dashboard, CLI) drives:
//!
//! ```text
//! NoCache -> Loading -> { Fresh, Stale }
//! Stale   -> Refreshing -> { Fresh, RefreshFailed }
//! RefreshFailed -> Stale   (stale data is never discarded)
//! ```
//!
//! `Fresh` and `Stale` are both valid resting states; nothing here forces a
//! blocking refresh.

use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::{should_refresh, CacheError, CacheManager, CacheMetadata, RefreshAdvice};
use crate::data::{CancelToken, Dataset, FetchError, FetchProgress, Fetcher};

/// Where a session currently stands in the acquisition flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No usable cache exists yet
    NoCache,
    /// Reading the cache from disk
    Loading,
    /// Cached data covers the current reporting month
    Fresh,
    /// Cached data trails the current month; refresh recommended
    Stale,
    /// A fetch is in flight
    Refreshing,
    /// The last refresh failed; prior data (if any) is still held
    RefreshFailed,
}

/// Errors surfaced by the acquisition flow
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Fetching from the upstream source failed
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Loading or persisting the cache failed
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Drives one dashboard session's load-or-fetch lifecycle
///
/// Holds the in-memory dataset once loaded or fetched, and only ever replaces
/// it after a fully successful fetch-and-persist. A failed refresh leaves the
/// held data and the on-disk cache untouched.
#[derive(Debug)]
pub struct Acquisition {
    fetcher: Fetcher,
    cache: CacheManager,
    state: SessionState,
    dataset: Option<Dataset>,
    metadata: Option<CacheMetadata>,
}

impl Acquisition {
    /// Creates an acquisition flow over the given fetcher and cache
    pub fn new(fetcher: Fetcher, cache: CacheManager) -> Self {
        Self {
            fetcher,
            cache,
            state: SessionState::NoCache,
            dataset: None,
            metadata: None,
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The held dataset, once one has been loaded or fetched
    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    /// Metadata for the held dataset
    pub fn metadata(&self) -> Option<&CacheMetadata> {
        self.metadata.as_ref()
    }

    /// Loads the cached dataset and classifies the session as Fresh or Stale
    ///
    /// A corrupt cache is treated as absent, with a warning; the session
    /// lands in `NoCache` and the error is surfaced so the caller can decide
    /// whether to mention it.
    pub fn load(&mut self, now: DateTime<Utc>) -> Result<RefreshAdvice, CacheError> {
        self.state = SessionState::Loading;

        match self.cache.load() {
            Ok((dataset, metadata)) => {
                let advice = should_refresh(&metadata, now);
                self.state = if advice.refresh_recommended {
                    SessionState::Stale
                } else {
                    SessionState::Fresh
                };
                self.dataset = Some(dataset);
                self.metadata = Some(metadata);
                Ok(advice)
            }
            Err(CacheError::NotFound) => {
                self.state = SessionState::NoCache;
                Err(CacheError::NotFound)
            }
            Err(e) => {
                warn!(error = %e, "treating unusable cache as absent");
                self.state = SessionState::NoCache;
                Err(e)
            }
        }
    }

    /// Fetches the full dataset from upstream and commits it to the cache
    ///
    /// On success the session lands in `Fresh` and the held dataset is
    /// replaced. On any failure (fetch, cancellation, persist) it lands in
    /// `RefreshFailed` while the previously held data and the on-disk cache
    /// stay exactly as they were.
    pub async fn refresh(
        &mut self,
        now: DateTime<Utc>,
        progress: Option<mpsc::Sender<FetchProgress>>,
        cancel: &CancelToken,
    ) -> Result<RefreshAdvice, AcquireError> {
        self.state = SessionState::Refreshing;

        let mut dataset = match self.fetcher.fetch_all(progress, cancel).await {
            Ok(dataset) => dataset,
            Err(e) => {
                self.state = SessionState::RefreshFailed;
                return Err(e.into());
            }
        };
        dataset.derive_fields(now.year());

        let metadata = match self.cache.save(&dataset, now) {
            Ok(metadata) => metadata,
            Err(e) => {
                // Refresh result is discarded; the prior cache stays
                // authoritative
                self.state = SessionState::RefreshFailed;
                return Err(e.into());
            }
        };

        let advice = should_refresh(&metadata, now);
        self.state = SessionState::Fresh;
        self.dataset = Some(dataset);
        self.metadata = Some(metadata);
        Ok(advice)
    }

    /// Fetches upstream, keeping rows assembled before a mid-fetch failure
    ///
    /// Opting into best effort accepts a committed prefix of the upstream
    /// data when the source fails partway; the error that cut the fetch
    /// short is returned alongside the advice. Cancellation is different:
    /// the user stopping the fetch must not replace the committed cache
    /// with a truncated one, so a cancelled fetch commits nothing and
    /// errors like a plain [`Acquisition::refresh`] would.
    pub async fn refresh_best_effort(
        &mut self,
        now: DateTime<Utc>,
        progress: Option<mpsc::Sender<FetchProgress>>,
        cancel: &CancelToken,
    ) -> Result<(RefreshAdvice, Option<FetchError>), AcquireError> {
        self.state = SessionState::Refreshing;

        let (mut dataset, stopped_by) = self.fetcher.fetch_all_best_effort(progress, cancel).await;

        if matches!(stopped_by, Some(FetchError::Cancelled)) {
            self.state = SessionState::RefreshFailed;
            return Err(AcquireError::Fetch(FetchError::Cancelled));
        }
        if dataset.is_empty() {
            self.state = SessionState::RefreshFailed;
            return Err(match stopped_by {
                Some(e) => AcquireError::Fetch(e),
                None => AcquireError::Fetch(FetchError::UpstreamFormat(
                    "upstream returned no rows".to_string(),
                )),
            });
        }

        dataset.derive_fields(now.year());
        let metadata = match self.cache.save(&dataset, now) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.state = SessionState::RefreshFailed;
                return Err(e.into());
            }
        };

        // A committed prefix may still trail the current month
        let advice = should_refresh(&metadata, now);
        self.state = if advice.refresh_recommended {
            SessionState::Stale
        } else {
            SessionState::Fresh
        };
        self.dataset = Some(dataset);
        self.metadata = Some(metadata);
        Ok((advice, stopped_by))
    }

    /// Settles a failed refresh back into a resting state
    ///
    /// `Stale` when prior data is held, `NoCache` otherwise. The caller may
    /// retry `refresh` from either.
    pub fn dismiss_failure(&mut self) {
        if self.state == SessionState::RefreshFailed {
            self.state = if self.dataset.is_some() {
                SessionState::Stale
            } else {
                SessionState::NoCache
            };
        }
    }
}
