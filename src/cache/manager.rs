//! Cache manager for the locally persisted resale dataset
//!
//! Owns the on-disk dataset (CSV, one row per transaction) and its sidecar
//! metadata (JSON), commits updates atomically via temp-file-then-rename, and
//! implements the freshness decision that tells consumers whether a refresh
//! is worthwhile.

use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::data::{Dataset, Month, ResaleRecord};

/// File name of the persisted dataset
const DATASET_FILE: &str = "resale_flat_data.csv";

/// File name of the sidecar metadata
const METADATA_FILE: &str = "data_metadata.json";

/// Errors that can occur when loading or persisting the cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// No cache has ever been written (expected on first run)
    #[error("no cached dataset found")]
    NotFound,

    /// The cache exists but is unreadable or internally inconsistent;
    /// callers should treat it as absent and warn
    #[error("cached dataset is unusable: {0}")]
    Corrupt(String),

    /// Writing the cache failed; the prior committed cache remains
    /// authoritative
    #[error("failed to persist dataset: {0}")]
    Persist(#[from] io::Error),
}

/// Metadata describing the committed dataset
///
/// Written wholesale after every successful fetch, never partially updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// When the dataset was fetched
    pub last_fetch_timestamp: DateTime<Utc>,
    /// Most recent transaction month present in the dataset
    pub latest_record_month: Month,
    /// Number of rows in the dataset
    pub record_count: usize,
    /// Hex-encoded SHA-256 of the dataset file's bytes
    ///
    /// Ties the metadata to the exact dataset it was derived from, so a
    /// crash between the two commit renames is detected at load even when
    /// the old and new datasets happen to have the same row count.
    pub dataset_sha256: String,
}

/// Whether the cached data covers the current reporting month
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Latest cached month matches or exceeds the current month; the source
    /// publishes monthly, so refetching now wastes calls
    Current,
    /// Latest cached month trails the current month by `months`
    Behind { months: u32 },
}

/// Wall-clock age band of the last fetch, for advisory display only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAge {
    /// Fetched today
    SameDay,
    /// Fetched 1-7 days ago
    WithinWeek,
    /// Fetched 8-30 days ago
    WithinMonth,
    /// Fetched more than 30 days ago
    Older,
}

impl CacheAge {
    /// Classifies a day count into an age band
    fn from_days(days: i64) -> Self {
        match days {
            i64::MIN..=0 => CacheAge::SameDay,
            1..=7 => CacheAge::WithinWeek,
            8..=30 => CacheAge::WithinMonth,
            _ => CacheAge::Older,
        }
    }

    /// Human-readable description of the band
    pub fn describe(&self) -> &'static str {
        match self {
            CacheAge::SameDay => "fetched today",
            CacheAge::WithinWeek => "fetched within the last week",
            CacheAge::WithinMonth => "fetched within the last month",
            CacheAge::Older => "fetched more than a month ago",
        }
    }
}

/// The freshness decision for a cached dataset
///
/// Advisory, never a hard block: consumers may keep using current data or
/// force a refresh regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshAdvice {
    /// Whether the data covers the current reporting month
    pub freshness: Freshness,
    /// How long ago the last fetch ran
    pub age: CacheAge,
    /// Whether a refresh is recommended
    pub refresh_recommended: bool,
}

impl RefreshAdvice {
    /// Advisory message for display
    pub fn message(&self) -> String {
        match self.freshness {
            Freshness::Current => {
                "data is current for this reporting month, refresh optional".to_string()
            }
            Freshness::Behind { months: 1 } => "1 month behind, refresh recommended".to_string(),
            Freshness::Behind { months } => {
                format!("{} months behind, refresh recommended", months)
            }
        }
    }
}

/// Decides whether cached data warrants a refresh
///
/// Pure: no I/O, no clock reads; `now` is supplied by the caller. The decision
/// compares reporting months, while the wall-clock age band is carried along
/// purely for display.
pub fn should_refresh(metadata: &CacheMetadata, now: DateTime<Utc>) -> RefreshAdvice {
    let current_month = Month::from_date(now.date_naive());
    let months_behind = current_month.months_since(metadata.latest_record_month);

    let freshness = if months_behind >= 1 {
        Freshness::Behind {
            months: months_behind as u32,
        }
    } else {
        Freshness::Current
    };

    let days_old = (now - metadata.last_fetch_timestamp).num_days();

    RefreshAdvice {
        freshness,
        age: CacheAge::from_days(days_old),
        refresh_recommended: months_behind >= 1,
    }
}

/// Manages the persisted dataset and its metadata on disk
///
/// All state lives under an explicitly supplied directory; there is no
/// process-wide cache location. The XDG-compliant default
/// (`~/.cache/hdbresale/` on Linux) is available via [`CacheManager::new`].
#[derive(Debug, Clone)]
pub struct CacheManager {
    /// Directory holding the dataset and metadata files
    cache_dir: PathBuf,
}

impl CacheManager {
    /// Creates a CacheManager using the XDG-compliant cache directory
    ///
    /// Returns `None` if no cache directory can be determined (e.g. no home
    /// directory).
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "hdbresale")?;
        Some(Self {
            cache_dir: project_dirs.cache_dir().to_path_buf(),
        })
    }

    /// Creates a CacheManager rooted at a specific directory
    pub fn with_dir(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn dataset_path(&self) -> PathBuf {
        self.cache_dir.join(DATASET_FILE)
    }

    fn metadata_path(&self) -> PathBuf {
        self.cache_dir.join(METADATA_FILE)
    }

    fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.cache_dir)
    }

    /// Whether a committed cache exists
    pub fn exists(&self) -> bool {
        self.metadata_path().exists()
    }

    /// Reads just the sidecar metadata
    ///
    /// Cheaper than [`CacheManager::load`] when only the freshness decision
    /// is needed.
    pub fn load_metadata(&self) -> Result<CacheMetadata, CacheError> {
        let path = self.metadata_path();
        if !path.exists() {
            return Err(CacheError::NotFound);
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| CacheError::Corrupt(format!("metadata unreadable: {}", e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| CacheError::Corrupt(format!("metadata malformed: {}", e)))
    }

    /// Loads the committed dataset and its metadata
    ///
    /// # Returns
    /// * `Ok((Dataset, CacheMetadata))` on success
    /// * `Err(CacheError::NotFound)` when no cache has ever been written,
    ///   so callers can tell "never fetched" from "fetched but empty"
    /// * `Err(CacheError::Corrupt)` when either file is unreadable or the
    ///   dataset disagrees with the metadata's fingerprint or row count
    pub fn load(&self) -> Result<(Dataset, CacheMetadata), CacheError> {
        let metadata = self.load_metadata()?;

        let dataset_path = self.dataset_path();
        if !dataset_path.exists() {
            return Err(CacheError::Corrupt(
                "metadata present but dataset file missing".to_string(),
            ));
        }

        let bytes = fs::read(&dataset_path)
            .map_err(|e| CacheError::Corrupt(format!("dataset unreadable: {}", e)))?;

        let digest = hex::encode(Sha256::digest(&bytes));
        if digest != metadata.dataset_sha256 {
            return Err(CacheError::Corrupt(
                "dataset does not match the fingerprint in metadata".to_string(),
            ));
        }

        let mut reader = csv::Reader::from_reader(bytes.as_slice());

        let mut records: Vec<ResaleRecord> = Vec::with_capacity(metadata.record_count);
        for row in reader.deserialize() {
            let record =
                row.map_err(|e| CacheError::Corrupt(format!("dataset row malformed: {}", e)))?;
            records.push(record);
        }

        if records.len() != metadata.record_count {
            return Err(CacheError::Corrupt(format!(
                "metadata reports {} rows but dataset holds {}",
                metadata.record_count,
                records.len()
            )));
        }

        debug!(rows = records.len(), "cache loaded");
        Ok((Dataset::new(records), metadata))
    }

    /// Persists a dataset and freshly derived metadata
    ///
    /// Both files are written to temporaries and then renamed into place, so
    /// a crash mid-write never leaves a half-written file behind. The
    /// metadata carries a SHA-256 of the dataset bytes, so a crash between
    /// the two renames is caught at load time as a fingerprint mismatch even
    /// when old and new datasets have the same row count. Empty datasets are
    /// refused rather than cached, per the contract that a failure is never
    /// stored as empty data.
    ///
    /// # Returns
    /// * `Ok(CacheMetadata)` - The metadata that was committed
    /// * `Err(CacheError::Persist)` - Disk write failed; the prior cache is
    ///   untouched
    pub fn save(
        &self,
        dataset: &Dataset,
        now: DateTime<Utc>,
    ) -> Result<CacheMetadata, CacheError> {
        let latest_record_month = dataset.latest_month().ok_or_else(|| {
            CacheError::Persist(io::Error::new(
                io::ErrorKind::InvalidData,
                "refusing to cache an empty dataset",
            ))
        })?;

        self.ensure_dir()?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in &dataset.records {
            writer.serialize(record).map_err(csv_io_error)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let metadata = CacheMetadata {
            last_fetch_timestamp: now,
            latest_record_month,
            record_count: dataset.len(),
            dataset_sha256: hex::encode(Sha256::digest(&bytes)),
        };

        let dataset_path = self.dataset_path();
        let metadata_path = self.metadata_path();
        let dataset_tmp = dataset_path.with_extension("csv.tmp");
        let metadata_tmp = metadata_path.with_extension("json.tmp");

        fs::write(&dataset_tmp, &bytes)?;
        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&metadata_tmp, json)?;

        fs::rename(&dataset_tmp, &dataset_path)?;
        fs::rename(&metadata_tmp, &metadata_path)?;

        debug!(rows = metadata.record_count, "cache committed");
        Ok(metadata)
    }
}

fn csv_io_error(e: csv::Error) -> CacheError {
    CacheError::Persist(io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn create_test_cache() -> (CacheManager, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let cache = CacheManager::with_dir(temp_dir.path().to_path_buf());
        (cache, temp_dir)
    }

    fn sample_record(month: &str, price: f64) -> ResaleRecord {
        ResaleRecord {
            month: Month::parse(month).unwrap(),
            town: "TAMPINES".to_string(),
            flat_type: "5 ROOM".to_string(),
            block: "491".to_string(),
            street_name: "TAMPINES ST 45".to_string(),
            storey_range: "07 TO 09".to_string(),
            floor_area_sqm: 122.0,
            flat_model: "Improved".to_string(),
            lease_commence_date: 1993,
            remaining_lease: "66 years 08 months".to_string(),
            resale_price: price,
            price_per_sqm: None,
            flat_age: None,
        }
    }

    fn sample_dataset() -> Dataset {
        let mut dataset = Dataset::new(vec![
            sample_record("2025-04", 620_000.0),
            sample_record("2025-06", 655_000.0),
            sample_record("2025-05", 640_000.0),
        ]);
        dataset.derive_fields(2025);
        dataset
    }

    fn metadata_for(latest: &str, fetched: &str) -> CacheMetadata {
        CacheMetadata {
            last_fetch_timestamp: fetched.parse().unwrap(),
            latest_record_month: Month::parse(latest).unwrap(),
            record_count: 3,
            dataset_sha256: String::new(),
        }
    }

    #[test]
    fn test_should_refresh_current_month() {
        let metadata = metadata_for("2025-08", "2025-08-01T00:00:00Z");
        let now = Utc.with_ymd_and_hms(2025, 8, 15, 12, 0, 0).unwrap();

        let advice = should_refresh(&metadata, now);
        assert_eq!(advice.freshness, Freshness::Current);
        assert!(!advice.refresh_recommended);
        assert!(advice.message().contains("current"));
    }

    #[test]
    fn test_should_refresh_two_months_behind() {
        // Latest month 2025-06, fetched 2025-07-01, checked 2025-08-15
        let metadata = metadata_for("2025-06", "2025-07-01T00:00:00Z");
        let now = Utc.with_ymd_and_hms(2025, 8, 15, 12, 0, 0).unwrap();

        let advice = should_refresh(&metadata, now);
        assert_eq!(advice.freshness, Freshness::Behind { months: 2 });
        assert!(advice.refresh_recommended);
        assert_eq!(advice.message(), "2 months behind, refresh recommended");
        assert_eq!(advice.age, CacheAge::Older);
    }

    #[test]
    fn test_should_refresh_three_months_behind_surfaces_magnitude() {
        let metadata = metadata_for("2025-05", "2025-05-20T00:00:00Z");
        let now = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();

        let advice = should_refresh(&metadata, now);
        assert_eq!(advice.freshness, Freshness::Behind { months: 3 });
    }

    #[test]
    fn test_should_refresh_single_month_message_is_singular() {
        let metadata = metadata_for("2025-07", "2025-07-15T00:00:00Z");
        let now = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();

        let advice = should_refresh(&metadata, now);
        assert_eq!(advice.message(), "1 month behind, refresh recommended");
    }

    #[test]
    fn test_should_refresh_is_pure() {
        let metadata = metadata_for("2025-06", "2025-07-01T00:00:00Z");
        let now = Utc.with_ymd_and_hms(2025, 8, 15, 12, 0, 0).unwrap();

        let first = should_refresh(&metadata, now);
        let second = should_refresh(&metadata, now);
        assert_eq!(first, second);
    }

    #[test]
    fn test_should_refresh_future_data_counts_as_current() {
        // Clock skew or early upstream publish: months_behind < 0
        let metadata = metadata_for("2025-09", "2025-08-30T00:00:00Z");
        let now = Utc.with_ymd_and_hms(2025, 8, 31, 0, 0, 0).unwrap();

        let advice = should_refresh(&metadata, now);
        assert_eq!(advice.freshness, Freshness::Current);
        assert!(!advice.refresh_recommended);
    }

    #[test]
    fn test_cache_age_bands() {
        assert_eq!(CacheAge::from_days(0), CacheAge::SameDay);
        assert_eq!(CacheAge::from_days(1), CacheAge::WithinWeek);
        assert_eq!(CacheAge::from_days(7), CacheAge::WithinWeek);
        assert_eq!(CacheAge::from_days(8), CacheAge::WithinMonth);
        assert_eq!(CacheAge::from_days(30), CacheAge::WithinMonth);
        assert_eq!(CacheAge::from_days(31), CacheAge::Older);
        assert_eq!(CacheAge::from_days(365), CacheAge::Older);
    }

    #[test]
    fn test_load_on_empty_dir_is_not_found() {
        let (cache, _temp_dir) = create_test_cache();
        assert!(!cache.exists());
        assert!(matches!(cache.load(), Err(CacheError::NotFound)));
        assert!(matches!(cache.load_metadata(), Err(CacheError::NotFound)));
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let (cache, _temp_dir) = create_test_cache();
        let dataset = sample_dataset();
        let now = Utc.with_ymd_and_hms(2025, 8, 15, 9, 30, 0).unwrap();

        let saved_metadata = cache.save(&dataset, now).expect("save should succeed");
        assert_eq!(saved_metadata.record_count, 3);
        assert_eq!(
            saved_metadata.latest_record_month,
            Month::new(2025, 6).unwrap()
        );
        assert_eq!(saved_metadata.last_fetch_timestamp, now);

        let (loaded, loaded_metadata) = cache.load().expect("load should succeed");
        assert_eq!(loaded, dataset);
        assert_eq!(loaded_metadata, saved_metadata);
    }

    #[test]
    fn test_saved_dataset_is_headed_csv() {
        let (cache, temp_dir) = create_test_cache();
        let now = Utc.with_ymd_and_hms(2025, 8, 15, 9, 30, 0).unwrap();
        cache.save(&sample_dataset(), now).unwrap();

        let content = fs::read_to_string(temp_dir.path().join(DATASET_FILE)).unwrap();
        let header = content.lines().next().unwrap();
        assert!(header.starts_with("month,town,flat_type,block,street_name,storey_range"));
        assert!(header.contains("resale_price"));
        assert!(header.contains("price_per_sqm"));
        assert_eq!(content.lines().count(), 4); // header + 3 rows
    }

    #[test]
    fn test_save_refuses_empty_dataset_and_keeps_prior_cache() {
        let (cache, _temp_dir) = create_test_cache();
        let dataset = sample_dataset();
        let now = Utc.with_ymd_and_hms(2025, 8, 15, 9, 30, 0).unwrap();
        cache.save(&dataset, now).unwrap();

        let result = cache.save(&Dataset::default(), now);
        assert!(matches!(result, Err(CacheError::Persist(_))));

        // Prior committed cache remains authoritative
        let (loaded, metadata) = cache.load().unwrap();
        assert_eq!(loaded, dataset);
        assert_eq!(metadata.record_count, 3);
    }

    #[test]
    fn test_malformed_metadata_is_corrupt() {
        let (cache, temp_dir) = create_test_cache();
        fs::create_dir_all(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join(METADATA_FILE), "{ not json").unwrap();

        assert!(matches!(cache.load(), Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn test_metadata_without_dataset_is_corrupt() {
        let (cache, temp_dir) = create_test_cache();
        let metadata = metadata_for("2025-06", "2025-07-01T00:00:00Z");
        fs::write(
            temp_dir.path().join(METADATA_FILE),
            serde_json::to_string(&metadata).unwrap(),
        )
        .unwrap();

        assert!(matches!(cache.load(), Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn test_row_count_mismatch_is_corrupt() {
        let (cache, temp_dir) = create_test_cache();
        let now = Utc.with_ymd_and_hms(2025, 8, 15, 9, 30, 0).unwrap();
        cache.save(&sample_dataset(), now).unwrap();

        // Tamper with the committed row count
        let metadata_path = temp_dir.path().join(METADATA_FILE);
        let mut metadata: CacheMetadata =
            serde_json::from_str(&fs::read_to_string(&metadata_path).unwrap()).unwrap();
        metadata.record_count = 99;
        fs::write(&metadata_path, serde_json::to_string(&metadata).unwrap()).unwrap();

        match cache.load() {
            Err(CacheError::Corrupt(reason)) => assert!(reason.contains("99")),
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_same_row_count_content_swap_is_corrupt() {
        let (cache, temp_dir) = create_test_cache();
        let now = Utc.with_ymd_and_hms(2025, 8, 15, 9, 30, 0).unwrap();
        cache.save(&sample_dataset(), now).unwrap();

        // Same row count, same byte length, different content
        let dataset_path = temp_dir.path().join(DATASET_FILE);
        let content = fs::read_to_string(&dataset_path).unwrap();
        fs::write(&dataset_path, content.replace("491", "492")).unwrap();

        match cache.load() {
            Err(CacheError::Corrupt(reason)) => assert!(reason.contains("fingerprint")),
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_interleaved_renames_detected_by_fingerprint() {
        // A crash between the dataset rename and the metadata rename pairs
        // the new dataset with the old metadata. With equal row counts only
        // the fingerprint can tell them apart.
        let (cache, temp_dir) = create_test_cache();
        let t1 = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
        cache.save(&sample_dataset(), t1).unwrap();
        let old_metadata = fs::read_to_string(temp_dir.path().join(METADATA_FILE)).unwrap();

        // Next month's refresh: same number of rows, revised prices
        let mut revised = Dataset::new(vec![
            sample_record("2025-05", 625_000.0),
            sample_record("2025-07", 660_000.0),
            sample_record("2025-06", 645_000.0),
        ]);
        revised.derive_fields(2025);
        let t2 = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        cache.save(&revised, t2).unwrap();

        // Roll the metadata back as the interrupted commit would leave it
        fs::write(temp_dir.path().join(METADATA_FILE), old_metadata).unwrap();

        match cache.load() {
            Err(CacheError::Corrupt(reason)) => assert!(reason.contains("fingerprint")),
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_crash_before_rename_leaves_committed_cache_intact() {
        let (cache, temp_dir) = create_test_cache();
        let dataset = sample_dataset();
        let now = Utc.with_ymd_and_hms(2025, 8, 15, 9, 30, 0).unwrap();
        cache.save(&dataset, now).unwrap();

        // Simulate a crash after the temp writes but before either rename:
        // stray temp files exist alongside the committed pair
        fs::write(
            temp_dir.path().join("resale_flat_data.csv.tmp"),
            "month,town\n2025-07,QUEENSTOWN\n",
        )
        .unwrap();
        fs::write(temp_dir.path().join("data_metadata.json.tmp"), "{}").unwrap();

        let (loaded, metadata) = cache.load().expect("committed cache must stay loadable");
        assert_eq!(loaded, dataset);
        assert_eq!(metadata.record_count, 3);
        assert_eq!(metadata.last_fetch_timestamp, now);
    }

    #[test]
    fn test_resave_overwrites_wholesale() {
        let (cache, _temp_dir) = create_test_cache();
        let first = sample_dataset();
        let t1 = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
        cache.save(&first, t1).unwrap();

        let mut second = Dataset::new(vec![
            sample_record("2025-07", 700_000.0),
            sample_record("2025-08", 710_000.0),
        ]);
        second.derive_fields(2025);
        let t2 = Utc.with_ymd_and_hms(2025, 8, 15, 0, 0, 0).unwrap();
        cache.save(&second, t2).unwrap();

        let (loaded, metadata) = cache.load().unwrap();
        assert_eq!(loaded, second);
        assert_eq!(metadata.record_count, 2);
        assert_eq!(metadata.latest_record_month, Month::new(2025, 8).unwrap());
        assert_eq!(metadata.last_fetch_timestamp, t2);
    }

    #[test]
    fn test_save_creates_cache_directory() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested").join("cache");
        let cache = CacheManager::with_dir(nested.clone());
        let now = Utc.with_ymd_and_hms(2025, 8, 15, 0, 0, 0).unwrap();

        cache.save(&sample_dataset(), now).unwrap();
        assert!(nested.join(DATASET_FILE).exists());
        assert!(nested.join(METADATA_FILE).exists());
    }

    #[test]
    fn test_new_uses_project_cache_path() {
        if let Some(cache) = CacheManager::new() {
            let path = cache.cache_dir.to_string_lossy();
            assert!(path.contains("hdbresale"));
        }
        // Passes when new() returns None (no home directory in CI)
    }
}
