//! Core data models for HDB Resale CLI
//!
//! This module contains the data types used throughout the application
//! for representing resale transactions, transaction months, and the
//! assembled dataset.

pub mod fetcher;

pub use fetcher::{CancelToken, FetchError, FetchProgress, Fetcher, FetcherConfig, RetryConfig};

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// A calendar month (year + month), the time granularity of the upstream dataset
///
/// Transactions are reported per month, formatted `YYYY-MM` upstream. The type
/// orders chronologically and supports month arithmetic for the freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Month {
    /// Calendar year
    pub year: i32,
    /// Month of year, 1-12
    pub month: u32,
}

impl Month {
    /// Creates a Month, returning `None` when the month number is out of range
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    /// Parses a `YYYY-MM` string as used by the upstream `month` field
    pub fn parse(s: &str) -> Option<Self> {
        let (year, month) = s.split_once('-')?;
        Self::new(year.parse().ok()?, month.parse().ok()?)
    }

    /// The month containing the given date
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Number of whole months from `earlier` to `self`
    ///
    /// Negative when `earlier` is actually later than `self`.
    pub fn months_since(self, earlier: Month) -> i32 {
        (self.year * 12 + self.month as i32) - (earlier.year * 12 + earlier.month as i32)
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl TryFrom<String> for Month {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| format!("invalid month '{}', expected YYYY-MM", s))
    }
}

impl From<Month> for String {
    fn from(m: Month) -> String {
        m.to_string()
    }
}

/// One resale transaction as published by data.gov.sg
///
/// All fields except the two derived ones arrive verbatim from the upstream
/// source. `price_per_sqm` and `flat_age` are computed once after a fetch via
/// [`Dataset::derive_fields`] and persisted alongside the raw fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResaleRecord {
    /// Transaction month
    pub month: Month,
    /// Town the flat is located in (e.g. "ANG MO KIO")
    pub town: String,
    /// Flat type (e.g. "4 ROOM")
    pub flat_type: String,
    /// Block number
    pub block: String,
    /// Street name
    pub street_name: String,
    /// Storey range as reported upstream (e.g. "04 TO 06")
    pub storey_range: String,
    /// Floor area in square meters
    pub floor_area_sqm: f64,
    /// Flat model (e.g. "New Generation")
    pub flat_model: String,
    /// Year the lease commenced
    pub lease_commence_date: i32,
    /// Remaining lease as reported upstream (e.g. "61 years 04 months")
    pub remaining_lease: String,
    /// Resale price in Singapore dollars
    pub resale_price: f64,
    /// Resale price divided by floor area; `None` when floor area is not positive
    pub price_per_sqm: Option<f64>,
    /// Fetch year minus lease commencement year; `None` before derivation
    pub flat_age: Option<i32>,
}

impl ResaleRecord {
    /// Computes the derived fields for this record
    ///
    /// `fetch_year` is the calendar year of the fetch, so flat age stays
    /// consistent with the cache's fetch timestamp rather than drifting on
    /// every load.
    pub fn derive_fields(&mut self, fetch_year: i32) {
        self.price_per_sqm = if self.floor_area_sqm > 0.0 {
            Some(self.resale_price / self.floor_area_sqm)
        } else {
            None
        };
        self.flat_age = Some(fetch_year - self.lease_commence_date);
    }
}

/// The full set of resale transactions, in the order the upstream pagination
/// returned them
///
/// The upstream source provides no stable row identity, so the dataset is
/// purely positional. Insertion order is not guaranteed to be chronological.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    /// The transaction records
    pub records: Vec<ResaleRecord>,
}

impl Dataset {
    /// Wraps a vector of records as a Dataset
    pub fn new(records: Vec<ResaleRecord>) -> Self {
        Self { records }
    }

    /// Number of records in the dataset
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the dataset holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The most recent transaction month present, if any
    pub fn latest_month(&self) -> Option<Month> {
        self.records.iter().map(|r| r.month).max()
    }

    /// Computes derived fields for every record
    pub fn derive_fields(&mut self, fetch_year: i32) {
        for record in &mut self.records {
            record.derive_fields(fetch_year);
        }
    }

    /// Headline figures for the dataset, or `None` when it is empty
    pub fn summary(&self) -> Option<DatasetSummary> {
        let first_month = self.records.iter().map(|r| r.month).min()?;
        let last_month = self.latest_month()?;

        let count = self.records.len();
        let mean_price = self.records.iter().map(|r| r.resale_price).sum::<f64>() / count as f64;

        let per_sqm: Vec<f64> = self.records.iter().filter_map(|r| r.price_per_sqm).collect();
        let mean_price_per_sqm = if per_sqm.is_empty() {
            None
        } else {
            Some(per_sqm.iter().sum::<f64>() / per_sqm.len() as f64)
        };

        Some(DatasetSummary {
            record_count: count,
            first_month,
            last_month,
            mean_price,
            mean_price_per_sqm,
        })
    }
}

/// Headline figures computed from a [`Dataset`]
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSummary {
    /// Number of transactions
    pub record_count: usize,
    /// Earliest transaction month
    pub first_month: Month,
    /// Latest transaction month
    pub last_month: Month,
    /// Mean resale price
    pub mean_price: f64,
    /// Mean price per square meter over records where it is defined
    pub mean_price_per_sqm: Option<f64>,
}
