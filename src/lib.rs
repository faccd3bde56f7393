//! HDB Resale CLI Library
//!
//! Fetches Singapore HDB resale flat transactions from the data.gov.sg
//! datastore, caches them locally, and answers whether the cache is fresh
//! enough for the current reporting month. Presentation (charts, tables,
//! dashboards) is left to consumers of this crate.

pub mod cache;
pub mod cli;
pub mod data;
pub mod refresh;
