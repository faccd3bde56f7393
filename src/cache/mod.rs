//! Local persistence and freshness decisions for the resale dataset

pub mod manager;

pub use manager::{
    should_refresh, CacheAge, CacheError, CacheManager, CacheMetadata, Freshness, RefreshAdvice,
};
