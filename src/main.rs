//! HDB Resale CLI - fetch and inspect Singapore resale flat transactions
//!
//! Downloads the HDB resale price dataset from data.gov.sg, keeps a local
//! CSV cache with sidecar metadata, and reports how far the cache trails the
//! current reporting month.

use std::error::Error;

use chrono::Utc;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hdbresale::cache::{should_refresh, CacheError, CacheManager};
use hdbresale::cli::{Cli, Command};
use hdbresale::data::{CancelToken, FetchProgress, Fetcher, FetcherConfig};
use hdbresale::refresh::Acquisition;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cache = match &cli.cache_dir {
        Some(dir) => CacheManager::with_dir(dir.clone()),
        None => CacheManager::new()
            .ok_or("could not determine a cache directory; pass --cache-dir")?,
    };

    match cli.command {
        Command::Fetch {
            force,
            page_size,
            best_effort,
        } => run_fetch(cache, force, page_size, best_effort).await,
        Command::Status => run_status(&cache),
        Command::Info => run_info(&cache),
    }
}

/// Downloads the full dataset and commits it to the cache
async fn run_fetch(
    cache: CacheManager,
    force: bool,
    page_size: usize,
    best_effort: bool,
) -> Result<(), Box<dyn Error>> {
    let now = Utc::now();

    if !force {
        if let Ok(metadata) = cache.load_metadata() {
            let advice = should_refresh(&metadata, now);
            if !advice.refresh_recommended {
                println!(
                    "Cache already covers the current reporting month ({}); use --force to refetch.",
                    metadata.latest_record_month
                );
                return Ok(());
            }
            println!("Cache status: {}", advice.message());
        }
    }

    let fetcher = Fetcher::with_config(FetcherConfig {
        page_size,
        ..FetcherConfig::default()
    });

    // Ctrl-C stops issuing page requests; the existing cache is untouched
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("cancellation requested, stopping after the current page");
                cancel.cancel();
            }
        });
    }

    let (tx, mut rx) = mpsc::channel(32);
    let progress = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            if let FetchProgress::Page { fetched, total } = update {
                match total {
                    Some(total) => info!("fetched {} of {} rows", fetched, total),
                    None => info!("fetched {} rows", fetched),
                }
            }
        }
    });

    let mut flow = Acquisition::new(fetcher, cache);
    let (advice, stopped_by) = if best_effort {
        flow.refresh_best_effort(now, Some(tx), &cancel).await?
    } else {
        (flow.refresh(now, Some(tx), &cancel).await?, None)
    };
    let _ = progress.await;

    if let Some(e) = stopped_by {
        warn!(error = %e, "fetch stopped early; cached the rows assembled before the failure");
    }
    if let Some(metadata) = flow.metadata() {
        println!(
            "Cached {} rows (latest month {}).",
            metadata.record_count, metadata.latest_record_month
        );
    }
    println!("Status: {}", advice.message());

    Ok(())
}

/// Reports cache freshness from the sidecar metadata alone
fn run_status(cache: &CacheManager) -> Result<(), Box<dyn Error>> {
    match cache.load_metadata() {
        Ok(metadata) => {
            let advice = should_refresh(&metadata, Utc::now());
            println!("Rows cached:  {}", metadata.record_count);
            println!("Latest month: {}", metadata.latest_record_month);
            println!(
                "Last fetched: {} ({})",
                metadata.last_fetch_timestamp.format("%Y-%m-%d %H:%M UTC"),
                advice.age.describe()
            );
            println!("Freshness:    {}", advice.message());
            Ok(())
        }
        Err(CacheError::NotFound) => {
            println!("No cached dataset yet. Run `hdbresale fetch` to download it.");
            Ok(())
        }
        Err(CacheError::Corrupt(reason)) => {
            warn!(%reason, "cache unusable");
            println!("Cached dataset is unusable; run `hdbresale fetch` to rebuild it.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Prints headline figures for the cached dataset
fn run_info(cache: &CacheManager) -> Result<(), Box<dyn Error>> {
    match cache.load() {
        Ok((dataset, metadata)) => {
            if let Some(summary) = dataset.summary() {
                println!("Transactions: {}", summary.record_count);
                println!(
                    "Period:       {} to {}",
                    summary.first_month, summary.last_month
                );
                println!("Avg price:    S${:.0}", summary.mean_price);
                if let Some(per_sqm) = summary.mean_price_per_sqm {
                    println!("Avg per sqm:  S${:.0}", per_sqm);
                }
            }
            println!(
                "Fetched:      {}",
                metadata.last_fetch_timestamp.format("%Y-%m-%d %H:%M UTC")
            );
            Ok(())
        }
        Err(CacheError::NotFound) => {
            println!("No cached dataset yet. Run `hdbresale fetch` to download it.");
            Ok(())
        }
        Err(CacheError::Corrupt(reason)) => {
            warn!(%reason, "cache unusable");
            println!("Cached dataset is unusable; run `hdbresale fetch` to rebuild it.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
