//! Command-line interface parsing for HDB Resale CLI
//!
//! This module handles parsing of CLI arguments using clap: the `fetch`,
//! `status` and `info` subcommands plus the global cache directory override.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// HDB Resale CLI - fetch, cache and inspect Singapore resale flat transactions
#[derive(Parser, Debug)]
#[command(name = "hdbresale")]
#[command(about = "Singapore HDB resale transactions from data.gov.sg: fetch, cache, inspect")]
#[command(version)]
pub struct Cli {
    /// Directory for the local cache (defaults to the platform cache dir)
    #[arg(long, value_name = "DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch the full dataset from data.gov.sg and update the local cache
    Fetch {
        /// Refetch even when the cache already covers the current month
        #[arg(long)]
        force: bool,

        /// Rows requested per page (at least 1)
        #[arg(long, default_value_t = 1000, value_name = "N", value_parser = parse_page_size)]
        page_size: usize,

        /// Keep rows fetched before a mid-fetch failure instead of discarding them
        #[arg(long)]
        best_effort: bool,
    },
    /// Report cache freshness without touching the network
    Status,
    /// Print headline figures for the cached dataset
    Info,
}

/// Parses the page size argument, rejecting zero
///
/// A zero page size can never drain the upstream pagination, so it is
/// refused up front rather than silently adjusted.
fn parse_page_size(s: &str) -> Result<usize, String> {
    let n: usize = s
        .parse()
        .map_err(|_| format!("invalid page size '{}'", s))?;
    if n == 0 {
        return Err("page size must be at least 1".to_string());
    }
    Ok(n)
}
