use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::aggregator::AggregateReport;
use crate::db::Store;
use crate::error::{LoadError, StoreUnavailableError};
use crate::fetcher::FetchStats;
use crate::loader::{self, LoadReport};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub fn http_client(timeout: Duration, connect_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .build()
}

/// Totals across every stage of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub fetch: Option<FetchStats>,
    pub files_processed: usize,
    pub files_unreadable: usize,
    pub loaded: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub invalid_price: usize,
    pub rejected: usize,
    pub months_aggregated: Option<usize>,
}

impl RunSummary {
    pub fn add_load(&mut self, r: &LoadReport) {
        self.files_processed += 1;
        self.loaded += r.loaded;
        self.duplicates += r.duplicates;
        self.malformed += r.malformed;
        self.invalid_price += r.invalid_price;
        self.rejected += r.rejected;
    }

    pub fn add_aggregate(&mut self, r: &AggregateReport) {
        self.months_aggregated = Some(r.months);
    }

    pub fn skipped(&self) -> usize {
        self.duplicates + self.malformed + self.invalid_price + self.rejected
    }

    pub fn print(&self) {
        if let Some(f) = &self.fetch {
            println!(
                "Fetched {} files ({} downloaded, {} already present, {} failed).",
                f.total, f.downloaded, f.skipped, f.failed
            );
        }
        println!(
            "Files processed: {}{}",
            self.files_processed,
            if self.files_unreadable > 0 {
                format!(" ({} unreadable)", self.files_unreadable)
            } else {
                String::new()
            }
        );
        println!("Records loaded:  {}", self.loaded);
        println!(
            "Records skipped: {} (duplicate {}, malformed {}, invalid price {}, rejected {})",
            self.skipped(),
            self.duplicates,
            self.malformed,
            self.invalid_price,
            self.rejected
        );
        if let Some(m) = self.months_aggregated {
            println!("Months aggregated: {}", m);
        }
    }
}

/// Load each file in order. Unreadable files are skipped; a store failure stops the run.
pub fn load_all(
    store: &Store,
    files: &[PathBuf],
    batch_size: usize,
) -> Result<RunSummary, StoreUnavailableError> {
    let mut summary = RunSummary::default();
    for path in files {
        match loader::load_file(store, path, batch_size) {
            Ok(report) => summary.add_load(&report),
            Err(LoadError::Io { path, source }) => {
                warn!("Skipping {}: {}", path.display(), source);
                summary.files_unreadable += 1;
            }
            Err(LoadError::Store(e)) => return Err(e),
        }
    }
    Ok(summary)
}
