use std::path::PathBuf;

use thiserror::Error;

/// Network or HTTP failure while discovering or downloading. Never fatal.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("no file name in {0}")]
    BadUrl(String),
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedKind {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("empty transaction id")]
    MissingId,
    #[error("price {0:?} is not a non-negative integer")]
    Price(String),
    #[error("unparseable transfer date {0:?}")]
    Date(String),
    #[error("{column} must be a single character, got {value:?}")]
    Code { column: &'static str, value: String },
    #[error("unreadable row: {0}")]
    Csv(String),
}

/// A raw row that could not become a `PricePaidRecord`. Rows are numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row {row}: {kind}")]
pub struct MalformedRecordError {
    pub row: u64,
    pub kind: MalformedKind,
}

/// The durable store cannot be used. Fatal for the current run.
#[derive(Debug, Error)]
pub enum StoreUnavailableError {
    #[error("cannot open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("cannot create store directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreUnavailableError),
}
