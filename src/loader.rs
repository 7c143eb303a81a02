use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::db::{self, InsertOutcome, PricePaidRecord, Store};
use crate::discovery::{parse_part_name, PartFile};
use crate::error::{LoadError, MalformedKind, MalformedRecordError, StoreUnavailableError};
use crate::normalizer;

/// Per-file load counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub file: String,
    pub loaded: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub invalid_price: usize,
    pub rejected: usize,
}

impl LoadReport {
    pub fn skipped(&self) -> usize {
        self.duplicates + self.malformed + self.invalid_price + self.rejected
    }

    fn tally(&mut self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Inserted => self.loaded += 1,
            InsertOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

/// Raw part files in `dir` ordered by year then part, optionally restricted to `years`.
pub fn raw_files(dir: &Path, years: &[i32]) -> std::io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<(PartFile, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let part = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_part_name)?;
            (years.is_empty() || years.contains(&part.year)).then_some((part, path))
        })
        .collect();
    files.sort_by(|(a, pa), (b, pb)| (a.year, a.part, pa).cmp(&(b.year, b.part, pb)));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Normalize and load one raw file.
pub fn load_file(store: &Store, path: &Path, batch_size: usize) -> Result<LoadReport, LoadError> {
    let records = normalizer::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    info!(file = %file_name, "Loading");
    let report = load_records(store, &file_name, records, batch_size)?;
    store.record_load(
        &report.file,
        report.loaded,
        report.duplicates,
        report.malformed,
        report.invalid_price,
        report.rejected,
    )?;
    info!(
        file = %report.file,
        loaded = report.loaded,
        duplicates = report.duplicates,
        malformed = report.malformed,
        invalid_price = report.invalid_price,
        rejected = report.rejected,
        skipped = report.skipped(),
        "Loaded"
    );
    Ok(report)
}

/// Insert records in file order, `batch_size` per transaction.
pub fn load_records<I>(
    store: &Store,
    file_name: &str,
    records: I,
    batch_size: usize,
) -> Result<LoadReport, StoreUnavailableError>
where
    I: IntoIterator<Item = Result<PricePaidRecord, MalformedRecordError>>,
{
    let batch_size = batch_size.max(1);
    let mut report = LoadReport {
        file: file_name.to_string(),
        ..Default::default()
    };
    let mut batch = Vec::with_capacity(batch_size);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg} {pos} rows ({per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(file_name.to_string());

    for item in records {
        pb.inc(1);
        match item {
            Ok(record) => {
                batch.push(record);
                if batch.len() >= batch_size {
                    flush(store, &batch, &mut report)?;
                    batch.clear();
                }
            }
            Err(MalformedRecordError {
                row,
                kind: MalformedKind::Price(value),
            }) => {
                debug!(file = file_name, row, price = %value, "Dropping row without a usable price");
                report.invalid_price += 1;
            }
            Err(e) => {
                warn!(file = file_name, "Skipping malformed record: {}", e);
                report.malformed += 1;
            }
        }
    }
    if !batch.is_empty() {
        flush(store, &batch, &mut report)?;
    }

    pb.finish_and_clear();
    Ok(report)
}

/// Write one batch. If the batch transaction trips a record-level constraint, it is
/// rolled back and replayed record by record so that only the offending rows are lost.
fn flush(
    store: &Store,
    batch: &[PricePaidRecord],
    report: &mut LoadReport,
) -> Result<(), StoreUnavailableError> {
    match store.insert_batch(batch) {
        Ok(outcomes) => {
            for outcome in outcomes {
                report.tally(outcome);
            }
            Ok(())
        }
        Err(e) if db::is_record_error(&e) => {
            warn!(
                file = %report.file,
                size = batch.len(),
                "Batch rejected ({}), retrying record by record", e
            );
            for record in batch {
                match store.insert_record(record) {
                    Ok(outcome) => report.tally(outcome),
                    Err(e) if db::is_record_error(&e) => {
                        warn!(
                            file = %report.file,
                            transaction_id = %record.transaction_id,
                            "Rejected by store: {}", e
                        );
                        report.rejected += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
