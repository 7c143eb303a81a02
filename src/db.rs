use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::{Connection, ErrorCode};
use serde::Serialize;

use crate::error::StoreUnavailableError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

type Result<T> = std::result::Result<T, StoreUnavailableError>;

/// One property sale, as loaded into `price_paid`.
#[derive(Debug, Clone, PartialEq)]
pub struct PricePaidRecord {
    pub transaction_id: String,
    pub price: i64,
    pub transfer_date: NaiveDate,
    pub postcode: Option<String>,
    pub property_type: Option<char>,
    pub old_new: Option<char>,
    pub duration: Option<char>,
    pub paon: Option<String>,
    pub saon: Option<String>,
    pub street: Option<String>,
    pub locality: Option<String>,
    pub town_city: Option<String>,
    pub district: Option<String>,
    pub county: Option<String>,
    pub category_type: Option<char>,
    pub record_status: Option<char>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyAveragePrice {
    pub month: NaiveDate,
    pub avg_price: f64,
}

/// Outcome of inserting a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Explicit handle on the record and aggregate stores.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| {
                StoreUnavailableError::Directory {
                    path: parent.to_path_buf(),
                    source,
                }
            })?;
        }
        let conn = Connection::open(path).map_err(|source| StoreUnavailableError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Store { conn };
        store.init_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let store = Store {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS price_paid (
                transaction_id TEXT PRIMARY KEY,
                price          INTEGER NOT NULL CHECK (price >= 0),
                transfer_date  DATE NOT NULL,
                postcode       TEXT,
                property_type  CHAR(1) CHECK (length(property_type) = 1),
                old_new        CHAR(1) CHECK (length(old_new) = 1),
                duration       CHAR(1) CHECK (length(duration) = 1),
                paon           TEXT,
                saon           TEXT,
                street         TEXT,
                locality       TEXT,
                town_city      TEXT,
                district       TEXT,
                county         TEXT,
                category_type  CHAR(1) CHECK (length(category_type) = 1),
                record_status  CHAR(1) CHECK (length(record_status) = 1)
            );
            CREATE INDEX IF NOT EXISTS idx_price_paid_transfer_date ON price_paid(transfer_date);

            -- Read by the serving layer with SELECT *; keep the column set fixed.
            CREATE TABLE IF NOT EXISTS monthly_avg_prices (
                month     DATE PRIMARY KEY,
                avg_price REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS load_log (
                id            INTEGER PRIMARY KEY,
                file_name     TEXT NOT NULL,
                loaded        INTEGER NOT NULL,
                duplicates    INTEGER NOT NULL,
                malformed     INTEGER NOT NULL,
                invalid_price INTEGER NOT NULL,
                rejected      INTEGER NOT NULL,
                loaded_at     TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_load_log_file ON load_log(file_name);
            ",
        )?;
        Ok(())
    }

    // ── Records ──

    /// Insert a batch in one transaction. Returns per-record outcomes in input order.
    /// Any error rolls the whole batch back.
    pub fn insert_batch(
        &self,
        records: &[PricePaidRecord],
    ) -> rusqlite::Result<Vec<InsertOutcome>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut outcomes = Vec::with_capacity(records.len());
        {
            let mut stmt = tx.prepare_cached(INSERT_RECORD)?;
            for r in records {
                outcomes.push(execute_insert(&mut stmt, r)?);
            }
        }
        tx.commit()?;
        Ok(outcomes)
    }

    pub fn insert_record(&self, record: &PricePaidRecord) -> rusqlite::Result<InsertOutcome> {
        let mut stmt = self.conn.prepare_cached(INSERT_RECORD)?;
        execute_insert(&mut stmt, record)
    }

    pub fn count_records(&self) -> Result<usize> {
        let n: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM price_paid", [], |r| r.get(0))?;
        Ok(n)
    }

    #[cfg(test)]
    pub fn price_of(&self, transaction_id: &str) -> Result<Option<i64>> {
        use rusqlite::OptionalExtension;
        let price = self
            .conn
            .query_row(
                "SELECT price FROM price_paid WHERE transaction_id = ?1",
                [transaction_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(price)
    }

    // ── Load log ──

    pub fn record_load(
        &self,
        file_name: &str,
        loaded: usize,
        duplicates: usize,
        malformed: usize,
        invalid_price: usize,
        rejected: usize,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO load_log (file_name, loaded, duplicates, malformed, invalid_price, rejected)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![file_name, loaded, duplicates, malformed, invalid_price, rejected],
        )?;
        Ok(())
    }

    // ── Aggregates ──

    /// Mirrors the serving layer's `SELECT * FROM monthly_avg_prices`, ordered by month.
    pub fn fetch_monthly_averages(&self, year: Option<i32>) -> Result<Vec<MonthlyAveragePrice>> {
        let mut stmt = self.conn.prepare(
            "SELECT month, avg_price FROM monthly_avg_prices
             WHERE ?1 IS NULL OR strftime('%Y', month) = printf('%04d', ?1)
             ORDER BY month",
        )?;
        let rows = stmt
            .query_map([year], |row| {
                let month: String = row.get(0)?;
                Ok((month, row.get::<_, f64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(month, avg_price)| {
                let month = parse_stored_date(&month)?;
                Ok(MonthlyAveragePrice { month, avg_price })
            })
            .collect()
    }

    // ── Stats ──

    pub fn get_stats(&self) -> Result<Stats> {
        let records = self.count_records()?;
        let months: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM monthly_avg_prices", [], |r| r.get(0))?;
        let files_loaded: usize = self.conn.query_row(
            "SELECT COUNT(DISTINCT file_name) FROM load_log",
            [],
            |r| r.get(0),
        )?;
        let (first, last): (Option<String>, Option<String>) = self.conn.query_row(
            "SELECT MIN(transfer_date), MAX(transfer_date) FROM price_paid",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(Stats {
            records,
            months,
            files_loaded,
            first_transfer: first.as_deref().map(parse_stored_date).transpose()?,
            last_transfer: last.as_deref().map(parse_stored_date).transpose()?,
        })
    }
}

pub struct Stats {
    pub records: usize,
    pub months: usize,
    pub files_loaded: usize,
    pub first_transfer: Option<NaiveDate>,
    pub last_transfer: Option<NaiveDate>,
}

// Only the primary-key conflict is ignored; CHECK violations still fail the statement.
const INSERT_RECORD: &str = "INSERT INTO price_paid
    (transaction_id, price, transfer_date, postcode, property_type, old_new, duration,
     paon, saon, street, locality, town_city, district, county, category_type, record_status)
    VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
    ON CONFLICT(transaction_id) DO NOTHING";

fn execute_insert(
    stmt: &mut rusqlite::CachedStatement<'_>,
    r: &PricePaidRecord,
) -> rusqlite::Result<InsertOutcome> {
    let code = |c: Option<char>| c.map(String::from);
    let changed = stmt.execute(rusqlite::params![
        r.transaction_id,
        r.price,
        r.transfer_date.format(DATE_FORMAT).to_string(),
        r.postcode,
        code(r.property_type),
        code(r.old_new),
        code(r.duration),
        r.paon,
        r.saon,
        r.street,
        r.locality,
        r.town_city,
        r.district,
        r.county,
        code(r.category_type),
        code(r.record_status),
    ])?;
    Ok(if changed == 0 {
        InsertOutcome::Duplicate
    } else {
        InsertOutcome::Inserted
    })
}

fn parse_stored_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|e| {
        StoreUnavailableError::Sqlite(rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        ))
    })
}

/// True for errors caused by the record itself rather than the store.
pub fn is_record_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation
    )
}
