use chrono::NaiveDate;
use tracing::info;

use crate::db::{MonthlyAveragePrice, Store, DATE_FORMAT};
use crate::error::StoreUnavailableError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateReport {
    pub months: usize,
    pub removed: usize,
}

/// Recompute `monthly_avg_prices` from every record in the store.
///
/// The months present in `price_paid` are upserted and any other month is deleted,
/// all in one transaction: a failure leaves the previous aggregate untouched.
pub fn aggregate(store: &Store) -> Result<AggregateReport, StoreUnavailableError> {
    let tx = store.conn().unchecked_transaction()?;
    let averages = compute_monthly_averages(store)?;
    {
        let mut upsert = tx.prepare(
            "INSERT INTO monthly_avg_prices (month, avg_price) VALUES (?1, ?2)
             ON CONFLICT(month) DO UPDATE SET avg_price = excluded.avg_price",
        )?;
        for m in &averages {
            upsert.execute(rusqlite::params![
                m.month.format(DATE_FORMAT).to_string(),
                m.avg_price
            ])?;
        }
    }
    let removed = tx.execute(
        "DELETE FROM monthly_avg_prices WHERE month NOT IN (
             SELECT strftime('%Y-%m-01', transfer_date) FROM price_paid
             WHERE strftime('%Y-%m-01', transfer_date) IS NOT NULL
         )",
        [],
    )?;
    tx.commit()?;

    info!(months = averages.len(), removed, "Monthly averages materialized");
    Ok(AggregateReport {
        months: averages.len(),
        removed,
    })
}

/// Mean price per calendar month, ordered by month. Sums stay integral in SQL and the
/// division happens once here, so repeated runs give identical values.
pub fn compute_monthly_averages(
    store: &Store,
) -> Result<Vec<MonthlyAveragePrice>, StoreUnavailableError> {
    let mut stmt = store.conn().prepare(
        "SELECT strftime('%Y-%m-01', transfer_date) AS month, SUM(price), COUNT(*)
         FROM price_paid
         GROUP BY month
         ORDER BY month",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (month, sum, count) in rows {
        // strftime yields NULL for a transfer_date that is not a date.
        let Some(month) = month else { continue };
        let month = NaiveDate::parse_from_str(&month, DATE_FORMAT).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
        out.push(MonthlyAveragePrice {
            month,
            avg_price: sum as f64 / count as f64,
        });
    }
    Ok(out)
}
