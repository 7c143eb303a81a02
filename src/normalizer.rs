use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};

use crate::db::PricePaidRecord;
use crate::error::{MalformedKind, MalformedRecordError};

/// Positional layout of a price-paid extract. The files carry no header row.
pub const COLUMNS: [&str; 16] = [
    "transaction_id",
    "price",
    "transfer_date",
    "postcode",
    "property_type",
    "old_new",
    "duration",
    "paon",
    "saon",
    "street",
    "locality",
    "town_city",
    "district",
    "county",
    "category_type",
    "record_status",
];

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d/%m/%Y"];

/// Lazy stream of normalized records from one CSV source.
pub struct Records<R: Read> {
    rows: csv::StringRecordsIntoIter<R>,
    row: u64,
}

impl<R: Read> Records<R> {
    pub fn from_reader(reader: R) -> Self {
        let rows = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader)
            .into_records();
        Records { rows, row: 0 }
    }
}

/// Open a raw file. Each call starts the sequence from the first row.
pub fn open(path: &Path) -> std::io::Result<Records<File>> {
    Ok(Records::from_reader(File::open(path)?))
}

impl<R: Read> Iterator for Records<R> {
    type Item = Result<PricePaidRecord, MalformedRecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.rows.next()?;
        self.row += 1;
        let row = self.row;
        Some(match result {
            Ok(fields) => normalize(row, &fields),
            Err(e) => Err(MalformedRecordError {
                row,
                kind: MalformedKind::Csv(e.to_string()),
            }),
        })
    }
}

/// Map one positional row onto a `PricePaidRecord`.
pub fn normalize(row: u64, fields: &csv::StringRecord) -> Result<PricePaidRecord, MalformedRecordError> {
    let fail = |kind| MalformedRecordError { row, kind };

    if fields.len() != COLUMNS.len() {
        return Err(fail(MalformedKind::FieldCount {
            expected: COLUMNS.len(),
            found: fields.len(),
        }));
    }
    let field = |i: usize| fields.get(i).unwrap_or("").trim();
    let text = |i: usize| Some(field(i)).filter(|s| !s.is_empty()).map(str::to_string);
    let code = |i: usize| parse_code(COLUMNS[i], field(i)).map_err(fail);

    let transaction_id = field(0);
    if transaction_id.is_empty() {
        return Err(fail(MalformedKind::MissingId));
    }
    let price = parse_price(field(1)).ok_or_else(|| fail(MalformedKind::Price(field(1).into())))?;
    let transfer_date =
        parse_transfer_date(field(2)).ok_or_else(|| fail(MalformedKind::Date(field(2).into())))?;

    Ok(PricePaidRecord {
        transaction_id: transaction_id.to_string(),
        price,
        transfer_date,
        postcode: text(3),
        property_type: code(4)?,
        old_new: code(5)?,
        duration: code(6)?,
        paon: text(7),
        saon: text(8),
        street: text(9),
        locality: text(10),
        town_city: text(11),
        district: text(12),
        county: text(13),
        category_type: code(14)?,
        record_status: code(15)?,
    })
}

/// Whole, non-negative prices only. `"250000.0"` is accepted; `"abc"`, `"-1"`, `"1.5"` are not.
pub fn parse_price(s: &str) -> Option<i64> {
    if let Ok(n) = s.parse::<i64>() {
        return (n >= 0).then_some(n);
    }
    let f = s.parse::<f64>().ok()?;
    if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// Calendar date of a transfer; any time component is discarded.
pub fn parse_transfer_date(s: &str) -> Option<NaiveDate> {
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok().map(|dt| dt.date()))
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
        })
}

fn parse_code(column: &'static str, value: &str) -> Result<Option<char>, MalformedKind> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (None, _) => Ok(None),
        (Some(c), None) => Ok(Some(c)),
        _ => Err(MalformedKind::Code {
            column,
            value: value.to_string(),
        }),
    }
}
