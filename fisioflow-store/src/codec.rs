//! Column codecs.
//!
//! Money is stored as canonical decimal TEXT, instants as fixed-width
//! RFC 3339 TEXT with nanosecond precision (`2026-01-01T09:00:00.000000000Z`).
//! The fixed width keeps lexicographic order equal to time order, so range
//! scans such as "records in the trailing minute" work on plain indices.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use rust_decimal::Decimal;

/// Encode an instant for storage.
#[must_use]
pub fn ts_to_sql(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Encode an optional instant for storage.
#[must_use]
pub fn opt_ts_to_sql(instant: Option<&DateTime<Utc>>) -> Option<String> {
    instant.map(ts_to_sql)
}

/// Encode a decimal for storage.
#[must_use]
pub fn decimal_to_sql(value: &Decimal) -> String {
    value.to_string()
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Read an instant column.
///
/// # Errors
///
/// Returns a conversion failure if the text is not RFC 3339.
pub fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

/// Read a nullable instant column.
///
/// # Errors
///
/// Returns a conversion failure if a present value is not RFC 3339.
pub fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

/// Read a decimal column.
///
/// # Errors
///
/// Returns a conversion failure if the text is not a decimal.
pub fn get_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

/// Read a nullable decimal column.
///
/// # Errors
///
/// Returns a conversion failure if a present value is not a decimal.
pub fn get_opt_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

/// Read a column holding a `FromStr` code (status enums, ids).
///
/// # Errors
///
/// Returns a conversion failure if the code is unknown.
pub fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

/// Read a nullable column holding a `FromStr` code.
///
/// # Errors
///
/// Returns a conversion failure if a present code is unknown.
pub fn get_opt_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse::<T>().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

/// Extension trait that adds an `.optional()` combinator to `rusqlite::Result`.
///
/// Converts `Err(QueryReturnedNoRows)` into `Ok(None)`.
pub trait OptionalExt<T> {
    /// Convert `QueryReturnedNoRows` into `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Any other error is passed through.
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rusqlite::Connection;
    use rust_decimal_macros::dec;

    #[test]
    fn timestamps_sort_lexicographically() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid");
        let a = ts_to_sql(&base);
        let b = ts_to_sql(&(base + Duration::nanoseconds(1)));
        let c = ts_to_sql(&(base + Duration::seconds(1)));
        assert_eq!(a.len(), b.len());
        assert!(a < b && b < c);
    }

    #[test]
    fn decimal_and_timestamp_survive_sqlite() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (amount TEXT NOT NULL, at TEXT NOT NULL, gone TEXT)")
            .expect("schema");
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid")
            + Duration::nanoseconds(7);
        conn.execute(
            "INSERT INTO t (amount, at, gone) VALUES (?1, ?2, NULL)",
            rusqlite::params![decimal_to_sql(&dec!(85.00)), ts_to_sql(&at)],
        )
        .expect("insert");

        let (amount, read_at, gone) = conn
            .query_row("SELECT amount, at, gone FROM t", [], |row| {
                Ok((get_decimal(row, 0)?, get_ts(row, 1)?, get_opt_ts(row, 2)?))
            })
            .expect("select");
        assert_eq!(amount, dec!(85.00));
        assert_eq!(amount.to_string(), "85.00");
        assert_eq!(read_at, at);
        assert!(gone.is_none());
    }

    #[test]
    fn garbage_decimal_is_a_conversion_error() {
        let conn = Connection::open_in_memory().expect("open");
        let err = conn
            .query_row("SELECT 'twelve'", [], |row| get_decimal(row, 0))
            .expect_err("not a decimal");
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(0, _, _)));
    }

    #[test]
    fn optional_maps_no_rows_to_none() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (x INTEGER)").expect("schema");
        let got: Option<i64> = conn
            .query_row("SELECT x FROM t", [], |row| row.get(0))
            .optional()
            .expect("query");
        assert!(got.is_none());
    }
}
