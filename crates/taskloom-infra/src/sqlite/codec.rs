//! Column encoding shared by the SQLite repositories.
//!
//! Timestamps are written as RFC 3339 with microseconds and a `Z` suffix so
//! that text comparison in SQL is chronological. Enums round-trip through
//! their serde snake_case names; structured columns are JSON text.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use taskloom_types::error::RepositoryError;
use uuid::Uuid;

/// Map a driver error onto the store-port taxonomy.
///
/// Lock contention and pool exhaustion are transient; unique violations are
/// conflicts; everything else is a query error.
pub(crate) fn db_err(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::PoolTimedOut => RepositoryError::Timeout,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed => RepositoryError::Connection,
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        sqlx::Error::Database(db)
            if db.message().contains("database is locked") || db.message().contains("busy") =>
        {
            RepositoryError::Busy(db.message().to_string())
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

/// Read one column, mapping decode failures to a query error.
pub(crate) fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(db_err)
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_opt_uuid(s: Option<String>) -> Result<Option<Uuid>, RepositoryError> {
    s.as_deref().map(parse_uuid).transpose()
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn parse_opt_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.as_deref().map(parse_datetime).transpose()
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn format_opt_datetime(dt: Option<&DateTime<Utc>>) -> Option<String> {
    dt.map(format_datetime)
}

/// The stored name of a unit-like enum (`"pending_assignment"`).
pub(crate) fn enum_name<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!("not a unit enum: {other}"))),
        Err(e) => Err(RepositoryError::Query(format!("serialize enum: {e}"))),
    }
}

pub(crate) fn parse_enum<T: DeserializeOwned>(s: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| RepositoryError::Query(format!("invalid enum value '{s}': {e}")))
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize JSON: {e}")))
}

pub(crate) fn from_json<T: DeserializeOwned>(s: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

pub(crate) fn enum_names<T: Serialize>(values: &[T]) -> Result<Vec<String>, RepositoryError> {
    values.iter().map(enum_name).collect()
}

/// Append `column IN (?, ?, ...)`. An empty list matches nothing.
pub(crate) fn push_in<'a>(builder: &mut QueryBuilder<'a, Sqlite>, column: &str, values: &'a [String]) {
    if values.is_empty() {
        builder.push(" 0 = 1");
        return;
    }
    builder.push(" ");
    builder.push(column);
    builder.push(" IN (");
    let mut separated = builder.separated(", ");
    for value in values {
        separated.push_bind(value.as_str());
    }
    separated.push_unseparated(")");
}

/// Convert a stored non-negative integer.
pub(crate) fn to_u32(value: i64, column: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| RepositoryError::Query(format!("{column} out of range: {value}")))
}
