use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

use crate::{ColumnDescriptor, SqlType};

/// Errors turning JSON values into typed bind parameters.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("column '{column}' cannot hold {value}")]
    Incompatible { column: String, value: String },
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Bind one JSON value as the typed parameter matching the column. Nulls
/// bind as typed NULLs; numbers and strings convert per the column type.
pub fn bind_value<'q>(
    query: PgQuery<'q>,
    column: &ColumnDescriptor,
    value: &Value,
) -> Result<PgQuery<'q>, BindError> {
    let incompatible = || BindError::Incompatible {
        column: column.name.clone(),
        value: value.to_string(),
    };

    Ok(match &column.sql_type {
        SqlType::Varchar | SqlType::Geometry { .. } => match value {
            Value::Null => query.bind(None::<String>),
            Value::String(s) => query.bind(s.clone()),
            Value::Number(n) => query.bind(n.to_string()),
            Value::Bool(b) => query.bind(b.to_string()),
            _ => return Err(incompatible()),
        },
        SqlType::BigInt | SqlType::BigSerial => match value {
            Value::Null => query.bind(None::<i64>),
            Value::Number(n) => query.bind(n.as_i64().ok_or_else(incompatible)?),
            Value::String(s) => query.bind(s.parse::<i64>().map_err(|_| incompatible())?),
            _ => return Err(incompatible()),
        },
        SqlType::Double => match value {
            Value::Null => query.bind(None::<f64>),
            Value::Number(n) => query.bind(n.as_f64().ok_or_else(incompatible)?),
            _ => return Err(incompatible()),
        },
        SqlType::Boolean => match value {
            Value::Null => query.bind(None::<bool>),
            Value::Bool(b) => query.bind(*b),
            _ => return Err(incompatible()),
        },
        SqlType::Date => match value {
            Value::Null => query.bind(None::<NaiveDate>),
            Value::String(s) => query.bind(parse_date(s).ok_or_else(incompatible)?),
            _ => return Err(incompatible()),
        },
        SqlType::Timestamp => match value {
            Value::Null => query.bind(None::<NaiveDateTime>),
            Value::String(s) => query.bind(parse_date_time(s).ok_or_else(incompatible)?),
            _ => return Err(incompatible()),
        },
        SqlType::Time => match value {
            Value::Null => query.bind(None::<NaiveTime>),
            Value::String(s) => {
                query.bind(NaiveTime::parse_from_str(s, "%H:%M:%S").map_err(|_| incompatible())?)
            }
            _ => return Err(incompatible()),
        },
        SqlType::Jsonb => match value {
            Value::Null => query.bind(None::<sqlx::types::Json<Value>>),
            other => query.bind(sqlx::types::Json(other.clone())),
        },
    })
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_date_time(value).map(|dt| dt.date()))
}

/// Event payloads write timestamps in a few shapes: bare ISO-8601, with
/// fractional seconds, or with a UTC offset.
pub fn parse_date_time(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_date_time_variants() {
        for value in [
            "2020-02-05T15:06:43",
            "2020-02-05T15:06:43.123456",
            "2020-02-05T15:06:43+00:00",
            "2020-02-05",
        ] {
            assert!(parse_date_time(value).is_some(), "failed on {value}");
        }
        assert!(parse_date_time("vandaag").is_none());
    }
}
