//! Bridging between PostgreSQL rows/parameters and JSON.
//!
//! The tool surface speaks JSON, so result rows are decoded by column type
//! into JSON objects and call parameters are bound by JSON type. Types
//! without a natural JSON shape fall back to their text form; anything
//! undecodable becomes null rather than failing the whole result set.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo, ValueRef};

/// Column descriptor returned alongside result rows.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FieldDesc {
    pub name: String,
    pub type_name: String,
}

/// Describe the columns of a result row.
pub fn field_descs(row: &PgRow) -> Vec<FieldDesc> {
    row.columns()
        .iter()
        .map(|c| FieldDesc {
            name: c.name().to_string(),
            type_name: c.type_info().name().to_string(),
        })
        .collect()
}

/// Decode one row into a JSON object keyed by column name.
pub fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, i, column.type_info().name());
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

fn decode_column(row: &PgRow, i: usize, type_name: &str) -> Value {
    if let Ok(raw) = row.try_get_raw(i) {
        if raw.is_null() {
            return Value::Null;
        }
    }
    match type_name {
        "BOOL" => row.try_get::<bool, _>(i).map(Value::Bool).unwrap_or(Value::Null),
        "INT2" => row.try_get::<i16, _>(i).map(|v| json!(v)).unwrap_or(Value::Null),
        "INT4" => row.try_get::<i32, _>(i).map(|v| json!(v)).unwrap_or(Value::Null),
        "INT8" => row.try_get::<i64, _>(i).map(|v| json!(v)).unwrap_or(Value::Null),
        "FLOAT4" => row.try_get::<f32, _>(i).map(|v| json!(v)).unwrap_or(Value::Null),
        "FLOAT8" => row.try_get::<f64, _>(i).map(|v| json!(v)).unwrap_or(Value::Null),
        "NUMERIC" => row
            .try_get::<Decimal, _>(i)
            .map(|v| json!(v.to_string()))
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<uuid::Uuid, _>(i)
            .map(|v| json!(v.to_string()))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row.try_get::<Value, _>(i).unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<DateTime<Utc>, _>(i)
            .map(|v| json!(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(i)
            .map(|v| json!(v.to_string()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<NaiveDate, _>(i)
            .map(|v| json!(v.to_string()))
            .unwrap_or(Value::Null),
        // TEXT, VARCHAR, NAME, BPCHAR, and anything else with a text form.
        _ => row
            .try_get::<String, _>(i)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Bind JSON parameters onto a query by value type.
///
/// Arrays and objects bind as JSONB; integers bind as BIGINT, other numbers
/// as DOUBLE PRECISION.
pub fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    query.bind(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.clone()),
        };
    }
    query
}
