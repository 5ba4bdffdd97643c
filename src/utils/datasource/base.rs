use std::net::IpAddr;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgConnection, PgPool, PgRow, PgValueFormat};
use sqlx::types::BigDecimal;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::error::{EngineError, Result};

/// One result row keyed by column name.
pub type RowMapping = Map<String, Value>;

pub const POSTGRES_DIALECT: &str = "postgresql";

/// Capabilities an engine must expose to be wrapped by `PostgresEngine`.
#[async_trait]
pub trait AsyncEngine: Send + Sync {
    /// Runs `sql` in its own transaction and commits. Returns rows affected.
    async fn execute(&self, sql: &str) -> Result<u64>;

    async fn fetch_all(&self, sql: &str) -> Result<Vec<RowMapping>>;

    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn dialect(&self) -> &str {
        POSTGRES_DIALECT
    }
}

#[async_trait]
impl AsyncEngine for PgPool {
    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut tx = self.begin().await?;
        let conn: &mut PgConnection = &mut tx;
        let result = sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&self, sql: &str) -> Result<Vec<RowMapping>> {
        let rows = sqlx::query(sql).fetch_all(self).await?;
        rows.iter().map(row_to_mapping).collect()
    }

    async fn close(&self) {
        PgPool::close(self).await;
    }

    fn is_closed(&self) -> bool {
        PgPool::is_closed(self)
    }
}

pub fn row_to_mapping(row: &PgRow) -> Result<RowMapping> {
    let mut obj = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        obj.insert(column.name().to_string(), column_value(row, i)?);
    }
    Ok(obj)
}

/// Decodes one column into JSON. SQL NULL is the only source of
/// `Value::Null`. Types without a decoder come back as their text form when
/// the server sent text, and are an error otherwise.
fn column_value(row: &PgRow, i: usize) -> Result<Value> {
    let raw = row.try_get_raw(i)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let value = if let Ok(val) = row.try_get::<String, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<i16, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<i32, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<i64, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<f32, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<f64, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<bool, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<Value, _>(i) {
        val
    } else if let Ok(val) = row.try_get::<BigDecimal, _>(i) {
        // Strings keep the exact decimal.
        json!(val.to_string())
    } else if let Ok(val) = row.try_get::<uuid::Uuid, _>(i) {
        json!(val.to_string())
    } else if let Ok(val) = row.try_get::<chrono::DateTime<chrono::Utc>, _>(i) {
        json!(val.to_rfc3339())
    } else if let Ok(val) = row.try_get::<chrono::NaiveDateTime, _>(i) {
        json!(val.to_string())
    } else if let Ok(val) = row.try_get::<chrono::NaiveDate, _>(i) {
        json!(val.to_string())
    } else if let Ok(val) = row.try_get::<chrono::NaiveTime, _>(i) {
        json!(val.to_string())
    } else if let Ok(val) = row.try_get::<PgInterval, _>(i) {
        interval_to_value(&val)
    } else if let Ok(val) = row.try_get::<IpAddr, _>(i) {
        json!(val.to_string())
    } else if let Ok(val) = row.try_get::<Vec<u8>, _>(i) {
        json!(bytea_to_string(&val))
    } else if let Ok(val) = row.try_get::<Vec<String>, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<Vec<i16>, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<Vec<i32>, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<Vec<i64>, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<Vec<f32>, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<Vec<f64>, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<Vec<bool>, _>(i) {
        json!(val)
    } else if let Ok(val) = row.try_get::<Vec<BigDecimal>, _>(i) {
        json!(val.iter().map(ToString::to_string).collect::<Vec<_>>())
    } else if let Ok(val) = row.try_get::<Vec<uuid::Uuid>, _>(i) {
        json!(val.iter().map(ToString::to_string).collect::<Vec<_>>())
    } else if let Ok(val) = row.try_get::<Vec<Value>, _>(i) {
        json!(val)
    } else {
        let column = &row.columns()[i];
        let type_name = column.type_info().name().to_string();
        match raw.format() {
            PgValueFormat::Text => json!(raw.as_str().map_err(sqlx::Error::Decode)?),
            PgValueFormat::Binary if type_name.eq_ignore_ascii_case("vector") => {
                match pgvector_from_binary(raw.as_bytes().map_err(sqlx::Error::Decode)?) {
                    Some(values) => json!(values),
                    None => return Err(unsupported(column.name(), &type_name)),
                }
            }
            PgValueFormat::Binary => return Err(unsupported(column.name(), &type_name)),
        }
    };
    Ok(value)
}

fn unsupported(column: &str, type_name: &str) -> EngineError {
    EngineError::UnsupportedColumnType {
        column: column.to_string(),
        type_name: type_name.to_string(),
    }
}

/// `bytea` in PostgreSQL's hex output format.
pub(crate) fn bytea_to_string(bytes: &[u8]) -> String {
    format!("\\x{}", hex::encode(bytes))
}

pub(crate) fn interval_to_value(interval: &PgInterval) -> Value {
    json!({
        "months": interval.months,
        "days": interval.days,
        "microseconds": interval.microseconds,
    })
}

/// pgvector binary layout: `u16` dimensions, `u16` unused, then big-endian
/// `f32`s.
pub(crate) fn pgvector_from_binary(bytes: &[u8]) -> Option<Vec<f32>> {
    let header = bytes.get(..4)?;
    let dim = u16::from_be_bytes([header[0], header[1]]) as usize;
    let body = bytes.get(4..)?;
    if body.len() != dim * 4 {
        return None;
    }
    Some(
        body.chunks_exact(4)
            .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
