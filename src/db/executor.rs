use crate::db::db_pool::DuckDbPool;
use crate::sql::validator::NormalizedQuery;
use chrono::{DateTime, NaiveTime};
use duckdb::types::{TimeUnit, ValueRef};
use duckdb::Connection;
use serde_json::{Number, Value};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One result row: column name to JSON scalar, in column order
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("query exceeded its {0:?} execution budget")]
    Timeout(Duration),
    #[error("database error: {0}")]
    Database(String),
    #[error("query returned more than the {limit} row limit")]
    ResultTooLarge { limit: u64 },
    #[error("no database connection available: {0}")]
    PoolExhausted(String),
}

impl From<duckdb::Error> for ExecutionError {
    fn from(e: duckdb::Error) -> Self {
        ExecutionError::Database(e.to_string())
    }
}

/// Runs validated statements with a wall-clock budget.
///
/// The budget is enforced here rather than trusted to the database. The
/// statement runs on a connection cloned from the pooled one, and the pooled
/// connection is only held as a permit. When the budget runs out the permit
/// goes back to the pool at once and the caller gets a timeout; the clone is
/// left to finish on its own and is closed afterwards, never pooled.
pub struct QueryExecutor {
    pool: DuckDbPool,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(pool: DuckDbPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub async fn execute(&self, query: &NormalizedQuery) -> Result<ExecutionResult, ExecutionError> {
        let started = Instant::now();

        // r2d2 bounds the wait with its connection timeout
        let pool = self.pool.clone();
        let (permit, worker) = tokio::task::spawn_blocking(move || {
            let permit = pool.get().map_err(|e| {
                error!("Failed to get DB connection: {}", e);
                ExecutionError::PoolExhausted(e.to_string())
            })?;
            let worker = permit.try_clone()?;
            Ok::<_, ExecutionError>((permit, worker))
        })
        .await
        .map_err(|e| ExecutionError::Database(format!("connection task failed: {}", e)))??;

        let sql = query.sql().to_string();
        let limit = query.row_limit();
        debug!("Executing: {}", sql);

        let task = tokio::task::spawn_blocking(move || read_rows(&worker, &sql, limit));

        let outcome = tokio::time::timeout(self.timeout, task).await;
        drop(permit);

        let (columns, rows) = match outcome {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => {
                error!("Task join error: {}", join_err);
                return Err(ExecutionError::Database(format!(
                    "query task failed: {}",
                    join_err
                )));
            }
            Err(_) => {
                warn!(
                    "Query abandoned after {:?}; its connection is released when it finishes",
                    self.timeout
                );
                return Err(ExecutionError::Timeout(self.timeout));
            }
        };

        let elapsed = started.elapsed();
        info!(
            "Query executed successfully. Row count: {}, Execution time: {}ms",
            rows.len(),
            elapsed.as_millis()
        );

        Ok(ExecutionResult {
            row_count: rows.len(),
            columns,
            rows,
            elapsed,
        })
    }
}

fn read_rows(
    conn: &Connection,
    sql: &str,
    limit: u64,
) -> Result<(Vec<String>, Vec<Row>), ExecutionError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;

    let columns = unique_column_names(
        rows.as_ref()
            .map(|stmt| stmt.column_names())
            .unwrap_or_default(),
    );

    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        // Only ever read one row past the limit
        if records.len() as u64 >= limit {
            return Err(ExecutionError::ResultTooLarge { limit });
        }

        let mut record = Row::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            record.insert(name.clone(), to_json(row.get_ref(i)?));
        }
        records.push(record);
    }

    Ok((columns, records))
}

/// `SELECT a.id, b.id` yields `id` and `id_2` so no value is lost in the row map
fn unique_column_names(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            let mut candidate = name.clone();
            let mut n = 2;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{}_{}", name, n);
                n += 1;
            }
            candidate
        })
        .collect()
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(v) => Value::from(v),
        ValueRef::SmallInt(v) => Value::from(v),
        ValueRef::Int(v) => Value::from(v),
        ValueRef::BigInt(v) => Value::from(v),
        ValueRef::HugeInt(v) => match i64::try_from(v) {
            Ok(v) => Value::from(v),
            Err(_) => Value::String(v.to_string()),
        },
        ValueRef::UTinyInt(v) => Value::from(v),
        ValueRef::USmallInt(v) => Value::from(v),
        ValueRef::UInt(v) => Value::from(v),
        ValueRef::UBigInt(v) => Value::from(v),
        ValueRef::Float(v) => float(f64::from(v)),
        ValueRef::Double(v) => float(v),
        ValueRef::Decimal(d) => match d.to_string().parse::<f64>() {
            Ok(v) => float(v),
            Err(_) => Value::String(d.to_string()),
        },
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(bytes.iter().map(|b| format!("{:02x}", b)).collect())
        }
        ValueRef::Date32(days) => DateTime::from_timestamp(i64::from(days) * 86_400, 0)
            .map(|dt| Value::String(dt.date_naive().format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        ValueRef::Timestamp(unit, v) => DateTime::from_timestamp_micros(to_micros(unit, v))
            .map(|dt| {
                Value::String(dt.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            })
            .unwrap_or(Value::Null),
        ValueRef::Time64(unit, v) => {
            let micros = to_micros(unit, v);
            let secs = u32::try_from(micros.div_euclid(1_000_000)).unwrap_or(0);
            let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).unwrap_or(0);
            NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null)
        }
        other => Value::String(format!("{:?}", other)),
    }
}
