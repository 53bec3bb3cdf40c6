use crate::db::db_pool::DuckDbPool;
use crate::db::schema::{ColumnSchema, ForeignKey, SchemaSnapshot, TableSchema};
use crate::db::schema_manager::{SchemaError, SchemaSource};
use async_trait::async_trait;
use duckdb::Connection;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static FOREIGN_KEY_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)FOREIGN\s+KEY\s*\(([^)]*)\)\s*REFERENCES\s+([^\s(]+)\s*\(([^)]*)\)"#)
        .expect("foreign key pattern is valid")
});

/// Reads table, column and foreign-key metadata from DuckDB's catalog.
///
/// Only catalog views are queried; user tables are never scanned.
pub struct DuckDbCatalog {
    pool: DuckDbPool,
    schema_name: String,
}

impl DuckDbCatalog {
    pub fn new(pool: DuckDbPool, schema_name: &str) -> Self {
        Self {
            pool,
            schema_name: schema_name.to_string(),
        }
    }
}

#[async_trait]
impl SchemaSource for DuckDbCatalog {
    async fn load_schema(&self) -> Result<SchemaSnapshot, SchemaError> {
        let pool = self.pool.clone();
        let schema_name = self.schema_name.clone();

        // DuckDB calls block, so keep them off the async workers
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| SchemaError::Unavailable(format!("no database connection: {}", e)))?;
            read_catalog(&conn, &schema_name)
                .map_err(|e| SchemaError::Unavailable(format!("metadata query failed: {}", e)))
        })
        .await
        .map_err(|e| SchemaError::Unavailable(format!("metadata task failed: {}", e)))?
    }
}

pub fn read_catalog(conn: &Connection, schema_name: &str) -> Result<SchemaSnapshot, duckdb::Error> {
    let mut tables_stmt = conn.prepare(
        "SELECT table_name FROM information_schema.tables
         WHERE table_schema = ? AND table_type IN ('BASE TABLE', 'VIEW')
         ORDER BY table_name",
    )?;
    let table_names: Vec<String> = tables_stmt
        .query_map([schema_name], |row| row.get::<_, String>(0))?
        .collect::<Result<_, _>>()?;

    let mut columns_stmt = conn.prepare(
        "SELECT column_name, data_type, is_nullable
         FROM information_schema.columns
         WHERE table_schema = ? AND table_name = ?
         ORDER BY ordinal_position",
    )?;

    let mut foreign_keys = read_foreign_keys(conn, schema_name);

    let mut tables = Vec::with_capacity(table_names.len());
    for table_name in &table_names {
        let columns: Vec<ColumnSchema> = columns_stmt
            .query_map([schema_name, table_name.as_str()], |row| {
                Ok(ColumnSchema::new(
                    &row.get::<_, String>(0)?,
                    &row.get::<_, String>(1)?,
                    row.get::<_, String>(2)? == "YES",
                ))
            })?
            .collect::<Result<_, _>>()?;

        debug!("Table {} has {} columns", table_name, columns.len());

        let fks = foreign_keys
            .remove(&table_name.to_lowercase())
            .unwrap_or_default();
        tables.push(TableSchema::new(table_name, columns).with_foreign_keys(fks));
    }

    info!(
        "Read {} tables from catalog schema '{}'",
        tables.len(),
        schema_name
    );
    Ok(SchemaSnapshot::new(schema_name, tables))
}

/// Foreign keys are hints for the model; if the catalog cannot produce them
/// the snapshot is still usable without.
fn read_foreign_keys(conn: &Connection, schema_name: &str) -> HashMap<String, Vec<ForeignKey>> {
    let result = conn
        .prepare(
            "SELECT table_name, constraint_text FROM duckdb_constraints()
             WHERE schema_name = ? AND constraint_type = 'FOREIGN KEY'",
        )
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map([schema_name], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>();
            rows
        });

    let rows = match result {
        Ok(rows) => rows,
        Err(e) => {
            warn!("Skipping foreign keys, catalog query failed: {}", e);
            return HashMap::new();
        }
    };

    let mut by_table: HashMap<String, Vec<ForeignKey>> = HashMap::new();
    for (table_name, constraint_text) in rows {
        by_table
            .entry(table_name.to_lowercase())
            .or_default()
            .extend(parse_foreign_key(&constraint_text));
    }
    by_table
}

/// Parses `FOREIGN KEY (a, b) REFERENCES t(x, y)` into column pairs.
pub fn parse_foreign_key(constraint_text: &str) -> Vec<ForeignKey> {
    let Some(caps) = FOREIGN_KEY_TEXT.captures(constraint_text) else {
        return Vec::new();
    };

    let split = |list: &str| -> Vec<String> {
        list.split(',')
            .map(|c| c.trim().trim_matches('"').to_string())
            .filter(|c| !c.is_empty())
            .collect()
    };

    let columns = split(&caps[1]);
    let referenced_table = caps[2].trim_matches('"');
    let referenced_table = referenced_table
        .rsplit('.')
        .next()
        .unwrap_or(referenced_table)
        .trim_matches('"');
    let referenced_columns = split(&caps[3]);

    columns
        .iter()
        .zip(referenced_columns.iter())
        .map(|(column, referenced)| ForeignKey::new(column, referenced_table, referenced))
        .collect()
}
