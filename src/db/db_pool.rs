use crate::config::DatabaseConfig;
use duckdb::{AccessMode, Config, Connection};
use r2d2::{ManageConnection, Pool};
use std::sync::{Mutex, PoisonError};
use tracing::info;

pub type DuckDbPool = Pool<DuckDBConnectionManager>;

enum Target {
    File { path: String, read_only: bool },
    // In-memory databases only exist per connection, so every pooled
    // connection is cloned from this root to share one database.
    Memory(Mutex<Connection>),
}

pub struct DuckDBConnectionManager {
    target: Target,
}

impl DuckDBConnectionManager {
    pub fn new(connection_string: &str, read_only: bool) -> Result<Self, duckdb::Error> {
        let target = if connection_string.is_empty() || connection_string == ":memory:" {
            Target::Memory(Mutex::new(Connection::open_in_memory()?))
        } else {
            Target::File {
                path: connection_string.to_string(),
                read_only,
            }
        };

        Ok(Self { target })
    }

    pub fn in_memory() -> Result<Self, duckdb::Error> {
        Self::new(":memory:", false)
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        match &self.target {
            Target::File { path, read_only: true } => {
                let config = Config::default().access_mode(AccessMode::ReadOnly)?;
                Connection::open_with_flags(path, config)
            }
            Target::File { path, read_only: false } => Connection::open(path),
            Target::Memory(root) => root
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_clone(),
        }
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute_batch("SELECT 1")
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolBuildError {
    #[error("failed to open DuckDB database: {0}")]
    Open(#[from] duckdb::Error),
    #[error("failed to build connection pool: {0}")]
    Pool(#[from] r2d2::Error),
}

/// Builds the bounded pool shared by catalog reads and query execution.
pub fn build_pool(config: &DatabaseConfig) -> Result<DuckDbPool, PoolBuildError> {
    let manager = DuckDBConnectionManager::new(&config.connection_string, config.read_only)?;

    info!(
        "Opening DuckDB pool on '{}' (size {}, read_only {})",
        config.connection_string, config.pool_size, config.read_only
    );

    let pool = Pool::builder()
        .max_size(config.pool_size.max(1) as u32)
        .connection_timeout(config.pool_timeout())
        .build(manager)?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_connections_share_one_database() {
        let pool = Pool::builder()
            .max_size(2)
            .build(DuckDBConnectionManager::in_memory().unwrap())
            .unwrap();

        let writer = pool.get().unwrap();
        writer
            .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2);")
            .unwrap();

        let reader = pool.get().unwrap();
        let count: i64 = reader
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(std::time::Duration::from_millis(50))
            .build(DuckDBConnectionManager::in_memory().unwrap())
            .unwrap();

        let _held = pool.get().unwrap();
        assert!(pool.get().is_err());
    }
}
