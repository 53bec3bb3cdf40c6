use crate::db::schema::SchemaSnapshot;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    #[error("schema unavailable: {0}")]
    Unavailable(String),
}

/// Where schema metadata comes from.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn load_schema(&self) -> Result<SchemaSnapshot, SchemaError>;
}

type LoadResult = Result<Arc<SchemaSnapshot>, SchemaError>;

struct CachedSchema {
    snapshot: Arc<SchemaSnapshot>,
    loaded_at: Instant,
}

#[derive(Default)]
struct CacheState {
    cached: Option<CachedSchema>,
    /// Present while a load is running; every caller that misses subscribes here
    in_flight: Option<watch::Receiver<Option<LoadResult>>>,
}

struct Inner {
    source: Arc<dyn SchemaSource>,
    ttl: Duration,
    load_timeout: Duration,
    state: Mutex<CacheState>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn load(&self) -> LoadResult {
        info!("Refreshing schema cache");
        let started = Instant::now();

        match tokio::time::timeout(self.load_timeout, self.source.load_schema()).await {
            Ok(Ok(snapshot)) => {
                info!(
                    "Schema cache refreshed: {} tables in {}ms",
                    snapshot.table_count(),
                    started.elapsed().as_millis()
                );
                Ok(Arc::new(snapshot))
            }
            Ok(Err(e)) => {
                error!("Failed to refresh schema cache: {}", e);
                Err(e)
            }
            Err(_) => {
                error!("Schema metadata load timed out after {:?}", self.load_timeout);
                Err(SchemaError::Unavailable(format!(
                    "metadata load timed out after {:?}",
                    self.load_timeout
                )))
            }
        }
    }
}

/// Owns one load's bookkeeping; a load task that dies without completing
/// still clears `in_flight` and closes the channel its waiters are on.
struct InFlightLoad {
    inner: Arc<Inner>,
    tx: watch::Sender<Option<LoadResult>>,
    finished: bool,
}

impl InFlightLoad {
    fn complete(mut self, result: LoadResult) {
        self.finished = true;
        {
            let mut state = self.inner.lock_state();
            state.in_flight = None;
            if let Ok(snapshot) = &result {
                state.cached = Some(CachedSchema {
                    snapshot: Arc::clone(snapshot),
                    loaded_at: Instant::now(),
                });
            }
        }
        self.tx.send_replace(Some(result));
    }
}

impl Drop for InFlightLoad {
    fn drop(&mut self) {
        if !self.finished {
            error!("Schema load ended without a result");
            self.inner.lock_state().in_flight = None;
        }
    }
}

/// Process-wide schema cache with a time-to-live and single-flight refresh.
///
/// On a miss exactly one load runs; concurrent callers wait for that load's
/// result and all receive the same snapshot. The load runs in its own task,
/// so a caller that goes away does not strand the others. The state mutex is
/// only held for bookkeeping, never across an await.
#[derive(Clone)]
pub struct SchemaIntrospector {
    inner: Arc<Inner>,
}

impl SchemaIntrospector {
    pub fn new(source: Arc<dyn SchemaSource>, ttl: Duration, load_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                ttl,
                load_timeout,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    pub async fn get_schema(&self) -> Result<Arc<SchemaSnapshot>, SchemaError> {
        let mut rx = {
            let mut state = self.inner.lock_state();

            if let Some(cached) = &state.cached {
                if cached.loaded_at.elapsed() < self.inner.ttl {
                    return Ok(Arc::clone(&cached.snapshot));
                }
            }

            match &state.in_flight {
                Some(rx) => {
                    debug!("Schema load already in flight, waiting for it");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.in_flight = Some(rx.clone());

                    let load = InFlightLoad {
                        inner: Arc::clone(&self.inner),
                        tx,
                        finished: false,
                    };
                    tokio::spawn(async move {
                        let result = load.inner.load().await;
                        load.complete(result);
                    });

                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };

        outcome.unwrap_or_else(|| {
            Err(SchemaError::Unavailable(
                "schema load ended without a result".to_string(),
            ))
        })
    }

    /// The last loaded snapshot, fresh or not, without triggering a load
    pub fn cached(&self) -> Option<Arc<SchemaSnapshot>> {
        self.inner
            .lock_state()
            .cached
            .as_ref()
            .map(|c| Arc::clone(&c.snapshot))
    }

    /// Forces the next `get_schema` to reload
    pub fn invalidate(&self) {
        self.inner.lock_state().cached = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{ColumnSchema, TableSchema};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingSource {
        loads: AtomicUsize,
        delay: Duration,
        fail: AtomicBool,
    }

    impl CountingSource {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                delay,
                fail: AtomicBool::new(false),
            })
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SchemaSource for CountingSource {
        async fn load_schema(&self) -> Result<SchemaSnapshot, SchemaError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(SchemaError::Unavailable("connection refused".to_string()));
            }
            Ok(SchemaSnapshot::new(
                "main",
                vec![TableSchema::new(
                    "customers",
                    vec![ColumnSchema::new("id", "INTEGER", false)],
                )],
            ))
        }
    }

    fn introspector(source: Arc<CountingSource>, ttl: Duration) -> SchemaIntrospector {
        SchemaIntrospector::new(source, ttl, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_second_call_within_ttl_hits_cache() {
        let source = CountingSource::new(Duration::ZERO);
        let schemas = introspector(source.clone(), Duration::from_secs(60));

        let first = schemas.get_schema().await.unwrap();
        let second = schemas.get_schema().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.loads(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_load() {
        let source = CountingSource::new(Duration::from_millis(100));
        let schemas = introspector(source.clone(), Duration::from_secs(60));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let schemas = schemas.clone();
                tokio::spawn(async move { schemas.get_schema().await })
            })
            .collect();

        let mut snapshots = Vec::new();
        for handle in handles {
            snapshots.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(source.loads(), 1);
        assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));
    }

    #[tokio::test]
    async fn test_expired_entry_is_replaced() {
        let source = CountingSource::new(Duration::ZERO);
        let schemas = introspector(source.clone(), Duration::ZERO);

        let first = schemas.get_schema().await.unwrap();
        let second = schemas.get_schema().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(source.loads(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let source = CountingSource::new(Duration::ZERO);
        let schemas = introspector(source.clone(), Duration::from_secs(60));

        schemas.get_schema().await.unwrap();
        schemas.invalidate();
        assert!(schemas.cached().is_none());
        schemas.get_schema().await.unwrap();

        assert_eq!(source.loads(), 2);
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let source = CountingSource::new(Duration::from_secs(5));
        let schemas = SchemaIntrospector::new(
            source.clone(),
            Duration::from_secs(60),
            Duration::from_millis(50),
        );

        let err = schemas.get_schema().await.unwrap_err();
        assert!(matches!(err, SchemaError::Unavailable(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let source = CountingSource::new(Duration::ZERO);
        source.fail.store(true, Ordering::SeqCst);
        let schemas = introspector(source.clone(), Duration::from_secs(60));

        assert!(schemas.get_schema().await.is_err());
        assert!(schemas.cached().is_none());

        source.fail.store(false, Ordering::SeqCst);
        assert!(schemas.get_schema().await.is_ok());
        assert_eq!(source.loads(), 2);
    }

    /// Panics on its first load only
    struct PanickingSource {
        panicked: AtomicBool,
    }

    #[async_trait]
    impl SchemaSource for PanickingSource {
        async fn load_schema(&self) -> Result<SchemaSnapshot, SchemaError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("catalog driver crashed");
            }
            Ok(SchemaSnapshot::new(
                "main",
                vec![TableSchema::new(
                    "customers",
                    vec![ColumnSchema::new("id", "INTEGER", false)],
                )],
            ))
        }
    }

    #[tokio::test]
    async fn test_crashed_load_does_not_wedge_the_cache() {
        let source = Arc::new(PanickingSource {
            panicked: AtomicBool::new(false),
        });
        let schemas =
            SchemaIntrospector::new(source, Duration::from_secs(60), Duration::from_secs(5));

        let err = schemas.get_schema().await.unwrap_err();
        assert!(matches!(err, SchemaError::Unavailable(msg) if msg.contains("without a result")));

        let snapshot = schemas.get_schema().await.unwrap();
        assert_eq!(snapshot.table_count(), 1);
    }
}
