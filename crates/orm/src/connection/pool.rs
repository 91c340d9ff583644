//! Connection Pool Management
//!
//! A semaphore bounds the number of live sessions. Acquisition waits at
//! most the configured timeout; transient connect failures are retried
//! with exponential backoff.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use super::statistics::{PoolCounters, PoolStats};
use crate::backends::{DatabaseBackend, DatabaseConnection, MemoryBackend, PostgresBackend};
use crate::config::{BackendKind, DatabaseConfig};
use crate::error::{OrmError, OrmResult};
use crate::relationships::BatchConfig;
use crate::transaction::Session;

/// Slot held by a checked-out session
pub(crate) struct PoolLease {
    _permit: OwnedSemaphorePermit,
    counters: Arc<PoolCounters>,
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
    }
}

struct PoolInner {
    backend: Arc<dyn DatabaseBackend>,
    semaphore: Arc<Semaphore>,
    config: DatabaseConfig,
    counters: Arc<PoolCounters>,
}

/// Bounded pool of sessions; cheap to clone
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Pool for the backend selected by the configured URL.
    ///
    /// Every `memory://` pool gets its own empty store.
    pub fn connect(config: &DatabaseConfig) -> OrmResult<Self> {
        config.validate()?;
        let backend: Arc<dyn DatabaseBackend> = match config.backend_kind()? {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::Postgres => Arc::new(PostgresBackend::create_pool(config)?),
        };
        Ok(Self::new(backend, config.clone()))
    }

    pub fn new(backend: Arc<dyn DatabaseBackend>, config: DatabaseConfig) -> Self {
        debug!(
            "Creating {} pool with {} connections",
            backend.name(),
            config.max_connections
        );
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
                backend,
                config,
                counters: Arc::new(PoolCounters::new()),
            }),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.counters.snapshot(self.inner.config.max_connections)
    }

    /// Check out a session, waiting at most `acquire_timeout`
    pub async fn acquire(&self) -> OrmResult<Session> {
        let counters = &self.inner.counters;
        counters.acquire_count.fetch_add(1, Ordering::Relaxed);

        let timeout = self.inner.config.acquire_timeout();
        let permit = match tokio::time::timeout(timeout, self.inner.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                counters.acquire_errors.fetch_add(1, Ordering::Relaxed);
                return Err(OrmError::Connection("connection pool is closed".to_string()));
            }
            Err(_) => {
                counters.acquire_errors.fetch_add(1, Ordering::Relaxed);
                counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("No connection available after {:?}", timeout);
                return Err(OrmError::PoolExhausted { timeout });
            }
        };

        let conn = match self.connect_with_retry().await {
            Ok(conn) => conn,
            Err(OrmError::PoolExhausted { .. }) => {
                counters.acquire_errors.fetch_add(1, Ordering::Relaxed);
                counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(OrmError::PoolExhausted { timeout });
            }
            Err(e) => {
                counters.acquire_errors.fetch_add(1, Ordering::Relaxed);
                error!("Failed to acquire database connection: {}", e);
                return Err(e);
            }
        };

        counters.active.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Database connection acquired (active: {})",
            counters.active.load(Ordering::Relaxed)
        );
        let lease = PoolLease {
            _permit: permit,
            counters: Arc::clone(counters),
        };
        let batch = BatchConfig::new(self.inner.config.prefetch_batch_size);
        Ok(Session::leased(conn, lease, batch))
    }

    async fn connect_with_retry(&self) -> OrmResult<Box<dyn DatabaseConnection>> {
        let retries = self.inner.config.acquire_retries;
        let mut delay = self.inner.config.retry_backoff();
        let mut attempt = 0;
        loop {
            match self.inner.backend.connect().await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    self.inner.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Connection attempt {} failed: {}; retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `f` on a fresh session. A transaction `f` leaves open is rolled
    /// back, and the connection returns to the pool on every path.
    pub async fn scope<T, F>(&self, f: F) -> OrmResult<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, OrmResult<T>> + Send,
    {
        let mut session = self.acquire().await?;
        let result = f(&mut session).await;
        if session.in_transaction() {
            warn!("Session scope ended inside a transaction; rolling back");
            if let Err(e) = session.rollback_all().await {
                warn!("Rollback at scope exit failed: {}", e);
            }
        }
        result
    }
}
