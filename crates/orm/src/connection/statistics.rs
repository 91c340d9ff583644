//! Connection Pool Statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live counters shared by a pool and its leases
#[derive(Debug)]
pub(crate) struct PoolCounters {
    pub(crate) acquire_count: AtomicU64,
    pub(crate) acquire_errors: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) active: AtomicU64,
    created_at: Instant,
}

impl PoolCounters {
    pub(crate) fn new() -> Self {
        Self {
            acquire_count: AtomicU64::new(0),
            acquire_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            active: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    pub(crate) fn snapshot(&self, max_connections: u32) -> PoolStats {
        PoolStats {
            max_connections,
            active_connections: self.active.load(Ordering::Relaxed),
            acquire_count: self.acquire_count.load(Ordering::Relaxed),
            acquire_errors: self.acquire_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            uptime: self.created_at.elapsed(),
        }
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub max_connections: u32,
    /// Sessions currently checked out
    pub active_connections: u64,
    pub acquire_count: u64,
    pub acquire_errors: u64,
    /// Acquisitions that gave up waiting for a free slot
    pub timeouts: u64,
    /// Connect attempts repeated after a transient failure
    pub retries: u64,
    pub uptime: Duration,
}

impl PoolStats {
    /// Calculate the error rate as a percentage
    pub fn error_rate(&self) -> f64 {
        if self.acquire_count > 0 {
            (self.acquire_errors as f64 / self.acquire_count as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Checked-out sessions as a percentage of the pool size
    pub fn utilization(&self) -> f64 {
        if self.max_connections > 0 {
            (self.active_connections as f64 / f64::from(self.max_connections)) * 100.0
        } else {
            0.0
        }
    }

    pub fn idle_connections(&self) -> u64 {
        u64::from(self.max_connections).saturating_sub(self.active_connections)
    }

    /// Check if the pool is under stress (high utilization)
    pub fn is_under_stress(&self, threshold: f64) -> bool {
        self.utilization() > threshold
    }
}
