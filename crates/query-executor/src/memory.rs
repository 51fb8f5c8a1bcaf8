//! Memory accounting for pipelines.
//!
//! Reservations are logical: stages report how many bytes they retain, the
//! pipeline's [`MemoryContext`] tracks them per stage, and every change is
//! forwarded to the query-wide [`MemoryPool`]. Exceeding either ceiling fails
//! the task with [`QueryError::ExceededMemoryLimit`].

use query_core::{QueryError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Query-wide memory pool shared by every pipeline and exchange buffer of a query
#[derive(Debug)]
pub struct MemoryPool {
    label: String,
    limit: Option<u64>,
    reserved: AtomicU64,
    peak: AtomicU64,
}

impl MemoryPool {
    pub fn new(label: impl Into<String>, limit: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit,
            reserved: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        })
    }

    pub fn unbounded(label: impl Into<String>) -> Arc<Self> {
        Self::new(label, None)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    /// Reserve `bytes`, failing without side effects if the limit would be exceeded
    pub fn try_reserve(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if let Some(limit) = self.limit {
                if next > limit {
                    return Err(QueryError::ExceededMemoryLimit {
                        context: format!("query pool '{}'", self.label),
                        reserved: next,
                        limit,
                    });
                }
            }
            match self.reserved.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::AcqRel);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }
}

/// Per-pipeline accounting with one reservation slot per stage.
///
/// Owned by a single pipeline, so no interior locking is needed. Everything
/// still reserved is returned to the pool on [`MemoryContext::close`] or drop.
#[derive(Debug)]
pub struct MemoryContext {
    label: String,
    limit: Option<u64>,
    slots: Vec<u64>,
    reserved: u64,
    peak: u64,
    pool: Option<Arc<MemoryPool>>,
}

impl MemoryContext {
    pub fn new(label: impl Into<String>, slots: usize, limit: Option<u64>) -> Self {
        Self {
            label: label.into(),
            limit,
            slots: vec![0; slots],
            reserved: 0,
            peak: 0,
            pool: None,
        }
    }

    /// Forward reservations to a query-wide pool
    pub fn with_pool(mut self, pool: Arc<MemoryPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }

    pub fn slot(&self, slot: usize) -> u64 {
        self.slots.get(slot).copied().unwrap_or(0)
    }

    /// Set the reservation for `slot` to `bytes`
    pub fn set_reservation(&mut self, slot: usize, bytes: u64) -> Result<()> {
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, 0);
        }
        let previous = self.slots[slot];
        if bytes == previous {
            return Ok(());
        }

        if bytes > previous {
            let delta = bytes - previous;
            let next = self.reserved + delta;
            if let Some(limit) = self.limit {
                if next > limit {
                    return Err(QueryError::ExceededMemoryLimit {
                        context: format!("pipeline {}", self.label),
                        reserved: next,
                        limit,
                    });
                }
            }
            if let Some(pool) = &self.pool {
                pool.try_reserve(delta)?;
            }
            self.reserved = next;
            self.peak = self.peak.max(next);
        } else {
            let delta = previous - bytes;
            if let Some(pool) = &self.pool {
                pool.release(delta);
            }
            self.reserved -= delta;
        }
        self.slots[slot] = bytes;
        Ok(())
    }

    /// Release every reservation
    pub fn close(&mut self) {
        if let Some(pool) = &self.pool {
            pool.release(self.reserved);
        }
        self.reserved = 0;
        self.slots.iter_mut().for_each(|slot| *slot = 0);
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        self.close();
    }
}
