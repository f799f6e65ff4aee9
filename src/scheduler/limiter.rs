//! Concurrency limiter.
//!
//! A bounded semaphore caps the number of jobs in flight. Each admitted job
//! holds an [`AdmissionPermit`]; dropping the permit releases the slot, so a
//! slot is returned on every exit path including panics and cancellation.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::AdmissionError;

/// Snapshot of limiter activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Configured cap.
    pub cap: usize,
    /// Jobs currently holding a permit.
    pub in_flight: usize,
    /// Highest number of simultaneous permits observed.
    pub peak: usize,
    /// Total permits handed out.
    pub admitted: u64,
}

#[derive(Debug, Default)]
struct SharedLimiterStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    admitted: AtomicU64,
}

impl SharedLimiterStats {
    fn record_admission(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Caps the number of simultaneously running jobs.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    cap: usize,
    semaphore: Arc<Semaphore>,
    stats: Arc<SharedLimiterStats>,
}

impl ConcurrencyLimiter {
    /// Creates a limiter admitting at most `cap` jobs at a time.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::InvalidCap` when `cap` is zero.
    pub fn new(cap: usize) -> Result<Self, AdmissionError> {
        if cap == 0 {
            return Err(AdmissionError::InvalidCap(cap));
        }
        Ok(Self {
            cap,
            semaphore: Arc::new(Semaphore::new(cap)),
            stats: Arc::new(SharedLimiterStats::default()),
        })
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::Closed` once [`close`](Self::close) was called,
    /// including for callers already waiting.
    pub async fn admit(&self) -> Result<AdmissionPermit, AdmissionError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;
        self.stats.record_admission();
        debug!(
            in_flight = self.stats.in_flight.load(Ordering::SeqCst),
            cap = self.cap,
            "Admitted job"
        );
        Ok(AdmissionPermit {
            _permit: permit,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Stops admitting new jobs. Permits already handed out stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            cap: self.cap,
            in_flight: self.stats.in_flight.load(Ordering::SeqCst),
            peak: self.stats.peak.load(Ordering::SeqCst),
            admitted: self.stats.admitted.load(Ordering::Relaxed),
        }
    }
}

/// A held concurrency slot. Released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<SharedLimiterStats>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.stats.record_release();
    }
}
