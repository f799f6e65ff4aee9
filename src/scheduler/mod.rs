//! Batch scheduling state.
//!
//! - **ConcurrencyLimiter**: bounded semaphore capping jobs in flight
//! - **JobRegistry**: pid, start time and status of launched jobs
//! - **BatchState**: the two above plus a stop-waiting signal, shared by one
//!   orchestration pass
//!
//! # Example
//!
//! ```rust,ignore
//! let state = BatchState::new(4)?;
//! let permit = state.limiter().admit().await?;
//! let handle = dispatcher.execute(&subject, ExecutionMode::Detached).await?;
//! state.registry().register(handle.job_id(), handle.subject(), handle.pid(), handle.started_at()).await;
//! // ... permit dropped once the job exits
//! ```

pub mod limiter;
pub mod registry;

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::AdmissionError;

pub use limiter::{AdmissionPermit, ConcurrencyLimiter, LimiterStats};
pub use registry::{JobRecord, JobRegistry, JobState};

/// Explicit batch state shared by the orchestrator and its job tasks.
///
/// Cloning is cheap; clones share the same limiter, registry and signals.
/// Closing the limiter (first Ctrl-C) stops further admissions for every
/// clone; abandoning the drain (second Ctrl-C) also stops waiting for jobs
/// already running.
#[derive(Debug, Clone)]
pub struct BatchState {
    limiter: Arc<ConcurrencyLimiter>,
    registry: Arc<JobRegistry>,
    abandon: Arc<watch::Sender<bool>>,
}

impl BatchState {
    /// Creates batch state with the given concurrency cap.
    pub fn new(cap: usize) -> Result<Self, AdmissionError> {
        let (abandon, _) = watch::channel(false);
        Ok(Self {
            limiter: Arc::new(ConcurrencyLimiter::new(cap)?),
            registry: Arc::new(JobRegistry::new()),
            abandon: Arc::new(abandon),
        })
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn cap(&self) -> usize {
        self.limiter.cap()
    }

    /// Stops admitting new jobs.
    pub fn shutdown(&self) {
        self.limiter.close();
    }

    /// Stops admitting and stops waiting for running jobs; they keep running
    /// detached.
    pub fn abandon_drain(&self) {
        self.limiter.close();
        self.abandon.send_replace(true);
    }

    pub fn is_drain_abandoned(&self) -> bool {
        *self.abandon.borrow()
    }

    /// Resolves once [`abandon_drain`](Self::abandon_drain) has been called,
    /// immediately if it already was.
    pub async fn drain_abandoned(&self) {
        let mut rx = self.abandon.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|abandoned| *abandoned).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_closes_admission_only() {
        let state = BatchState::new(2).expect("state");
        state.shutdown();
        assert!(state.limiter().is_closed());
        assert!(!state.is_drain_abandoned());

        let waited =
            tokio::time::timeout(Duration::from_millis(20), state.drain_abandoned()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_abandon_drain_wakes_waiters_and_clones() {
        let state = BatchState::new(1).expect("state");
        let waiter = state.clone();
        let task = tokio::spawn(async move { waiter.drain_abandoned().await });

        tokio::task::yield_now().await;
        state.abandon_drain();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter woken")
            .expect("join");
        assert!(state.limiter().is_closed());
        // Late subscribers see the signal immediately.
        tokio::time::timeout(Duration::from_millis(50), state.clone().drain_abandoned())
            .await
            .expect("already abandoned");
    }
}
