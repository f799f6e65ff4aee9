//! In-memory registry of launched jobs.
//!
//! Tracks the process id, start time and final status of every job started
//! during a pass so that outstanding work can be reported when the pass is
//! interrupted or times out while draining.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::RegistryError;

/// Lifecycle of a registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// One launched job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub subject: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: JobState,
    pub exit_code: Option<i32>,
}

/// Registry of jobs launched in this process.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly launched job as running.
    pub async fn register(
        &self,
        job_id: Uuid,
        subject: impl Into<String>,
        pid: Option<u32>,
        started_at: DateTime<Utc>,
    ) {
        let record = JobRecord {
            job_id,
            subject: subject.into(),
            pid,
            started_at,
            finished_at: None,
            state: JobState::Running,
            exit_code: None,
        };
        self.jobs.write().await.insert(job_id, record);
    }

    /// Records a job's exit code.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::JobNotFound` for unknown ids and
    /// `RegistryError::AlreadyFinished` if the job was already marked.
    pub async fn mark_finished(&self, job_id: Uuid, exit_code: i32) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(&job_id)
            .ok_or(RegistryError::JobNotFound(job_id))?;
        if record.state != JobState::Running {
            return Err(RegistryError::AlreadyFinished(job_id));
        }
        record.state = if exit_code == 0 {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        record.exit_code = Some(exit_code);
        record.finished_at = Some(Utc::now());
        Ok(())
    }

    pub async fn get(&self, job_id: Uuid) -> Option<JobRecord> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    pub async fn running_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|r| r.state == JobState::Running)
            .count()
    }

    /// Jobs still running, oldest first.
    pub async fn running(&self) -> Vec<JobRecord> {
        let mut running: Vec<JobRecord> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|r| r.state == JobState::Running)
            .cloned()
            .collect();
        running.sort_by_key(|r| r.started_at);
        running
    }

    /// All jobs, oldest first.
    pub async fn snapshot(&self) -> Vec<JobRecord> {
        let mut all: Vec<JobRecord> = self.jobs.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.started_at);
        all
    }
}
