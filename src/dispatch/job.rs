//! Job definitions for the dispatcher.
//!
//! - `JobDescriptor`: immutable description of one longitudinal job
//! - `ExecutionMode`: foreground (blocking) or detached (background)
//! - `JobOutcome`: exit status of a finished job

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dataset::Subject;
use crate::error::DispatchError;

/// How a job is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Inherit the terminal and block until exit.
    #[default]
    Foreground,
    /// Redirect output to a per-subject log and run in its own process group.
    Detached,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Foreground => write!(f, "foreground"),
            ExecutionMode::Detached => write!(f, "detached"),
        }
    }
}

/// Description of one longitudinal job: a template and all of its timepoints.
///
/// Built fresh per dispatch and never mutated afterwards; fields are only
/// reachable through accessors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDescriptor {
    id: Uuid,
    template: String,
    timepoints: Vec<String>,
    images: Vec<PathBuf>,
    options: Vec<String>,
    mode: ExecutionMode,
    created_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// Builds a descriptor covering every timepoint of `subject`.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotLongitudinal` for fewer than two sessions and
    /// `DispatchError::UnresolvedInput` if any session lacks an input image.
    /// Both are preconditions checked before any job starts.
    pub fn new(
        subject: &Subject,
        options: Vec<String>,
        mode: ExecutionMode,
    ) -> Result<Self, DispatchError> {
        if subject.sessions.len() < 2 {
            return Err(DispatchError::NotLongitudinal(subject.id.clone()));
        }

        let mut timepoints = Vec::with_capacity(subject.sessions.len());
        let mut images = Vec::with_capacity(subject.sessions.len());
        for session in &subject.sessions {
            let image = session
                .image
                .clone()
                .ok_or_else(|| DispatchError::UnresolvedInput {
                    subject: subject.id.clone(),
                    session: session.id.clone(),
                })?;
            timepoints.push(subject.timepoint_id(session));
            images.push(image);
        }

        Ok(Self {
            id: Uuid::new_v4(),
            template: subject.id.clone(),
            timepoints,
            images,
            options,
            mode,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Template (base) id, equal to the subject id.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Timepoint ids in session order.
    pub fn timepoints(&self) -> &[String] {
        &self.timepoints
    }

    /// Input images, aligned with `timepoints()`.
    pub fn images(&self) -> &[PathBuf] {
        &self.images
    }

    /// Filtered processing flags.
    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Result of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    /// ID of the descriptor that was executed.
    pub job_id: Uuid,
    /// Template (subject) id.
    pub subject: String,
    /// Process exit code; `-1` when terminated by a signal.
    pub exit_code: i32,
    /// Rendered command line.
    pub command: String,
    /// Per-subject log, when output was captured.
    pub log_path: Option<PathBuf>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl JobOutcome {
    /// Returns whether the job exited with code 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}
