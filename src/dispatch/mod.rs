//! Job dispatch.
//!
//! Turns an eligible subject into a single longitudinal job, launches it
//! through a [`JobRunner`], and reports a [`JobOutcome`] once it exits.
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = JobDispatcher::new(config, OutputLayout::new("/out"), Arc::new(ProcessRunner::new()));
//! let handle = dispatcher.execute(&subject, ExecutionMode::Detached).await?;
//! let outcome = handle.wait().await?;
//! ```

pub mod command;
pub mod job;
pub mod runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::dataset::Subject;
use crate::error::DispatchError;
use crate::layout::OutputLayout;

pub use command::ContainerCommand;
pub use job::{ExecutionMode, JobDescriptor, JobOutcome};
pub use runner::{JobRunner, LaunchedJob, ProcessRunner, SIGNALED_EXIT_CODE};

/// Builds and launches longitudinal jobs.
#[derive(Clone)]
pub struct JobDispatcher {
    config: Arc<OrchestratorConfig>,
    layout: OutputLayout,
    runner: Arc<dyn JobRunner>,
}

impl JobDispatcher {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        layout: OutputLayout,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        Self {
            config,
            layout,
            runner,
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Builds the descriptor for a subject.
    pub fn build(
        &self,
        subject: &Subject,
        mode: ExecutionMode,
    ) -> Result<JobDescriptor, DispatchError> {
        JobDescriptor::new(subject, self.config.option_flags(), mode)
    }

    /// Builds the container command for a descriptor.
    pub fn command_for(&self, descriptor: &JobDescriptor) -> ContainerCommand {
        ContainerCommand::build(&self.config, descriptor, self.layout.root())
    }

    /// Per-subject log file (`<log_dir>/<subject>.log`).
    pub fn log_path(&self, subject: &str) -> PathBuf {
        self.config
            .log_dir_path(self.layout.root())
            .join(format!("{subject}.log"))
    }

    /// Launches the job for `subject` and returns a handle to await it.
    ///
    /// Returns once the process has started; detached jobs write to the
    /// per-subject log, foreground jobs inherit the terminal.
    pub async fn execute(
        &self,
        subject: &Subject,
        mode: ExecutionMode,
    ) -> Result<JobHandle, DispatchError> {
        let descriptor = self.build(subject, mode)?;
        let command = self.command_for(&descriptor);
        let log_path = match mode {
            ExecutionMode::Detached => Some(self.log_path(&subject.id)),
            ExecutionMode::Foreground => None,
        };

        info!(
            subject = %subject.id,
            job_id = %descriptor.id(),
            mode = %mode,
            timepoints = descriptor.timepoints().len(),
            "Dispatching longitudinal job"
        );

        let launched = self
            .runner
            .launch(&descriptor, &command, log_path.as_deref())
            .await?;

        Ok(JobHandle {
            descriptor,
            command,
            log_path,
            launched,
            started: Instant::now(),
        })
    }

    /// Launches and waits in one step.
    pub async fn run_to_completion(
        &self,
        subject: &Subject,
        mode: ExecutionMode,
    ) -> Result<JobOutcome, DispatchError> {
        self.execute(subject, mode).await?.wait().await
    }
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("layout", &self.layout)
            .field("runtime", &self.config.runtime)
            .finish_non_exhaustive()
    }
}

/// A launched job not yet awaited.
#[derive(Debug)]
pub struct JobHandle {
    descriptor: JobDescriptor,
    command: ContainerCommand,
    log_path: Option<PathBuf>,
    launched: LaunchedJob,
    started: Instant,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.descriptor.id()
    }

    pub fn subject(&self) -> &str {
        self.descriptor.template()
    }

    pub fn pid(&self) -> Option<u32> {
        self.launched.pid()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.launched.started_at()
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    pub fn command(&self) -> &ContainerCommand {
        &self.command
    }

    pub fn log_path(&self) -> Option<&std::path::Path> {
        self.log_path.as_deref()
    }

    /// Waits for exit and builds the outcome.
    pub async fn wait(self) -> Result<JobOutcome, DispatchError> {
        let subject = self.descriptor.template().to_string();
        let exit_code = self
            .launched
            .wait()
            .await
            .map_err(|source| DispatchError::WaitFailed {
                subject: subject.clone(),
                source,
            })?;

        Ok(JobOutcome {
            job_id: self.descriptor.id(),
            subject,
            exit_code,
            command: self.command.to_shell_string(),
            log_path: self.log_path,
            duration_ms: self.started.elapsed().as_millis() as u64,
        })
    }
}
