//! Process launching.
//!
//! `JobRunner` is the seam between the dispatcher and the operating system.
//! `ProcessRunner` spawns the container runtime; tests substitute runners
//! that simulate exit codes and delays without any container.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::DispatchError;

use super::command::ContainerCommand;
use super::job::JobDescriptor;

/// Exit code reported when a process ends without one (killed by a signal).
pub const SIGNALED_EXIT_CODE: i32 = -1;

/// A started job whose completion can be awaited.
pub struct LaunchedJob {
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    completion: BoxFuture<'static, std::io::Result<i32>>,
}

impl LaunchedJob {
    /// Wraps a completion future resolving to the process exit code.
    pub fn new(
        pid: Option<u32>,
        completion: impl std::future::Future<Output = std::io::Result<i32>> + Send + 'static,
    ) -> Self {
        Self {
            pid,
            started_at: Utc::now(),
            completion: completion.boxed(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Waits for the job to exit and returns its exit code.
    pub async fn wait(self) -> std::io::Result<i32> {
        self.completion.await
    }
}

impl std::fmt::Debug for LaunchedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedJob")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Starts job processes.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Launches `command` for `descriptor`.
    ///
    /// When `log_path` is set, output goes to that file (appending) and the
    /// process is detached from the terminal; otherwise it inherits stdio.
    async fn launch(
        &self,
        descriptor: &JobDescriptor,
        command: &ContainerCommand,
        log_path: Option<&Path>,
    ) -> Result<LaunchedJob, DispatchError>;
}

/// Runs jobs as real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobRunner for ProcessRunner {
    async fn launch(
        &self,
        descriptor: &JobDescriptor,
        command: &ContainerCommand,
        log_path: Option<&Path>,
    ) -> Result<LaunchedJob, DispatchError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);

        match log_path {
            Some(path) => {
                let (stdout, stderr) = open_job_log(path, descriptor, command)?;
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::from(stdout))
                    .stderr(Stdio::from(stderr));
                #[cfg(unix)]
                cmd.process_group(0);
            }
            None => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
        }

        let mut child = cmd.spawn().map_err(|source| DispatchError::SpawnFailed {
            subject: descriptor.template().to_string(),
            source,
        })?;
        let pid = child.id();
        debug!(subject = %descriptor.template(), pid = ?pid, "Spawned job process");

        Ok(LaunchedJob::new(pid, async move {
            let status = child.wait().await?;
            Ok(status.code().unwrap_or(SIGNALED_EXIT_CODE))
        }))
    }
}

/// Opens the per-subject log for appending and writes a run header.
fn open_job_log(
    path: &Path,
    descriptor: &JobDescriptor,
    command: &ContainerCommand,
) -> Result<(std::fs::File, std::fs::File), DispatchError> {
    let log_err = |source| DispatchError::LogFile {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(log_err)?;
    }
    let mut stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(log_err)?;
    writeln!(
        stdout,
        "==> {} job {} for {}\n==> {}",
        Utc::now().to_rfc3339(),
        descriptor.id(),
        descriptor.template(),
        command
    )
    .map_err(log_err)?;
    let stderr = stdout.try_clone().map_err(log_err)?;
    Ok((stdout, stderr))
}
