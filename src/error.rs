//! Error types for longsurf operations.
//!
//! Defines error types for the major subsystems:
//! - Configuration loading and validation
//! - Dataset discovery
//! - Job dispatch and process execution
//! - Job registry bookkeeping
//! - Symlink layout repair

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported config format '{0}': expected .json, .yaml or .yml")]
    UnsupportedFormat(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur while scanning a dataset.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Dataset root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("Dataset root is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Failed to walk dataset: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Errors that can occur while building or executing a job.
///
/// A non-zero exit code is not represented here: it is a normal
/// [`JobOutcome`](crate::dispatch::JobOutcome).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Subject '{subject}' has no resolvable input image for session '{session}'")]
    UnresolvedInput { subject: String, session: String },

    #[error("Subject '{0}' has fewer than two sessions")]
    NotLongitudinal(String),

    #[error("Failed to spawn job for '{subject}': {source}")]
    SpawnFailed {
        subject: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open job log '{path}': {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting on job for '{subject}': {source}")]
    WaitFailed {
        subject: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the job registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Job '{0}' not found in registry")]
    JobNotFound(uuid::Uuid),

    #[error("Job '{0}' already finished")]
    AlreadyFinished(uuid::Uuid),
}

/// Errors that can occur while creating or repairing links.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Output root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("Failed to read output root '{path}': {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the concurrency limiter.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Limiter closed: no new jobs are admitted")]
    Closed,

    #[error("Invalid concurrency cap {0}: must be at least 1")]
    InvalidCap(usize),
}

/// Errors that abort a whole orchestration pass.
///
/// Per-subject failures never surface here; they are recorded and the pass
/// continues.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No eligible subjects found in {0}")]
    NoEligibleSubjects(PathBuf),

    #[error("Nothing selected: {0}")]
    EmptySelection(String),

    #[error("Unknown subject '{0}'")]
    UnknownSubject(String),

    #[error("Subject '{subject}' is not eligible: {reason}")]
    IneligibleSubject { subject: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Failed to read rerun list '{path}': {source}")]
    RerunList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
