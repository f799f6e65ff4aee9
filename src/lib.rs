//! longsurf: longitudinal FastSurfer orchestration.
//!
//! Discovers subjects with two or more imaging sessions in a BIDS dataset,
//! skips those whose outputs are already complete, dispatches one
//! containerized longitudinal job per remaining subject under a concurrency
//! cap, and maintains the `<timepoint>.long.<template>` link layout that
//! downstream tools expect.

pub mod cli;
pub mod config;
pub mod dataset;
pub mod dispatch;
pub mod errlog;
pub mod error;
pub mod layout;
pub mod linker;
pub mod orchestrator;
pub mod scheduler;

pub use config::{ContainerRuntime, OrchestratorConfig};
pub use dataset::{Discovery, Session, Subject, SubjectDiscoverer};
pub use dispatch::{ExecutionMode, JobDispatcher, JobRunner, ProcessRunner};
pub use errlog::{ErrorRecord, ErrorRecorder};
pub use error::{
    AdmissionError, ConfigError, DiscoveryError, DispatchError, LinkError, OrchestratorError,
    RegistryError,
};
pub use layout::{CompletionChecker, OutputLayout};
pub use linker::{repair, LinkOptions, RepairSummary, ResultLinker};
pub use orchestrator::{Orchestrator, PassOptions, PassSummary, Selection, SubjectState};
pub use scheduler::{BatchState, ConcurrencyLimiter, JobRegistry};
