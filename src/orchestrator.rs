//! One orchestration pass.
//!
//! ```text
//! discover -> select -> completion check -> admit -> dispatch -> wait
//!                              |                                 |
//!                         CompleteSkip              success: link / failure: record
//! ```
//!
//! Each subject moves through a small state machine ([`SubjectState`]); the
//! pass never aborts because of a single subject. Only configuration and
//! selection problems, detected before any dispatch, are fatal.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::dataset::{Discovery, Subject, SubjectDiscoverer};
use crate::dispatch::{ExecutionMode, JobDispatcher, JobHandle, JobRunner, SIGNALED_EXIT_CODE};
use crate::errlog::{ErrorRecord, ErrorRecorder};
use crate::error::OrchestratorError;
use crate::layout::{CompletionChecker, CompletionReport, OutputLayout};
use crate::linker::{LinkOptions, LinkReport, ResultLinker};
use crate::scheduler::{AdmissionPermit, BatchState, JobRecord, JobRegistry};

/// Per-subject state within one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectState {
    Discovered,
    Eligible,
    Ineligible,
    CompleteSkip,
    /// Dry run: the job was planned but not started.
    Planned,
    /// Admission closed (interrupt) before the job could start.
    Cancelled,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Linked,
    ErrorRecorded,
}

impl SubjectState {
    /// States reachable from this one.
    pub fn next_states(self) -> &'static [SubjectState] {
        use SubjectState::*;
        match self {
            Discovered => &[Eligible, Ineligible],
            Eligible => &[CompleteSkip, Dispatched, Planned, Cancelled],
            Dispatched => &[Running, Failed],
            Running => &[Succeeded, Failed],
            Succeeded => &[Linked],
            Failed => &[ErrorRecorded],
            Ineligible | CompleteSkip | Planned | Cancelled | Linked | ErrorRecorded => &[],
        }
    }

    pub fn can_transition_to(self, next: SubjectState) -> bool {
        self.next_states().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.next_states().is_empty()
    }
}

impl std::fmt::Display for SubjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubjectState::Discovered => "discovered",
            SubjectState::Eligible => "eligible",
            SubjectState::Ineligible => "ineligible",
            SubjectState::CompleteSkip => "complete",
            SubjectState::Planned => "planned",
            SubjectState::Cancelled => "cancelled",
            SubjectState::Dispatched => "dispatched",
            SubjectState::Running => "running",
            SubjectState::Succeeded => "succeeded",
            SubjectState::Failed => "failed",
            SubjectState::Linked => "linked",
            SubjectState::ErrorRecorded => "error recorded",
        };
        f.write_str(name)
    }
}

/// What happened to one subject during the pass.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectReport {
    pub subject: String,
    pub state: SubjectState,
    /// Every state visited, in order, ending with `state`.
    pub history: Vec<SubjectState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<LinkReport>,
}

impl SubjectReport {
    fn discovered(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            state: SubjectState::Discovered,
            history: vec![SubjectState::Discovered],
            reason: None,
            job_id: None,
            pid: None,
            exit_code: None,
            command: None,
            log_path: None,
            duration_ms: None,
            links: None,
        }
    }

    fn advance(&mut self, next: SubjectState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {} for {}",
            self.state,
            next,
            self.subject
        );
        self.state = next;
        self.history.push(next);
    }

    pub fn visited(&self, state: SubjectState) -> bool {
        self.history.contains(&state)
    }
}

/// How subjects are chosen for a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every eligible subject, minus `skip`.
    Automatic { skip: Vec<String> },
    /// Exactly these subjects; each must be eligible.
    Manual(Vec<String>),
    /// One random incomplete eligible subject.
    Pilot { seed: Option<u64>, skip: Vec<String> },
    /// Subjects listed in a file (plain ids or error-log lines).
    RerunFrom(PathBuf),
}

impl Default for Selection {
    fn default() -> Self {
        Selection::Automatic { skip: Vec::new() }
    }
}

/// Options for one pass.
#[derive(Debug, Clone, Default)]
pub struct PassOptions {
    pub selection: Selection,
    pub mode: ExecutionMode,
    /// Plan commands without starting anything.
    pub dry_run: bool,
    /// Upper bound on waiting for detached jobs at the end of the pass.
    pub drain_timeout: Option<Duration>,
}

/// A job that a dry run would have started.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub subject: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

/// Outcome of a pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: ExecutionMode,
    pub cap: usize,
    pub dry_run: bool,
    pub discovered: usize,
    pub eligible: usize,
    pub selected: usize,
    pub complete_skipped: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub peak_in_flight: usize,
    pub error_log: PathBuf,
    pub planned: Vec<PlannedJob>,
    pub still_running: Vec<JobRecord>,
    pub subjects: Vec<SubjectReport>,
}

impl PassSummary {
    /// Reports for subjects that reached `state` at some point.
    pub fn subjects_in(&self, state: SubjectState) -> impl Iterator<Item = &SubjectReport> {
        self.subjects.iter().filter(move |r| r.visited(state))
    }

    pub fn report(&self, subject: &str) -> Option<&SubjectReport> {
        self.subjects.iter().find(|r| r.subject == subject)
    }
}

/// Read-only view of the dataset against the output root.
#[derive(Debug, Clone, Serialize)]
pub struct Survey {
    pub discovery: Discovery,
    pub completion: Vec<CompletionReport>,
}

impl Survey {
    pub fn complete_count(&self) -> usize {
        self.completion.iter().filter(|c| c.is_complete()).count()
    }
}

/// Post-exit handling shared by foreground and detached jobs.
#[derive(Clone)]
struct Completion {
    linker: ResultLinker,
    recorder: Arc<ErrorRecorder>,
    registry: Arc<JobRegistry>,
}

impl Completion {
    async fn finish(
        self,
        handle: JobHandle,
        mut report: SubjectReport,
        timepoints: Vec<String>,
        permit: AdmissionPermit,
    ) -> SubjectReport {
        let job_id = handle.job_id();
        let command = handle.command().to_shell_string();
        let log_path = handle.log_path().map(Path::to_path_buf);

        let exit_code = match handle.wait().await {
            Ok(outcome) => {
                report.duration_ms = Some(outcome.duration_ms);
                outcome.exit_code
            }
            Err(e) => {
                error!(subject = %report.subject, error = %e, "Lost track of job");
                SIGNALED_EXIT_CODE
            }
        };
        drop(permit);

        if let Err(e) = self.registry.mark_finished(job_id, exit_code).await {
            warn!(subject = %report.subject, error = %e, "Job registry out of sync");
        }
        report.exit_code = Some(exit_code);

        if exit_code == 0 {
            report.advance(SubjectState::Succeeded);
            let links = self.linker.link(&report.subject, &timepoints);
            info!(
                subject = %report.subject,
                created = links.created(),
                skipped = links.skipped(),
                warnings = links.warnings(),
                "Job succeeded"
            );
            report.links = Some(links);
            report.advance(SubjectState::Linked);
        } else {
            report.advance(SubjectState::Failed);
            self.recorder
                .record(&report.subject, &command, exit_code, log_path.as_deref());
            warn!(subject = %report.subject, exit_code, "Job failed; error recorded");
            report.advance(SubjectState::ErrorRecorded);
        }

        report
    }
}

/// Runs orchestration passes over one dataset and output root.
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    discoverer: SubjectDiscoverer,
    checker: CompletionChecker,
    dispatcher: JobDispatcher,
    linker: ResultLinker,
    recorder: Arc<ErrorRecorder>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        dataset_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        let layout = OutputLayout::new(output_root);
        let checker = CompletionChecker::new(layout.clone(), config.marker_file.clone());
        let linker = ResultLinker::new(layout.clone()).with_options(LinkOptions {
            force: config.link_force,
            dry_run: false,
        });
        let recorder = Arc::new(ErrorRecorder::new(config.error_log_path(layout.root())));
        let dispatcher = JobDispatcher::new(Arc::clone(&config), layout, runner);

        Self {
            config,
            discoverer: SubjectDiscoverer::new(dataset_root),
            checker,
            dispatcher,
            linker,
            recorder,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn error_log(&self) -> &Path {
        self.recorder.path()
    }

    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    /// Discovers subjects and checks completion without dispatching anything.
    pub fn survey(&self) -> Result<Survey, OrchestratorError> {
        let discovery = self.discoverer.discover()?;
        let completion = discovery
            .eligible
            .iter()
            .map(|s| self.checker.check(s))
            .collect();
        Ok(Survey {
            discovery,
            completion,
        })
    }

    /// Resolves a selection against a discovery result.
    ///
    /// # Errors
    ///
    /// Fails when nothing is eligible in automatic or pilot mode, or when an
    /// explicitly named subject is unknown or ineligible.
    pub fn select(
        &self,
        discovery: &Discovery,
        selection: &Selection,
    ) -> Result<Vec<Subject>, OrchestratorError> {
        match selection {
            Selection::Automatic { skip } => {
                self.require_eligible(discovery)?;
                Ok(without(&discovery.eligible, skip).cloned().collect())
            }
            Selection::Manual(ids) => resolve_ids(discovery, ids),
            Selection::RerunFrom(path) => {
                let ids = read_subject_list(path)?;
                if ids.is_empty() {
                    return Err(OrchestratorError::EmptySelection(format!(
                        "no subject ids in {}",
                        path.display()
                    )));
                }
                resolve_ids(discovery, &ids)
            }
            Selection::Pilot { seed, skip } => {
                self.require_eligible(discovery)?;
                let candidates: Vec<&Subject> = without(&discovery.eligible, skip)
                    .filter(|s| !self.checker.is_complete(s))
                    .collect();
                let mut rng = match seed {
                    Some(seed) => ChaCha8Rng::seed_from_u64(*seed),
                    None => ChaCha8Rng::from_rng(&mut rand::rng()),
                };
                let picked = candidates.choose(&mut rng).map(|s| Subject::clone(s));
                match &picked {
                    Some(subject) => info!(subject = %subject.id, "Pilot subject selected"),
                    None => info!("Pilot mode: every eligible subject is already complete"),
                }
                Ok(picked.into_iter().collect())
            }
        }
    }

    fn require_eligible(&self, discovery: &Discovery) -> Result<(), OrchestratorError> {
        if discovery.eligible.is_empty() {
            return Err(OrchestratorError::NoEligibleSubjects(
                self.discoverer.root().to_path_buf(),
            ));
        }
        Ok(())
    }

    /// Runs one pass.
    ///
    /// Returns `Err` only for problems detected before any dispatch; job
    /// failures are reported in the summary.
    pub async fn run(
        &self,
        options: &PassOptions,
        state: &BatchState,
    ) -> Result<PassSummary, OrchestratorError> {
        let started_at = Utc::now();
        let discovery = self.discoverer.discover()?;
        let selected = self.select(&discovery, &options.selection)?;

        info!(
            discovered = discovery.total(),
            eligible = discovery.eligible.len(),
            selected = selected.len(),
            mode = %options.mode,
            cap = state.cap(),
            dry_run = options.dry_run,
            "Starting pass"
        );

        let mut reports: BTreeMap<String, SubjectReport> = BTreeMap::new();
        for skipped in &discovery.skipped {
            let mut report = SubjectReport::discovered(&skipped.subject.id);
            report.reason = Some(skipped.reason.to_string());
            report.advance(SubjectState::Ineligible);
            reports.insert(report.subject.clone(), report);
        }

        let mut queue = Vec::new();
        for subject in selected.iter() {
            let mut report = SubjectReport::discovered(&subject.id);
            report.advance(SubjectState::Eligible);
            if self.checker.is_complete(subject) {
                info!(subject = %subject.id, "Already complete; skipping");
                report.advance(SubjectState::CompleteSkip);
            } else {
                queue.push(subject);
            }
            reports.insert(report.subject.clone(), report);
        }

        let mut planned = Vec::new();
        if options.dry_run {
            for subject in &queue {
                let descriptor = self.dispatcher.build(subject, options.mode)?;
                let command = self.dispatcher.command_for(&descriptor);
                let log_path = (options.mode == ExecutionMode::Detached)
                    .then(|| self.dispatcher.log_path(&subject.id));
                planned.push(PlannedJob {
                    subject: subject.id.clone(),
                    command: command.to_shell_string(),
                    log_path,
                });
                if let Some(report) = reports.get_mut(&subject.id) {
                    report.advance(SubjectState::Planned);
                }
            }
        } else {
            match options.mode {
                ExecutionMode::Foreground => {
                    if state.cap() > 1 {
                        warn!(cap = state.cap(), "Foreground jobs run one at a time");
                    }
                    self.run_foreground(&queue, state, &mut reports).await;
                }
                ExecutionMode::Detached => {
                    self.run_detached(&queue, state, options.drain_timeout, &mut reports)
                        .await;
                }
            }
        }

        let subjects: Vec<SubjectReport> = reports.into_values().collect();
        let count = |state: SubjectState| subjects.iter().filter(|r| r.visited(state)).count();
        let (complete_skipped, dispatched, succeeded, failed, cancelled) = (
            count(SubjectState::CompleteSkip),
            count(SubjectState::Dispatched),
            count(SubjectState::Succeeded),
            count(SubjectState::Failed),
            count(SubjectState::Cancelled),
        );
        let summary = PassSummary {
            started_at,
            finished_at: Utc::now(),
            mode: options.mode,
            cap: state.cap(),
            dry_run: options.dry_run,
            discovered: discovery.total(),
            eligible: discovery.eligible.len(),
            selected: selected.len(),
            complete_skipped,
            dispatched,
            succeeded,
            failed,
            cancelled,
            peak_in_flight: state.limiter().stats().peak,
            error_log: self.recorder.path().to_path_buf(),
            planned,
            still_running: state.registry().running().await,
            subjects,
        };

        info!(
            dispatched = summary.dispatched,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped_complete = summary.complete_skipped,
            still_running = summary.still_running.len(),
            "Pass finished"
        );

        Ok(summary)
    }

    fn completion(&self, state: &BatchState) -> Completion {
        Completion {
            linker: self.linker.clone(),
            recorder: Arc::clone(&self.recorder),
            registry: Arc::clone(state.registry()),
        }
    }

    async fn run_foreground(
        &self,
        queue: &[&Subject],
        state: &BatchState,
        reports: &mut BTreeMap<String, SubjectReport>,
    ) {
        for (index, subject) in queue.iter().enumerate() {
            let Ok(permit) = state.limiter().admit().await else {
                cancel_remaining(&queue[index..], reports);
                break;
            };
            let Some(report) = reports.get_mut(&subject.id) else {
                continue;
            };
            if let Some(handle) = self
                .launch(subject, ExecutionMode::Foreground, state, report)
                .await
            {
                let finished = self
                    .completion(state)
                    .finish(handle, report.clone(), subject.timepoint_ids(), permit)
                    .await;
                *report = finished;
            }
        }
    }

    async fn run_detached(
        &self,
        queue: &[&Subject],
        state: &BatchState,
        drain_timeout: Option<Duration>,
        reports: &mut BTreeMap<String, SubjectReport>,
    ) {
        let mut tasks = JoinSet::new();

        for (index, subject) in queue.iter().enumerate() {
            let Ok(permit) = state.limiter().admit().await else {
                warn!(
                    remaining = queue.len() - index,
                    "Admission closed; not starting remaining subjects"
                );
                cancel_remaining(&queue[index..], reports);
                break;
            };
            let Some(report) = reports.get_mut(&subject.id) else {
                continue;
            };
            if let Some(handle) = self
                .launch(subject, ExecutionMode::Detached, state, report)
                .await
            {
                tasks.spawn(self.completion(state).finish(
                    handle,
                    report.clone(),
                    subject.timepoint_ids(),
                    permit,
                ));
            }
        }

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(report) => {
                        reports.insert(report.subject.clone(), report);
                    }
                    Err(e) => error!(error = %e, "Job task aborted"),
                }
            }
        };
        let bounded = async {
            match drain_timeout {
                Some(limit) => tokio::time::timeout(limit, drain).await.is_ok(),
                None => {
                    drain.await;
                    true
                }
            }
        };
        let drained = tokio::select! {
            biased;
            finished = bounded => finished,
            () = state.drain_abandoned() => false,
        };

        if !drained {
            if state.is_drain_abandoned() {
                warn!(
                    outstanding = tasks.len(),
                    "Stopped waiting on request; leaving jobs running. Run `longsurf repair` once they finish"
                );
            } else {
                warn!(
                    outstanding = tasks.len(),
                    "Drain timeout elapsed; leaving jobs running. Run `longsurf repair` once they finish"
                );
            }
            tasks.detach_all();
        }
    }

    /// Starts a job and registers it. Spawn failures are recorded and yield `None`.
    async fn launch(
        &self,
        subject: &Subject,
        mode: ExecutionMode,
        state: &BatchState,
        report: &mut SubjectReport,
    ) -> Option<JobHandle> {
        report.advance(SubjectState::Dispatched);

        match self.dispatcher.execute(subject, mode).await {
            Ok(handle) => {
                state
                    .registry()
                    .register(
                        handle.job_id(),
                        handle.subject(),
                        handle.pid(),
                        handle.started_at(),
                    )
                    .await;
                report.job_id = Some(handle.job_id());
                report.pid = handle.pid();
                report.command = Some(handle.command().to_shell_string());
                report.log_path = handle.log_path().map(Path::to_path_buf);
                report.advance(SubjectState::Running);
                Some(handle)
            }
            Err(e) => {
                error!(subject = %subject.id, error = %e, "Failed to start job");
                let command = self
                    .dispatcher
                    .build(subject, mode)
                    .map(|d| self.dispatcher.command_for(&d).to_shell_string())
                    .unwrap_or_default();
                report.reason = Some(e.to_string());
                report.exit_code = Some(SIGNALED_EXIT_CODE);
                report.command = Some(command.clone());
                report.advance(SubjectState::Failed);
                self.recorder
                    .record(&subject.id, &command, SIGNALED_EXIT_CODE, None);
                report.advance(SubjectState::ErrorRecorded);
                None
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("dataset", &self.discoverer.root())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

fn cancel_remaining(rest: &[&Subject], reports: &mut BTreeMap<String, SubjectReport>) {
    for subject in rest {
        if let Some(report) = reports.get_mut(&subject.id) {
            report.advance(SubjectState::Cancelled);
        }
    }
}

fn without<'a>(subjects: &'a [Subject], skip: &'a [String]) -> impl Iterator<Item = &'a Subject> {
    subjects.iter().filter(move |s| !skip.contains(&s.id))
}

fn resolve_ids(discovery: &Discovery, ids: &[String]) -> Result<Vec<Subject>, OrchestratorError> {
    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    for id in ids {
        if !seen.insert(id.as_str()) {
            continue;
        }
        match discovery.find(id) {
            Some(Ok(subject)) => selected.push(subject.clone()),
            Some(Err(skipped)) => {
                return Err(OrchestratorError::IneligibleSubject {
                    subject: id.clone(),
                    reason: skipped.reason.to_string(),
                })
            }
            None => return Err(OrchestratorError::UnknownSubject(id.clone())),
        }
    }
    if selected.is_empty() {
        return Err(OrchestratorError::EmptySelection(
            "no subject ids given".to_string(),
        ));
    }
    Ok(selected)
}

/// Reads subject ids from a rerun list.
///
/// Accepts one id per line (blank lines and `#` comments ignored) as well as
/// error-log lines, from which the subject field is taken.
pub fn read_subject_list(path: &Path) -> Result<Vec<String>, OrchestratorError> {
    let content = std::fs::read_to_string(path).map_err(|source| OrchestratorError::RerunList {
        path: path.to_path_buf(),
        source,
    })?;

    let mut ids = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('{') {
            match serde_json::from_str::<ErrorRecord>(line) {
                Ok(record) => ids.push(record.subject),
                Err(e) => warn!(error = %e, "Ignoring unreadable rerun entry"),
            }
            continue;
        }
        if let Some(id) = line.split([',', ' ', '\t']).next().filter(|s| !s.is_empty()) {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}
