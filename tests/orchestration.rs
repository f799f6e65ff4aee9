//! End-to-end orchestration passes against a scripted job runner.
//!
//! The fake runner never starts a container: it sleeps, writes a job log,
//! creates the raw timepoint outputs on success, and returns a scripted exit
//! code. Everything else (discovery, completion checks, admission, linking,
//! error recording) is the real code.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use longsurf::dispatch::{ContainerCommand, JobDescriptor, LaunchedJob};
use longsurf::errlog::read_records;
use longsurf::{
    BatchState, CompletionChecker, DispatchError, ExecutionMode, JobRunner, Orchestrator,
    OrchestratorConfig, OrchestratorError, OutputLayout, PassOptions, Selection, SubjectState,
};
use tempfile::TempDir;

#[derive(Clone, Copy)]
struct Script {
    exit_code: i32,
    delay: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            exit_code: 0,
            delay: Duration::from_millis(20),
        }
    }
}

#[derive(Default)]
struct Counters {
    running: AtomicUsize,
    peak: AtomicUsize,
}

struct FakeRunner {
    output_root: PathBuf,
    scripts: HashMap<String, Script>,
    launches: Mutex<Vec<(String, Vec<String>)>>,
    counters: Arc<Counters>,
    next_pid: AtomicU32,
}

impl FakeRunner {
    fn new(output_root: &Path) -> Self {
        Self {
            output_root: output_root.to_path_buf(),
            scripts: HashMap::new(),
            launches: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
            next_pid: AtomicU32::new(4000),
        }
    }

    fn with_script(mut self, subject: &str, script: Script) -> Self {
        self.scripts.insert(subject.to_string(), script);
        self
    }

    fn launched_subjects(&self) -> Vec<String> {
        self.launches
            .lock()
            .expect("lock")
            .iter()
            .map(|(s, _)| s.clone())
            .collect()
    }

    fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobRunner for FakeRunner {
    async fn launch(
        &self,
        descriptor: &JobDescriptor,
        command: &ContainerCommand,
        log_path: Option<&Path>,
    ) -> Result<LaunchedJob, DispatchError> {
        let template = descriptor.template().to_string();
        let timepoints = descriptor.timepoints().to_vec();
        self.launches
            .lock()
            .expect("lock")
            .push((template.clone(), timepoints.clone()));

        let script = self.scripts.get(&template).copied().unwrap_or_default();
        if let Some(path) = log_path {
            std::fs::create_dir_all(path.parent().expect("log dir")).expect("mkdir logs");
            let mut body = format!("{command}\n");
            for step in 1..=25 {
                body.push_str(&format!("{template} step {step}\n"));
            }
            if script.exit_code != 0 {
                body.push_str("ERROR: recon-surf failed\n");
            }
            std::fs::write(path, body).expect("write job log");
        }

        let now = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);

        let counters = Arc::clone(&self.counters);
        let output_root = self.output_root.clone();
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(LaunchedJob::new(Some(pid), async move {
            tokio::time::sleep(script.delay).await;
            if script.exit_code == 0 {
                std::fs::create_dir_all(output_root.join(&template))?;
                for tp in &timepoints {
                    let stats = output_root.join(tp).join("stats");
                    std::fs::create_dir_all(&stats)?;
                    std::fs::write(stats.join("aseg.stats"), "# aseg\n")?;
                }
            }
            counters.running.fetch_sub(1, Ordering::SeqCst);
            Ok(script.exit_code)
        }))
    }
}

struct Fixture {
    _temp: TempDir,
    dataset: PathBuf,
    output: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().expect("failed to create temp dir");
        let dataset = temp.path().join("bids");
        let output = temp.path().join("derivatives");
        std::fs::create_dir_all(&dataset).expect("mkdir dataset");
        std::fs::create_dir_all(&output).expect("mkdir output");
        Self {
            _temp: temp,
            dataset,
            output,
        }
    }

    fn add_subject(&self, subject: &str, sessions: &[&str]) {
        for ses in sessions {
            let anat = self.dataset.join(subject).join(ses).join("anat");
            std::fs::create_dir_all(&anat).expect("mkdir anat");
            std::fs::write(anat.join(format!("{subject}_{ses}_T1w.nii.gz")), b"nifti")
                .expect("write image");
        }
    }

    fn orchestrator(&self, runner: Arc<FakeRunner>) -> Orchestrator {
        let config = OrchestratorConfig::new("fastsurfer.sif", "license.txt")
            .with_option("parallel", serde_json::json!(true));
        Orchestrator::new(Arc::new(config), &self.dataset, &self.output, runner)
    }

    fn runner(&self) -> FakeRunner {
        FakeRunner::new(&self.output)
    }
}

fn detached() -> PassOptions {
    PassOptions {
        mode: ExecutionMode::Detached,
        ..PassOptions::default()
    }
}

#[tokio::test]
async fn test_second_pass_dispatches_nothing() {
    let fx = Fixture::new();
    fx.add_subject("sub-001", &["ses-01"]);
    fx.add_subject("sub-002", &["ses-01", "ses-02"]);
    fx.add_subject("sub-003", &["ses-01", "ses-02", "ses-03"]);

    let runner = Arc::new(fx.runner());
    let orchestrator = fx.orchestrator(runner.clone());

    let first = orchestrator
        .run(&detached(), &BatchState::new(2).expect("state"))
        .await
        .expect("first pass");
    assert_eq!(first.eligible, 2);
    assert_eq!(first.dispatched, 2);
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.failed, 0);
    assert_eq!(
        first.report("sub-001").map(|r| r.state),
        Some(SubjectState::Ineligible)
    );
    assert_eq!(
        first.report("sub-003").map(|r| r.state),
        Some(SubjectState::Linked)
    );
    assert!(fx.output.join("sub-003_ses-03.long.sub-003").is_dir());
    assert!(first.still_running.is_empty());

    let second = orchestrator
        .run(&detached(), &BatchState::new(2).expect("state"))
        .await
        .expect("second pass");
    assert_eq!(second.dispatched, 0);
    assert_eq!(second.complete_skipped, 2);
    assert_eq!(runner.launched_subjects().len(), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn test_partially_complete_subject_is_redispatched_in_full() {
    let fx = Fixture::new();
    fx.add_subject("sub-002", &["ses-01", "ses-02"]);

    for tp in ["sub-002_ses-01", "sub-002_ses-02"] {
        let stats = fx.output.join(tp).join("stats");
        std::fs::create_dir_all(&stats).expect("mkdir");
        std::fs::write(stats.join("aseg.stats"), "# aseg\n").expect("write");
        std::os::unix::fs::symlink(tp, fx.output.join(format!("{tp}.long.sub-002")))
            .expect("symlink");
    }
    std::fs::remove_file(fx.output.join("sub-002_ses-02/stats/aseg.stats")).expect("rm marker");

    let runner = Arc::new(fx.runner());
    let summary = fx
        .orchestrator(runner.clone())
        .run(&PassOptions::default(), &BatchState::new(1).expect("state"))
        .await
        .expect("pass");

    assert_eq!(summary.dispatched, 1);
    let launches = runner.launches.lock().expect("lock");
    assert_eq!(
        launches.as_slice(),
        &[(
            "sub-002".to_string(),
            vec!["sub-002_ses-01".to_string(), "sub-002_ses-02".to_string()]
        )]
    );

    let links = summary
        .report("sub-002")
        .and_then(|r| r.links.as_ref())
        .expect("link report");
    assert_eq!(links.skipped(), 2);
}

#[tokio::test]
async fn test_failed_job_is_recorded_and_never_linked() {
    let fx = Fixture::new();
    fx.add_subject("sub-004", &["ses-01", "ses-02"]);
    fx.add_subject("sub-005", &["ses-01", "ses-02"]);

    let runner = Arc::new(fx.runner().with_script(
        "sub-004",
        Script {
            exit_code: 1,
            ..Script::default()
        },
    ));
    let orchestrator = fx.orchestrator(runner.clone());
    let summary = orchestrator
        .run(&detached(), &BatchState::new(2).expect("state"))
        .await
        .expect("pass");

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    let report = summary.report("sub-004").expect("report");
    assert_eq!(report.state, SubjectState::ErrorRecorded);
    assert!(!report.visited(SubjectState::Linked));
    assert!(report.links.is_none());
    assert!(std::fs::symlink_metadata(fx.output.join("sub-004_ses-01.long.sub-004")).is_err());

    let records = read_records(orchestrator.error_log()).expect("error log");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.subject, "sub-004");
    assert_eq!(record.exit_code, 1);
    assert!(record.command.contains("--tid sub-004"));
    assert_eq!(record.log_path, Some(fx.output.join("logs/sub-004.log")));
    assert_eq!(
        record.log_excerpt.last().map(String::as_str),
        Some("ERROR: recon-surf failed")
    );
    assert!(!record.log_excerpt.is_empty() && record.log_excerpt.len() <= 20);
}

#[tokio::test]
async fn test_concurrency_cap_is_never_exceeded() {
    let fx = Fixture::new();
    let mut runner = fx.runner();
    for i in 1..=5 {
        let id = format!("sub-{i:03}");
        fx.add_subject(&id, &["ses-01", "ses-02"]);
        runner = runner.with_script(
            &id,
            Script {
                exit_code: 0,
                delay: Duration::from_millis(80),
            },
        );
    }

    let runner = Arc::new(runner);
    let state = BatchState::new(2).expect("state");
    let summary = fx
        .orchestrator(runner.clone())
        .run(&detached(), &state)
        .await
        .expect("pass");

    assert_eq!(summary.succeeded, 5);
    assert!(runner.peak() <= 2, "peak {} exceeded cap", runner.peak());
    assert_eq!(runner.peak(), 2);
    assert!(summary.peak_in_flight <= 2);
    assert_eq!(state.limiter().stats().in_flight, 0);
    assert_eq!(state.registry().running_count().await, 0);
    assert_eq!(
        runner.launched_subjects(),
        vec!["sub-001", "sub-002", "sub-003", "sub-004", "sub-005"]
    );
}

#[tokio::test]
async fn test_foreground_runs_one_at_a_time() {
    let fx = Fixture::new();
    fx.add_subject("sub-010", &["ses-01", "ses-02"]);
    fx.add_subject("sub-011", &["ses-01", "ses-02"]);

    let runner = Arc::new(fx.runner());
    let summary = fx
        .orchestrator(runner.clone())
        .run(&PassOptions::default(), &BatchState::new(1).expect("state"))
        .await
        .expect("pass");

    assert_eq!(summary.succeeded, 2);
    assert_eq!(runner.peak(), 1);
    assert!(summary.subjects.iter().all(|r| r.log_path.is_none()));
}

#[tokio::test]
async fn test_validation_errors_abort_before_dispatch() {
    let fx = Fixture::new();
    fx.add_subject("sub-001", &["ses-01"]);

    let runner = Arc::new(fx.runner());
    let orchestrator = fx.orchestrator(runner.clone());
    let state = BatchState::new(1).expect("state");

    let err = orchestrator
        .run(&PassOptions::default(), &state)
        .await
        .expect_err("no eligible subjects");
    assert!(matches!(err, OrchestratorError::NoEligibleSubjects(_)));

    let manual = PassOptions {
        selection: Selection::Manual(vec!["sub-001".to_string()]),
        ..PassOptions::default()
    };
    let err = orchestrator
        .run(&manual, &state)
        .await
        .expect_err("ineligible subject");
    assert!(matches!(err, OrchestratorError::IneligibleSubject { .. }));

    assert!(runner.launched_subjects().is_empty());
}

#[tokio::test]
async fn test_dry_run_plans_without_launching() {
    let fx = Fixture::new();
    fx.add_subject("sub-002", &["ses-01", "ses-02"]);

    let runner = Arc::new(fx.runner());
    let options = PassOptions {
        dry_run: true,
        ..detached()
    };
    let summary = fx
        .orchestrator(runner.clone())
        .run(&options, &BatchState::new(1).expect("state"))
        .await
        .expect("pass");

    assert!(runner.launched_subjects().is_empty());
    assert_eq!(summary.planned.len(), 1);
    let plan = &summary.planned[0];
    assert!(plan.command.starts_with("singularity exec"));
    assert!(plan.command.contains("--tpids sub-002_ses-01 sub-002_ses-02"));
    assert!(plan.command.ends_with("--parallel"));
    assert_eq!(plan.log_path, Some(fx.output.join("logs/sub-002.log")));
    assert_eq!(
        summary.report("sub-002").map(|r| r.state),
        Some(SubjectState::Planned)
    );
}

#[tokio::test]
async fn test_drain_timeout_leaves_slow_job_running() {
    let fx = Fixture::new();
    fx.add_subject("sub-020", &["ses-01", "ses-02"]);

    let runner = Arc::new(fx.runner().with_script(
        "sub-020",
        Script {
            exit_code: 0,
            delay: Duration::from_secs(5),
        },
    ));
    let options = PassOptions {
        drain_timeout: Some(Duration::from_millis(50)),
        ..detached()
    };
    let summary = fx
        .orchestrator(runner)
        .run(&options, &BatchState::new(1).expect("state"))
        .await
        .expect("pass");

    assert_eq!(summary.still_running.len(), 1);
    assert_eq!(summary.still_running[0].subject, "sub-020");
    assert!(summary.still_running[0].pid.is_some());
    assert_eq!(
        summary.report("sub-020").map(|r| r.state),
        Some(SubjectState::Running)
    );
}

#[tokio::test]
async fn test_abandoned_drain_returns_without_waiting() {
    let fx = Fixture::new();
    fx.add_subject("sub-060", &["ses-01", "ses-02"]);
    fx.add_subject("sub-061", &["ses-01", "ses-02"]);

    let runner = Arc::new(fx.runner().with_script(
        "sub-060",
        Script {
            exit_code: 0,
            delay: Duration::from_secs(30),
        },
    ));
    let state = BatchState::new(1).expect("state");
    let interrupt = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        interrupt.abandon_drain();
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        fx.orchestrator(runner.clone()).run(&detached(), &state),
    )
    .await
    .expect("pass returns once waiting is abandoned")
    .expect("pass");

    assert_eq!(runner.launched_subjects(), vec!["sub-060"]);
    assert_eq!(summary.still_running.len(), 1);
    assert_eq!(summary.still_running[0].subject, "sub-060");
    assert_eq!(
        summary.report("sub-060").map(|r| r.state),
        Some(SubjectState::Running)
    );
    assert_eq!(summary.cancelled, 1);
    assert_eq!(
        summary.report("sub-061").map(|r| r.state),
        Some(SubjectState::Cancelled)
    );
}

#[tokio::test]
async fn test_closed_limiter_cancels_pending_subjects() {
    let fx = Fixture::new();
    fx.add_subject("sub-030", &["ses-01", "ses-02"]);
    fx.add_subject("sub-031", &["ses-01", "ses-02"]);

    let runner = Arc::new(fx.runner());
    let state = BatchState::new(1).expect("state");
    state.shutdown();

    let summary = fx
        .orchestrator(runner.clone())
        .run(&detached(), &state)
        .await
        .expect("pass");

    assert_eq!(summary.cancelled, 2);
    assert_eq!(summary.dispatched, 0);
    assert!(runner.launched_subjects().is_empty());
}

#[tokio::test]
async fn test_pilot_picks_one_incomplete_subject() {
    let fx = Fixture::new();
    for id in ["sub-040", "sub-041", "sub-042"] {
        fx.add_subject(id, &["ses-01", "ses-02"]);
    }

    let runner = Arc::new(fx.runner());
    let orchestrator = fx.orchestrator(runner.clone());
    let pilot = PassOptions {
        selection: Selection::Pilot {
            seed: Some(11),
            skip: vec!["sub-041".to_string()],
        },
        ..PassOptions::default()
    };

    let summary = orchestrator
        .run(&pilot, &BatchState::new(1).expect("state"))
        .await
        .expect("pass");
    assert_eq!(summary.selected, 1);
    assert_eq!(summary.succeeded, 1);
    let first = runner.launched_subjects();
    assert_ne!(first[0], "sub-041");

    orchestrator
        .run(&pilot, &BatchState::new(1).expect("state"))
        .await
        .expect("second pilot");
    let launched = runner.launched_subjects();
    assert_eq!(launched.len(), 2);
    assert_ne!(launched[0], launched[1], "pilot must prefer incomplete subjects");
}

#[tokio::test]
async fn test_rerun_from_error_log() {
    let fx = Fixture::new();
    fx.add_subject("sub-050", &["ses-01", "ses-02"]);
    fx.add_subject("sub-051", &["ses-01", "ses-02"]);

    let failing = Arc::new(fx.runner().with_script(
        "sub-051",
        Script {
            exit_code: 2,
            ..Script::default()
        },
    ));
    let orchestrator = fx.orchestrator(failing);
    orchestrator
        .run(&detached(), &BatchState::new(2).expect("state"))
        .await
        .expect("first pass");

    let retry = Arc::new(fx.runner());
    let rerun = PassOptions {
        selection: Selection::RerunFrom(orchestrator.error_log().to_path_buf()),
        ..detached()
    };
    let summary = fx
        .orchestrator(retry.clone())
        .run(&rerun, &BatchState::new(2).expect("state"))
        .await
        .expect("rerun");

    assert_eq!(retry.launched_subjects(), vec!["sub-051"]);
    assert_eq!(summary.succeeded, 1);

    let checker = CompletionChecker::new(OutputLayout::new(&fx.output), "aseg.stats");
    let survey = fx.orchestrator(Arc::new(fx.runner())).survey().expect("survey");
    assert_eq!(survey.complete_count(), 2);
    assert!(survey
        .discovery
        .eligible
        .iter()
        .all(|s| checker.is_complete(s)));
}
