//! Repair passes over output roots populated by earlier (possibly detached) runs.

#![cfg(unix)]

use std::path::{Path, PathBuf};

use longsurf::layout::CompletionChecker;
use longsurf::linker::LinkStatus;
use longsurf::{repair, LinkError, LinkOptions, OutputLayout, Session, Subject};
use tempfile::TempDir;

/// Writes raw outputs for one subject, as a finished job leaves them before linking.
fn finished_job(root: &Path, template: &str, sessions: &[&str]) -> Vec<String> {
    std::fs::create_dir_all(root.join(template)).expect("mkdir template");
    sessions
        .iter()
        .map(|ses| {
            let tp = format!("{template}_{ses}");
            let stats = root.join(&tp).join("stats");
            std::fs::create_dir_all(&stats).expect("mkdir stats");
            std::fs::write(stats.join("aseg.stats"), "# aseg\n").expect("write marker");
            tp
        })
        .collect()
}

fn subject(id: &str, sessions: &[&str]) -> Subject {
    Subject::new(
        id,
        sessions
            .iter()
            .map(|ses| Session {
                id: ses.to_string(),
                dir: PathBuf::from(format!("/bids/{id}/{ses}")),
                image: Some(PathBuf::from(format!("/bids/{id}/{ses}/anat/t1.nii.gz"))),
            })
            .collect(),
    )
}

#[test]
fn test_repair_links_detached_results_then_is_idempotent() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let root = temp_dir.path();
    finished_job(root, "sub-001", &["ses-01", "ses-02"]);
    finished_job(root, "sub-002", &["ses-01", "ses-02", "ses-03"]);
    finished_job(root, "sub-003", &["ses-01", "ses-02"]);

    let checker = CompletionChecker::new(OutputLayout::new(root), "aseg.stats");
    let sub_002 = subject("sub-002", &["ses-01", "ses-02", "ses-03"]);
    assert!(!checker.is_complete(&sub_002));

    let first = repair(root, LinkOptions::default()).expect("first repair");
    assert_eq!(first.templates_scanned, 3);
    assert_eq!(first.links_created, 7);
    assert_eq!(first.links_skipped, 0);
    assert_eq!(first.errors, 0);
    assert!(first.orphan_timepoints.is_empty());
    assert!(checker.is_complete(&sub_002));
    assert_eq!(
        std::fs::read_link(root.join("sub-002_ses-03.long.sub-002")).expect("read link"),
        PathBuf::from("sub-002_ses-03")
    );

    let second = repair(root, LinkOptions::default()).expect("second repair");
    assert_eq!(second.templates_scanned, 3);
    assert_eq!(second.links_created, 0);
    assert_eq!(second.links_skipped, 7);
}

#[test]
fn test_repair_reports_orphans_and_leaves_real_directories_alone() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let root = temp_dir.path();
    finished_job(root, "sub-010", &["ses-01", "ses-02"]);
    std::fs::create_dir_all(root.join("sub-099_ses-01")).expect("mkdir orphan");
    std::fs::create_dir_all(root.join("logs")).expect("mkdir logs");

    let occupied = root.join("sub-010_ses-02.long.sub-010");
    std::fs::create_dir_all(&occupied).expect("mkdir occupied");
    std::fs::write(occupied.join("keep.txt"), "user data").expect("write");

    let summary = repair(
        root,
        LinkOptions {
            force: true,
            dry_run: false,
        },
    )
    .expect("repair");

    assert_eq!(summary.templates_scanned, 1);
    assert_eq!(summary.orphan_timepoints, vec!["sub-099_ses-01"]);
    assert_eq!(summary.links_created, 1);
    assert_eq!(summary.warnings, 1);
    assert!(occupied.join("keep.txt").is_file());
    assert!(!std::fs::symlink_metadata(&occupied)
        .expect("metadata")
        .file_type()
        .is_symlink());
}

#[test]
fn test_repair_force_replaces_stale_link() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let root = temp_dir.path();
    finished_job(root, "sub-020", &["ses-01", "ses-02"]);
    std::os::unix::fs::symlink("elsewhere", root.join("sub-020_ses-01.long.sub-020"))
        .expect("stale link");

    let untouched = repair(root, LinkOptions::default()).expect("repair");
    assert_eq!(untouched.links_created, 1);
    assert_eq!(untouched.links_skipped, 1);

    let preview = repair(
        root,
        LinkOptions {
            force: true,
            dry_run: true,
        },
    )
    .expect("dry run");
    assert!(preview.dry_run);
    assert_eq!(
        std::fs::read_link(root.join("sub-020_ses-01.long.sub-020")).expect("read link"),
        PathBuf::from("elsewhere")
    );

    let forced = repair(
        root,
        LinkOptions {
            force: true,
            dry_run: false,
        },
    )
    .expect("forced repair");
    assert_eq!(forced.links_updated, 1);
    let statuses: Vec<LinkStatus> = forced.templates[0]
        .outcomes
        .iter()
        .map(|o| o.status)
        .collect();
    assert_eq!(statuses, vec![LinkStatus::Updated, LinkStatus::Skipped]);
    assert_eq!(
        std::fs::read_link(root.join("sub-020_ses-01.long.sub-020")).expect("read link"),
        PathBuf::from("sub-020_ses-01")
    );
}

#[test]
fn test_repair_missing_root_is_an_error() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let err = repair(&temp_dir.path().join("absent"), LinkOptions::default())
        .expect_err("missing root");
    assert!(matches!(err, LinkError::MissingRoot(_)));
}
