//! Dataset discovery.
//!
//! Scans a BIDS-like dataset root (`<root>/sub-*/ses-*/`) and groups sessions
//! per subject. A subject is eligible for longitudinal processing only when it
//! has at least two sessions and every session resolves an input image. A
//! single unresolved session excludes the whole subject.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::DiscoveryError;

/// Prefix of subject directories.
pub const SUBJECT_PREFIX: &str = "sub-";

/// Prefix of session directories.
pub const SESSION_PREFIX: &str = "ses-";

/// Input image filename suffixes, most specific first.
///
/// The first suffix with any match wins; within a suffix the
/// lexicographically first file is used.
pub const IMAGE_PATTERNS: &[&str] = &[
    "_desc-preproc_T1w.nii.gz",
    "_desc-preproc_T1w.nii",
    "_rec-norm_T1w.nii.gz",
    "_T1w.nii.gz",
    "_T1w.nii",
];

/// One imaging visit of a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Session label, e.g. `ses-01`.
    pub id: String,
    /// Session directory in the dataset.
    pub dir: PathBuf,
    /// Resolved input image, if any.
    pub image: Option<PathBuf>,
}

impl Session {
    /// Returns whether an input image was resolved for this session.
    pub fn is_resolved(&self) -> bool {
        self.image.is_some()
    }
}

/// A study participant and its sessions, in session-label order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    /// Subject label, e.g. `sub-001`. Also the template id.
    pub id: String,
    /// Sessions sorted by label.
    pub sessions: Vec<Session>,
}

impl Subject {
    /// Creates a subject from its id and sessions.
    pub fn new(id: impl Into<String>, sessions: Vec<Session>) -> Self {
        Self {
            id: id.into(),
            sessions,
        }
    }

    /// Timepoint id for one of this subject's sessions (`<subject>_<session>`).
    pub fn timepoint_id(&self, session: &Session) -> String {
        format!("{}_{}", self.id, session.id)
    }

    /// Timepoint ids in session order.
    pub fn timepoint_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| self.timepoint_id(s)).collect()
    }

    /// Returns the first session without a resolved image.
    pub fn first_unresolved(&self) -> Option<&Session> {
        self.sessions.iter().find(|s| !s.is_resolved())
    }
}

/// Why a subject was excluded from longitudinal processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SkipReason {
    /// Fewer than two sessions.
    NotLongitudinal { sessions: usize },
    /// A session has no input image matching any pattern.
    UnresolvedInput { session: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotLongitudinal { sessions } => {
                write!(f, "not longitudinal ({sessions} session(s))")
            }
            SkipReason::UnresolvedInput { session } => {
                write!(f, "unresolved input for session {session}")
            }
        }
    }
}

/// A subject excluded by discovery, with its reason.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedSubject {
    pub subject: Subject,
    pub reason: SkipReason,
}

/// Result of a dataset scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Discovery {
    /// Eligible subjects in discovery (name) order.
    pub eligible: Vec<Subject>,
    /// Excluded subjects in discovery order.
    pub skipped: Vec<SkippedSubject>,
}

impl Discovery {
    /// Total number of subject directories seen.
    pub fn total(&self) -> usize {
        self.eligible.len() + self.skipped.len()
    }

    /// Looks up a subject by id among eligible and skipped subjects.
    pub fn find(&self, id: &str) -> Option<Result<&Subject, &SkippedSubject>> {
        if let Some(subject) = self.eligible.iter().find(|s| s.id == id) {
            return Some(Ok(subject));
        }
        self.skipped
            .iter()
            .find(|s| s.subject.id == id)
            .map(Err)
    }
}

/// Scans a dataset root for longitudinal subjects.
#[derive(Debug, Clone)]
pub struct SubjectDiscoverer {
    root: PathBuf,
}

impl SubjectDiscoverer {
    /// Creates a discoverer for the given dataset root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the dataset root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scans the dataset root.
    ///
    /// Pure read; safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError` if the root is missing or cannot be read.
    pub fn discover(&self) -> Result<Discovery, DiscoveryError> {
        if !self.root.exists() {
            return Err(DiscoveryError::MissingRoot(self.root.clone()));
        }
        if !self.root.is_dir() {
            return Err(DiscoveryError::NotADirectory(self.root.clone()));
        }

        let mut discovery = Discovery::default();

        for subject_dir in child_dirs(&self.root, SUBJECT_PREFIX)? {
            let subject = self.scan_subject(&subject_dir)?;

            if subject.sessions.len() < 2 {
                debug!(subject = %subject.id, sessions = subject.sessions.len(), "Skipping non-longitudinal subject");
                let reason = SkipReason::NotLongitudinal {
                    sessions: subject.sessions.len(),
                };
                discovery.skipped.push(SkippedSubject { subject, reason });
                continue;
            }

            if let Some(session) = subject.first_unresolved() {
                warn!(
                    subject = %subject.id,
                    session = %session.id,
                    "No input image found; excluding whole subject"
                );
                let reason = SkipReason::UnresolvedInput {
                    session: session.id.clone(),
                };
                discovery.skipped.push(SkippedSubject { subject, reason });
                continue;
            }

            discovery.eligible.push(subject);
        }

        Ok(discovery)
    }

    fn scan_subject(&self, subject_dir: &Path) -> Result<Subject, DiscoveryError> {
        let id = dir_name(subject_dir);
        let mut sessions = Vec::new();

        for session_dir in child_dirs(subject_dir, SESSION_PREFIX)? {
            let image = resolve_image(&session_dir)?;
            sessions.push(Session {
                id: dir_name(&session_dir),
                dir: session_dir,
                image,
            });
        }

        Ok(Subject::new(id, sessions))
    }
}

/// Resolves the input image for a session directory.
///
/// Looks in `<session>/anat/` first, then in the session directory itself.
pub fn resolve_image(session_dir: &Path) -> Result<Option<PathBuf>, DiscoveryError> {
    let mut candidates = Vec::new();
    for dir in [session_dir.join("anat"), session_dir.to_path_buf()] {
        if dir.is_dir() {
            candidates.extend(child_files(&dir)?);
        }
    }

    for suffix in IMAGE_PATTERNS {
        let hit = candidates.iter().find(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(suffix) && n.len() > suffix.len())
                .unwrap_or(false)
        });
        if let Some(path) = hit {
            return Ok(Some(path.clone()));
        }
    }

    Ok(None)
}

fn child_dirs(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, DiscoveryError> {
    Ok(children(dir)?
        .into_iter()
        .filter(|entry| {
            entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .map(|n| n.starts_with(prefix))
                    .unwrap_or(false)
        })
        .map(walkdir::DirEntry::into_path)
        .collect())
}

fn child_files(dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    Ok(children(dir)?
        .into_iter()
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect())
}

/// Direct children of `dir`, sorted by name, with symlinks followed.
///
/// Only a failure to read `dir` itself is an error. Unreadable entries
/// (dangling symlinks to content that was never fetched, permission
/// problems) are logged and left out, so they can only make a session
/// unresolved.
fn children(dir: &Path) -> Result<Vec<walkdir::DirEntry>, DiscoveryError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        match entry {
            Ok(entry) => entries.push(entry),
            Err(e) if e.depth() > 0 => {
                warn!(
                    path = %e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                    error = %e,
                    "Skipping unreadable dataset entry"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(entries)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
