//! Output layout naming and completion checks.
//!
//! Layout under an output root:
//!
//! ```text
//! <root>/sub-001                                   template (base) directory
//! <root>/sub-001_ses-01                            raw timepoint output
//! <root>/sub-001_ses-01.long.sub-001 -> sub-001_ses-01
//! <root>/sub-001_ses-01.long.sub-001/stats/aseg.stats   completion marker
//! ```
//!
//! A timepoint is complete when both the raw directory and the marker reached
//! through the `.long` link exist. A subject is complete only when all of its
//! timepoints are; partial completion still re-dispatches the whole subject.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::dataset::Subject;

/// Infix separating a timepoint id from its template id in link names.
pub const LONG_INFIX: &str = ".long.";

/// Directory under the linked timepoint holding the completion marker.
pub const STATS_DIR: &str = "stats";

fn output_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(?P<base>sub-[^/]+?)(?:_(?P<ses>ses-[^/]+))?$").ok())
        .as_ref()
}

/// Classification of a directory name in the output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEntry {
    /// A template (base) directory, e.g. `sub-001`.
    Template(String),
    /// A raw timepoint directory, e.g. `sub-001_ses-01`.
    Timepoint { template: String, session: String },
}

impl OutputEntry {
    /// Classifies an output directory name.
    ///
    /// Names containing `.long.` are derivatives and yield `None`, as do
    /// names that are not subject directories.
    pub fn parse(name: &str) -> Option<Self> {
        if name.contains(LONG_INFIX) {
            return None;
        }
        let caps = output_name_pattern()?.captures(name)?;
        let template = caps.name("base")?.as_str().to_string();
        match caps.name("ses") {
            Some(ses) => Some(OutputEntry::Timepoint {
                template,
                session: ses.as_str().to_string(),
            }),
            None => Some(OutputEntry::Template(template)),
        }
    }
}

/// Path arithmetic for an output root.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<template>`
    pub fn template_dir(&self, template: &str) -> PathBuf {
        self.root.join(template)
    }

    /// `<root>/<timepoint>`
    pub fn timepoint_dir(&self, timepoint: &str) -> PathBuf {
        self.root.join(timepoint)
    }

    /// Name of the `.long` link for a timepoint.
    pub fn long_name(timepoint: &str, template: &str) -> String {
        format!("{timepoint}{LONG_INFIX}{template}")
    }

    /// `<root>/<timepoint>.long.<template>`
    pub fn long_link(&self, timepoint: &str, template: &str) -> PathBuf {
        self.root.join(Self::long_name(timepoint, template))
    }

    /// `<root>/<timepoint>.long.<template>/stats/<marker>`
    pub fn marker_path(&self, timepoint: &str, template: &str, marker_file: &str) -> PathBuf {
        self.long_link(timepoint, template)
            .join(STATS_DIR)
            .join(marker_file)
    }
}

/// Observed artifacts for one timepoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimepointStatus {
    pub timepoint: String,
    pub raw_present: bool,
    pub marker_present: bool,
}

impl TimepointStatus {
    pub fn is_complete(&self) -> bool {
        self.raw_present && self.marker_present
    }
}

/// Per-timepoint completion for one subject.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionReport {
    pub subject: String,
    pub timepoints: Vec<TimepointStatus>,
}

impl CompletionReport {
    /// True only if every timepoint is complete.
    pub fn is_complete(&self) -> bool {
        !self.timepoints.is_empty() && self.timepoints.iter().all(TimepointStatus::is_complete)
    }

    /// Timepoints missing either artifact.
    pub fn incomplete(&self) -> impl Iterator<Item = &TimepointStatus> {
        self.timepoints.iter().filter(|t| !t.is_complete())
    }
}

/// Decides whether a subject's outputs already exist.
///
/// Read-only; safe to call before every dispatch decision.
#[derive(Debug, Clone)]
pub struct CompletionChecker {
    layout: OutputLayout,
    marker_file: String,
}

impl CompletionChecker {
    pub fn new(layout: OutputLayout, marker_file: impl Into<String>) -> Self {
        Self {
            layout,
            marker_file: marker_file.into(),
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Reports per-timepoint artifacts for a subject.
    pub fn check(&self, subject: &Subject) -> CompletionReport {
        let timepoints = subject
            .timepoint_ids()
            .into_iter()
            .map(|tp| {
                let raw_present = self.layout.timepoint_dir(&tp).is_dir();
                let marker_present = self
                    .layout
                    .marker_path(&tp, &subject.id, &self.marker_file)
                    .is_file();
                TimepointStatus {
                    timepoint: tp,
                    raw_present,
                    marker_present,
                }
            })
            .collect();

        CompletionReport {
            subject: subject.id.clone(),
            timepoints,
        }
    }

    /// Whole-subject completeness.
    pub fn is_complete(&self, subject: &Subject) -> bool {
        self.check(subject).is_complete()
    }
}
