//! Longitudinal link layout.
//!
//! After a template's job succeeds, every timepoint's raw output directory
//! `<root>/<tp>` gets a sibling link `<root>/<tp>.long.<template>` pointing at
//! it. The same logic backs [`repair`], which rebuilds the layout from the
//! output root alone after detached or interrupted runs.
//!
//! Links use relative targets so an output root can be moved or mounted
//! elsewhere without breaking them.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::layout::{OutputEntry, OutputLayout};

/// Result of one link attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// A new link was created.
    Created,
    /// A link pointing elsewhere was replaced (force mode).
    Updated,
    /// The link already exists; nothing changed.
    Skipped,
    /// Nothing could be linked: raw output missing or a real directory is in the way.
    Warn,
    /// The filesystem refused the operation.
    Error,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkStatus::Created => write!(f, "OK"),
            LinkStatus::Updated => write!(f, "UPDATED"),
            LinkStatus::Skipped => write!(f, "SKIP"),
            LinkStatus::Warn => write!(f, "WARN"),
            LinkStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Outcome for a single timepoint.
#[derive(Debug, Clone, Serialize)]
pub struct LinkOutcome {
    pub timepoint: String,
    pub link: PathBuf,
    pub status: LinkStatus,
    pub message: String,
}

/// Outcomes for one template.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkReport {
    pub template: String,
    pub outcomes: Vec<LinkOutcome>,
}

impl LinkReport {
    pub fn count(&self, status: LinkStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn created(&self) -> usize {
        self.count(LinkStatus::Created)
    }

    pub fn updated(&self) -> usize {
        self.count(LinkStatus::Updated)
    }

    pub fn skipped(&self) -> usize {
        self.count(LinkStatus::Skipped)
    }

    pub fn warnings(&self) -> usize {
        self.count(LinkStatus::Warn)
    }

    pub fn errors(&self) -> usize {
        self.count(LinkStatus::Error)
    }
}

/// Behaviour switches for linking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkOptions {
    /// Replace symlinks that point somewhere else. Real directories are never touched.
    pub force: bool,
    /// Report what would change without touching the filesystem.
    pub dry_run: bool,
}

/// Creates `.long` links for a template's timepoints.
#[derive(Debug, Clone)]
pub struct ResultLinker {
    layout: OutputLayout,
    options: LinkOptions,
}

impl ResultLinker {
    pub fn new(layout: OutputLayout) -> Self {
        Self {
            layout,
            options: LinkOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LinkOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> LinkOptions {
        self.options
    }

    /// Links every timepoint of `template`. Never fails as a whole; problems
    /// are reported per timepoint.
    pub fn link(&self, template: &str, timepoints: &[String]) -> LinkReport {
        let outcomes = timepoints
            .iter()
            .map(|tp| self.link_timepoint(template, tp))
            .collect();
        LinkReport {
            template: template.to_string(),
            outcomes,
        }
    }

    fn link_timepoint(&self, template: &str, timepoint: &str) -> LinkOutcome {
        let link = self.layout.long_link(timepoint, template);
        let raw = self.layout.timepoint_dir(timepoint);
        let target = PathBuf::from(timepoint);

        let (status, message) = match std::fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => {
                self.existing_symlink(&link, &raw, &target)
            }
            Ok(_) if self.options.force => (
                LinkStatus::Warn,
                "exists and is not a symlink; left untouched".to_string(),
            ),
            Ok(_) => (
                LinkStatus::Skipped,
                "exists (not a symlink)".to_string(),
            ),
            Err(_) if !raw.is_dir() => (
                LinkStatus::Warn,
                format!("raw output missing: {}", raw.display()),
            ),
            Err(_) if self.options.dry_run => (
                LinkStatus::Created,
                format!("would link -> {}", target.display()),
            ),
            Err(_) => match create_dir_symlink(&target, &link) {
                Ok(()) => (LinkStatus::Created, format!("-> {}", target.display())),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    (LinkStatus::Skipped, "exists".to_string())
                }
                Err(e) => (LinkStatus::Error, format!("failed to create link: {e}")),
            },
        };

        match status {
            LinkStatus::Warn | LinkStatus::Error => {
                warn!(template, timepoint, status = %status, "{message}")
            }
            _ => debug!(template, timepoint, status = %status, "{message}"),
        }

        LinkOutcome {
            timepoint: timepoint.to_string(),
            link,
            status,
            message,
        }
    }

    fn existing_symlink(&self, link: &Path, raw: &Path, target: &Path) -> (LinkStatus, String) {
        if points_to(link, raw, target) {
            return (LinkStatus::Skipped, "exists".to_string());
        }
        if !self.options.force {
            return (
                LinkStatus::Skipped,
                "exists (points elsewhere; use force to replace)".to_string(),
            );
        }
        if !raw.is_dir() {
            return (
                LinkStatus::Warn,
                format!("raw output missing: {}", raw.display()),
            );
        }
        if self.options.dry_run {
            return (
                LinkStatus::Updated,
                format!("would relink -> {}", target.display()),
            );
        }
        let replaced = std::fs::remove_file(link).and_then(|()| create_dir_symlink(target, link));
        match replaced {
            Ok(()) => (LinkStatus::Updated, format!("relinked -> {}", target.display())),
            Err(e) => (LinkStatus::Error, format!("failed to replace link: {e}")),
        }
    }
}

fn points_to(link: &Path, raw: &Path, target: &Path) -> bool {
    match std::fs::read_link(link) {
        Ok(current) if current == target || current == raw => true,
        Ok(_) => match (std::fs::canonicalize(link), std::fs::canonicalize(raw)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        },
        Err(_) => false,
    }
}

#[cfg(unix)]
fn create_dir_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_dir_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    let absolute = link.parent().map(|p| p.join(target)).unwrap_or_else(|| target.to_path_buf());
    std::os::windows::fs::symlink_dir(absolute, link)
}

/// Template and timepoint directories found in an output root.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutputScan {
    /// Template id -> its timepoint ids, both sorted.
    pub templates: BTreeMap<String, Vec<String>>,
    /// Timepoint directories whose template directory does not exist.
    pub orphans: Vec<String>,
}

/// Scans an output root for templates and their timepoints.
///
/// A template is a `sub-*` directory; its timepoints are the
/// `<template>_ses-*` directories beside it. `.long.` entries are ignored.
pub fn scan_output(root: &Path) -> Result<OutputScan, LinkError> {
    if !root.is_dir() {
        return Err(LinkError::MissingRoot(root.to_path_buf()));
    }
    let read_err = |source| LinkError::ReadDir {
        path: root.to_path_buf(),
        source,
    };

    let mut names = Vec::new();
    for entry in std::fs::read_dir(root).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();

    let mut templates: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut timepoints = Vec::new();
    for name in names {
        match OutputEntry::parse(&name) {
            Some(OutputEntry::Template(template)) => {
                templates.entry(template).or_default();
            }
            Some(OutputEntry::Timepoint { template, .. }) => timepoints.push((template, name)),
            None => {}
        }
    }

    let mut orphans = Vec::new();
    for (template, timepoint) in timepoints {
        match templates.get_mut(&template) {
            Some(list) => list.push(timepoint),
            None => orphans.push(timepoint),
        }
    }

    Ok(OutputScan { templates, orphans })
}

/// Aggregate result of a repair pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairSummary {
    pub templates_scanned: usize,
    pub links_created: usize,
    pub links_updated: usize,
    pub links_skipped: usize,
    pub warnings: usize,
    pub errors: usize,
    pub orphan_timepoints: Vec<String>,
    pub dry_run: bool,
    pub templates: Vec<LinkReport>,
}

/// Re-applies the link layout across an entire output root.
///
/// Needs nothing but the output root: no dataset, no config. Safe to run
/// repeatedly; a second run over an unchanged root only reports skips.
pub fn repair(root: &Path, options: LinkOptions) -> Result<RepairSummary, LinkError> {
    let scan = scan_output(root)?;
    let linker = ResultLinker::new(OutputLayout::new(root)).with_options(options);

    let mut summary = RepairSummary {
        dry_run: options.dry_run,
        orphan_timepoints: scan.orphans,
        ..RepairSummary::default()
    };

    for (template, timepoints) in &scan.templates {
        let report = linker.link(template, timepoints);
        summary.templates_scanned += 1;
        summary.links_created += report.created();
        summary.links_updated += report.updated();
        summary.links_skipped += report.skipped();
        summary.warnings += report.warnings();
        summary.errors += report.errors();
        summary.templates.push(report);
    }

    for orphan in &summary.orphan_timepoints {
        warn!(timepoint = %orphan, "Timepoint has no template directory");
    }

    info!(
        root = %root.display(),
        templates = summary.templates_scanned,
        created = summary.links_created,
        updated = summary.links_updated,
        skipped = summary.links_skipped,
        warnings = summary.warnings,
        dry_run = summary.dry_run,
        "Repair pass finished"
    );

    Ok(summary)
}
