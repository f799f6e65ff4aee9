//! Shared error log for failed jobs.
//!
//! One JSON object per line. Each record is serialized up front and written
//! with a single `write_all` on a file opened in append mode, so concurrent
//! writers (tasks in this process, or other orchestrator processes) never
//! interleave partial records. An in-process mutex additionally serializes
//! writers sharing one recorder.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lines kept from the end of a job log.
pub const EXCERPT_LINES: usize = 20;

/// Upper bound on the excerpt size in bytes.
pub const EXCERPT_MAX_BYTES: usize = 4096;

/// One failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub exit_code: i32,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Trailing lines of the job log, if one was captured.
    #[serde(default)]
    pub log_excerpt: Vec<String>,
}

/// Appends failure records to the shared error log. Never fails.
#[derive(Debug)]
pub struct ErrorRecorder {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ErrorRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a failed job.
    ///
    /// Write problems are logged and swallowed; the returned record is what
    /// was (or would have been) written.
    pub fn record(
        &self,
        subject: &str,
        command: &str,
        exit_code: i32,
        log_path: Option<&Path>,
    ) -> ErrorRecord {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            subject: subject.to_string(),
            exit_code,
            command: command.to_string(),
            log_path: log_path.map(Path::to_path_buf),
            log_excerpt: log_path
                .map(|p| tail_lines(p, EXCERPT_LINES, EXCERPT_MAX_BYTES))
                .unwrap_or_default(),
        };

        if let Err(e) = self.append(&record) {
            warn!(
                subject,
                path = %self.path.display(),
                error = %e,
                "Failed to write error record"
            );
        } else {
            debug!(subject, exit_code, "Recorded job failure");
        }

        record
    }

    fn append(&self, record: &ErrorRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)
    }
}

/// Returns up to `max_lines` trailing lines of a file, reading at most
/// `max_bytes` from its end. Missing or unreadable files yield nothing.
pub fn tail_lines(path: &Path, max_lines: usize, max_bytes: usize) -> Vec<String> {
    let Ok(mut file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(max_bytes as u64);
    // One byte before the window tells whether it starts on a line boundary.
    let lead = u64::from(start > 0);
    if file.seek(SeekFrom::Start(start - lead)).is_err() {
        return Vec::new();
    }

    let mut buf = Vec::with_capacity(max_bytes.min(len as usize) + 1);
    if file.take(max_bytes as u64 + lead).read_to_end(&mut buf).is_err() {
        return Vec::new();
    }
    let on_boundary = lead == 0 || buf.first() == Some(&b'\n');
    let window = buf.get(lead as usize..).unwrap_or_default();
    let text = String::from_utf8_lossy(window);

    let mut lines: Vec<&str> = text.lines().collect();
    if !on_boundary && !lines.is_empty() {
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(max_lines);
    lines[skip..].iter().map(|l| l.to_string()).collect()
}

/// Reads every well-formed record from an error log; malformed lines are skipped.
pub fn read_records(path: &Path) -> std::io::Result<Vec<ErrorRecord>> {
    let file = std::fs::File::open(path)?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ErrorRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed error record"),
        }
    }
    Ok(records)
}

/// Unique failed subject ids, sorted.
pub fn failed_subjects(records: &[ErrorRecord]) -> Vec<String> {
    records
        .iter()
        .map(|r| r.subject.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
