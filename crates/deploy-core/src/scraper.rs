//! Heuristic progress from unstructured installer output.
//!
//! Installers wrapped by the engine expose no structured progress channel, so
//! progress is inferred from known milestone lines appearing in the
//! per-host operation log.

use crate::error::DeployError;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct Milestone {
    pub marker: String,
    pub progress: f64,
}

/// Ordered marker -> progress pairs. Values never decrease in table order.
#[derive(Debug, Clone, PartialEq)]
pub struct MilestoneTable {
    name: String,
    milestones: Vec<Milestone>,
    failure_markers: Vec<String>,
}

impl MilestoneTable {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        pairs: impl IntoIterator<Item = (S, f64)>,
    ) -> Result<Self, DeployError> {
        let name = name.into();
        let milestones: Vec<Milestone> = pairs
            .into_iter()
            .map(|(marker, progress)| Milestone {
                marker: marker.into(),
                progress,
            })
            .collect();

        let mut previous = 0.0;
        for m in &milestones {
            if m.marker.is_empty() {
                return Err(DeployError::Invalid(format!(
                    "milestone table '{}' has an empty marker",
                    name
                )));
            }
            if !(0.0..=100.0).contains(&m.progress) {
                return Err(DeployError::Invalid(format!(
                    "milestone '{}' in '{}' has progress {} outside [0, 100]",
                    m.marker, name, m.progress
                )));
            }
            if m.progress < previous {
                return Err(DeployError::Invalid(format!(
                    "milestone '{}' in '{}' goes backwards ({} < {})",
                    m.marker, name, m.progress, previous
                )));
            }
            previous = m.progress;
        }

        Ok(Self {
            name,
            milestones,
            failure_markers: Vec::new(),
        })
    }

    pub fn with_failure_markers<S: Into<String>>(mut self, markers: impl IntoIterator<Item = S>) -> Self {
        self.failure_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    /// Built-in tables by backend name.
    pub fn builtin(name: &str) -> Option<Self> {
        let table = match name {
            "packstack" => Self::new(
                "packstack",
                [
                    ("Preparing servers", 3.0),
                    ("Installing Dependencies", 10.0),
                    ("Applying", 30.0),
                    ("Testing if puppet apply is finished", 60.0),
                    ("successfully", 100.0),
                ],
            )
            .map(|t| t.with_failure_markers(["ERROR", "Error:", "not found"])),
            "ansible" => Self::new(
                "ansible",
                [
                    ("PLAY [", 5.0),
                    ("TASK [", 10.0),
                    ("RUNNING HANDLER", 70.0),
                    ("PLAY RECAP", 95.0),
                ],
            )
            .map(|t| t.with_failure_markers(["fatal: [", "FAILED!"])),
            _ => return None,
        };
        table.ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }

    pub fn failure_markers(&self) -> &[String] {
        &self.failure_markers
    }
}

/// Value of the highest-index marker present in the log, never below `floor`.
///
/// A missing or unreadable log counts as "no marker", so a transient or
/// partial read can never make progress go backwards.
pub fn scan(log_path: &Path, table: &MilestoneTable, floor: f64) -> f64 {
    scan_from(log_path, 0, table, floor)
}

/// `scan` restricted to the bytes written at or after offset `from`.
pub fn scan_from(log_path: &Path, from: u64, table: &MilestoneTable, floor: f64) -> f64 {
    let Some(section) = read_section(log_path, from) else {
        return floor;
    };

    let reached = table
        .milestones
        .iter()
        .rev()
        .find(|m| section.text.contains(m.marker.as_str()))
        .map(|m| m.progress);

    match reached {
        Some(progress) if progress > floor => progress,
        _ => floor,
    }
}

/// First log line containing one of `markers`, with its 1-based line number.
pub fn find_failure(log_path: &Path, markers: &[String]) -> Option<(usize, String)> {
    find_failure_from(log_path, 0, markers)
}

/// `find_failure` restricted to lines written at or after offset `from`.
/// Line numbers still count from the start of the file.
pub fn find_failure_from(log_path: &Path, from: u64, markers: &[String]) -> Option<(usize, String)> {
    if markers.is_empty() {
        return None;
    }
    let section = read_section(log_path, from)?;
    section
        .text
        .lines()
        .enumerate()
        .find(|(_, line)| markers.iter().any(|m| line.contains(m.as_str())))
        .map(|(idx, line)| (section.first_line + idx, line.trim().to_string()))
}

struct Section {
    text: String,
    /// 1-based number of the first line in `text`.
    first_line: usize,
}

fn read_section(log_path: &Path, from: u64) -> Option<Section> {
    let bytes = std::fs::read(log_path).ok()?;
    let start = usize::try_from(from).unwrap_or(usize::MAX).min(bytes.len());
    let (head, tail) = bytes.split_at(start);
    Some(Section {
        text: String::from_utf8_lossy(tail).into_owned(),
        first_line: head.iter().filter(|b| **b == b'\n').count() + 1,
    })
}

/// Pluggable progress strategy. A backend with structured progress reporting
/// can implement this without touching the worker or the controller.
///
/// `from` is the log offset where the current step's output begins; anything
/// before it belongs to earlier steps and must not be read.
pub trait ProgressEstimator: Send + Sync {
    fn estimate(&self, log: &Path, from: u64, floor: f64) -> f64;

    /// A line proving the remote step already failed, if any.
    fn failure(&self, _log: &Path, _from: u64) -> Option<(usize, String)> {
        None
    }
}

/// Milestone-table estimator.
#[derive(Debug, Clone)]
pub struct LogScraper {
    table: MilestoneTable,
}

impl LogScraper {
    pub fn new(table: MilestoneTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &MilestoneTable {
        &self.table
    }
}

impl ProgressEstimator for LogScraper {
    fn estimate(&self, log: &Path, from: u64, floor: f64) -> f64 {
        scan_from(log, from, &self.table, floor)
    }

    fn failure(&self, log: &Path, from: u64) -> Option<(usize, String)> {
        find_failure_from(log, from, &self.table.failure_markers)
    }
}
