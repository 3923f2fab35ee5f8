// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Run reporting.
//!
//! A [`RunReport`] is created when the reconciliation loop starts, grows by
//! one [`ItemRecord`] per processed item, and is finalized into a [`Summary`]
//! once the loop completes, is cancelled, or is aborted. A summary is always
//! produced, even for partial runs, and only reflects what was processed.
//!
//! The summary is persisted as human-readable text at a fixed location so
//! that failures can be looked at, and re-run item by item, after the fact.

use crate::{
    backup::BackupRecord,
    item::{ActionOutcome, InspectionResult, ItemKind, OutcomeStatus},
    platform::PlatformInfo,
};

use chrono::{DateTime, SecondsFormat, Utc};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::write,
    path::{Path, PathBuf},
};
use tracing::info;

/// Everything recorded about one processed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRecord {
    pub id: String,
    pub kind: ItemKind,
    pub target: String,
    pub outcome: ActionOutcome,

    /// Inspection before any action was taken.
    pub inspection: Option<InspectionResult>,

    /// Inspection after the action to confirm convergence.
    pub verification: Option<InspectionResult>,

    pub backup: Option<BackupRecord>,
}

/// Lifecycle of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum RunState {
    #[default]
    InProgress,

    /// Every item was processed.
    Complete,

    /// Stopped between items on request.
    Cancelled,

    /// Stopped because an item marked fatal failed.
    Aborted { item: String, reason: String },
}

impl Display for RunState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::InProgress => fmt.write_str("in progress"),
            Self::Complete => fmt.write_str("complete"),
            Self::Cancelled => fmt.write_str("INCOMPLETE (cancelled)"),
            Self::Aborted { item, reason } => {
                write!(fmt, "INCOMPLETE (aborted at {item}: {reason})")
            }
        }
    }
}

/// Aggregate of all outcomes of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    platform: String,
    records: Vec<ItemRecord>,
    state: RunState,
}

impl RunReport {
    /// Start new run report.
    pub fn new(platform: &PlatformInfo) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            platform: platform.to_string(),
            records: Vec::new(),
            state: RunState::InProgress,
        }
    }

    /// Append outcome of one item.
    pub fn record(&mut self, record: ItemRecord) {
        self.records.push(record);
    }

    /// Mark run as cancelled.
    pub fn cancel(&mut self) {
        self.state = RunState::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    /// Mark run as aborted by fatal item.
    pub fn abort(&mut self, item: impl Into<String>, reason: impl Into<String>) {
        self.state = RunState::Aborted {
            item: item.into(),
            reason: reason.into(),
        };
        self.finished_at = Some(Utc::now());
    }

    /// Mark run as complete unless it was already stopped.
    pub fn finish(&mut self) {
        if self.state == RunState::InProgress {
            self.state = RunState::Complete;
        }

        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn records(&self) -> &[ItemRecord] {
        &self.records
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn has_failures(&self) -> bool {
        self.records.iter().any(|record| record.outcome.is_failed())
    }

    /// Count of items with given status.
    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.records
            .iter()
            .filter(|record| record.outcome.status == status)
            .count()
    }

    /// Finalize report into summary.
    pub fn finalize(mut self) -> Summary {
        self.finish();

        Summary {
            applied: self.count(OutcomeStatus::Applied),
            satisfied: self.count(OutcomeStatus::AlreadySatisfied),
            skipped: self.count(OutcomeStatus::Skipped),
            failed: self.count(OutcomeStatus::Failed),
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or(self.started_at),
            platform: self.platform,
            state: self.state,
            items: self.records,
        }
    }
}

/// Finalized summary of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub applied: usize,
    pub satisfied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub platform: String,
    pub state: RunState,
    pub items: Vec<ItemRecord>,
}

impl Summary {
    pub fn is_complete(&self) -> bool {
        self.state == RunState::Complete
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemRecord> {
        self.items.iter().filter(|record| record.outcome.is_failed())
    }

    /// Process exit code: zero only if no item failed.
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else {
            1
        }
    }

    /// Write summary as human-readable text to path.
    ///
    /// Creates missing parent directories.
    ///
    /// # Errors
    ///
    /// - Return [`ReportError::Write`] if the summary cannot be written.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            mkdirp::mkdirp(parent).map_err(|err| ReportError::Write {
                source: err,
                path: path.to_path_buf(),
            })?;
        }

        write(path, self.to_string()).map_err(|err| ReportError::Write {
            source: err,
            path: path.to_path_buf(),
        })?;
        info!("run summary written to {}", path.display());

        Ok(())
    }
}

impl Display for Summary {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "converge run summary")?;
        writeln!(fmt, "started:  {}", timestamp(&self.started_at))?;
        writeln!(fmt, "finished: {}", timestamp(&self.finished_at))?;
        writeln!(fmt, "platform: {}", self.platform)?;
        writeln!(fmt, "status:   {}", self.state)?;
        writeln!(fmt)?;
        writeln!(
            fmt,
            "applied: {}  already satisfied: {}  skipped: {}  failed: {}",
            self.applied, self.satisfied, self.skipped, self.failed
        )?;

        if !self.items.is_empty() {
            writeln!(fmt)?;
            writeln!(fmt, "items:")?;
            for record in &self.items {
                write!(
                    fmt,
                    "  {:<20} {}",
                    format!("[{}]", record.outcome.status),
                    record.id
                )?;
                if record.outcome.attempts > 0 {
                    write!(fmt, " (attempts: {})", record.outcome.attempts)?;
                }
                if let Some(backup) = &record.backup {
                    write!(fmt, " (backup: {})", backup.backup_path.display())?;
                }
                writeln!(fmt)?;
            }
        }

        let failed = self.failed_items().collect::<Vec<_>>();
        if !failed.is_empty() {
            writeln!(fmt)?;
            writeln!(fmt, "failed items:")?;
            for record in failed {
                writeln!(
                    fmt,
                    "  {} ({} {}, attempts: {})",
                    record.id, record.kind, record.target, record.outcome.attempts
                )?;
                if let Some(error) = &record.outcome.error {
                    for line in error.lines() {
                        writeln!(fmt, "    {line}")?;
                    }
                }
            }
        }

        Ok(())
    }
}

fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Report error types.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// Summary cannot be persisted.
    #[error("failed to write run summary to {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ReportError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Os;
    use pretty_assertions::assert_eq;

    fn record(id: &str, outcome: ActionOutcome) -> ItemRecord {
        ItemRecord {
            id: id.into(),
            kind: ItemKind::Package,
            target: id.trim_start_matches("package:").into(),
            outcome,
            inspection: None,
            verification: None,
            backup: None,
        }
    }

    #[test]
    fn finalize_counts_outcomes() {
        let mut report = RunReport::new(&PlatformInfo::new(Os::MacOs, None));
        report.record(record("package:git", ActionOutcome::applied(1)));
        report.record(record("package:zsh", ActionOutcome::already_satisfied()));
        report.record(record("package:choco", ActionOutcome::skipped()));
        report.record(record("package:nvim", ActionOutcome::failed(3, "gave up")));

        let summary = report.finalize();
        assert_eq!(
            (summary.applied, summary.satisfied, summary.skipped, summary.failed),
            (1, 1, 1, 1)
        );
        assert!(summary.is_complete());
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn aborted_run_stays_incomplete() {
        let mut report = RunReport::new(&PlatformInfo::new(Os::Wsl, None));
        report.record(record("package:apt", ActionOutcome::failed(1, "missing")));
        report.abort("package:apt", "fatal item failed");

        let summary = report.finalize();
        assert!(!summary.is_complete());
        assert_eq!(
            summary.state.to_string(),
            "INCOMPLETE (aborted at package:apt: fatal item failed)"
        );
    }

    #[test]
    fn summary_text_lists_failures_with_errors() -> anyhow::Result<()> {
        let mut report = RunReport::new(&PlatformInfo::new(Os::MacOs, None));
        report.record(record("package:git", ActionOutcome::applied(2)));
        report.record(record(
            "package:nvim",
            ActionOutcome::failed(3, "gave up after 3 attempts:\nlock held"),
        ));
        let summary = report.finalize();

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state").join("last-run.txt");
        summary.persist(&path)?;
        let text = std::fs::read_to_string(&path)?;

        assert!(text.contains("status:   complete"));
        assert!(text.contains("applied: 1  already satisfied: 0  skipped: 0  failed: 1"));
        assert!(text.contains("  [applied]            package:git (attempts: 2)"));
        assert!(text.contains("failed items:\n  package:nvim (package nvim, attempts: 3)"));
        assert!(text.contains("    gave up after 3 attempts:\n    lock held"));

        Ok(())
    }
}
