// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Reconciliation loop.
//!
//! Drive a list of desired state items toward convergence, one item at a time
//! in declaration order. For each item the loop:
//!
//! 1. Skips it if its platform scope excludes the current platform.
//! 2. Inspects it, and records it as already satisfied if nothing needs to be
//!    done. Satisfied items are never backed up nor executed.
//! 3. Backs up the file it would overwrite, if any. A failed backup fails that
//!    item only.
//! 4. Runs its mutating action through the retry executor.
//! 5. Inspects it again, and downgrades a successful action that did not
//!    actually reach the desired state into a failure.
//!
//! A failed item never stops the loop unless it is marked fatal. Cancellation
//! is observed between items, never in the middle of one.

use crate::{
    backup::{Backup, BackupError, FileBackups},
    context::{Cancellation, ExecutionContext},
    executor::RetryExecutor,
    inspect::StateProvider,
    item::{ActionOutcome, DesiredStateItem, InspectionResult, ItemKind, OutcomeStatus},
    platform::{PlatformInfo, Probe, ProbeError},
    report::{ItemRecord, RunReport},
};

use indicatif::ProgressBar;
use tracing::{debug, error, info, instrument, warn};

/// Detect current platform, refusing to run anywhere unsupported.
///
/// # Errors
///
/// - Return [`ReconcileError::UnsupportedPlatform`] if the host does not match
///   any supported platform.
pub fn detect_platform(probe: &Probe) -> Result<PlatformInfo> {
    let platform = probe.detect()?;
    info!("detected platform {platform}");
    if !platform.has_package_manager() {
        warn!(
            "package manager {} not found on PATH",
            platform.package_manager.binary()
        );
    }

    Ok(platform)
}

/// Orchestrates inspection, backup, execution, and verification of items.
pub struct Reconciler<P, B = FileBackups>
where
    P: StateProvider,
    B: Backup,
{
    provider: P,
    backups: B,
    executor: RetryExecutor,
    ctx: ExecutionContext,
    cancel: Cancellation,
    progress: Option<ProgressBar>,
}

impl<P, B> Reconciler<P, B>
where
    P: StateProvider,
    B: Backup,
{
    /// Construct new reconciler.
    pub fn new(provider: P, backups: B, executor: RetryExecutor, ctx: ExecutionContext) -> Self {
        Self {
            provider,
            backups,
            executor,
            ctx,
            cancel: Cancellation::new(),
            progress: None,
        }
    }

    /// Observe given cancellation signal between items.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Advance progress bar once per processed item.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn backups(&self) -> &B {
        &self.backups
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    /// Reconcile items against the host in declaration order.
    ///
    /// Always returns a report, even for cancelled or aborted runs. The
    /// report only holds items processed before the run stopped.
    #[instrument(skip(self, items, platform), fields(platform = %platform), level = "debug")]
    pub async fn reconcile(&self, items: &[DesiredStateItem], platform: &PlatformInfo) -> RunReport {
        let mut report = RunReport::new(platform);
        info!("reconciling {} items", items.len());

        for item in items {
            if self.cancel.is_cancelled() {
                warn!("run cancelled before {}", item.id);
                report.cancel();
                break;
            }

            if let Some(progress) = &self.progress {
                progress.set_message(item.id.clone());
            }

            let record = self.reconcile_item(item, platform).await;
            let failure = record
                .outcome
                .is_failed()
                .then(|| record.outcome.error.clone().unwrap_or_default());
            report.record(record);

            if let Some(progress) = &self.progress {
                progress.inc(1);
            }

            if let Some(message) = failure.filter(|_| item.fatal) {
                let err = ReconcileError::FatalItem {
                    id: item.id.clone(),
                    message,
                };
                error!("{err}, aborting run");
                report.abort(&item.id, err.to_string());
                break;
            }
        }

        report.finish();
        info!(
            "run {}: {} applied, {} already satisfied, {} skipped, {} failed",
            report.state(),
            report.count(OutcomeStatus::Applied),
            report.count(OutcomeStatus::AlreadySatisfied),
            report.count(OutcomeStatus::Skipped),
            report.count(OutcomeStatus::Failed),
        );

        report
    }

    /// Reconcile a single item.
    #[instrument(skip(self, item, platform), fields(item = %item.id), level = "debug")]
    pub async fn reconcile_item(&self, item: &DesiredStateItem, platform: &PlatformInfo) -> ItemRecord {
        let mut record = ItemRecord {
            id: item.id.clone(),
            kind: item.kind(),
            target: item.target(),
            outcome: ActionOutcome::skipped(),
            inspection: None,
            verification: None,
            backup: None,
        };

        if !item.scope.includes(platform.os) {
            info!("{} skipped, not in scope for {}", item.id, platform.os);
            return record;
        }

        let inspection = self.provider.inspect(item, &self.ctx).await;
        debug!("{} currently {}", item.id, inspection.current_value);
        if inspection.satisfied {
            info!("{} already satisfied", item.id);
            record.outcome = ActionOutcome::already_satisfied();
            record.inspection = Some(inspection);
            return record;
        }
        record.inspection = Some(inspection);

        if matches!(item.kind(), ItemKind::FileContent | ItemKind::Setting) {
            if let Some(target) = self.provider.backup_target(item) {
                match self.backups.backup(&target) {
                    Ok(Some(backup)) => record.backup = Some(backup),
                    Ok(None) => debug!("nothing to back up at {}", target.display()),
                    Err(err) => {
                        let message = backup_failure(&err);
                        error!("{} failed: {message}", item.id);
                        record.outcome = ActionOutcome::failed(0, message);
                        return record;
                    }
                }
            }
        }

        let action = self.provider.action(item);
        let mut outcome = self.executor.execute(action.as_ref(), &self.ctx).await;

        if outcome.status == OutcomeStatus::Applied {
            let verification = self.provider.inspect(item, &self.ctx).await;
            if !verification.satisfied {
                let message = post_condition_failure(&verification);
                error!("{} failed: {message}", item.id);
                outcome = ActionOutcome::failed(outcome.attempts, message);
            } else {
                info!("{} applied after {} attempts", item.id, outcome.attempts);
            }
            record.verification = Some(verification);
        } else {
            error!(
                "{} failed after {} attempts: {}",
                item.id,
                outcome.attempts,
                outcome.error.as_deref().unwrap_or_default()
            );
        }

        record.outcome = outcome;
        record
    }

    /// Inspect every in-scope item without mutating anything.
    ///
    /// Out-of-scope items map to `None`.
    #[instrument(skip(self, items, platform), level = "debug")]
    pub async fn check<'a>(
        &self,
        items: &'a [DesiredStateItem],
        platform: &PlatformInfo,
    ) -> Vec<(&'a DesiredStateItem, Option<InspectionResult>)> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            if !item.scope.includes(platform.os) {
                results.push((item, None));
                continue;
            }

            let inspection = self.provider.inspect(item, &self.ctx).await;
            results.push((item, Some(inspection)));
        }

        results
    }
}

fn backup_failure(err: &BackupError) -> String {
    let mut message = format!("backup failed: {err}");
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(&format!(": {cause}"));
        source = cause.source();
    }

    message
}

fn post_condition_failure(verification: &InspectionResult) -> String {
    format!(
        "post-condition not met: action reported success but current value is {}",
        verification.current_value
    )
}

/// Reconciliation error types.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Host is not a supported platform, so nothing can be reconciled.
    #[error(transparent)]
    UnsupportedPlatform(#[from] ProbeError),

    /// Item marked fatal failed.
    #[error("fatal item {id} failed: {message}")]
    FatalItem { id: String, message: String },
}

/// Friendly result alias :3
pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
