// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Retryable execution of mutating actions.
//!
//! Package managers fail for all kinds of reasons that go away on their own:
//! another process holds the dpkg lock, a mirror times out, Homebrew is busy
//! auto-updating. They also fail for reasons no amount of retrying will fix:
//! the package does not exist, the disk is full, the user lacks permission.
//! The [`RetryExecutor`] runs a [`MutatingAction`] under one [`RetryPolicy`],
//! retrying only __transient__ failures and stopping at the first __fatal__
//! one.
//!
//! Every attempt is logged with its attempt number, the action identifier,
//! and its output truncated to [`LOG_OUTPUT_LIMIT`] characters.

use crate::{
    context::ExecutionContext,
    exec::{CommandOutput, CommandSpec, ExecError},
    item::ActionOutcome,
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    io::ErrorKind,
    time::Duration,
};
use tracing::{error, info, instrument, warn};

/// Maximum number of output characters logged per attempt.
pub const LOG_OUTPUT_LIMIT: usize = 512;

/// Exit codes that mean "busy" or "in progress" for a supported tool.
///
/// - 1618: Windows installer reports another installation in progress.
const TRANSIENT_EXIT_CODES: &[i32] = &[1618];

/// Exit codes that mean success for a supported tool.
///
/// - 3010: Windows installer succeeded but asks for a reboot.
const SUCCESS_EXIT_CODES: &[i32] = &[0, 3010];

/// Output markers that retrying cannot fix, checked before transient ones.
const FATAL_MARKERS: &[&str] = &[
    "permission denied",
    "are you root",
    "no space left on device",
    "disk full",
    "invalid argument",
    "unable to locate package",
    "no available formula",
    "no formulae or casks found",
];

/// Output markers of lock contention, busy resources, and flaky networks.
const TRANSIENT_MARKERS: &[&str] = &[
    "could not get lock",
    "unable to lock",
    "is another process using it",
    "another active homebrew process",
    "already locked",
    "resource busy",
    "resource temporarily unavailable",
    "temporary failure resolving",
    "temporary failure in name resolution",
    "could not resolve host",
    "failed to fetch",
    "connection timed out",
    "operation timed out",
    "connection reset",
    "network is unreachable",
    "service unavailable",
];

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Expected to possibly succeed on retry.
    Transient,

    /// Retrying cannot fix it.
    Fatal,
}

impl Display for FailureKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Transient => fmt.write_str("transient"),
            Self::Fatal => fmt.write_str("fatal"),
        }
    }
}

/// Failure of one attempt of a mutating action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} failure: {message}")]
pub struct ActionError {
    pub kind: FailureKind,
    pub message: String,
}

impl ActionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }

    /// Classify I/O error by its kind.
    pub fn from_io(error: &std::io::Error) -> Self {
        Self {
            kind: classify_io(error.kind()),
            message: error.to_string(),
        }
    }

    /// Classify failure to run a command at all.
    pub fn from_exec(error: &ExecError) -> Self {
        Self {
            kind: classify_io(error.io_kind()),
            message: error.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// Turn finished command into action result by its exit code and output.
///
/// # Errors
///
/// - Return [`ActionError`] classified by [`classify_output`] if the
///   command did not exit with a success code.
pub fn check_output(command: &CommandSpec, output: CommandOutput) -> Result<String> {
    if output.code.is_some_and(|code| SUCCESS_EXIT_CODES.contains(&code)) {
        return Ok(output.message());
    }

    Err(ActionError {
        kind: classify_output(&output),
        message: format!(
            "command {:?} exited with {}:\n{}",
            command.to_string(),
            output
                .code
                .map_or_else(|| "signal".to_string(), |code| code.to_string()),
            output.message()
        ),
    })
}

/// Classify failed command by exit code and output markers.
pub fn classify_output(output: &CommandOutput) -> FailureKind {
    if output.code.is_some_and(|code| TRANSIENT_EXIT_CODES.contains(&code)) {
        return FailureKind::Transient;
    }

    let text = format!("{}\n{}", output.stdout, output.stderr).to_ascii_lowercase();
    if FATAL_MARKERS.iter().any(|marker| text.contains(marker)) {
        return FailureKind::Fatal;
    }

    if TRANSIENT_MARKERS.iter().any(|marker| text.contains(marker)) {
        return FailureKind::Transient;
    }

    FailureKind::Fatal
}

/// Classify I/O error kind.
pub fn classify_io(kind: ErrorKind) -> FailureKind {
    match kind {
        ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionRefused => FailureKind::Transient,
        _ => FailureKind::Fatal,
    }
}

/// An action that changes system state.
pub trait MutatingAction: Send + Sync {
    /// Identifier of the action used in logs.
    fn id(&self) -> &str;

    /// Perform one attempt of the action.
    ///
    /// Returns the output of the attempt for logging purposes.
    fn run<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<String>>;
}

/// How the delay between attempts grows.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,

    /// Delay grows by the base delay with every retry.
    #[default]
    Linear,
}

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never zero.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Construct new retry policy.
    ///
    /// Clamps `max_attempts` to at least one attempt.
    pub fn new(max_attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff,
        }
    }

    /// Delay before given attempt number, counting from one.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let retry = attempt.saturating_sub(1);
        match self.backoff {
            _ if retry == 0 => Duration::ZERO,
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay.saturating_mul(retry),
        }
    }
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, linear backoff, 2 second base delay.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2), Backoff::Linear)
    }
}

/// Runs mutating actions under a bounded retry policy.
#[derive(Debug, Default, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Construct new executor.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute action until it succeeds, fails fatally, or exhausts attempts.
    ///
    /// Outcome is either [`OutcomeStatus::Applied`] or
    /// [`OutcomeStatus::Failed`]. The delay between attempts is a
    /// non-blocking sleep.
    ///
    /// [`OutcomeStatus::Applied`]: crate::item::OutcomeStatus::Applied
    /// [`OutcomeStatus::Failed`]: crate::item::OutcomeStatus::Failed
    #[instrument(skip(self, action, ctx), fields(action = action.id()), level = "debug")]
    pub async fn execute(&self, action: &dyn MutatingAction, ctx: &ExecutionContext) -> ActionOutcome {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            info!("attempt {attempt}/{max_attempts} of {}", action.id());
            let error = match action.run(ctx).await {
                Ok(output) => {
                    info!(
                        "attempt {attempt} of {} succeeded: {}",
                        action.id(),
                        truncate(&output, LOG_OUTPUT_LIMIT)
                    );
                    return ActionOutcome::applied(attempt);
                }
                Err(error) => error,
            };

            let message = truncate(&error.message, LOG_OUTPUT_LIMIT);
            if !error.is_transient() {
                error!("attempt {attempt} of {} failed fatally: {message}", action.id());
                return ActionOutcome::failed(attempt, error.to_string());
            }

            if attempt >= max_attempts {
                error!(
                    "attempt {attempt} of {} failed, no attempts left: {message}",
                    action.id()
                );
                return ActionOutcome::failed(
                    attempt,
                    format!("gave up after {attempt} attempts: {error}"),
                );
            }

            warn!("attempt {attempt} of {} failed, will retry: {message}", action.id());
        }
    }
}

/// Truncate text to a character limit on a character boundary.
pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}

/// Friendly result alias :3
pub type Result<T, E = ActionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::OutcomeStatus;
    use simple_test_case::test_case;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    /// Fails with scripted errors, then succeeds.
    struct Scripted {
        failures: Mutex<Vec<ActionError>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(failures: impl IntoIterator<Item = ActionError>) -> Self {
            let mut failures = failures.into_iter().collect::<Vec<_>>();
            failures.reverse();
            Self {
                failures: Mutex::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl MutatingAction for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        fn run<'a>(&'a self, _ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.failures.lock().unwrap().pop();
            Box::pin(async move {
                match next {
                    Some(error) => Err(error),
                    None => Ok("done".into()),
                }
            })
        }
    }

    fn executor(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy::new(max_attempts, Duration::ZERO, Backoff::Fixed))
    }

    #[tokio::test]
    async fn transient_failures_exhaust_attempts() {
        let action = Scripted::new((0..5).map(|_| ActionError::transient("lock held")));
        let outcome = executor(3).execute(&action, &ExecutionContext::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(action.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_failure_stops_after_first_attempt() {
        let action = Scripted::new([ActionError::fatal("permission denied")]);
        let outcome = executor(3).execute(&action, &ExecutionContext::new()).await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error.unwrap().contains("permission denied"));
    }

    #[tokio::test]
    async fn transient_failure_then_success_is_applied() {
        let action = Scripted::new([ActionError::transient("timed out")]);
        let outcome = executor(2).execute(&action, &ExecutionContext::new()).await;

        assert_eq!(outcome, ActionOutcome::applied(2));
    }

    #[test_case(Backoff::Fixed, [0, 2, 2]; "fixed")]
    #[test_case(Backoff::Linear, [0, 2, 4]; "linear")]
    #[test]
    fn delay_grows_by_backoff(backoff: Backoff, expect: [u64; 3]) {
        let policy = RetryPolicy::new(3, Duration::from_secs(2), backoff);
        let result = [1, 2, 3].map(|attempt| policy.delay_before(attempt).as_secs());
        assert_eq!(result, expect);
    }

    #[test_case(CommandOutput::exited(100, "", "E: Could not get lock /var/lib/dpkg/lock-frontend"), FailureKind::Transient; "apt lock")]
    #[test_case(CommandOutput::exited(1, "", "Error: Another active Homebrew process is already in progress"), FailureKind::Transient; "brew lock")]
    #[test_case(CommandOutput::exited(1618, "", ""), FailureKind::Transient; "msi busy")]
    #[test_case(CommandOutput::exited(100, "", "E: Unable to locate package blah"), FailureKind::Fatal; "missing package")]
    #[test_case(CommandOutput::exited(100, "", "E: Unable to lock the administration directory, are you root?"), FailureKind::Fatal; "not root")]
    #[test_case(CommandOutput::exited(2, "", "cp: No space left on device"), FailureKind::Fatal; "disk full")]
    #[test_case(CommandOutput::exited(1, "", "something odd"), FailureKind::Fatal; "unknown")]
    #[test]
    fn classify_command_failures(output: CommandOutput, expect: FailureKind) {
        assert_eq!(classify_output(&output), expect);
    }

    #[test]
    fn reboot_required_counts_as_success() {
        let command = CommandSpec::new("choco").args(["install", "git", "-y"]);
        let result = check_output(&command, CommandOutput::exited(3010, "reboot", ""));
        assert!(result.is_ok());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
