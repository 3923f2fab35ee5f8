// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Explicit execution state.
//!
//! Provisioning scripts usually lean on ambient process state: a sudo session
//! kept alive in the background, `PATH` mutated halfway through a run, and so
//! on. Here that state is carried explicitly through an [`ExecutionContext`]
//! handed to every mutating action, and cancellation is carried through a
//! [`Cancellation`] handle shared with whoever listens for interrupts.

use std::{
    collections::BTreeMap,
    env,
    ffi::OsString,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// How privileged commands are run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum Privilege {
    /// Run commands as the current user.
    #[default]
    User,

    /// Prefix privileged commands with non-interactive sudo.
    ///
    /// Runs are unattended, so sudo must never prompt. A cached credential,
    /// a NOPASSWD rule, or an askpass helper must already be in place.
    Sudo { askpass: Option<PathBuf> },
}

/// State passed explicitly to every command an action runs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub privilege: Privilege,

    /// Environment overrides applied to every command.
    pub env: BTreeMap<String, String>,

    /// Directories searched before the inherited `PATH`.
    pub path_prepend: Vec<PathBuf>,
}

impl ExecutionContext {
    /// Construct new context running everything as the current user.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_path_prepend(mut self, dir: impl Into<PathBuf>) -> Self {
        self.path_prepend.push(dir.into());
        self
    }

    /// Full executable search path: prepends first, then inherited `PATH`.
    pub fn search_path(&self) -> Vec<PathBuf> {
        let mut paths = self.path_prepend.clone();
        if let Some(path) = env::var_os("PATH") {
            paths.extend(env::split_paths(&path));
        }
        paths
    }

    /// Value for `PATH` to hand child processes, if it needs overriding.
    pub fn path_override(&self) -> Option<OsString> {
        if self.path_prepend.is_empty() {
            return None;
        }

        env::join_paths(self.search_path()).ok()
    }

    /// Check if privileged commands should be elevated.
    ///
    /// Elevation is skipped when already running as root.
    pub fn elevates(&self) -> bool {
        matches!(self.privilege, Privilege::Sudo { .. }) && !running_as_root()
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    use std::os::unix::fs::MetadataExt;

    // INVARIANT: Owner of "/proc/self" is the effective user on Linux.
    std::fs::metadata("/proc/self")
        .map(|meta| meta.uid() == 0)
        .unwrap_or_else(|_| env::var("USER").is_ok_and(|user| user == "root"))
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

/// Cooperative cancellation signal.
///
/// The reconciliation loop only observes cancellation between items. An
/// in-flight action always finishes or exhausts its retries first.
#[derive(Debug, Default, Clone)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    /// Construct new cancellation signal that is not yet cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn path_prepends_come_first() {
        let ctx = ExecutionContext::new().with_path_prepend("/opt/homebrew/bin");
        let paths = ctx.search_path();
        assert_eq!(paths[0], PathBuf::from("/opt/homebrew/bin"));
        assert!(ctx.path_override().is_some());
        assert!(ExecutionContext::new().path_override().is_none());
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let cancel = Cancellation::new();
        let observer = cancel.clone();
        assert!(!observer.is_cancelled());

        cancel.cancel();
        assert!(observer.is_cancelled());
    }
}
