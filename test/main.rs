// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT


use converge::{
    backup::{Backup, BackupRecord, FileBackups},
    context::ExecutionContext,
    exec::{CommandOutput, CommandRunner, CommandSpec},
    executor::{Backoff, RetryExecutor, RetryPolicy},
    inspect::HostState,
    package::{PackageManager, PackageManagerKind},
    reconcile::Reconciler,
    setting::SettingStore,
};

use futures::future::BoxFuture;
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// How the fake package manager answers an install request.
#[derive(Debug, Clone)]
pub(crate) enum Install {
    /// Install succeeds with given version.
    Succeed(String),

    /// Lock is held by another process for the first N attempts.
    BusyFor(usize, String),

    /// Lock is held forever.
    Busy,

    /// Package does not exist.
    Missing,

    /// Installer exits zero without installing anything.
    Lie,
}

/// Scripted host answering Homebrew and git config commands from memory.
#[derive(Debug, Default)]
pub(crate) struct FakeSystem {
    installed: Mutex<BTreeMap<String, String>>,
    settings: Mutex<BTreeMap<String, String>>,
    installs: Mutex<BTreeMap<String, Install>>,
    calls: Mutex<Vec<String>>,
}

impl FakeSystem {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_installed(self: Arc<Self>, name: &str, version: &str) -> Arc<Self> {
        self.installed
            .lock()
            .unwrap()
            .insert(name.into(), version.into());
        self
    }

    pub(crate) fn with_install(self: Arc<Self>, name: &str, install: Install) -> Arc<Self> {
        self.installs.lock().unwrap().insert(name.into(), install);
        self
    }

    pub(crate) fn with_setting(self: Arc<Self>, key: &str, value: &str) -> Arc<Self> {
        self.settings
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
        self
    }

    /// Every command run so far, as displayed.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Count of commands run so far that start with prefix.
    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn answer(&self, command: &CommandSpec) -> CommandOutput {
        let args = command.args.iter().map(String::as_str).collect::<Vec<_>>();
        match (command.program.as_str(), args.as_slice()) {
            ("brew", ["list", "--versions", name]) => match self.installed.lock().unwrap().get(*name) {
                Some(version) => CommandOutput::exited(0, format!("{name} {version}\n"), ""),
                None => CommandOutput::exited(1, "", format!("Error: No such keg: {name}")),
            },
            ("brew", ["install" | "upgrade", name]) => self.install(name),
            ("git", ["config", "--global", "--get", key]) => match self.settings.lock().unwrap().get(*key) {
                Some(value) => CommandOutput::exited(0, format!("{value}\n"), ""),
                None => CommandOutput::exited(1, "", ""),
            },
            ("git", ["config", "--global", key, value]) => {
                self.settings
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), value.to_string());
                CommandOutput::exited(0, "", "")
            }
            _ => CommandOutput::exited(127, "", format!("{}: command not found", command.program)),
        }
    }

    fn install(&self, name: &str) -> CommandOutput {
        let busy = CommandOutput::exited(
            1,
            "",
            "Error: Another active Homebrew process is already in progress.",
        );

        let mut installs = self.installs.lock().unwrap();
        let install = installs
            .get(name)
            .cloned()
            .unwrap_or_else(|| Install::Succeed("1.0.0".into()));
        let version = match install {
            Install::Succeed(version) => version,
            Install::BusyFor(0, version) => version,
            Install::BusyFor(remaining, version) => {
                installs.insert(name.into(), Install::BusyFor(remaining - 1, version));
                return busy;
            }
            Install::Busy => return busy,
            Install::Missing => {
                return CommandOutput::exited(
                    1,
                    "",
                    format!("Error: No available formula with the name \"{name}\"."),
                )
            }
            Install::Lie => return CommandOutput::exited(0, format!("==> Installing {name}"), ""),
        };

        self.installed
            .lock()
            .unwrap()
            .insert(name.into(), version.clone());
        CommandOutput::exited(0, format!("==> Pouring {name}--{version}"), "")
    }
}

impl CommandRunner for FakeSystem {
    fn run<'a>(
        &'a self,
        command: &'a CommandSpec,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, converge::exec::Result<CommandOutput>> {
        self.calls.lock().unwrap().push(command.to_string());
        let output = self.answer(command);
        Box::pin(async move { Ok(output) })
    }
}

/// Real backups that count how often they were asked for.
#[derive(Debug, Default)]
pub(crate) struct CountingBackups {
    inner: FileBackups,
    calls: AtomicUsize,
}

impl CountingBackups {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Backup for CountingBackups {
    fn backup(&self, path: &Path) -> converge::backup::Result<Option<BackupRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.backup(path)
    }
}

/// Reconciler over a scripted Homebrew host without retry delays.
pub(crate) fn reconciler(
    system: &Arc<FakeSystem>,
    max_attempts: u32,
) -> Reconciler<HostState, CountingBackups> {
    let runner: Arc<dyn CommandRunner> = system.clone();
    let host = HostState::new(
        PackageManager::new(PackageManagerKind::Homebrew, runner.clone()),
        SettingStore::new(runner),
    );
    let policy = RetryPolicy::new(max_attempts, Duration::ZERO, Backoff::Fixed);

    Reconciler::new(
        host,
        CountingBackups::default(),
        RetryExecutor::new(policy),
        ExecutionContext::new(),
    )
}
