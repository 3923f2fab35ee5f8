// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Package manager glue.
//!
//! Each supported platform has exactly one package manager: Homebrew on
//! macOS, APT on Ubuntu Server and WSL, and Chocolatey on Windows. Only two
//! things are ever asked of them: which version of a package is installed, and
//! install (or upgrade) a package.
//!
//! # Locking
//!
//! Package managers guard their database with a lock, and concurrent
//! invocations commonly corrupt it or fail outright. Every write issued
//! through a [`PackageManager`] is serialized on one mutual exclusion point
//! shared by all clones of that manager.

use crate::{
    context::ExecutionContext,
    exec::{CommandOutput, CommandRunner, CommandSpec, ExecError},
    executor::{self, check_output, ActionError},
    platform::Os,
};

use semver::{Version, VersionReq};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Supported package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageManagerKind {
    Homebrew,
    Apt,
    Chocolatey,
}

impl PackageManagerKind {
    /// Package manager used by platform.
    pub fn for_os(os: Os) -> Self {
        match os {
            Os::MacOs => Self::Homebrew,
            Os::UbuntuServer | Os::Wsl => Self::Apt,
            Os::Windows => Self::Chocolatey,
        }
    }

    /// Executable that must be present for the package manager to work.
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Homebrew => "brew",
            Self::Apt => "apt-get",
            Self::Chocolatey => "choco",
        }
    }

    /// Read-only query of installed version.
    pub fn query_command(&self, name: &str) -> CommandSpec {
        match self {
            Self::Homebrew => CommandSpec::new("brew").args(["list", "--versions", name]),
            Self::Apt => CommandSpec::new("dpkg-query").args([
                "--show",
                "--showformat=${Status} ${Version}",
                name,
            ]),
            Self::Chocolatey => {
                CommandSpec::new("choco").args(["list", "--exact", "--limit-output", name])
            }
        }
    }

    /// Install or upgrade command.
    pub fn install_command(&self, name: &str, installed: bool) -> CommandSpec {
        match self {
            Self::Homebrew if installed => CommandSpec::new("brew").args(["upgrade", name]),
            Self::Homebrew => CommandSpec::new("brew").args(["install", name]),
            Self::Apt => CommandSpec::new("env")
                .args([
                    "DEBIAN_FRONTEND=noninteractive",
                    "apt-get",
                    "install",
                    "--yes",
                    "--quiet",
                    name,
                ])
                .privileged(),
            Self::Chocolatey => {
                CommandSpec::new("choco").args(["upgrade", name, "--yes", "--no-progress"])
            }
        }
    }

    /// Parse installed version from output of query command.
    ///
    /// Return `None` if the output says the package is not installed.
    pub fn parse_installed(&self, name: &str, output: &CommandOutput) -> Option<String> {
        if !output.success() {
            return None;
        }

        match self {
            // INVARIANT: Output looks like "git 2.43.0 2.44.0", newest last.
            Self::Homebrew => output
                .stdout
                .lines()
                .find(|line| line.split_whitespace().next() == Some(name))
                .and_then(|line| line.split_whitespace().last().map(str::to_owned))
                .filter(|version| version != name),

            // INVARIANT: Output looks like "install ok installed 1:2.43.0-1ubuntu7".
            Self::Apt => {
                let line = output.stdout.trim();
                line.strip_prefix("install ok installed ")
                    .map(str::trim)
                    .filter(|version| !version.is_empty())
                    .map(str::to_owned)
            }

            // INVARIANT: Output looks like "git|2.43.0".
            Self::Chocolatey => output.stdout.lines().find_map(|line| {
                let (package, version) = line.trim().split_once('|')?;
                package
                    .eq_ignore_ascii_case(name)
                    .then(|| version.trim().to_owned())
            }),
        }
    }
}

impl Display for PackageManagerKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Homebrew => "homebrew",
            Self::Apt => "apt",
            Self::Chocolatey => "chocolatey",
        };
        fmt.write_str(name)
    }
}

/// Package manager of the current platform.
#[derive(Clone)]
pub struct PackageManager {
    kind: PackageManagerKind,
    runner: Arc<dyn CommandRunner>,
    lock: Arc<Mutex<()>>,
}

impl PackageManager {
    /// Construct new package manager driven through command runner.
    pub fn new(kind: PackageManagerKind, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            kind,
            runner,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn kind(&self) -> PackageManagerKind {
        self.kind
    }

    /// Query installed version of package.
    ///
    /// # Errors
    ///
    /// - Return [`PackageError::Query`] if the query command cannot be run.
    #[instrument(skip(self, ctx), level = "debug")]
    pub async fn installed_version(
        &self,
        name: &str,
        ctx: &ExecutionContext,
    ) -> Result<Option<String>> {
        let command = self.kind.query_command(name);
        let output = self
            .runner
            .run(&command, ctx)
            .await
            .map_err(|err| PackageError::Query {
                source: err,
                name: name.into(),
            })?;
        let version = self.kind.parse_installed(name, &output);
        debug!("{} reports {name} at {version:?}", self.kind);

        Ok(version)
    }

    /// Install package, or upgrade it if an older version is installed.
    ///
    /// Holds the package manager lock for the whole operation.
    ///
    /// # Errors
    ///
    /// - Return [`ActionError`] classified from the command's failure.
    #[instrument(skip(self, ctx), level = "debug")]
    pub async fn install(&self, name: &str, ctx: &ExecutionContext) -> executor::Result<String> {
        let _guard = self.lock.lock().await;

        let installed = self
            .installed_version(name, ctx)
            .await
            .map_err(|err| match err {
                PackageError::Query { ref source, .. } => ActionError {
                    kind: executor::classify_io(source.io_kind()),
                    message: format!("{err}: {source}"),
                },
            })?
            .is_some();

        let command = self.kind.install_command(name, installed);
        info!("{command}");
        let output = self
            .runner
            .run(&command, ctx)
            .await
            .map_err(|err| ActionError::from_exec(&err))?;

        check_output(&command, output)
    }
}

impl std::fmt::Debug for PackageManager {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("PackageManager")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Normalize package manager version into semantic version.
///
/// Strips Debian epochs and revisions, Homebrew revisions, and pads or cuts
/// numeric components to exactly three, e.g., "1:2.43.0-1ubuntu7" becomes
/// "2.43.0" and "5.2" becomes "5.2.0".
pub fn normalize_version(raw: &str) -> Option<Version> {
    let raw = raw.split_once(':').map_or(raw, |(_, rest)| rest);
    let numeric = raw
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect::<String>();

    let mut parts = numeric
        .split('.')
        .filter(|part| !part.is_empty())
        .map(str::parse::<u64>);
    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);

    Some(Version::new(major, minor, patch))
}

/// Check if installed version satisfies optional requirement.
pub fn version_satisfies(installed: &str, requirement: Option<&VersionReq>) -> bool {
    match requirement {
        None => true,
        Some(requirement) => {
            normalize_version(installed).is_some_and(|version| requirement.matches(&version))
        }
    }
}

/// Package manager error types.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// Installed version query cannot be run.
    #[error("failed to query installed version of {name:?}")]
    Query {
        #[source]
        source: ExecError,
        name: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = PackageError> = std::result::Result<T, E>;
