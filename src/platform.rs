// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Platform detection.
//!
//! Identify which host the reconciliation run is being performed on, and
//! which package manager that host is expected to use. Only four platforms
//! are supported: macOS, Ubuntu Server, WSL, and Windows. Anything else is
//! rejected outright instead of guessed at.
//!
//! # Detection Order
//!
//! Kernel name markers are checked first. Linux kernels are then checked for
//! WSL signatures _before_ the distribution release file is consulted,
//! because a WSL instance usually ships an Ubuntu release file as well. A
//! Linux host that carries both must resolve to WSL.

use crate::package::PackageManagerKind;

use serde::{Deserialize, Serialize};
use std::{
    env,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Supported operating system family.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
pub enum Os {
    #[serde(rename = "macos")]
    MacOs,

    #[serde(rename = "ubuntu-server")]
    UbuntuServer,

    #[serde(rename = "wsl")]
    Wsl,

    #[serde(rename = "windows")]
    Windows,
}

impl Display for Os {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::MacOs => "macos",
            Self::UbuntuServer => "ubuntu-server",
            Self::Wsl => "wsl",
            Self::Windows => "windows",
        };
        fmt.write_str(name)
    }
}

/// Detected platform information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub os: Os,

    /// Release or flavor of the platform if it could be determined.
    pub variant: Option<String>,

    pub package_manager: PackageManagerKind,

    search_path: Vec<PathBuf>,
}

impl PlatformInfo {
    /// Construct new platform information with no executable search path.
    pub fn new(os: Os, variant: Option<String>) -> Self {
        Self {
            os,
            variant,
            package_manager: PackageManagerKind::for_os(os),
            search_path: Vec::new(),
        }
    }

    /// Replace the directories searched by [`PlatformInfo::has_command`].
    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    /// Check if an executable is reachable through the search path.
    pub fn has_command(&self, name: impl AsRef<str>) -> bool {
        let name = name.as_ref();
        let suffixes: &[&str] = match self.os {
            Os::Windows => &["", ".exe", ".cmd", ".bat"],
            _ => &[""],
        };

        self.search_path.iter().any(|dir| {
            suffixes
                .iter()
                .any(|suffix| is_executable(&dir.join(format!("{name}{suffix}"))))
        })
    }

    /// Check if the platform's package manager is available.
    pub fn has_package_manager(&self) -> bool {
        self.has_command(self.package_manager.binary())
    }
}

impl Display for PlatformInfo {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match &self.variant {
            Some(variant) => write!(fmt, "{} ({variant})", self.os)?,
            None => write!(fmt, "{}", self.os)?,
        }
        write!(fmt, " via {}", self.package_manager)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Platform probe.
///
/// Reads kernel and distribution markers relative to a root directory so
/// that detection can be exercised against a fake file system.
#[derive(Debug, Clone)]
pub struct Probe {
    root: PathBuf,
    kernel: String,
    search_path: Vec<PathBuf>,
}

impl Probe {
    /// Construct new probe of the running host.
    pub fn system() -> Self {
        let search_path = env::var_os("PATH")
            .map(|path| env::split_paths(&path).collect())
            .unwrap_or_default();

        Self {
            root: PathBuf::from("/"),
            kernel: env::consts::OS.into(),
            search_path,
        }
    }

    /// Construct new probe of a fake root with given kernel name.
    pub fn new(root: impl Into<PathBuf>, kernel: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            kernel: kernel.into(),
            search_path: Vec::new(),
        }
    }

    /// Replace directories searched for commands by detected platform.
    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    /// Detect platform of host.
    ///
    /// # Errors
    ///
    /// - Return [`ProbeError::UnsupportedPlatform`] if no known platform
    ///   matches. Callers must abort the entire run in that case.
    #[instrument(skip(self), level = "debug")]
    pub fn detect(&self) -> Result<PlatformInfo> {
        let (os, variant) = match self.kernel.as_str() {
            "macos" | "darwin" => (Os::MacOs, None),
            "windows" => (Os::Windows, None),
            "linux" => self.detect_linux()?,
            kernel => return Err(ProbeError::UnsupportedPlatform(kernel.into())),
        };
        debug!("detected {os} {variant:?}");

        Ok(PlatformInfo::new(os, variant).with_search_path(self.search_path.clone()))
    }

    fn detect_linux(&self) -> Result<(Os, Option<String>)> {
        // INVARIANT: WSL markers must win over any distribution release file.
        let osrelease = self.read_marker("proc/sys/kernel/osrelease");
        let version = self.read_marker("proc/version");
        if is_wsl_marker(&osrelease) || is_wsl_marker(&version) {
            let flavor = if osrelease.contains("WSL2") || version.contains("WSL2") {
                "WSL2"
            } else {
                "WSL1"
            };
            return Ok((Os::Wsl, Some(flavor.into())));
        }

        let release = OsRelease::from(self.read_marker("etc/os-release").as_str());
        if release.is_ubuntu() {
            return Ok((Os::UbuntuServer, release.version_id));
        }

        let name = release.id.unwrap_or_else(|| "unknown".into());
        Err(ProbeError::UnsupportedPlatform(format!("linux ({name})")))
    }

    fn read_marker(&self, relative: &str) -> String {
        read_to_string(self.root.join(relative)).unwrap_or_default()
    }
}

fn is_wsl_marker(marker: &str) -> bool {
    let marker = marker.to_ascii_lowercase();
    marker.contains("microsoft") || marker.contains("wsl")
}

/// Minimal view of `/etc/os-release`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct OsRelease {
    id: Option<String>,
    id_like: Option<String>,
    version_id: Option<String>,
}

impl OsRelease {
    fn is_ubuntu(&self) -> bool {
        self.id.as_deref() == Some("ubuntu")
            || self
                .id_like
                .as_deref()
                .is_some_and(|like| like.split_whitespace().any(|id| id == "ubuntu"))
    }
}

impl From<&str> for OsRelease {
    fn from(content: &str) -> Self {
        let mut release = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "ID" => release.id = Some(value),
                "ID_LIKE" => release.id_like = Some(value),
                "VERSION_ID" => release.version_id = Some(value),
                _ => continue,
            }
        }

        release
    }
}

/// Platform detection error types.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Host does not match any supported platform.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

/// Friendly result alias :3
type Result<T, E = ProbeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::fs::{create_dir_all, write};

    fn fake_root(files: &[(&str, &str)]) -> anyhow::Result<tempfile::TempDir> {
        let root = tempfile::tempdir()?;
        for (path, content) in files {
            let path = root.path().join(path);
            create_dir_all(path.parent().unwrap())?;
            write(path, content)?;
        }

        Ok(root)
    }

    const UBUNTU_RELEASE: &str = indoc! {r#"
        NAME="Ubuntu"
        VERSION_ID="24.04"
        ID=ubuntu
        ID_LIKE=debian
    "#};

    #[test]
    fn wsl_marker_wins_over_ubuntu_release_file() -> anyhow::Result<()> {
        let root = fake_root(&[
            ("proc/sys/kernel/osrelease", "5.15.153.1-microsoft-standard-WSL2"),
            ("etc/os-release", UBUNTU_RELEASE),
        ])?;

        let info = Probe::new(root.path(), "linux").detect()?;
        assert_eq!(info.os, Os::Wsl);
        assert_eq!(info.variant.as_deref(), Some("WSL2"));
        assert_eq!(info.package_manager, PackageManagerKind::Apt);

        Ok(())
    }

    #[test]
    fn ubuntu_release_file_detects_server() -> anyhow::Result<()> {
        let root = fake_root(&[
            ("proc/sys/kernel/osrelease", "6.8.0-45-generic"),
            ("etc/os-release", UBUNTU_RELEASE),
        ])?;

        let info = Probe::new(root.path(), "linux").detect()?;
        assert_eq!(info.os, Os::UbuntuServer);
        assert_eq!(info.variant.as_deref(), Some("24.04"));

        Ok(())
    }

    #[test]
    fn unknown_linux_is_unsupported() -> anyhow::Result<()> {
        let root = fake_root(&[("etc/os-release", "ID=fedora\n")])?;

        let result = Probe::new(root.path(), "linux").detect();
        assert!(matches!(result, Err(ProbeError::UnsupportedPlatform(_))));

        Ok(())
    }

    #[test]
    fn kernel_name_detects_macos_and_windows() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;

        let info = Probe::new(root.path(), "macos").detect()?;
        assert_eq!(info.os, Os::MacOs);
        assert_eq!(info.package_manager, PackageManagerKind::Homebrew);

        let info = Probe::new(root.path(), "windows").detect()?;
        assert_eq!(info.os, Os::Windows);
        assert_eq!(info.package_manager, PackageManagerKind::Chocolatey);

        let result = Probe::new(root.path(), "freebsd").detect();
        assert!(matches!(result, Err(ProbeError::UnsupportedPlatform(_))));

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn has_command_searches_executables_only() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let bin = fake_root(&[("brew", "#!/bin/sh\n"), ("notes", "plain\n")])?;
        let brew = bin.path().join("brew");
        std::fs::set_permissions(&brew, std::fs::Permissions::from_mode(0o755))?;

        let info = PlatformInfo::new(Os::MacOs, None)
            .with_search_path(vec![bin.path().to_path_buf()]);
        assert!(info.has_command("brew"));
        assert!(info.has_package_manager());
        assert!(!info.has_command("notes"));
        assert!(!info.has_command("apt-get"));

        Ok(())
    }
}
