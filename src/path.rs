// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way, e.g., the default manifest, the
//! persisted run summary, and the append-only log stream.

use std::path::PathBuf;

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Determine default absolute path to state directory.
///
/// Uses XDG Base Directory path `$XDG_DATA_HOME/converge` as the place to
/// keep the run summary and log stream. Does not check if the path returned
/// actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_state_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|path| path.join("converge"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to the manifest of desired state items.
///
/// Uses `$XDG_CONFIG_HOME/converge/manifest.toml`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_manifest_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("converge").join("manifest.toml"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to the persisted run summary.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_report_path() -> Result<PathBuf> {
    default_state_dir().map(|path| path.join("last-run.txt"))
}

/// Determine default absolute path to the append-only log stream.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_log_path() -> Result<PathBuf> {
    default_state_dir().map(|path| path.join("converge.log"))
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[cfg(target_os = "linux")]
    #[sealed_test(env = [("XDG_DATA_HOME", "/tmp/blah/data")])]
    fn state_paths_follow_xdg_data_home() -> anyhow::Result<()> {
        assert_eq!(default_state_dir()?, PathBuf::from("/tmp/blah/data/converge"));
        assert_eq!(
            default_report_path()?,
            PathBuf::from("/tmp/blah/data/converge/last-run.txt")
        );
        assert_eq!(
            default_log_path()?,
            PathBuf::from("/tmp/blah/data/converge/converge.log")
        );

        Ok(())
    }
}
