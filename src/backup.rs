// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backup of files about to be overwritten.
//!
//! Before any mutating action touches an existing file, a copy of that file is
//! written alongside it as `<path>.backup.<UTC timestamp>`. Backups are never
//! deleted, and never overwritten: if a backup with the same timestamp already
//! exists, a numeric suffix is appended until the name is unique.
//!
//! Only regular files are backed up. Symbolic links are skipped so that a
//! dotfile linked into some other tree is not duplicated as a full copy.

use chrono::{DateTime, Utc};
use std::{
    ffi::OsString,
    fs::{remove_file, symlink_metadata, File, OpenOptions, Permissions},
    io::{copy, ErrorKind, Read},
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// Format of the timestamp appended to backup file names.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Record of one backup copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Layer of indirection for taking backups.
pub trait Backup: Send + Sync {
    /// Back up file at path if it is an existing regular file.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError`] if the copy could not be made. Callers must
    ///   not proceed with their mutation in that case.
    fn backup(&self, path: &Path) -> Result<Option<BackupRecord>>;
}

/// Back up files as timestamped sibling copies.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileBackups;

impl FileBackups {
    pub fn new() -> Self {
        Self
    }

    /// Back up file at path as of a given time.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::Inspect`] if the file's metadata cannot be read.
    /// - Return [`BackupError::Copy`] if the backup copy cannot be made.
    pub fn backup_at(&self, path: &Path, now: DateTime<Utc>) -> Result<Option<BackupRecord>> {
        let metadata = match symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(BackupError::Inspect {
                    source: err,
                    path: path.to_path_buf(),
                })
            }
        };

        // INVARIANT: Only regular files get backed up, never links.
        if !metadata.is_file() {
            return Ok(None);
        }

        let mut original = File::open(path).map_err(|err| BackupError::Copy {
            source: err,
            path: path.to_path_buf(),
            backup_path: backup_path(path, now),
        })?;
        let backup_path = write_backup(&mut original, path, now, metadata.permissions())?;

        info!("backed up {} to {}", path.display(), backup_path.display());

        Ok(Some(BackupRecord {
            original_path: path.to_path_buf(),
            backup_path,
            created_at: now,
        }))
    }
}

impl Backup for FileBackups {
    #[instrument(skip(self), level = "debug")]
    fn backup(&self, path: &Path) -> Result<Option<BackupRecord>> {
        self.backup_at(path, Utc::now())
    }
}

/// Name of backup for path at a given time.
pub fn backup_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".backup.{}", now.format(BACKUP_TIMESTAMP_FORMAT)));
    PathBuf::from(name)
}

/// Copy reader into a fresh backup of path.
///
/// A backup that could not be fully written is removed, so every file that
/// looks like a backup holds a complete copy.
fn write_backup(
    original: &mut impl Read,
    path: &Path,
    now: DateTime<Utc>,
    permissions: Permissions,
) -> Result<PathBuf> {
    let (mut backup, backup_path) = create_unique(path, now)?;
    let copied = copy(original, &mut backup)
        .and_then(|_| backup.set_permissions(permissions))
        .and_then(|_| backup.sync_all());

    if let Err(err) = copied {
        drop(backup);
        if let Err(cleanup) = remove_file(&backup_path) {
            warn!(
                "failed to remove partial backup {}: {cleanup}",
                backup_path.display()
            );
        }
        return Err(BackupError::Copy {
            source: err,
            path: path.to_path_buf(),
            backup_path,
        });
    }

    Ok(backup_path)
}

fn create_unique(path: &Path, now: DateTime<Utc>) -> Result<(File, PathBuf)> {
    let base = backup_path(path, now);
    let mut candidate = base.clone();
    let mut suffix = 0;

    loop {
        // INVARIANT: Never overwrite a prior backup.
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((file, candidate)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                suffix += 1;
                let mut name: OsString = base.as_os_str().to_owned();
                name.push(format!("-{suffix}"));
                candidate = PathBuf::from(name);
            }
            Err(err) => {
                return Err(BackupError::Copy {
                    source: err,
                    path: path.to_path_buf(),
                    backup_path: candidate,
                })
            }
        }
    }
}

/// Backup error types.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// File to back up cannot be inspected.
    #[error("failed to inspect {:?} for backup", path.display())]
    Inspect {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Backup copy cannot be made.
    #[error("failed to back up {:?} to {:?}", path.display(), backup_path.display())]
    Copy {
        #[source]
        source: std::io::Error,
        path: PathBuf,
        backup_path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = BackupError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::fs::{read_to_string, write};

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap()
    }

    #[test]
    fn backup_copies_regular_file_with_timestamp() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".bashrc");
        write(&path, "Y")?;

        let record = FileBackups::new()
            .backup_at(&path, fixed_time())?
            .expect("regular file should be backed up");

        assert_eq!(record.original_path, path);
        assert_eq!(
            record.backup_path,
            dir.path().join(".bashrc.backup.20250314T150926Z")
        );
        assert_eq!(read_to_string(&record.backup_path)?, "Y");
        assert_eq!(read_to_string(&path)?, "Y");

        Ok(())
    }

    #[test]
    fn backup_never_overwrites_prior_backup() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".zshrc");
        write(&path, "first")?;
        let first = FileBackups::new().backup_at(&path, fixed_time())?.unwrap();

        write(&path, "second")?;
        let second = FileBackups::new().backup_at(&path, fixed_time())?.unwrap();

        assert_ne!(first.backup_path, second.backup_path);
        assert_eq!(read_to_string(&first.backup_path)?, "first");
        assert_eq!(read_to_string(&second.backup_path)?, "second");

        Ok(())
    }

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("device went away"))
        }
    }

    #[test]
    fn failed_copy_leaves_no_backup_behind() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".profile");
        write(&path, "original")?;
        let permissions = symlink_metadata(&path)?.permissions();

        let result = write_backup(&mut BrokenReader, &path, fixed_time(), permissions);
        assert!(matches!(result, Err(BackupError::Copy { .. })));
        assert!(!backup_path(&path, fixed_time()).exists());
        assert_eq!(read_to_string(&path)?, "original");

        Ok(())
    }

    #[test]
    fn missing_file_is_not_backed_up() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let result = FileBackups::new().backup(&dir.path().join("nope"))?;
        assert_eq!(result, None);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlink_is_not_backed_up() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("real");
        let link = dir.path().join("link");
        write(&target, "content")?;
        std::os::unix::fs::symlink(&target, &link)?;

        let result = FileBackups::new().backup(&link)?;
        assert_eq!(result, None);

        Ok(())
    }
}
