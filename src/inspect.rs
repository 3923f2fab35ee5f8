// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! State inspection.
//!
//! Determine whether the host already satisfies a desired state item. Every
//! inspection is read-only and computed fresh: nothing is cached between
//! inspections, because idempotence depends on looking at the system again
//! every single time.
//!
//! # Satisfaction Rules
//!
//! - Package: the package manager reports the package installed, and the
//!   installed version meets the version requirement if one was given.
//! - File content: the file exists and the SHA-256 digest of its content
//!   equals the desired digest. Existence alone is not enough.
//! - Setting: reading the setting back yields the desired value.
//!
//! If reading the current state fails, the item counts as unsatisfied and
//! the error is surfaced as its current value.

use crate::{
    action::{InstallPackage, WriteFile, WriteSetting},
    context::ExecutionContext,
    executor::MutatingAction,
    item::{DesiredStateItem, InspectionResult, ItemSpec},
    package::{version_satisfies, PackageManager},
    setting::{values_match, SettingStore},
};

use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Compute SHA-256 hex digest of content.
pub fn content_hash(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    hex::encode(hasher.finalize())
}

/// Compute SHA-256 hex digest of file content.
///
/// # Errors
///
/// - Return [`std::io::Error`] if file cannot be read.
pub async fn file_hash(path: impl AsRef<Path>) -> std::io::Result<String> {
    let content = tokio::fs::read(path.as_ref()).await?;
    Ok(content_hash(content))
}

/// Layer of indirection between the reconciliation loop and the host.
///
/// Knows how to inspect an item, which file an item would overwrite, and how
/// to build the mutating action that applies an item.
pub trait StateProvider: Send + Sync {
    /// Inspect item without mutating anything.
    fn inspect<'a>(
        &'a self,
        item: &'a DesiredStateItem,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, InspectionResult>;

    /// File that applying the item would overwrite.
    fn backup_target(&self, item: &DesiredStateItem) -> Option<PathBuf>;

    /// Mutating action that applies the item.
    fn action<'a>(&'a self, item: &'a DesiredStateItem) -> Box<dyn MutatingAction + 'a>;
}

/// The real host, driven through its package manager, file system, and
/// native setting tools.
#[derive(Debug, Clone)]
pub struct HostState {
    packages: PackageManager,
    settings: SettingStore,
}

impl HostState {
    /// Construct new host state.
    pub fn new(packages: PackageManager, settings: SettingStore) -> Self {
        Self { packages, settings }
    }

    async fn inspect_package(
        &self,
        name: &str,
        item: &DesiredStateItem,
        ctx: &ExecutionContext,
    ) -> InspectionResult {
        let requirement = match &item.spec {
            ItemSpec::Package { version, .. } => version.as_ref(),
            _ => None,
        };

        match self.packages.installed_version(name, ctx).await {
            Ok(Some(version)) if version_satisfies(&version, requirement) => {
                InspectionResult::satisfied(version)
            }
            Ok(Some(version)) => InspectionResult::unsatisfied(version),
            Ok(None) => InspectionResult::unsatisfied("<not installed>"),
            Err(err) => InspectionResult::read_error(error_chain(&err)),
        }
    }

    async fn inspect_file(&self, path: &Path, content: &str, mode: Option<u32>) -> InspectionResult {
        let current = match file_hash(path).await {
            Ok(hash) => hash,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return InspectionResult::unsatisfied("<missing>")
            }
            Err(err) => return InspectionResult::read_error(err),
        };

        let hash_matches = current == content_hash(content);
        let current_mode = match file_mode(path).await {
            Ok(current_mode) => current_mode,
            Err(err) => return InspectionResult::read_error(err),
        };
        let mode_matches = match (mode, current_mode) {
            (Some(mode), Some(current_mode)) => mode & 0o7777 == current_mode & 0o7777,
            _ => true,
        };

        let current = match current_mode {
            Some(current_mode) if mode.is_some() => {
                format!("sha256:{current} mode {:o}", current_mode & 0o7777)
            }
            _ => format!("sha256:{current}"),
        };

        if hash_matches && mode_matches {
            InspectionResult::satisfied(current)
        } else {
            InspectionResult::unsatisfied(current)
        }
    }

    async fn inspect_setting(&self, item: &DesiredStateItem, ctx: &ExecutionContext) -> InspectionResult {
        let ItemSpec::Setting {
            backend, key, value, ..
        } = &item.spec
        else {
            return InspectionResult::read_error("not a setting");
        };

        match self.settings.read(backend, key, ctx).await {
            Ok(Some(current)) if values_match(value, &current) => {
                InspectionResult::satisfied(current)
            }
            Ok(Some(current)) => InspectionResult::unsatisfied(current),
            Ok(None) => InspectionResult::unsatisfied("<unset>"),
            Err(err) => InspectionResult::read_error(error_chain(&err)),
        }
    }
}

impl StateProvider for HostState {
    fn inspect<'a>(
        &'a self,
        item: &'a DesiredStateItem,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, InspectionResult> {
        Box::pin(inspect_host(self, item, ctx))
    }

    fn backup_target(&self, item: &DesiredStateItem) -> Option<PathBuf> {
        match &item.spec {
            ItemSpec::Package { .. } => None,
            ItemSpec::FileContent { path, .. } => Some(path.clone()),
            ItemSpec::Setting {
                backend, key, file, ..
            } => file.clone().or_else(|| backend.backing_file(key)),
        }
    }

    fn action<'a>(&'a self, item: &'a DesiredStateItem) -> Box<dyn MutatingAction + 'a> {
        match &item.spec {
            ItemSpec::Package { name, .. } => {
                Box::new(InstallPackage::new(&item.id, name, &self.packages))
            }
            ItemSpec::FileContent {
                path,
                content,
                mode,
            } => Box::new(WriteFile::new(&item.id, path, content, *mode)),
            ItemSpec::Setting {
                backend,
                key,
                value,
                value_type,
                ..
            } => Box::new(WriteSetting::new(
                &item.id,
                backend,
                key,
                value,
                value_type.as_deref(),
                &self.settings,
            )),
        }
    }
}

#[instrument(skip(host, item, ctx), fields(item = %item.id), level = "debug")]
async fn inspect_host(
    host: &HostState,
    item: &DesiredStateItem,
    ctx: &ExecutionContext,
) -> InspectionResult {
    let result = match &item.spec {
        ItemSpec::Package { name, .. } => host.inspect_package(name, item, ctx).await,
        ItemSpec::FileContent {
            path,
            content,
            mode,
        } => host.inspect_file(path, content, *mode).await,
        ItemSpec::Setting { .. } => host.inspect_setting(item, ctx).await,
    };
    debug!(
        "{} satisfied = {}, current = {}",
        item.id, result.satisfied, result.current_value
    );

    result
}

#[cfg(unix)]
async fn file_mode(path: &Path) -> std::io::Result<Option<u32>> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = tokio::fs::metadata(path).await?;
    Ok(Some(metadata.permissions().mode()))
}

#[cfg(not(unix))]
async fn file_mode(_path: &Path) -> std::io::Result<Option<u32>> {
    Ok(None)
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut chain = vec![error.to_string()];
    let mut source = error.source();
    while let Some(err) = source {
        chain.push(err.to_string());
        source = err.source();
    }
    chain.join(": ")
}
