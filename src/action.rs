// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mutating actions that apply desired state items.
//!
//! Each action performs exactly one attempt when run. Retrying is left to the
//! [`RetryExecutor`](crate::executor::RetryExecutor), so actions only need to
//! classify their failures as transient or fatal.

use crate::{
    context::ExecutionContext,
    executor::{ActionError, MutatingAction, Result},
    package::PackageManager,
    setting::{SettingBackend, SettingStore},
};

use futures::future::BoxFuture;
use std::{
    ffi::OsString,
    fs::Permissions,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Install or upgrade a package.
#[derive(Debug)]
pub struct InstallPackage<'a> {
    id: &'a str,
    name: &'a str,
    packages: &'a PackageManager,
}

impl<'a> InstallPackage<'a> {
    pub fn new(id: &'a str, name: &'a str, packages: &'a PackageManager) -> Self {
        Self { id, name, packages }
    }
}

impl MutatingAction for InstallPackage<'_> {
    fn id(&self) -> &str {
        self.id
    }

    fn run<'b>(&'b self, ctx: &'b ExecutionContext) -> BoxFuture<'b, Result<String>> {
        Box::pin(self.packages.install(self.name, ctx))
    }
}

/// Write exact content to a file.
///
/// Content is written to a temporary sibling file first and then renamed over
/// the target, so the target never holds partial content. If the target is a
/// symbolic link, the link itself gets replaced rather than written through.
#[derive(Debug)]
pub struct WriteFile<'a> {
    id: &'a str,
    path: &'a Path,
    content: &'a str,
    mode: Option<u32>,
}

impl<'a> WriteFile<'a> {
    pub fn new(id: &'a str, path: &'a Path, content: &'a str, mode: Option<u32>) -> Self {
        Self {
            id,
            path,
            content,
            mode,
        }
    }

    #[instrument(skip(self), fields(path = %self.path.display()), level = "debug")]
    async fn write(&self) -> Result<String> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            if let Some(created) = mkdirp::mkdirp(parent).map_err(|err| io_error(parent, &err))? {
                debug!("created directory {}", created.display());
            }
        }

        let staging = staging_path(self.path);
        tokio::fs::write(&staging, self.content.as_bytes())
            .await
            .map_err(|err| io_error(&staging, &err))?;

        let permissions = match self.mode {
            Some(mode) => mode_permissions(mode),
            None => existing_permissions(self.path).await,
        };
        if let Some(permissions) = permissions {
            if let Err(err) = tokio::fs::set_permissions(&staging, permissions).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(io_error(&staging, &err));
            }
        }

        if let Err(err) = tokio::fs::rename(&staging, self.path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(io_error(self.path, &err));
        }

        Ok(format!(
            "wrote {} bytes to {}",
            self.content.len(),
            self.path.display()
        ))
    }
}

impl MutatingAction for WriteFile<'_> {
    fn id(&self) -> &str {
        self.id
    }

    fn run<'b>(&'b self, _ctx: &'b ExecutionContext) -> BoxFuture<'b, Result<String>> {
        Box::pin(self.write())
    }
}

/// Write a setting through its native mechanism.
#[derive(Debug)]
pub struct WriteSetting<'a> {
    id: &'a str,
    backend: &'a SettingBackend,
    key: &'a str,
    value: &'a str,
    value_type: Option<&'a str>,
    settings: &'a SettingStore,
}

impl<'a> WriteSetting<'a> {
    pub fn new(
        id: &'a str,
        backend: &'a SettingBackend,
        key: &'a str,
        value: &'a str,
        value_type: Option<&'a str>,
        settings: &'a SettingStore,
    ) -> Self {
        Self {
            id,
            backend,
            key,
            value,
            value_type,
            settings,
        }
    }
}

impl MutatingAction for WriteSetting<'_> {
    fn id(&self) -> &str {
        self.id
    }

    fn run<'b>(&'b self, ctx: &'b ExecutionContext) -> BoxFuture<'b, Result<String>> {
        Box::pin(
            self.settings
                .write(self.backend, self.key, self.value, self.value_type, ctx),
        )
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(".converge-tmp");
    path.with_file_name(name)
}

fn io_error(path: &Path, err: &std::io::Error) -> ActionError {
    let mut error = ActionError::from_io(err);
    error.message = format!("{}: {}", path.display(), error.message);
    error
}

/// Permissions of a regular file about to be replaced, so a rewrite never
/// widens access to it.
async fn existing_permissions(path: &Path) -> Option<Permissions> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_file() => Some(metadata.permissions()),
        _ => None,
    }
}

#[cfg(unix)]
fn mode_permissions(mode: u32) -> Option<Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn mode_permissions(_mode: u32) -> Option<Permissions> {
    None
}
