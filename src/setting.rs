// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! System settings.
//!
//! A setting is a key whose value is read back through the platform's native
//! mechanism: `defaults` on macOS, `reg` on Windows, `git config` anywhere,
//! or a pair of user supplied read and write commands for everything else.
//! Settings are considered applied once reading them back yields the desired
//! value.
//!
//! # Key Layout
//!
//! - `defaults`: `<domain>:<key>`, e.g., `com.apple.dock:autohide`.
//! - `registry`: `<key path>:<value name>`, e.g., `HKCU\Console:QuickEdit`.
//! - `git`: plain git configuration key, e.g., `user.name`.
//! - `command`: free form, substituted shell quoted for `{key}` in the commands.

use crate::{
    context::ExecutionContext,
    exec::{CommandOutput, CommandRunner, CommandSpec, ExecError},
    executor::{self, check_output, ActionError},
    path::home_dir,
};

use std::{borrow::Cow, path::PathBuf, sync::Arc};
use tracing::{debug, instrument};

/// Native mechanism used to read and write a setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingBackend {
    /// macOS user defaults.
    Defaults,

    /// Windows registry through `reg.exe`.
    Registry,

    /// Global git configuration.
    Git,

    /// User supplied shell commands. `{key}` and `{value}` are substituted
    /// as single shell words.
    Command { read: String, write: String },
}

impl SettingBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Defaults => "defaults",
            Self::Registry => "registry",
            Self::Git => "git",
            Self::Command { .. } => "command",
        }
    }

    /// Command that prints current value of setting.
    ///
    /// # Errors
    ///
    /// - Return [`SettingError::InvalidKey`] if key does not follow the
    ///   backend's layout.
    pub fn read_command(&self, key: &str) -> Result<CommandSpec> {
        let command = match self {
            Self::Defaults => {
                let (domain, name) = split_key(self, key)?;
                CommandSpec::new("defaults").args(["read", domain, name])
            }
            Self::Registry => {
                let (path, name) = split_key(self, key)?;
                CommandSpec::new("reg").args(["query", path, "/v", name])
            }
            Self::Git => CommandSpec::new("git").args(["config", "--global", "--get", key]),
            Self::Command { read, .. } => CommandSpec::shell(render(read, key, None)),
        };

        Ok(command)
    }

    /// Command that writes value of setting.
    ///
    /// # Errors
    ///
    /// - Return [`SettingError::InvalidKey`] if key does not follow the
    ///   backend's layout.
    pub fn write_command(
        &self,
        key: &str,
        value: &str,
        value_type: Option<&str>,
    ) -> Result<CommandSpec> {
        let command = match self {
            Self::Defaults => {
                let (domain, name) = split_key(self, key)?;
                let mut command = CommandSpec::new("defaults").args(["write", domain, name]);
                if let Some(value_type) = value_type {
                    command = command.arg(format!("-{value_type}"));
                }
                command.arg(value)
            }
            Self::Registry => {
                let (path, name) = split_key(self, key)?;
                CommandSpec::new("reg").args([
                    "add",
                    path,
                    "/v",
                    name,
                    "/t",
                    value_type.unwrap_or("REG_SZ"),
                    "/d",
                    value,
                    "/f",
                ])
            }
            Self::Git => CommandSpec::new("git").args(["config", "--global", key, value]),
            Self::Command { write, .. } => CommandSpec::shell(render(write, key, Some(value))),
        };

        Ok(command)
    }

    /// Parse current value out of read command output.
    ///
    /// # Errors
    ///
    /// - Return [`SettingError::Read`] if a user supplied read command fails.
    pub fn parse_read(&self, key: &str, output: &CommandOutput) -> Result<Option<String>> {
        match self {
            // INVARIANT: Non-zero exit means the setting is not set at all.
            Self::Defaults | Self::Git => Ok(output
                .success()
                .then(|| output.stdout.trim().to_string())),
            Self::Registry => {
                if !output.success() {
                    return Ok(None);
                }
                let (_, name) = split_key(self, key)?;
                Ok(parse_reg_query(name, &output.stdout))
            }
            Self::Command { .. } if output.success() => Ok(Some(output.stdout.trim().to_string())),
            Self::Command { .. } => Err(SettingError::Read {
                key: key.into(),
                message: output.message(),
            }),
        }
    }

    /// File that stores the setting, if there is one worth backing up.
    pub fn backing_file(&self, key: &str) -> Option<PathBuf> {
        match self {
            Self::Defaults => {
                let (domain, _) = key.split_once(':')?;
                let home = home_dir().ok()?;
                Some(
                    home.join("Library")
                        .join("Preferences")
                        .join(format!("{domain}.plist")),
                )
            }
            Self::Git => home_dir().ok().map(|home| home.join(".gitconfig")),
            Self::Registry | Self::Command { .. } => None,
        }
    }
}

/// Substitute quoted key and value into command template.
///
/// Placeholders are replaced in a single pass, so a key or value containing
/// `{value}` is never expanded twice.
fn render(template: &str, key: &str, value: Option<&str>) -> String {
    let mut script = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        script.push_str(&rest[..start]);
        let tail = &rest[start..];
        let substitute = if tail.starts_with("{key}") {
            Some(("{key}", key))
        } else {
            value
                .filter(|_| tail.starts_with("{value}"))
                .map(|value| ("{value}", value))
        };

        match substitute {
            Some((placeholder, text)) => {
                script.push_str(&shell_escape::escape(Cow::Borrowed(text)));
                rest = &tail[placeholder.len()..];
            }
            None => {
                script.push('{');
                rest = &tail[1..];
            }
        }
    }
    script.push_str(rest);

    script
}

fn split_key<'a>(backend: &SettingBackend, key: &'a str) -> Result<(&'a str, &'a str)> {
    key.rsplit_once(':')
        .filter(|(path, name)| !path.is_empty() && !name.is_empty())
        .ok_or_else(|| SettingError::InvalidKey {
            backend: backend.name(),
            key: key.into(),
        })
}

// INVARIANT: Value lines look like "    QuickEdit    REG_DWORD    0x1".
fn parse_reg_query(name: &str, stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if !fields.next()?.eq_ignore_ascii_case(name) {
            return None;
        }
        let _ = fields.next()?;
        Some(fields.collect::<Vec<_>>().join(" "))
    })
}

/// Compare desired value to value read back from the system.
///
/// Tolerates the lossy ways native tools echo values back: booleans read back
/// as "1" or "0", and registry numbers read back in hexadecimal.
pub fn values_match(desired: &str, current: &str) -> bool {
    let (desired, current) = (desired.trim(), current.trim());
    if desired == current {
        return true;
    }

    if let (Some(desired), Some(current)) = (parse_bool(desired), parse_bool(current)) {
        return desired == current;
    }

    if let (Some(desired), Some(current)) = (parse_number(desired), parse_number(current)) {
        return desired == current;
    }

    false
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn parse_number(value: &str) -> Option<i64> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Reads and writes settings through command runner.
#[derive(Clone)]
pub struct SettingStore {
    runner: Arc<dyn CommandRunner>,
}

impl SettingStore {
    /// Construct new setting store.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Read current value of setting, `None` if unset.
    ///
    /// # Errors
    ///
    /// - Return [`SettingError`] if the setting cannot be read.
    #[instrument(skip(self, backend, ctx), fields(backend = backend.name()), level = "debug")]
    pub async fn read(
        &self,
        backend: &SettingBackend,
        key: &str,
        ctx: &ExecutionContext,
    ) -> Result<Option<String>> {
        let command = backend.read_command(key)?;
        let output = self
            .runner
            .run(&command, ctx)
            .await
            .map_err(|err| SettingError::Exec {
                source: err,
                key: key.into(),
            })?;
        let value = backend.parse_read(key, &output)?;
        debug!("{key} reads back {value:?}");

        Ok(value)
    }

    /// Write value of setting.
    ///
    /// # Errors
    ///
    /// - Return [`ActionError`] classified from the command's failure.
    #[instrument(skip(self, backend, ctx), fields(backend = backend.name()), level = "debug")]
    pub async fn write(
        &self,
        backend: &SettingBackend,
        key: &str,
        value: &str,
        value_type: Option<&str>,
        ctx: &ExecutionContext,
    ) -> executor::Result<String> {
        let command = backend
            .write_command(key, value, value_type)
            .map_err(|err| ActionError::fatal(err.to_string()))?;
        let output = self
            .runner
            .run(&command, ctx)
            .await
            .map_err(|err| ActionError::from_exec(&err))?;

        check_output(&command, output)
    }
}

impl std::fmt::Debug for SettingStore {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("SettingStore").finish_non_exhaustive()
    }
}

/// Setting error types.
#[derive(Debug, thiserror::Error)]
pub enum SettingError {
    /// Key does not follow backend key layout.
    #[error("invalid {backend} setting key {key:?}")]
    InvalidKey { backend: &'static str, key: String },

    /// Read command cannot be run.
    #[error("failed to read setting {key:?}")]
    Exec {
        #[source]
        source: ExecError,
        key: String,
    },

    /// Read command ran but failed.
    #[error("failed to read setting {key:?}: {message}")]
    Read { key: String, message: String },
}

/// Friendly result alias :3
pub type Result<T, E = SettingError> = std::result::Result<T, E>;
