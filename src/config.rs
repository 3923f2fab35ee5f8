// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Manifest layout.
//!
//! Specify the layout of the manifest that lists desired state items, to
//! simplify serialization and deserialization. Reading the manifest file is
//! left to the caller. Only file item `source` paths are read here, because
//! they are resolved relative to wherever the manifest lives.
//!
//! # General Layout
//!
//! A manifest is composed of two basic parts: settings and items. Settings
//! define how items get applied: retry policy, privilege elevation, and
//! environment overrides. Items form one ordered array of tables tagged by
//! `kind`, so declaration order is kept across packages, files, and settings.
//!
//! ```toml
//! [settings]
//! max_attempts = 3
//! retry_delay_ms = 2000
//! backoff = "linear"
//! elevate = true
//!
//! [[item]]
//! kind = "package"
//! name = "git"
//! version = ">=2.30"
//! platforms = ["macos", "ubuntu-server", "wsl"]
//!
//! [[item]]
//! kind = "file"
//! path = "~/.zshrc"
//! source = "zsh/zshrc"
//!
//! [[item]]
//! kind = "setting"
//! backend = "defaults"
//! key = "com.apple.dock:autohide"
//! value = "1"
//! type = "bool"
//! ```

use crate::{
    context::{ExecutionContext, Privilege},
    executor::{Backoff, RetryPolicy},
    item::{DesiredStateItem, ItemSpec, PlatformScope},
    platform::Os,
    setting::SettingBackend,
};

use semver::VersionReq;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::warn;

/// Manifest of desired state.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Manifest {
    /// Settings for applying items.
    #[serde(default)]
    pub settings: ManifestSettings,

    /// Ordered listing of desired state items.
    #[serde(default, rename = "item", skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ManifestItem>,
}

impl Manifest {
    /// Retry policy for mutating actions.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.settings.max_attempts,
            Duration::from_millis(self.settings.retry_delay_ms),
            self.settings.backoff,
        )
    }

    /// Execution context handed to every mutating action.
    pub fn execution_context(&self) -> ExecutionContext {
        let privilege = if self.settings.elevate {
            Privilege::Sudo {
                askpass: self.settings.askpass.clone(),
            }
        } else {
            Privilege::User
        };

        let mut ctx = ExecutionContext::new().with_privilege(privilege);
        for (key, value) in &self.settings.env {
            ctx = ctx.with_env(key, value);
        }
        for dir in &self.settings.path {
            ctx = ctx.with_path_prepend(dir);
        }

        ctx
    }

    /// Override of where the run summary gets persisted.
    pub fn report_path(&self) -> Option<&Path> {
        self.settings.report.as_deref()
    }

    /// Build desired state items in declaration order.
    ///
    /// File item `source` paths are read relative to `base_dir`, which should
    /// be the directory holding the manifest.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Source`] if a `source` file cannot be read.
    /// - Return [`ConfigError::InvalidVersion`] if a version requirement does
    ///   not parse.
    pub fn desired_items(&self, base_dir: impl AsRef<Path>) -> Result<Vec<DesiredStateItem>> {
        let base_dir = base_dir.as_ref();
        self.items
            .iter()
            .map(|item| item.to_desired(base_dir))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.settings.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }

        let mut ids = HashSet::new();
        let mut files: HashMap<&Path, &str> = HashMap::new();
        for item in &self.items {
            let id = item.id();
            if !ids.insert(id) {
                return Err(ConfigError::DuplicateId(id.into()));
            }

            match item {
                ManifestItem::Package(package) => {
                    package.requirement()?;
                }
                ManifestItem::File(file) => {
                    if file.content.is_some() == file.source.is_some() {
                        return Err(ConfigError::FileContent(id.into()));
                    }

                    // INVARIANT: Two items writing one file is allowed, but suspicious.
                    if let Some(other) = files.insert(file.path.as_path(), id) {
                        warn!(
                            "items {other} and {id} both target {}",
                            file.path.display()
                        );
                    }
                }
                ManifestItem::Setting(setting) => {
                    setting.backend()?;
                }
            }
        }

        Ok(())
    }

    fn expand(&mut self) -> Result<()> {
        if let Some(report) = &self.settings.report {
            self.settings.report = Some(expand_path(report)?);
        }
        if let Some(askpass) = &self.settings.askpass {
            self.settings.askpass = Some(expand_path(askpass)?);
        }
        for dir in self.settings.path.iter_mut() {
            *dir = expand_path(dir)?;
        }

        for item in self.items.iter_mut() {
            // INVARIANT: Default ids use paths as written, before expansion.
            item.fill_id();
            match item {
                ManifestItem::Package(_) => {}
                ManifestItem::File(file) => {
                    file.path = expand_path(&file.path)?;
                    if let Some(source) = &file.source {
                        file.source = Some(expand_path(source)?);
                    }
                }
                ManifestItem::Setting(setting) => {
                    if let Some(file) = &setting.file {
                        setting.file = Some(expand_path(file)?);
                    }
                }
            }
        }

        Ok(())
    }
}

impl FromStr for Manifest {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut manifest: Manifest = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;
        manifest.expand()?;
        manifest.validate()?;

        Ok(manifest)
    }
}

impl Display for Manifest {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let expanded = shellexpand::full(path.to_string_lossy().as_ref())
        .map_err(ConfigError::ShellExpansion)?
        .into_owned();

    Ok(PathBuf::from(expanded))
}

/// Settings for applying items.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ManifestSettings {
    /// Total attempts per mutating action, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,

    /// Run privileged commands through non-interactive sudo.
    #[serde(default)]
    pub elevate: bool,

    /// Askpass helper handed to sudo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub askpass: Option<PathBuf>,

    /// Where to persist the run summary instead of the state directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<PathBuf>,

    /// Directories searched before the inherited `PATH`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<PathBuf>,

    /// Environment overrides for every command.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Default for ManifestSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff: Backoff::default(),
            elevate: false,
            askpass: None,
            report: None,
            path: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn is_false(value: &bool) -> bool {
    !value
}

/// One desired state item, tagged by kind.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ManifestItem {
    Package(PackageEntry),
    File(FileEntry),
    Setting(SettingEntry),
}

impl ManifestItem {
    /// Identifier of item, explicit or derived from its target.
    pub fn id(&self) -> &str {
        let id = match self {
            Self::Package(package) => &package.id,
            Self::File(file) => &file.id,
            Self::Setting(setting) => &setting.id,
        };
        id.as_deref().unwrap_or_default()
    }

    fn fill_id(&mut self) {
        match self {
            Self::Package(package) => {
                package.id.get_or_insert_with(|| format!("package:{}", package.name));
            }
            Self::File(file) => {
                file.id
                    .get_or_insert_with(|| format!("file:{}", file.path.display()));
            }
            Self::Setting(setting) => {
                setting
                    .id
                    .get_or_insert_with(|| format!("setting:{}:{}", setting.backend, setting.key));
            }
        }
    }

    fn to_desired(&self, base_dir: &Path) -> Result<DesiredStateItem> {
        let (spec, platforms, fatal) = match self {
            Self::Package(package) => (
                ItemSpec::Package {
                    name: package.name.clone(),
                    version: package.requirement()?,
                },
                &package.platforms,
                package.fatal,
            ),
            Self::File(file) => (
                ItemSpec::FileContent {
                    path: file.path.clone(),
                    content: file.content(base_dir)?,
                    mode: file.mode,
                },
                &file.platforms,
                file.fatal,
            ),
            Self::Setting(setting) => (
                ItemSpec::Setting {
                    backend: setting.backend()?,
                    key: setting.key.clone(),
                    value: setting.value.clone(),
                    value_type: setting.value_type.clone(),
                    file: setting.file.clone(),
                },
                &setting.platforms,
                setting.fatal,
            ),
        };

        Ok(DesiredStateItem::new(self.id(), spec)
            .with_scope(PlatformScope::only(platforms.iter().copied()))
            .with_fatal(fatal))
    }
}

/// Package that must be installed.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct PackageEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    /// Semantic version requirement, e.g., ">=2.30".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<Os>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub fatal: bool,
}

impl PackageEntry {
    fn requirement(&self) -> Result<Option<VersionReq>> {
        self.version
            .as_deref()
            .map(|version| {
                VersionReq::parse(version).map_err(|err| ConfigError::InvalidVersion {
                    source: err,
                    name: self.name.clone(),
                })
            })
            .transpose()
    }
}

/// File that must hold exact content.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct FileEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub path: PathBuf,

    /// Inline content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// File holding content, relative to the manifest's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,

    /// Unix permission bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<Os>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub fatal: bool,
}

impl FileEntry {
    fn content(&self, base_dir: &Path) -> Result<String> {
        match (&self.content, &self.source) {
            (Some(content), _) => Ok(content.clone()),
            (None, Some(source)) => {
                let path = base_dir.join(source);
                std::fs::read_to_string(&path).map_err(|err| ConfigError::Source {
                    source: err,
                    path,
                })
            }
            (None, None) => Err(ConfigError::FileContent(
                self.id.clone().unwrap_or_default(),
            )),
        }
    }
}

/// Names of setting backends.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendName {
    Defaults,
    Registry,
    Git,
    Command,
}

impl Display for BackendName {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Defaults => "defaults",
            Self::Registry => "registry",
            Self::Git => "git",
            Self::Command => "command",
        };
        fmt.write_str(name)
    }
}

/// Setting that must read back a given value.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SettingEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub backend: BackendName,
    pub key: String,
    pub value: String,

    /// Type hint for writing, e.g., "bool" or "REG_DWORD".
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,

    /// Command printing current value. Command backend only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<String>,

    /// Command writing `{value}`. Command backend only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<String>,

    /// Backing file to back up before writing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<Os>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub fatal: bool,
}

impl SettingEntry {
    fn backend(&self) -> Result<SettingBackend> {
        let backend = match self.backend {
            BackendName::Defaults => SettingBackend::Defaults,
            BackendName::Registry => SettingBackend::Registry,
            BackendName::Git => SettingBackend::Git,
            BackendName::Command => match (&self.read, &self.write) {
                (Some(read), Some(write)) => SettingBackend::Command {
                    read: read.clone(),
                    write: write.clone(),
                },
                _ => return Err(ConfigError::MissingCommand(self.key.clone())),
            },
        };

        Ok(backend)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Two items share one identifier.
    #[error("duplicate item id {0:?}")]
    DuplicateId(String),

    /// Maximum attempts of zero would never run anything.
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    /// Version requirement does not parse.
    #[error("invalid version requirement for package {name:?}")]
    InvalidVersion {
        #[source]
        source: semver::Error,
        name: String,
    },

    /// File item needs exactly one of content or source.
    #[error("file item {0:?} needs exactly one of content or source")]
    FileContent(String),

    /// Content source file cannot be read.
    #[error("failed to read content source {:?}", path.display())]
    Source {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Command backend without both of its commands.
    #[error("command setting {0:?} needs both read and write commands")]
    MissingCommand(String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemKind;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("HOME", "/home/blah")])]
    fn deserialize_manifest() -> anyhow::Result<()> {
        let result: Manifest = indoc! {r#"
            [settings]
            max_attempts = 5
            backoff = "fixed"
            elevate = true

            [settings.env]
            HOMEBREW_NO_AUTO_UPDATE = "1"

            [[item]]
            kind = "package"
            name = "git"
            version = ">=2.30"
            platforms = ["macos", "wsl"]
            fatal = true

            [[item]]
            kind = "file"
            path = "~/.bashrc"
            content = "X"
            mode = 0o644

            [[item]]
            kind = "setting"
            backend = "git"
            key = "user.name"
            value = "blah"
        "#}
        .parse()?;

        assert_eq!(result.settings.max_attempts, 5);
        assert_eq!(result.settings.retry_delay_ms, 2000);
        assert_eq!(result.settings.backoff, Backoff::Fixed);
        assert_eq!(
            result.items,
            vec![
                ManifestItem::Package(PackageEntry {
                    id: Some("package:git".into()),
                    name: "git".into(),
                    version: Some(">=2.30".into()),
                    platforms: vec![Os::MacOs, Os::Wsl],
                    fatal: true,
                }),
                ManifestItem::File(FileEntry {
                    id: Some("file:~/.bashrc".into()),
                    path: "/home/blah/.bashrc".into(),
                    content: Some("X".into()),
                    mode: Some(0o644),
                    ..Default::default()
                }),
                ManifestItem::Setting(SettingEntry {
                    id: Some("setting:git:user.name".into()),
                    backend: BackendName::Git,
                    key: "user.name".into(),
                    value: "blah".into(),
                    value_type: None,
                    read: None,
                    write: None,
                    file: None,
                    platforms: vec![],
                    fatal: false,
                }),
            ]
        );

        let ctx = result.execution_context();
        assert_eq!(ctx.privilege, Privilege::Sudo { askpass: None });
        assert_eq!(
            ctx.env.get("HOMEBREW_NO_AUTO_UPDATE").map(String::as_str),
            Some("1")
        );

        Ok(())
    }

    #[test]
    fn empty_manifest_uses_defaults() -> anyhow::Result<()> {
        let result: Manifest = "".parse()?;
        assert_eq!(result, Manifest::default());
        assert_eq!(result.retry_policy(), RetryPolicy::default());
        assert_eq!(result.execution_context(), ExecutionContext::new());

        Ok(())
    }

    #[test]
    fn reject_duplicate_ids() {
        let result = indoc! {r#"
            [[item]]
            kind = "package"
            name = "git"

            [[item]]
            kind = "package"
            id = "package:git"
            name = "git-lfs"
        "#}
        .parse::<Manifest>();

        assert!(matches!(result, Err(ConfigError::DuplicateId(id)) if id == "package:git"));
    }

    #[test]
    fn reject_invalid_settings_and_items() {
        let zero = "[settings]\nmax_attempts = 0\n".parse::<Manifest>();
        assert!(matches!(zero, Err(ConfigError::ZeroAttempts)));

        let version = indoc! {r#"
            [[item]]
            kind = "package"
            name = "git"
            version = "not a version"
        "#}
        .parse::<Manifest>();
        assert!(matches!(version, Err(ConfigError::InvalidVersion { .. })));

        let command = indoc! {r#"
            [[item]]
            kind = "setting"
            backend = "command"
            key = "timezone"
            value = "UTC"
            read = "cat /etc/timezone"
        "#}
        .parse::<Manifest>();
        assert!(matches!(command, Err(ConfigError::MissingCommand(_))));

        let content = indoc! {r#"
            [[item]]
            kind = "file"
            path = "/tmp/blah"
        "#}
        .parse::<Manifest>();
        assert!(matches!(content, Err(ConfigError::FileContent(_))));
    }

    #[test]
    fn desired_items_read_sources_relative_to_manifest() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("zsh"))?;
        std::fs::write(dir.path().join("zsh").join("zshrc"), "export EDITOR=vim\n")?;

        let manifest: Manifest = indoc! {r#"
            [[item]]
            kind = "file"
            id = "zshrc"
            path = "/tmp/home/.zshrc"
            source = "zsh/zshrc"
            platforms = ["macos"]

            [[item]]
            kind = "package"
            name = "zsh"
        "#}
        .parse()?;

        let items = manifest.desired_items(dir.path())?;
        let summary = items
            .iter()
            .map(|item| (item.id.as_str(), item.kind()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![("zshrc", ItemKind::FileContent), ("package:zsh", ItemKind::Package)]
        );
        assert_eq!(
            items[0].spec,
            ItemSpec::FileContent {
                path: "/tmp/home/.zshrc".into(),
                content: "export EDITOR=vim\n".into(),
                mode: None,
            }
        );
        assert!(items[0].scope.includes(Os::MacOs));
        assert!(!items[0].scope.includes(Os::Windows));

        let missing: Manifest = indoc! {r#"
            [[item]]
            kind = "file"
            path = "/tmp/home/.vimrc"
            source = "vim/vimrc"
        "#}
        .parse()?;
        assert!(matches!(
            missing.desired_items(dir.path()),
            Err(ConfigError::Source { .. })
        ));

        Ok(())
    }

    #[test]
    fn serialized_manifest_parses_back() -> anyhow::Result<()> {
        let manifest: Manifest = indoc! {r#"
            [settings]
            retry_delay_ms = 10

            [[item]]
            kind = "setting"
            backend = "defaults"
            key = "com.apple.dock:autohide"
            value = "1"
            type = "bool"
        "#}
        .parse()?;

        let text = manifest.to_string();
        assert!(text.contains("type = \"bool\""));
        assert_eq!(text.parse::<Manifest>()?, manifest);

        Ok(())
    }
}
