// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Desired state data model.
//!
//! A __desired state item__ is the unit of work handled by the reconciliation
//! loop. Each item declares what one piece of the host should look like: a
//! package that must be installed, a file that must hold exact content, or a
//! setting that must read back a given value. Items carry no behavior of their
//! own. The state inspector decides whether the host already satisfies an
//! item, and the retryable executor runs the mutating action that makes it so.
//!
//! # Ordering
//!
//! Items are processed independently in the order given by the caller. There
//! is no dependency graph between items, so prerequisites, e.g., the package
//! manager itself, must be listed before their dependents.

use crate::{platform::Os, setting::SettingBackend};

use semver::VersionReq;
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

/// Declarative unit describing what the system should look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredStateItem {
    /// Stable identifier, unique within a single run.
    pub id: String,

    /// Platforms this item applies to.
    pub scope: PlatformScope,

    /// Abort the remaining run if this item fails.
    pub fatal: bool,

    /// Kind specific description of the desired state.
    pub spec: ItemSpec,
}

impl DesiredStateItem {
    /// Construct new item applying to all platforms.
    pub fn new(id: impl Into<String>, spec: ItemSpec) -> Self {
        Self {
            id: id.into(),
            scope: PlatformScope::default(),
            fatal: false,
            spec,
        }
    }

    /// Restrict item to a set of platforms.
    pub fn with_scope(mut self, scope: PlatformScope) -> Self {
        self.scope = scope;
        self
    }

    /// Mark item as fatal if it cannot be reconciled.
    pub fn with_fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn kind(&self) -> ItemKind {
        match self.spec {
            ItemSpec::Package { .. } => ItemKind::Package,
            ItemSpec::FileContent { .. } => ItemKind::FileContent,
            ItemSpec::Setting { .. } => ItemKind::Setting,
        }
    }

    /// Path, package name, or setting key this item manages.
    pub fn target(&self) -> String {
        match &self.spec {
            ItemSpec::Package { name, .. } => name.clone(),
            ItemSpec::FileContent { path, .. } => path.display().to_string(),
            ItemSpec::Setting { backend, key, .. } => format!("{}:{key}", backend.name()),
        }
    }

    /// Value the inspector compares the observed state against.
    pub fn desired_value(&self) -> DesiredValue {
        match &self.spec {
            ItemSpec::Package { version, .. } => DesiredValue::Version(version.clone()),
            ItemSpec::FileContent { content, .. } => {
                DesiredValue::ContentHash(crate::inspect::content_hash(content))
            }
            ItemSpec::Setting { value, .. } => DesiredValue::Value(value.clone()),
        }
    }
}

/// Kinds of desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Package,
    FileContent,
    Setting,
}

impl Display for ItemKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Package => "package",
            Self::FileContent => "file",
            Self::Setting => "setting",
        };
        fmt.write_str(name)
    }
}

/// Kind specific description of desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemSpec {
    /// Package installed through the platform's package manager.
    Package {
        name: String,
        version: Option<VersionReq>,
    },

    /// File holding exact content.
    FileContent {
        path: PathBuf,
        content: String,
        mode: Option<u32>,
    },

    /// Setting reading back a given value through its native mechanism.
    Setting {
        backend: SettingBackend,
        key: String,
        value: String,
        value_type: Option<String>,
        file: Option<PathBuf>,
    },
}

/// Expected state of an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredValue {
    /// SHA-256 hex digest of file content.
    ContentHash(String),

    /// Optional version requirement of a package.
    Version(Option<VersionReq>),

    /// Setting value.
    Value(String),
}

impl Display for DesiredValue {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::ContentHash(hash) => write!(fmt, "sha256:{hash}"),
            Self::Version(Some(req)) => write!(fmt, "{req}"),
            Self::Version(None) => fmt.write_str("installed"),
            Self::Value(value) => fmt.write_str(value),
        }
    }
}

/// Set of platforms an item applies to.
///
/// An empty scope applies to every platform.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PlatformScope(BTreeSet<Os>);

impl PlatformScope {
    /// Construct new scope that applies to every platform.
    pub fn all() -> Self {
        Self::default()
    }

    /// Construct new scope that applies only to the given platforms.
    pub fn only(platforms: impl IntoIterator<Item = Os>) -> Self {
        Self(platforms.into_iter().collect())
    }

    pub fn includes(&self, os: Os) -> bool {
        self.0.is_empty() || self.0.contains(&os)
    }
}

/// Observed state of one item.
///
/// Computed fresh on every run, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionResult {
    pub satisfied: bool,
    pub current_value: String,
}

impl InspectionResult {
    pub fn satisfied(current_value: impl Into<String>) -> Self {
        Self {
            satisfied: true,
            current_value: current_value.into(),
        }
    }

    pub fn unsatisfied(current_value: impl Into<String>) -> Self {
        Self {
            satisfied: false,
            current_value: current_value.into(),
        }
    }

    /// Read error observed while inspecting.
    ///
    /// Never counts as satisfied, so the reconciliation loop attempts the
    /// action rather than silently skipping the item.
    pub fn read_error(error: impl Display) -> Self {
        Self::unsatisfied(format!("<inspection error: {error}>"))
    }
}

/// Final status of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeStatus {
    Applied,
    AlreadySatisfied,
    Skipped,
    Failed,
}

impl Display for OutcomeStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Applied => "applied",
            Self::AlreadySatisfied => "already satisfied",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        fmt.write_str(name)
    }
}

/// Outcome of reconciling one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub status: OutcomeStatus,
    pub attempts: u32,

    /// Present only when status is [`OutcomeStatus::Failed`].
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn applied(attempts: u32) -> Self {
        Self {
            status: OutcomeStatus::Applied,
            attempts,
            error: None,
        }
    }

    pub fn already_satisfied() -> Self {
        Self {
            status: OutcomeStatus::AlreadySatisfied,
            attempts: 0,
            error: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: OutcomeStatus::Skipped,
            attempts: 0,
            error: None,
        }
    }

    pub fn failed(attempts: u32, error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            attempts,
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == OutcomeStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_scope_includes_every_platform() {
        let scope = PlatformScope::all();
        assert!(scope.includes(Os::MacOs));
        assert!(scope.includes(Os::Windows));

        let scope = PlatformScope::only([Os::Wsl, Os::UbuntuServer]);
        assert!(scope.includes(Os::Wsl));
        assert!(!scope.includes(Os::MacOs));
    }

    #[test]
    fn file_item_desires_content_hash() {
        let item = DesiredStateItem::new(
            "file:~/.bashrc",
            ItemSpec::FileContent {
                path: PathBuf::from("/home/blah/.bashrc"),
                content: "X".into(),
                mode: None,
            },
        );

        assert_eq!(item.kind(), ItemKind::FileContent);
        assert_eq!(item.target(), "/home/blah/.bashrc");
        assert_eq!(
            item.desired_value(),
            DesiredValue::ContentHash(crate::inspect::content_hash("X"))
        );
    }

    #[test]
    fn inspection_read_error_is_unsatisfied() {
        let result = InspectionResult::read_error("permission denied");
        assert!(!result.satisfied);
        assert_eq!(result.current_value, "<inspection error: permission denied>");
    }
}
