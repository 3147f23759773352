//! Repository session abstraction
//!
//! A session is bound to one URL inside one repository. Path arguments are
//! relative to that URL; paths reported by `log` and `get_locations` are
//! absolute repository paths (`/trunk/a`).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::editor::CommitEditor;
use crate::error::{Result, SvnError};
use crate::object::NodeKind;
use crate::properties::PropertySet;

/// Action recorded for a path in a revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    Added,
    Deleted,
    Modified,
    Replaced,
}

impl ChangeAction {
    pub fn as_char(self) -> char {
        match self {
            ChangeAction::Added => 'A',
            ChangeAction::Deleted => 'D',
            ChangeAction::Modified => 'M',
            ChangeAction::Replaced => 'R',
        }
    }

    /// The node at this path was created in the revision (plain or by copy).
    pub fn is_addition(self) -> bool {
        matches!(self, ChangeAction::Added | ChangeAction::Replaced)
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One entry of a revision's changed-path list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedPath {
    pub action: ChangeAction,
    /// Absolute source path and revision when the node was copied
    pub copy_from: Option<(String, u64)>,
    pub kind: NodeKind,
}

impl ChangedPath {
    pub fn new(action: ChangeAction, kind: NodeKind) -> Self {
        Self {
            action,
            copy_from: None,
            kind,
        }
    }

    pub fn copied(action: ChangeAction, kind: NodeKind, path: impl Into<String>, rev: u64) -> Self {
        Self {
            action,
            copy_from: Some((path.into(), rev)),
            kind,
        }
    }
}

/// A log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub revision: u64,
    pub author: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub message: Option<String>,
    /// Keyed by absolute path; `None` unless changed paths were requested
    pub changed_paths: Option<BTreeMap<String, ChangedPath>>,
}

/// Options for [`RepositorySession::log`]
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub discover_changed_paths: bool,
    pub stop_on_copy: bool,
    /// Zero means unlimited
    pub limit: usize,
    /// Accepted for interface parity; merge tracking is not recorded.
    pub include_merged: bool,
}

/// A directory listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub created_rev: u64,
}

/// A resolved (URL, revision) coordinate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryLocation {
    pub url: String,
    pub revision: u64,
}

impl fmt::Display for RepositoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.url, self.revision)
    }
}

/// Access to one repository, anchored at [`location`](Self::location).
///
/// Every call is a blocking round trip.
pub trait RepositorySession: Send {
    /// URL the session is anchored at
    fn location(&self) -> &str;

    fn repository_root(&self) -> Result<String>;

    fn repository_uuid(&self) -> Result<String>;

    fn latest_revision(&self) -> Result<u64>;

    /// Youngest revision whose `svn:date` is not later than `date`.
    fn dated_revision(&self, date: DateTime<Utc>) -> Result<u64>;

    /// Kind of `path` at `revision` (HEAD when `None`); `NodeKind::None` if
    /// absent.
    fn check_path(&self, path: &str, revision: Option<u64>) -> Result<NodeKind>;

    fn get_file(&self, path: &str, revision: Option<u64>) -> Result<(PropertySet, Bytes)>;

    fn get_dir(&self, path: &str, revision: Option<u64>) -> Result<(PropertySet, Vec<DirEntry>)>;

    fn revision_property(&self, revision: u64, name: &str) -> Result<Option<String>>;

    /// Set `name`, or delete it when `value` is `None`.
    fn set_revision_property(&self, revision: u64, name: &str, value: Option<&str>) -> Result<()>;

    fn revision_properties(&self, revision: u64) -> Result<PropertySet>;

    /// Absolute path the node at `path@peg` occupied in each of `revisions`.
    /// Revisions where it did not exist are left out. Fails with
    /// `NotImplemented` when the server lacks the capability.
    fn get_locations(&self, path: &str, peg: u64, revisions: &[u64]) -> Result<BTreeMap<u64, String>>;

    /// Walk history from `start` to `end` (either direction), calling
    /// `handler` once per revision. Returns the number of entries delivered.
    fn log(
        &self,
        paths: &[String],
        start: u64,
        end: u64,
        options: &LogOptions,
        handler: &mut dyn FnMut(&LogEntry) -> Result<()>,
    ) -> Result<usize>;

    /// Drive `editor` with the changes of `revision`, relative to
    /// `revision - 1`. Copies from revisions older than `low_water_mark`
    /// are sent as plain adds. Stops short of `close_edit`. Fails with
    /// `NotImplemented` when the server lacks the capability.
    fn replay(
        &self,
        revision: u64,
        low_water_mark: u64,
        send_deltas: bool,
        editor: &mut dyn CommitEditor,
    ) -> Result<()>;

    /// Open a commit transaction anchored at the session location. Lock
    /// tokens are keyed by path relative to the location.
    fn commit_editor(
        &self,
        message: &str,
        lock_tokens: &BTreeMap<String, String>,
        keep_locks: bool,
        revision_properties: &PropertySet,
    ) -> Result<Box<dyn CommitEditor>>;

    /// Path of the session location below the repository root.
    fn root_relative_path(&self) -> Result<String> {
        let root = self.repository_root()?;
        crate::path::url_skip_ancestor(&root, self.location()).ok_or_else(|| {
            SvnError::IllegalUrl(format!(
                "'{}' is not inside repository '{}'",
                self.location(),
                root
            ))
        })
    }

    /// Whether the session is anchored at its repository root.
    fn is_at_root(&self) -> Result<bool> {
        Ok(self.root_relative_path()?.is_empty())
    }
}

/// Opens sessions by URL
pub trait SessionFactory: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn RepositorySession>>;
}

impl<F> SessionFactory for F
where
    F: Fn(&str) -> Result<Box<dyn RepositorySession>> + Send + Sync,
{
    fn open(&self, url: &str) -> Result<Box<dyn RepositorySession>> {
        self(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_action_chars() {
        assert_eq!(ChangeAction::Replaced.to_string(), "R");
        assert!(ChangeAction::Added.is_addition());
        assert!(!ChangeAction::Modified.is_addition());
    }

    #[test]
    fn test_location_display() {
        let loc = RepositoryLocation {
            url: "mem://r/trunk".into(),
            revision: 4,
        };
        assert_eq!(loc.to_string(), "mem://r/trunk@4");
    }
}
