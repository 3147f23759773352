//! Working-copy access abstraction
//!
//! The commit pipeline reads entries, properties and texts through
//! [`WcAccess`] and writes back post-commit bookkeeping. How the metadata
//! is stored is up to the implementation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::editor::CommitInfo;
use crate::error::Result;
use crate::object::{Depth, NodeKind};
use crate::properties::PropertySet;

/// Pending scheduling of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Schedule {
    #[default]
    Normal,
    Add,
    Delete,
    Replace,
}

/// Versioned metadata of one working-copy item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub path: PathBuf,
    pub name: String,
    pub kind: NodeKind,
    pub url: Option<String>,
    /// Base revision
    pub revision: Option<u64>,
    pub committed_revision: Option<u64>,
    pub schedule: Schedule,
    pub copied: bool,
    /// Copy source URL and revision for the root of a copied subtree
    pub copy_from: Option<(String, u64)>,
    /// Not-present placeholder left behind by a committed deletion
    pub deleted: bool,
    pub lock_token: Option<String>,
    pub changelist: Option<String>,
    pub text_conflict: bool,
    pub prop_conflict: bool,
    /// Checksum of the text base
    pub checksum: Option<String>,
}

impl Entry {
    pub fn new(path: impl Into<PathBuf>, kind: NodeKind) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            name,
            kind,
            url: None,
            revision: None,
            committed_revision: None,
            schedule: Schedule::Normal,
            copied: false,
            copy_from: None,
            deleted: false,
            lock_token: None,
            changelist: None,
            text_conflict: false,
            prop_conflict: false,
            checksum: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn is_scheduled_for_addition(&self) -> bool {
        self.schedule == Schedule::Add
    }

    pub fn is_scheduled_for_deletion(&self) -> bool {
        self.schedule == Schedule::Delete
    }

    pub fn is_scheduled_for_replacement(&self) -> bool {
        self.schedule == Schedule::Replace
    }

    pub fn in_conflict(&self) -> bool {
        self.text_conflict || self.prop_conflict
    }
}

/// Local bookkeeping to apply to a committed item
#[derive(Debug, Clone)]
pub struct PostCommit {
    pub info: CommitInfo,
    pub remove_lock: bool,
    pub keep_changelist: bool,
    /// Apply to the whole subtree (committed copies of directories)
    pub recurse: bool,
}

/// Opens access scopes on a working copy
pub trait WorkingCopy: Send + Sync {
    /// Open the versioned directory `path`.
    fn open(&self, path: &Path, write_lock: bool, depth: Depth) -> Result<Box<dyn WcAccess>>;

    /// Open `path` if it is a versioned directory, else its parent.
    fn probe_open(&self, path: &Path, write_lock: bool, depth: Depth) -> Result<Box<dyn WcAccess>>;
}

/// An open access scope. Must be closed exactly once.
pub trait WcAccess: Send {
    /// Directory the scope was opened on
    fn anchor(&self) -> &Path;

    fn entry(&self, path: &Path) -> Result<Option<Entry>>;

    /// Entries of the versioned children of `dir`, in name order
    fn children(&self, dir: &Path) -> Result<Vec<Entry>>;

    /// What is actually on disk at `path`
    fn disk_kind(&self, path: &Path) -> Result<NodeKind>;

    fn properties(&self, path: &Path) -> Result<PropertySet>;

    fn base_properties(&self, path: &Path) -> Result<PropertySet>;

    fn has_text_modifications(&self, path: &Path) -> Result<bool>;

    /// Working text in repository-normal form, ready to transmit.
    fn translated_text(&mut self, path: &Path) -> Result<Bytes>;

    /// Remove temporaries created by `translated_text`.
    fn remove_temp_files(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_wc_root(&self, path: &Path) -> Result<bool>;

    fn schedule_delete(&mut self, path: &Path) -> Result<()>;

    /// Record a successful commit of `path`.
    fn post_commit(&mut self, path: &Path, update: &PostCommit) -> Result<()>;

    /// Turn the entry of a committed deletion into a not-present placeholder.
    fn mark_deleted(&mut self, path: &Path, revision: u64) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// What to do with an item that is missing from disk but not scheduled for
/// deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingAction {
    Skip,
    Error,
    ForceDelete,
}

/// Decides the fate of missing items during a harvest
pub trait MissingItemPolicy: Send + Sync {
    fn on_missing_file(&self, path: &Path) -> MissingAction;

    fn on_missing_directory(&self, path: &Path) -> MissingAction;
}

/// Same answer for files and directories
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicy(pub MissingAction);

impl Default for FixedPolicy {
    fn default() -> Self {
        FixedPolicy(MissingAction::Error)
    }
}

impl MissingItemPolicy for FixedPolicy {
    fn on_missing_file(&self, _path: &Path) -> MissingAction {
        self.0
    }

    fn on_missing_directory(&self, _path: &Path) -> MissingAction {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_defaults() {
        let entry = Entry::new("/wc/a.txt", NodeKind::File);
        assert_eq!(entry.name, "a.txt");
        assert_eq!(entry.schedule, Schedule::Normal);
        assert!(!entry.in_conflict());
        assert_eq!(
            FixedPolicy::default().on_missing_file(Path::new("x")),
            MissingAction::Error
        );
    }
}
