//! Tree-edit protocol and the path-ordered driver
//!
//! A `CommitEditor` receives a depth-first sequence of directory and file
//! operations. Paths are relative to the editor's anchor; `""` is the
//! anchor directory itself. Copy sources are absolute repository paths.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Result, SvnError};
use crate::path;

/// Outcome of one commit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitInfo {
    /// New revision; `None` for an empty, vetoed or failed commit
    pub revision: Option<u64>,
    pub author: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub error: Option<SvnError>,
}

impl CommitInfo {
    pub fn new(revision: u64, author: Option<String>, date: Option<DateTime<Utc>>) -> Self {
        Self {
            revision: Some(revision),
            author,
            date,
            error: None,
        }
    }

    /// Nothing was committed.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn failed(error: SvnError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_null(&self) -> bool {
        self.revision.is_none() && self.error.is_none()
    }
}

/// Receiver of tree edits
pub trait CommitEditor: Send {
    fn open_root(&mut self, base_revision: Option<u64>) -> Result<()>;

    fn delete_entry(&mut self, path: &str, revision: Option<u64>) -> Result<()>;

    fn add_dir(&mut self, path: &str, copy_from: Option<(&str, u64)>) -> Result<()>;

    fn open_dir(&mut self, path: &str, base_revision: Option<u64>) -> Result<()>;

    fn change_dir_property(&mut self, path: &str, name: &str, value: Option<&str>) -> Result<()>;

    fn close_dir(&mut self, path: &str) -> Result<()>;

    fn add_file(&mut self, path: &str, copy_from: Option<(&str, u64)>) -> Result<()>;

    fn open_file(&mut self, path: &str, base_revision: Option<u64>) -> Result<()>;

    /// Replace the text of an open file. `base_checksum` names the text the
    /// change applies to.
    fn apply_text_delta(&mut self, path: &str, base_checksum: Option<&str>, contents: Bytes) -> Result<()>;

    fn change_file_property(&mut self, path: &str, name: &str, value: Option<&str>) -> Result<()>;

    fn close_file(&mut self, path: &str, text_checksum: Option<&str>) -> Result<()>;

    fn close_edit(&mut self) -> Result<CommitInfo>;

    fn abort_edit(&mut self) -> Result<()>;
}

/// Per-path callback of [`drive_commit_editor`].
pub trait CommitPathHandler {
    /// Emit the operations for `path`. Return `true` when `path` is a
    /// directory that was opened or added and is left open for its
    /// descendants.
    fn handle_commit_path(&mut self, path: &str, editor: &mut dyn CommitEditor) -> Result<bool>;
}

impl<F> CommitPathHandler for F
where
    F: FnMut(&str, &mut dyn CommitEditor) -> Result<bool>,
{
    fn handle_commit_path(&mut self, path: &str, editor: &mut dyn CommitEditor) -> Result<bool> {
        self(path, editor)
    }
}

/// Visit `paths` parent-first, opening and closing the directories between
/// them so that every operation happens inside its open parent.
///
/// A handler for `""` is responsible for opening the root; if it does not,
/// the driver opens it. Every directory left open, the root included, is
/// closed before returning. `close_edit` is left to the caller.
pub fn drive_commit_editor(
    paths: &[String],
    editor: &mut dyn CommitEditor,
    base_revision: Option<u64>,
    handler: &mut dyn CommitPathHandler,
) -> Result<()> {
    let mut sorted: Vec<&str> = paths.iter().map(String::as_str).collect();
    path::sort_paths(&mut sorted);
    sorted.dedup();

    let mut open_dirs: Vec<String> = Vec::new();
    let mut rest = sorted.as_slice();
    if let Some((&"", tail)) = rest.split_first() {
        if !handler.handle_commit_path("", editor)? {
            editor.open_root(base_revision)?;
        }
        rest = tail;
    } else {
        editor.open_root(base_revision)?;
    }
    open_dirs.push(String::new());

    for &commit_path in rest {
        while let Some(top) = open_dirs.last() {
            if path::is_ancestor(top, commit_path) && top != commit_path {
                break;
            }
            editor.close_dir(top)?;
            open_dirs.pop();
        }

        let parent = path::dirname(commit_path);
        let top = open_dirs.last().cloned().unwrap_or_default();
        if let Some(missing) = path::skip_ancestor(&top, parent) {
            let mut current = top;
            for segment in missing.split('/').filter(|s| !s.is_empty()) {
                current = path::join(&current, segment);
                editor.open_dir(&current, base_revision)?;
                open_dirs.push(current.clone());
            }
        }

        if handler.handle_commit_path(commit_path, editor)? {
            open_dirs.push(commit_path.to_string());
        }
    }

    while let Some(dir) = open_dirs.pop() {
        editor.close_dir(&dir)?;
    }
    Ok(())
}
