//! Revision-to-edit translation
//!
//! Turns one revision's changed-path list into editor calls by reading the
//! tree before and after the revision. Used by repository replay and by
//! the full-copy replication path.

use bytes::Bytes;
use std::collections::BTreeMap;

use crate::editor::{drive_commit_editor, CommitEditor, CommitPathHandler};
use crate::error::{Result, SvnError};
use crate::object::{checksum, NodeKind};
use crate::path;
use crate::properties::{PropertyDiff, PropertySet};
use crate::session::{ChangeAction, ChangedPath, RepositorySession};

/// Kind, properties and text checksum of a node at some revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub kind: NodeKind,
    pub props: PropertySet,
    pub checksum: Option<String>,
}

/// Read-only view of repository trees by revision. Paths are relative to
/// the repository root.
pub trait SnapshotReader {
    fn node(&self, path: &str, revision: u64) -> Result<Option<NodeSnapshot>>;

    fn contents(&self, path: &str, revision: u64) -> Result<Bytes>;

    /// Names and kinds of the children of a directory
    fn children(&self, path: &str, revision: u64) -> Result<Vec<(String, NodeKind)>>;
}

/// [`SnapshotReader`] over a session anchored at its repository root
pub struct SessionReader<'a> {
    session: &'a dyn RepositorySession,
}

impl<'a> SessionReader<'a> {
    pub fn new(session: &'a dyn RepositorySession) -> Self {
        Self { session }
    }
}

impl SnapshotReader for SessionReader<'_> {
    fn node(&self, path: &str, revision: u64) -> Result<Option<NodeSnapshot>> {
        match self.session.check_path(path, Some(revision))? {
            NodeKind::File => {
                let (props, contents) = self.session.get_file(path, Some(revision))?;
                Ok(Some(NodeSnapshot {
                    kind: NodeKind::File,
                    props,
                    checksum: Some(checksum(&contents)),
                }))
            }
            NodeKind::Dir => {
                let (props, _) = self.session.get_dir(path, Some(revision))?;
                Ok(Some(NodeSnapshot {
                    kind: NodeKind::Dir,
                    props,
                    checksum: None,
                }))
            }
            _ => Ok(None),
        }
    }

    fn contents(&self, path: &str, revision: u64) -> Result<Bytes> {
        Ok(self.session.get_file(path, Some(revision))?.1)
    }

    fn children(&self, path: &str, revision: u64) -> Result<Vec<(String, NodeKind)>> {
        let (_, entries) = self.session.get_dir(path, Some(revision))?;
        Ok(entries.into_iter().map(|e| (e.name, e.kind)).collect())
    }
}

/// Knobs for [`drive_revision_delta`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaOptions {
    /// Copies from older revisions are expanded into plain adds
    pub low_water_mark: u64,
    pub send_deltas: bool,
    /// Base revision passed to `open_root` / `open_dir` / `open_file`
    pub base_revision: Option<u64>,
}

/// Drive `editor` with the changes `revision` made. `changes` is keyed by
/// absolute path. Stops short of `close_edit`.
pub fn drive_revision_delta(
    reader: &dyn SnapshotReader,
    revision: u64,
    changes: &BTreeMap<String, ChangedPath>,
    editor: &mut dyn CommitEditor,
    options: DeltaOptions,
) -> Result<()> {
    if revision == 0 {
        return Err(SvnError::BadRevision("revision 0 has no changes to replay".into()));
    }
    let changes: BTreeMap<String, &ChangedPath> = changes
        .iter()
        .map(|(p, c)| (path::from_absolute(p), c))
        .collect();
    // Plain-added directories are sent with their final contents, so edits
    // recorded below them are already covered. Additions below them keep
    // their own record and re-open the added parent.
    let mut expanded_roots: Vec<&str> = Vec::new();
    for (p, change) in &changes {
        let plain = change
            .copy_from
            .as_ref()
            .is_none_or(|(_, rev)| *rev < options.low_water_mark);
        if change.action.is_addition()
            && plain
            && reader.node(p, revision)?.is_some_and(|n| n.kind == NodeKind::Dir)
        {
            expanded_roots.push(p.as_str());
        }
    }
    let paths: Vec<String> = changes
        .iter()
        .filter(|&(p, change)| {
            change.action.is_addition()
                || !expanded_roots
                    .iter()
                    .any(|root| *root != p.as_str() && path::is_ancestor(root, p.as_str()))
        })
        .map(|(p, _)| p.clone())
        .collect();
    let mut driver = DeltaDriver {
        reader,
        revision,
        changes,
        expanded: Vec::new(),
        options,
    };
    drive_commit_editor(&paths, editor, options.base_revision, &mut driver)
}

struct DeltaDriver<'a> {
    reader: &'a dyn SnapshotReader,
    revision: u64,
    changes: BTreeMap<String, &'a ChangedPath>,
    /// Directories added with their full contents
    expanded: Vec<String>,
    options: DeltaOptions,
}

impl DeltaDriver<'_> {
    fn new_node(&self, p: &str) -> Result<NodeSnapshot> {
        self.reader.node(p, self.revision)?.ok_or_else(|| {
            SvnError::Corrupt(format!("'{}' is missing from revision {}", p, self.revision))
        })
    }

    fn under_expanded(&self, p: &str) -> bool {
        self.expanded.iter().any(|e| e != p && path::is_ancestor(e, p))
    }

    fn usable_copy<'c>(&self, change: &'c ChangedPath) -> Option<(&'c str, u64)> {
        change
            .copy_from
            .as_ref()
            .filter(|(_, rev)| *rev >= self.options.low_water_mark)
            .map(|(p, rev)| (p.as_str(), *rev))
    }

    /// Where the previous state of `p` lives: the same path one revision
    /// back, or inside the copy source of an ancestor copied in this
    /// revision.
    fn base_of(&self, p: &str) -> (String, u64) {
        let mut candidate = Some(p);
        while let Some(current) = candidate {
            if let Some(change) = self.changes.get(current) {
                if let (true, Some((src, rev))) = (change.action.is_addition(), &change.copy_from) {
                    let suffix = path::skip_ancestor(current, p).unwrap_or_default();
                    return (path::join(&path::from_absolute(src), suffix), *rev);
                }
            }
            candidate = if current.is_empty() { None } else { Some(path::dirname(current)) };
        }
        (p.to_string(), self.revision - 1)
    }

    fn send_props(
        &self,
        editor: &mut dyn CommitEditor,
        p: &str,
        kind: NodeKind,
        diff: &PropertyDiff,
    ) -> Result<()> {
        for (name, value) in diff {
            if kind == NodeKind::Dir {
                editor.change_dir_property(p, name, value.as_deref())?;
            } else {
                editor.change_file_property(p, name, value.as_deref())?;
            }
        }
        Ok(())
    }

    fn send_text(
        &self,
        editor: &mut dyn CommitEditor,
        p: &str,
        base_checksum: Option<&str>,
        node: &NodeSnapshot,
    ) -> Result<()> {
        if self.options.send_deltas && base_checksum != node.checksum.as_deref() {
            let contents = self.reader.contents(p, self.revision)?;
            editor.apply_text_delta(p, base_checksum, contents)?;
        }
        Ok(())
    }

    fn modify(&self, editor: &mut dyn CommitEditor, p: &str) -> Result<bool> {
        let node = self.new_node(p)?;
        let (base_path, base_rev) = self.base_of(p);
        let base = self.reader.node(&base_path, base_rev)?;
        let base_props = base.as_ref().map(|b| b.props.clone()).unwrap_or_default();
        let diff = base_props.diff(&node.props);
        match node.kind {
            NodeKind::Dir => {
                if p.is_empty() {
                    editor.open_root(self.options.base_revision)?;
                } else {
                    editor.open_dir(p, self.options.base_revision)?;
                }
                self.send_props(editor, p, NodeKind::Dir, &diff)?;
                Ok(true)
            }
            _ => {
                editor.open_file(p, self.options.base_revision)?;
                self.send_props(editor, p, NodeKind::File, &diff)?;
                let base_checksum = base.and_then(|b| b.checksum);
                self.send_text(editor, p, base_checksum.as_deref(), &node)?;
                editor.close_file(p, node.checksum.as_deref())?;
                Ok(false)
            }
        }
    }

    fn add(&mut self, editor: &mut dyn CommitEditor, p: &str, change: &ChangedPath) -> Result<bool> {
        let node = self.new_node(p)?;
        if let Some((src, src_rev)) = self.usable_copy(change) {
            let base = self
                .reader
                .node(&path::from_absolute(src), src_rev)?
                .ok_or_else(|| SvnError::Corrupt(format!("copy source '{}@{}' is missing", src, src_rev)))?;
            let diff = base.props.diff(&node.props);
            return match node.kind {
                NodeKind::Dir => {
                    editor.add_dir(p, Some((src, src_rev)))?;
                    self.send_props(editor, p, NodeKind::Dir, &diff)?;
                    Ok(true)
                }
                _ => {
                    editor.add_file(p, Some((src, src_rev)))?;
                    self.send_props(editor, p, NodeKind::File, &diff)?;
                    self.send_text(editor, p, base.checksum.as_deref(), &node)?;
                    editor.close_file(p, node.checksum.as_deref())?;
                    Ok(false)
                }
            };
        }

        if node.kind == NodeKind::Dir {
            editor.add_dir(p, None)?;
            self.send_props(editor, p, NodeKind::Dir, &node.props.as_diff())?;
            self.add_children(editor, p)?;
            self.expanded.push(p.to_string());
            Ok(true)
        } else {
            self.add_file_contents(editor, p, &node)?;
            Ok(false)
        }
    }

    fn add_file_contents(&self, editor: &mut dyn CommitEditor, p: &str, node: &NodeSnapshot) -> Result<()> {
        editor.add_file(p, None)?;
        self.send_props(editor, p, NodeKind::File, &node.props.as_diff())?;
        self.send_text(editor, p, None, node)?;
        editor.close_file(p, node.checksum.as_deref())
    }

    /// Add everything below `dir` that has no changed-path record of its
    /// own.
    fn add_children(&self, editor: &mut dyn CommitEditor, dir: &str) -> Result<()> {
        for (name, _) in self.reader.children(dir, self.revision)? {
            let child = path::join(dir, &name);
            if self.changes.get(&child).is_some_and(|c| c.action.is_addition()) {
                continue;
            }
            let node = self.new_node(&child)?;
            if node.kind == NodeKind::Dir {
                editor.add_dir(&child, None)?;
                self.send_props(editor, &child, NodeKind::Dir, &node.props.as_diff())?;
                self.add_children(editor, &child)?;
                editor.close_dir(&child)?;
            } else {
                self.add_file_contents(editor, &child, &node)?;
            }
        }
        Ok(())
    }
}

impl CommitPathHandler for DeltaDriver<'_> {
    fn handle_commit_path(&mut self, p: &str, editor: &mut dyn CommitEditor) -> Result<bool> {
        let change = *self
            .changes
            .get(p)
            .ok_or_else(|| SvnError::IllegalState(format!("no change recorded for '{}'", p)))?;
        let expanded = self.under_expanded(p);
        match change.action {
            ChangeAction::Deleted => {
                editor.delete_entry(p, None)?;
                Ok(false)
            }
            ChangeAction::Modified => self.modify(editor, p),
            ChangeAction::Replaced if !expanded => {
                editor.delete_entry(p, None)?;
                self.add(editor, p, change)
            }
            ChangeAction::Added | ChangeAction::Replaced => self.add(editor, p, change),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::CommitInfo;

    /// Revision 2 only: `x/`, `x/y/`, `x/y/f`
    struct Tree;

    impl SnapshotReader for Tree {
        fn node(&self, path: &str, _: u64) -> Result<Option<NodeSnapshot>> {
            let kind = match path {
                "x" | "x/y" => NodeKind::Dir,
                "x/y/f" => NodeKind::File,
                _ => return Ok(None),
            };
            Ok(Some(NodeSnapshot {
                kind,
                props: PropertySet::new(),
                checksum: (kind == NodeKind::File).then(|| checksum(b"f")),
            }))
        }

        fn contents(&self, _: &str, _: u64) -> Result<Bytes> {
            Ok(Bytes::from_static(b"f"))
        }

        fn children(&self, path: &str, _: u64) -> Result<Vec<(String, NodeKind)>> {
            Ok(match path {
                "x" => vec![("y".into(), NodeKind::Dir)],
                "x/y" => vec![("f".into(), NodeKind::File)],
                _ => Vec::new(),
            })
        }
    }

    #[derive(Default)]
    struct Calls(Vec<String>);

    impl CommitEditor for Calls {
        fn open_root(&mut self, _: Option<u64>) -> Result<()> {
            self.0.push("open-root".into());
            Ok(())
        }
        fn delete_entry(&mut self, path: &str, _: Option<u64>) -> Result<()> {
            self.0.push(format!("delete {}", path));
            Ok(())
        }
        fn add_dir(&mut self, path: &str, _: Option<(&str, u64)>) -> Result<()> {
            self.0.push(format!("add-dir {}", path));
            Ok(())
        }
        fn open_dir(&mut self, path: &str, _: Option<u64>) -> Result<()> {
            self.0.push(format!("open-dir {}", path));
            Ok(())
        }
        fn change_dir_property(&mut self, _: &str, _: &str, _: Option<&str>) -> Result<()> {
            Ok(())
        }
        fn close_dir(&mut self, path: &str) -> Result<()> {
            self.0.push(format!("close-dir {}", path));
            Ok(())
        }
        fn add_file(&mut self, path: &str, _: Option<(&str, u64)>) -> Result<()> {
            self.0.push(format!("add-file {}", path));
            Ok(())
        }
        fn open_file(&mut self, path: &str, _: Option<u64>) -> Result<()> {
            self.0.push(format!("open-file {}", path));
            Ok(())
        }
        fn apply_text_delta(&mut self, _: &str, _: Option<&str>, _: Bytes) -> Result<()> {
            Ok(())
        }
        fn change_file_property(&mut self, _: &str, _: &str, _: Option<&str>) -> Result<()> {
            Ok(())
        }
        fn close_file(&mut self, path: &str, _: Option<&str>) -> Result<()> {
            self.0.push(format!("close-file {}", path));
            Ok(())
        }
        fn close_edit(&mut self) -> Result<CommitInfo> {
            Ok(CommitInfo::null())
        }
        fn abort_edit(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_edits_below_old_copy_are_sent_as_one_add() {
        let mut changes = BTreeMap::new();
        let mut copied = ChangedPath::new(ChangeAction::Added, NodeKind::Dir);
        copied.copy_from = Some(("/trunk".to_string(), 1));
        changes.insert("/x".to_string(), copied);
        changes.insert("/x/y/f".to_string(), ChangedPath::new(ChangeAction::Modified, NodeKind::File));

        let mut calls = Calls::default();
        let options = DeltaOptions {
            low_water_mark: 2,
            send_deltas: true,
            base_revision: None,
        };
        drive_revision_delta(&Tree, 2, &changes, &mut calls, options).unwrap();
        assert_eq!(
            calls.0,
            vec![
                "open-root",
                "add-dir x",
                "add-dir x/y",
                "add-file x/y/f",
                "close-file x/y/f",
                "close-dir x/y",
                "close-dir x",
                "close-dir ",
            ]
        );
    }
}
