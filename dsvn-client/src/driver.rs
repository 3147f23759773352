//! Driving harvested items through a commit editor

use std::collections::BTreeMap;
use std::path::Path;

use dsvn_core::path;
use dsvn_core::properties::svn_props;
use dsvn_core::{
    checksum, drive_commit_editor, CommitEditor, CommitInfo, CommitPathHandler, Event, EventAction,
    EventDispatcher, NodeKind, Result, SvnError, WcAccess,
};

use crate::packet::CommitItem;

/// Where a set of items is committed from: the editor anchor URL and each
/// item's path below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTargets {
    pub base_url: String,
    /// Relative path -> index into the item slice
    pub paths: BTreeMap<String, usize>,
}

/// Compute the common base URL of `items` and their paths relative to it.
///
/// The base moves up one level when it is itself a file item, or a
/// directory item that is added, deleted, copied or locked, since such an
/// item cannot be the anchor of its own change.
pub fn translate_commitables(items: &[CommitItem]) -> Result<CommitTargets> {
    let mut by_url: BTreeMap<&str, usize> = BTreeMap::new();
    for (index, item) in items.iter().enumerate() {
        if let Some(&previous) = by_url.get(item.url.as_str()) {
            return Err(SvnError::DuplicateCommitUrl(
                item.to_string(),
                items[previous].to_string(),
            ));
        }
        by_url.insert(item.url.as_str(), index);
    }

    let mut urls = by_url.keys();
    let first = urls
        .next()
        .ok_or_else(|| SvnError::IllegalState("no items to commit".into()))?;
    let mut base_url = first.to_string();
    for url in urls {
        base_url = path::url_common_ancestor(&base_url, url).ok_or_else(|| {
            SvnError::IllegalUrl(format!("'{}' and '{}' are in different repositories", base_url, url))
        })?;
    }

    if let Some(&index) = by_url.get(base_url.as_str()) {
        let root = &items[index];
        let f = root.flags;
        if root.kind != NodeKind::Dir || f.added || f.deleted || f.copied || f.locked {
            base_url = path::url_dirname(&base_url);
        }
    }

    let mut paths = BTreeMap::new();
    for (url, index) in by_url {
        let rel = path::url_skip_ancestor(&base_url, url)
            .ok_or_else(|| SvnError::IllegalUrl(format!("'{}' is not below '{}'", url, base_url)))?;
        paths.insert(rel, index);
    }
    Ok(CommitTargets { base_url, paths })
}

/// Re-key URL-keyed lock tokens by path relative to `base_url`. Tokens for
/// URLs outside `base_url` are dropped.
pub fn translate_lock_tokens(tokens: &BTreeMap<String, String>, base_url: &str) -> BTreeMap<String, String> {
    tokens
        .iter()
        .filter_map(|(url, token)| path::url_skip_ancestor(base_url, url).map(|rel| (rel, token.clone())))
        .collect()
}

/// Emits the editor operations of each commit item. File texts are
/// deferred until the tree structure is complete.
pub struct Committer<'a> {
    items: &'a [CommitItem],
    targets: &'a CommitTargets,
    access: Option<&'a mut dyn WcAccess>,
    events: &'a EventDispatcher,
    repository_root: String,
    modified_files: BTreeMap<String, usize>,
}

impl<'a> Committer<'a> {
    pub fn new(
        items: &'a [CommitItem],
        targets: &'a CommitTargets,
        access: Option<&'a mut dyn WcAccess>,
        events: &'a EventDispatcher,
        repository_root: impl Into<String>,
    ) -> Self {
        Self {
            items,
            targets,
            access,
            events,
            repository_root: repository_root.into(),
            modified_files: BTreeMap::new(),
        }
    }

    /// Drive every item, send the deferred texts and close the edit. The
    /// edit is aborted when anything fails.
    pub fn commit(mut self, editor: &mut dyn CommitEditor) -> Result<CommitInfo> {
        let paths: Vec<String> = self.targets.paths.keys().cloned().collect();
        let result = drive_commit_editor(&paths, editor, None, &mut self)
            .and_then(|()| self.send_text_deltas(editor))
            .and_then(|()| editor.close_edit());
        if result.is_err() {
            if let Err(e) = editor.abort_edit() {
                tracing::debug!("abort after failed commit also failed: {}", e);
            }
        }
        result
    }

    fn item(&self, commit_path: &str) -> Result<&'a CommitItem> {
        let items = self.items;
        self.targets
            .paths
            .get(commit_path)
            .and_then(|&index| items.get(index))
            .ok_or_else(|| SvnError::IllegalState(format!("no commit item for '{}'", commit_path)))
    }

    fn copy_source(&self, item: &CommitItem) -> Result<Option<(String, u64)>> {
        if !item.flags.copied {
            return Ok(None);
        }
        let (url, revision) = item.copy_from.as_ref().ok_or_else(|| {
            SvnError::IllegalUrl(format!("Commit item '{}' has copy flag but no copyfrom URL", item))
        })?;
        let rel = path::url_skip_ancestor(&self.repository_root, url).ok_or_else(|| {
            SvnError::IllegalUrl(format!(
                "copy source '{}' is not in repository '{}'",
                url, self.repository_root
            ))
        })?;
        Ok(Some((path::to_absolute(&rel), *revision)))
    }

    fn local_path<'i>(&self, item: &'i CommitItem) -> Result<&'i Path> {
        item.path
            .as_deref()
            .ok_or_else(|| SvnError::IllegalState(format!("commit item '{}' has no working copy path", item)))
    }

    fn access(&mut self) -> Result<&mut dyn WcAccess> {
        match self.access.as_deref_mut() {
            Some(access) => Ok(access),
            None => Err(SvnError::IllegalState("commit needs working copy access".into())),
        }
    }

    fn notify(&mut self, item: &CommitItem) -> Result<()> {
        let f = item.flags;
        let action = if f.added && f.deleted {
            EventAction::CommitReplaced
        } else if f.added {
            EventAction::CommitAdded
        } else if f.deleted {
            EventAction::CommitDeleted
        } else if f.text_modified || f.props_modified {
            EventAction::CommitModified
        } else {
            return Ok(());
        };

        let mut event = Event::new(action).with_kind(item.kind).with_url(&item.url);
        if let Some(p) = &item.path {
            event = event.with_path(p);
            if action == EventAction::CommitAdded && item.kind == NodeKind::File {
                let props = self.access()?.properties(p)?;
                event = event.with_mime_type(props.get(svn_props::MIME_TYPE).cloned());
            }
        }
        self.events.dispatch(event, None)
    }

    fn send_property_changes(&mut self, commit_path: &str, item: &CommitItem, editor: &mut dyn CommitEditor) -> Result<()> {
        let local = self.local_path(item)?.to_path_buf();
        let access = self.access()?;
        let replaced = access
            .entry(&local)?
            .is_some_and(|e| e.is_scheduled_for_replacement());
        let working = access.properties(&local)?;
        let diff = if replaced {
            working.as_diff()
        } else {
            access.base_properties(&local)?.diff(&working)
        };
        for (name, value) in &diff {
            if item.kind == NodeKind::File {
                editor.change_file_property(commit_path, name, value.as_deref())?;
            } else {
                editor.change_dir_property(commit_path, name, value.as_deref())?;
            }
        }
        Ok(())
    }

    /// Transmit the full text of every file whose contents changed.
    fn send_text_deltas(&mut self, editor: &mut dyn CommitEditor) -> Result<()> {
        let modified = std::mem::take(&mut self.modified_files);
        let items = self.items;
        for (commit_path, index) in modified {
            self.events.check_cancelled()?;
            let item = &items[index];
            let local = self.local_path(item)?.to_path_buf();

            let event = Event::new(EventAction::CommitDeltaSent)
                .with_path(&local)
                .with_kind(NodeKind::File);
            self.events.dispatch(event, None)?;

            let access = self.access()?;
            let base_checksum = if item.flags.added {
                None
            } else {
                access.entry(&local)?.and_then(|e| e.checksum)
            };
            let text = access.translated_text(&local)?;
            let text_checksum = checksum(&text);
            editor.apply_text_delta(&commit_path, base_checksum.as_deref(), text)?;
            editor.close_file(&commit_path, Some(&text_checksum))?;
        }
        Ok(())
    }
}

impl CommitPathHandler for Committer<'_> {
    fn handle_commit_path(&mut self, commit_path: &str, editor: &mut dyn CommitEditor) -> Result<bool> {
        self.events.check_cancelled()?;
        let item = self.item(commit_path)?;
        let copy_from = self.copy_source(item)?;
        self.notify(item)?;

        let f = item.flags;
        let mut file_open = false;
        let mut dir_open = false;
        if f.deleted {
            editor.delete_entry(commit_path, item.revision)?;
        }
        if f.added {
            let source = copy_from.as_ref().map(|(p, r)| (p.as_str(), *r));
            if item.kind == NodeKind::File {
                editor.add_file(commit_path, source)?;
                file_open = true;
            } else {
                editor.add_dir(commit_path, source)?;
                dir_open = true;
            }
        }
        if f.props_modified {
            if item.kind == NodeKind::File {
                if !file_open {
                    editor.open_file(commit_path, item.revision)?;
                    file_open = true;
                }
            } else if !f.added {
                if commit_path.is_empty() {
                    editor.open_root(item.revision)?;
                } else {
                    editor.open_dir(commit_path, item.revision)?;
                }
                dir_open = true;
            }
            self.send_property_changes(commit_path, item, editor)?;
        }

        if f.text_modified && item.kind == NodeKind::File {
            if !file_open {
                editor.open_file(commit_path, item.revision)?;
            }
            let index = self.targets.paths.get(commit_path).copied().unwrap_or_default();
            self.modified_files.insert(commit_path.to_string(), index);
        } else if file_open {
            editor.close_file(commit_path, None)?;
        }
        Ok(dir_open)
    }
}
