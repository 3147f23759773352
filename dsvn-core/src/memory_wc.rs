//! In-memory working copy
//!
//! Holds a virtual disk (directories and file texts) next to the versioned
//! entries, so local modifications, missing items and unversioned files can
//! all be expressed without touching the real filesystem.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, SvnError};
use crate::object::{checksum, Depth, NodeKind};
use crate::path;
use crate::properties::PropertySet;
use crate::session::RepositorySession;
use crate::wc::{Entry, PostCommit, Schedule, WcAccess, WorkingCopy};

#[derive(Debug, Clone)]
enum DiskNode {
    Dir,
    File(Bytes),
}

#[derive(Debug, Clone)]
struct Versioned {
    entry: Entry,
    base_props: PropertySet,
    working_props: PropertySet,
    base_text: Bytes,
}

#[derive(Debug, Default)]
struct WcState {
    root: PathBuf,
    disk: BTreeMap<PathBuf, DiskNode>,
    entries: BTreeMap<PathBuf, Versioned>,
    open_handles: usize,
    temp_files: usize,
}

impl WcState {
    fn versioned(&self, p: &Path) -> Result<&Versioned> {
        self.entries
            .get(p)
            .filter(|v| !is_placeholder(&v.entry))
            .ok_or_else(|| SvnError::UnversionedResource(p.to_path_buf()))
    }

    fn versioned_mut(&mut self, p: &Path) -> Result<&mut Versioned> {
        self.entries
            .get_mut(p)
            .filter(|v| !is_placeholder(&v.entry))
            .ok_or_else(|| SvnError::UnversionedResource(p.to_path_buf()))
    }

    fn subtree(&self, p: &Path) -> Vec<PathBuf> {
        self.entries.keys().filter(|k| k.starts_with(p)).cloned().collect()
    }

    fn remove_disk(&mut self, p: &Path) {
        self.disk.retain(|k, _| !k.starts_with(p));
    }

    fn child_url(&self, parent: &Path, name: &str) -> Result<String> {
        let parent_entry = &self.versioned(parent)?.entry;
        let url = parent_entry
            .url
            .as_deref()
            .ok_or_else(|| SvnError::IllegalState(format!("{} has no URL", parent.display())))?;
        Ok(path::url_append(url, name))
    }

    fn add_versioned(&mut self, p: &Path, schedule: Schedule, revision: Option<u64>) -> Result<()> {
        let parent = p
            .parent()
            .ok_or_else(|| SvnError::IllegalState(format!("{} has no parent", p.display())))?;
        let kind = match self.disk.get(p) {
            Some(DiskNode::Dir) => NodeKind::Dir,
            Some(DiskNode::File(_)) => NodeKind::File,
            None => return Err(SvnError::NotFound(format!("{} does not exist", p.display()))),
        };
        let mut entry = Entry::new(p, kind);
        entry.url = Some(self.child_url(parent, &entry.name)?);
        entry.schedule = schedule;
        entry.revision = revision;
        self.entries.insert(
            p.to_path_buf(),
            Versioned {
                entry,
                base_props: PropertySet::new(),
                working_props: PropertySet::new(),
                base_text: Bytes::new(),
            },
        );
        if kind == NodeKind::Dir {
            let children: Vec<PathBuf> = self
                .disk
                .keys()
                .filter(|k| k.parent() == Some(p))
                .cloned()
                .collect();
            for child in children {
                if !self.entries.contains_key(&child) {
                    self.add_versioned(&child, Schedule::Add, None)?;
                }
            }
        }
        Ok(())
    }
}

fn is_placeholder(entry: &Entry) -> bool {
    entry.deleted && entry.schedule == Schedule::Normal
}

/// Working copy kept entirely in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkingCopy {
    state: Arc<Mutex<WcState>>,
}

impl MemoryWorkingCopy {
    /// Empty working copy of `url@revision` rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, url: &str, revision: u64) -> Result<Self> {
        let root = root.into();
        let mut entry = Entry::new(&root, NodeKind::Dir);
        entry.url = Some(path::canonicalize_url(url)?);
        entry.revision = Some(revision);
        entry.committed_revision = Some(revision);
        let mut state = WcState {
            root: root.clone(),
            ..WcState::default()
        };
        state.disk.insert(root.clone(), DiskNode::Dir);
        state.entries.insert(
            root,
            Versioned {
                entry,
                base_props: PropertySet::new(),
                working_props: PropertySet::new(),
                base_text: Bytes::new(),
            },
        );
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Check out the HEAD of the session's location into `root`.
    pub fn checkout(session: &dyn RepositorySession, root: impl Into<PathBuf>) -> Result<Self> {
        let revision = session.latest_revision()?;
        let wc = Self::new(root, session.location(), revision)?;
        {
            let mut state = wc.lock();
            let root = state.root.clone();
            let (props, _) = session.get_dir("", Some(revision))?;
            if let Some(v) = state.entries.get_mut(&root) {
                v.base_props = props.clone();
                v.working_props = props;
            }
            fetch_dir(session, &mut state, &root, "", revision)?;
        }
        tracing::debug!("checked out {} at r{}", session.location(), revision);
        Ok(wc)
    }

    fn lock(&self) -> MutexGuard<'_, WcState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.lock().root.clone()
    }

    /// Number of access scopes currently open
    pub fn open_handles(&self) -> usize {
        self.lock().open_handles
    }

    /// Number of transmission temporaries not yet removed
    pub fn temp_files(&self) -> usize {
        self.lock().temp_files
    }

    pub fn entry(&self, p: impl AsRef<Path>) -> Option<Entry> {
        self.lock().entries.get(p.as_ref()).map(|v| v.entry.clone())
    }

    /// Current text on disk
    pub fn text(&self, p: impl AsRef<Path>) -> Option<Bytes> {
        match self.lock().disk.get(p.as_ref()) {
            Some(DiskNode::File(text)) => Some(text.clone()),
            _ => None,
        }
    }

    pub fn exists_on_disk(&self, p: impl AsRef<Path>) -> bool {
        self.lock().disk.contains_key(p.as_ref())
    }

    /// Write a file on disk, creating or overwriting it.
    pub fn write_file(&self, p: impl AsRef<Path>, text: impl Into<Bytes>) -> Result<()> {
        let p = p.as_ref();
        let mut state = self.lock();
        match p.parent().and_then(|parent| state.disk.get(parent)) {
            Some(DiskNode::Dir) => {}
            _ => return Err(SvnError::NotFound(format!("parent of {} does not exist", p.display()))),
        }
        if let Some(DiskNode::Dir) = state.disk.get(p) {
            return Err(SvnError::IllegalState(format!("{} is a directory", p.display())));
        }
        state.disk.insert(p.to_path_buf(), DiskNode::File(text.into()));
        Ok(())
    }

    /// Create a directory on disk.
    pub fn mkdir(&self, p: impl AsRef<Path>) -> Result<()> {
        let p = p.as_ref();
        let mut state = self.lock();
        match p.parent().and_then(|parent| state.disk.get(parent)) {
            Some(DiskNode::Dir) => {}
            _ => return Err(SvnError::NotFound(format!("parent of {} does not exist", p.display()))),
        }
        if state.disk.contains_key(p) {
            return Err(SvnError::AlreadyExists(p.display().to_string()));
        }
        state.disk.insert(p.to_path_buf(), DiskNode::Dir);
        Ok(())
    }

    /// Schedule an on-disk item (recursively) for addition.
    pub fn add(&self, p: impl AsRef<Path>) -> Result<()> {
        let p = p.as_ref();
        let mut state = self.lock();
        match state.entries.get(p) {
            Some(v) if v.entry.schedule == Schedule::Delete => {
                let revision = v.entry.revision;
                state.add_versioned(p, Schedule::Replace, revision)
            }
            Some(v) if !is_placeholder(&v.entry) => Err(SvnError::AlreadyExists(p.display().to_string())),
            _ => state.add_versioned(p, Schedule::Add, None),
        }
    }

    /// Schedule an item for deletion and remove it from disk. Reverts a
    /// pending addition instead.
    pub fn delete(&self, p: impl AsRef<Path>) -> Result<()> {
        let p = p.as_ref();
        let mut state = self.lock();
        let schedule = state.versioned(p)?.entry.schedule;
        for k in state.subtree(p) {
            if schedule == Schedule::Add {
                state.entries.remove(&k);
            } else if let Some(v) = state.entries.get_mut(&k) {
                v.entry.schedule = Schedule::Delete;
            }
        }
        state.remove_disk(p);
        Ok(())
    }

    /// Schedule `dst` as a copy of the versioned item `src`.
    pub fn copy(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        let (src, dst) = (src.as_ref(), dst.as_ref());
        let mut state = self.lock();
        let source = state.versioned(src)?.clone();
        if source.entry.schedule == Schedule::Add {
            return Err(SvnError::IllegalState(format!("{} is not yet committed", src.display())));
        }
        let src_url = source
            .entry
            .url
            .clone()
            .ok_or_else(|| SvnError::IllegalState(format!("{} has no URL", src.display())))?;
        let src_rev = source
            .entry
            .revision
            .ok_or_else(|| SvnError::IllegalState(format!("{} has no revision", src.display())))?;
        let parent = dst
            .parent()
            .ok_or_else(|| SvnError::IllegalState(format!("{} has no parent", dst.display())))?;
        let dst_url = {
            let name = dst.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            state.child_url(parent, &name)?
        };
        if state.disk.contains_key(dst) || state.versioned(dst).is_ok() {
            return Err(SvnError::AlreadyExists(dst.display().to_string()));
        }

        let disk: Vec<(PathBuf, DiskNode)> = state
            .disk
            .iter()
            .filter(|(k, _)| k.starts_with(src))
            .map(|(k, n)| (k.clone(), n.clone()))
            .collect();
        for (k, node) in disk {
            if let Ok(rel) = k.strip_prefix(src) {
                state.disk.insert(dst.join(rel), node);
            }
        }

        for k in state.subtree(src) {
            let Some(original) = state.entries.get(&k).cloned() else {
                continue;
            };
            if is_placeholder(&original.entry) || original.entry.schedule == Schedule::Delete {
                continue;
            }
            let Ok(rel) = k.strip_prefix(src) else {
                continue;
            };
            let target = dst.join(rel);
            let rel_url: Vec<String> = rel.iter().map(|c| c.to_string_lossy().into_owned()).collect();
            let mut copied = original.clone();
            copied.entry = Entry {
                path: target.clone(),
                name: target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                url: Some(path::url_append(&dst_url, &rel_url.join("/"))),
                copied: true,
                copy_from: None,
                schedule: Schedule::Normal,
                lock_token: None,
                changelist: None,
                ..original.entry.clone()
            };
            if target == dst {
                copied.entry.schedule = Schedule::Add;
                copied.entry.copy_from = Some((src_url.clone(), src_rev));
            }
            state.entries.insert(target, copied);
        }
        Ok(())
    }

    pub fn set_property(&self, p: impl AsRef<Path>, name: &str, value: Option<&str>) -> Result<()> {
        let mut state = self.lock();
        state.versioned_mut(p.as_ref())?.working_props.apply(name, value);
        Ok(())
    }

    /// Remove an item from disk without scheduling anything.
    pub fn remove_from_disk(&self, p: impl AsRef<Path>) {
        self.lock().remove_disk(p.as_ref());
    }

    pub fn lock_path(&self, p: impl AsRef<Path>, token: &str) -> Result<()> {
        let mut state = self.lock();
        state.versioned_mut(p.as_ref())?.entry.lock_token = Some(token.to_string());
        Ok(())
    }

    pub fn set_changelist(&self, p: impl AsRef<Path>, changelist: Option<&str>) -> Result<()> {
        let mut state = self.lock();
        state.versioned_mut(p.as_ref())?.entry.changelist = changelist.map(str::to_string);
        Ok(())
    }

    pub fn set_conflict(&self, p: impl AsRef<Path>, text: bool, props: bool) -> Result<()> {
        let mut state = self.lock();
        let entry = &mut state.versioned_mut(p.as_ref())?.entry;
        entry.text_conflict = text;
        entry.prop_conflict = props;
        Ok(())
    }

    fn open_access(&self, p: &Path, write_lock: bool) -> Result<Box<dyn WcAccess>> {
        let mut state = self.lock();
        match state.entries.get(p) {
            Some(v) if v.entry.kind == NodeKind::Dir && !is_placeholder(&v.entry) => {}
            _ => return Err(SvnError::UnversionedResource(p.to_path_buf())),
        }
        state.open_handles += 1;
        Ok(Box::new(MemoryWcAccess {
            state: self.state.clone(),
            anchor: p.to_path_buf(),
            write_lock,
            temp_files: 0,
            closed: false,
        }))
    }
}

fn fetch_dir(
    session: &dyn RepositorySession,
    state: &mut WcState,
    local: &Path,
    repo_path: &str,
    revision: u64,
) -> Result<()> {
    let (_, children) = session.get_dir(repo_path, Some(revision))?;
    let base_url = session.location().to_string();
    for child in children {
        let child_repo = path::join(repo_path, &child.name);
        let child_local = local.join(&child.name);
        let mut entry = Entry::new(&child_local, child.kind);
        entry.url = Some(path::url_append(&base_url, &child_repo));
        entry.revision = Some(revision);
        entry.committed_revision = Some(child.created_rev);
        match child.kind {
            NodeKind::Dir => {
                let (props, _) = session.get_dir(&child_repo, Some(revision))?;
                state.disk.insert(child_local.clone(), DiskNode::Dir);
                state.entries.insert(
                    child_local.clone(),
                    Versioned {
                        entry,
                        base_props: props.clone(),
                        working_props: props,
                        base_text: Bytes::new(),
                    },
                );
                fetch_dir(session, state, &child_local, &child_repo, revision)?;
            }
            _ => {
                let (props, text) = session.get_file(&child_repo, Some(revision))?;
                entry.checksum = Some(checksum(&text));
                state.disk.insert(child_local.clone(), DiskNode::File(text.clone()));
                state.entries.insert(
                    child_local,
                    Versioned {
                        entry,
                        base_props: props.clone(),
                        working_props: props,
                        base_text: text,
                    },
                );
            }
        }
    }
    Ok(())
}

impl WorkingCopy for MemoryWorkingCopy {
    fn open(&self, p: &Path, write_lock: bool, _depth: Depth) -> Result<Box<dyn WcAccess>> {
        self.open_access(p, write_lock)
    }

    fn probe_open(&self, p: &Path, write_lock: bool, depth: Depth) -> Result<Box<dyn WcAccess>> {
        let is_dir = matches!(
            self.lock().entries.get(p),
            Some(v) if v.entry.kind == NodeKind::Dir && !is_placeholder(&v.entry)
        );
        if is_dir {
            return self.open(p, write_lock, depth);
        }
        let parent = p.parent().ok_or_else(|| SvnError::UnversionedResource(p.to_path_buf()))?;
        self.open(parent, write_lock, depth)
    }
}

struct MemoryWcAccess {
    state: Arc<Mutex<WcState>>,
    anchor: PathBuf,
    write_lock: bool,
    temp_files: usize,
    closed: bool,
}

impl MemoryWcAccess {
    fn lock(&self) -> MutexGuard<'_, WcState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.closed {
            return Err(SvnError::IllegalState("working copy access is closed".into()));
        }
        if !self.write_lock {
            return Err(SvnError::IllegalState(format!(
                "working copy {} is not locked",
                self.anchor.display()
            )));
        }
        Ok(())
    }
}

impl WcAccess for MemoryWcAccess {
    fn anchor(&self) -> &Path {
        &self.anchor
    }

    fn entry(&self, p: &Path) -> Result<Option<Entry>> {
        Ok(self.lock().entries.get(p).map(|v| v.entry.clone()))
    }

    /// Not-present placeholders are left out.
    fn children(&self, dir: &Path) -> Result<Vec<Entry>> {
        let state = self.lock();
        Ok(state
            .entries
            .iter()
            .filter(|(k, v)| k.parent() == Some(dir) && !is_placeholder(&v.entry))
            .map(|(_, v)| v.entry.clone())
            .collect())
    }

    fn disk_kind(&self, p: &Path) -> Result<NodeKind> {
        Ok(match self.lock().disk.get(p) {
            Some(DiskNode::Dir) => NodeKind::Dir,
            Some(DiskNode::File(_)) => NodeKind::File,
            None => NodeKind::None,
        })
    }

    fn properties(&self, p: &Path) -> Result<PropertySet> {
        Ok(self.lock().versioned(p)?.working_props.clone())
    }

    fn base_properties(&self, p: &Path) -> Result<PropertySet> {
        Ok(self.lock().versioned(p)?.base_props.clone())
    }

    fn has_text_modifications(&self, p: &Path) -> Result<bool> {
        let state = self.lock();
        let base = &state.versioned(p)?.base_text;
        Ok(match state.disk.get(p) {
            Some(DiskNode::File(text)) => text != base,
            _ => false,
        })
    }

    fn translated_text(&mut self, p: &Path) -> Result<Bytes> {
        let mut state = self.lock();
        let text = match state.disk.get(p) {
            Some(DiskNode::File(text)) => text.clone(),
            _ => return Err(SvnError::WcMissing(p.to_path_buf())),
        };
        state.temp_files += 1;
        drop(state);
        self.temp_files += 1;
        Ok(text)
    }

    fn remove_temp_files(&mut self) -> Result<()> {
        let removed = std::mem::take(&mut self.temp_files);
        let mut state = self.lock();
        state.temp_files = state.temp_files.saturating_sub(removed);
        Ok(())
    }

    fn is_wc_root(&self, p: &Path) -> Result<bool> {
        Ok(self.lock().root == p)
    }

    fn schedule_delete(&mut self, p: &Path) -> Result<()> {
        self.ensure_writable()?;
        let mut state = self.lock();
        state.versioned(p)?;
        for k in state.subtree(p) {
            if let Some(v) = state.entries.get_mut(&k) {
                v.entry.schedule = Schedule::Delete;
            }
        }
        Ok(())
    }

    fn post_commit(&mut self, p: &Path, update: &PostCommit) -> Result<()> {
        self.ensure_writable()?;
        let revision = update
            .info
            .revision
            .ok_or_else(|| SvnError::IllegalState("post-commit without a revision".into()))?;
        let mut state = self.lock();
        state.versioned(p)?;
        let targets = if update.recurse { state.subtree(p) } else { vec![p.to_path_buf()] };
        for k in targets {
            let disk_text = match state.disk.get(&k) {
                Some(DiskNode::File(text)) => Some(text.clone()),
                _ => None,
            };
            if state.entries.get(&k).is_some_and(|v| v.entry.schedule == Schedule::Delete) {
                state.entries.remove(&k);
                continue;
            }
            let Some(v) = state.entries.get_mut(&k) else {
                continue;
            };
            let entry = &mut v.entry;
            entry.schedule = Schedule::Normal;
            entry.copied = false;
            entry.copy_from = None;
            entry.deleted = false;
            entry.revision = Some(revision);
            entry.committed_revision = Some(revision);
            if update.remove_lock {
                entry.lock_token = None;
            }
            if !update.keep_changelist {
                entry.changelist = None;
            }
            v.base_props = v.working_props.clone();
            if let Some(text) = disk_text {
                v.entry.checksum = Some(checksum(&text));
                v.base_text = text;
            }
        }
        Ok(())
    }

    fn mark_deleted(&mut self, p: &Path, revision: u64) -> Result<()> {
        self.ensure_writable()?;
        let mut state = self.lock();
        let Some(original) = state.entries.get(p).map(|v| v.entry.clone()) else {
            return Ok(());
        };
        for k in state.subtree(p) {
            state.entries.remove(&k);
        }
        let parent_versioned = p.parent().is_some_and(|parent| state.versioned(parent).is_ok());
        if parent_versioned {
            let mut placeholder = Entry::new(p, original.kind);
            placeholder.url = original.url;
            placeholder.revision = Some(revision);
            placeholder.deleted = true;
            state.entries.insert(
                p.to_path_buf(),
                Versioned {
                    entry: placeholder,
                    base_props: PropertySet::new(),
                    working_props: PropertySet::new(),
                    base_text: Bytes::new(),
                },
            );
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            let mut state = self.lock();
            state.open_handles = state.open_handles.saturating_sub(1);
        }
        Ok(())
    }
}

impl Drop for MemoryWcAccess {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("failed to close working copy access: {}", e);
        }
    }
}
