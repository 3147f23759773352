//! In-memory repository
//!
//! Keeps every revision's tree as a path -> node map plus the revision's
//! changed-path list. Sessions on it are handed out by [`Repositories`];
//! the SQLite store in `sqlite_repository` plugs in underneath as a
//! write-through [`RepositoryStore`].

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::delta::{drive_revision_delta, DeltaOptions, NodeSnapshot, SnapshotReader};
use crate::editor::{CommitEditor, CommitInfo};
use crate::error::{Result, SvnError};
use crate::object::{checksum, NodeKind, ObjectId};
use crate::path;
use crate::properties::{revprops, PropertySet};
use crate::session::{
    ChangeAction, ChangedPath, DirEntry, LogEntry, LogOptions, RepositorySession, SessionFactory,
};

/// One node of a revision tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub kind: NodeKind,
    pub props: PropertySet,
    /// File text; `None` is the empty text
    pub content: Option<ObjectId>,
    /// Last revision that changed this node or anything below it
    pub created_rev: u64,
}

impl NodeRecord {
    pub fn dir() -> Self {
        Self {
            kind: NodeKind::Dir,
            props: PropertySet::new(),
            content: None,
            created_rev: 0,
        }
    }

    pub fn file() -> Self {
        Self {
            kind: NodeKind::File,
            ..Self::dir()
        }
    }
}

/// Repository-relative path -> node, `""` being the root
pub type TreeSnapshot = BTreeMap<String, NodeRecord>;

/// A committed revision
#[derive(Debug, Clone)]
pub struct RevisionRecord {
    pub tree: Arc<TreeSnapshot>,
    /// Keyed by absolute path
    pub changes: BTreeMap<String, ChangedPath>,
}

/// Optional server capabilities; switch them off to exercise client
/// fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub get_locations: bool,
    pub replay: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            get_locations: true,
            replay: true,
        }
    }
}

/// Durable backing for a [`Repository`]
pub trait RepositoryStore: Send {
    fn save_object(&self, id: &ObjectId, data: &[u8]) -> Result<()>;

    fn save_revision(&self, revision: u64, record: &RevisionRecord, props: &PropertySet) -> Result<()>;

    fn save_revision_properties(&self, revision: u64, props: &PropertySet) -> Result<()>;
}

pub type SharedRepository = Arc<Mutex<Repository>>;

/// Lock a shared repository
pub fn lock(repo: &SharedRepository) -> Result<MutexGuard<'_, Repository>> {
    repo.lock()
        .map_err(|_| SvnError::IllegalState("repository lock poisoned".into()))
}

/// How a node's path continues into the previous revision
enum Step {
    /// Unchanged path
    Same,
    /// Copied in this revision from the given location
    Copied(String, u64),
    /// Created from scratch in this revision
    Born,
}

pub struct Repository {
    uuid: String,
    revisions: Vec<RevisionRecord>,
    revprops: Vec<PropertySet>,
    objects: HashMap<ObjectId, Bytes>,
    capabilities: Capabilities,
    store: Option<Box<dyn RepositoryStore>>,
}

impl Repository {
    /// Empty repository at revision 0
    pub fn new() -> Self {
        let mut tree = TreeSnapshot::new();
        tree.insert(String::new(), NodeRecord::dir());
        let mut props = PropertySet::new();
        props.set(revprops::DATE, format_date(Utc::now()));
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            revisions: vec![RevisionRecord {
                tree: Arc::new(tree),
                changes: BTreeMap::new(),
            }],
            revprops: vec![props],
            objects: HashMap::new(),
            capabilities: Capabilities::default(),
            store: None,
        }
    }

    /// Reassemble a repository from stored parts.
    pub fn from_parts(
        uuid: String,
        revisions: Vec<RevisionRecord>,
        revprops: Vec<PropertySet>,
        objects: HashMap<ObjectId, Bytes>,
    ) -> Result<Self> {
        if revisions.is_empty() || revisions.len() != revprops.len() {
            return Err(SvnError::Corrupt(format!(
                "{} revisions but {} revision property sets",
                revisions.len(),
                revprops.len()
            )));
        }
        Ok(Self {
            uuid,
            revisions,
            revprops,
            objects,
            capabilities: Capabilities::default(),
            store: None,
        })
    }

    pub fn with_store(mut self, store: Box<dyn RepositoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Persist everything held in memory to `store` and keep writing
    /// through it.
    pub fn attach_store(&mut self, store: Box<dyn RepositoryStore>) -> Result<()> {
        for (id, data) in &self.objects {
            store.save_object(id, data)?;
        }
        for (rev, (record, props)) in self.revisions.iter().zip(&self.revprops).enumerate() {
            store.save_revision(rev as u64, record, props)?;
        }
        self.store = Some(store);
        Ok(())
    }

    pub fn into_shared(self) -> SharedRepository {
        Arc::new(Mutex::new(self))
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn youngest(&self) -> u64 {
        (self.revisions.len() - 1) as u64
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    pub fn revision(&self, rev: u64) -> Result<&RevisionRecord> {
        self.revisions
            .get(rev as usize)
            .ok_or_else(|| SvnError::NotFound(format!("No such revision {}", rev)))
    }

    pub fn tree(&self, rev: u64) -> Result<Arc<TreeSnapshot>> {
        Ok(self.revision(rev)?.tree.clone())
    }

    pub fn node(&self, path: &str, rev: u64) -> Result<Option<&NodeRecord>> {
        Ok(self.revision(rev)?.tree.get(path))
    }

    pub fn contents(&self, node: &NodeRecord) -> Result<Bytes> {
        match &node.content {
            None => Ok(Bytes::new()),
            Some(id) => self
                .objects
                .get(id)
                .cloned()
                .ok_or_else(|| SvnError::Corrupt(format!("object {} is missing", id))),
        }
    }

    pub fn children(&self, dir: &str, rev: u64) -> Result<Vec<DirEntry>> {
        let tree = self.tree(rev)?;
        let mut entries = Vec::new();
        for (p, node) in tree.range::<str, _>((std::ops::Bound::Excluded(dir), std::ops::Bound::Unbounded)) {
            if !path::is_ancestor(dir, p) {
                if dir.is_empty() || !p.starts_with(dir) {
                    break;
                }
                continue;
            }
            if path::dirname(p) != dir {
                continue;
            }
            let size = match node.kind {
                NodeKind::File => self.contents(node)?.len() as u64,
                _ => 0,
            };
            entries.push(DirEntry {
                name: path::basename(p).to_string(),
                kind: node.kind,
                size,
                created_rev: node.created_rev,
            });
        }
        Ok(entries)
    }

    pub fn revision_properties(&self, rev: u64) -> Result<&PropertySet> {
        self.revprops
            .get(rev as usize)
            .ok_or_else(|| SvnError::NotFound(format!("No such revision {}", rev)))
    }

    pub fn set_revision_property(&mut self, rev: u64, name: &str, value: Option<&str>) -> Result<()> {
        let mut props = self.revision_properties(rev)?.clone();
        props.apply(name, value);
        if let Some(store) = &self.store {
            store.save_revision_properties(rev, &props)?;
        }
        self.revprops[rev as usize] = props;
        Ok(())
    }

    pub fn dated_revision(&self, date: DateTime<Utc>) -> u64 {
        let mut found = 0;
        for (rev, props) in self.revprops.iter().enumerate() {
            match props.get(revprops::DATE).and_then(|d| parse_date(d)) {
                Some(d) if d <= date => found = rev as u64,
                Some(_) => break,
                None => {}
            }
        }
        found
    }

    fn step(&self, p: &str, rev: u64) -> Result<Step> {
        let changes = &self.revision(rev)?.changes;
        let mut candidate = Some(p);
        while let Some(current) = candidate {
            if let Some(change) = changes.get(&path::to_absolute(current)) {
                if change.action.is_addition() {
                    return Ok(match &change.copy_from {
                        Some((src, src_rev)) => {
                            let suffix = path::skip_ancestor(current, p).unwrap_or_default();
                            Step::Copied(path::join(&path::from_absolute(src), suffix), *src_rev)
                        }
                        None => Step::Born,
                    });
                }
            }
            candidate = if current.is_empty() { None } else { Some(path::dirname(current)) };
        }
        Ok(Step::Same)
    }

    /// Whether revision `rev` touched `p`, something below it, or replaced
    /// one of its parents.
    fn touches(&self, p: &str, rev: u64) -> Result<bool> {
        if p.is_empty() {
            return Ok(true);
        }
        let changes = &self.revision(rev)?.changes;
        Ok(changes.iter().any(|(abs, change)| {
            let k = path::from_absolute(abs);
            path::is_ancestor(p, &k) || (path::is_ancestor(&k, p) && change.action != ChangeAction::Modified)
        }))
    }

    fn log_path(&self, p: &str, lo: u64, hi: u64, stop_on_copy: bool) -> Result<Vec<u64>> {
        if self.node(p, hi)?.is_none() {
            return Err(SvnError::NotFound(format!("File not found: revision {}, path '/{}'", hi, p)));
        }
        let mut revs = Vec::new();
        let mut current = p.to_string();
        let mut rev = hi;
        loop {
            if self.touches(&current, rev)? {
                revs.push(rev);
            }
            if rev <= lo {
                break;
            }
            match self.step(&current, rev)? {
                Step::Same => {}
                Step::Copied(_, _) if stop_on_copy => break,
                Step::Copied(src, _) => current = src,
                Step::Born => break,
            }
            rev -= 1;
        }
        Ok(revs)
    }

    /// Log over repository-relative `paths`.
    pub fn log(&self, paths: &[String], start: u64, end: u64, options: &LogOptions) -> Result<Vec<LogEntry>> {
        let (lo, hi) = (start.min(end), start.max(end));
        if hi > self.youngest() {
            return Err(SvnError::NotFound(format!("No such revision {}", hi)));
        }
        let mut revs = BTreeSet::new();
        let targets: Vec<String> = if paths.is_empty() { vec![String::new()] } else { paths.to_vec() };
        for p in &targets {
            revs.extend(self.log_path(&path::canonicalize(p), lo, hi, options.stop_on_copy)?);
        }
        let mut ordered: Vec<u64> = revs.into_iter().collect();
        if start >= end {
            ordered.reverse();
        }
        if options.limit > 0 {
            ordered.truncate(options.limit);
        }
        ordered.into_iter().map(|rev| self.log_entry(rev, options.discover_changed_paths)).collect()
    }

    fn log_entry(&self, rev: u64, changed_paths: bool) -> Result<LogEntry> {
        let props = self.revision_properties(rev)?;
        Ok(LogEntry {
            revision: rev,
            author: props.get(revprops::AUTHOR).cloned(),
            date: props.get(revprops::DATE).and_then(|d| parse_date(d)),
            message: props.get(revprops::LOG).cloned(),
            changed_paths: changed_paths.then(|| self.revisions[rev as usize].changes.clone()),
        })
    }

    /// Where the node at `p@peg` lived in each requested revision.
    pub fn locations(&self, p: &str, peg: u64, revisions: &[u64]) -> Result<BTreeMap<u64, String>> {
        if self.node(p, peg)?.is_none() {
            return Err(SvnError::NotFound(format!("Path '/{}' not found in revision {}", p, peg)));
        }
        let mut found = BTreeMap::new();
        let older: BTreeSet<u64> = revisions.iter().copied().filter(|r| *r <= peg).collect();
        let newer: BTreeSet<u64> = revisions.iter().copied().filter(|r| *r > peg).collect();

        if let Some(&oldest) = older.iter().next() {
            let mut current = p.to_string();
            let mut rev = peg;
            loop {
                if older.contains(&rev) {
                    found.insert(rev, path::to_absolute(&current));
                }
                if rev == 0 || rev <= oldest {
                    break;
                }
                match self.step(&current, rev)? {
                    Step::Same => rev -= 1,
                    Step::Copied(src, src_rev) => {
                        for r in older.range(src_rev + 1..rev) {
                            found.insert(*r, path::to_absolute(&src));
                        }
                        current = src;
                        rev = src_rev;
                    }
                    Step::Born => break,
                }
            }
        }

        if let Some(&newest) = newer.iter().next_back() {
            if newest > self.youngest() {
                return Err(SvnError::NotFound(format!("No such revision {}", newest)));
            }
            for rev in peg + 1..=newest {
                let changes = &self.revision(rev)?.changes;
                let broken = changes.iter().any(|(abs, change)| {
                    path::is_ancestor(&path::from_absolute(abs), p) && change.action != ChangeAction::Modified
                });
                if broken {
                    break;
                }
                if newer.contains(&rev) {
                    found.insert(rev, path::to_absolute(p));
                }
            }
        }
        Ok(found)
    }

    fn commit_transaction(&mut self, txn: Transaction) -> Result<CommitInfo> {
        if self.youngest() != txn.base_head {
            return Err(SvnError::OutOfDate(format!(
                "transaction based on r{} but HEAD is r{}",
                txn.base_head,
                self.youngest()
            )));
        }
        let new_rev = self.youngest() + 1;
        let mut tree = txn.tree;
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for p in txn.changes.keys() {
            if tree.contains_key(p) {
                touched.insert(p.clone());
            }
            touched.extend(path::ancestors(p).map(str::to_string));
            touched.insert(String::new());
        }
        for p in &touched {
            if let Some(node) = tree.get_mut(p) {
                node.created_rev = new_rev;
            }
        }

        let mut new_objects = Vec::new();
        for (p, text) in txn.texts {
            let id = ObjectId::from_data(&text);
            if let Some(node) = tree.get_mut(&p) {
                node.content = if text.is_empty() { None } else { Some(id) };
            }
            if !text.is_empty() && !self.objects.contains_key(&id) {
                new_objects.push((id, text));
            }
        }

        let date = Utc::now();
        let mut props = txn.revprops;
        props.set(revprops::DATE, format_date(date));
        if let Some(author) = &txn.author {
            props.set(revprops::AUTHOR, author.clone());
        }
        let record = RevisionRecord {
            tree: Arc::new(tree),
            changes: txn
                .changes
                .into_iter()
                .map(|(p, c)| (path::to_absolute(&p), c))
                .collect(),
        };

        if let Some(store) = &self.store {
            for (id, data) in &new_objects {
                store.save_object(id, data)?;
            }
            store.save_revision(new_rev, &record, &props)?;
        }
        self.objects.extend(new_objects);
        self.revisions.push(record);
        self.revprops.push(props);
        tracing::debug!("committed r{} in repository {}", new_rev, self.uuid);
        Ok(CommitInfo::new(new_rev, txn.author, Some(date)))
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_date(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
}

// Commit transactions ----------------------------------------------------

struct Transaction {
    base_head: u64,
    tree: TreeSnapshot,
    changes: BTreeMap<String, ChangedPath>,
    texts: BTreeMap<String, Bytes>,
    revprops: PropertySet,
    author: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Open,
    Closed,
    Aborted,
}

/// Commit editor building one transaction against HEAD
pub struct TxnEditor {
    repo: SharedRepository,
    anchor: String,
    txn: Transaction,
    dir_bases: HashMap<String, Option<u64>>,
    state: TxnState,
}

impl TxnEditor {
    fn new(repo: SharedRepository, anchor: String, revprops: PropertySet, author: Option<String>) -> Result<Self> {
        let (base_head, tree) = {
            let guard = lock(&repo)?;
            let head = guard.youngest();
            (head, (*guard.tree(head)?).clone())
        };
        Ok(Self {
            repo,
            anchor,
            txn: Transaction {
                base_head,
                tree,
                changes: BTreeMap::new(),
                texts: BTreeMap::new(),
                revprops,
                author,
            },
            dir_bases: HashMap::new(),
            state: TxnState::Open,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TxnState::Open => Ok(()),
            TxnState::Closed => Err(SvnError::IllegalState("commit edit already closed".into())),
            TxnState::Aborted => Err(SvnError::IllegalState("commit edit was aborted".into())),
        }
    }

    fn full(&self, p: &str) -> String {
        path::canonicalize(&path::join(&self.anchor, p))
    }

    fn existing(&self, full: &str, kind: NodeKind) -> Result<&NodeRecord> {
        match self.txn.tree.get(full) {
            Some(node) if node.kind == kind => Ok(node),
            Some(node) => Err(SvnError::IllegalState(format!(
                "'/{}' is a {}, expected a {}",
                full, node.kind, kind
            ))),
            None => Err(SvnError::NotFound(format!("path '/{}' not present", full))),
        }
    }

    fn text(&self, full: &str) -> Result<Bytes> {
        if let Some(text) = self.txn.texts.get(full) {
            return Ok(text.clone());
        }
        let node = self.existing(full, NodeKind::File)?;
        lock(&self.repo)?.contents(node)
    }

    fn check_out_of_date(&self, full: &str, base: Option<u64>) -> Result<()> {
        if let (Some(base), Some(node)) = (base, self.txn.tree.get(full)) {
            let added_here = self.txn.changes.get(full).is_some_and(|c| c.action.is_addition());
            if !added_here && node.created_rev > base {
                return Err(SvnError::OutOfDate(format!("/{}", full)));
            }
        }
        Ok(())
    }

    fn add_node(&mut self, p: &str, kind: NodeKind, copy_from: Option<(&str, u64)>) -> Result<()> {
        self.ensure_open()?;
        let full = self.full(p);
        self.existing(path::dirname(&full), NodeKind::Dir)?;
        if self.txn.tree.contains_key(&full) {
            return Err(SvnError::AlreadyExists(format!("/{}", full)));
        }
        match copy_from {
            Some((src, src_rev)) => {
                let src = path::from_absolute(src);
                let source_tree = lock(&self.repo)?.tree(src_rev)?;
                match source_tree.get(&src) {
                    Some(node) if node.kind == kind => {}
                    Some(_) => {
                        return Err(SvnError::IllegalState(format!(
                            "copy source '/{}@{}' is not a {}",
                            src, src_rev, kind
                        )));
                    }
                    None => {
                        return Err(SvnError::NotFound(format!("path '/{}' not present in revision {}", src, src_rev)));
                    }
                }
                for (k, node) in source_tree.iter().filter(|(k, _)| path::is_ancestor(&src, k)) {
                    let suffix = path::skip_ancestor(&src, k).unwrap_or_default();
                    self.txn.tree.insert(path::join(&full, suffix), node.clone());
                }
            }
            None => {
                let node = if kind == NodeKind::Dir { NodeRecord::dir() } else { NodeRecord::file() };
                self.txn.tree.insert(full.clone(), node);
            }
        }
        let action = match self.txn.changes.get(&full).map(|c| c.action) {
            Some(ChangeAction::Deleted) | Some(ChangeAction::Replaced) => ChangeAction::Replaced,
            _ => ChangeAction::Added,
        };
        self.txn.changes.insert(
            full,
            ChangedPath {
                action,
                copy_from: copy_from.map(|(src, rev)| (path::to_absolute(src), rev)),
                kind,
            },
        );
        Ok(())
    }

    fn record_modified(&mut self, full: &str, kind: NodeKind) {
        self.txn
            .changes
            .entry(full.to_string())
            .or_insert_with(|| ChangedPath::new(ChangeAction::Modified, kind));
    }
}

impl CommitEditor for TxnEditor {
    fn open_root(&mut self, base_revision: Option<u64>) -> Result<()> {
        self.ensure_open()?;
        let anchor = self.anchor.clone();
        self.existing(&anchor, NodeKind::Dir)?;
        self.dir_bases.insert(anchor, base_revision);
        Ok(())
    }

    fn delete_entry(&mut self, p: &str, revision: Option<u64>) -> Result<()> {
        self.ensure_open()?;
        let full = self.full(p);
        let kind = match self.txn.tree.get(&full) {
            Some(node) => node.kind,
            None => return Err(SvnError::NotFound(format!("path '/{}' not present", full))),
        };
        self.check_out_of_date(&full, revision)?;
        self.txn.tree.retain(|k, _| !path::is_ancestor(&full, k));
        self.txn.texts.retain(|k, _| !path::is_ancestor(&full, k));
        let previous = self.txn.changes.get(&full).map(|c| c.action);
        self.txn.changes.retain(|k, _| !path::is_ancestor(&full, k));
        if previous != Some(ChangeAction::Added) {
            self.txn.changes.insert(full, ChangedPath::new(ChangeAction::Deleted, kind));
        }
        Ok(())
    }

    fn add_dir(&mut self, p: &str, copy_from: Option<(&str, u64)>) -> Result<()> {
        self.add_node(p, NodeKind::Dir, copy_from)?;
        let full = self.full(p);
        self.dir_bases.insert(full, None);
        Ok(())
    }

    fn open_dir(&mut self, p: &str, base_revision: Option<u64>) -> Result<()> {
        self.ensure_open()?;
        let full = self.full(p);
        self.existing(&full, NodeKind::Dir)?;
        self.dir_bases.insert(full, base_revision);
        Ok(())
    }

    fn change_dir_property(&mut self, p: &str, name: &str, value: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let full = self.full(p);
        self.existing(&full, NodeKind::Dir)?;
        let base = self.dir_bases.get(&full).copied().flatten();
        self.check_out_of_date(&full, base)?;
        if let Some(node) = self.txn.tree.get_mut(&full) {
            node.props.apply(name, value);
        }
        self.record_modified(&full, NodeKind::Dir);
        Ok(())
    }

    fn close_dir(&mut self, p: &str) -> Result<()> {
        self.ensure_open()?;
        let full = self.full(p);
        self.dir_bases.remove(&full);
        Ok(())
    }

    fn add_file(&mut self, p: &str, copy_from: Option<(&str, u64)>) -> Result<()> {
        self.add_node(p, NodeKind::File, copy_from)
    }

    fn open_file(&mut self, p: &str, base_revision: Option<u64>) -> Result<()> {
        self.ensure_open()?;
        let full = self.full(p);
        self.existing(&full, NodeKind::File)?;
        self.check_out_of_date(&full, base_revision)
    }

    fn apply_text_delta(&mut self, p: &str, base_checksum: Option<&str>, contents: Bytes) -> Result<()> {
        self.ensure_open()?;
        let full = self.full(p);
        if let Some(expected) = base_checksum {
            let actual = checksum(&self.text(&full)?);
            if actual != expected {
                return Err(SvnError::ChecksumMismatch {
                    path: format!("/{}", full),
                    expected: expected.to_string(),
                    actual,
                });
            }
        } else {
            self.existing(&full, NodeKind::File)?;
        }
        self.txn.texts.insert(full.clone(), contents);
        self.record_modified(&full, NodeKind::File);
        Ok(())
    }

    fn change_file_property(&mut self, p: &str, name: &str, value: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let full = self.full(p);
        self.existing(&full, NodeKind::File)?;
        if let Some(node) = self.txn.tree.get_mut(&full) {
            node.props.apply(name, value);
        }
        self.record_modified(&full, NodeKind::File);
        Ok(())
    }

    fn close_file(&mut self, p: &str, text_checksum: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let full = self.full(p);
        if let Some(expected) = text_checksum {
            let actual = checksum(&self.text(&full)?);
            if actual != expected {
                return Err(SvnError::ChecksumMismatch {
                    path: format!("/{}", full),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(())
    }

    fn close_edit(&mut self) -> Result<CommitInfo> {
        self.ensure_open()?;
        self.state = TxnState::Closed;
        let txn = std::mem::replace(
            &mut self.txn,
            Transaction {
                base_head: 0,
                tree: TreeSnapshot::new(),
                changes: BTreeMap::new(),
                texts: BTreeMap::new(),
                revprops: PropertySet::new(),
                author: None,
            },
        );
        lock(&self.repo)?.commit_transaction(txn)
    }

    fn abort_edit(&mut self) -> Result<()> {
        if self.state == TxnState::Open {
            self.state = TxnState::Aborted;
            tracing::debug!("commit transaction aborted");
        }
        Ok(())
    }
}

// Sessions -----------------------------------------------------------------

/// Reads revision trees of a shared repository, locking per call
pub struct RepositoryReader {
    repo: SharedRepository,
}

impl RepositoryReader {
    pub fn new(repo: SharedRepository) -> Self {
        Self { repo }
    }
}

impl SnapshotReader for RepositoryReader {
    fn node(&self, p: &str, revision: u64) -> Result<Option<NodeSnapshot>> {
        let guard = lock(&self.repo)?;
        let Some(node) = guard.node(p, revision)? else {
            return Ok(None);
        };
        let checksum = match node.kind {
            NodeKind::File => Some(checksum(&guard.contents(node)?)),
            _ => None,
        };
        Ok(Some(NodeSnapshot {
            kind: node.kind,
            props: node.props.clone(),
            checksum,
        }))
    }

    fn contents(&self, p: &str, revision: u64) -> Result<Bytes> {
        let guard = lock(&self.repo)?;
        match guard.node(p, revision)? {
            Some(node) if node.kind == NodeKind::File => guard.contents(node),
            _ => Err(SvnError::NotFound(format!("file '/{}' not present in revision {}", p, revision))),
        }
    }

    fn children(&self, p: &str, revision: u64) -> Result<Vec<(String, NodeKind)>> {
        let guard = lock(&self.repo)?;
        Ok(guard.children(p, revision)?.into_iter().map(|e| (e.name, e.kind)).collect())
    }
}

/// Session on a [`Repository`] held in this process
pub struct LocalSession {
    repo: SharedRepository,
    root_url: String,
    location: String,
    path: String,
    username: Option<String>,
}

impl LocalSession {
    pub fn new(repo: SharedRepository, root_url: &str, location: &str, username: Option<String>) -> Result<Self> {
        let root_url = path::canonicalize_url(root_url)?;
        let location = path::canonicalize_url(location)?;
        let path = path::url_skip_ancestor(&root_url, &location).ok_or_else(|| {
            SvnError::IllegalUrl(format!("'{}' is not inside repository '{}'", location, root_url))
        })?;
        Ok(Self {
            repo,
            root_url,
            location,
            path,
            username,
        })
    }

    pub fn repository(&self) -> &SharedRepository {
        &self.repo
    }

    fn full(&self, p: &str) -> String {
        path::canonicalize(&path::join(&self.path, p))
    }

    fn resolve_rev(repo: &Repository, revision: Option<u64>) -> Result<u64> {
        let rev = revision.unwrap_or_else(|| repo.youngest());
        repo.revision(rev)?;
        Ok(rev)
    }
}

impl RepositorySession for LocalSession {
    fn location(&self) -> &str {
        &self.location
    }

    fn repository_root(&self) -> Result<String> {
        Ok(self.root_url.clone())
    }

    fn repository_uuid(&self) -> Result<String> {
        Ok(lock(&self.repo)?.uuid().to_string())
    }

    fn latest_revision(&self) -> Result<u64> {
        Ok(lock(&self.repo)?.youngest())
    }

    fn dated_revision(&self, date: DateTime<Utc>) -> Result<u64> {
        Ok(lock(&self.repo)?.dated_revision(date))
    }

    fn check_path(&self, p: &str, revision: Option<u64>) -> Result<NodeKind> {
        let repo = lock(&self.repo)?;
        let rev = Self::resolve_rev(&repo, revision)?;
        Ok(repo.node(&self.full(p), rev)?.map(|n| n.kind).unwrap_or(NodeKind::None))
    }

    fn get_file(&self, p: &str, revision: Option<u64>) -> Result<(PropertySet, Bytes)> {
        let repo = lock(&self.repo)?;
        let rev = Self::resolve_rev(&repo, revision)?;
        let full = self.full(p);
        match repo.node(&full, rev)? {
            Some(node) if node.kind == NodeKind::File => Ok((node.props.clone(), repo.contents(node)?)),
            Some(_) => Err(SvnError::IllegalState(format!("'/{}' is not a file in revision {}", full, rev))),
            None => Err(SvnError::NotFound(format!("path '/{}' not found in revision {}", full, rev))),
        }
    }

    fn get_dir(&self, p: &str, revision: Option<u64>) -> Result<(PropertySet, Vec<DirEntry>)> {
        let repo = lock(&self.repo)?;
        let rev = Self::resolve_rev(&repo, revision)?;
        let full = self.full(p);
        match repo.node(&full, rev)? {
            Some(node) if node.kind == NodeKind::Dir => Ok((node.props.clone(), repo.children(&full, rev)?)),
            Some(_) => Err(SvnError::IllegalState(format!("'/{}' is not a directory in revision {}", full, rev))),
            None => Err(SvnError::NotFound(format!("path '/{}' not found in revision {}", full, rev))),
        }
    }

    fn revision_property(&self, revision: u64, name: &str) -> Result<Option<String>> {
        Ok(lock(&self.repo)?.revision_properties(revision)?.get(name).cloned())
    }

    fn set_revision_property(&self, revision: u64, name: &str, value: Option<&str>) -> Result<()> {
        lock(&self.repo)?.set_revision_property(revision, name, value)
    }

    fn revision_properties(&self, revision: u64) -> Result<PropertySet> {
        Ok(lock(&self.repo)?.revision_properties(revision)?.clone())
    }

    fn get_locations(&self, p: &str, peg: u64, revisions: &[u64]) -> Result<BTreeMap<u64, String>> {
        let repo = lock(&self.repo)?;
        if !repo.capabilities().get_locations {
            return Err(SvnError::NotImplemented("get-locations".into()));
        }
        repo.locations(&self.full(p), peg, revisions)
    }

    fn log(
        &self,
        paths: &[String],
        start: u64,
        end: u64,
        options: &LogOptions,
        handler: &mut dyn FnMut(&LogEntry) -> Result<()>,
    ) -> Result<usize> {
        let targets: Vec<String> = if paths.is_empty() {
            vec![self.path.clone()]
        } else {
            paths.iter().map(|p| self.full(p)).collect()
        };
        let entries = lock(&self.repo)?.log(&targets, start, end, options)?;
        for entry in &entries {
            handler(entry)?;
        }
        Ok(entries.len())
    }

    fn replay(
        &self,
        revision: u64,
        low_water_mark: u64,
        send_deltas: bool,
        editor: &mut dyn CommitEditor,
    ) -> Result<()> {
        let changes = {
            let repo = lock(&self.repo)?;
            if !repo.capabilities().replay {
                return Err(SvnError::NotImplemented("replay".into()));
            }
            repo.revision(revision)?.changes.clone()
        };
        let reader = RepositoryReader::new(self.repo.clone());
        drive_revision_delta(
            &reader,
            revision,
            &changes,
            editor,
            DeltaOptions {
                low_water_mark,
                send_deltas,
                base_revision: None,
            },
        )
    }

    fn commit_editor(
        &self,
        message: &str,
        lock_tokens: &BTreeMap<String, String>,
        keep_locks: bool,
        revision_properties: &PropertySet,
    ) -> Result<Box<dyn CommitEditor>> {
        let mut props = revision_properties.clone();
        props.set(revprops::LOG, message);
        tracing::debug!(
            "opening commit editor at {} ({} lock tokens, keep_locks={})",
            self.location,
            lock_tokens.len(),
            keep_locks
        );
        Ok(Box::new(TxnEditor::new(
            self.repo.clone(),
            self.path.clone(),
            props,
            self.username.clone(),
        )?))
    }
}

// Registry -------------------------------------------------------------------

/// Repositories reachable by URL: `mem://name` for in-memory ones and
/// `file:///dir` for SQLite ones.
#[derive(Default)]
pub struct Repositories {
    repos: Mutex<BTreeMap<String, SharedRepository>>,
    username: Option<String>,
}

impl Repositories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Author recorded on commits made through sessions from this registry
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    fn registry(&self) -> Result<MutexGuard<'_, BTreeMap<String, SharedRepository>>> {
        self.repos
            .lock()
            .map_err(|_| SvnError::IllegalState("repository registry lock poisoned".into()))
    }

    /// Register `repo` under `root_url`.
    pub fn insert(&self, root_url: &str, repo: SharedRepository) -> Result<()> {
        let root_url = path::canonicalize_url(root_url)?;
        let mut repos = self.registry()?;
        if repos.contains_key(&root_url) {
            return Err(SvnError::AlreadyExists(root_url));
        }
        repos.insert(root_url, repo);
        Ok(())
    }

    /// Create an empty in-memory repository at `mem://<name>`.
    pub fn create_memory(&self, name: &str) -> Result<SharedRepository> {
        let repo = Repository::new().into_shared();
        self.insert(&format!("mem://{}", name), repo.clone())?;
        Ok(repo)
    }

    pub fn get(&self, root_url: &str) -> Result<Option<SharedRepository>> {
        let root_url = path::canonicalize_url(root_url)?;
        Ok(self.registry()?.get(&root_url).cloned())
    }

    fn find(&self, url: &str) -> Result<(String, SharedRepository)> {
        {
            let repos = self.registry()?;
            let best = repos
                .iter()
                .filter(|(root, _)| path::url_skip_ancestor(root, url).is_some())
                .max_by_key(|(root, _)| root.len());
            if let Some((root, repo)) = best {
                return Ok((root.clone(), repo.clone()));
            }
        }
        if url.starts_with("file://") {
            let (root, repo) = crate::sqlite_repository::SqliteRepository::open_url(url)?;
            let shared = repo.into_shared();
            self.insert(&root, shared.clone())?;
            return Ok((root, shared));
        }
        Err(SvnError::NotFound(format!("Unable to open a repository at URL '{}'", url)))
    }
}

impl SessionFactory for Repositories {
    fn open(&self, url: &str) -> Result<Box<dyn RepositorySession>> {
        let url = path::canonicalize_url(url)?;
        let (root, repo) = self.find(&url)?;
        Ok(Box::new(LocalSession::new(repo, &root, &url, self.username.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(session: &dyn RepositorySession, edit: impl FnOnce(&mut dyn CommitEditor) -> Result<()>) -> u64 {
        let mut editor = session
            .commit_editor("test", &BTreeMap::new(), false, &PropertySet::new())
            .unwrap();
        editor.open_root(None).unwrap();
        edit(editor.as_mut()).unwrap();
        editor.close_dir("").unwrap();
        editor.close_edit().unwrap().revision.unwrap()
    }

    fn add_file(editor: &mut dyn CommitEditor, p: &str, text: &str) -> Result<()> {
        editor.add_file(p, None)?;
        editor.apply_text_delta(p, None, Bytes::from(text.to_string()))?;
        editor.close_file(p, Some(&checksum(text.as_bytes())))
    }

    fn setup() -> (Repositories, Box<dyn RepositorySession>) {
        let repos = Repositories::new().with_username("tester");
        repos.create_memory("r").unwrap();
        let session = repos.open("mem://r").unwrap();
        (repos, session)
    }

    #[test]
    fn test_repository_create() {
        let (_repos, session) = setup();
        assert_eq!(session.latest_revision().unwrap(), 0);
        assert!(session.is_at_root().unwrap());
        assert_eq!(session.check_path("", None).unwrap(), NodeKind::Dir);
        assert!(session.revision_property(0, revprops::DATE).unwrap().is_some());
    }

    #[test]
    fn test_commit_and_read_back() {
        let (_repos, session) = setup();
        let rev = commit(session.as_ref(), |e| {
            e.add_dir("trunk", None)?;
            add_file(e, "trunk/a.txt", "hello")?;
            e.close_dir("trunk")
        });
        assert_eq!(rev, 1);
        let (_, text) = session.get_file("trunk/a.txt", None).unwrap();
        assert_eq!(&text[..], b"hello");
        assert_eq!(session.revision_property(1, revprops::LOG).unwrap().as_deref(), Some("test"));
        assert_eq!(session.revision_property(1, revprops::AUTHOR).unwrap().as_deref(), Some("tester"));
        let (_, entries) = session.get_dir("trunk", Some(1)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 5);
        assert_eq!(session.check_path("trunk", Some(0)).unwrap(), NodeKind::None);
    }

    #[test]
    fn test_edit_conflicts() {
        let (_repos, session) = setup();
        commit(session.as_ref(), |e| add_file(e, "a.txt", "1"));
        commit(session.as_ref(), |e| {
            e.open_file("a.txt", Some(1))?;
            e.apply_text_delta("a.txt", Some(&checksum(b"1")), Bytes::from_static(b"2"))?;
            e.close_file("a.txt", None)
        });

        let mut editor = session
            .commit_editor("x", &BTreeMap::new(), false, &PropertySet::new())
            .unwrap();
        editor.open_root(Some(1)).unwrap();
        assert!(matches!(editor.add_file("a.txt", None), Err(SvnError::AlreadyExists(_))));
        assert!(matches!(editor.open_file("a.txt", Some(1)), Err(SvnError::OutOfDate(_))));
        assert!(matches!(editor.delete_entry("nope", None), Err(SvnError::NotFound(_))));
        editor.open_file("a.txt", Some(2)).unwrap();
        assert!(matches!(
            editor.apply_text_delta("a.txt", Some("bogus"), Bytes::new()),
            Err(SvnError::ChecksumMismatch { .. })
        ));
        editor.abort_edit().unwrap();
        assert!(editor.close_edit().is_err());
        assert_eq!(session.latest_revision().unwrap(), 2);
    }

    #[test]
    fn test_log_and_locations_follow_copies() {
        let (_repos, session) = setup();
        commit(session.as_ref(), |e| {
            e.add_dir("trunk", None)?;
            add_file(e, "trunk/f.txt", "v1")?;
            e.close_dir("trunk")
        });
        commit(session.as_ref(), |e| {
            e.add_dir("branch", Some(("/trunk", 1)))?;
            e.close_dir("branch")
        });
        commit(session.as_ref(), |e| {
            e.open_dir("branch", None)?;
            e.open_file("branch/f.txt", None)?;
            e.apply_text_delta("branch/f.txt", None, Bytes::from_static(b"v2"))?;
            e.close_file("branch/f.txt", None)?;
            e.close_dir("branch")
        });

        let mut revs = Vec::new();
        let options = LogOptions {
            discover_changed_paths: true,
            ..LogOptions::default()
        };
        session
            .log(&["branch/f.txt".to_string()], 3, 0, &options, &mut |entry| {
                revs.push(entry.revision);
                Ok(())
            })
            .unwrap();
        assert_eq!(revs, vec![3, 2, 1]);

        let locations = session.get_locations("branch/f.txt", 3, &[1, 2, 3]).unwrap();
        assert_eq!(locations[&1], "/trunk/f.txt");
        assert_eq!(locations[&2], "/branch/f.txt");
        assert_eq!(locations[&3], "/branch/f.txt");

        let changes = session.revision_properties(2).unwrap();
        assert!(changes.contains(revprops::DATE));
    }

    #[test]
    fn test_capabilities_switch_off() {
        let (repos, session) = setup();
        let repo = repos.get("mem://r").unwrap().unwrap();
        lock(&repo).unwrap().set_capabilities(Capabilities {
            get_locations: false,
            replay: false,
        });
        assert!(session.get_locations("", 0, &[0]).unwrap_err().is_not_implemented());
    }
}
