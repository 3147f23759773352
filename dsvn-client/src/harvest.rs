//! Collecting local modifications into a commit packet

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dsvn_core::path;
use dsvn_core::properties::svn_props;
use dsvn_core::{
    Depth, Entry, Event, EventAction, EventDispatcher, FixedPolicy, MissingAction, MissingItemPolicy,
    NodeKind, Result, Schedule, SvnError, WcAccess, WorkingCopy,
};

use crate::packet::{CommitFlags, CommitItem, CommitPacket};

/// Walks working-copy entries and records every change to commit.
#[derive(Clone)]
pub struct CommitHarvester {
    wc: Arc<dyn WorkingCopy>,
    events: EventDispatcher,
    policy: Arc<dyn MissingItemPolicy>,
}

impl CommitHarvester {
    pub fn new(wc: Arc<dyn WorkingCopy>) -> Self {
        Self {
            wc,
            events: EventDispatcher::default(),
            policy: Arc::new(FixedPolicy::default()),
        }
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn with_missing_policy(mut self, policy: Arc<dyn MissingItemPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Harvest the changes below `paths`.
    ///
    /// The returned packet holds a write-locked access scope on the common
    /// ancestor of `paths`, or nothing at all when there is nothing to
    /// commit. A non-empty `changelists` only records items belonging to one
    /// of the named changelists.
    pub fn harvest(
        &self,
        paths: &[PathBuf],
        depth: Depth,
        keep_locks: bool,
        force: bool,
        changelists: &[String],
    ) -> Result<CommitPacket> {
        let Some(base) = common_path(paths) else {
            return Ok(CommitPacket::empty());
        };
        let access = self.wc.probe_open(&base, true, depth)?;
        let mut packet = CommitPacket::open(access);

        let (items, lock_tokens) = {
            let access = packet
                .access_mut()
                .ok_or_else(|| SvnError::IllegalState("commit packet lost its access scope".into()))?;
            let mut harvest = Harvest {
                access,
                events: &self.events,
                policy: self.policy.as_ref(),
                just_locked: !keep_locks,
                changelists,
                items: BTreeMap::new(),
                lock_tokens: BTreeMap::new(),
            };
            harvest.targets(paths, depth, force)?;
            (harvest.items, harvest.lock_tokens)
        };

        if items.is_empty() {
            packet.dispose()?;
            tracing::debug!("nothing to commit below {}", base.display());
            return Ok(CommitPacket::empty());
        }
        tracing::debug!("harvested {} commit items below {}", items.len(), base.display());
        packet.set_contents(items.into_values().collect(), lock_tokens);
        Ok(packet)
    }
}

struct Harvest<'a> {
    access: &'a mut dyn WcAccess,
    events: &'a EventDispatcher,
    policy: &'a dyn MissingItemPolicy,
    just_locked: bool,
    changelists: &'a [String],
    items: BTreeMap<PathBuf, CommitItem>,
    lock_tokens: BTreeMap<String, String>,
}

impl Harvest<'_> {
    fn targets(&mut self, paths: &[PathBuf], depth: Depth, force: bool) -> Result<()> {
        let sole = paths.len() == 1;
        let mut danglers = BTreeSet::new();
        let mut forced_recursion = false;

        for target in paths {
            self.events.check_cancelled()?;
            let entry = match self.versioned_entry(target)? {
                Some(entry) => entry,
                None => {
                    let err = SvnError::UnversionedResource(target.clone());
                    if sole {
                        return Err(err);
                    }
                    self.events.dispatch(Event::failed(err).with_path(target), None)?;
                    continue;
                }
            };
            let url = entry
                .url
                .clone()
                .ok_or_else(|| SvnError::IllegalUrl(format!("'{}' has no URL", target.display())))?;

            let mut parent_entry = None;
            if matches!(entry.schedule, Schedule::Add | Schedule::Replace) {
                let parent = self.parent_entry(target)?.ok_or_else(|| {
                    SvnError::IllegalTarget(format!(
                        "'{}' is scheduled for addition within unversioned parent",
                        target.display()
                    ))
                })?;
                if matches!(parent.schedule, Schedule::Add | Schedule::Replace) {
                    danglers.insert(parent.path.clone());
                }
                parent_entry = Some(parent);
            }

            let mut target_depth = depth;
            if entry.copied && entry.schedule == Schedule::Normal {
                if !force {
                    return Err(SvnError::IllegalTarget(format!(
                        "'{}' is marked as copied but is not itself scheduled for addition",
                        target.display()
                    )));
                }
                continue;
            } else if entry.copied && entry.schedule == Schedule::Add {
                if force {
                    forced_recursion = depth != Depth::Infinity;
                    target_depth = Depth::Infinity;
                }
            } else if entry.schedule == Schedule::Delete && force && depth != Depth::Infinity {
                let parent = self.parent_entry(target)?;
                let parent_listed = parent
                    .as_ref()
                    .is_some_and(|p| p.is_scheduled_for_deletion() && paths.contains(&p.path));
                if parent_listed {
                    continue;
                }
                target_depth = Depth::Infinity;
                parent_entry = parent;
            }

            self.entry(
                entry,
                parent_entry.as_ref(),
                url,
                None,
                false,
                target_depth,
                forced_recursion,
            )?;
        }

        for dangler in danglers {
            self.events.check_cancelled()?;
            if !self.items.contains_key(&dangler) {
                return Err(SvnError::IllegalTarget(format!(
                    "'{}' is not under version control and is not part of the commit, \
                     yet its child is part of the commit",
                    dangler.display()
                )));
            }
        }

        if forced_recursion {
            // Forced recursion only brings in the copied subtree itself.
            self.items.retain(|p, item| {
                let modified = item.flags.text_modified || item.flags.props_modified || item.flags.deleted;
                !modified || paths.contains(p)
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn entry(
        &mut self,
        entry: Entry,
        parent: Option<&Entry>,
        url: String,
        inherited_copy_from: Option<String>,
        adds_only: bool,
        depth: Depth,
        forced_recursion: bool,
    ) -> Result<()> {
        let path = entry.path.clone();
        if self.items.contains_key(&path) {
            return Ok(());
        }
        self.events.check_cancelled()?;
        if !matches!(entry.kind, NodeKind::File | NodeKind::Dir) {
            return Err(SvnError::IllegalState(format!(
                "Unknown entry kind for '{}'",
                path.display()
            )));
        }
        if entry.in_conflict() {
            return Err(SvnError::WcConflict(path));
        }

        let mut adds_only = adds_only;
        let mut commit_deletion =
            !adds_only && matches!(entry.schedule, Schedule::Delete | Schedule::Replace);
        if !adds_only && !commit_deletion && self.access.disk_kind(&path)? == NodeKind::None {
            let action = if entry.is_dir() {
                self.policy.on_missing_directory(&path)
            } else {
                self.policy.on_missing_file(&path)
            };
            match action {
                MissingAction::Error => return Err(SvnError::WcMissing(path)),
                MissingAction::ForceDelete => {
                    self.access.schedule_delete(&path)?;
                    commit_deletion = true;
                }
                MissingAction::Skip => {
                    let event = Event::new(EventAction::Skip).with_path(&path).with_kind(entry.kind);
                    self.events.dispatch(event, None)?;
                    return Ok(());
                }
            }
        }

        let mut commit_addition = false;
        let mut commit_copy = false;
        let mut copy_from = None;
        if matches!(entry.schedule, Schedule::Add | Schedule::Replace) {
            commit_addition = true;
            if let Some(source) = &entry.copy_from {
                copy_from = Some(source.clone());
                commit_copy = true;
                adds_only = false;
            } else {
                adds_only = true;
            }
        }

        // A copied child whose revision differs from its parent's was
        // copied in its own right.
        if entry.copied && !entry.deleted && entry.schedule == Schedule::Normal {
            if self.access.is_wc_root(&path)? {
                return Err(SvnError::IllegalState(format!(
                    "Did not expect '{}' to be a working copy root",
                    path.display()
                )));
            }
            let parent_revision = parent.and_then(|p| p.revision);
            if parent_revision != entry.revision {
                let source_url = inherited_copy_from.clone().ok_or_else(|| {
                    SvnError::IllegalUrl(format!(
                        "Commit item '{}' has copy flag but no copyfrom URL",
                        path.display()
                    ))
                })?;
                let source_rev = entry.revision.ok_or_else(|| {
                    SvnError::BadRevision(format!("Commit item '{}' has no revision", path.display()))
                })?;
                copy_from = Some((source_url, source_rev));
                commit_addition = true;
                commit_copy = true;
                adds_only = false;
            }
        }

        let mut text_modified = false;
        let mut props_modified = false;
        if commit_addition {
            let working = self.access.properties(&path)?;
            let diff = if entry.is_scheduled_for_replacement() {
                working.as_diff()
            } else {
                self.access.base_properties(&path)?.diff(&working)
            };
            let eol_changed = diff.contains_key(svn_props::EOL_STYLE);
            if entry.kind == NodeKind::File {
                text_modified = if commit_copy {
                    eol_changed || self.access.has_text_modifications(&path)?
                } else {
                    true
                };
            }
            props_modified = !diff.is_empty();
        } else if !commit_deletion {
            let working = self.access.properties(&path)?;
            let diff = self.access.base_properties(&path)?.diff(&working);
            props_modified = !diff.is_empty();
            if entry.kind == NodeKind::File {
                text_modified =
                    diff.contains_key(svn_props::EOL_STYLE) || self.access.has_text_modifications(&path)?;
            }
        }

        let changed = commit_addition || commit_deletion || text_modified || props_modified || commit_copy;
        let commit_lock = entry.lock_token.is_some() && (self.just_locked || changed);
        if (changed || commit_lock) && self.in_changelists(&entry) {
            let flags = CommitFlags {
                added: commit_addition,
                deleted: commit_deletion,
                copied: commit_copy,
                text_modified,
                props_modified,
                locked: commit_lock,
            };
            let item = CommitItem::new(Some(path.clone()), url.clone(), entry.kind, flags)
                .with_revision(entry.revision)
                .with_copy_from(copy_from.clone());
            self.items.insert(path.clone(), item);
            if let Some(token) = &entry.lock_token {
                self.lock_tokens.insert(url.clone(), token.clone());
            }
        }

        if entry.is_dir() && (commit_addition || !commit_deletion) {
            if let Some(child_depth) = depth.for_children() {
                for child in self.access.children(&path)? {
                    self.events.check_cancelled()?;
                    if !depth.includes(child.kind) {
                        continue;
                    }
                    if forced_recursion && child.copied && child.copy_from.is_some() {
                        continue;
                    }
                    let child_copy_from = copy_from
                        .as_ref()
                        .map(|(source, _)| source.clone())
                        .or_else(|| inherited_copy_from.clone())
                        .map(|source| path::url_append(&source, &child.name));
                    let child_url = child
                        .url
                        .clone()
                        .unwrap_or_else(|| path::url_append(&url, &child.name));
                    self.entry(
                        child,
                        Some(&entry),
                        child_url,
                        child_copy_from,
                        adds_only,
                        child_depth,
                        forced_recursion,
                    )?;
                }
            }
        }

        if entry.is_dir() && commit_deletion {
            self.collect_locks(&path)?;
        }
        Ok(())
    }

    /// Lock tokens of everything below a deleted directory.
    fn collect_locks(&mut self, dir: &Path) -> Result<()> {
        for child in self.access.children(dir)? {
            if let (Some(url), Some(token)) = (&child.url, &child.lock_token) {
                self.lock_tokens.insert(url.clone(), token.clone());
            }
            if child.is_dir() {
                self.collect_locks(&child.path)?;
            }
        }
        Ok(())
    }

    fn in_changelists(&self, entry: &Entry) -> bool {
        self.changelists.is_empty()
            || entry
                .changelist
                .as_ref()
                .is_some_and(|name| self.changelists.contains(name))
    }

    fn versioned_entry(&self, p: &Path) -> Result<Option<Entry>> {
        Ok(self
            .access
            .entry(p)?
            .filter(|e| !(e.deleted && e.schedule == Schedule::Normal)))
    }

    fn parent_entry(&self, p: &Path) -> Result<Option<Entry>> {
        match p.parent() {
            Some(parent) => self.versioned_entry(parent),
            None => Ok(None),
        }
    }
}

/// Deepest directory containing every path; the path itself when there is
/// only one.
pub(crate) fn common_path(paths: &[PathBuf]) -> Option<PathBuf> {
    let (first, rest) = paths.split_first()?;
    let mut base = first.clone();
    for p in rest {
        while !p.starts_with(&base) {
            if !base.pop() {
                return Some(PathBuf::new());
            }
        }
    }
    Some(base)
}
