//! Commit orchestration
//!
//! [`CommitClient`] turns harvested packets into repository revisions:
//! it resolves the log message, anchors one commit editor per packet,
//! drives the items through it and writes the result back into the working
//! copy. URL-only operations (`delete_urls`, `mkdir_urls`) skip the working
//! copy entirely.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use dsvn_core::path;
use dsvn_core::{
    drive_commit_editor, CommitEditor, CommitInfo, Depth, Event, EventAction, EventDispatcher,
    FixedPolicy, MissingItemPolicy, NodeKind, PostCommit, PropertySet, Result, SessionFactory,
    SvnError, WcAccess, WorkingCopy,
};

use crate::config::ClientConfig;
use crate::driver::{translate_commitables, translate_lock_tokens, Committer};
use crate::harvest::CommitHarvester;
use crate::packet::{
    normalize_message, CommitFlags, CommitItem, CommitMessageHandler, CommitPacket, DefaultMessageHandler,
};

/// Options of [`CommitClient::commit_paths`]
#[derive(Debug, Clone)]
pub struct CommitOptions {
    pub depth: Depth,
    pub keep_locks: bool,
    pub keep_changelist: bool,
    pub force: bool,
    pub changelists: Vec<String>,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            depth: Depth::Infinity,
            keep_locks: false,
            keep_changelist: false,
            force: false,
            changelists: Vec::new(),
        }
    }
}

pub struct CommitClient {
    factory: Arc<dyn SessionFactory>,
    wc: Option<Arc<dyn WorkingCopy>>,
    events: EventDispatcher,
    message_handler: Arc<dyn CommitMessageHandler>,
    policy: Arc<dyn MissingItemPolicy>,
    config: ClientConfig,
}

impl CommitClient {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            wc: None,
            events: EventDispatcher::default(),
            message_handler: Arc::new(DefaultMessageHandler),
            policy: Arc::new(FixedPolicy::default()),
            config: ClientConfig::default(),
        }
    }

    pub fn with_working_copy(mut self, wc: Arc<dyn WorkingCopy>) -> Self {
        self.wc = Some(wc);
        self
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn with_message_handler(mut self, handler: Arc<dyn CommitMessageHandler>) -> Self {
        self.message_handler = handler;
        self
    }

    pub fn with_missing_policy(mut self, policy: Arc<dyn MissingItemPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Collect the changes below `paths` into a packet.
    pub fn harvest(
        &self,
        paths: &[PathBuf],
        depth: Depth,
        keep_locks: bool,
        force: bool,
        changelists: &[String],
    ) -> Result<CommitPacket> {
        let wc = self
            .wc
            .clone()
            .ok_or_else(|| SvnError::IllegalState("commit needs a working copy".into()))?;
        CommitHarvester::new(wc)
            .with_events(self.events.clone())
            .with_missing_policy(self.policy.clone())
            .harvest(paths, depth, keep_locks, force, changelists)
    }

    /// Commit each packet in its own transaction.
    ///
    /// Returns one `CommitInfo` per packet, in order. A failing packet gets
    /// a failed slot and the rest still run; cancellation stops the batch
    /// and is returned as the error. Every packet is disposed before this
    /// returns.
    pub fn commit(
        &self,
        packets: &mut [CommitPacket],
        keep_locks: bool,
        keep_changelist: bool,
        message: &str,
        revision_properties: &PropertySet,
    ) -> Result<Vec<CommitInfo>> {
        let mut infos = Vec::with_capacity(packets.len());
        let mut stopped = None;
        for packet in packets.iter_mut() {
            match self.commit_one(packet, keep_locks, keep_changelist, message, revision_properties) {
                Ok(info) => infos.push(info),
                Err(e) if e.is_cancelled() => {
                    stopped = Some(e);
                    break;
                }
                Err(e) => {
                    tracing::warn!("commit failed: {}", e);
                    let notified = self.events.dispatch(Event::failed(e.clone()), None);
                    infos.push(CommitInfo::failed(e));
                    if let Err(e) = notified {
                        stopped = Some(e);
                        break;
                    }
                }
            }
        }

        for packet in packets.iter_mut() {
            if let Err(e) = packet.dispose() {
                tracing::warn!("failed to dispose commit packet: {}", e);
            }
        }
        if let Some(e) = stopped {
            return Err(e);
        }

        if self.config.sleep_for_timestamps && infos.iter().any(|info| info.revision.is_some()) {
            sleep_for_timestamps();
        }
        Ok(infos)
    }

    /// Commit one packet and fail with its error, if any.
    pub fn commit_packet(
        &self,
        packet: CommitPacket,
        keep_locks: bool,
        keep_changelist: bool,
        message: &str,
        revision_properties: &PropertySet,
    ) -> Result<CommitInfo> {
        let mut packets = [packet];
        let mut infos = self.commit(&mut packets, keep_locks, keep_changelist, message, revision_properties)?;
        let info = infos.pop().unwrap_or_default();
        match info.error {
            Some(e) => Err(e),
            None => Ok(info),
        }
    }

    /// Harvest `paths` and commit the result.
    pub fn commit_paths(
        &self,
        paths: &[PathBuf],
        options: &CommitOptions,
        message: &str,
        revision_properties: &PropertySet,
    ) -> Result<CommitInfo> {
        let packet = self.harvest(
            paths,
            options.depth,
            options.keep_locks,
            options.force,
            &options.changelists,
        )?;
        self.commit_packet(
            packet,
            options.keep_locks,
            options.keep_changelist,
            message,
            revision_properties,
        )
    }

    fn commit_one(
        &self,
        packet: &mut CommitPacket,
        keep_locks: bool,
        keep_changelist: bool,
        message: &str,
        revision_properties: &PropertySet,
    ) -> Result<CommitInfo> {
        packet.remove_skipped_items();
        if packet.is_empty() {
            return Ok(CommitInfo::null());
        }
        let Some(message) = self.resolve_message(message, packet.items()) else {
            tracing::debug!("commit of {} items vetoed by the message handler", packet.len());
            return Ok(CommitInfo::null());
        };

        let targets = translate_commitables(packet.items())?;
        let lock_tokens = translate_lock_tokens(packet.lock_tokens(), &targets.base_url);
        let session = self.factory.open(&targets.base_url)?;
        let repository_root = session.repository_root()?;
        tracing::info!("committing {} items at {}", packet.len(), targets.base_url);
        let mut editor = session.commit_editor(&message, &lock_tokens, keep_locks, revision_properties)?;

        let info = {
            let (items, access) = packet.parts_mut();
            let access = access.map(|a| a as &mut dyn WcAccess);
            Committer::new(items, &targets, access, &self.events, repository_root).commit(editor.as_mut())?
        };
        let revision = info
            .revision
            .ok_or_else(|| SvnError::IllegalState("commit produced no revision".into()))?;
        tracing::info!("committed revision {}", revision);
        self.events.dispatch(
            Event::new(EventAction::CommitCompleted)
                .with_url(&targets.base_url)
                .with_revision(revision),
            None,
        )?;

        let (items, access) = packet.parts_mut();
        if let Some(access) = access {
            self.post_commit(items, access, &info, keep_locks, keep_changelist)?;
        }
        Ok(info)
    }

    /// Write committed state back into the working copy. Items whose entry
    /// is already gone because an ancestor was processed are skipped.
    fn post_commit(
        &self,
        items: &[CommitItem],
        access: &mut dyn WcAccess,
        info: &CommitInfo,
        keep_locks: bool,
        keep_changelist: bool,
    ) -> Result<()> {
        let revision = info
            .revision
            .ok_or_else(|| SvnError::IllegalState("post-commit without a revision".into()))?;
        let mut sorted: Vec<&CommitItem> = items.iter().collect();
        sorted.sort_by(|a, b| path::path_compare(&a.url, &b.url));

        let mut processed: Vec<PathBuf> = Vec::new();
        for item in sorted {
            let Some(local) = &item.path else {
                continue;
            };
            if access.entry(local)?.is_none() {
                if !processed.iter().any(|done| local.starts_with(done)) {
                    tracing::warn!("no entry for committed item {}", local.display());
                }
                continue;
            }
            let f = item.flags;
            if f.deleted && !f.added {
                access.mark_deleted(local, revision)?;
            } else {
                let update = PostCommit {
                    info: info.clone(),
                    remove_lock: !keep_locks && f.locked,
                    keep_changelist,
                    recurse: f.added && f.copied && item.kind == NodeKind::Dir,
                };
                access.post_commit(local, &update)?;
            }
            processed.push(local.clone());
        }
        Ok(())
    }

    /// Delete `urls` from the repository in one revision.
    ///
    /// Every target is checked before the commit editor is opened; a
    /// missing one fails with `NotFound`.
    pub fn delete_urls(&self, urls: &[String], message: &str) -> Result<CommitInfo> {
        let (mut root, mut rels) = path::condense_urls(urls, true)?;
        if rels.iter().any(String::is_empty) {
            rels = vec![path::url_basename(&root).to_string()];
            root = path::url_dirname(&root);
        }

        let session = self.factory.open(&root)?;
        for rel in &rels {
            self.events.check_cancelled()?;
            if session.check_path(rel, None)? == NodeKind::None {
                return Err(SvnError::NotFound(format!(
                    "URL '{}' does not exist",
                    path::url_append(&root, rel)
                )));
            }
        }

        let items: Vec<CommitItem> = rels
            .iter()
            .map(|rel| {
                let flags = CommitFlags {
                    deleted: true,
                    ..CommitFlags::default()
                };
                CommitItem::new(None, path::url_append(&root, rel), NodeKind::None, flags)
            })
            .collect();
        let Some(message) = self.resolve_message(message, &items) else {
            return Ok(CommitInfo::null());
        };

        let mut editor = session.commit_editor(&message, &BTreeMap::new(), false, &PropertySet::new())?;
        let mut delete = |p: &str, editor: &mut dyn CommitEditor| -> Result<bool> {
            editor.delete_entry(p, None)?;
            Ok(false)
        };
        let info = self.finish_url_commit(&rels, editor.as_mut(), &mut delete)?;
        self.completed(&root, &info)?;
        Ok(info)
    }

    /// Create the directories `urls` in one revision. Missing parents that
    /// are also listed are created first.
    pub fn mkdir_urls(&self, urls: &[String], message: &str) -> Result<CommitInfo> {
        let (mut root, mut rels) = path::condense_urls(urls, false)?;
        if rels.iter().any(String::is_empty) {
            let name = path::url_basename(&root).to_string();
            root = path::url_dirname(&root);
            rels = rels.iter().map(|rel| path::join(&name, rel)).collect();
        }

        let items: Vec<CommitItem> = rels
            .iter()
            .map(|rel| {
                let flags = CommitFlags {
                    added: true,
                    ..CommitFlags::default()
                };
                CommitItem::new(None, path::url_append(&root, rel), NodeKind::Dir, flags)
            })
            .collect();
        let Some(message) = self.resolve_message(message, &items) else {
            return Ok(CommitInfo::null());
        };

        let session = self.factory.open(&root)?;
        let mut editor = session.commit_editor(&message, &BTreeMap::new(), false, &PropertySet::new())?;
        let mut mkdir = |p: &str, editor: &mut dyn CommitEditor| -> Result<bool> {
            editor.add_dir(p, None)?;
            Ok(true)
        };
        let info = self.finish_url_commit(&rels, editor.as_mut(), &mut mkdir)?;
        self.completed(&root, &info)?;
        Ok(info)
    }

    fn finish_url_commit(
        &self,
        rels: &[String],
        editor: &mut dyn CommitEditor,
        handler: &mut dyn dsvn_core::CommitPathHandler,
    ) -> Result<CommitInfo> {
        let result = drive_commit_editor(rels, editor, None, handler).and_then(|()| editor.close_edit());
        if result.is_err() {
            if let Err(e) = editor.abort_edit() {
                tracing::debug!("abort after failed commit also failed: {}", e);
            }
        }
        result
    }

    fn completed(&self, root: &str, info: &CommitInfo) -> Result<()> {
        let mut event = Event::new(EventAction::CommitCompleted).with_url(root);
        if let Some(revision) = info.revision {
            tracing::info!("committed revision {}", revision);
            event = event.with_revision(revision);
        }
        self.events.dispatch(event, None)
    }

    /// `None` when the handler vetoes the commit or leaves no message.
    fn resolve_message(&self, message: &str, items: &[CommitItem]) -> Option<String> {
        self.message_handler
            .commit_message(message, items)
            .filter(|m| !m.is_empty())
            .map(|m| normalize_message(&m))
    }
}

/// Sleep past the next second boundary so later writes get a newer
/// timestamp than the committed texts.
fn sleep_for_timestamps() {
    let millis = u64::from(Utc::now().timestamp_subsec_millis().min(999));
    thread::sleep(Duration::from_millis(1100 - millis));
}
