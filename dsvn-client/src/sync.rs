//! Repository mirroring
//!
//! A mirror records its sync state as revision properties on its
//! revision 0: the source URL and UUID, the last revision merged, the
//! revision being copied right now, and a lock token naming the process
//! that is working on it. Every operation runs under that lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use dsvn_core::properties::{revprops, sync_props};
use dsvn_core::{
    Event, EventAction, EventDispatcher, PropertySet, RepositorySession, Result, SessionFactory, SvnError,
};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::replicator::Replicator;

const MAX_HOSTNAME_LEN: usize = 256;

/// Sync state of a mirror as read from its revision 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub from_url: String,
    pub from_uuid: String,
    pub last_merged_rev: u64,
    pub currently_copying: Option<u64>,
}

impl SyncCursor {
    /// Read the cursor from `dest`. Fails unless the mirror was initialized.
    pub fn read(dest: &dyn RepositorySession) -> Result<Self> {
        let from_url = dest.revision_property(0, sync_props::FROM_URL)?;
        let from_uuid = dest.revision_property(0, sync_props::FROM_UUID)?;
        let last = dest.revision_property(0, sync_props::LAST_MERGED_REV)?;
        let (Some(from_url), Some(from_uuid), Some(last)) = (from_url, from_uuid, last) else {
            return Err(SvnError::IllegalState(
                "Destination repository has not been initialized".into(),
            ));
        };
        let currently_copying = dest
            .revision_property(0, sync_props::CURRENTLY_COPYING)?
            .map(|v| parse_revision(sync_props::CURRENTLY_COPYING, &v))
            .transpose()?;
        Ok(Self {
            from_url,
            from_uuid,
            last_merged_rev: parse_revision(sync_props::LAST_MERGED_REV, &last)?,
            currently_copying,
        })
    }
}

fn parse_revision(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| SvnError::Corrupt(format!("Invalid revision '{}' in {}", value, name)))
}

fn check_at_root(session: &dyn RepositorySession) -> Result<()> {
    if session.is_at_root()? {
        return Ok(());
    }
    Err(SvnError::IllegalState(format!(
        "Session is rooted at '{}' but the repos root is '{}'",
        session.location(),
        session.repository_root()?
    )))
}

/// Keeps a mirror repository in step with its source.
pub struct SyncEngine {
    factory: Arc<dyn SessionFactory>,
    config: ClientConfig,
    events: EventDispatcher,
    lock_token: String,
}

impl SyncEngine {
    pub fn new(factory: Arc<dyn SessionFactory>, config: ClientConfig) -> Result<Self> {
        let host = match &config.hostname {
            Some(h) => h.clone(),
            None => hostname::get()?.to_string_lossy().into_owned(),
        };
        let host: String = host.chars().take(MAX_HOSTNAME_LEN).collect();
        let lock_token = format!("{}:{}", host, Uuid::new_v4());
        Ok(Self {
            factory,
            config,
            events: EventDispatcher::new(None),
            lock_token,
        })
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    /// Token written to the mirror while this engine holds its lock
    pub fn lock_token(&self) -> &str {
        &self.lock_token
    }

    /// Take the mirror lock. Holding it already counts as success; a lock
    /// held by someone else is retried after the configured delay.
    pub fn lock(&self, dest: &dyn RepositorySession) -> Result<()> {
        let attempts = self.config.lock_attempts;
        for _ in 0..attempts {
            match dest.revision_property(0, sync_props::LOCK)? {
                Some(token) if token == self.lock_token => return Ok(()),
                Some(token) => {
                    tracing::info!("Failed to get lock on destination repos, currently held by '{}'", token);
                    thread::sleep(self.config.lock_retry_delay());
                }
                None => {
                    dest.set_revision_property(0, sync_props::LOCK, Some(&self.lock_token))?;
                    // Another engine may have written at the same time.
                    if dest.revision_property(0, sync_props::LOCK)?.as_deref() == Some(self.lock_token.as_str()) {
                        return Ok(());
                    }
                }
            }
        }
        Err(SvnError::Io(format!(
            "Couldn't get lock on destination repos after {} attempts",
            attempts
        )))
    }

    /// Drop the mirror lock, whoever holds it.
    pub fn unlock(&self, dest: &dyn RepositorySession) -> Result<()> {
        dest.set_revision_property(0, sync_props::LOCK, None)
    }

    /// Run `op` under the mirror lock. An error from `op` takes precedence
    /// over one from releasing the lock.
    fn with_lock<T>(&self, dest: &dyn RepositorySession, op: impl FnOnce() -> Result<T>) -> Result<T> {
        self.lock(dest)?;
        let result = op();
        let unlocked = self.unlock(dest);
        match (result, unlocked) {
            (Err(e), Err(unlock_err)) => {
                tracing::warn!("failed to release sync lock: {}", unlock_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    fn open_destination(&self, to_url: &str) -> Result<Box<dyn RepositorySession>> {
        let dest = self.factory.open(to_url)?;
        check_at_root(dest.as_ref())?;
        Ok(dest)
    }

    fn open_source(&self, cursor: &SyncCursor) -> Result<Box<dyn RepositorySession>> {
        let source = self.factory.open(&cursor.from_url)?;
        check_at_root(source.as_ref())?;
        let uuid = source.repository_uuid()?;
        if uuid != cursor.from_uuid {
            return Err(SvnError::IllegalState(format!(
                "UUID of destination repository ({}) does not match expected UUID ({})",
                uuid, cursor.from_uuid
            )));
        }
        Ok(source)
    }

    /// Turn the empty repository at `to_url` into a mirror of `from_url`.
    pub fn initialize(&self, from_url: &str, to_url: &str) -> Result<()> {
        let dest = self.open_destination(to_url)?;
        let dest = dest.as_ref();
        self.with_lock(dest, || {
            if dest.latest_revision()? != 0 {
                return Err(SvnError::IllegalState(
                    "Cannot initialize a repository with content in it".into(),
                ));
            }
            if let Some(existing) = dest.revision_property(0, sync_props::FROM_URL)? {
                return Err(SvnError::IllegalState(format!(
                    "Destination repository is already synchronizing from '{}'",
                    existing
                )));
            }
            let source = self.factory.open(from_url)?;
            check_at_root(source.as_ref())?;
            let uuid = source.repository_uuid()?;
            dest.set_revision_property(0, sync_props::FROM_URL, Some(source.location()))?;
            dest.set_revision_property(0, sync_props::FROM_UUID, Some(&uuid))?;
            dest.set_revision_property(0, sync_props::LAST_MERGED_REV, Some("0"))?;
            self.copy_revprops(source.as_ref(), dest, 0, false)?;
            tracing::info!("Initialized {} as a mirror of {}", to_url, from_url);
            Ok(())
        })
    }

    /// Copy every source revision the mirror lacks. Returns the last merged
    /// revision.
    pub fn synchronize(&self, to_url: &str) -> Result<u64> {
        let dest = self.open_destination(to_url)?;
        let dest = dest.as_ref();
        self.with_lock(dest, || self.synchronize_locked(dest))
    }

    fn synchronize_locked(&self, dest: &dyn RepositorySession) -> Result<u64> {
        let cursor = SyncCursor::read(dest)?;
        let source = self.open_source(&cursor)?;
        let source = source.as_ref();
        let mut last = cursor.last_merged_rev;
        let dest_latest = dest.latest_revision()?;

        match cursor.currently_copying {
            Some(copying) => {
                if copying < last || copying > last + 1 || (dest_latest != last && dest_latest != copying) {
                    return Err(SvnError::IllegalState(format!(
                        "Revision being currently copied ({}), last merged revision ({}), and destination HEAD ({}) are inconsistent; have you committed to the destination without using svnsync?",
                        copying, last, dest_latest
                    )));
                }
                if copying == dest_latest {
                    // The commit landed but the bookkeeping after it did not.
                    if copying > last {
                        self.copy_revprops(source, dest, dest_latest, true)?;
                        last = copying;
                    }
                    dest.set_revision_property(0, sync_props::LAST_MERGED_REV, Some(&last.to_string()))?;
                    dest.set_revision_property(0, sync_props::CURRENTLY_COPYING, None)?;
                }
            }
            None if dest_latest != last => {
                return Err(SvnError::IllegalState(format!(
                    "Destination HEAD ({}) is not the last merged revision ({}); have you committed to the destination without using svnsync?",
                    dest_latest, last
                )));
            }
            None => {}
        }

        let source_latest = source.latest_revision()?;
        if source_latest <= last {
            return Ok(last);
        }
        for rev in last + 1..=source_latest {
            self.events.check_cancelled()?;
            self.copy_revision(source, dest, rev)?;
            last = rev;
        }
        Ok(last)
    }

    fn copy_revision(&self, source: &dyn RepositorySession, dest: &dyn RepositorySession, rev: u64) -> Result<()> {
        dest.set_revision_property(0, sync_props::CURRENTLY_COPYING, Some(&rev.to_string()))?;
        let message = source.revision_property(rev, revprops::LOG)?.unwrap_or_default();
        let mut editor = dest.commit_editor(&message, &BTreeMap::new(), false, &PropertySet::new())?;
        let committed = source
            .replay(rev, 0, true, editor.as_mut())
            .and_then(|()| editor.close_edit());
        let info = match committed {
            Ok(info) => info,
            Err(e) => {
                if let Err(abort_err) = editor.abort_edit() {
                    tracing::debug!("abort after failed replay of r{}: {}", rev, abort_err);
                }
                return Err(e);
            }
        };
        if info.revision != Some(rev) {
            return Err(SvnError::IntegrityError(format!(
                "Commit created rev {} but should have created {}",
                info.revision.map_or_else(|| "none".to_string(), |r| r.to_string()),
                rev
            )));
        }
        self.copy_revprops(source, dest, rev, true)?;
        dest.set_revision_property(0, sync_props::LAST_MERGED_REV, Some(&rev.to_string()))?;
        dest.set_revision_property(0, sync_props::CURRENTLY_COPYING, None)?;
        tracing::info!("Committed revision {}.", rev);
        self.events.dispatch(
            Event::new(EventAction::CommitCompleted)
                .with_url(dest.location())
                .with_revision(rev),
            None,
        )
    }

    /// Re-copy the revision properties of an already mirrored revision.
    pub fn copy_revision_properties(&self, to_url: &str, revision: u64) -> Result<()> {
        let dest = self.open_destination(to_url)?;
        let dest = dest.as_ref();
        self.with_lock(dest, || {
            let cursor = SyncCursor::read(dest)?;
            let source = self.open_source(&cursor)?;
            if revision > cursor.last_merged_rev {
                return Err(SvnError::IllegalState(
                    "Cannot copy revprops for a revision that has not been synchronized yet".into(),
                ));
            }
            self.copy_revprops(source.as_ref(), dest, revision, false)
        })
    }

    /// Sync state of the mirror at `to_url`. Takes no lock.
    pub fn info(&self, to_url: &str) -> Result<SyncCursor> {
        let dest = self.open_destination(to_url)?;
        SyncCursor::read(dest.as_ref())
    }

    /// Initialize and synchronize in one go. Without replay support on the
    /// source, falls back to replicating revision by revision. Returns the
    /// youngest mirrored revision.
    pub fn complete_synchronize(&self, from_url: &str, to_url: &str) -> Result<u64> {
        match self.initialize(from_url, to_url).and_then(|()| self.synchronize(to_url)) {
            Err(e) if e.is_not_implemented() => {
                tracing::info!("{} cannot replay revisions, replicating instead", from_url);
                self.replicate_locked(from_url, to_url)
            }
            other => other,
        }
    }

    /// Replicate the missing revisions and bring the mirror's bookkeeping
    /// up to date so later runs can synchronize normally.
    fn replicate_locked(&self, from_url: &str, to_url: &str) -> Result<u64> {
        let dest = self.open_destination(to_url)?;
        let dest = dest.as_ref();
        self.with_lock(dest, || {
            let source = self.factory.open(from_url)?;
            let start = dest.latest_revision()? + 1;
            let count = Replicator::new(self.events.clone()).replicate(source.as_ref(), dest, start, None)?;
            let latest = dest.latest_revision()?;
            dest.set_revision_property(0, sync_props::LAST_MERGED_REV, Some(&latest.to_string()))?;
            dest.set_revision_property(0, sync_props::CURRENTLY_COPYING, None)?;
            tracing::info!("Replicated {} revisions", count);
            Ok(latest)
        })
    }

    /// Copy revision properties of `rev` from `source` to `dest`, leaving
    /// out sync bookkeeping. With `sync`, properties the source lacks are
    /// removed from `dest`.
    fn copy_revprops(
        &self,
        source: &dyn RepositorySession,
        dest: &dyn RepositorySession,
        rev: u64,
        sync: bool,
    ) -> Result<()> {
        let mut existing = if sync { Some(dest.revision_properties(rev)?) } else { None };
        let props = source.revision_properties(rev)?;
        let mut saw_sync = false;
        for (name, value) in props.iter() {
            if sync_props::is_reserved(name) {
                saw_sync = true;
                continue;
            }
            dest.set_revision_property(rev, name, Some(value))?;
            if let Some(existing) = existing.as_mut() {
                existing.remove(name);
            }
        }
        if let Some(existing) = existing {
            for name in existing.names().filter(|n| !sync_props::is_reserved(n)) {
                dest.set_revision_property(rev, name, None)?;
            }
        }
        if saw_sync {
            tracing::info!("Copied properties for revision {} (sync-* properties skipped).", rev);
        } else {
            tracing::info!("Copied properties for revision {}.", rev);
        }
        self.events.dispatch(
            Event::new(EventAction::RevpropsCopied)
                .with_url(dest.location())
                .with_revision(rev),
            None,
        )
    }
}
