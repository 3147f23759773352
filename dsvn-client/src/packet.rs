//! Commit items and packets

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use dsvn_core::{NodeKind, Result, WcAccess};

/// What a commit item does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitFlags {
    pub added: bool,
    pub deleted: bool,
    pub copied: bool,
    pub text_modified: bool,
    pub props_modified: bool,
    pub locked: bool,
}

/// One pending change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitItem {
    /// Working-copy path; `None` for URL-only operations
    pub path: Option<PathBuf>,
    pub url: String,
    pub kind: NodeKind,
    /// Base revision of the working item
    pub revision: Option<u64>,
    /// Copy source URL and revision
    pub copy_from: Option<(String, u64)>,
    pub flags: CommitFlags,
    skipped: bool,
}

impl CommitItem {
    pub fn new(path: Option<PathBuf>, url: impl Into<String>, kind: NodeKind, flags: CommitFlags) -> Self {
        Self {
            path,
            url: url.into(),
            kind,
            revision: None,
            copy_from: None,
            flags,
            skipped: false,
        }
    }

    pub fn with_revision(mut self, revision: Option<u64>) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_copy_from(mut self, copy_from: Option<(String, u64)>) -> Self {
        self.copy_from = copy_from;
        self
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }
}

impl fmt::Display for CommitItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}", p.display()),
            None => f.write_str(&self.url),
        }
    }
}

/// Items harvested from one working-copy access scope, with the lock
/// tokens to send along. Owns the access scope until disposed; dropping
/// the packet disposes it.
pub struct CommitPacket {
    items: Vec<CommitItem>,
    lock_tokens: BTreeMap<String, String>,
    access: Option<Box<dyn WcAccess>>,
    disposed: bool,
}

impl CommitPacket {
    /// Packet holding an access scope while items are collected into it.
    pub(crate) fn open(access: Box<dyn WcAccess>) -> Self {
        Self {
            items: Vec::new(),
            lock_tokens: BTreeMap::new(),
            access: Some(access),
            disposed: false,
        }
    }

    /// Nothing to commit; holds no access scope.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            lock_tokens: BTreeMap::new(),
            access: None,
            disposed: false,
        }
    }

    pub(crate) fn set_contents(&mut self, items: Vec<CommitItem>, lock_tokens: BTreeMap<String, String>) {
        self.items = items;
        self.lock_tokens = lock_tokens;
    }

    pub fn items(&self) -> &[CommitItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Lock tokens keyed by URL
    pub fn lock_tokens(&self) -> &BTreeMap<String, String> {
        &self.lock_tokens
    }

    pub fn has_access(&self) -> bool {
        self.access.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn anchor(&self) -> Option<&Path> {
        self.access.as_ref().map(|a| a.anchor())
    }

    /// Mark item `index` as skipped. Returns false when out of range.
    pub fn set_skipped(&mut self, index: usize, skipped: bool) -> bool {
        match self.items.get_mut(index) {
            Some(item) => {
                item.skipped = skipped;
                true
            }
            None => false,
        }
    }

    pub fn remove_skipped_items(&mut self) {
        self.items.retain(|item| !item.skipped);
    }

    pub fn access_mut(&mut self) -> Option<&mut (dyn WcAccess + 'static)> {
        self.access.as_deref_mut()
    }

    /// Items and the access scope at once, for driving a commit.
    pub(crate) fn parts_mut(&mut self) -> (&[CommitItem], Option<&mut (dyn WcAccess + 'static)>) {
        (&self.items, self.access.as_deref_mut())
    }

    /// Release transmission temporaries and close the access scope. Later
    /// calls do nothing.
    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        if let Some(mut access) = self.access.take() {
            let removed = access.remove_temp_files();
            let closed = access.close();
            removed?;
            closed?;
        }
        Ok(())
    }
}

impl fmt::Debug for CommitPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitPacket")
            .field("items", &self.items)
            .field("lock_tokens", &self.lock_tokens)
            .field("has_access", &self.access.is_some())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Drop for CommitPacket {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!("failed to dispose commit packet: {}", e);
        }
    }
}

/// Finalizes the log message for a set of items. Returning `None` cancels
/// the commit of those items.
pub trait CommitMessageHandler: Send + Sync {
    fn commit_message(&self, message: &str, items: &[CommitItem]) -> Option<String>;
}

impl<F> CommitMessageHandler for F
where
    F: Fn(&str, &[CommitItem]) -> Option<String> + Send + Sync,
{
    fn commit_message(&self, message: &str, items: &[CommitItem]) -> Option<String> {
        self(message, items)
    }
}

/// Uses the message as given
#[derive(Debug, Default)]
pub struct DefaultMessageHandler;

impl CommitMessageHandler for DefaultMessageHandler {
    fn commit_message(&self, message: &str, _items: &[CommitItem]) -> Option<String> {
        Some(message.to_string())
    }
}

/// CRLF and lone CR become LF.
pub fn normalize_message(message: &str) -> String {
    message.replace("\r\n", "\n").replace('\r', "\n")
}
