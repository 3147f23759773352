#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use dsvn_core::repository::lock;
use dsvn_core::{
    checksum, Capabilities, CommitEditor, Event, EventHandler, PropertySet, Repositories, RepositorySession, Result,
    SessionFactory,
};

/// Registry with an empty in-memory repository per name.
pub fn repositories(names: &[&str]) -> Arc<Repositories> {
    let repos = Arc::new(Repositories::new().with_username("tester"));
    for name in names {
        repos.create_memory(name).unwrap();
    }
    repos
}

pub fn open(repos: &Repositories, url: &str) -> Box<dyn RepositorySession> {
    repos.open(url).unwrap()
}

/// Commit one revision built by `edit` under the session root.
pub fn commit(
    session: &dyn RepositorySession,
    message: &str,
    edit: impl FnOnce(&mut dyn CommitEditor) -> Result<()>,
) -> u64 {
    let mut editor = session
        .commit_editor(message, &BTreeMap::new(), false, &PropertySet::new())
        .unwrap();
    editor.open_root(None).unwrap();
    edit(editor.as_mut()).unwrap();
    editor.close_dir("").unwrap();
    editor.close_edit().unwrap().revision.unwrap()
}

pub fn add_file(editor: &mut dyn CommitEditor, p: &str, text: &str) -> Result<()> {
    editor.add_file(p, None)?;
    editor.apply_text_delta(p, None, Bytes::from(text.to_string()))?;
    editor.close_file(p, Some(&checksum(text.as_bytes())))
}

pub fn modify_file(editor: &mut dyn CommitEditor, p: &str, text: &str) -> Result<()> {
    editor.open_file(p, None)?;
    editor.apply_text_delta(p, None, Bytes::from(text.to_string()))?;
    editor.close_file(p, None)
}

/// Five revisions: a trunk with a file, an edit, a branch copy, a property
/// change on the branch and a delete.
pub fn populate(session: &dyn RepositorySession) {
    commit(session, "create trunk", |e| {
        e.add_dir("trunk", None)?;
        add_file(e, "trunk/a.txt", "one\n")?;
        e.close_dir("trunk")
    });
    commit(session, "edit a", |e| {
        e.open_dir("trunk", None)?;
        modify_file(e, "trunk/a.txt", "one\ntwo\n")?;
        e.close_dir("trunk")
    });
    commit(session, "branch", |e| {
        e.add_dir("branch", Some(("/trunk", 2)))?;
        e.close_dir("branch")
    });
    commit(session, "props", |e| {
        e.open_dir("branch", None)?;
        e.change_dir_property("branch", "owner", Some("me"))?;
        e.close_dir("branch")
    });
    commit(session, "drop trunk file", |e| {
        e.open_dir("trunk", None)?;
        e.delete_entry("trunk/a.txt", None)?;
        e.close_dir("trunk")
    });
}

pub fn set_capabilities(repos: &Repositories, root_url: &str, capabilities: Capabilities) {
    let repo = repos.get(root_url).unwrap().unwrap();
    lock(&repo).unwrap().set_capabilities(capabilities);
}

/// Event handler that runs a closure on every event.
pub struct OnEvent<F>(pub F);

impl<F> EventHandler for OnEvent<F>
where
    F: Fn(&Event) -> Result<()> + Send + Sync,
{
    fn handle_event(&self, event: &Event, _progress: Option<f64>) -> Result<()> {
        (self.0)(event)
    }
}
