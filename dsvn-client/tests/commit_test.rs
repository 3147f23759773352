//! Working-copy commits and URL-only operations against an in-memory
//! repository

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dsvn_client::{ClientConfig, CommitClient, CommitItem, CommitOptions};
use dsvn_core::properties::revprops;
use dsvn_core::{
    CancelToken, Event, EventAction, EventDispatcher, EventHandler, MemoryWorkingCopy, NodeKind, PropertySet,
    Repositories, RepositorySession, Schedule, SvnError,
};

fn quiet() -> ClientConfig {
    ClientConfig {
        sleep_for_timestamps: false,
        ..ClientConfig::default()
    }
}

/// Repository `mem://r` with `trunk/a.txt` at r1, and a working copy of
/// trunk at `/wc`.
fn setup() -> (Arc<Repositories>, Box<dyn RepositorySession>, MemoryWorkingCopy) {
    let repos = common::repositories(&["r"]);
    let session = common::open(&repos, "mem://r");
    common::commit(session.as_ref(), "init", |e| {
        e.add_dir("trunk", None)?;
        common::add_file(e, "trunk/a.txt", "alpha\n")?;
        e.close_dir("trunk")
    });
    let wc = checkout(&repos, "/wc");
    (repos, session, wc)
}

fn checkout(repos: &Repositories, root: &str) -> MemoryWorkingCopy {
    let trunk = common::open(repos, "mem://r/trunk");
    MemoryWorkingCopy::checkout(trunk.as_ref(), root).unwrap()
}

fn client(repos: &Arc<Repositories>, wc: &MemoryWorkingCopy) -> CommitClient {
    CommitClient::new(repos.clone())
        .with_working_copy(Arc::new(wc.clone()))
        .with_config(quiet())
}

#[test]
fn test_only_changed_items_are_harvested() {
    let (repos, _session, wc) = setup();
    wc.write_file("/wc/b.txt", "beta\n").unwrap();
    wc.add("/wc/b.txt").unwrap();

    let packet = client(&repos, &wc)
        .harvest(&[PathBuf::from("/wc")], dsvn_core::Depth::Infinity, false, false, &[])
        .unwrap();
    assert_eq!(packet.len(), 1);
    let item = &packet.items()[0];
    assert_eq!(item.url, "mem://r/trunk/b.txt");
    assert!(item.flags.added);
    assert!(item.flags.text_modified);
}

#[test]
fn test_unchanged_tree_gives_empty_packet() {
    let (repos, session, wc) = setup();
    let client = client(&repos, &wc);
    let packet = client
        .harvest(&[PathBuf::from("/wc")], dsvn_core::Depth::Infinity, false, false, &[])
        .unwrap();
    assert!(packet.is_empty());
    assert!(!packet.has_access());
    assert_eq!(wc.open_handles(), 0);

    let info = client
        .commit_paths(&[PathBuf::from("/wc")], &CommitOptions::default(), "nothing", &PropertySet::new())
        .unwrap();
    assert!(info.is_null());
    assert_eq!(session.latest_revision().unwrap(), 1);
}

#[test]
fn test_commit_adds_and_modifies() {
    let (repos, session, wc) = setup();
    wc.write_file("/wc/a.txt", "alpha\nmore\n").unwrap();
    wc.mkdir("/wc/sub").unwrap();
    wc.write_file("/wc/sub/c.txt", "gamma\n").unwrap();
    wc.add("/wc/sub").unwrap();

    let recorder = Arc::new(dsvn_core::RecordingHandler::new());
    let info = client(&repos, &wc)
        .with_events(EventDispatcher::new(Some(recorder.clone() as Arc<dyn EventHandler>)))
        .commit_paths(
            &[PathBuf::from("/wc")],
            &CommitOptions::default(),
            "edit\r\nand add",
            &PropertySet::new(),
        )
        .unwrap();
    assert_eq!(info.revision, Some(2));
    assert!(info.error.is_none());

    let (_, text) = session.get_file("trunk/a.txt", None).unwrap();
    assert_eq!(&text[..], b"alpha\nmore\n");
    let (_, text) = session.get_file("trunk/sub/c.txt", None).unwrap();
    assert_eq!(&text[..], b"gamma\n");
    assert_eq!(
        session.revision_property(2, revprops::LOG).unwrap().as_deref(),
        Some("edit\nand add")
    );

    for p in ["/wc/a.txt", "/wc/sub", "/wc/sub/c.txt"] {
        let entry = wc.entry(p).unwrap();
        assert_eq!(entry.schedule, Schedule::Normal, "{}", p);
        assert_eq!(entry.revision, Some(2), "{}", p);
    }
    assert_eq!(wc.open_handles(), 0);
    assert_eq!(wc.temp_files(), 0);

    let actions = recorder.actions();
    assert!(actions.contains(&EventAction::CommitAdded));
    assert!(actions.contains(&EventAction::CommitModified));
    assert_eq!(actions.last(), Some(&EventAction::CommitCompleted));

    // The working copy is clean again.
    let packet = client(&repos, &wc)
        .harvest(&[PathBuf::from("/wc")], dsvn_core::Depth::Infinity, false, false, &[])
        .unwrap();
    assert!(packet.is_empty());
}

#[test]
fn test_commit_deletion_leaves_no_entry() {
    let (repos, session, wc) = setup();
    wc.delete("/wc/a.txt").unwrap();
    let info = client(&repos, &wc)
        .commit_paths(&[PathBuf::from("/wc")], &CommitOptions::default(), "rm", &PropertySet::new())
        .unwrap();
    assert_eq!(info.revision, Some(2));
    assert_eq!(session.check_path("trunk/a.txt", None).unwrap(), NodeKind::None);
    assert!(!wc.exists_on_disk("/wc/a.txt"));
}

#[test]
fn test_message_handler_can_veto() {
    let (repos, session, wc) = setup();
    wc.write_file("/wc/b.txt", "beta\n").unwrap();
    wc.add("/wc/b.txt").unwrap();
    let veto = |_: &str, _: &[CommitItem]| -> Option<String> { None };
    let info = client(&repos, &wc)
        .with_message_handler(Arc::new(veto))
        .commit_paths(&[PathBuf::from("/wc")], &CommitOptions::default(), "m", &PropertySet::new())
        .unwrap();
    assert!(info.is_null());
    assert_eq!(session.latest_revision().unwrap(), 1);
    assert_eq!(wc.entry("/wc/b.txt").unwrap().schedule, Schedule::Add);
    assert_eq!(wc.open_handles(), 0);
}

#[test]
fn test_batch_continues_past_failed_packet() {
    let (repos, session, first) = setup();
    let second = checkout(&repos, "/wc2");
    first.write_file("/wc/a.txt", "first\n").unwrap();
    second.write_file("/wc2/a.txt", "second\n").unwrap();

    let recorder = Arc::new(dsvn_core::RecordingHandler::new());
    let client = client(&repos, &first)
        .with_events(EventDispatcher::new(Some(recorder.clone() as Arc<dyn EventHandler>)));
    let mut packets = vec![
        client
            .harvest(&[PathBuf::from("/wc")], dsvn_core::Depth::Infinity, false, false, &[])
            .unwrap(),
        CommitClient::new(repos.clone())
            .with_working_copy(Arc::new(second.clone()))
            .harvest(&[PathBuf::from("/wc2")], dsvn_core::Depth::Infinity, false, false, &[])
            .unwrap(),
    ];

    let infos = client
        .commit(&mut packets, false, false, "race", &PropertySet::new())
        .unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].revision, Some(2));
    assert!(infos[1].revision.is_none());
    assert!(matches!(infos[1].error, Some(SvnError::OutOfDate(_))));
    assert!(recorder.actions().contains(&EventAction::Failed));

    assert!(packets.iter().all(|p| p.is_disposed()));
    assert_eq!(first.open_handles(), 0);
    assert_eq!(second.open_handles(), 0);
    let (_, text) = session.get_file("trunk/a.txt", None).unwrap();
    assert_eq!(&text[..], b"first\n");
}

#[test]
fn test_delete_urls() {
    let (repos, session, _wc) = setup();
    common::commit(session.as_ref(), "more", |e| {
        e.open_dir("trunk", None)?;
        common::add_file(e, "trunk/b.txt", "b")?;
        e.close_dir("trunk")
    });
    let client = CommitClient::new(repos.clone()).with_config(quiet());

    let err = client
        .delete_urls(&["mem://r/trunk/a.txt".into(), "mem://r/trunk/nope".into()], "rm")
        .unwrap_err();
    assert!(matches!(err, SvnError::NotFound(_)));
    assert!(err.to_string().contains("mem://r/trunk/nope"));
    assert_eq!(session.latest_revision().unwrap(), 2);

    let info = client
        .delete_urls(&["mem://r/trunk/a.txt".into(), "mem://r/trunk/b.txt".into()], "rm both")
        .unwrap();
    assert_eq!(info.revision, Some(3));
    assert_eq!(session.check_path("trunk/a.txt", None).unwrap(), NodeKind::None);
    assert_eq!(session.check_path("trunk/b.txt", None).unwrap(), NodeKind::None);
    assert_eq!(session.check_path("trunk", None).unwrap(), NodeKind::Dir);

    // A single URL is deleted through its parent.
    let info = client.delete_urls(&["mem://r/trunk".into()], "rm trunk").unwrap();
    assert_eq!(info.revision, Some(4));
    assert_eq!(session.check_path("trunk", None).unwrap(), NodeKind::None);
}

#[test]
fn test_mkdir_urls() {
    let (repos, session, _wc) = setup();
    let client = CommitClient::new(repos.clone()).with_config(quiet());

    let info = client
        .mkdir_urls(&["mem://r/tags".into(), "mem://r/tags/v1".into()], "layout")
        .unwrap();
    assert_eq!(info.revision, Some(2));
    assert_eq!(session.check_path("tags", None).unwrap(), NodeKind::Dir);
    assert_eq!(session.check_path("tags/v1", None).unwrap(), NodeKind::Dir);

    let info = client.mkdir_urls(&["mem://r/branches".into()], "one").unwrap();
    assert_eq!(info.revision, Some(3));
    assert_eq!(session.check_path("branches", None).unwrap(), NodeKind::Dir);

    let err = client.mkdir_urls(&["mem://r/branches".into()], "again").unwrap_err();
    assert!(matches!(err, SvnError::AlreadyExists(_)));
    assert_eq!(session.latest_revision().unwrap(), 3);
}

#[test]
fn test_commit_needs_working_copy() {
    let (repos, _session, _wc) = setup();
    let err = CommitClient::new(repos.clone())
        .harvest(&[Path::new("/wc").to_path_buf()], dsvn_core::Depth::Infinity, false, false, &[])
        .unwrap_err();
    assert!(matches!(err, SvnError::IllegalState(_)));
}

#[test]
fn test_skipped_items_are_not_committed() {
    let (repos, session, wc) = setup();
    for name in ["b.txt", "c.txt"] {
        let p = format!("/wc/{}", name);
        wc.write_file(&p, "new\n").unwrap();
        wc.add(&p).unwrap();
    }
    let client = client(&repos, &wc);
    let mut packet = client
        .harvest(&[PathBuf::from("/wc")], dsvn_core::Depth::Infinity, false, false, &[])
        .unwrap();
    let skipped = packet
        .items()
        .iter()
        .position(|item| item.url == "mem://r/trunk/c.txt")
        .unwrap();
    assert!(packet.set_skipped(skipped, true));

    let info = client
        .commit_packet(packet, false, false, "only b", &PropertySet::new())
        .unwrap();
    assert_eq!(info.revision, Some(2));
    assert_eq!(session.check_path("trunk/b.txt", None).unwrap(), NodeKind::File);
    assert_eq!(session.check_path("trunk/c.txt", None).unwrap(), NodeKind::None);
    assert_eq!(wc.entry("/wc/c.txt").unwrap().schedule, Schedule::Add);

    // Nothing is left once the remaining item is skipped too.
    let mut packet = client
        .harvest(&[PathBuf::from("/wc")], dsvn_core::Depth::Infinity, false, false, &[])
        .unwrap();
    assert_eq!(packet.len(), 1);
    packet.set_skipped(0, true);
    let info = client
        .commit_packet(packet, false, false, "nothing", &PropertySet::new())
        .unwrap();
    assert!(info.is_null());
    assert_eq!(session.latest_revision().unwrap(), 2);
    assert_eq!(wc.open_handles(), 0);
}

#[test]
fn test_cancellation_stops_batch_and_disposes_packets() {
    let (repos, session, first) = setup();
    let second = checkout(&repos, "/wc2");
    first.write_file("/wc/a.txt", "first\n").unwrap();
    second.write_file("/wc2/b.txt", "second\n").unwrap();
    second.add("/wc2/b.txt").unwrap();

    let token = CancelToken::new();
    let trigger = token.clone();
    let handler = common::OnEvent(move |event: &Event| {
        if event.action == EventAction::CommitCompleted {
            trigger.cancel();
        }
        Ok(())
    });
    let client = client(&repos, &first).with_events(
        EventDispatcher::new(Some(Arc::new(handler) as Arc<dyn EventHandler>)).with_cancel_token(token),
    );
    let mut packets = vec![
        client
            .harvest(&[PathBuf::from("/wc")], dsvn_core::Depth::Infinity, false, false, &[])
            .unwrap(),
        CommitClient::new(repos.clone())
            .with_working_copy(Arc::new(second.clone()))
            .harvest(&[PathBuf::from("/wc2")], dsvn_core::Depth::Infinity, false, false, &[])
            .unwrap(),
    ];

    let err = client
        .commit(&mut packets, false, false, "stop", &PropertySet::new())
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(session.latest_revision().unwrap(), 2);
    assert_eq!(session.check_path("trunk/b.txt", None).unwrap(), NodeKind::None);
    assert!(packets.iter().all(|p| p.is_disposed()));
    assert_eq!(first.open_handles(), 0);
    assert_eq!(second.open_handles(), 0);
    assert_eq!(second.entry("/wc2/b.txt").unwrap().schedule, Schedule::Add);
}

