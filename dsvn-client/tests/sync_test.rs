//! Mirroring a repository and recovering interrupted runs

mod common;

use std::sync::Arc;

use dsvn_client::{ClientConfig, SyncEngine};
use dsvn_core::properties::{revprops, sync_props};
use dsvn_core::{
    CancelToken, Capabilities, Event, EventAction, EventDispatcher, EventHandler, NodeKind, RecordingHandler,
    Repositories, RepositorySession, SvnError,
};

fn engine(repos: &Arc<Repositories>) -> SyncEngine {
    let config = ClientConfig {
        lock_attempts: 2,
        lock_retry_delay_ms: 1,
        hostname: Some("mirror-host".into()),
        ..ClientConfig::default()
    };
    SyncEngine::new(repos.clone(), config).unwrap()
}

fn mirrored() -> (Arc<Repositories>, Box<dyn RepositorySession>, Box<dyn RepositorySession>) {
    let repos = common::repositories(&["src", "dest"]);
    let source = common::open(&repos, "mem://src");
    common::populate(source.as_ref());
    let dest = common::open(&repos, "mem://dest");
    (repos, source, dest)
}

#[test]
fn test_initialize_and_synchronize_to_head() {
    let (repos, source, dest) = mirrored();
    let engine = engine(&repos);
    engine.initialize("mem://src", "mem://dest").unwrap();

    let cursor = engine.info("mem://dest").unwrap();
    assert_eq!(cursor.from_url, "mem://src");
    assert_eq!(cursor.from_uuid, source.repository_uuid().unwrap());
    assert_eq!(cursor.last_merged_rev, 0);

    assert_eq!(engine.synchronize("mem://dest").unwrap(), 5);
    assert_eq!(dest.latest_revision().unwrap(), 5);
    assert_eq!(
        dest.revision_property(0, sync_props::LAST_MERGED_REV).unwrap().as_deref(),
        Some("5")
    );
    assert_eq!(dest.revision_property(0, sync_props::CURRENTLY_COPYING).unwrap(), None);
    assert_eq!(dest.revision_property(0, sync_props::LOCK).unwrap(), None);

    let (_, text) = dest.get_file("branch/a.txt", Some(5)).unwrap();
    assert_eq!(&text[..], b"one\ntwo\n");
    let (props, _) = dest.get_dir("branch", Some(5)).unwrap();
    assert_eq!(props.get("owner").map(String::as_str), Some("me"));
    assert_eq!(dest.check_path("trunk/a.txt", Some(5)).unwrap(), NodeKind::None);
    for rev in 1..=5 {
        assert_eq!(
            dest.revision_properties(rev).unwrap(),
            source.revision_properties(rev).unwrap(),
            "revision properties of r{}",
            rev
        );
    }

    // Nothing new on the source: a second run is a no-op.
    assert_eq!(engine.synchronize("mem://dest").unwrap(), 5);
    assert_eq!(dest.latest_revision().unwrap(), 5);
}

#[test]
fn test_initialize_rejects_used_destination() {
    let (repos, _source, dest) = mirrored();
    let engine = engine(&repos);
    engine.initialize("mem://src", "mem://dest").unwrap();
    let err = engine.initialize("mem://src", "mem://dest").unwrap_err();
    assert!(err.to_string().contains("already synchronizing from 'mem://src'"));

    // The source has content, so it cannot become a mirror itself.
    let err = engine.initialize("mem://dest", "mem://src").unwrap_err();
    assert!(err.to_string().contains("with content in it"));
    assert_eq!(dest.revision_property(0, sync_props::LOCK).unwrap(), None);
}

#[test]
fn test_synchronize_requires_initialization() {
    let (repos, _source, _dest) = mirrored();
    let err = engine(&repos).synchronize("mem://dest").unwrap_err();
    assert!(matches!(err, SvnError::IllegalState(_)));
    assert!(err.to_string().contains("has not been initialized"));
}

#[test]
fn test_resume_after_commit_without_bookkeeping() {
    let (repos, source, dest) = mirrored();
    let engine = engine(&repos);
    engine.initialize("mem://src", "mem://dest").unwrap();
    engine.synchronize("mem://dest").unwrap();

    common::commit(source.as_ref(), "add b", |e| {
        e.open_dir("trunk", None)?;
        common::add_file(e, "trunk/b.txt", "b\n")?;
        e.close_dir("trunk")
    });
    // Simulate a run that committed r6 and died before copying its
    // revision properties.
    common::commit(dest.as_ref(), "partial", |e| {
        e.open_dir("trunk", None)?;
        common::add_file(e, "trunk/b.txt", "b\n")?;
        e.close_dir("trunk")
    });
    dest.set_revision_property(6, "junk", Some("x")).unwrap();
    dest.set_revision_property(0, sync_props::CURRENTLY_COPYING, Some("6")).unwrap();

    assert_eq!(engine.synchronize("mem://dest").unwrap(), 6);
    assert_eq!(dest.latest_revision().unwrap(), 6);
    assert_eq!(dest.revision_property(6, revprops::LOG).unwrap().as_deref(), Some("add b"));
    assert_eq!(dest.revision_property(6, "junk").unwrap(), None);
    assert_eq!(
        dest.revision_property(0, sync_props::LAST_MERGED_REV).unwrap().as_deref(),
        Some("6")
    );
    assert_eq!(dest.revision_property(0, sync_props::CURRENTLY_COPYING).unwrap(), None);
}

#[test]
fn test_resume_after_failed_commit_replays_again() {
    let (repos, _source, dest) = mirrored();
    let engine = engine(&repos);
    engine.initialize("mem://src", "mem://dest").unwrap();
    // Died while copying r1, before the commit landed.
    dest.set_revision_property(0, sync_props::CURRENTLY_COPYING, Some("1")).unwrap();

    assert_eq!(engine.synchronize("mem://dest").unwrap(), 5);
    assert_eq!(dest.latest_revision().unwrap(), 5);
}

#[test]
fn test_foreign_commits_are_detected() {
    let (repos, _source, dest) = mirrored();
    let engine = engine(&repos);
    engine.initialize("mem://src", "mem://dest").unwrap();
    engine.synchronize("mem://dest").unwrap();

    common::commit(dest.as_ref(), "rogue", |e| common::add_file(e, "rogue.txt", "x"));
    let err = engine.synchronize("mem://dest").unwrap_err();
    assert!(matches!(err, SvnError::IllegalState(_)));
    assert!(err.to_string().contains("Destination HEAD (6) is not the last merged revision (5)"));

    dest.set_revision_property(0, sync_props::CURRENTLY_COPYING, Some("3")).unwrap();
    let err = engine.synchronize("mem://dest").unwrap_err();
    assert!(err.to_string().contains("are inconsistent"));
    assert_eq!(dest.revision_property(0, sync_props::LOCK).unwrap(), None);
}

#[test]
fn test_source_uuid_must_match() {
    let (repos, _source, dest) = mirrored();
    let engine = engine(&repos);
    engine.initialize("mem://src", "mem://dest").unwrap();
    dest.set_revision_property(0, sync_props::FROM_UUID, Some("someone-else")).unwrap();
    let err = engine.synchronize("mem://dest").unwrap_err();
    assert!(err.to_string().contains("does not match expected UUID (someone-else)"));
}

#[test]
fn test_copy_revision_properties() {
    let (repos, source, dest) = mirrored();
    let engine = engine(&repos);
    engine.initialize("mem://src", "mem://dest").unwrap();
    engine.synchronize("mem://dest").unwrap();

    source.set_revision_property(2, revprops::LOG, Some("edit a, reworded")).unwrap();
    source.set_revision_property(2, "custom", Some("x")).unwrap();
    engine.copy_revision_properties("mem://dest", 2).unwrap();

    let copied = dest.revision_properties(2).unwrap();
    assert_eq!(copied, source.revision_properties(2).unwrap());
    assert_eq!(copied.get("custom").map(String::as_str), Some("x"));

    let err = engine.copy_revision_properties("mem://dest", 9).unwrap_err();
    assert!(err.to_string().contains("has not been synchronized yet"));
}

#[test]
fn test_revision_zero_keeps_sync_state() {
    let (repos, source, dest) = mirrored();
    source.set_revision_property(0, "note", Some("hello")).unwrap();
    let engine = engine(&repos);
    engine.initialize("mem://src", "mem://dest").unwrap();
    engine.copy_revision_properties("mem://dest", 0).unwrap();

    assert_eq!(dest.revision_property(0, "note").unwrap().as_deref(), Some("hello"));
    assert_eq!(
        dest.revision_property(0, sync_props::FROM_URL).unwrap().as_deref(),
        Some("mem://src")
    );
}

#[test]
fn test_held_lock_blocks_other_engines() {
    let (repos, _source, dest) = mirrored();
    let first = engine(&repos);
    let second = engine(&repos);
    first.initialize("mem://src", "mem://dest").unwrap();

    first.lock(dest.as_ref()).unwrap();
    let err = second.synchronize("mem://dest").unwrap_err();
    assert!(err.to_string().contains("Couldn't get lock on destination repos after 2 attempts"));
    assert_eq!(dest.latest_revision().unwrap(), 0);

    second.unlock(dest.as_ref()).unwrap();
    assert_eq!(second.synchronize("mem://dest").unwrap(), 5);
}

#[test]
fn test_complete_synchronize_falls_back_to_replication() {
    let (repos, source, dest) = mirrored();
    common::set_capabilities(
        &repos,
        "mem://src",
        Capabilities {
            get_locations: true,
            replay: false,
        },
    );
    let handler = Arc::new(RecordingHandler::new());
    let engine = engine(&repos).with_events(EventDispatcher::new(Some(handler.clone() as Arc<dyn EventHandler>)));

    assert_eq!(engine.complete_synchronize("mem://src", "mem://dest").unwrap(), 5);
    let (_, text) = dest.get_file("branch/a.txt", None).unwrap();
    assert_eq!(&text[..], b"one\ntwo\n");
    assert_eq!(
        dest.revision_property(3, revprops::LOG).unwrap(),
        source.revision_property(3, revprops::LOG).unwrap()
    );
    let replicated = handler
        .actions()
        .into_iter()
        .filter(|a| *a == EventAction::Replicated)
        .count();
    assert_eq!(replicated, 5);

    let cursor = engine.info("mem://dest").unwrap();
    assert_eq!(cursor.last_merged_rev, 5);
    assert_eq!(cursor.currently_copying, None);
}

fn with_handler(
    engine: SyncEngine,
    on_event: impl Fn(&Event) -> dsvn_core::Result<()> + Send + Sync + 'static,
) -> SyncEngine {
    engine.with_events(EventDispatcher::new(Some(
        Arc::new(common::OnEvent(on_event)) as Arc<dyn EventHandler>
    )))
}

#[test]
fn test_unexpected_revision_number_is_an_integrity_error() {
    let (repos, _source, dest) = mirrored();
    engine(&repos).initialize("mem://src", "mem://dest").unwrap();

    // A foreign commit lands right after r1 is mirrored.
    let foreign = repos.clone();
    let engine = with_handler(engine(&repos), move |event| {
        if event.action == EventAction::CommitCompleted && event.revision == Some(1) {
            let dest = common::open(&foreign, "mem://dest");
            common::commit(dest.as_ref(), "foreign", |e| {
                e.add_dir("foreign", None)?;
                e.close_dir("foreign")
            });
        }
        Ok(())
    });

    let err = engine.synchronize("mem://dest").unwrap_err();
    assert!(matches!(err, SvnError::IntegrityError(_)), "{:?}", err);
    assert!(err.to_string().contains("Commit created rev 3 but should have created 2"));
    assert_eq!(dest.revision_property(0, sync_props::LOCK).unwrap(), None);
    assert_eq!(
        dest.revision_property(0, sync_props::LAST_MERGED_REV).unwrap().as_deref(),
        Some("1")
    );
    assert_eq!(
        dest.revision_property(0, sync_props::CURRENTLY_COPYING).unwrap().as_deref(),
        Some("2")
    );
}

#[test]
fn test_cancelled_synchronize_releases_lock_and_resumes() {
    let (repos, source, dest) = mirrored();
    engine(&repos).initialize("mem://src", "mem://dest").unwrap();

    // Stop while r2's properties are being copied: r2 is committed but the
    // cursor still points at r1.
    let interrupted = with_handler(engine(&repos), |event| {
        if event.action == EventAction::RevpropsCopied && event.revision == Some(2) {
            return Err(SvnError::Cancelled);
        }
        Ok(())
    });
    let err = interrupted.synchronize("mem://dest").unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(dest.latest_revision().unwrap(), 2);
    assert_eq!(dest.revision_property(0, sync_props::LOCK).unwrap(), None);
    let cursor = engine(&repos).info("mem://dest").unwrap();
    assert_eq!(cursor.last_merged_rev, 1);
    assert_eq!(cursor.currently_copying, Some(2));

    assert_eq!(engine(&repos).synchronize("mem://dest").unwrap(), 5);
    let cursor = engine(&repos).info("mem://dest").unwrap();
    assert_eq!(cursor.last_merged_rev, 5);
    assert_eq!(cursor.currently_copying, None);
    assert_eq!(
        dest.revision_properties(2).unwrap(),
        source.revision_properties(2).unwrap()
    );
}

#[test]
fn test_cancel_token_stops_between_revisions() {
    let (repos, _source, dest) = mirrored();
    engine(&repos).initialize("mem://src", "mem://dest").unwrap();

    let token = CancelToken::new();
    let trigger = token.clone();
    let handler = common::OnEvent(move |event: &Event| {
        if event.action == EventAction::CommitCompleted && event.revision == Some(3) {
            trigger.cancel();
        }
        Ok(())
    });
    let events = EventDispatcher::new(Some(Arc::new(handler) as Arc<dyn EventHandler>)).with_cancel_token(token);

    let err = engine(&repos).with_events(events).synchronize("mem://dest").unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(dest.latest_revision().unwrap(), 3);
    assert_eq!(dest.revision_property(0, sync_props::LOCK).unwrap(), None);
    let cursor = engine(&repos).info("mem://dest").unwrap();
    assert_eq!(cursor.last_merged_rev, 3);
    assert_eq!(cursor.currently_copying, None);

    assert_eq!(engine(&repos).synchronize("mem://dest").unwrap(), 5);
}
