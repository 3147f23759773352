//! Following nodes through copies, with and without server-side
//! location lookups

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use dsvn_client::{RevisionResolver, Target};
use dsvn_core::{Capabilities, MemoryWorkingCopy, Repositories, Revision, SvnError};

fn populated(get_locations: bool) -> Arc<Repositories> {
    let repos = common::repositories(&["src"]);
    let session = common::open(&repos, "mem://src");
    common::populate(session.as_ref());
    common::set_capabilities(
        &repos,
        "mem://src",
        Capabilities {
            get_locations,
            replay: true,
        },
    );
    repos
}

fn branch_file() -> Target {
    Target::Url("mem://src/branch/a.txt".into())
}

#[test]
fn test_locations_follow_branch_copy() {
    for get_locations in [true, false] {
        let resolver = RevisionResolver::new(populated(get_locations));
        let (start, end) = resolver
            .locate_historic(&branch_file(), &Revision::Number(5), &Revision::Number(1), &Revision::Number(4))
            .unwrap();
        assert_eq!(start.url, "mem://src/trunk/a.txt", "get_locations={}", get_locations);
        assert_eq!(start.revision, 1);
        let end = end.unwrap();
        assert_eq!(end.url, "mem://src/branch/a.txt", "get_locations={}", get_locations);
        assert_eq!(end.revision, 4);
    }
}

#[test]
fn test_undefined_end_gives_no_end_location() {
    let resolver = RevisionResolver::new(populated(true));
    let (start, end) = resolver
        .locate_historic(&branch_file(), &Revision::Head, &Revision::Head, &Revision::Undefined)
        .unwrap();
    assert_eq!(start.url, "mem://src/branch/a.txt");
    assert_eq!(start.revision, 5);
    assert!(end.is_none());

    let err = resolver
        .locate_historic(&branch_file(), &Revision::Undefined, &Revision::Head, &Revision::Undefined)
        .unwrap_err();
    assert!(matches!(err, SvnError::BadRevision(_)));
}

#[test]
fn test_open_at_older_revision() {
    let resolver = RevisionResolver::new(populated(false));
    let (session, revision) = resolver
        .open_at(&branch_file(), &Revision::Number(5), &Revision::Number(2))
        .unwrap();
    assert_eq!(revision, 2);
    assert_eq!(session.location(), "mem://src/trunk/a.txt");
    let (_, text) = session.get_file("", Some(revision)).unwrap();
    assert_eq!(&text[..], b"one\ntwo\n");
}

#[test]
fn test_replacement_without_copy_is_unrelated() {
    for get_locations in [true, false] {
        let repos = common::repositories(&["r"]);
        let session = common::open(&repos, "mem://r");
        common::commit(session.as_ref(), "add", |e| common::add_file(e, "f.txt", "old"));
        common::commit(session.as_ref(), "replace", |e| {
            e.delete_entry("f.txt", None)?;
            common::add_file(e, "f.txt", "new")
        });
        common::set_capabilities(
            &repos,
            "mem://r",
            Capabilities {
                get_locations,
                replay: true,
            },
        );

        let err = RevisionResolver::new(repos.clone())
            .locate_historic(
                &Target::Url("mem://r/f.txt".into()),
                &Revision::Number(2),
                &Revision::Number(1),
                &Revision::Undefined,
            )
            .unwrap_err();
        assert!(
            matches!(err, SvnError::UnrelatedResources(_)),
            "get_locations={}: {:?}",
            get_locations,
            err
        );
    }
}

#[test]
fn test_working_copy_target_uses_entry_url() {
    let repos = populated(true);
    let trunk = common::open(&repos, "mem://src/branch");
    let wc = MemoryWorkingCopy::checkout(trunk.as_ref(), "/wc").unwrap();
    let resolver = RevisionResolver::new(repos).with_working_copy(Arc::new(wc));

    let (start, _) = resolver
        .locate_historic(
            &Target::Path(PathBuf::from("/wc/a.txt")),
            &Revision::Base,
            &Revision::Number(1),
            &Revision::Undefined,
        )
        .unwrap();
    assert_eq!(start.url, "mem://src/trunk/a.txt");
    assert_eq!(start.revision, 1);
}
