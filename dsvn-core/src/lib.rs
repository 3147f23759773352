//! DSvn Core Library
//!
//! Building blocks shared by the dsvn client engine:
//! - Error taxonomy, revision specifiers, paths and URLs
//! - Repository session and tree-edit (commit editor) abstractions
//! - Working-copy access abstraction and an in-memory working copy
//! - Progress notification and cancellation
//! - Revision delta driver used by replay and replication
//! - In-memory and SQLite-backed repositories (WAL mode)
//! - Session pool with a background idle sweep

pub mod error;
pub mod object;
pub mod path;
pub mod properties;
pub mod revision;
pub mod session;
pub mod editor;
pub mod event;
pub mod wc;
pub mod delta;
pub mod repository;
pub mod sqlite_repository;
pub mod memory_wc;
pub mod pool;

pub use delta::{drive_revision_delta, DeltaOptions, SessionReader, SnapshotReader};
pub use editor::{drive_commit_editor, CommitEditor, CommitInfo, CommitPathHandler};
pub use error::{Result, SvnError};
pub use event::{CancelToken, Event, EventAction, EventDispatcher, EventHandler, RecordingHandler, TracingHandler};
pub use memory_wc::MemoryWorkingCopy;
pub use object::{checksum, Depth, NodeKind, ObjectId};
pub use pool::{PooledSession, SessionPool};
pub use properties::{PropertyDiff, PropertySet};
pub use repository::{Capabilities, LocalSession, Repositories, Repository, SharedRepository};
pub use revision::Revision;
pub use session::{
    ChangeAction, ChangedPath, DirEntry, LogEntry, LogOptions, RepositoryLocation, RepositorySession,
    SessionFactory,
};
pub use sqlite_repository::SqliteRepository;
pub use wc::{Entry, FixedPolicy, MissingAction, MissingItemPolicy, PostCommit, Schedule, WcAccess, WorkingCopy};
