//! DSvn Client Library
//!
//! Client-side engines on top of `dsvn-core`:
//! - Revision and historical location resolution
//! - Commit harvesting, translation and driving, with post-commit
//!   working-copy updates
//! - URL-only deletes and directory creation
//! - Repository mirroring (`svnsync`-style) and plain replication

pub mod config;
pub mod resolver;
pub mod packet;
pub mod harvest;
pub mod driver;
pub mod commit;
pub mod sync;
pub mod replicator;

pub use commit::{CommitClient, CommitOptions};
pub use config::ClientConfig;
pub use driver::{translate_commitables, translate_lock_tokens, CommitTargets, Committer};
pub use harvest::CommitHarvester;
pub use packet::{normalize_message, CommitFlags, CommitItem, CommitMessageHandler, CommitPacket, DefaultMessageHandler};
pub use replicator::Replicator;
pub use resolver::{RevisionResolver, Target};
pub use sync::{SyncCursor, SyncEngine};
