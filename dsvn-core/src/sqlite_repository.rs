//! SQLite-backed repository storage
//!
//! Revision trees and changed-path lists are stored as zstd-compressed
//! bincode blobs, file texts as zstd-compressed content-addressed objects
//! and revision properties as JSON. The whole history is loaded into a
//! [`Repository`] on open; every later change is written through.

use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Result, SvnError};
use crate::object::ObjectId;
use crate::path;
use crate::properties::PropertySet;
use crate::repository::{Repository, RepositoryStore, RevisionRecord, TreeSnapshot};
use crate::session::ChangedPath;

const ZSTD_LEVEL: i32 = 3;

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::encode_all(data, ZSTD_LEVEL)?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::decode_all(data)?)
}

fn open_db(root: &Path) -> Result<Connection> {
    let db_path = root.join(SqliteRepository::DB_FILE);
    let conn = Connection::open(&db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", "-64000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS revisions (
            rev INTEGER PRIMARY KEY,
            tree BLOB NOT NULL,
            changes BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS revprops (
            rev INTEGER PRIMARY KEY,
            props TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS objects (
            id BLOB PRIMARY KEY,
            data BLOB NOT NULL
        ) WITHOUT ROWID;",
    )?;
    Ok(conn)
}

fn bytes_to_oid(bytes: &[u8]) -> Result<ObjectId> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SvnError::Corrupt(format!("object id of {} bytes", bytes.len())))?;
    Ok(ObjectId::new(arr))
}

/// Write-through store for a repository kept in `<dir>/dsvn.sqlite`
pub struct SqliteRepository {
    root: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub const DB_FILE: &'static str = "dsvn.sqlite";

    pub fn is_repository(dir: &Path) -> bool {
        dir.join(Self::DB_FILE).is_file()
    }

    /// Create a new empty repository in `dir`.
    pub fn create(dir: &Path) -> Result<Repository> {
        if Self::is_repository(dir) {
            return Err(SvnError::AlreadyExists(dir.display().to_string()));
        }
        fs::create_dir_all(dir)?;
        let store = Self {
            root: dir.to_path_buf(),
            conn: Mutex::new(open_db(dir)?),
        };
        let mut repo = Repository::new();
        store.set_meta("uuid", repo.uuid())?;
        repo.attach_store(Box::new(store))?;
        tracing::info!("created repository at {:?}", dir);
        Ok(repo)
    }

    /// Load the repository stored in `dir`.
    pub fn open(dir: &Path) -> Result<Repository> {
        if !Self::is_repository(dir) {
            return Err(SvnError::NotFound(format!("no repository at {:?}", dir)));
        }
        let store = Self {
            root: dir.to_path_buf(),
            conn: Mutex::new(open_db(dir)?),
        };
        let repo = store.load()?;
        tracing::debug!("opened repository at {:?} (r{})", dir, repo.youngest());
        Ok(repo.with_store(Box::new(store)))
    }

    /// Find the repository containing the local path named by a `file://`
    /// URL. Returns the repository root URL and the loaded repository.
    pub fn open_url(url: &str) -> Result<(String, Repository)> {
        let parsed = url::Url::parse(url)?;
        let local = parsed
            .to_file_path()
            .map_err(|_| SvnError::IllegalUrl(format!("'{}' is not a local file URL", url)))?;
        let dir = local
            .ancestors()
            .find(|dir| Self::is_repository(dir))
            .ok_or_else(|| SvnError::NotFound(format!("Unable to open a repository at URL '{}'", url)))?;
        Ok((Self::root_url(dir)?, Self::open(dir)?))
    }

    /// `file://` URL of a repository directory
    pub fn root_url(dir: &Path) -> Result<String> {
        let absolute = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(dir)
        };
        let url = url::Url::from_file_path(&absolute)
            .map_err(|_| SvnError::IllegalUrl(format!("cannot express {:?} as a URL", absolute)))?;
        path::canonicalize_url(url.as_str())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SvnError::IllegalState("sqlite connection lock poisoned".into()))
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn load(&self) -> Result<Repository> {
        let conn = self.conn()?;
        let uuid: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'uuid'", [], |r| r.get(0))
            .optional()?
            .ok_or_else(|| SvnError::Corrupt("repository has no uuid".into()))?;

        let mut revisions = Vec::new();
        let mut stmt = conn.prepare("SELECT rev, tree, changes FROM revisions ORDER BY rev")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let rev: i64 = row.get(0)?;
            if rev as usize != revisions.len() {
                return Err(SvnError::Corrupt(format!("revision {} is missing", revisions.len())));
            }
            let tree: Vec<u8> = row.get(1)?;
            let changes: Vec<u8> = row.get(2)?;
            let tree: TreeSnapshot = bincode::deserialize(&decompress(&tree)?)?;
            let changes: BTreeMap<String, ChangedPath> = bincode::deserialize(&decompress(&changes)?)?;
            revisions.push(RevisionRecord {
                tree: Arc::new(tree),
                changes,
            });
        }
        drop(rows);
        drop(stmt);

        let mut revprops = Vec::new();
        let mut stmt = conn.prepare("SELECT rev, props FROM revprops ORDER BY rev")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let json: String = row.get(1)?;
            revprops.push(serde_json::from_str::<PropertySet>(&json)?);
        }
        drop(rows);
        drop(stmt);

        let mut objects = HashMap::new();
        let mut stmt = conn.prepare("SELECT id, data FROM objects")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: Vec<u8> = row.get(0)?;
            let data: Vec<u8> = row.get(1)?;
            objects.insert(bytes_to_oid(&id)?, Bytes::from(decompress(&data)?));
        }

        Repository::from_parts(uuid, revisions, revprops, objects)
    }
}

impl RepositoryStore for SqliteRepository {
    fn save_object(&self, id: &ObjectId, data: &[u8]) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO objects (id, data) VALUES (?1, ?2)",
            params![id.as_bytes().as_slice(), compress(data)?],
        )?;
        Ok(())
    }

    fn save_revision(&self, revision: u64, record: &RevisionRecord, props: &PropertySet) -> Result<()> {
        let tree = compress(&bincode::serialize(record.tree.as_ref())?)?;
        let changes = compress(&bincode::serialize(&record.changes)?)?;
        let props = serde_json::to_string(props)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO revisions (rev, tree, changes) VALUES (?1, ?2, ?3)",
            params![revision as i64, tree, changes],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO revprops (rev, props) VALUES (?1, ?2)",
            params![revision as i64, props],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn save_revision_properties(&self, revision: u64, props: &PropertySet) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO revprops (rev, props) VALUES (?1, ?2)",
            params![revision as i64, serde_json::to_string(props)?],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::checksum;
    use crate::properties::revprops;
    use crate::repository::Repositories;
    use crate::session::{RepositorySession, SessionFactory};
    use tempfile::TempDir;

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let repo_dir = dir.path().join("repo");
        let uuid = {
            let repo = SqliteRepository::create(&repo_dir).unwrap();
            repo.uuid().to_string()
        };
        assert!(SqliteRepository::is_repository(&repo_dir));
        assert!(SqliteRepository::create(&repo_dir).is_err());

        let reopened = SqliteRepository::open(&repo_dir).unwrap();
        assert_eq!(reopened.uuid(), uuid);
        assert_eq!(reopened.youngest(), 0);
        assert!(reopened.revision_properties(0).unwrap().contains(revprops::DATE));
    }

    #[test]
    fn test_commits_are_written_through() {
        let dir = TempDir::new().unwrap();
        let repo_dir = dir.path().join("repo");
        SqliteRepository::create(&repo_dir).unwrap();
        let url = SqliteRepository::root_url(&repo_dir).unwrap();

        {
            let repos = Repositories::new();
            let session = repos.open(&url).unwrap();
            let mut editor = session
                .commit_editor("add file", &BTreeMap::new(), false, &PropertySet::new())
                .unwrap();
            editor.open_root(None).unwrap();
            editor.add_file("f.txt", None).unwrap();
            editor
                .apply_text_delta("f.txt", None, Bytes::from_static(b"persisted"))
                .unwrap();
            editor.close_file("f.txt", Some(&checksum(b"persisted"))).unwrap();
            editor.close_dir("").unwrap();
            assert_eq!(editor.close_edit().unwrap().revision, Some(1));
            session.set_revision_property(1, "custom", Some("value")).unwrap();
        }

        let repos = Repositories::new();
        let session = repos.open(&format!("{}/f.txt", url)).unwrap();
        assert_eq!(session.latest_revision().unwrap(), 1);
        assert_eq!(session.repository_root().unwrap(), url);
        let (_, text) = session.get_file("", None).unwrap();
        assert_eq!(&text[..], b"persisted");
        assert_eq!(
            session.revision_property(1, "custom").unwrap().as_deref(),
            Some("value")
        );
        assert_eq!(
            session.revision_property(1, revprops::LOG).unwrap().as_deref(),
            Some("add file")
        );
    }
}
