//! Revision and location resolution
//!
//! Turns [`Revision`] specifiers into revision numbers and follows a node
//! through renames and copies to find the URL it had at other revisions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dsvn_core::path;
use dsvn_core::{
    Depth, Entry, EventDispatcher, LogEntry, LogOptions, NodeKind, RepositoryLocation, RepositorySession, Result,
    Revision, SessionFactory, SvnError, WorkingCopy,
};

/// What a location query starts from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Url(String),
    Path(PathBuf),
}

impl Target {
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Target::Path(p) => Some(p),
            Target::Url(_) => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Url(url) => f.write_str(url),
            Target::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

pub struct RevisionResolver {
    factory: Arc<dyn SessionFactory>,
    wc: Option<Arc<dyn WorkingCopy>>,
    events: EventDispatcher,
}

impl RevisionResolver {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            wc: None,
            events: EventDispatcher::default(),
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

    fn wc_entry(&self, p: &Path) -> Result<Entry> {
        let wc = self
            .wc
            .as_ref()
            .ok_or_else(|| SvnError::UnversionedResource(p.to_path_buf()))?;
        let mut access = wc.probe_open(p, false, Depth::Empty)?;
        let entry = access.entry(p);
        access.close()?;
        match entry? {
            Some(entry) if !(entry.deleted && entry.schedule == dsvn_core::Schedule::Normal) => Ok(entry),
            _ => Err(SvnError::UnversionedResource(p.to_path_buf())),
        }
    }

    /// Resolve `revision` to a number. HEAD and dates need `session`; the
    /// working-copy keywords need `local_path`.
    pub fn resolve(
        &self,
        revision: &Revision,
        session: Option<&dyn RepositorySession>,
        local_path: Option<&Path>,
    ) -> Result<u64> {
        match revision {
            Revision::Number(n) => Ok(*n),
            Revision::Head | Revision::Date(_) => {
                let session = session.ok_or_else(|| SvnError::RepositoryAccessRequired(revision.to_string()))?;
                match revision {
                    Revision::Date(date) => session.dated_revision(*date),
                    _ => session.latest_revision(),
                }
            }
            Revision::Undefined => Err(SvnError::BadRevision(format!(
                "Unrecognized revision type requested for '{}'",
                local_path
                    .map(|p| p.display().to_string())
                    .or_else(|| session.map(|s| s.location().to_string()))
                    .unwrap_or_default()
            ))),
            Revision::Base | Revision::Working | Revision::Committed | Revision::Previous => {
                let p = local_path.ok_or_else(|| SvnError::VersionedPathRequired(revision.to_string()))?;
                let entry = self.wc_entry(p)?;
                if matches!(revision, Revision::Base | Revision::Working) {
                    return entry.revision.ok_or_else(|| {
                        SvnError::BadRevision(format!("Path '{}' has no base revision", p.display()))
                    });
                }
                let committed = entry.committed_revision.ok_or_else(|| {
                    SvnError::BadRevision(format!("Path '{}' has no committed revision", p.display()))
                })?;
                if *revision == Revision::Committed {
                    return Ok(committed);
                }
                committed.checked_sub(1).ok_or_else(|| {
                    SvnError::BadRevision(format!("Path '{}' has no previous revision", p.display()))
                })
            }
        }
    }

    /// Find where the node identified by `target@peg` lived at `start` and
    /// `end`. The end location is `None` when `end` is undefined.
    pub fn locate_historic(
        &self,
        target: &Target,
        peg: &Revision,
        start: &Revision,
        end: &Revision,
    ) -> Result<(RepositoryLocation, Option<RepositoryLocation>)> {
        if !peg.is_valid() || !start.is_valid() {
            return Err(SvnError::BadRevision(format!(
                "peg and start revisions must be defined for '{}'",
                target
            )));
        }
        let local_path = target.local_path();
        let mut peg_number = None;
        let url = match target {
            Target::Url(url) => path::canonicalize_url(url)?,
            Target::Path(p) => {
                let entry = self.wc_entry(p)?;
                match (&entry.copy_from, peg) {
                    (Some((cf_url, cf_rev)), Revision::Working) => {
                        peg_number = Some(*cf_rev);
                        cf_url.clone()
                    }
                    _ => entry
                        .url
                        .ok_or_else(|| SvnError::IllegalUrl(format!("'{}' has no URL", p.display())))?,
                }
            }
        };

        let session = self.factory.open(&url)?;
        let peg_number = match peg_number {
            Some(n) => n,
            None => self.resolve(peg, Some(session.as_ref()), local_path)?,
        };
        let start_number = if peg == start && *peg == Revision::Head {
            peg_number
        } else {
            self.resolve(start, Some(session.as_ref()), local_path)?
        };
        let end_number = if end.is_valid() {
            self.resolve(end, Some(session.as_ref()), local_path)?
        } else {
            start_number
        };

        if start_number == peg_number && end_number == peg_number {
            let start_loc = RepositoryLocation {
                url: url.clone(),
                revision: start_number,
            };
            let end_loc = end.is_valid().then(|| RepositoryLocation {
                url,
                revision: end_number,
            });
            return Ok((start_loc, end_loc));
        }

        let root = session.repository_root()?;
        let revisions: Vec<u64> = if start_number == end_number {
            vec![start_number]
        } else {
            vec![start_number, end_number]
        };
        let locations = match session.get_locations("", peg_number, &revisions) {
            Ok(locations) => locations,
            Err(e) if e.is_not_implemented() => {
                tracing::debug!("get-locations unavailable for {}, scanning log instead", url);
                self.locations_from_log(session.as_ref(), peg_number, start_number, end_number)?
            }
            Err(e) => return Err(e),
        };

        let start_path = locations.get(&start_number).ok_or_else(|| {
            SvnError::UnrelatedResources(format!(
                "Unable to find repository location for '{}' in revision {}",
                target, start_number
            ))
        })?;
        let end_path = locations.get(&end_number).ok_or_else(|| {
            SvnError::UnrelatedResources(format!(
                "The location for '{}' for revision {} does not exist in the repository or refers to an unrelated object",
                target, end_number
            ))
        })?;

        let start_loc = RepositoryLocation {
            url: path::url_append(&root, &path::from_absolute(start_path)),
            revision: start_number,
        };
        let end_loc = end.is_valid().then(|| RepositoryLocation {
            url: path::url_append(&root, &path::from_absolute(end_path)),
            revision: end_number,
        });
        Ok((start_loc, end_loc))
    }

    /// Open a session on the location `target@peg` had at `revision`, and
    /// return it with the resolved revision number.
    pub fn open_at(
        &self,
        target: &Target,
        peg: &Revision,
        revision: &Revision,
    ) -> Result<(Box<dyn RepositorySession>, u64)> {
        let mut revision = *revision;
        if !revision.is_valid() && peg.is_valid() {
            revision = *peg;
        }
        let (start, peg) = match target {
            Target::Url(_) => (
                if revision.is_valid() { revision } else { Revision::Head },
                if peg.is_valid() { *peg } else { Revision::Head },
            ),
            Target::Path(_) => (
                if revision.is_valid() { revision } else { Revision::Base },
                if peg.is_valid() { *peg } else { Revision::Working },
            ),
        };
        let (location, _) = self.locate_historic(target, &peg, &start, &Revision::Undefined)?;
        let session = self.factory.open(&location.url)?;
        Ok((session, location.revision))
    }

    /// Location lookup for sessions without `get-locations`: walk the log
    /// of the session path from the newest revision of interest down to the
    /// oldest, following copies backwards.
    fn locations_from_log(
        &self,
        session: &dyn RepositorySession,
        peg: u64,
        start: u64,
        end: u64,
    ) -> Result<BTreeMap<u64, String>> {
        let repo_path = path::to_absolute(&session.root_relative_path()?);
        let kind = session.check_path("", Some(peg))?;
        if kind == NodeKind::None {
            return Err(SvnError::NotFound(format!(
                "path '{}' doesn't exist at revision {}",
                repo_path, peg
            )));
        }

        let newest = peg.max(start).max(end);
        let oldest = peg.min(start).min(end);
        let mut tracker = LocationTracker {
            current: Some(repo_path.clone()),
            start,
            end,
            peg,
            start_path: None,
            end_path: None,
            peg_path: None,
            kind,
        };
        let options = LogOptions {
            discover_changed_paths: true,
            ..LogOptions::default()
        };
        session.log(&[String::new()], newest, oldest, &options, &mut |entry| {
            self.events.check_cancelled()?;
            tracker.handle(entry)
        })?;

        let current = tracker.current.clone();
        if tracker.peg_path.is_none() && current.is_none() {
            return Err(SvnError::NotFound(format!(
                "path '{}' in revision {} is an unrelated object",
                repo_path, oldest
            )));
        }
        let mut result = BTreeMap::new();
        if let Some(p) = tracker.start_path.or_else(|| current.clone()) {
            result.insert(start, p);
        }
        if let Some(p) = tracker.end_path.or(current) {
            result.insert(end, p);
        }
        Ok(result)
    }
}

/// Follows one path backwards through log entries, remembering where it
/// was when each revision of interest was passed.
struct LocationTracker {
    current: Option<String>,
    start: u64,
    end: u64,
    peg: u64,
    start_path: Option<String>,
    end_path: Option<String>,
    peg_path: Option<String>,
    kind: NodeKind,
}

impl LocationTracker {
    fn handle(&mut self, entry: &LogEntry) -> Result<()> {
        let Some(changed) = &entry.changed_paths else {
            return Ok(());
        };
        let Some(current) = self.current.clone() else {
            return Ok(());
        };
        if self.start_path.is_none() && entry.revision <= self.start {
            self.start_path = Some(current.clone());
        }
        if self.end_path.is_none() && entry.revision <= self.end {
            self.end_path = Some(current.clone());
        }
        if self.peg_path.is_none() && entry.revision <= self.peg {
            self.peg_path = Some(current.clone());
        }
        self.current = previous_path(&current, entry.revision, changed, self.kind)?;
        Ok(())
    }
}

/// Path the node at `current` had before `revision`. `None` when it was
/// created from scratch in `revision`.
fn previous_path(
    current: &str,
    revision: u64,
    changed: &BTreeMap<String, dsvn_core::ChangedPath>,
    kind: NodeKind,
) -> Result<Option<String>> {
    if let Some(change) = changed.get(current) {
        if !change.action.is_addition() {
            return Ok(Some(current.to_string()));
        }
        return Ok(change.copy_from.as_ref().map(|(p, _)| p.clone()));
    }

    let mut candidates: Vec<&String> = changed.keys().collect();
    path::sort_paths(&mut candidates);
    for candidate in candidates.into_iter().rev() {
        let Some(suffix) = current.strip_prefix(candidate.as_str()).and_then(|s| s.strip_prefix('/')) else {
            continue;
        };
        if let Some((src, _)) = &changed[candidate].copy_from {
            return Ok(Some(format!("{}/{}", src.trim_end_matches('/'), suffix)));
        }
    }

    if kind == NodeKind::Dir {
        Ok(Some(current.to_string()))
    } else {
        Err(SvnError::UnrelatedResources(format!(
            "Missing changed-path information for '{}' in revision {}",
            current, revision
        )))
    }
}
