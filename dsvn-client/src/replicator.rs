//! Revision-by-revision replication for sources that cannot replay.

use std::collections::BTreeMap;

use dsvn_core::properties::revprops;
use dsvn_core::{
    drive_revision_delta, DeltaOptions, Event, EventAction, EventDispatcher, LogEntry, LogOptions, PropertySet,
    RepositorySession, Result, SessionReader, SvnError,
};

pub struct Replicator {
    events: EventDispatcher,
}

impl Replicator {
    pub fn new(events: EventDispatcher) -> Self {
        Self { events }
    }

    /// Copy revisions `from..=to` of `source` into `dest`, whose youngest
    /// revision must be `from - 1`. `to` defaults to the source HEAD.
    /// Returns the number of revisions copied.
    pub fn replicate(
        &self,
        source: &dyn RepositorySession,
        dest: &dyn RepositorySession,
        from: u64,
        to: Option<u64>,
    ) -> Result<u64> {
        let from = from.max(1);
        let dest_latest = dest.latest_revision()?;
        if dest_latest != from - 1 {
            return Err(SvnError::IllegalState(format!(
                "The target repository's latest revision must be '{}'",
                from - 1
            )));
        }
        for (role, session) in [("Source", source), ("Target", dest)] {
            if !session.is_at_root()? {
                return Err(SvnError::IllegalState(format!(
                    "{} repository location must be at repository root ({}), not at {}",
                    role,
                    session.repository_root()?,
                    session.location()
                )));
            }
        }

        let source_latest = source.latest_revision()?;
        let to = match to {
            Some(to) if to > 0 && to <= source_latest => to,
            _ => source_latest,
        };
        let mut count = 0;
        for rev in from..=to {
            self.replicate_revision(source, dest, rev, from)?;
            count += 1;
        }
        Ok(count)
    }

    fn replicate_revision(
        &self,
        source: &dyn RepositorySession,
        dest: &dyn RepositorySession,
        rev: u64,
        low_water_mark: u64,
    ) -> Result<()> {
        tracing::debug!("Replicating revision #{}", rev);
        let props = source.revision_properties(rev)?;
        let entry = self.log_entry(source, rev)?;
        let Some(changes) = entry.changed_paths.as_ref() else {
            return Err(SvnError::RepositoryAccessRequired(format!(
                "Revision '{}' does not contain information on changed paths; probably access is denied",
                rev
            )));
        };
        self.events.check_cancelled()?;
        self.events.dispatch(Event::new(EventAction::Replicating).with_revision(rev), None)?;

        let message = props.get(revprops::LOG).map(|v| v.to_string()).unwrap_or_default();
        let mut editor = dest.commit_editor(&message, &BTreeMap::new(), false, &PropertySet::new())?;
        let options = DeltaOptions {
            low_water_mark,
            send_deltas: true,
            base_revision: None,
        };
        let reader = SessionReader::new(source);
        let committed = drive_revision_delta(&reader, rev, changes, editor.as_mut(), options)
            .and_then(|()| editor.close_edit());
        if let Err(e) = committed {
            if let Err(abort_err) = editor.abort_edit() {
                tracing::debug!("abort after failed replication of r{}: {}", rev, abort_err);
            }
            return Err(e);
        }

        for (name, value) in props.iter() {
            if let Err(e) = dest.set_revision_property(rev, name, Some(value)) {
                tracing::warn!("r{}: could not set revision property '{}': {}", rev, name, e);
            }
        }
        self.events.dispatch(
            Event::new(EventAction::Replicated)
                .with_url(dest.location())
                .with_revision(rev),
            None,
        )
    }

    fn log_entry(&self, source: &dyn RepositorySession, rev: u64) -> Result<LogEntry> {
        let options = LogOptions {
            discover_changed_paths: true,
            limit: 1,
            ..LogOptions::default()
        };
        let mut found = None;
        source.log(&[String::new()], rev, rev, &options, &mut |entry| {
            found = Some(entry.clone());
            Ok(())
        })?;
        found.ok_or_else(|| SvnError::NotFound(format!("No log entry for revision {}", rev)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsvn_core::{Repositories, SessionFactory};

    #[test]
    fn test_destination_head_must_precede_start() {
        let repos = Repositories::new();
        repos.create_memory("src").unwrap();
        repos.create_memory("dest").unwrap();
        let source = repos.open("mem://src").unwrap();
        let dest = repos.open("mem://dest").unwrap();
        let replicator = Replicator::new(EventDispatcher::default());

        let err = replicator.replicate(source.as_ref(), dest.as_ref(), 3, None).unwrap_err();
        assert!(err.to_string().contains("latest revision must be '2'"));
        assert_eq!(replicator.replicate(source.as_ref(), dest.as_ref(), 1, None).unwrap(), 0);
    }

    #[test]
    fn test_sessions_must_be_at_root() {
        let repos = Repositories::new();
        repos.create_memory("src").unwrap();
        repos.create_memory("dest").unwrap();
        let source = repos.open("mem://src/trunk").unwrap();
        let dest = repos.open("mem://dest").unwrap();
        let err = Replicator::new(EventDispatcher::default())
            .replicate(source.as_ref(), dest.as_ref(), 0, None)
            .unwrap_err();
        assert!(err.to_string().contains("Source repository location must be at repository root"));
    }
}
