//! Progress notification and cooperative cancellation

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, SvnError};
use crate::object::NodeKind;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    CommitAdded,
    CommitDeleted,
    CommitModified,
    CommitReplaced,
    CommitDeltaSent,
    CommitCompleted,
    /// A target was left out (unversioned input, missing item)
    Skip,
    /// An operation on this target failed; the error is attached
    Failed,
    Replicating,
    Replicated,
    RevpropsCopied,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventAction::CommitAdded => "Adding",
            EventAction::CommitDeleted => "Deleting",
            EventAction::CommitModified => "Sending",
            EventAction::CommitReplaced => "Replacing",
            EventAction::CommitDeltaSent => "Transmitting",
            EventAction::CommitCompleted => "Committed",
            EventAction::Skip => "Skipped",
            EventAction::Failed => "Failed",
            EventAction::Replicating => "Replicating",
            EventAction::Replicated => "Replicated",
            EventAction::RevpropsCopied => "Copied properties",
        };
        f.write_str(s)
    }
}

/// A notification
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub action: EventAction,
    pub path: Option<PathBuf>,
    pub url: Option<String>,
    pub kind: NodeKind,
    pub revision: Option<u64>,
    pub mime_type: Option<String>,
    pub error: Option<SvnError>,
}

impl Event {
    pub fn new(action: EventAction) -> Self {
        Self {
            action,
            path: None,
            url: None,
            kind: NodeKind::None,
            revision: None,
            mime_type: None,
            error: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn with_mime_type(mut self, mime_type: Option<String>) -> Self {
        self.mime_type = mime_type;
        self
    }

    pub fn failed(error: SvnError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(EventAction::Failed)
        }
    }
}

/// Receiver of notifications.
///
/// `handle_event` must only fail to propagate cancellation.
pub trait EventHandler: Send + Sync {
    /// `progress` is a fraction in `0.0..=1.0`, or `None` when unknown.
    fn handle_event(&self, _event: &Event, _progress: Option<f64>) -> Result<()> {
        Ok(())
    }

    /// Fail with `SvnError::Cancelled` when the user asked to stop.
    fn check_cancelled(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SvnError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Fans events out to an optional handler and keeps reported progress
/// non-decreasing.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handler: Option<Arc<dyn EventHandler>>,
    cancel: CancelToken,
    progress: Arc<Mutex<f64>>,
}

impl EventDispatcher {
    pub fn new(handler: Option<Arc<dyn EventHandler>>) -> Self {
        Self {
            handler,
            ..Self::default()
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn dispatch(&self, event: Event, progress: Option<f64>) -> Result<()> {
        let progress = progress.map(|p| {
            let mut last = match self.progress.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let clamped = p.clamp(0.0, 1.0).max(*last);
            *last = clamped;
            clamped
        });
        match &self.handler {
            Some(handler) => handler.handle_event(&event, progress),
            None => Ok(()),
        }
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()?;
        match &self.handler {
            Some(handler) => handler.check_cancelled(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("has_handler", &self.handler.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// Handler that keeps every event; used by tests and the CLIs' summaries.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<(Event, Option<f64>)>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn progress(&self) -> Vec<Option<f64>> {
        self.lock().iter().map(|(_, p)| *p).collect()
    }

    pub fn actions(&self) -> Vec<EventAction> {
        self.lock().iter().map(|(e, _)| e.action).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Event, Option<f64>)>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EventHandler for RecordingHandler {
    fn handle_event(&self, event: &Event, progress: Option<f64>) -> Result<()> {
        self.lock().push((event.clone(), progress));
        Ok(())
    }
}

/// Handler that writes each event to the log
#[derive(Debug, Default)]
pub struct TracingHandler;

impl EventHandler for TracingHandler {
    fn handle_event(&self, event: &Event, _progress: Option<f64>) -> Result<()> {
        let target = event
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| event.url.clone())
            .unwrap_or_default();
        match (&event.error, event.revision) {
            (Some(err), _) => tracing::warn!("{} {}: {}", event.action, target, err),
            (None, Some(rev)) => tracing::info!("{} {} r{}", event.action, target, rev),
            (None, None) => tracing::info!("{} {}", event.action, target),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_never_decreases() {
        let recorder = Arc::new(RecordingHandler::new());
        let dispatcher = EventDispatcher::new(Some(recorder.clone()));
        dispatcher.dispatch(Event::new(EventAction::Skip), Some(0.5)).unwrap();
        dispatcher.dispatch(Event::new(EventAction::Skip), Some(0.2)).unwrap();
        dispatcher.dispatch(Event::new(EventAction::Skip), None).unwrap();
        dispatcher.dispatch(Event::new(EventAction::Skip), Some(0.9)).unwrap();
        assert_eq!(recorder.progress(), vec![Some(0.5), Some(0.5), None, Some(0.9)]);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let dispatcher = EventDispatcher::new(None).with_cancel_token(token.clone());
        assert!(dispatcher.check_cancelled().is_ok());
        token.cancel();
        assert_eq!(dispatcher.check_cancelled(), Err(SvnError::Cancelled));
    }
}
