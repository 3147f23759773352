//! Error taxonomy shared by every dsvn client operation.

use std::path::PathBuf;

/// Result type for client, session and working-copy operations
pub type Result<T> = std::result::Result<T, SvnError>;

/// Errors raised by revision resolution, commits, synchronization and the
/// session / working-copy abstractions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SvnError {
    #[error("Bad revision: {0}")]
    BadRevision(String),

    #[error("A versioned path is required to resolve revision '{0}'")]
    VersionedPathRequired(String),

    #[error("Repository access is required to resolve revision '{0}'")]
    RepositoryAccessRequired(String),

    #[error("Unrelated resources: {0}")]
    UnrelatedResources(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Integrity error: {0}")]
    IntegrityError(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Path '{0}' already exists")]
    AlreadyExists(String),

    #[error("Item '{0}' is out of date")]
    OutOfDate(String),

    #[error("'{}' is not under version control", .0.display())]
    UnversionedResource(PathBuf),

    #[error("Aborting commit: '{}' remains in conflict", .0.display())]
    WcConflict(PathBuf),

    #[error("Working copy file '{}' is missing", .0.display())]
    WcMissing(PathBuf),

    #[error("Cannot commit both '{0}' and '{1}' as they refer to the same URL")]
    DuplicateCommitUrl(String, String),

    #[error("Illegal URL: {0}")]
    IllegalUrl(String),

    #[error("Illegal commit target: {0}")]
    IllegalTarget(String),

    #[error("Checksum mismatch for '{path}': expected {expected}, actual {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl SvnError {
    /// True when the user asked the operation to stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SvnError::Cancelled)
    }

    /// True when the session lacks the capability; callers with a fallback
    /// strategy switch to it on this error.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, SvnError::NotImplemented(_))
    }
}

impl From<std::io::Error> for SvnError {
    fn from(e: std::io::Error) -> Self {
        SvnError::Io(e.to_string())
    }
}

impl From<rusqlite::Error> for SvnError {
    fn from(e: rusqlite::Error) -> Self {
        SvnError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for SvnError {
    fn from(e: bincode::Error) -> Self {
        SvnError::Storage(format!("serialization failed: {}", e))
    }
}

impl From<serde_json::Error> for SvnError {
    fn from(e: serde_json::Error) -> Self {
        SvnError::Storage(format!("json: {}", e))
    }
}

impl From<url::ParseError> for SvnError {
    fn from(e: url::ParseError) -> Self {
        SvnError::IllegalUrl(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(SvnError::Cancelled.is_cancelled());
        assert!(SvnError::NotImplemented("replay".into()).is_not_implemented());
        assert!(!SvnError::Io("boom".into()).is_not_implemented());
    }

    #[test]
    fn test_io_conversion() {
        let err: SvnError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(matches!(err, SvnError::Io(ref m) if m.contains("disk")));
    }
}
