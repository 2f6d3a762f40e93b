use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::walk::WalkError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid root directory {}: {source}", path.display())]
    InvalidRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Walk(WalkError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("index has not been built yet")]
    NotReady,

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid search pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Coarse classification used at the boundary to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad root path or unusable storage; fatal at startup.
    Configuration,
    /// A traversal failure that escaped the per-entry handlers.
    Walk,
    /// The queried directory does not exist.
    NotFound,
    /// Storage failures, timeouts and anything else; details stay in the log.
    Internal,
    /// No snapshot has been built yet; retry later.
    NotReady,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRoot { .. } | Error::Config(_) => ErrorKind::Configuration,
            Error::Walk(_) => ErrorKind::Walk,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NotReady => ErrorKind::NotReady,
            Error::Storage(_) | Error::Io(_) | Error::Timeout(_) | Error::Pattern(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<WalkError> for Error {
    /// Unwraps errors that visitor callbacks raised as [`Error`] on their way
    /// through the walker.
    fn from(err: WalkError) -> Self {
        match err {
            WalkError::Visitor(inner) => match inner.downcast::<Error>() {
                Ok(err) => *err,
                Err(inner) => Error::Walk(WalkError::Visitor(inner)),
            },
            other => Error::Walk(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visitor_errors_are_unwrapped() {
        let walk = WalkError::visitor(Error::Timeout(Duration::from_secs(1)));
        assert!(matches!(Error::from(walk), Error::Timeout(_)));

        let walk = WalkError::visitor("plain message");
        let err = Error::from(walk);
        assert_eq!(err.kind(), ErrorKind::Walk);
        assert_eq!(err.to_string(), "plain message");
    }

    #[test]
    fn test_kinds() {
        assert_eq!(Error::NotReady.kind(), ErrorKind::NotReady);
        assert_eq!(Error::NotFound("/a/".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::Timeout(Duration::ZERO).kind(), ErrorKind::Internal);
        assert_eq!(Error::Config("bad".into()).kind(), ErrorKind::Configuration);
        let walk = WalkError::NotADirectory(PathBuf::from("/x"));
        assert_eq!(Error::from(walk).kind(), ErrorKind::Walk);
    }
}
