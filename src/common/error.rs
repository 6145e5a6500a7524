//! Error types for the pilot

use std::io;
use thiserror::Error;

/// Pilot error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Tunnel binary error: {0}")]
    Binary(String),

    #[error("No candidate configurations found in {0}")]
    EmptyPool(String),

    #[error("Duplicate candidate '{id}': {first} and {second}")]
    DuplicateCandidate {
        id: String,
        first: String,
        second: String,
    },

    #[error("Candidate '{candidate}' failed to start: {reason}")]
    StartupFailure { candidate: String, reason: String },

    #[error("No viable candidate")]
    NoViableCandidate,

    #[error("Swap {from} -> {to} failed, restored {from}: {reason}")]
    SwapRolledBack {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Swap {from} -> {to} failed and {from} could not be restored: {reason}")]
    SwapFailure {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn binary<S: Into<String>>(msg: S) -> Self {
        Error::Binary(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    pub fn startup<C: Into<String>, R: Into<String>>(candidate: C, reason: R) -> Self {
        Error::StartupFailure {
            candidate: candidate.into(),
            reason: reason.into(),
        }
    }

    /// Whether the process cannot continue after this error.
    ///
    /// `NoViableCandidate` is not listed: it is only fatal on the initial
    /// evaluation and callers decide that themselves.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::EmptyPool(_)
                | Error::DuplicateCandidate { .. }
                | Error::SwapFailure { .. }
                | Error::Config(_)
                | Error::Binary(_)
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::config("test error");
        assert!(matches!(e, Error::Config(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::startup("node-a", "exited during grace window");
        assert_eq!(
            e.to_string(),
            "Candidate 'node-a' failed to start: exited during grace window"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::EmptyPool("/etc/hysteria".into()).is_fatal());
        assert!(Error::SwapFailure {
            from: "a".into(),
            to: "b".into(),
            reason: "x".into()
        }
        .is_fatal());
        assert!(!Error::SwapRolledBack {
            from: "a".into(),
            to: "b".into(),
            reason: "x".into()
        }
        .is_fatal());
        assert!(!Error::NoViableCandidate.is_fatal());
        assert!(!Error::startup("a", "b").is_fatal());
    }

    #[tokio::test]
    async fn test_elapsed_becomes_timeout() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(Error::from(elapsed), Error::Timeout(_)));
    }
}
