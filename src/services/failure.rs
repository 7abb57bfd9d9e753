use std::fmt::Display;
use std::io;

use strum::{AsRefStr, Display as StrumDisplay};

/// Why a reconstruction attempt failed, attached where the failure is raised.
///
/// Retriability is a property of the kind: retriable failures are requeued for
/// another attempt, everything else is dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The `project_{id}` working directory does not exist.
    DirectoryMissing,
    /// The project exists but its images are not visible yet.
    InputNotReady,
    /// Too few images, corrupt or unreadable input.
    InvalidInput,
    /// A pipeline stage exited non-zero or was killed.
    StageFailed,
    /// The stage executable could not be found.
    ToolUnavailable,
    PermissionDenied,
    Timeout,
    /// Out of disk space or memory.
    ResourceExhausted,
    /// Connection refused, reset or dropped.
    Network,
    /// All stages succeeded but no mesh was produced.
    OutputMissing,
    Unclassified,
}

impl FailureKind {
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::InputNotReady
                | Self::Timeout
                | Self::ResourceExhausted
                | Self::Network
                | Self::Unclassified
        )
    }

    pub fn from_io(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => Self::InputNotReady,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe => Self::Network,
            io::ErrorKind::StorageFull | io::ErrorKind::OutOfMemory => Self::ResourceExhausted,
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
                Self::InvalidInput
            }
            _ => Self::Unclassified,
        }
    }
}

/// Failure of a single reconstruction attempt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    kind: FailureKind,
    message: String,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Wrap an I/O error, classifying it by its `ErrorKind`.
    pub fn io(context: impl Display, err: io::Error) -> Self {
        Self::new(FailureKind::from_io(err.kind()), format!("{}: {}", context, err))
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl From<tokio::task::JoinError> for JobError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::new(FailureKind::Unclassified, format!("Background task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds_are_not_retriable() {
        for kind in [
            FailureKind::DirectoryMissing,
            FailureKind::InvalidInput,
            FailureKind::StageFailed,
            FailureKind::ToolUnavailable,
            FailureKind::PermissionDenied,
            FailureKind::OutputMissing,
        ] {
            assert!(!kind.is_retriable(), "{} should be fatal", kind);
        }
    }

    #[test]
    fn test_transient_kinds_are_retriable() {
        for kind in [
            FailureKind::InputNotReady,
            FailureKind::Timeout,
            FailureKind::ResourceExhausted,
            FailureKind::Network,
            FailureKind::Unclassified,
        ] {
            assert!(kind.is_retriable(), "{} should be retriable", kind);
        }
    }

    #[test]
    fn test_io_errors_classified_by_kind() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "Connection refused");
        let err = JobError::io("reading images", refused);
        assert_eq!(err.kind(), FailureKind::Network);
        assert!(err.is_retriable());
        assert_eq!(err.to_string(), "reading images: Connection refused");

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "Permission denied");
        assert!(!JobError::io("copying", denied).is_retriable());

        let full = io::Error::new(io::ErrorKind::StorageFull, "No space left on device");
        assert_eq!(JobError::io("copying", full).kind(), FailureKind::ResourceExhausted);

        let corrupt = io::Error::new(io::ErrorKind::InvalidData, "corrupt");
        assert_eq!(JobError::io("reading", corrupt).kind(), FailureKind::InvalidInput);
    }

    #[test]
    fn test_kind_names_are_snake_case() {
        assert_eq!(FailureKind::StageFailed.as_ref(), "stage_failed");
        assert_eq!(FailureKind::DirectoryMissing.to_string(), "directory_missing");
    }
}
