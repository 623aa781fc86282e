//! Error taxonomy for replication actions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Duplicate or malformed pair configuration. Aborts loading.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An action's precondition does not hold. The pair is left unchanged.
    #[error("{0}")]
    State(String),

    /// Lock marker present without a live transfer behind it.
    #[error("{destination}:{port} lock file exists, but no transfer appears to be running ({})", path.display())]
    Lock {
        destination: String,
        port: u16,
        path: PathBuf,
    },

    /// A transfer for this pair is already in flight. Not a failure.
    #[error("{destination}: transfer currently running")]
    IsRunning { destination: String },

    /// The `zfs` tool exited non-zero; carries its diagnostic output verbatim.
    #[error("{0}")]
    Storage(String),

    /// Remote session could not be opened or a remote command failed to run.
    #[error("transport error: {0}")]
    Transport(String),

    /// A step of the transfer pipeline failed.
    #[error("{step} failed: {message}")]
    Transfer { step: &'static str, message: String },

    #[error("unknown action {0}")]
    Action(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for conditions callers should report as status rather than failure.
    pub fn is_informational(&self) -> bool {
        matches!(self, Error::IsRunning { .. })
    }

    /// True when the storage tool reported a missing dataset.
    pub fn is_missing_dataset(&self) -> bool {
        matches!(self, Error::Storage(msg) if msg.contains("dataset does not exist"))
    }

    pub(crate) fn transfer(step: &'static str, message: impl Into<String>) -> Self {
        Error::Transfer {
            step,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_running_is_informational() {
        let err = Error::IsRunning {
            destination: "tank/backup".to_string(),
        };
        assert!(err.is_informational());
        assert!(!Error::State("x".into()).is_informational());
    }

    #[test]
    fn test_missing_dataset_detection() {
        let err = Error::Storage("cannot open 'tank/x': dataset does not exist".into());
        assert!(err.is_missing_dataset());
        let err = Error::Storage("permission denied".into());
        assert!(!err.is_missing_dataset());
        assert!(!Error::Transport("dataset does not exist".into()).is_missing_dataset());
    }

    #[test]
    fn test_storage_message_is_verbatim() {
        let err = Error::Storage("cannot receive: destination has been modified".into());
        assert_eq!(
            err.to_string(),
            "cannot receive: destination has been modified"
        );
    }
}
