//! Error types for sshrun

use thiserror::Error;
use std::time::Duration;

/// Everything that can end a saga without a result
#[derive(Debug, Error)]
pub enum SshrunError {
    /// No usable credential, or the host rejected it
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Could not reach or establish the session
    #[error("Connection error: {0}")]
    Connection(String),

    /// Staging the script on the remote host failed
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// The remote command could not be started
    #[error("Execution start error: {0}")]
    ExecutionStart(String),

    /// The remote command started but its output or exit status was lost
    #[error("Execution error: {0}")]
    Execution(String),

    /// The remote command outlived the command timeout
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration
    },

    /// Removing the staged script failed
    #[error("Cleanup error: {0}")]
    Cleanup(String),

    /// Options or host specification rejected before connecting
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

/// Coarse classification of [`SshrunError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`SshrunError::Authentication`]
    Authentication,
    /// See [`SshrunError::Connection`]
    Connection,
    /// See [`SshrunError::Transfer`]
    Transfer,
    /// See [`SshrunError::ExecutionStart`]
    ExecutionStart,
    /// See [`SshrunError::Execution`]
    Execution,
    /// See [`SshrunError::Timeout`]
    Timeout,
    /// See [`SshrunError::Cleanup`]
    Cleanup,
    /// See [`SshrunError::InvalidOptions`]
    InvalidOptions,
}

impl SshrunError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Transfer(_) => ErrorKind::Transfer,
            Self::ExecutionStart(_) => ErrorKind::ExecutionStart,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cleanup(_) => ErrorKind::Cleanup,
            Self::InvalidOptions(_) => ErrorKind::InvalidOptions,
        }
    }

    /// Map a failure of the connect step
    pub(crate) fn from_connect(err: sshrun_ssh::TransportError) -> Self {
        use sshrun_ssh::TransportError;
        match err {
            TransportError::Authentication(msg) => Self::Authentication(msg),
            TransportError::Configuration(msg) => Self::InvalidOptions(msg),
            TransportError::Timeout => Self::Connection("connection timed out".to_string()),
            other => Self::Connection(other.to_string()),
        }
    }

    /// Map a failure of the staging step
    pub(crate) fn from_transfer(err: sshrun_ssh::TransportError) -> Self {
        match err {
            sshrun_ssh::TransportError::Transfer(msg) => Self::Transfer(msg),
            other => Self::Transfer(other.to_string()),
        }
    }

    /// Map a failure to start the remote command
    pub(crate) fn from_exec_start(err: sshrun_ssh::TransportError) -> Self {
        match err {
            sshrun_ssh::TransportError::Exec(msg) => Self::ExecutionStart(msg),
            other => Self::ExecutionStart(other.to_string()),
        }
    }

    /// Map a failure while the remote command was running
    pub(crate) fn from_execution(err: sshrun_ssh::TransportError) -> Self {
        match err {
            sshrun_ssh::TransportError::Exec(msg) => Self::Execution(msg),
            other => Self::Execution(other.to_string()),
        }
    }

    /// Map a failure of the cleanup step
    pub(crate) fn from_cleanup(err: sshrun_ssh::TransportError) -> Self {
        match err {
            sshrun_ssh::TransportError::Remove(msg) => Self::Cleanup(msg),
            other => Self::Cleanup(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshrun_ssh::TransportError;

    #[test]
    fn test_connect_errors_keep_auth_distinct() {
        let err = SshrunError::from_connect(TransportError::Authentication("denied".into()));
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let err = SshrunError::from_connect(TransportError::Connection("refused".into()));
        assert_eq!(err.kind(), ErrorKind::Connection);

        let err = SshrunError::from_connect(TransportError::Timeout);
        assert_eq!(err.kind(), ErrorKind::Connection);

        let err = SshrunError::from_connect(TransportError::Configuration("no ssh2".into()));
        assert_eq!(err.kind(), ErrorKind::InvalidOptions);
    }

    #[test]
    fn test_step_errors_are_classified_by_step() {
        let io = || TransportError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));

        assert_eq!(SshrunError::from_transfer(io()).kind(), ErrorKind::Transfer);
        assert_eq!(SshrunError::from_exec_start(io()).kind(), ErrorKind::ExecutionStart);
        assert_eq!(SshrunError::from_execution(io()).kind(), ErrorKind::Execution);
        assert_eq!(SshrunError::from_cleanup(io()).kind(), ErrorKind::Cleanup);
    }

    #[test]
    fn test_messages_are_not_double_prefixed() {
        let err = SshrunError::from_transfer(TransportError::Transfer("disk full".into()));
        assert_eq!(err.to_string(), "Transfer error: disk full");
    }
}
