//! Transport-level error types

use thiserror::Error;
use std::io;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to reach or establish the session
    #[error("SSH connection error: {0}")]
    Connection(String),
    
    /// No usable credential, or the host rejected it
    #[error("Authentication failed: {0}")]
    Authentication(String),
    
    /// Writing a remote file failed
    #[error("Transfer error: {0}")]
    Transfer(String),
    
    /// Remote command could not be started or its exit could not be collected
    #[error("Exec error: {0}")]
    Exec(String),
    
    /// Remote unlink failed
    #[error("Remove error: {0}")]
    Remove(String),
    
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    
    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
    
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

#[cfg(feature = "ssh2")]
impl TransportError {
    /// Classify a libssh2 error raised while establishing a session
    pub(crate) fn from_ssh2_connect(err: ssh2::Error) -> Self {
        let io_err: io::Error = err.into();
        match io_err.kind() {
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Connection(io_err.to_string()),
        }
    }
}
