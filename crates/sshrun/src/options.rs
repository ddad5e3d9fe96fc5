//! Run configuration

use crate::{ProgressSink, Result, SshrunError};
use secrecy::SecretString;
use sshrun_ssh::{Credentials, SshOptions, TransportKind};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default remote staging directory
pub const DEFAULT_REMOTE_DIR: &str = "/tmp";

/// Default connection timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a single run can be configured with
#[derive(Clone)]
pub struct RunOptions {
    /// Private keys to authenticate with
    pub identities: Vec<PathBuf>,
    /// Password, used when no identity is usable
    pub password: Option<SecretString>,
    /// Arguments passed to the script
    pub args: Vec<String>,
    /// Buffer output lines into the result
    pub capture_output: bool,
    /// Sink handed the live process when execution starts
    pub progress: Option<Arc<dyn ProgressSink>>,
    /// Remote staging directory
    pub remote_dir: String,
    /// Transport implementation
    pub transport: TransportKind,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Upper bound on how long the script may run
    pub command_timeout: Option<Duration>,
    /// Verify host keys against known_hosts
    pub strict_host_key_checking: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            identities: Vec::new(),
            password: None,
            args: Vec::new(),
            capture_output: true,
            progress: None,
            remote_dir: DEFAULT_REMOTE_DIR.to_string(),
            transport: TransportKind::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: None,
            strict_host_key_checking: false,
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("identities", &self.identities)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("args", &self.args)
            .field("capture_output", &self.capture_output)
            .field("progress", &self.progress.is_some())
            .field("remote_dir", &self.remote_dir)
            .field("transport", &self.transport)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("strict_host_key_checking", &self.strict_host_key_checking)
            .finish()
    }
}

impl RunOptions {
    /// Options with every default in place
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a private key
    pub fn with_identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.identities.push(path.into());
        self
    }

    /// Set the password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Append a script argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace the script arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Enable/disable output capture
    pub fn with_capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// Set the progress sink
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Set the remote staging directory
    pub fn with_remote_dir(mut self, dir: impl Into<String>) -> Self {
        self.remote_dir = dir.into();
        self
    }

    /// Choose the transport
    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport = kind;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound how long the script may run
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Enable/disable known_hosts verification
    pub fn with_strict_host_key_checking(mut self, strict: bool) -> Self {
        self.strict_host_key_checking = strict;
        self
    }

    /// Reject option combinations that can never produce a run
    pub fn validate(&self) -> Result<()> {
        if self.remote_dir.trim().is_empty() {
            return Err(SshrunError::InvalidOptions("remote_dir is empty".to_string()));
        }
        if self.remote_dir.contains('\0') {
            return Err(SshrunError::InvalidOptions("remote_dir contains a NUL byte".to_string()));
        }
        if let Some(pos) = self.args.iter().position(|a| a.contains('\0')) {
            return Err(SshrunError::InvalidOptions(format!(
                "argument {} contains a NUL byte",
                pos
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(SshrunError::InvalidOptions("connect_timeout is zero".to_string()));
        }
        if self.command_timeout.is_some_and(|t| t.is_zero()) {
            return Err(SshrunError::InvalidOptions("command_timeout is zero".to_string()));
        }
        Ok(())
    }

    /// Credentials for the connection manager
    pub fn credentials(&self) -> Credentials {
        Credentials {
            identities: self.identities.clone(),
            password: self.password.clone(),
        }
    }

    /// Transport-level options
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            connect_timeout: self.connect_timeout,
            strict_host_key_checking: self.strict_host_key_checking,
            ..Default::default()
        }
    }
}
