//! Session establishment

use async_trait::async_trait;
use crate::{ConnectionSpec, LocalTransport, StdioTransport, Transport, TransportError};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Options shared by every SSH transport
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Refuse hosts whose key is not in `~/.ssh/known_hosts`
    pub strict_host_key_checking: bool,
    /// Extra `-o key=value` options for the ssh binary
    pub extra: BTreeMap<String, String>,
    /// ssh binary used by the subprocess transport, looked up on `PATH` when relative
    pub program: PathBuf,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            strict_host_key_checking: false,
            extra: BTreeMap::new(),
            program: PathBuf::from("ssh"),
        }
    }
}

/// Which transport implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// External `ssh` binary with a control master
    #[default]
    Subprocess,
    /// In-process libssh2 session with SFTP
    Libssh2,
    /// This machine, for dry runs and tests
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Subprocess => "subprocess",
            TransportKind::Libssh2 => "libssh2",
            TransportKind::Local => "local",
        };
        f.write_str(name)
    }
}

/// Something that can open a session for a saga
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate one session. Never retries.
    async fn connect(&self, spec: &ConnectionSpec) -> Result<Box<dyn Transport>, TransportError>;
}

/// Builds transports of the configured kind
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    kind: TransportKind,
    options: SshOptions,
}

impl ConnectionManager {
    /// Create a manager for `kind`
    pub fn new(kind: TransportKind, options: SshOptions) -> Self {
        Self { kind, options }
    }
}

#[async_trait]
impl Connector for ConnectionManager {
    async fn connect(&self, spec: &ConnectionSpec) -> Result<Box<dyn Transport>, TransportError> {
        debug!("Opening {} session to {}", self.kind, spec);

        let transport: Box<dyn Transport> = match self.kind {
            TransportKind::Subprocess => Box::new(StdioTransport::connect(spec, &self.options).await?),
            #[cfg(feature = "ssh2")]
            TransportKind::Libssh2 => Box::new(crate::Ssh2Transport::connect(spec, &self.options).await?),
            #[cfg(not(feature = "ssh2"))]
            TransportKind::Libssh2 => {
                return Err(TransportError::Configuration(
                    "built without the ssh2 feature".to_string(),
                ))
            }
            TransportKind::Local => Box::new(LocalTransport::new()),
        };

        let info = transport.connection_info();
        info!("Session open to {} via {:?}", info.host, info.transport_type);
        Ok(transport)
    }
}
