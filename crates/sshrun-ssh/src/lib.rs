//! # sshrun SSH transport
//!
//! Transport layer for sshrun: an `ssh` subprocess transport, an in-process
//! libssh2 transport and a local transport, all behind one [`Transport`]
//! trait.

#![warn(missing_docs)]

/// Transport abstraction and process/file handles
pub mod transport;

/// Session establishment
pub mod connection;

/// Host specification parsing
pub mod target;

/// Credential resolution
pub mod auth;

/// POSIX shell quoting
pub mod shell;

/// External `ssh` binary transport
pub mod stdio;

/// In-process libssh2 transport
#[cfg(feature = "ssh2")]
pub mod libssh2;

/// Local transport
pub mod local;

/// Transport-level error types
pub mod error;

pub use transport::{
    ConnectionInfo, OutputStream, RemoteExit, RemoteFile, RemoteProcess, Transport, TransportType,
};
pub use connection::{ConnectionManager, Connector, SshOptions, TransportKind};
pub use target::{ConnectionSpec, DEFAULT_PORT};
pub use auth::{AuthMethod, Credentials};
pub use shell::shell_quote;
pub use stdio::StdioTransport;
#[cfg(feature = "ssh2")]
pub use libssh2::Ssh2Transport;
pub use local::LocalTransport;
pub use error::TransportError;
