//! # sshrun
//!
//! Upload a local shell script to a remote host, run it with arguments,
//! collect its output and exit status, then delete it again.
//!
//! Every run is a saga: the staged file is removed once staging succeeded,
//! and the session is closed exactly once, whatever happens in between.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sshrun::RunOptions;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = RunOptions::new()
//!         .with_identity("/home/me/.ssh/id_ed25519")
//!         .with_args(["--verbose", "two words"]);
//!
//!     let result = sshrun::run("deploy.sh", "admin@10.0.0.5", options).await?;
//!     println!("exit code {:?}", result.code);
//!     for line in &result.stdout {
//!         println!("{}", line);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod error;
pub mod executor;
pub mod options;
pub mod output;
pub mod progress;
pub mod saga;
pub mod staging;

pub use error::{ErrorKind, SshrunError};
pub use executor::{build_command, RemoteExecutor};
pub use options::{RunOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REMOTE_DIR};
pub use output::{OutputCollector, OutputSource, ProcessResult};
pub use progress::{ConsoleTee, ProgressSink};
pub use saga::{Saga, SagaPhase};
pub use staging::{ScriptStager, StagedScript};

pub use sshrun_ssh as ssh;

use sshrun_ssh::{ConnectionManager, ConnectionSpec};
use std::path::Path;

/// Result type for sshrun operations
pub type Result<T> = std::result::Result<T, SshrunError>;

/// Run `script` on `host` (`[user@]host[:port]`) and clean up after it.
///
/// A script that exits non-zero still returns `Ok`; inspect
/// [`ProcessResult::code`].
pub async fn run(script: impl AsRef<Path>, host: &str, options: RunOptions) -> Result<ProcessResult> {
    let spec = ConnectionSpec::parse(host)
        .map_err(SshrunError::from_connect)?
        .with_credentials(options.credentials());
    let manager = ConnectionManager::new(options.transport, options.ssh_options());

    Saga::new(manager, script.as_ref(), spec, options).run().await
}
