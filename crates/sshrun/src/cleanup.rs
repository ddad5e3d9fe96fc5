//! Removing the staged script

use crate::{Result, SshrunError};
use sshrun_ssh::Transport;
use tracing::debug;

/// Unlink `remote_path` over the saga's session
pub async fn remove(transport: &mut dyn Transport, remote_path: &str) -> Result<()> {
    debug!("Removing staged script {}", remote_path);
    transport
        .remove(remote_path)
        .await
        .map_err(SshrunError::from_cleanup)
}
