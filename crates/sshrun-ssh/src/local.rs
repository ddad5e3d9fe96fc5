//! Local transport: the "remote" host is this machine

use async_trait::async_trait;
use crate::{ConnectionInfo, RemoteExit, RemoteFile, RemoteProcess, Transport, TransportError, TransportType};
use futures::FutureExt;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Runs commands through the local `sh` and treats local paths as remote
/// paths. Used for dry runs and end-to-end tests without an SSH server.
#[derive(Debug, Default)]
pub struct LocalTransport {
    _private: (),
}

impl LocalTransport {
    /// Create a new local transport
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn create_file(&mut self, remote_path: &str) -> Result<RemoteFile, TransportError> {
        debug!("Creating local file {}", remote_path);
        let file = tokio::fs::File::create(remote_path)
            .await
            .map_err(|e| TransportError::Transfer(format!("cannot create {}: {}", remote_path, e)))?;
        Ok(RemoteFile::new(file, async { Ok::<_, TransportError>(()) }.boxed()))
    }

    async fn exec(&mut self, command: &str) -> Result<RemoteProcess, TransportError> {
        debug!("Executing local command: sh -c {}", command);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Exec(format!("Failed to start sh: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Exec("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Exec("stderr not captured".to_string()))?;

        let exit = async move {
            let status = child.wait().await?;
            Ok::<_, TransportError>(RemoteExit::from_status(status))
        }
        .boxed();

        Ok(RemoteProcess::new(stdout, stderr, exit))
    }

    async fn remove(&mut self, remote_path: &str) -> Result<(), TransportError> {
        debug!("Removing local file {}", remote_path);
        tokio::fs::remove_file(remote_path)
            .await
            .map_err(|e| TransportError::Remove(format!("cannot remove {}: {}", remote_path, e)))
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        debug!("Closing local transport");
        Ok(())
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: "localhost".to_string(),
            port: 0,
            username: None,
            transport_type: TransportType::Local,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_local_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        let path = path.to_str().unwrap();
        let mut transport = LocalTransport::new();

        let mut file = transport.create_file(path).await.unwrap();
        file.write_all(b"echo out; echo err >&2; exit 4\n").await.unwrap();
        file.finish().await.unwrap();

        let mut process = transport.exec(&format!("sh {}", path)).await.unwrap();
        let mut out = String::new();
        process.stdout.take().unwrap().read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        process.stderr.take().unwrap().read_to_string(&mut err).await.unwrap();
        let exit = process.wait().await.unwrap();

        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
        assert_eq!(exit, RemoteExit::code(4));

        transport.remove(path).await.unwrap();
        assert!(!dir.path().join("script.sh").exists());
        assert!(matches!(transport.remove(path).await, Err(TransportError::Remove(_))));

        Box::new(transport).close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_file_in_missing_dir_fails() {
        let mut transport = LocalTransport::new();
        let err = transport.create_file("/nonexistent-dir/x/y.sh").await.unwrap_err();
        assert!(matches!(err, TransportError::Transfer(_)));
    }

    #[tokio::test]
    async fn test_signal_termination() {
        let mut transport = LocalTransport::new();
        let process = transport.exec("kill -TERM $$").await.unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(exit, RemoteExit::signal("TERM"));
    }
}
