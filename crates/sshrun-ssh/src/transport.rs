//! Transport abstraction and the handles it hands out

use async_trait::async_trait;
use crate::TransportError;
use futures::future::BoxFuture;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Boxed byte stream coming from a remote process
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Authenticated remote session.
///
/// A transport is owned by exactly one saga. It transfers bytes into remote
/// files, runs remote commands and unlinks remote files. `close` consumes the
/// session, so it can only ever be closed once.
#[async_trait]
pub trait Transport: Send {
    /// Open a write stream to `remote_path`, truncating any existing file
    async fn create_file(&mut self, remote_path: &str) -> Result<RemoteFile, TransportError>;

    /// Start `command` through the remote shell
    async fn exec(&mut self, command: &str) -> Result<RemoteProcess, TransportError>;

    /// Unlink `remote_path`
    async fn remove(&mut self, remote_path: &str) -> Result<(), TransportError>;

    /// Tear the session down
    async fn close(self: Box<Self>) -> Result<(), TransportError>;

    /// Get connection information
    fn connection_info(&self) -> ConnectionInfo;
}

/// Connection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username, when known
    pub username: Option<String>,
    /// Connection type
    pub transport_type: TransportType,
}

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// SSH with subprocess
    SshSubprocess,
    /// SSH with libssh2
    SshLibssh2,
    /// Local process (for testing)
    Local,
}

/// Write half of a remote file transfer.
///
/// Bytes written here travel to the remote file. The transfer is only known
/// to have landed once [`RemoteFile::finish`] returns `Ok`, because remote
/// failures (permission denied, disk full) often show up after the last
/// local write.
pub struct RemoteFile {
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    completion: BoxFuture<'static, Result<(), TransportError>>,
}

impl RemoteFile {
    /// Pair a writer with the future that reports the remote outcome.
    ///
    /// `completion` is polled only after the writer has been shut down and
    /// dropped, so it may wait for the remote side to see end-of-file.
    pub fn new<W>(writer: W, completion: BoxFuture<'static, Result<(), TransportError>>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Some(Box::new(writer)),
            completion,
        }
    }

    /// Close the write stream and wait for the remote side to finish
    pub async fn finish(mut self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.take() {
            // A shutdown failure means the remote end is already gone; the
            // completion future carries the real reason.
            let _ = writer.shutdown().await;
        }
        self.completion.await
    }
}

impl AsyncWrite for RemoteFile {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFile")
            .field("open", &self.writer.is_some())
            .finish()
    }
}

/// How a remote process terminated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteExit {
    /// Exit code, when the process exited normally
    pub code: Option<i32>,
    /// Signal name (e.g. `TERM`), when the process was killed by one
    pub signal: Option<String>,
}

impl RemoteExit {
    /// Normal termination
    pub fn code(code: i32) -> Self {
        Self { code: Some(code), signal: None }
    }

    /// Termination by signal
    pub fn signal(signal: impl Into<String>) -> Self {
        Self { code: None, signal: Some(signal.into()) }
    }

    #[cfg(unix)]
    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::code(code),
            (None, Some(sig)) => Self::signal(signal_name(sig)),
            (None, None) => Self::default(),
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        Self { code: status.code(), signal: None }
    }
}

/// Map a signal number to its conventional name, without the `SIG` prefix
#[cfg(unix)]
fn signal_name(sig: i32) -> String {
    let name = match sig {
        1 => "HUP",
        2 => "INT",
        3 => "QUIT",
        4 => "ILL",
        6 => "ABRT",
        8 => "FPE",
        9 => "KILL",
        11 => "SEGV",
        13 => "PIPE",
        14 => "ALRM",
        15 => "TERM",
        _ => return sig.to_string(),
    };
    name.to_string()
}

/// Live handle on a started remote process.
///
/// Streams are `Option`s so a progress sink can `take()` the ones it wants
/// to consume itself; whatever is left belongs to the caller of `exec`.
pub struct RemoteProcess {
    /// Remote standard output
    pub stdout: Option<OutputStream>,
    /// Remote standard error
    pub stderr: Option<OutputStream>,
    exit: BoxFuture<'static, Result<RemoteExit, TransportError>>,
}

impl RemoteProcess {
    /// Assemble a process handle from its streams and termination future
    pub fn new<O, E>(stdout: O, stderr: E, exit: BoxFuture<'static, Result<RemoteExit, TransportError>>) -> Self
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            stdout: Some(Box::new(stdout)),
            stderr: Some(Box::new(stderr)),
            exit,
        }
    }

    /// Wait for the termination event.
    ///
    /// Streams still held by the handle are dropped first, so a process
    /// blocked on a full pipe is not kept waiting on a reader that will never
    /// come.
    pub async fn wait(mut self) -> Result<RemoteExit, TransportError> {
        self.stdout.take();
        self.stderr.take();
        self.exit.await
    }
}

impl fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_remote_file_finish_runs_completion_after_shutdown() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let completion = async move {
            let mut received = String::new();
            reader.read_to_string(&mut received).await?;
            if received == "echo hi\n" {
                Ok::<_, TransportError>(())
            } else {
                Err(TransportError::Transfer(format!("got {:?}", received)))
            }
        }
        .boxed();

        let mut file = RemoteFile::new(writer, completion);
        file.write_all(b"echo hi\n").await.unwrap();
        file.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_process_streams_can_be_taken() {
        let exit = async { Ok(RemoteExit::code(3)) }.boxed();
        let mut process = RemoteProcess::new(&b"out\n"[..], &b"err\n"[..], exit);

        let mut stdout = process.stdout.take().unwrap();
        let mut text = String::new();
        stdout.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "out\n");
        assert!(process.stdout.is_none());
        assert!(process.stderr.is_some());

        assert_eq!(process.wait().await.unwrap(), RemoteExit::code(3));
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(15), "TERM");
        assert_eq!(signal_name(9), "KILL");
        assert_eq!(signal_name(64), "64");
    }
}
