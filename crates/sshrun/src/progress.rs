//! Live access to a running remote process

use sshrun_ssh::{OutputStream, RemoteProcess};
use std::sync::Mutex;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tracing::warn;

/// Receives the live process handle as soon as the remote command starts.
///
/// A sink that `take()`s `stdout` or `stderr` owns that stream from then on;
/// the executor only consumes streams the sink left in place.
pub trait ProgressSink: Send + Sync {
    /// Inspect or take the streams of a just-started process
    fn attach(&self, process: &mut RemoteProcess);
}

impl<F> ProgressSink for F
where
    F: Fn(&mut RemoteProcess) + Send + Sync,
{
    fn attach(&self, process: &mut RemoteProcess) {
        self(process)
    }
}

/// Copies remote stdout/stderr to the local stdout/stderr as it arrives
#[derive(Debug, Default)]
pub struct ConsoleTee {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsoleTee {
    /// Create a new tee
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until everything received so far has been written locally
    pub async fn finish(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Console forwarding task failed: {}", e);
            }
        }
    }

    fn spawn_copy<W>(&self, mut stream: OutputStream, mut local: W, name: &'static str)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let task = tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stream, &mut local).await {
                warn!("Forwarding remote {} failed: {}", name, e);
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }
}

impl ProgressSink for ConsoleTee {
    fn attach(&self, process: &mut RemoteProcess) {
        if let Some(stdout) = process.stdout.take() {
            self.spawn_copy(stdout, tokio::io::stdout(), "stdout");
        }
        if let Some(stderr) = process.stderr.take() {
            self.spawn_copy(stderr, tokio::io::stderr(), "stderr");
        }
    }
}
