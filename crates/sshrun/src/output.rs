//! Line splitting and output collection

use futures::Stream;
use serde::{Deserialize, Serialize};
use sshrun_ssh::RemoteExit;
use std::io;
use tokio::io::{AsyncRead, BufReader};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;

/// Which remote stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Outcome of a remote script run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    /// Exit code, if the script exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the script was killed
    pub signal: Option<String>,
    /// Standard output lines, in order
    pub stdout: Vec<String>,
    /// Standard error lines, in order
    pub stderr: Vec<String>,
    /// Both streams interleaved in arrival order
    pub output: Vec<String>,
}

impl ProcessResult {
    /// Whether the script exited with status 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Lazily split a byte stream into lines.
///
/// Lines are decoded as UTF-8, invalid sequences replaced, and a trailing
/// `\r` dropped. A final line without a newline is still yielded.
pub fn lines<R>(reader: R) -> impl Stream<Item = io::Result<String>>
where
    R: AsyncRead + Unpin,
{
    SplitStream::new(tokio::io::AsyncBufReadExt::split(BufReader::new(reader), b'\n')).map(|chunk| {
        chunk.map(|mut bytes| {
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

/// Buffers lines from both streams of one process
#[derive(Debug, Default)]
pub struct OutputCollector {
    stdout: Vec<String>,
    stderr: Vec<String>,
    output: Vec<String>,
}

impl OutputCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a line at the moment it was received
    pub fn push(&mut self, source: OutputSource, line: String) {
        self.output.push(line.clone());
        match source {
            OutputSource::Stdout => self.stdout.push(line),
            OutputSource::Stderr => self.stderr.push(line),
        }
    }

    /// Number of lines recorded so far
    pub(crate) fn len(&self) -> usize {
        self.output.len()
    }

    /// Combine the buffered lines with the termination status
    pub fn into_result(self, exit: RemoteExit) -> ProcessResult {
        ProcessResult {
            code: exit.code,
            signal: exit.signal,
            stdout: self.stdout,
            stderr: self.stderr,
            output: self.output,
        }
    }
}
