//! Running the staged script

use crate::output::{lines, OutputCollector, OutputSource, ProcessResult};
use crate::{ProgressSink, Result, SshrunError};
use sshrun_ssh::{shell_quote, OutputStream, Transport};
use tokio_stream::StreamExt;
use tracing::{debug, info};

/// Shell used to interpret the staged script
pub const REMOTE_SHELL: &str = "sh";

/// Build the remote command line: `sh <path> <arg>...`, each token shell-escaped
pub fn build_command(remote_path: &str, args: &[String]) -> String {
    let mut command = format!("{} {}", REMOTE_SHELL, shell_quote(remote_path));
    for arg in args {
        command.push(' ');
        command.push_str(&shell_quote(arg));
    }
    command
}

/// Starts the staged script and waits for it to terminate
pub struct RemoteExecutor<'a> {
    args: &'a [String],
    capture_output: bool,
    progress: Option<&'a dyn ProgressSink>,
}

impl<'a> RemoteExecutor<'a> {
    /// Executor passing `args` to the script
    pub fn new(args: &'a [String]) -> Self {
        Self {
            args,
            capture_output: true,
            progress: None,
        }
    }

    /// Enable/disable output capture
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// Hand the live process to `sink` before output is consumed
    pub fn progress(mut self, sink: Option<&'a dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Run the script at `remote_path`.
    ///
    /// A non-zero exit is a normal result. Only failing to start the command
    /// (`ExecutionStart`) or losing its output or exit status (`Execution`)
    /// is an error.
    pub async fn run(&self, transport: &mut dyn Transport, remote_path: &str) -> Result<ProcessResult> {
        let command = build_command(remote_path, self.args);
        info!("Executing {}", command);

        let mut process = transport
            .exec(&command)
            .await
            .map_err(SshrunError::from_exec_start)?;

        if let Some(sink) = self.progress {
            debug!("Handing process to progress sink");
            sink.attach(&mut process);
        }

        let stdout = process.stdout.take();
        let stderr = process.stderr.take();

        let collector = if self.capture_output {
            collect(stdout, stderr).await?
        } else {
            drain(stdout, stderr).await?;
            OutputCollector::new()
        };

        let exit = process.wait().await.map_err(SshrunError::from_execution)?;
        debug!("Remote process finished: {:?}, {} lines captured", exit, collector.len());
        Ok(collector.into_result(exit))
    }
}

/// Read both streams concurrently, recording lines in arrival order
async fn collect(stdout: Option<OutputStream>, stderr: Option<OutputStream>) -> Result<OutputCollector> {
    let stdout = lines(stdout.unwrap_or_else(empty_stream)).map(|l| l.map(|l| (OutputSource::Stdout, l)));
    let stderr = lines(stderr.unwrap_or_else(empty_stream)).map(|l| l.map(|l| (OutputSource::Stderr, l)));

    let merged = stdout.merge(stderr);
    tokio::pin!(merged);

    let mut collector = OutputCollector::new();
    while let Some(item) = merged.next().await {
        let (source, line) = item
            .map_err(|e| SshrunError::Execution(format!("reading remote output failed: {}", e)))?;
        collector.push(source, line);
    }
    Ok(collector)
}

/// Stand-in for a stream the progress sink took
fn empty_stream() -> OutputStream {
    Box::new(tokio::io::empty())
}

/// Consume both streams concurrently and throw the bytes away
async fn drain(stdout: Option<OutputStream>, stderr: Option<OutputStream>) -> Result<()> {
    async fn discard(stream: Option<OutputStream>) -> std::io::Result<u64> {
        match stream {
            Some(mut s) => tokio::io::copy(&mut s, &mut tokio::io::sink()).await,
            None => Ok(0),
        }
    }

    let (out, err) = tokio::join!(discard(stdout), discard(stderr));
    out.and(err)
        .map(|_| ())
        .map_err(|e| SshrunError::Execution(format!("reading remote output failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use sshrun_ssh::{RemoteExit, RemoteProcess};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_build_command_quotes_every_token() {
        let args = vec!["plain".to_string(), "two words".to_string(), "it's".to_string()];
        assert_eq!(
            build_command("/tmp/sshrun-ab.sh", &args),
            "sh /tmp/sshrun-ab.sh plain 'two words' 'it'\\''s'"
        );
        assert_eq!(build_command("/tmp/x.sh", &[]), "sh /tmp/x.sh");
    }

    #[tokio::test]
    async fn test_collect_keeps_streams_apart() {
        let stdout: OutputStream = Box::new(&b"a\nb\n"[..]);
        let stderr: OutputStream = Box::new(&b"x\n"[..]);
        let collector = collect(Some(stdout), Some(stderr)).await.unwrap();
        let result = collector.into_result(RemoteExit::code(0));

        assert_eq!(result.stdout, vec!["a", "b"]);
        assert_eq!(result.stderr, vec!["x"]);
        assert_eq!(result.output.len(), 3);
    }

    #[tokio::test]
    async fn test_collect_with_missing_stream() {
        let stderr: OutputStream = Box::new(&b"only err"[..]);
        let collector = collect(None, Some(stderr)).await.unwrap();
        let result = collector.into_result(RemoteExit::code(1));
        assert!(result.stdout.is_empty());
        assert_eq!(result.stderr, vec!["only err"]);
    }

    #[tokio::test]
    async fn test_drain_consumes_everything() {
        let big = vec![b'z'; 256 * 1024];
        let (mut writer, reader) = tokio::io::duplex(1024);
        let feeder = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            writer.write_all(&big).await
        });
        drain(Some(Box::new(reader)), None).await.unwrap();
        feeder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sink_sees_process_before_consumption() {
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();
        let sink = move |p: &mut RemoteProcess| {
            flag.store(p.stdout.is_some() && p.stderr.is_some(), Ordering::SeqCst);
            p.stdout.take();
        };

        let exit = async { Ok::<_, sshrun_ssh::TransportError>(RemoteExit::code(0)) }.boxed();
        let process = RemoteProcess::new(&b"live\n"[..], &b"warn\n"[..], exit);
        let mut transport = OneShotTransport(Some(process));
        let args = Vec::new();
        let result = RemoteExecutor::new(&args)
            .progress(Some(&sink))
            .run(&mut transport, "/tmp/s.sh")
            .await
            .unwrap();

        assert!(seen.load(Ordering::SeqCst));
        assert!(result.stdout.is_empty());
        assert_eq!(result.stderr, vec!["warn"]);
        assert_eq!(result.output, vec!["warn"]);
    }

    #[tokio::test]
    async fn test_no_capture_returns_only_exit() {
        let exit = async { Ok::<_, sshrun_ssh::TransportError>(RemoteExit::code(7)) }.boxed();
        let process = RemoteProcess::new(&b"ignored\n"[..], &b""[..], exit);
        let mut transport = OneShotTransport(Some(process));
        let args = vec!["a".to_string()];
        let result = RemoteExecutor::new(&args)
            .capture_output(false)
            .run(&mut transport, "/tmp/s.sh")
            .await
            .unwrap();

        assert_eq!(result.code, Some(7));
        assert!(result.output.is_empty());
    }

    /// Transport whose only job is to hand out one prepared process
    struct OneShotTransport(Option<RemoteProcess>);

    #[async_trait::async_trait]
    impl Transport for OneShotTransport {
        async fn create_file(&mut self, _: &str) -> std::result::Result<sshrun_ssh::RemoteFile, sshrun_ssh::TransportError> {
            unimplemented!()
        }

        async fn exec(&mut self, _: &str) -> std::result::Result<RemoteProcess, sshrun_ssh::TransportError> {
            Ok(self.0.take().unwrap())
        }

        async fn remove(&mut self, _: &str) -> std::result::Result<(), sshrun_ssh::TransportError> {
            unimplemented!()
        }

        async fn close(self: Box<Self>) -> std::result::Result<(), sshrun_ssh::TransportError> {
            Ok(())
        }

        fn connection_info(&self) -> sshrun_ssh::ConnectionInfo {
            sshrun_ssh::ConnectionInfo {
                host: "test".into(),
                port: 0,
                username: None,
                transport_type: sshrun_ssh::TransportType::Local,
            }
        }
    }
}
