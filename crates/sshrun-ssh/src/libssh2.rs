//! In-process transport on top of libssh2

use async_trait::async_trait;
use crate::{
    AuthMethod, ConnectionInfo, ConnectionSpec, RemoteExit, RemoteFile, RemoteProcess, SshOptions,
    Transport, TransportError, TransportType,
};
use futures::FutureExt;
use secrecy::ExposeSecret;
use ssh2::{Channel, CheckResult, KnownHostFileKind, Session};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};

/// Capacity of the in-memory pipes between blocking libssh2 calls and async readers
const PIPE_CAPACITY: usize = 64 * 1024;

/// Back-off while a non-blocking channel has nothing to read
const IDLE_POLL: Duration = Duration::from_millis(10);

/// SSH transport using one libssh2 session for SFTP and exec.
///
/// libssh2 is blocking, so every call runs on the blocking thread pool.
/// Byte streams cross into async code through `tokio::io::duplex` pipes.
/// The session flips to non-blocking mode while an exec pump runs, so other
/// operations wait on `busy` until the pump has let go of it.
pub struct Ssh2Transport {
    session: Session,
    info: ConnectionInfo,
    busy: Arc<Mutex<()>>,
}

fn hold(busy: &Mutex<()>) -> MutexGuard<'_, ()> {
    busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tells the pump to stop once the process handle is gone
struct Abandon(Arc<AtomicBool>);

impl Drop for Abandon {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Ssh2Transport {
    /// Open a TCP connection, handshake, verify the host key if asked, and authenticate
    pub async fn connect(spec: &ConnectionSpec, options: &SshOptions) -> Result<Self, TransportError> {
        let method = spec.credentials.resolve()?;
        let username = match &spec.username {
            Some(user) => user.clone(),
            None => std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .map_err(|_| {
                    TransportError::Authentication(
                        "no username in target and none in the environment".to_string(),
                    )
                })?,
        };

        info!("Connecting to {}@{}:{}", username, spec.host, spec.port);

        let host = spec.host.clone();
        let port = spec.port;
        let options = options.clone();
        let user = username.clone();
        let session = tokio::task::spawn_blocking(move || {
            open_session(&host, port, &user, &method, &options)
        })
        .await
        .map_err(|e| TransportError::Connection(format!("connect task failed: {}", e)))??;

        info!("Successfully connected to {}@{}", username, spec.host);
        Ok(Self {
            session,
            info: ConnectionInfo {
                host: spec.host.clone(),
                port: spec.port,
                username: Some(username),
                transport_type: TransportType::SshLibssh2,
            },
            busy: Arc::new(Mutex::new(())),
        })
    }
}

fn open_session(
    host: &str,
    port: u16,
    username: &str,
    method: &AuthMethod,
    options: &SshOptions,
) -> Result<Session, TransportError> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Connection(format!("cannot resolve {}: {}", host, e)))?
        .collect();

    let mut last_error = None;
    let mut tcp = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, options.connect_timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => {
                debug!("Connecting to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    let tcp = tcp.ok_or_else(|| match last_error {
        Some(e) if e.kind() == io::ErrorKind::TimedOut => TransportError::Timeout,
        Some(e) => TransportError::Connection(format!("cannot connect to {}:{}: {}", host, port, e)),
        None => TransportError::Connection(format!("{} resolved to no addresses", host)),
    })?;

    let mut session = Session::new()
        .map_err(|e| TransportError::Connection(format!("Failed to create SSH session: {}", e)))?;
    session.set_timeout(options.connect_timeout.as_millis().min(u32::MAX as u128) as u32);
    session.set_tcp_stream(tcp);
    session.handshake().map_err(TransportError::from_ssh2_connect)?;

    if options.strict_host_key_checking {
        verify_host_key(&session, host, port)?;
    }

    authenticate(&session, username, method)?;

    // The connect timeout must not cap how long a script may run
    session.set_timeout(0);
    Ok(session)
}

fn verify_host_key(session: &Session, host: &str, port: u16) -> Result<(), TransportError> {
    let home = std::env::var_os("HOME").map(PathBuf::from).ok_or_else(|| {
        TransportError::Connection("strict host key checking needs $HOME/.ssh/known_hosts".to_string())
    })?;

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    known_hosts
        .read_file(&home.join(".ssh").join("known_hosts"), KnownHostFileKind::OpenSSH)
        .map_err(|e| TransportError::Connection(format!("cannot read known_hosts: {}", e)))?;

    let (key, _) = session
        .host_key()
        .ok_or_else(|| TransportError::Connection("server sent no host key".to_string()))?;

    match known_hosts.check_port(host, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(TransportError::Connection(format!(
            "host key for {} does not match known_hosts",
            host
        ))),
        CheckResult::NotFound => Err(TransportError::Connection(format!(
            "{} is not in known_hosts",
            host
        ))),
        CheckResult::Failure => Err(TransportError::Connection(format!(
            "checking the host key for {} failed",
            host
        ))),
    }
}

fn authenticate(session: &Session, username: &str, method: &AuthMethod) -> Result<(), TransportError> {
    let keys: Vec<&Path> = match method {
        AuthMethod::Identities(paths) => paths.iter().map(PathBuf::as_path).collect(),
        AuthMethod::Password(password) => {
            if let Err(e) = session.userauth_password(username, password.expose_secret()) {
                debug!("Password authentication failed: {}", e);
            }
            Vec::new()
        }
        AuthMethod::Ambient { agent, default_keys } => {
            if *agent {
                if let Err(e) = session.userauth_agent(username) {
                    debug!("Agent authentication failed: {}", e);
                }
            }
            default_keys.iter().map(PathBuf::as_path).collect()
        }
    };

    for key in keys {
        if session.authenticated() {
            break;
        }
        if let Err(e) = session.userauth_pubkey_file(username, None, key, None) {
            debug!("Key {} rejected: {}", key.display(), e);
        }
    }

    if session.authenticated() {
        Ok(())
    } else {
        Err(TransportError::Authentication(format!(
            "server rejected every credential for {}",
            username
        )))
    }
}

fn map_ssh_error(err: ssh2::Error) -> io::Error {
    err.into()
}

/// Write into an async pipe from a blocking thread; `None` once the reader is gone
fn forward(sink: &mut Option<SyncIoBridge<DuplexStream>>, bytes: &[u8]) {
    if let Some(writer) = sink.as_mut() {
        if writer.write_all(bytes).is_err() {
            // Nobody reads this stream any more; keep draining the channel
            sink.take();
        }
    }
}

/// Outcome of one non-blocking read from a channel stream
fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    match reader.read(buf) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        other => other,
    }
}

/// Copy channel output into the two pipes until the remote side closes
fn pump_channel(
    session: Session,
    mut channel: Channel,
    mut stdout: Option<SyncIoBridge<DuplexStream>>,
    mut stderr: Option<SyncIoBridge<DuplexStream>>,
    abandoned: &AtomicBool,
) -> Result<RemoteExit, TransportError> {
    session.set_blocking(false);
    let mut buf = vec![0u8; 16 * 1024];

    let pumped = loop {
        if abandoned.load(Ordering::SeqCst) {
            break Err(io::Error::new(io::ErrorKind::Interrupted, "process handle dropped"));
        }
        let mut progressed = false;

        match read_some(&mut channel, &mut buf) {
            Ok(0) => {}
            Ok(n) => {
                forward(&mut stdout, &buf[..n]);
                progressed = true;
            }
            Err(e) => break Err(e),
        }

        match read_some(&mut channel.stderr(), &mut buf) {
            Ok(0) => {}
            Ok(n) => {
                forward(&mut stderr, &buf[..n]);
                progressed = true;
            }
            Err(e) => break Err(e),
        }

        if channel.eof() {
            break Ok(());
        }
        if !progressed {
            std::thread::sleep(IDLE_POLL);
        }
    };

    // Readers see end-of-stream before the exit status is collected
    drop(stdout);
    drop(stderr);
    session.set_blocking(true);

    if let Err(e) = &pumped {
        if e.kind() == io::ErrorKind::Interrupted {
            debug!("Abandoning remote process");
            let _ = channel.close();
            return Err(TransportError::Exec(e.to_string()));
        }
    }
    pumped.map_err(|e| TransportError::Exec(format!("reading remote output failed: {}", e)))?;
    channel
        .wait_close()
        .map_err(|e| TransportError::Exec(format!("waiting for remote close failed: {}", e)))?;

    let signal = channel
        .exit_signal()
        .ok()
        .and_then(|s| s.exit_signal)
        .filter(|s| !s.is_empty());
    if let Some(signal) = signal {
        return Ok(RemoteExit::signal(signal));
    }

    let code = channel
        .exit_status()
        .map_err(|e| TransportError::Exec(format!("no exit status: {}", e)))?;
    Ok(RemoteExit::code(code))
}

#[async_trait]
impl Transport for Ssh2Transport {
    async fn create_file(&mut self, remote_path: &str) -> Result<RemoteFile, TransportError> {
        debug!("Opening SFTP write stream to {}", remote_path);

        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let mut reader = SyncIoBridge::new(reader);
        let session = self.session.clone();
        let path = remote_path.to_string();
        let busy = self.busy.clone();

        let task = tokio::task::spawn_blocking(move || -> Result<u64, TransportError> {
            let _busy = hold(&busy);
            let transfer_error = |e: io::Error| TransportError::Transfer(format!("{}: {}", path, e));
            let sftp = session.sftp().map_err(|e| transfer_error(map_ssh_error(e)))?;
            let mut file = sftp
                .create(Path::new(&path))
                .map_err(|e| transfer_error(map_ssh_error(e)))?;
            let copied = io::copy(&mut reader, &mut file).map_err(transfer_error)?;
            file.flush().map_err(transfer_error)?;
            Ok(copied)
        });

        let completion = async move {
            let copied = task
                .await
                .map_err(|e| TransportError::Transfer(format!("SFTP task failed: {}", e)))??;
            debug!("SFTP wrote {} bytes", copied);
            Ok::<(), TransportError>(())
        }
        .boxed();

        Ok(RemoteFile::new(writer, completion))
    }

    async fn exec(&mut self, command: &str) -> Result<RemoteProcess, TransportError> {
        debug!("Executing remote command: {}", command);

        let session = self.session.clone();
        let cmd = command.to_string();
        let busy = self.busy.clone();
        let channel = tokio::task::spawn_blocking(move || -> Result<Channel, TransportError> {
            let _busy = hold(&busy);
            let mut channel = session
                .channel_session()
                .map_err(|e| TransportError::Exec(format!("cannot open channel: {}", e)))?;
            channel
                .exec(&cmd)
                .map_err(|e| TransportError::Exec(format!("exec request refused: {}", e)))?;
            Ok(channel)
        })
        .await
        .map_err(|e| TransportError::Exec(format!("exec task failed: {}", e)))??;

        let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let stdout_writer = SyncIoBridge::new(stdout_writer);
        let stderr_writer = SyncIoBridge::new(stderr_writer);

        let session = self.session.clone();
        let busy = self.busy.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let flag = abandoned.clone();
        let pump = tokio::task::spawn_blocking(move || {
            let _busy = hold(&busy);
            pump_channel(session, channel, Some(stdout_writer), Some(stderr_writer), &flag)
        });

        let guard = Abandon(abandoned);
        let exit = async move {
            let _guard = guard;
            pump.await
                .map_err(|e| TransportError::Exec(format!("output task failed: {}", e)))?
        }
        .boxed();

        Ok(RemoteProcess::new(stdout_reader, stderr_reader, exit))
    }

    async fn remove(&mut self, remote_path: &str) -> Result<(), TransportError> {
        debug!("SFTP unlink {}", remote_path);

        let session = self.session.clone();
        let path = remote_path.to_string();
        let busy = self.busy.clone();
        tokio::task::spawn_blocking(move || {
            let _busy = hold(&busy);
            let sftp = session
                .sftp()
                .map_err(|e| TransportError::Remove(format!("{}: {}", path, e)))?;
            sftp.unlink(Path::new(&path))
                .map_err(|e| TransportError::Remove(format!("{}: {}", path, e)))
        })
        .await
        .map_err(|e| TransportError::Remove(format!("unlink task failed: {}", e)))?
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        debug!("Disconnecting from {}", self.info.host);

        let session = self.session.clone();
        let busy = self.busy.clone();
        tokio::task::spawn_blocking(move || {
            let _busy = hold(&busy);
            session.disconnect(None, "sshrun done", None)
        })
            .await
            .map_err(|e| TransportError::Connection(format!("disconnect task failed: {}", e)))?
            .map_err(|e| {
                warn!("SSH disconnect failed: {}", e);
                TransportError::Connection(e.to_string())
            })
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.info.clone()
    }
}
