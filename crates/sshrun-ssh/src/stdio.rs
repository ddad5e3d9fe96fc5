//! Transport driving the external `ssh` binary

use async_trait::async_trait;
use crate::shell::shell_quote;
use crate::{
    AuthMethod, ConnectionInfo, ConnectionSpec, RemoteExit, RemoteFile, RemoteProcess, SshOptions,
    Transport, TransportError, TransportType,
};
use futures::FutureExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Exit status OpenSSH uses for its own failures
const SSH_ERROR_STATUS: i32 = 255;

/// Stderr fragments OpenSSH prints when the server refuses every credential
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "Permission denied",
    "Too many authentication failures",
    "No more authentication methods",
];

/// SSH transport built on `ssh` subprocesses sharing one control master.
///
/// `connect` authenticates once and leaves a master process holding the
/// session open on a private control socket. Every later step is a
/// short-lived `ssh` client multiplexed over that socket, and `close` asks
/// the master to exit.
pub struct StdioTransport {
    /// Target host
    spec: ConnectionSpec,
    /// Identity files passed with `-i`
    identities: Vec<PathBuf>,
    /// Transport options
    options: SshOptions,
    /// Control socket of the master connection
    control_path: PathBuf,
    /// Whether the master still has to be stopped
    master_running: bool,
}

impl StdioTransport {
    /// Authenticate against `spec` and start the control master
    pub async fn connect(spec: &ConnectionSpec, options: &SshOptions) -> Result<Self, TransportError> {
        let identities = match spec.credentials.resolve()? {
            AuthMethod::Identities(paths) => paths,
            AuthMethod::Password(_) => {
                return Err(TransportError::Authentication(
                    "the ssh subprocess transport runs in batch mode and cannot use a password; \
                     use an identity or the libssh2 transport"
                        .to_string(),
                ))
            }
            AuthMethod::Ambient { .. } => Vec::new(),
        };

        let mut transport = Self::new(spec.clone(), identities, options.clone());
        transport.start_master().await?;
        Ok(transport)
    }

    fn new(spec: ConnectionSpec, identities: Vec<PathBuf>, options: SshOptions) -> Self {
        let name = hex::encode(rand::random::<[u8; 8]>());
        Self {
            spec,
            identities,
            options,
            control_path: std::env::temp_dir().join(format!("sshrun-{}.ctl", name)),
            master_running: false,
        }
    }

    /// Build SSH command arguments shared by the master and its clients
    fn build_ssh_args(&self) -> Vec<String> {
        let host_key_checking = if self.options.strict_host_key_checking { "yes" } else { "no" };
        let mut args = vec![
            "-o".to_string(), "BatchMode=yes".to_string(),
            "-o".to_string(), format!("StrictHostKeyChecking={}", host_key_checking),
            "-o".to_string(), format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
            "-p".to_string(), self.spec.port.to_string(),
            "-S".to_string(), self.control_path.to_string_lossy().to_string(),
        ];

        for identity in &self.identities {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }

        // Add custom options
        for (key, value) in &self.options.extra {
            args.push("-o".to_string());
            args.push(format!("{}={}", key, value));
        }

        args
    }

    /// `ssh` client command that runs `remote_command` over the master
    fn client_command(&self, remote_command: &str) -> Command {
        let mut args = self.build_ssh_args();
        args.push("-o".to_string());
        args.push("ControlMaster=no".to_string());
        args.push(self.spec.destination());
        args.push(remote_command.to_string());

        debug!("ssh {}", args.join(" "));

        let mut command = Command::new(&self.options.program);
        command.args(&args).kill_on_drop(true);
        command
    }

    /// Arguments for a `-O <operation>` request to the control master
    fn control_args(&self, operation: &str) -> Vec<String> {
        let mut args = self.build_ssh_args();
        args.extend(["-O".to_string(), operation.to_string(), self.spec.destination()]);
        args
    }

    /// `ssh -O <operation>` command talking to the control master
    fn control_command(&self, operation: &str) -> Command {
        let args = self.control_args(operation);
        debug!("ssh {}", args.join(" "));

        let mut command = Command::new(&self.options.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        command
    }

    /// Ask the master to exit. Attempted at most once per transport.
    async fn stop_master(&mut self) -> Result<(), TransportError> {
        if !self.master_running {
            return Ok(());
        }
        // Whatever happens next, the master is no longer ours to stop
        self.master_running = false;

        debug!("Closing SSH master for {}", self.spec);
        let output = self
            .control_command("exit")
            .output()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to execute SSH: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::Connection(format!(
                "stopping ssh master failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn start_master(&mut self) -> Result<(), TransportError> {
        let mut args = self.build_ssh_args();
        args.extend(
            ["-M", "-N", "-f", "-o", "ControlPersist=yes"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(self.spec.destination());

        info!("Connecting to {}", self.spec);
        debug!("ssh {}", args.join(" "));

        // With -f the master detaches onto /dev/null once authenticated, so
        // collecting output returns as soon as the session is up.
        let output = Command::new(&self.options.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to execute SSH: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_master_failure(output.status, &stderr));
        }

        self.master_running = true;
        info!("Successfully connected to {}", self.spec);
        Ok(())
    }

    /// Run a short remote command to completion
    async fn run_to_completion(&self, remote_command: &str) -> Result<(ExitStatus, String), TransportError> {
        let output = self
            .client_command(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok((output.status, String::from_utf8_lossy(&output.stderr).trim().to_string()))
    }
}

/// Decide whether a failed master start was an authentication problem
pub(crate) fn classify_master_failure(status: ExitStatus, stderr: &str) -> TransportError {
    let message = if stderr.trim().is_empty() {
        format!("ssh exited with {}", status)
    } else {
        stderr.trim().to_string()
    };

    if status.code() == Some(SSH_ERROR_STATUS)
        && AUTH_FAILURE_MARKERS.iter().any(|marker| stderr.contains(marker))
    {
        TransportError::Authentication(message)
    } else {
        TransportError::Connection(message)
    }
}

/// Whether `ssh -O check` still reaches a live master
async fn master_alive(mut check: Command) -> bool {
    match check.output().await {
        Ok(output) => output.status.success(),
        Err(e) => {
            warn!("ssh -O check failed to start: {}", e);
            false
        }
    }
}

/// Drain a child's stderr in the background, logging each line
fn collect_stderr(stderr: ChildStderr) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut collected = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("remote stderr: {}", line);
            collected.push(line);
        }
        collected
    })
}

#[async_trait]
impl Transport for StdioTransport {
    async fn create_file(&mut self, remote_path: &str) -> Result<RemoteFile, TransportError> {
        let mut child = self
            .client_command(&format!("cat > {}", shell_quote(remote_path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Transfer(format!("Failed to start ssh: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Transfer("stdin not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Transfer("stderr not captured".to_string()))?;
        let errors = collect_stderr(stderr);

        let path = remote_path.to_string();
        let completion = async move {
            let status = child.wait().await?;
            let errors = errors.await.unwrap_or_default();
            if status.success() {
                Ok::<(), TransportError>(())
            } else {
                Err(TransportError::Transfer(format!(
                    "writing {} failed ({}): {}",
                    path,
                    status,
                    errors.join("; ")
                )))
            }
        }
        .boxed();

        Ok(RemoteFile::new(stdin, completion))
    }

    async fn exec(&mut self, command: &str) -> Result<RemoteProcess, TransportError> {
        let mut child = self
            .client_command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Exec(format!("Failed to start ssh: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Exec("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Exec("stderr not captured".to_string()))?;

        // ssh reports its own failures as 255, which a script may also exit
        // with; only a master that no longer answers means the session died
        let check = self.control_command("check");
        let exit = async move {
            let status = child.wait().await?;
            if status.code() == Some(SSH_ERROR_STATUS) && !master_alive(check).await {
                return Err(TransportError::Exec(
                    "ssh session was lost while the command was running".to_string(),
                ));
            }
            Ok::<_, TransportError>(RemoteExit::from_status(status))
        }
        .boxed();

        Ok(RemoteProcess::new(stdout, stderr, exit))
    }

    async fn remove(&mut self, remote_path: &str) -> Result<(), TransportError> {
        let (status, stderr) = self
            .run_to_completion(&format!("rm -- {}", shell_quote(remote_path)))
            .await
            .map_err(|e| TransportError::Remove(e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(TransportError::Remove(format!("rm {} failed ({}): {}", remote_path, status, stderr)))
        }
    }

    async fn close(mut self: Box<Self>) -> Result<(), TransportError> {
        self.stop_master().await
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.spec.host.clone(),
            port: self.spec.port,
            username: self.spec.username.clone(),
            transport_type: TransportType::SshSubprocess,
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if !self.master_running {
            return;
        }

        warn!("SSH master for {} dropped without close, stopping it", self.spec);
        let _ = std::process::Command::new(&self.options.program)
            .args(self.control_args("exit"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn transport(target: &str, identities: Vec<PathBuf>) -> StdioTransport {
        let mut extra = BTreeMap::new();
        extra.insert("ServerAliveInterval".to_string(), "60".to_string());
        let options = SshOptions {
            connect_timeout: Duration::from_secs(10),
            strict_host_key_checking: false,
            extra,
            program: PathBuf::from("ssh"),
        };
        StdioTransport::new(ConnectionSpec::parse(target).unwrap(), identities, options)
    }

    #[test]
    fn test_ssh_args_building() {
        let transport = transport(
            "testuser@example.com:2222",
            vec![PathBuf::from("/path/to/key"), PathBuf::from("/path/to/other")],
        );
        let args = transport.build_ssh_args();

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"/path/to/key".to_string()));
        assert!(args.contains(&"/path/to/other".to_string()));
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 2);
        assert!(args.contains(&"ServerAliveInterval=60".to_string()));
        assert!(args.contains(&transport.control_path.to_string_lossy().to_string()));
    }

    #[test]
    fn test_control_paths_are_private_per_transport() {
        let a = transport("host", vec![]);
        let b = transport("host", vec![]);
        assert_ne!(a.control_path, b.control_path);
        assert!(a
            .control_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("sshrun-"));
    }

    #[test]
    fn test_connection_info() {
        let transport = transport("deploy@test.example.com:2022", vec![]);
        let info = transport.connection_info();

        assert_eq!(info.host, "test.example.com");
        assert_eq!(info.port, 2022);
        assert_eq!(info.username.as_deref(), Some("deploy"));
        assert_eq!(info.transport_type, TransportType::SshSubprocess);
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_master_failure() {
        use std::os::unix::process::ExitStatusExt;

        let ssh_failed = ExitStatus::from_raw(SSH_ERROR_STATUS << 8);
        let err = classify_master_failure(ssh_failed, "user@h: Permission denied (publickey).\n");
        assert!(matches!(err, TransportError::Authentication(_)));

        let err = classify_master_failure(ssh_failed, "ssh: Could not resolve hostname h: Name or service not known\n");
        assert!(matches!(err, TransportError::Connection(_)));

        let err = classify_master_failure(ExitStatus::from_raw(1 << 8), "");
        match err {
            TransportError::Connection(msg) => assert!(msg.contains("exit")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_password_only_is_rejected_before_spawning() {
        use crate::Credentials;
        use secrecy::SecretString;

        let spec = ConnectionSpec::parse("h").unwrap().with_credentials(Credentials {
            identities: vec![],
            password: Some(SecretString::new("pw".to_string())),
        });
        let result = StdioTransport::connect(&spec, &SshOptions::default()).await;
        assert!(matches!(result, Err(TransportError::Authentication(_))));
    }

    #[cfg(unix)]
    mod fake_ssh {
        use super::*;
        use crate::Credentials;
        use std::os::unix::fs::PermissionsExt;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        #[derive(Debug, Default, Clone, Copy)]
        struct Behaviour {
            fail_cat: bool,
            fail_rm: bool,
            fail_exit: bool,
            master_gone: bool,
        }

        /// Stand-in `ssh` binary that logs its argv, answers control requests
        /// and runs client commands through the local `sh`
        struct FakeSsh {
            dir: tempfile::TempDir,
            log: PathBuf,
            key: PathBuf,
            program: PathBuf,
        }

        impl FakeSsh {
            fn new(behaviour: Behaviour) -> Self {
                let dir = tempfile::tempdir().unwrap();
                let log = dir.path().join("argv.log");
                let key = dir.path().join("id_test");
                std::fs::write(&key, "test key").unwrap();

                let status = |fail: bool, code: i32| if fail { code } else { 0 };
                let script = format!(
                    r#"#!/bin/sh
echo "$*" >> '{log}'
for last; do :; done
case " $* " in
  *" -O exit "*) exit {exit_status} ;;
  *" -O check "*) exit {check_status} ;;
  *" -M "*) exit 0 ;;
esac
case "$last" in
  cat\ *) if [ {fail_cat} = 1 ]; then cat >/dev/null; echo 'cat: Permission denied' >&2; exit 1; fi ;;
  rm\ *) if [ {fail_rm} = 1 ]; then echo 'rm: Read-only file system' >&2; exit 1; fi ;;
esac
exec sh -c "$last"
"#,
                    log = log.display(),
                    exit_status = status(behaviour.fail_exit, 255),
                    check_status = status(behaviour.master_gone, 255),
                    fail_cat = status(behaviour.fail_cat, 1),
                    fail_rm = status(behaviour.fail_rm, 1),
                );

                let program = dir.path().join("ssh");
                std::fs::write(&program, script).unwrap();
                std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

                Self { dir, log, key, program }
            }

            fn options(&self) -> SshOptions {
                SshOptions {
                    program: self.program.clone(),
                    ..Default::default()
                }
            }

            fn spec(&self) -> ConnectionSpec {
                ConnectionSpec::parse("tester@fake.invalid")
                    .unwrap()
                    .with_credentials(Credentials {
                        identities: vec![self.key.clone()],
                        password: None,
                    })
            }

            async fn connect(&self) -> StdioTransport {
                StdioTransport::connect(&self.spec(), &self.options()).await.unwrap()
            }

            fn remote(&self, name: &str) -> String {
                self.dir.path().join(name).to_str().unwrap().to_string()
            }

            /// How many logged invocations contain `needle`
            fn count(&self, needle: &str) -> usize {
                std::fs::read_to_string(&self.log)
                    .unwrap_or_default()
                    .lines()
                    .filter(|line| format!(" {} ", line).contains(needle))
                    .count()
            }
        }

        #[tokio::test]
        async fn test_session_over_control_master() {
            let fake = FakeSsh::new(Behaviour::default());
            let mut transport = fake.connect().await;
            assert_eq!(fake.count(" -M "), 1);

            let remote = fake.remote("staged.sh");
            let mut file = transport.create_file(&remote).await.unwrap();
            file.write_all(b"echo out; echo err >&2; exit 4\n").await.unwrap();
            file.finish().await.unwrap();
            assert_eq!(
                std::fs::read_to_string(&remote).unwrap(),
                "echo out; echo err >&2; exit 4\n"
            );

            let mut process = transport.exec(&format!("sh {}", shell_quote(&remote))).await.unwrap();
            let mut out = String::new();
            process.stdout.take().unwrap().read_to_string(&mut out).await.unwrap();
            let mut err = String::new();
            process.stderr.take().unwrap().read_to_string(&mut err).await.unwrap();
            assert_eq!(process.wait().await.unwrap(), RemoteExit::code(4));
            assert_eq!(out, "out\n");
            assert_eq!(err, "err\n");

            transport.remove(&remote).await.unwrap();
            assert!(!std::path::Path::new(&remote).exists());

            Box::new(transport).close().await.unwrap();
            assert_eq!(fake.count(" -M "), 1);
            assert_eq!(fake.count(" -O exit "), 1);
            assert!(fake.count("ControlMaster=no") >= 3);
        }

        #[tokio::test]
        async fn test_remote_write_failure_is_a_transfer_error() {
            let fake = FakeSsh::new(Behaviour {
                fail_cat: true,
                ..Default::default()
            });
            let mut transport = fake.connect().await;

            let mut file = transport.create_file(&fake.remote("staged.sh")).await.unwrap();
            let _ = file.write_all(b"echo never\n").await;
            match file.finish().await {
                Err(TransportError::Transfer(msg)) => assert!(msg.contains("Permission denied"), "{}", msg),
                other => panic!("expected a transfer error, got {:?}", other),
            }

            Box::new(transport).close().await.unwrap();
        }

        #[tokio::test]
        async fn test_failed_rm_is_a_remove_error() {
            let fake = FakeSsh::new(Behaviour {
                fail_rm: true,
                ..Default::default()
            });
            let mut transport = fake.connect().await;

            let result = transport.remove(&fake.remote("staged.sh")).await;
            match result {
                Err(TransportError::Remove(msg)) => assert!(msg.contains("Read-only"), "{}", msg),
                other => panic!("expected a remove error, got {:?}", other),
            }

            Box::new(transport).close().await.unwrap();
        }

        #[tokio::test]
        async fn test_failed_close_is_not_repeated_on_drop() {
            let fake = FakeSsh::new(Behaviour {
                fail_exit: true,
                ..Default::default()
            });
            let transport = fake.connect().await;

            let result = Box::new(transport).close().await;
            assert!(matches!(result, Err(TransportError::Connection(_))));
            assert_eq!(fake.count(" -O exit "), 1);
        }

        #[tokio::test]
        async fn test_unstartable_close_clears_the_master() {
            let fake = FakeSsh::new(Behaviour::default());
            let mut transport = fake.connect().await;
            transport.options.program = fake.dir.path().join("no-such-ssh");

            assert!(transport.stop_master().await.is_err());
            assert!(!transport.master_running);
            assert!(transport.stop_master().await.is_ok());
        }

        #[tokio::test]
        async fn test_script_exiting_255_is_a_result() {
            let fake = FakeSsh::new(Behaviour::default());
            let mut transport = fake.connect().await;

            let process = transport.exec("exit 255").await.unwrap();
            assert_eq!(process.wait().await.unwrap(), RemoteExit::code(255));
            assert_eq!(fake.count(" -O check "), 1);

            Box::new(transport).close().await.unwrap();
        }

        #[tokio::test]
        async fn test_lost_session_is_an_exec_error() {
            let fake = FakeSsh::new(Behaviour {
                master_gone: true,
                ..Default::default()
            });
            let mut transport = fake.connect().await;

            let process = transport.exec("exit 255").await.unwrap();
            assert!(matches!(process.wait().await, Err(TransportError::Exec(_))));

            Box::new(transport).close().await.unwrap();
        }
    }
}
