//! The remote-execution saga: connect, stage, run, clean up, close

use crate::executor::RemoteExecutor;
use crate::output::ProcessResult;
use crate::staging::{ScriptStager, StagedScript};
use crate::{cleanup, Result, RunOptions, SshrunError};
use sshrun_ssh::{ConnectionSpec, Connector, Transport};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Observable phase of a saga
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaPhase {
    /// Not started
    Idle,
    /// Opening the session
    Connecting,
    /// Uploading the script
    Staging,
    /// Script is running
    Running,
    /// Removing the staged script
    CleaningUp,
    /// Closing the session
    Closing,
    /// Finished with a result
    Succeeded,
    /// Finished with an error
    Failed,
}

impl fmt::Display for SagaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Saga state. The session lives inside the states that may use it, so a
/// state that drops it without passing through `Closing` cannot be written.
enum SagaState {
    Idle,
    Connecting,
    Staging {
        transport: Box<dyn Transport>,
    },
    Running {
        transport: Box<dyn Transport>,
        staged: StagedScript,
    },
    CleaningUp {
        transport: Box<dyn Transport>,
        staged: StagedScript,
        pending: Result<ProcessResult>,
    },
    Closing {
        transport: Box<dyn Transport>,
        pending: Result<ProcessResult>,
    },
    Finished(Result<ProcessResult>),
}

impl SagaState {
    fn phase(&self) -> SagaPhase {
        match self {
            SagaState::Idle => SagaPhase::Idle,
            SagaState::Connecting => SagaPhase::Connecting,
            SagaState::Staging { .. } => SagaPhase::Staging,
            SagaState::Running { .. } => SagaPhase::Running,
            SagaState::CleaningUp { .. } => SagaPhase::CleaningUp,
            SagaState::Closing { .. } => SagaPhase::Closing,
            SagaState::Finished(Ok(_)) => SagaPhase::Succeeded,
            SagaState::Finished(Err(_)) => SagaPhase::Failed,
        }
    }
}

/// One "run a script remotely" unit of work
pub struct Saga<C> {
    id: Uuid,
    connector: C,
    spec: ConnectionSpec,
    script: PathBuf,
    options: RunOptions,
}

impl<C: Connector> Saga<C> {
    /// Prepare a saga running `script` on `spec` through `connector`
    pub fn new(connector: C, script: impl Into<PathBuf>, spec: ConnectionSpec, options: RunOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            connector,
            spec,
            script: script.into(),
            options,
        }
    }

    /// Unique id used in log output
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the saga to its single outcome
    pub async fn run(self) -> Result<ProcessResult> {
        let span = info_span!("saga", id = %self.id);
        async move {
            info!("Running {} on {}", self.script.display(), self.spec);

            let mut state = SagaState::Idle;
            loop {
                if let SagaState::Finished(outcome) = state {
                    match &outcome {
                        Ok(result) => info!("Saga finished, exit code {:?}", result.code),
                        Err(e) => warn!("Saga failed: {}", e),
                    }
                    return outcome;
                }

                let from = state.phase();
                state = self.step(state).await;
                debug!("{} -> {}", from, state.phase());
            }
        }
        .instrument(span)
        .await
    }

    async fn step(&self, state: SagaState) -> SagaState {
        match state {
            SagaState::Idle => match self.options.validate() {
                Ok(()) => SagaState::Connecting,
                Err(e) => SagaState::Finished(Err(e)),
            },

            SagaState::Connecting => match self.connector.connect(&self.spec).await {
                Ok(transport) => SagaState::Staging { transport },
                // Nothing was opened, so there is nothing to close
                Err(e) => SagaState::Finished(Err(SshrunError::from_connect(e))),
            },

            SagaState::Staging { mut transport } => {
                let staged = StagedScript::generate(&self.options.remote_dir);
                match ScriptStager::upload(transport.as_mut(), &self.script, staged.remote_path()).await {
                    Ok(_) => SagaState::Running { transport, staged },
                    Err(e) => SagaState::Closing {
                        transport,
                        pending: Err(e),
                    },
                }
            }

            SagaState::Running { mut transport, staged } => {
                let pending = self.execute(transport.as_mut(), &staged).await;
                if let Ok(result) = &pending {
                    if !result.success() {
                        info!("Script finished with code {:?}, signal {:?}", result.code, result.signal);
                    }
                }
                SagaState::CleaningUp {
                    transport,
                    staged,
                    pending,
                }
            }

            SagaState::CleaningUp {
                mut transport,
                staged,
                pending,
            } => {
                if let Err(e) = cleanup::remove(transport.as_mut(), staged.remote_path()).await {
                    warn!("Leaving {} behind: {}", staged.remote_path(), e);
                }
                SagaState::Closing { transport, pending }
            }

            SagaState::Closing { transport, pending } => {
                if let Err(e) = transport.close().await {
                    warn!("Closing the session failed: {}", e);
                }
                SagaState::Finished(pending)
            }

            finished @ SagaState::Finished(_) => finished,
        }
    }

    async fn execute(&self, transport: &mut dyn Transport, staged: &StagedScript) -> Result<ProcessResult> {
        let executor = RemoteExecutor::new(&self.options.args)
            .capture_output(self.options.capture_output)
            .progress(self.options.progress.as_deref());

        let run = executor.run(transport, staged.remote_path());
        match self.options.command_timeout {
            Some(duration) => tokio::time::timeout(duration, run)
                .await
                .unwrap_or(Err(SshrunError::Timeout { duration })),
            None => run.await,
        }
    }
}
