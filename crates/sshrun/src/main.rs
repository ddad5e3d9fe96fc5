//! sshrun binary
//!
//! Upload a local script to a remote host, run it and remove it again.
//!
//! ```bash
//! sshrun -i ~/.ssh/id_ed25519 deploy.sh admin@10.0.0.5 -- --verbose "two words"
//! RUN_PW=secret sshrun --password-env RUN_PW --transport libssh2 check.sh ops@db1:2222
//! sshrun --transport local --json check.sh localhost
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sshrun::ssh::TransportKind;
use sshrun::{ConsoleTee, RunOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Transport selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportArg {
    /// External ssh binary
    Subprocess,
    /// In-process libssh2 session
    Libssh2,
    /// This machine
    Local,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Subprocess => TransportKind::Subprocess,
            TransportArg::Libssh2 => TransportKind::Libssh2,
            TransportArg::Local => TransportKind::Local,
        }
    }
}

/// Run a local shell script on a remote host over ssh
#[derive(Parser, Debug)]
#[command(name = "sshrun")]
#[command(version)]
#[command(about = "Run a local shell script on a remote host over ssh", long_about = None)]
struct Cli {
    /// Private key to authenticate with (repeatable)
    #[arg(short = 'i', long = "identity", value_name = "KEY")]
    identities: Vec<PathBuf>,

    /// Read the password from this environment variable
    #[arg(long, value_name = "VAR")]
    password_env: Option<String>,

    /// Remote staging directory
    #[arg(long, default_value = sshrun::DEFAULT_REMOTE_DIR, value_name = "DIR")]
    remote_dir: String,

    /// Transport implementation
    #[arg(long, value_enum, default_value = "subprocess")]
    transport: TransportArg,

    /// Copy remote output to the console while the script runs
    #[arg(long, conflicts_with = "json")]
    stream: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = 30, value_name = "SECS")]
    connect_timeout: u64,

    /// Give up on the script after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Local script to run
    script: PathBuf,

    /// Target as [user@]host[:port]
    host: String,

    /// Arguments passed to the script
    #[arg(last = true)]
    args: Vec<String>,
}

impl Cli {
    fn run_options(&self) -> Result<RunOptions> {
        let mut options = RunOptions::new()
            .with_args(self.args.iter().cloned())
            .with_remote_dir(self.remote_dir.clone())
            .with_transport(self.transport.into())
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_capture_output(!self.stream);

        for identity in &self.identities {
            options = options.with_identity(identity.clone());
        }
        if let Some(var) = &self.password_env {
            let password = std::env::var(var)
                .with_context(|| format!("password variable {} is not set", var))?;
            options = options.with_password(password);
        }
        if let Some(secs) = self.timeout {
            options = options.with_command_timeout(Duration::from_secs(secs));
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut options = cli.run_options()?;
    debug!("Options: {:?}", options);

    let tee = Arc::new(ConsoleTee::new());
    if cli.stream {
        options = options.with_progress(tee.clone());
    }

    let outcome = sshrun::run(&cli.script, &cli.host, options).await;
    tee.finish().await;

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            error!("{}", e);
            eprintln!("sshrun: {}", e);
            std::process::exit(1);
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !cli.stream {
        for line in &result.output {
            println!("{}", line);
        }
    }

    if let Some(signal) = &result.signal {
        eprintln!("sshrun: script killed by signal {}", signal);
    }
    std::process::exit(result.code.unwrap_or(1));
}
