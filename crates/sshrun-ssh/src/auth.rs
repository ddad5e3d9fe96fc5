//! Credential resolution

use crate::TransportError;
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Key files tried for ambient authentication, relative to `~/.ssh`
pub const DEFAULT_IDENTITIES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Credentials supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Private key paths, tried in order
    pub identities: Vec<PathBuf>,
    /// Password, used only when no identity is usable
    pub password: Option<SecretString>,
}

/// The single authentication method a session will attempt
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Explicit private keys that exist on disk
    Identities(Vec<PathBuf>),
    /// Explicit password
    Password(SecretString),
    /// Whatever the environment offers: ssh-agent and default keys
    Ambient {
        /// Whether `SSH_AUTH_SOCK` is set
        agent: bool,
        /// Default key files found under `~/.ssh`
        default_keys: Vec<PathBuf>,
    },
}

impl Credentials {
    /// Resolve against the current process environment
    pub fn resolve(&self) -> Result<AuthMethod, TransportError> {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let agent = std::env::var_os("SSH_AUTH_SOCK").is_some_and(|s| !s.is_empty());
        self.resolve_with(home.as_deref(), agent)
    }

    /// Resolve against an explicit home directory and agent availability.
    ///
    /// Explicit identities win over the password, the password wins over
    /// ambient methods. Nothing resolvable is an authentication failure.
    pub fn resolve_with(&self, home: Option<&Path>, agent: bool) -> Result<AuthMethod, TransportError> {
        let usable: Vec<PathBuf> = self
            .identities
            .iter()
            .filter(|path| {
                let exists = path.is_file();
                if !exists {
                    debug!("Identity {} is not a readable file, skipping", path.display());
                }
                exists
            })
            .cloned()
            .collect();

        if !usable.is_empty() {
            return Ok(AuthMethod::Identities(usable));
        }

        if let Some(password) = &self.password {
            return Ok(AuthMethod::Password(password.clone()));
        }

        if !self.identities.is_empty() {
            return Err(TransportError::Authentication(format!(
                "none of the identity files exist: {}",
                self.identities
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let default_keys: Vec<PathBuf> = home
            .map(|home| {
                DEFAULT_IDENTITIES
                    .iter()
                    .map(|name| home.join(".ssh").join(name))
                    .filter(|path| path.is_file())
                    .collect()
            })
            .unwrap_or_default();

        if agent || !default_keys.is_empty() {
            return Ok(AuthMethod::Ambient { agent, default_keys });
        }

        Err(TransportError::Authentication(
            "no identity, password, ssh-agent or default key available".to_string(),
        ))
    }
}
