//! Host specification parsing

use crate::{Credentials, TransportError};
use std::fmt;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Where to connect and how to authenticate
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username, if given in the target string
    pub username: Option<String>,
    /// Credentials used to authenticate
    pub credentials: Credentials,
}

impl ConnectionSpec {
    /// Parse a target of the form `[user@]hostname[:port]`.
    ///
    /// IPv6 literals must be bracketed when a port is given (`[::1]:2222`).
    pub fn parse(target: &str) -> Result<Self, TransportError> {
        let target = target.trim();
        let (username, rest) = match target.rfind('@') {
            Some(at) => (Some(&target[..at]), &target[at + 1..]),
            None => (None, target),
        };

        if let Some(user) = username {
            if user.is_empty() {
                return Err(TransportError::Configuration(format!(
                    "empty username in target '{}'",
                    target
                )));
            }
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let close = bracketed.find(']').ok_or_else(|| {
                TransportError::Configuration(format!("unterminated '[' in target '{}'", target))
            })?;
            let host = &bracketed[..close];
            let port = match &bracketed[close + 1..] {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(|| {
                    TransportError::Configuration(format!("unexpected '{}' after host", tail))
                })?),
            };
            (host, port)
        } else if rest.matches(':').count() == 1 {
            let colon = rest.rfind(':').unwrap_or(rest.len());
            (&rest[..colon], Some(&rest[colon + 1..]))
        } else {
            // Zero colons, or a bare IPv6 literal without a port
            (rest, None)
        };

        if host.is_empty() {
            return Err(TransportError::Configuration(format!(
                "missing hostname in target '{}'",
                target
            )));
        }

        let port = match port {
            None => DEFAULT_PORT,
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => {
                    return Err(TransportError::Configuration(format!(
                        "invalid port '{}' in target '{}'",
                        p, target
                    )))
                }
                Ok(port) => port,
            },
        };

        Ok(Self {
            host: host.to_string(),
            port,
            username: username.map(str::to_string),
            credentials: Credentials::default(),
        })
    }

    /// Attach credentials to this spec
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// `user@host` as understood by the ssh client, or just `host`
    pub fn destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}[{}]:{}", self.user_prefix(), self.host, self.port)
        } else {
            write!(f, "{}{}:{}", self.user_prefix(), self.host, self.port)
        }
    }
}

impl ConnectionSpec {
    fn user_prefix(&self) -> String {
        self.username
            .as_ref()
            .map(|u| format!("{}@", u))
            .unwrap_or_default()
    }
}
