//! Staging the local script on the remote host

use crate::{Result, SshrunError};
use sshrun_ssh::Transport;
use std::path::Path;
use tracing::{debug, info};

/// Prefix of every staged file name
pub const STAGED_PREFIX: &str = "sshrun-";

/// Random bytes in the staged file name, hex encoded
pub const SUFFIX_BYTES: usize = 10;

/// A uniquely named location for the script on the remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedScript {
    remote_path: String,
}

impl StagedScript {
    /// Pick a fresh random path inside `remote_dir`
    pub fn generate(remote_dir: &str) -> Self {
        let suffix = hex::encode(rand::random::<[u8; SUFFIX_BYTES]>());
        Self {
            remote_path: join_remote(remote_dir, &format!("{}{}.sh", STAGED_PREFIX, suffix)),
        }
    }

    /// Full remote path of the staged script
    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }
}

/// POSIX path join that does not depend on the local platform's separator
fn join_remote(dir: &str, name: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() && dir.starts_with('/') {
        format!("/{}", name)
    } else {
        format!("{}/{}", trimmed, name)
    }
}

/// Copies a local script into a remote file
pub struct ScriptStager;

impl ScriptStager {
    /// Pipe `local_path` into `remote_path` over `transport`.
    ///
    /// Resolves once, after the remote side has acknowledged the whole file.
    /// When both the local copy and the remote side fail, the remote failure
    /// is the one reported.
    pub async fn upload(transport: &mut dyn Transport, local_path: &Path, remote_path: &str) -> Result<u64> {
        info!("Staging {} as {}", local_path.display(), remote_path);

        let mut source = tokio::fs::File::open(local_path).await.map_err(|e| {
            SshrunError::Transfer(format!("cannot read {}: {}", local_path.display(), e))
        })?;

        let mut remote = transport
            .create_file(remote_path)
            .await
            .map_err(SshrunError::from_transfer)?;

        let copied = tokio::io::copy(&mut source, &mut remote).await;
        let finished = remote.finish().await;

        match (copied, finished) {
            (_, Err(e)) => Err(SshrunError::from_transfer(e)),
            (Err(e), Ok(())) => Err(SshrunError::Transfer(format!(
                "copying {} to {} failed: {}",
                local_path.display(),
                remote_path,
                e
            ))),
            (Ok(bytes), Ok(())) => {
                debug!("Staged {} bytes", bytes);
                Ok(bytes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_staged_path_shape() {
        let staged = StagedScript::generate("/tmp");
        let path = staged.remote_path();
        let name = path.strip_prefix("/tmp/sshrun-").unwrap();
        let hex = name.strip_suffix(".sh").unwrap();
        assert_eq!(hex.len(), SUFFIX_BYTES * 2);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/tmp", "a.sh"), "/tmp/a.sh");
        assert_eq!(join_remote("/tmp/", "a.sh"), "/tmp/a.sh");
        assert_eq!(join_remote("/", "a.sh"), "/a.sh");
        assert_eq!(join_remote("scratch", "a.sh"), "scratch/a.sh");
    }

    #[test]
    fn test_staged_paths_do_not_collide() {
        let paths: HashSet<String> = (0..1000)
            .map(|_| StagedScript::generate("/tmp").remote_path().to_string())
            .collect();
        assert_eq!(paths.len(), 1000);
    }

    proptest! {
        #[test]
        fn prop_staged_path_stays_in_dir(dir in "/[a-z0-9_]{1,12}(/[a-z0-9_]{1,12}){0,3}/?") {
            let staged = StagedScript::generate(&dir);
            let expected_prefix = format!("{}/{}", dir.trim_end_matches('/'), STAGED_PREFIX);
            prop_assert!(staged.remote_path().starts_with(&expected_prefix));
            prop_assert!(staged.remote_path().ends_with(".sh"));
        }
    }
}
