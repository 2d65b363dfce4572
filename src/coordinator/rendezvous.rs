//! Local rendezvous channel
//!
//! Every participant at a location derives the same Unix socket path from the
//! canonical store directory. The leader listens there, followers connect.

use crate::common::{Error, Result};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;

/// Longest socket path accepted everywhere (`sun_path` is 104 bytes on macOS
/// and the BSDs, 108 on Linux, both including the trailing NUL).
const MAX_SOCKET_PATH: usize = 103;

/// Socket address shared by every participant at one location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    path: PathBuf,
}

impl Rendezvous {
    /// Derive the address for a canonical store location.
    ///
    /// Normally `<location>/<socket_name>`. Locations too deep for a socket
    /// path use a name in the temp directory hashed from the location.
    pub fn for_location(location: &Path, socket_name: &str) -> Self {
        let path = location.join(socket_name);
        if path.as_os_str().len() <= MAX_SOCKET_PATH {
            return Self { path };
        }

        let digest = blake3::hash(location.as_os_str().as_bytes());
        let name = format!("sharekv-{}.sock", &digest.to_hex()[..32]);
        Self {
            path: std::env::temp_dir().join(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connect as a follower.
    ///
    /// A missing socket file or nobody listening shows up as an error here;
    /// callers treat that the same as a connection that ended at once.
    pub async fn connect(&self) -> std::io::Result<UnixStream> {
        UnixStream::connect(&self.path).await
    }

    /// Remove a socket file left behind by a leader that died without
    /// closing. A missing file is fine.
    pub async fn remove_stale(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::debug!("Removed stale socket {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::StaleArtifact {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl std::fmt::Display for Rendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
