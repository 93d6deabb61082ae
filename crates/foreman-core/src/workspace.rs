//! Workspace identity.

use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Stable identity of one workspace root, derived from its canonical path.
///
/// Two spellings of the same directory (`./repo`, `/abs/repo/../repo`, a
/// symlink) resolve to the same `WorkspaceId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkspaceId {
    path: PathBuf,
    key: String,
}

impl WorkspaceId {
    /// Canonicalize `path` and derive its id. The directory must exist.
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).map_err(|e| not_found(path, e))?;
        let is_dir = canonical.is_dir();
        Self::from_canonical(canonical, is_dir)
    }

    /// [`WorkspaceId::resolve`] for async callers; the filesystem work runs
    /// off the runtime's worker threads.
    pub async fn resolve_async(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| not_found(path, e))?;
        let is_dir = tokio::fs::metadata(&canonical)
            .await
            .is_ok_and(|meta| meta.is_dir());
        Self::from_canonical(canonical, is_dir)
    }

    fn from_canonical(canonical: PathBuf, is_dir: bool) -> Result<Self> {
        if !is_dir {
            return Err(Error::InvalidArgument(format!(
                "workspace {} is not a directory",
                canonical.display()
            )));
        }
        let digest = Sha256::digest(canonical.as_os_str().as_encoded_bytes());
        let key = hex::encode(&digest[..8]);
        Ok(Self {
            path: canonical,
            key,
        })
    }

    /// The canonical workspace root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Short hex digest of the canonical path, handy in logs.
    pub fn key(&self) -> &str {
        &self.key
    }
}

fn not_found(path: &Path, err: std::io::Error) -> Error {
    Error::InvalidArgument(format!("workspace {}: {err}", path.display()))
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
