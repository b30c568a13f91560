//! File-backed token storage: one file per session.

use std::path::{Path, PathBuf};

use agent_relay_core::{AgentId, StorageError, TokenStore};
use async_trait::async_trait;

/// Token store keeping `<dir>/<agent>.token` files.
///
/// Writes go through a temporary file and a rename, so a crash never leaves
/// a half-written token behind.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    /// Store tokens under `dir` (created on first write).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the token files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &AgentId) -> PathBuf {
        self.dir.join(format!("{}.token", id.file_stem()))
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn read(&self, id: &AgentId) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.path_for(id)).await {
            Ok(raw) => {
                let token = raw.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, id: &AgentId, token: &str) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(id);
        let tmp = path.with_extension("token.tmp");
        tokio::fs::write(&tmp, token).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::trace!(agent_id = %id, path = %path.display(), "Persisted session token");
        Ok(())
    }

    async fn clear(&self, id: &AgentId) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
