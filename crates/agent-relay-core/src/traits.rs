//! Collaborator traits: token storage, bootstrap content, usage accounting.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::{AgentId, TurnUsage};

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable home of the opaque session token, one entry per agent.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Read the persisted token, if any.
    async fn read(&self, id: &AgentId) -> Result<Option<String>, StorageError>;

    /// Persist (or overwrite) the token.
    async fn write(&self, id: &AgentId, token: &str) -> Result<(), StorageError>;

    /// Discard the token so the next session starts fresh.
    async fn clear(&self, id: &AgentId) -> Result<(), StorageError>;
}

/// Supplies the one-time instruction block prepended to a session's first message.
#[async_trait]
pub trait BootstrapProvider: Send + Sync {
    /// Bootstrap text for `working_dir`, or `None` when there is nothing to prepend.
    async fn bootstrap(&self, working_dir: &Path, direction: Option<&str>) -> Option<String>;
}

/// Bootstrap provider that never prepends anything.
#[derive(Debug, Default, Clone)]
pub struct NoBootstrap;

#[async_trait]
impl BootstrapProvider for NoBootstrap {
    async fn bootstrap(&self, _working_dir: &Path, _direction: Option<&str>) -> Option<String> {
        None
    }
}

/// Bootstrap provider returning a fixed block.
#[derive(Debug, Clone)]
pub struct StaticBootstrap(pub String);

#[async_trait]
impl BootstrapProvider for StaticBootstrap {
    async fn bootstrap(&self, _working_dir: &Path, _direction: Option<&str>) -> Option<String> {
        (!self.0.trim().is_empty()).then(|| self.0.clone())
    }
}

/// Bootstrap provider reading a file relative to the working directory.
///
/// With a direction tag `d`, `<stem>.<d>.<ext>` is preferred over the plain
/// file when it exists.
#[derive(Debug, Clone)]
pub struct FileBootstrap {
    relative_path: PathBuf,
}

impl FileBootstrap {
    /// Read `relative_path` under each session's working directory.
    #[must_use]
    pub fn new(relative_path: impl Into<PathBuf>) -> Self {
        Self {
            relative_path: relative_path.into(),
        }
    }

    fn candidates(&self, working_dir: &Path, direction: Option<&str>) -> Vec<PathBuf> {
        let base = working_dir.join(&self.relative_path);
        let mut out = Vec::with_capacity(2);
        if let Some(direction) = direction {
            let stem = base
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let name = match base.extension() {
                Some(ext) => format!("{stem}.{direction}.{}", ext.to_string_lossy()),
                None => format!("{stem}.{direction}"),
            };
            out.push(base.with_file_name(name));
        }
        out.push(base);
        out
    }
}

#[async_trait]
impl BootstrapProvider for FileBootstrap {
    async fn bootstrap(&self, working_dir: &Path, direction: Option<&str>) -> Option<String> {
        for path in self.candidates(working_dir, direction) {
            match tokio::fs::read_to_string(&path).await {
                Ok(text) if !text.trim().is_empty() => return Some(text),
                Ok(_) => return None,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to read bootstrap file: {e}");
                    return None;
                }
            }
        }
        None
    }
}

/// External accounting sink for per-turn usage figures.
pub trait UsageSink: Send + Sync {
    /// Record the usage of one finished turn.
    fn record(&self, id: &AgentId, usage: &TurnUsage);
}

/// Usage sink that only traces the figures.
#[derive(Debug, Default, Clone)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, id: &AgentId, usage: &TurnUsage) {
        tracing::debug!(
            agent_id = %id,
            cost_usd = ?usage.cost_usd,
            input_tokens = ?usage.input_tokens,
            output_tokens = ?usage.output_tokens,
            "Turn usage"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_bootstrap_ignores_blank() {
        let dir = Path::new("/tmp");
        assert_eq!(StaticBootstrap("  ".into()).bootstrap(dir, None).await, None);
        assert_eq!(
            StaticBootstrap("be terse".into()).bootstrap(dir, None).await,
            Some("be terse".to_string())
        );
    }

    #[tokio::test]
    async fn test_file_bootstrap_prefers_direction() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("ROLE.md"), "generic role").unwrap();
        std::fs::write(tmp.path().join("ROLE.review.md"), "review role").unwrap();

        let provider = FileBootstrap::new("ROLE.md");
        assert_eq!(
            provider.bootstrap(tmp.path(), Some("review")).await.as_deref(),
            Some("review role")
        );
        assert_eq!(
            provider.bootstrap(tmp.path(), Some("build")).await.as_deref(),
            Some("generic role")
        );
        assert_eq!(
            provider.bootstrap(tmp.path(), None).await.as_deref(),
            Some("generic role")
        );
    }

    #[test]
    fn test_file_bootstrap_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = FileBootstrap::new("nope.md");
        assert_eq!(tokio_test::block_on(provider.bootstrap(tmp.path(), None)), None);
    }
}
