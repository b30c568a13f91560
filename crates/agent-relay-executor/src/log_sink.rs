//! Durable per-session log of raw agent output.

use std::{path::Path, sync::Arc};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::Mutex,
};

/// Append-only sink for raw process output.
#[derive(Clone)]
pub struct LogSink {
    writer: Arc<Mutex<BufWriter<Box<dyn AsyncWrite + Send + Unpin>>>>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}

impl LogSink {
    /// Create a log sink over any writer.
    #[must_use]
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(BufWriter::new(Box::new(writer)))),
        }
    }

    /// Sink that drops everything.
    #[must_use]
    pub fn discard() -> Self {
        Self::new(tokio::io::sink())
    }

    /// Open `path` for appending, creating it and its parent directory.
    ///
    /// # Errors
    /// Returns error if the file cannot be opened.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::new(file))
    }

    /// Open `path`, falling back to a discarding sink on error.
    pub async fn open_or_discard(path: &Path) -> Self {
        match Self::open(path).await {
            Ok(sink) => sink,
            Err(e) => {
                tracing::warn!(path = %path.display(), "Agent log unavailable: {e}");
                Self::discard()
            }
        }
    }

    /// Log a raw line.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn log_raw(&self, raw: &str) -> Result<(), std::io::Error> {
        let mut guard = self.writer.lock().await;
        guard.write_all(raw.as_bytes()).await?;
        guard.write_all(b"\n").await?;
        guard.flush().await?;
        Ok(())
    }

    /// Log a chunk of output under `tag`, one tagged line per chunk line.
    pub async fn log_chunk(&self, tag: &str, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            if let Err(e) = self.log_raw(&format!("[{tag}] {line}")).await {
                tracing::error!("Failed to write agent log: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_chunk_tags_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.log");

        let sink = LogSink::open(&path).await.unwrap();
        sink.log_chunk("stdout", b"first\n\nsecond\r\n").await;
        sink.log_chunk("stderr", b"oops").await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "[stdout] first\n[stdout] second\n[stderr] oops\n");
    }

    #[tokio::test]
    async fn test_log_raw_appends_newline() {
        let writer = tokio_test::io::Builder::new()
            .write(b"{\"type\":\"system\"}\n")
            .write(b"[record] x\n")
            .build();
        let sink = LogSink::new(writer);

        tokio_test::assert_ok!(sink.log_raw("{\"type\":\"system\"}").await);
        sink.log_chunk("record", b"x").await;
    }
}
