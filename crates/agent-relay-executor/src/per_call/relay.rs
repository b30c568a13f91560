//! Side channel relay: tails an append-only JSONL file.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::Deserialize;
use tokio::{sync::mpsc, task::JoinHandle};

/// One side channel record; fields other than `content` are ignored.
#[derive(Debug, Deserialize)]
struct SideChannelRecord {
    content: String,
}

/// Read position in a side channel file.
#[derive(Debug, Clone)]
pub struct SideChannelCursor {
    path: PathBuf,
    offset: u64,
}

impl SideChannelCursor {
    /// Cursor at the start of `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    /// Bytes consumed so far.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Read complete records appended since the last poll.
    ///
    /// A trailing record without its newline is left for the next poll. A
    /// missing file reads as empty. Malformed records are logged and skipped.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read.
    pub fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            tracing::debug!(path = %self.path.display(), "Side channel truncated, rewinding");
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let Some(end) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        self.offset += (end + 1) as u64;

        Ok(buf[..end]
            .split(|b| *b == b'\n')
            .filter_map(decode_record)
            .collect())
    }
}

fn decode_record(line: &[u8]) -> Option<String> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_slice::<SideChannelRecord>(line) {
        Ok(record) => Some(record.content),
        Err(e) => {
            tracing::warn!("Skipping malformed side channel record: {e}");
            None
        }
    }
}

/// Something the relay observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Content of one side channel record.
    Message(String),
    /// The done marker appeared.
    Done,
}

/// Polls a side channel file in the background.
pub struct SideChannelRelay {
    cursor: Arc<Mutex<SideChannelCursor>>,
    events: mpsc::UnboundedReceiver<RelayEvent>,
    task: JoinHandle<()>,
    open: bool,
}

impl SideChannelRelay {
    /// Truncate `path` and start polling it every `interval`.
    ///
    /// When `done_marker` is given, its appearance is reported once as
    /// [`RelayEvent::Done`].
    ///
    /// # Errors
    /// Returns error if the file cannot be created or truncated.
    pub async fn start(
        path: &Path,
        done_marker: Option<PathBuf>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(path).await?;

        let cursor = Arc::new(Mutex::new(SideChannelCursor::new(path)));
        let (tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(poll_loop(Arc::clone(&cursor), done_marker, interval, tx));

        Ok(Self {
            cursor,
            events,
            task,
            open: true,
        })
    }

    /// Next observed event. Pends forever once the poller is gone.
    pub async fn recv(&mut self) -> RelayEvent {
        if self.open {
            if let Some(event) = self.events.recv().await {
                return event;
            }
            self.open = false;
        }
        std::future::pending().await
    }

    /// Halt polling.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Halt polling and return every message not yet handed out, including
    /// a final scan of the file.
    pub async fn finish(mut self) -> Vec<String> {
        self.task.abort();
        let _ = (&mut self.task).await;

        // Taking the cursor lock waits out a poll still running on the
        // blocking pool, so everything it forwarded is queued before the drain.
        let cursor = Arc::clone(&self.cursor);
        let rest = tokio::task::spawn_blocking(move || {
            cursor.lock().unwrap_or_else(PoisonError::into_inner).poll()
        })
        .await;

        let mut messages = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let RelayEvent::Message(text) = event {
                messages.push(text);
            }
        }
        match rest {
            Ok(Ok(rest)) => messages.extend(rest),
            Ok(Err(e)) => tracing::warn!("Final side channel scan failed: {e}"),
            Err(e) => tracing::warn!("Final side channel scan panicked: {e}"),
        }
        messages
    }
}

impl Drop for SideChannelRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop(
    cursor: Arc<Mutex<SideChannelCursor>>,
    done_marker: Option<PathBuf>,
    interval: Duration,
    tx: mpsc::UnboundedSender<RelayEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut done_sent = false;

    loop {
        ticker.tick().await;

        let polled = tokio::task::spawn_blocking({
            let cursor = Arc::clone(&cursor);
            let tx = tx.clone();
            move || poll_and_forward(&cursor, &tx)
        })
        .await;
        match polled {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return,
            Ok(Err(e)) => tracing::warn!("Side channel poll failed: {e}"),
            Err(e) => tracing::warn!("Side channel poll panicked: {e}"),
        }

        if let Some(marker) = done_marker.as_deref().filter(|_| !done_sent) {
            if tokio::fs::try_exists(marker).await.unwrap_or(false) {
                done_sent = true;
                if tx.send(RelayEvent::Done).is_err() {
                    return;
                }
            }
        }
    }
}

/// Poll once and forward the records while still holding the cursor.
///
/// Runs to completion even if the polling task is aborted, so records the
/// cursor has passed are always queued. Returns false once nobody listens.
fn poll_and_forward(
    cursor: &Mutex<SideChannelCursor>,
    tx: &mpsc::UnboundedSender<RelayEvent>,
) -> std::io::Result<bool> {
    let mut cursor = cursor.lock().unwrap_or_else(PoisonError::into_inner);
    for message in cursor.poll()? {
        if tx.send(RelayEvent::Message(message)).is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}
