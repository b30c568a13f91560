//! Broadcast + history log of session events.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::SessionEvent;

/// Default history size limit (1 MB).
const HISTORY_BYTES: usize = 1024 * 1024;

/// Live channel capacity; slow subscribers skip what they miss.
const LIVE_CAPACITY: usize = 1024;

struct StoredEvent {
    event: SessionEvent,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredEvent>,
    total_bytes: usize,
}

/// Event log with broadcast and bounded history.
///
/// Late observers receive the history first and then follow live events,
/// so a UI can rebuild the message log and in-flight state without
/// reading any session field directly.
pub struct EventLog {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SessionEvent>,
    history_limit: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Create an event log with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(HISTORY_BYTES)
    }

    /// Create an event log keeping at most `limit` bytes of history.
    #[must_use]
    pub fn with_history_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
            history_limit: limit,
        }
    }

    /// Push an event to live listeners and history.
    pub fn push(&self, event: SessionEvent) {
        let bytes = event.approx_bytes();

        // Broadcast under the write lock so a concurrent `history_plus_stream`
        // sees each event exactly once.
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let _ = self.sender.send(event.clone());
        while inner.total_bytes.saturating_add(bytes) > self.history_limit {
            let Some(front) = inner.history.pop_front() else {
                break;
            };
            inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
        }
        inner.history.push_back(StoredEvent { event, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<SessionEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.event.clone())
            .collect()
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let (history, rx) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let history: Vec<SessionEvent> =
                inner.history.iter().map(|s| s.event.clone()).collect();
            (history, self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            if let Err(e) = &res {
                tracing::debug!("Event subscriber lagged: {e}");
            }
            res.ok()
        });

        Box::pin(hist.chain(live))
    }

    /// Stream of delivered texts until the current turn ends.
    #[must_use]
    pub fn delivery_stream(&self) -> futures::stream::BoxStream<'static, String> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move { res.ok() })
            .take_while(|event| future::ready(!event.is_turn_end()))
            .filter_map(|event| async move {
                match event {
                    SessionEvent::Delivered { text, .. } => Some(text),
                    _ => None,
                }
            })
            .boxed()
    }
}
