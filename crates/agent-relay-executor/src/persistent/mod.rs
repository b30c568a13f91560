//! Persistent lifecycle: one long-lived process speaking stream-json.

mod channel;
pub mod protocol;

pub(crate) use channel::PersistentChannel;
pub use protocol::{ContentBlock, RecordKind, StreamRecord, TurnResult};
