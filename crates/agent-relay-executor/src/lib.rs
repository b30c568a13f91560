//! Session channels for CLI agents.
//!
//! Provides:
//! - `FrameReassembler` - Newline-delimited record reassembly
//! - Persistent (stream-json) and per-call channels behind one `ChannelHandle`
//! - `SideChannelRelay` - Tailing of per-call agents' side channel files
//! - Command building and the per-session output log

pub mod channel;
pub mod command;
pub mod framing;
pub mod log_sink;
pub mod per_call;
pub mod persistent;

pub use channel::{ChannelDeps, ChannelHandle, ChannelState, ChannelStatus, spawn_channel};
pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use framing::FrameReassembler;
pub use log_sink::LogSink;
pub use per_call::{SideChannelCursor, SideChannelRelay};
pub use persistent::StreamRecord;
