//! Per-call lifecycle: a fresh process per message, output via side channel.

mod channel;
pub mod relay;

pub(crate) use channel::PerCallChannel;
pub use channel::{DONE_FILE_ENV, OUTBOX_ENV, launch_args};
pub use relay::{RelayEvent, SideChannelCursor, SideChannelRelay};
