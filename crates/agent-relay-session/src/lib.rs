//! Agent sessions and their storage.
//!
//! Provides:
//! - `AgentSession` - One addressable agent behind a uniform send/stop/reset API
//! - `SessionManager` - Registry opening sessions on first address
//! - Token stores (memory, file)

pub mod manager;
pub mod session;
pub mod storage;

pub use agent_relay_executor::{ChannelState, ChannelStatus};
pub use manager::{ManagerError, SessionManager};
pub use session::{AgentSession, AgentSessionBuilder};
pub use storage::{FileTokenStore, MemoryTokenStore};
