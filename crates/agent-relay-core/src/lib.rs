//! Core abstractions for driving CLI agents as addressable sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `AgentConfig` - Identity, protocol variant and launch settings
//! - `SessionError` - Uniform failure taxonomy for every channel
//! - `EventLog` / `SessionEvent` - Broadcast + history observation stream
//! - Token store, bootstrap and usage collaborator traits

pub mod context;
pub mod error;
pub mod event_log;
pub mod session_event;
pub mod traits;
pub mod turn;

pub use context::{AgentConfig, AgentId, ConfigError, DeliveryPolicy, ProtocolVariant};
pub use error::SessionError;
pub use event_log::EventLog;
pub use session_event::SessionEvent;
pub use traits::{
    BootstrapProvider, FileBootstrap, NoBootstrap, StaticBootstrap, StorageError, TokenStore,
    TracingUsageSink, UsageSink,
};
pub use turn::{Delivery, DeliveryFn, DeliverySource, TurnId, TurnOutcome, TurnUsage};
