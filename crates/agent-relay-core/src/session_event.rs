//! Observable session events.

use serde::{Deserialize, Serialize};

use crate::{DeliverySource, TurnId};

/// Something observable happened on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A turn was accepted and its request handed to the agent.
    TurnStarted { turn: TurnId, message: String },
    /// User-visible text was delivered.
    Delivered {
        turn: TurnId,
        text: String,
        source: DeliverySource,
    },
    /// A turn resolved successfully.
    TurnCompleted { turn: TurnId, summary: Option<String> },
    /// A turn resolved with an error.
    TurnFailed {
        turn: TurnId,
        kind: String,
        error: String,
    },
    /// The session token was set or refreshed.
    SessionToken { token: String },
    /// An agent process was launched.
    ProcessStarted { pid: Option<u32> },
    /// An agent process exited.
    ProcessExited { code: Option<i32> },
    /// The session was stopped.
    Stopped,
    /// The session was reset.
    Reset,
}

impl SessionEvent {
    /// Approximate heap footprint, for history trimming.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 64;
        let payload = match self {
            Self::TurnStarted { message, .. } => message.len(),
            Self::Delivered { text, .. } => text.len(),
            Self::TurnCompleted { summary, .. } => summary.as_ref().map_or(0, String::len),
            Self::TurnFailed { kind, error, .. } => kind.len() + error.len(),
            Self::SessionToken { token } => token.len(),
            Self::ProcessStarted { .. }
            | Self::ProcessExited { .. }
            | Self::Stopped
            | Self::Reset => 0,
        };
        OVERHEAD + payload
    }

    /// Whether this event ends a turn.
    #[must_use]
    pub const fn is_turn_end(&self) -> bool {
        matches!(self, Self::TurnCompleted { .. } | Self::TurnFailed { .. })
    }
}
