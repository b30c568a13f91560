//! Uniform error taxonomy for agent sessions.

use thiserror::Error;

/// Why a `send` (or session operation) failed.
///
/// The same variants come out of both channel variants, so callers never
/// need to know which lifecycle model produced the failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The agent executable could not be found.
    #[error("Agent executable not installed: {0}")]
    NotInstalled(String),
    /// The OS refused to spawn the process.
    #[error("Failed to launch agent: {0}")]
    LaunchFailed(String),
    /// The process died outside a cooperative stop.
    #[error("Agent exited abnormally (code {code}): {diagnostics}")]
    AbnormalExit { code: i32, diagnostics: String },
    /// A turn is already in flight on this session.
    #[error("A turn is already in flight for this session")]
    ConcurrencyViolation,
    /// The turn was ended by an explicit `stop()` or `reset()`.
    #[error("Turn cancelled")]
    Cancelled,
    /// Writing the request to the live process failed.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The session's background task is gone.
    #[error("Session closed")]
    Closed,
}

impl SessionError {
    /// Create an abnormal exit error.
    pub fn abnormal_exit(code: i32, diagnostics: impl Into<String>) -> Self {
        Self::AbnormalExit {
            code,
            diagnostics: diagnostics.into(),
        }
    }

    /// Whether the failure came from a user-initiated stop.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short stable name of the failure kind, for logs and events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotInstalled(_) => "not_installed",
            Self::LaunchFailed(_) => "launch_failed",
            Self::AbnormalExit { .. } => "abnormal_exit",
            Self::ConcurrencyViolation => "concurrency_violation",
            Self::Cancelled => "cancelled",
            Self::Transport(_) => "transport",
            Self::Closed => "closed",
        }
    }
}
