//! Turn-level value types shared by every channel.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of one request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(Uuid);

impl TurnId {
    /// Allocate a fresh turn id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a piece of user-visible text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySource {
    /// Argument of the chat tool invocation.
    ChatTool,
    /// Plain assistant text (only when the policy forwards it).
    Narrative,
    /// Turn-result summary used as a fallback.
    Summary,
    /// Record read from a per-call agent's side channel file.
    SideChannel,
}

/// One piece of user-visible text produced during a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub turn: TurnId,
    pub text: String,
    pub source: DeliverySource,
}

/// Callback receiving deliveries for one turn, in decode order.
pub type DeliveryFn = Box<dyn FnMut(Delivery) + Send + Sync>;

/// Usage and cost figures of a finished turn, passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// The raw usage object as the agent reported it.
    #[serde(default)]
    pub raw: Value,
}

/// What a successful turn resolves with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub turn: TurnId,
    /// Final summary text, when the protocol carries one.
    pub summary: Option<String>,
    /// The agent flagged its own result as an error.
    pub agent_reported_error: bool,
    /// Number of deliveries made before completion.
    pub deliveries: usize,
    pub usage: Option<TurnUsage>,
    pub elapsed: Duration,
}
