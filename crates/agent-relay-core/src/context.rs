//! Agent identity and configuration.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier a caller uses to address one agent session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create a new agent identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name-safe form of the identifier.
    ///
    /// Everything outside `[A-Za-z0-9._-]` becomes `_`, and a leading dot is
    /// replaced so the result never names a hidden or parent directory.
    #[must_use]
    pub fn file_stem(&self) -> String {
        let mut stem: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if stem.is_empty() || stem.starts_with('.') {
            stem.insert(0, '_');
        }
        stem
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Process lifecycle and wire protocol spoken by an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVariant {
    /// One long-lived process fed newline-delimited JSON requests.
    #[default]
    Persistent,
    /// A fresh process per message; text comes back through a side channel file.
    PerCall,
}

/// Which agent output counts as user-visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryPolicy {
    /// Tool whose `message` argument is forwarded verbatim.
    pub chat_tool: String,
    /// Forward plain assistant text as well.
    pub forward_narrative: bool,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            chat_tool: "chat".to_string(),
            forward_narrative: false,
        }
    }
}

impl DeliveryPolicy {
    /// Whether a tool invocation named `name` is the chat tool.
    ///
    /// MCP tools arrive namespaced (`mcp__server__chat`), so a `__`-separated
    /// suffix match counts too.
    #[must_use]
    pub fn is_chat_tool(&self, name: &str) -> bool {
        name == self.chat_tool
            || name
                .strip_suffix(self.chat_tool.as_str())
                .is_some_and(|prefix| prefix.ends_with("__"))
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for one agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Session identifier.
    pub agent_id: AgentId,

    /// Lifecycle/protocol variant.
    #[serde(default)]
    pub protocol: ProtocolVariant,

    /// Base command line, split into words like a shell would.
    pub command: String,

    /// Extra arguments appended after the base command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Optional model selector.
    #[serde(default)]
    pub model: Option<String>,

    /// Working directory for the agent process.
    pub working_dir: PathBuf,

    /// Extra environment for the agent process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Directory holding the log, side channel and done marker files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Optional "direction" tag handed to the bootstrap provider.
    #[serde(default)]
    pub direction: Option<String>,

    /// What gets forwarded to the caller.
    #[serde(default)]
    pub delivery: DeliveryPolicy,

    /// Side channel poll period in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub relay_poll_interval_ms: u64,

    /// Grace period between a cooperative stop and a forced kill.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("agent-relay")
}

const fn default_poll_interval_ms() -> u64 {
    300
}

const fn default_stop_grace_ms() -> u64 {
    2_000
}

impl AgentConfig {
    /// Create a config with defaults for everything optional.
    #[must_use]
    pub fn new(
        agent_id: impl Into<AgentId>,
        protocol: ProtocolVariant,
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            protocol,
            command: command.into(),
            args: Vec::new(),
            model: None,
            working_dir: working_dir.into(),
            env: HashMap::new(),
            state_dir: default_state_dir(),
            direction: None,
            delivery: DeliveryPolicy::default(),
            relay_poll_interval_ms: default_poll_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }

    /// Parse a config from TOML.
    ///
    /// # Errors
    /// Returns error if the document is malformed or fails validation.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check invariants serde cannot express.
    ///
    /// # Errors
    /// Returns error naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.as_str().trim().is_empty() {
            return Err(ConfigError::Invalid("agent_id must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid("command must not be empty".into()));
        }
        if self.relay_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay_poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Set extra arguments.
    #[must_use]
    pub fn with_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the model selector.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Add one environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the state directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Set the bootstrap direction tag.
    #[must_use]
    pub fn with_direction(mut self, direction: impl Into<String>) -> Self {
        self.direction = Some(direction.into());
        self
    }

    /// Override the delivery policy.
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }

    /// Override the side channel poll period.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.relay_poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Override the stop grace period.
    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Side channel poll period.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay_poll_interval_ms)
    }

    /// Cooperative stop grace period.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Append-only side channel file for per-call agents.
    #[must_use]
    pub fn outbox_path(&self) -> PathBuf {
        self.state_path("outbox.jsonl")
    }

    /// Marker file a per-call agent creates to signal completion.
    #[must_use]
    pub fn done_marker_path(&self) -> PathBuf {
        self.state_path("done")
    }

    /// Durable log of raw process output.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.state_path("log")
    }

    fn state_path(&self, extension: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}.{extension}", self.agent_id.file_stem()))
    }
}
