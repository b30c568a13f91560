//! Command building utilities.

use std::path::Path;

use agent_relay_core::{AgentConfig, SessionError};
use agent_relay_process::LaunchSpec;
use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
}

impl From<CommandBuildError> for SessionError {
    fn from(err: CommandBuildError) -> Self {
        Self::LaunchFailed(err.to_string())
    }
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Turn the parts into a launch spec running in `cwd`.
    #[must_use]
    pub fn into_launch_spec(self, cwd: &Path) -> LaunchSpec {
        LaunchSpec::new(self.program, self.args, cwd)
    }
}

/// Builder for constructing agent command lines.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base command line, split like a shell would.
    pub base: String,
    /// Parameters appended after the base command.
    pub params: Vec<String>,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    /// Builder for the configured command and its static args.
    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.command.clone()).extend_params(config.args.iter().cloned())
    }

    /// Extend parameters.
    #[must_use]
    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(more.into_iter().map(Into::into));
        self
    }

    /// Build the command line with per-launch arguments appended last.
    ///
    /// # Errors
    /// Returns error if the base command cannot be split or is empty.
    pub fn build(&self, additional_args: &[String]) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        parts.extend(self.params.iter().cloned());
        parts.extend(additional_args.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
}
