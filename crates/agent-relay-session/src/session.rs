//! The agent session facade.

use std::sync::Arc;

use agent_relay_core::{
    AgentConfig, AgentId, BootstrapProvider, ConfigError, Delivery, EventLog, NoBootstrap,
    ProtocolVariant, SessionError, SessionEvent, TokenStore, TracingUsageSink, TurnOutcome,
    UsageSink,
};
use agent_relay_executor::{ChannelDeps, ChannelHandle, ChannelStatus, spawn_channel};
use futures::{FutureExt, future::BoxFuture, stream::BoxStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::storage::MemoryTokenStore;

/// One addressable agent session.
///
/// Binds an agent id and protocol variant to the matching channel, and owns
/// loading the persisted session token at open. Cloning is cheap and every
/// clone drives the same session.
#[derive(Clone)]
pub struct AgentSession {
    config: Arc<AgentConfig>,
    channel: ChannelHandle,
    events: Arc<EventLog>,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("agent_id", &self.config.agent_id)
            .field("protocol", &self.config.protocol)
            .finish_non_exhaustive()
    }
}

impl AgentSession {
    /// Start building a session for `config`.
    #[must_use]
    pub fn builder(config: AgentConfig) -> AgentSessionBuilder {
        AgentSessionBuilder::new(config)
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &AgentId {
        &self.config.agent_id
    }

    /// Lifecycle model in use.
    #[must_use]
    pub fn protocol(&self) -> ProtocolVariant {
        self.config.protocol
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Send a message, calling `on_delivery` for each piece of user-visible
    /// text, and wait for the turn to complete.
    ///
    /// # Errors
    /// Returns the failure kind that ended the turn, or
    /// [`SessionError::ConcurrencyViolation`] if a turn is already in flight.
    pub async fn send<F>(
        &self,
        message: impl Into<String>,
        on_delivery: F,
    ) -> Result<TurnOutcome, SessionError>
    where
        F: FnMut(Delivery) + Send + Sync + 'static,
    {
        self.channel.send(message, Box::new(on_delivery)).await
    }

    /// Send a message and collect its deliveries.
    ///
    /// # Errors
    /// See [`send`](Self::send).
    pub async fn send_collect(
        &self,
        message: impl Into<String>,
    ) -> Result<(Vec<Delivery>, TurnOutcome), SessionError> {
        let (stream, completion) = self.send_streaming(message);
        let outcome = completion.await?;
        let deliveries = futures::StreamExt::collect(stream).await;
        Ok((deliveries, outcome))
    }

    /// Send a message, returning its deliveries as a stream plus the
    /// completion.
    ///
    /// The stream ends once the turn resolves. Nothing is sent until the
    /// completion future is polled.
    #[must_use]
    pub fn send_streaming(
        &self,
        message: impl Into<String>,
    ) -> (
        BoxStream<'static, Delivery>,
        BoxFuture<'static, Result<TurnOutcome, SessionError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channel.clone();
        let message = message.into();
        let completion = async move {
            channel
                .send(message, Box::new(move |delivery: Delivery| {
                    let _ = tx.send(delivery);
                }))
                .await
        }
        .boxed();
        (Box::pin(UnboundedReceiverStream::new(rx)), completion)
    }

    /// Stop the agent and cancel any in-flight turn. Idempotent.
    ///
    /// The persisted session token is kept.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] if the session task is gone.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.channel.stop().await
    }

    /// Stop and discard the session token, in memory and in storage, so the
    /// next send starts a brand-new conversation.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] if the session task is gone.
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.channel.reset().await
    }

    /// Resume `token` on the next launch.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] if the session task is gone.
    pub async fn restore_token(&self, token: impl Into<String>) -> Result<(), SessionError> {
        self.channel.restore_token(token).await
    }

    /// Snapshot of the session's state.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] if the session task is gone.
    pub async fn status(&self) -> Result<ChannelStatus, SessionError> {
        self.channel.status().await
    }

    /// History followed by live session events.
    #[must_use]
    pub fn subscribe(&self) -> BoxStream<'static, SessionEvent> {
        self.events.history_plus_stream()
    }

    /// The session's event log.
    #[must_use]
    pub const fn events(&self) -> &Arc<EventLog> {
        &self.events
    }
}

/// Builder for [`AgentSession`].
pub struct AgentSessionBuilder {
    config: AgentConfig,
    tokens: Arc<dyn TokenStore>,
    bootstrap: Arc<dyn BootstrapProvider>,
    usage: Arc<dyn UsageSink>,
    events: Option<Arc<EventLog>>,
}

impl AgentSessionBuilder {
    /// Builder with an in-memory token store, no bootstrap and tracing usage.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            tokens: Arc::new(MemoryTokenStore::new()),
            bootstrap: Arc::new(NoBootstrap),
            usage: Arc::new(TracingUsageSink),
            events: None,
        }
    }

    /// Durable token store.
    #[must_use]
    pub fn token_store(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Bootstrap content provider.
    #[must_use]
    pub fn bootstrap(mut self, bootstrap: Arc<dyn BootstrapProvider>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Usage and cost sink.
    #[must_use]
    pub fn usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = usage;
        self
    }

    /// Share an existing event log.
    #[must_use]
    pub fn event_log(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the config, load the persisted token and start the session.
    ///
    /// No process is launched until the first send. A token store read
    /// failure is logged and the session starts without a token.
    ///
    /// # Errors
    /// Returns error if the config is invalid.
    pub async fn open(self) -> Result<AgentSession, ConfigError> {
        self.config.validate()?;

        let initial_token = match self.tokens.read(&self.config.agent_id).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(agent_id = %self.config.agent_id, "Failed to read session token: {e}");
                None
            }
        };
        tracing::debug!(
            agent_id = %self.config.agent_id,
            protocol = ?self.config.protocol,
            resuming = initial_token.is_some(),
            "Opening agent session"
        );

        let events = self.events.unwrap_or_default();
        let channel = spawn_channel(ChannelDeps {
            config: self.config.clone(),
            tokens: self.tokens,
            bootstrap: self.bootstrap,
            usage: self.usage,
            events: Arc::clone(&events),
            initial_token,
        });

        Ok(AgentSession {
            config: Arc::new(self.config),
            channel,
            events,
        })
    }
}
