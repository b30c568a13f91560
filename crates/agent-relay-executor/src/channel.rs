//! Channel actor plumbing shared by both lifecycle models.
//!
//! A channel is a single tokio task that owns all session state. Callers talk
//! to it through a cloneable [`ChannelHandle`]; process output and side
//! channel polls reach it over queues, so no state is ever shared or locked.

use std::{sync::Arc, time::Instant};

use agent_relay_core::{
    AgentConfig, AgentId, BootstrapProvider, Delivery, DeliveryFn, DeliverySource, EventLog,
    ProtocolVariant, SessionError, SessionEvent, TokenStore, TurnId, TurnOutcome, TurnUsage,
    UsageSink,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::{per_call::PerCallChannel, persistent::PersistentChannel};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// No process; the next send launches one.
    Idle,
    /// A launch is in progress.
    Starting,
    /// Process alive, no turn in flight.
    Ready,
    /// One turn is awaiting its completion.
    TurnInFlight,
    /// The process exited unexpectedly; the next send relaunches.
    Dead,
}

/// Point-in-time view of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub in_flight: bool,
    pub session_token: Option<String>,
    pub messages_sent: u64,
}

/// Collaborators a channel needs.
#[derive(Clone)]
pub struct ChannelDeps {
    pub config: AgentConfig,
    pub tokens: Arc<dyn TokenStore>,
    pub bootstrap: Arc<dyn BootstrapProvider>,
    pub usage: Arc<dyn UsageSink>,
    pub events: Arc<EventLog>,
    /// Token read from durable storage before the channel started.
    pub initial_token: Option<String>,
}

type TurnReply = oneshot::Sender<Result<TurnOutcome, SessionError>>;

pub(crate) enum Command {
    Send {
        message: String,
        on_delivery: DeliveryFn,
        reply: TurnReply,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    RestoreToken {
        token: String,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<ChannelStatus>,
    },
}

/// Start the channel actor matching the configured protocol.
///
/// Must be called from within a tokio runtime. The actor stops its process
/// and exits once every handle has been dropped.
#[must_use]
pub fn spawn_channel(deps: ChannelDeps) -> ChannelHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ChannelHandle {
        agent_id: deps.config.agent_id.clone(),
        tx,
    };
    match deps.config.protocol {
        ProtocolVariant::Persistent => {
            tokio::spawn(PersistentChannel::new(deps).run(rx));
        }
        ProtocolVariant::PerCall => {
            tokio::spawn(PerCallChannel::new(deps).run(rx));
        }
    }
    handle
}

/// Cloneable handle to a running channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    agent_id: AgentId,
    tx: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle {
    /// Session this channel serves.
    #[must_use]
    pub const fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Send one message and wait for its turn to complete.
    ///
    /// `on_delivery` is invoked for every piece of user-visible text, in
    /// order, before this future resolves.
    ///
    /// # Errors
    /// Returns [`SessionError::ConcurrencyViolation`] if a turn is already in
    /// flight, or the failure kind that ended the turn.
    pub async fn send(
        &self,
        message: impl Into<String>,
        on_delivery: DeliveryFn,
    ) -> Result<TurnOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Send {
                message: message.into(),
                on_delivery,
                reply,
            })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Stop the process and cancel any in-flight turn. Idempotent.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] if the channel task is gone.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Stop and forget the session token and message counter.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] if the channel task is gone.
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Set the token used to resume on the next launch.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] if the channel task is gone.
    pub async fn restore_token(&self, token: impl Into<String>) -> Result<(), SessionError> {
        let token = token.into();
        self.request(|reply| Command::RestoreToken { token, reply })
            .await
    }

    /// Snapshot of the channel's state.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] if the channel task is gone.
    pub async fn status(&self) -> Result<ChannelStatus, SessionError> {
        self.request(|reply| Command::Status { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

/// The single in-flight turn of a channel.
pub(crate) struct PendingTurn {
    id: TurnId,
    on_delivery: DeliveryFn,
    reply: TurnReply,
    started: Instant,
    deliveries: usize,
}

impl PendingTurn {
    pub(crate) fn new(on_delivery: DeliveryFn, reply: TurnReply) -> Self {
        Self {
            id: TurnId::new(),
            on_delivery,
            reply,
            started: Instant::now(),
            deliveries: 0,
        }
    }

    pub(crate) const fn id(&self) -> TurnId {
        self.id
    }

    pub(crate) const fn deliveries(&self) -> usize {
        self.deliveries
    }

    pub(crate) fn deliver(&mut self, events: &EventLog, text: String, source: DeliverySource) {
        self.deliveries += 1;
        events.push(SessionEvent::Delivered {
            turn: self.id,
            text: text.clone(),
            source,
        });
        (self.on_delivery)(Delivery {
            turn: self.id,
            text,
            source,
        });
    }

    pub(crate) fn complete(
        self,
        events: &EventLog,
        summary: Option<String>,
        agent_reported_error: bool,
        usage: Option<TurnUsage>,
    ) {
        events.push(SessionEvent::TurnCompleted {
            turn: self.id,
            summary: summary.clone(),
        });
        let outcome = TurnOutcome {
            turn: self.id,
            summary,
            agent_reported_error,
            deliveries: self.deliveries,
            usage,
            elapsed: self.started.elapsed(),
        };
        if self.reply.send(Ok(outcome)).is_err() {
            tracing::debug!(turn = %self.id, "Turn completed after its caller went away");
        }
    }

    pub(crate) fn fail(self, events: &EventLog, error: SessionError) {
        events.push(SessionEvent::TurnFailed {
            turn: self.id,
            kind: error.kind().to_string(),
            error: error.to_string(),
        });
        let _ = self.reply.send(Err(error));
    }
}

/// State and collaborators common to both channel kinds.
pub(crate) struct ChannelCore {
    pub(crate) deps: ChannelDeps,
    pub(crate) turn: Option<PendingTurn>,
    pub(crate) token: Option<String>,
    pub(crate) messages_sent: u64,
}

impl ChannelCore {
    pub(crate) fn new(mut deps: ChannelDeps) -> Self {
        let token = deps.initial_token.take();
        Self {
            deps,
            turn: None,
            token,
            messages_sent: 0,
        }
    }

    pub(crate) const fn config(&self) -> &AgentConfig {
        &self.deps.config
    }

    pub(crate) fn agent_id(&self) -> &AgentId {
        &self.deps.config.agent_id
    }

    pub(crate) fn events(&self) -> &EventLog {
        &self.deps.events
    }

    pub(crate) const fn is_busy(&self) -> bool {
        self.turn.is_some()
    }

    /// Prefix the first message of a session with the bootstrap block.
    pub(crate) async fn compose_message(&self, message: &str) -> String {
        if self.messages_sent > 0 {
            return message.to_string();
        }
        let config = self.config();
        match self
            .deps
            .bootstrap
            .bootstrap(&config.working_dir, config.direction.as_deref())
            .await
        {
            Some(bootstrap) if !bootstrap.trim().is_empty() => format!("{bootstrap}\n\n{message}"),
            _ => message.to_string(),
        }
    }

    /// Begin a turn: bump the counter and publish it.
    pub(crate) fn begin_turn(&mut self, turn: PendingTurn, message: String) {
        self.messages_sent += 1;
        self.events().push(SessionEvent::TurnStarted {
            turn: turn.id(),
            message,
        });
        self.turn = Some(turn);
    }

    /// Deliver text to the in-flight turn, if any.
    pub(crate) fn deliver(&mut self, text: String, source: DeliverySource) {
        match self.turn.as_mut() {
            Some(turn) => turn.deliver(&self.deps.events, text, source),
            None => tracing::debug!(
                agent_id = %self.deps.config.agent_id,
                "Dropping delivery with no turn in flight"
            ),
        }
    }

    pub(crate) fn fail_turn(&mut self, error: SessionError) {
        if let Some(turn) = self.turn.take() {
            tracing::debug!(agent_id = %self.agent_id(), turn = %turn.id(), "Turn failed: {error}");
            turn.fail(&self.deps.events, error);
        }
    }

    /// Adopt a token seen on the wire and persist it if it changed.
    pub(crate) async fn update_token(&mut self, token: &str) {
        if token.is_empty() || self.token.as_deref() == Some(token) {
            return;
        }
        tracing::debug!(agent_id = %self.agent_id(), token, "Session token updated");
        self.token = Some(token.to_string());
        self.events().push(SessionEvent::SessionToken {
            token: token.to_string(),
        });
        if let Err(e) = self.deps.tokens.write(self.agent_id(), token).await {
            tracing::warn!(agent_id = %self.agent_id(), "Failed to persist session token: {e}");
        }
    }

    pub(crate) fn restore_token(&mut self, token: String) {
        self.events().push(SessionEvent::SessionToken {
            token: token.clone(),
        });
        self.token = Some(token);
    }

    /// Forget the counter and token, in memory and in durable storage.
    pub(crate) async fn forget_session(&mut self) {
        self.messages_sent = 0;
        self.token = None;
        if let Err(e) = self.deps.tokens.clear(self.agent_id()).await {
            tracing::warn!(agent_id = %self.agent_id(), "Failed to clear session token: {e}");
        }
        self.events().push(SessionEvent::Reset);
    }

    pub(crate) fn record_usage(&self, usage: &TurnUsage) {
        self.deps.usage.record(self.agent_id(), usage);
    }

    pub(crate) fn status(&self, state: ChannelState) -> ChannelStatus {
        ChannelStatus {
            state,
            in_flight: self.is_busy(),
            session_token: self.token.clone(),
            messages_sent: self.messages_sent,
        }
    }
}

/// Answer a send that arrived while a turn is in flight.
pub(crate) fn reject_busy(agent_id: &AgentId, reply: TurnReply) {
    tracing::debug!(%agent_id, "Rejecting send while a turn is in flight");
    let _ = reply.send(Err(SessionError::ConcurrencyViolation));
}
