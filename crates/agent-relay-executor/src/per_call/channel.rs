//! Per-call session channel: a fresh process for every message.

use agent_relay_core::{DeliverySource, SessionError, SessionEvent};
use agent_relay_process::{ProcessEvent, ProcessEvents, ProcessHandle, ProcessSupervisor};
use tokio::sync::mpsc;

use super::relay::{RelayEvent, SideChannelRelay};
use crate::{
    channel::{ChannelCore, ChannelDeps, ChannelState, Command, PendingTurn, reject_busy},
    command::CommandBuilder,
    log_sink::LogSink,
};

/// Environment variable naming the side channel file.
pub const OUTBOX_ENV: &str = "AGENT_RELAY_OUTBOX";

/// Environment variable naming the done marker file.
pub const DONE_FILE_ENV: &str = "AGENT_RELAY_DONE_FILE";

/// Per-launch arguments: model selector, then the message itself.
///
/// A message starting with `-` is preceded by `--` so the tool does not
/// parse it as an option.
#[must_use]
pub fn launch_args(model: Option<&str>, message: &str) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(model) = model {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    if message.starts_with('-') {
        args.push("--".to_string());
    }
    args.push(message.to_string());
    args
}

struct LiveCall {
    handle: ProcessHandle,
    events: ProcessEvents,
    relay: SideChannelRelay,
}

enum CallEvent {
    Process(Option<ProcessEvent>),
    Relay(RelayEvent),
}

enum Step {
    Command(Command),
    CommandsClosed,
    Call(CallEvent),
}

async fn next_call_event(call: &mut Option<LiveCall>) -> CallEvent {
    let Some(call) = call else {
        return std::future::pending().await;
    };
    tokio::select! {
        event = call.events.recv() => CallEvent::Process(event),
        event = call.relay.recv() => CallEvent::Relay(event),
    }
}

/// Drives per-call agents, one process per turn.
pub(crate) struct PerCallChannel {
    core: ChannelCore,
    supervisor: ProcessSupervisor,
    log: LogSink,
    call: Option<LiveCall>,
    state: ChannelState,
}

impl PerCallChannel {
    pub(crate) fn new(deps: ChannelDeps) -> Self {
        let supervisor = ProcessSupervisor::new(deps.config.stop_grace());
        Self {
            core: ChannelCore::new(deps),
            supervisor,
            log: LogSink::discard(),
            call: None,
            state: ChannelState::Idle,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.log = LogSink::open_or_discard(&self.core.config().log_path()).await;
        tracing::debug!(agent_id = %self.core.agent_id(), "Per-call channel started");

        loop {
            let step = tokio::select! {
                command = commands.recv() => command.map_or(Step::CommandsClosed, Step::Command),
                event = next_call_event(&mut self.call) => Step::Call(event),
            };

            match step {
                Step::Command(command) => self.handle_command(command).await,
                Step::Call(CallEvent::Process(Some(event))) => self.handle_process_event(event).await,
                Step::Call(CallEvent::Process(None)) => {
                    tracing::warn!(agent_id = %self.core.agent_id(), "Process events ended without an exit report");
                    self.finish_call(Err(SessionError::abnormal_exit(-1, "process event stream closed")))
                        .await;
                }
                Step::Call(CallEvent::Relay(RelayEvent::Message(text))) => {
                    self.core.deliver(text, DeliverySource::SideChannel);
                }
                Step::Call(CallEvent::Relay(RelayEvent::Done)) => {
                    tracing::debug!(agent_id = %self.core.agent_id(), "Done marker observed");
                    self.finish_call(Ok(())).await;
                }
                Step::CommandsClosed => break,
            }
        }

        self.stop();
        tracing::debug!(agent_id = %self.core.agent_id(), "Per-call channel closed");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                message,
                on_delivery,
                reply,
            } => {
                if self.core.is_busy() {
                    reject_busy(self.core.agent_id(), reply);
                    return;
                }
                let turn = PendingTurn::new(on_delivery, reply);
                self.start_turn(turn, message).await;
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Reset { reply } => {
                self.stop();
                self.core.forget_session().await;
                let _ = reply.send(());
            }
            Command::RestoreToken { token, reply } => {
                tracing::debug!(agent_id = %self.core.agent_id(), "Per-call agents do not resume; token kept for status only");
                self.core.restore_token(token);
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.core.status(self.state));
            }
        }
    }

    async fn start_turn(&mut self, turn: PendingTurn, message: String) {
        self.state = ChannelState::Starting;
        let text = self.core.compose_message(&message).await;
        match self.launch(&text).await {
            Ok(call) => {
                tracing::debug!(agent_id = %self.core.agent_id(), turn = %turn.id(), "Turn started");
                self.call = Some(call);
                self.core.begin_turn(turn, message);
                self.state = ChannelState::TurnInFlight;
            }
            Err(e) => {
                self.state = ChannelState::Idle;
                turn.fail(self.core.events(), e);
            }
        }
    }

    async fn launch(&self, text: &str) -> Result<LiveCall, SessionError> {
        let config = self.core.config();
        let outbox = config.outbox_path();
        let done_marker = config.done_marker_path();

        let parts = CommandBuilder::from_config(config)
            .build(&launch_args(config.model.as_deref(), text))?;

        remove_done_marker(&done_marker).await;
        let relay = SideChannelRelay::start(&outbox, Some(done_marker.clone()), config.poll_interval())
            .await
            .map_err(|e| {
                SessionError::LaunchFailed(format!("side channel {}: {e}", outbox.display()))
            })?;

        let spec = parts
            .into_launch_spec(&config.working_dir)
            .envs(config.env.clone())
            .envs([
                (OUTBOX_ENV, outbox.display().to_string()),
                (DONE_FILE_ENV, done_marker.display().to_string()),
            ]);

        tracing::debug!(agent_id = %self.core.agent_id(), program = %spec.program, "Launching per-call agent");
        let (mut handle, events) = self.supervisor.launch(&spec).await?;
        // The message travels in argv; tools reading stdin get EOF right away.
        handle.close_stdin();
        self.core
            .events()
            .push(SessionEvent::ProcessStarted { pid: handle.pid() });

        Ok(LiveCall {
            handle,
            events,
            relay,
        })
    }

    async fn handle_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout(chunk) => self.log.log_chunk("stdout", &chunk).await,
            ProcessEvent::Stderr(chunk) => self.log.log_chunk("stderr", &chunk).await,
            ProcessEvent::InputFailed(e) => {
                tracing::debug!(agent_id = %self.core.agent_id(), "Ignoring input failure: {e}");
            }
            ProcessEvent::Exited(report) => {
                self.core
                    .events()
                    .push(SessionEvent::ProcessExited { code: Some(report.exit_code()) });
                tracing::debug!(
                    agent_id = %self.core.agent_id(),
                    code = report.exit_code(),
                    "Per-call agent exited"
                );
                self.finish_call(report.into_result()).await;
            }
        }
    }

    /// Resolve the turn after flushing the side channel.
    ///
    /// Messages written just before exit are delivered ahead of the
    /// completion.
    async fn finish_call(&mut self, result: Result<(), SessionError>) {
        let Some(call) = self.call.take() else {
            return;
        };
        let LiveCall { handle, relay, .. } = call;
        // A no-op once exited; ends a tool that signalled done but kept running.
        handle.terminate();

        for text in relay.finish().await {
            self.core.deliver(text, DeliverySource::SideChannel);
        }
        remove_done_marker(&self.core.config().done_marker_path()).await;
        self.state = ChannelState::Idle;

        match result {
            Ok(()) => {
                if let Some(turn) = self.core.turn.take() {
                    turn.complete(self.core.events(), None, false, None);
                }
            }
            Err(e) => self.core.fail_turn(e),
        }
    }

    fn stop(&mut self) {
        let had_call = self.call.is_some();
        let had_turn = self.core.is_busy();

        if let Some(mut call) = self.call.take() {
            tracing::debug!(agent_id = %self.core.agent_id(), pid = ?call.handle.pid(), "Stopping per-call agent");
            call.relay.stop();
            call.handle.close_stdin();
            call.handle.terminate();
        }
        self.core.fail_turn(SessionError::Cancelled);
        self.state = ChannelState::Idle;

        if had_call || had_turn {
            self.core.events().push(SessionEvent::Stopped);
        }
    }
}

async fn remove_done_marker(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "Failed to remove done marker: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_args_put_message_last() {
        assert_eq!(launch_args(None, "hi there"), vec!["hi there"]);
        assert_eq!(
            launch_args(Some("fast"), "hello -v"),
            vec!["--model", "fast", "hello -v"]
        );
    }

    #[test]
    fn test_launch_args_guard_dash_messages() {
        assert_eq!(
            launch_args(Some("fast"), "--not-a-flag"),
            vec!["--model", "fast", "--", "--not-a-flag"]
        );
        assert_eq!(launch_args(None, "- item"), vec!["--", "- item"]);
    }
}
