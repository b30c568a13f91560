//! Long-lived stream-json session channel.

use agent_relay_core::{DeliverySource, SessionError, SessionEvent};
use agent_relay_process::{ExitReport, ProcessEvent, ProcessEvents, ProcessHandle, ProcessSupervisor};
use tokio::sync::mpsc;

use super::protocol::{
    ContentBlock, RecordKind, STREAM_JSON_FLAGS, StreamRecord, TurnResult, encode_user_message,
    launch_args,
};
use crate::{
    channel::{ChannelCore, ChannelDeps, ChannelState, Command, PendingTurn, reject_busy},
    command::CommandBuilder,
    framing::FrameReassembler,
    log_sink::LogSink,
};

struct LiveProcess {
    handle: ProcessHandle,
    events: ProcessEvents,
    frames: FrameReassembler,
}

enum Step {
    Command(Command),
    CommandsClosed,
    Process(ProcessEvent),
    ProcessGone,
}

/// Drives one persistent agent process across many turns.
pub(crate) struct PersistentChannel {
    core: ChannelCore,
    supervisor: ProcessSupervisor,
    log: LogSink,
    process: Option<LiveProcess>,
    state: ChannelState,
}

async fn recv_event(process: &mut Option<LiveProcess>) -> Option<ProcessEvent> {
    match process {
        Some(live) => live.events.recv().await,
        None => std::future::pending().await,
    }
}

impl PersistentChannel {
    pub(crate) fn new(deps: ChannelDeps) -> Self {
        let supervisor = ProcessSupervisor::new(deps.config.stop_grace());
        Self {
            core: ChannelCore::new(deps),
            supervisor,
            log: LogSink::discard(),
            process: None,
            state: ChannelState::Idle,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.log = LogSink::open_or_discard(&self.core.config().log_path()).await;
        tracing::debug!(agent_id = %self.core.agent_id(), "Persistent channel started");

        loop {
            let step = tokio::select! {
                command = commands.recv() => command.map_or(Step::CommandsClosed, Step::Command),
                event = recv_event(&mut self.process) => event.map_or(Step::ProcessGone, Step::Process),
            };

            match step {
                Step::Command(command) => self.handle_command(command).await,
                Step::Process(event) => self.handle_process_event(event).await,
                Step::ProcessGone => {
                    tracing::warn!(agent_id = %self.core.agent_id(), "Process events ended without an exit report");
                    self.process = None;
                    self.state = ChannelState::Dead;
                    self.core.fail_turn(SessionError::abnormal_exit(-1, "process event stream closed"));
                }
                Step::CommandsClosed => break,
            }
        }

        self.stop();
        tracing::debug!(agent_id = %self.core.agent_id(), "Persistent channel closed");
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
                self.core.restore_token(token);
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.core.status(self.state));
            }
        }
    }

    async fn start_turn(&mut self, turn: PendingTurn, message: String) {
        if self.process.is_none() {
            if let Err(e) = self.launch().await {
                self.state = ChannelState::Idle;
                turn.fail(self.core.events(), e);
                return;
            }
        }

        let text = self.core.compose_message(&message).await;
        let record = encode_user_message(&text);
        let Some(live) = self.process.as_mut() else {
            turn.fail(self.core.events(), SessionError::Closed);
            return;
        };

        if let Err(e) = live.handle.write_line(&record) {
            tracing::warn!(agent_id = %self.core.agent_id(), "Failed to write request: {e}");
            live.handle.terminate();
            self.process = None;
            self.state = ChannelState::Dead;
            turn.fail(self.core.events(), SessionError::Transport(e.to_string()));
            return;
        }

        tracing::debug!(agent_id = %self.core.agent_id(), turn = %turn.id(), "Turn started");
        self.core.begin_turn(turn, message);
        self.state = ChannelState::TurnInFlight;
    }

    async fn launch(&mut self) -> Result<(), SessionError> {
        self.state = ChannelState::Starting;
        let config = self.core.config();
        let parts = CommandBuilder::from_config(config)
            .extend_params(STREAM_JSON_FLAGS.iter().copied())
            .build(&launch_args(config.model.as_deref(), self.core.token.as_deref()))?;
        let spec = parts
            .into_launch_spec(&config.working_dir)
            .envs(config.env.clone());

        tracing::debug!(
            agent_id = %self.core.agent_id(),
            program = %spec.program,
            args = ?spec.args,
            "Launching persistent agent"
        );
        let (handle, events) = self.supervisor.launch(&spec).await?;
        self.core
            .events()
            .push(SessionEvent::ProcessStarted { pid: handle.pid() });
        self.process = Some(LiveProcess {
            handle,
            events,
            frames: FrameReassembler::new(),
        });
        self.state = ChannelState::Ready;
        Ok(())
    }

    async fn handle_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout(chunk) => {
                let Some(live) = self.process.as_mut() else {
                    return;
                };
                let records: Vec<String> = live.frames.feed(&chunk).collect();
                for line in records {
                    self.handle_record(&line).await;
                }
            }
            ProcessEvent::Stderr(chunk) => {
                tracing::trace!(agent_id = %self.core.agent_id(), "stderr: {}", String::from_utf8_lossy(&chunk));
                self.log.log_chunk("stderr", &chunk).await;
            }
            ProcessEvent::InputFailed(e) => {
                tracing::warn!(agent_id = %self.core.agent_id(), "Failed to write request: {e}");
                if let Some(live) = self.process.take() {
                    live.handle.terminate();
                }
                self.state = ChannelState::Dead;
                self.core.fail_turn(SessionError::Transport(e));
            }
            ProcessEvent::Exited(report) => {
                let trailing = self
                    .process
                    .as_mut()
                    .and_then(|live| live.frames.finish());
                if let Some(line) = trailing {
                    self.handle_record(&line).await;
                }
                self.on_exit(report);
            }
        }
    }

    async fn handle_record(&mut self, line: &str) {
        let record = match StreamRecord::decode(line) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(agent_id = %self.core.agent_id(), "Skipping malformed record: {e}");
                self.log.log_chunk("invalid", line.as_bytes()).await;
                return;
            }
        };
        tracing::trace!(agent_id = %self.core.agent_id(), ?record, "Record");

        if let Some(token) = &record.session_id {
            self.core.update_token(token).await;
        }

        match record.kind {
            RecordKind::Assistant(blocks) => self.handle_assistant(blocks),
            RecordKind::Result(result) => self.finish_turn(result),
            RecordKind::System { .. } | RecordKind::Other(_) => {
                self.log.log_chunk("record", line.as_bytes()).await;
            }
        }
    }

    fn handle_assistant(&mut self, blocks: Vec<ContentBlock>) {
        let policy = self.core.config().delivery.clone();
        for block in blocks {
            match block {
                ContentBlock::ToolUse {
                    name,
                    message: Some(message),
                } if policy.is_chat_tool(&name) => {
                    self.core.deliver(message, DeliverySource::ChatTool);
                }
                ContentBlock::Text(text) if policy.forward_narrative => {
                    self.core.deliver(text, DeliverySource::Narrative);
                }
                _ => {}
            }
        }
    }

    fn finish_turn(&mut self, result: TurnResult) {
        self.core.record_usage(&result.usage);
        let Some(mut turn) = self.core.turn.take() else {
            tracing::debug!(agent_id = %self.core.agent_id(), "Turn result with no turn in flight");
            return;
        };

        if turn.deliveries() == 0 {
            if let Some(summary) = result.summary.as_ref().filter(|s| !s.trim().is_empty()) {
                turn.deliver(self.core.events(), summary.clone(), DeliverySource::Summary);
            }
        }

        tracing::debug!(agent_id = %self.core.agent_id(), turn = %turn.id(), "Turn completed");
        turn.complete(
            self.core.events(),
            result.summary,
            result.is_error,
            Some(result.usage),
        );
        self.state = ChannelState::Ready;
    }

    fn on_exit(&mut self, report: ExitReport) {
        self.process = None;
        self.core
            .events()
            .push(SessionEvent::ProcessExited { code: Some(report.exit_code()) });
        tracing::debug!(
            agent_id = %self.core.agent_id(),
            code = report.exit_code(),
            stderr = %report.stderr_tail,
            "Persistent agent exited"
        );

        self.state = ChannelState::Dead;
        let error = match report.clone().into_result() {
            Err(e) => e,
            Ok(()) => SessionError::abnormal_exit(0, report.stderr_tail),
        };
        self.core.fail_turn(error);
    }

    /// Close stdin, request termination and cancel the in-flight turn.
    fn stop(&mut self) {
        let had_process = self.process.is_some();
        let had_turn = self.core.is_busy();

        if let Some(mut live) = self.process.take() {
            tracing::debug!(agent_id = %self.core.agent_id(), pid = ?live.handle.pid(), "Stopping persistent agent");
            live.handle.close_stdin();
            live.handle.terminate();
        }
        self.core.fail_turn(SessionError::Cancelled);
        self.state = ChannelState::Idle;

        if had_process || had_turn {
            self.core.events().push(SessionEvent::Stopped);
        }
    }
}
