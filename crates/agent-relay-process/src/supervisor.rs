//! Child process supervision.
//!
//! [`ProcessSupervisor::launch`] starts one agent process in its own process
//! group and returns a [`ProcessHandle`] for writing to stdin and stopping the
//! process, plus a [`ProcessEvents`] receiver delivering raw stdout/stderr
//! chunks followed by exactly one [`ProcessEvent::Exited`].
//!
//! A background waiter task owns the child. It reaps the process, waits for
//! both output readers to drain and only then reports the exit, so every
//! output chunk is observed before the exit event.
//!
//! Stdin is owned by a writer task fed from a queue. Writing never blocks the
//! caller, even when the child stops reading and the pipe fills up.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use agent_relay_core::SessionError;
use bytes::Bytes;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, Command},
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::shell::{NON_INTERACTIVE_ENV, augmented_path, resolve_executable_path};

/// Default grace period between a cooperative stop and a forced kill.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// How much trailing stderr is kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Process error.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Executable not found: {0}")]
    NotInstalled(String),
    #[error("Spawn failed: {0}")]
    LaunchFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProcessError> for SessionError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NotInstalled(msg) => Self::NotInstalled(msg),
            ProcessError::LaunchFailed(msg) => Self::LaunchFailed(msg),
            ProcessError::Io(e) => Self::Transport(e.to_string()),
        }
    }
}

/// Everything needed to start one agent process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
}

impl LaunchSpec {
    /// Create a launch spec with no extra environment.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            env: HashMap::new(),
            cwd: cwd.into(),
        }
    }

    /// Add environment variables.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

/// Output or termination of a supervised process.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Raw stdout bytes, chunked as they arrived.
    Stdout(Bytes),
    /// Raw stderr bytes, chunked as they arrived.
    Stderr(Bytes),
    /// Writing a queued line to stdin failed; later lines are dropped.
    InputFailed(String),
    /// The process is gone. Always the last event.
    Exited(ExitReport),
}

/// Receiver side of a process's event stream.
pub type ProcessEvents = mpsc::UnboundedReceiver<ProcessEvent>;

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if any (unix only).
    pub signal: Option<i32>,
    /// Whether `terminate` was requested before the exit.
    pub stop_requested: bool,
    /// Trailing stderr output.
    pub stderr_tail: String,
    /// Wall time the process ran.
    pub runtime: Duration,
}

impl ExitReport {
    /// Whether the process exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Shell-style exit code: the code, or `128 + signal` when killed.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.code
            .or_else(|| self.signal.map(|s| 128 + s))
            .unwrap_or(-1)
    }

    /// Classify the exit as a turn result.
    ///
    /// A requested stop is [`SessionError::Cancelled`]; any other non-zero
    /// exit is [`SessionError::AbnormalExit`] carrying the stderr tail.
    ///
    /// # Errors
    /// Returns the failure kind for anything but a clean exit.
    pub fn into_result(self) -> Result<(), SessionError> {
        if self.stop_requested {
            Err(SessionError::Cancelled)
        } else if self.success() {
            Ok(())
        } else {
            Err(SessionError::abnormal_exit(self.exit_code(), self.stderr_tail))
        }
    }
}

/// Launches agent processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    stop_grace: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_GRACE)
    }
}

impl ProcessSupervisor {
    /// Create a supervisor with the given cooperative-stop grace period.
    #[must_use]
    pub const fn new(stop_grace: Duration) -> Self {
        Self { stop_grace }
    }

    /// Launch a process.
    ///
    /// The child runs in its own process group with piped stdio, the
    /// augmented search path and terminal features suppressed.
    ///
    /// # Errors
    /// Returns [`ProcessError::NotInstalled`] if the executable cannot be
    /// resolved and [`ProcessError::LaunchFailed`] if the spawn fails. No
    /// process is left behind on error.
    pub async fn launch(
        &self,
        spec: &LaunchSpec,
    ) -> Result<(ProcessHandle, ProcessEvents), ProcessError> {
        let executable = resolve_executable_path(&spec.program)
            .await
            .ok_or_else(|| ProcessError::NotInstalled(spec.program.clone()))?;

        let mut cmd = Command::new(&executable);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .env("PATH", augmented_path())
            .envs(NON_INTERACTIVE_ENV.iter().copied())
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.group_spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound && !spec.cwd.exists() {
                ProcessError::LaunchFailed(format!(
                    "working directory does not exist: {}",
                    spec.cwd.display()
                ))
            } else if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::NotInstalled(executable.display().to_string())
            } else {
                ProcessError::LaunchFailed(format!("{}: {e}", executable.display()))
            }
        })?;

        let pid = child.id();
        let inner = child.inner();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (inner.stdin.take(), inner.stdout.take(), inner.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(ProcessError::LaunchFailed(
                "child stdio handles unavailable".to_string(),
            ));
        };

        tracing::debug!(?pid, program = %executable.display(), "Launched agent process");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let stop_requested = Arc::new(AtomicBool::new(false));
        let started_at = Instant::now();

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let stdin_task = spawn_writer(stdin, input_rx, event_tx.clone());
        let stdout_task = spawn_reader(stdout, event_tx.clone(), ProcessEvent::Stdout, false);
        let stderr_task = spawn_reader(stderr, event_tx.clone(), ProcessEvent::Stderr, true);

        tokio::spawn(wait_for_exit(Waiter {
            child,
            control: control_rx,
            events: event_tx,
            exit: exit_tx,
            stop_requested: Arc::clone(&stop_requested),
            stdin_task,
            stdout_task,
            stderr_task,
            stop_grace: self.stop_grace,
            started_at,
        }));

        Ok((
            ProcessHandle {
                pid,
                started_at,
                input: Some(input_tx),
                control: control_tx,
                exit: exit_rx,
                stop_requested,
            },
            event_rx,
        ))
    }
}

/// Handle to one supervised process.
///
/// Dropping the handle requests a cooperative stop if the process is still
/// running.
pub struct ProcessHandle {
    pid: Option<u32>,
    started_at: Instant,
    input: Option<mpsc::UnboundedSender<String>>,
    control: mpsc::UnboundedSender<()>,
    exit: watch::Receiver<Option<ExitReport>>,
    stop_requested: Arc<AtomicBool>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// OS process id, if the OS reported one.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// When the process was started.
    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Whether the process has not been observed to exit yet.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Queue one line for stdin; a newline is appended.
    ///
    /// Returns once the line is queued. A later write failure is reported as
    /// [`ProcessEvent::InputFailed`].
    ///
    /// # Errors
    /// Returns `BrokenPipe` once the process has exited, stdin was closed or
    /// an earlier write failed.
    pub fn write_line(&self, line: &str) -> std::io::Result<()> {
        let broken = |msg: &str| std::io::Error::new(std::io::ErrorKind::BrokenPipe, msg.to_string());
        if !self.is_alive() {
            return Err(broken("process has exited"));
        }
        self.input
            .as_ref()
            .ok_or_else(|| broken("stdin is closed"))?
            .send(line.to_string())
            .map_err(|_| broken("stdin writer has stopped"))
    }

    /// Close stdin once already queued lines are written.
    pub fn close_stdin(&mut self) {
        self.input = None;
    }

    /// Request a cooperative stop without waiting for it.
    ///
    /// The group gets SIGTERM (a kill on non-unix platforms) and is killed
    /// outright if it is still running after the grace period.
    pub fn terminate(&self) {
        if !self.is_alive() {
            return;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.control.send(());
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> ExitReport {
        loop {
            if let Some(report) = self.exit.borrow_and_update().clone() {
                return report;
            }
            if self.exit.changed().await.is_err() {
                // Waiter is gone; the last value is final.
                return self.exit.borrow().clone().unwrap_or_else(|| ExitReport {
                    code: None,
                    signal: None,
                    stop_requested: self.stop_requested.load(Ordering::SeqCst),
                    stderr_tail: String::new(),
                    runtime: self.started_at.elapsed(),
                });
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.input = None;
        self.terminate();
    }
}

fn spawn_writer(
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            let written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                tracing::debug!("Process input write failed: {e}");
                let _ = events.send(ProcessEvent::InputFailed(e.to_string()));
                return;
            }
        }
    })
}

fn spawn_reader<R>(
    mut source: R,
    events: mpsc::UnboundedSender<ProcessEvent>,
    wrap: fn(Bytes) -> ProcessEvent,
    keep_tail: bool,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut tail = Vec::new();
        loop {
            match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if keep_tail {
                        tail.extend_from_slice(&chunk);
                        if tail.len() > STDERR_TAIL_BYTES {
                            tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                        }
                    }
                    // Keep draining even if nobody listens, so the child never blocks on a full pipe.
                    let _ = events.send(wrap(chunk));
                }
                Err(e) => {
                    tracing::debug!("Process output read failed: {e}");
                    break;
                }
            }
        }
        String::from_utf8_lossy(&tail).trim().to_string()
    })
}

struct Waiter {
    child: AsyncGroupChild,
    control: mpsc::UnboundedReceiver<()>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    exit: watch::Sender<Option<ExitReport>>,
    stop_requested: Arc<AtomicBool>,
    stdin_task: JoinHandle<()>,
    stdout_task: JoinHandle<String>,
    stderr_task: JoinHandle<String>,
    stop_grace: Duration,
    started_at: Instant,
}

enum WaitStep {
    Terminate,
    ControlClosed,
    GraceElapsed,
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_exit(mut w: Waiter) {
    let pid = w.child.id();
    let mut kill_at: Option<tokio::time::Instant> = None;
    let mut control_open = true;

    let status = loop {
        let step = tokio::select! {
            status = w.child.wait() => break status,
            request = w.control.recv(), if control_open => match request {
                Some(()) => WaitStep::Terminate,
                None => WaitStep::ControlClosed,
            },
            () = sleep_until_opt(kill_at) => WaitStep::GraceElapsed,
        };

        match step {
            WaitStep::Terminate => {
                if kill_at.is_none() {
                    cooperative_stop(&mut w.child);
                    kill_at = Some(tokio::time::Instant::now() + w.stop_grace);
                }
            }
            WaitStep::GraceElapsed => {
                tracing::debug!(?pid, "Killing agent process group");
                if let Err(e) = w.child.start_kill() {
                    tracing::debug!(?pid, "Kill failed: {e}");
                }
                kill_at = None;
            }
            WaitStep::ControlClosed => {
                control_open = false;
            }
        }
    };

    // Input left in the queue has no reader any more.
    w.stdin_task.abort();
    let _ = w.stdin_task.await;
    drain(w.stdout_task, w.stop_grace).await;
    let stderr_tail = drain(w.stderr_task, w.stop_grace).await;

    let (code, signal) = match &status {
        Ok(status) => (status.code(), exit_signal(status)),
        Err(e) => {
            tracing::error!(?pid, "Failed to wait for agent process: {e}");
            (None, None)
        }
    };
    let report = ExitReport {
        code,
        signal,
        stop_requested: w.stop_requested.load(Ordering::SeqCst),
        stderr_tail,
        runtime: w.started_at.elapsed(),
    };
    tracing::debug!(?pid, ?code, ?signal, stop_requested = report.stop_requested, "Agent process exited");

    let _ = w.events.send(ProcessEvent::Exited(report.clone()));
    let _ = w.exit.send(Some(report));
}

/// Await a reader task, giving up after `grace` (a grandchild may hold the pipe).
async fn drain(task: JoinHandle<String>, grace: Duration) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

#[cfg(unix)]
fn cooperative_stop(child: &mut AsyncGroupChild) {
    use command_group::{Signal, UnixChildExt};

    if let Err(e) = child.signal(Signal::SIGTERM) {
        tracing::debug!("SIGTERM failed, killing instead: {e}");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn cooperative_stop(child: &mut AsyncGroupChild) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new(
            "/bin/sh",
            vec!["-c".to_string(), script.to_string()],
            std::env::temp_dir(),
        )
    }

    async fn collect(mut events: ProcessEvents) -> (String, String, ExitReport) {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        loop {
            match events.recv().await.expect("events ended without exit") {
                ProcessEvent::Stdout(b) => out.extend_from_slice(&b),
                ProcessEvent::Stderr(b) => err.extend_from_slice(&b),
                ProcessEvent::InputFailed(e) => panic!("unexpected input failure: {e}"),
                ProcessEvent::Exited(report) => {
                    return (
                        String::from_utf8(out).unwrap(),
                        String::from_utf8(err).unwrap(),
                        report,
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_missing_executable_is_not_installed() {
        let supervisor = ProcessSupervisor::default();
        let spec = LaunchSpec::new("definitely-not-an-agent-binary-xyz", vec![], "/");
        let err = tokio_test::assert_err!(supervisor.launch(&spec).await);
        assert!(matches!(err, ProcessError::NotInstalled(_)));
        assert!(matches!(SessionError::from(err), SessionError::NotInstalled(_)));
    }

    #[tokio::test]
    async fn test_output_precedes_exit() {
        let supervisor = ProcessSupervisor::default();
        let (_handle, events) = supervisor
            .launch(&sh("printf 'one\\ntwo\\n'; echo oops >&2; exit 3"))
            .await
            .unwrap();

        let (out, err, report) = collect(events).await;
        assert_eq!(out, "one\ntwo\n");
        assert_eq!(err, "oops\n");
        assert_eq!(report.code, Some(3));
        assert_eq!(report.stderr_tail, "oops");
        assert_eq!(
            report.into_result(),
            Err(SessionError::abnormal_exit(3, "oops"))
        );
    }

    #[tokio::test]
    async fn test_stdin_roundtrip_and_env() {
        let supervisor = ProcessSupervisor::default();
        let spec = sh("read line; echo \"$line:$TERM:$RELAY_TEST\"").envs([("RELAY_TEST", "yes")]);
        let (handle, events) = supervisor.launch(&spec).await.unwrap();
        handle.write_line("ping").unwrap();

        let (out, _, report) = collect(events).await;
        assert_eq!(out, "ping:dumb:yes\n");
        assert!(report.success());
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_terminate_is_cooperative_stop() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(500));
        let (mut handle, _events) = supervisor.launch(&sh("sleep 30")).await.unwrap();
        assert!(handle.is_alive());

        handle.terminate();
        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(report.stop_requested);
        assert_eq!(report.into_result(), Err(SessionError::Cancelled));

        let err = handle.write_line("late").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_unread_input_does_not_block_terminate() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(500));
        let (mut handle, _events) = supervisor.launch(&sh("sleep 30")).await.unwrap();

        // Far more than a pipe buffer holds.
        handle.write_line(&"x".repeat(1024 * 1024)).unwrap();
        handle.write_line("more").unwrap();

        handle.terminate();
        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(report.into_result(), Err(SessionError::Cancelled));
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(200));
        let (mut handle, mut events) = supervisor
            .launch(&sh("exec 0<&-; echo closed; sleep 30"))
            .await
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(first, Some(ProcessEvent::Stdout(_))));

        handle.write_line("nobody reads this").unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(next, Some(ProcessEvent::InputFailed(_))));

        handle.close_stdin();
        let err = handle.write_line("closed").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_kill() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(200));
        let (mut handle, _events) = supervisor
            .launch(&sh("trap '' TERM; sleep 30"))
            .await
            .unwrap();

        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.terminate();
        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(report.signal, Some(9));
        assert_eq!(report.exit_code(), 137);
    }

    #[test]
    fn test_exit_code_from_signal() {
        let report = ExitReport {
            code: None,
            signal: Some(9),
            stop_requested: false,
            stderr_tail: "killed".into(),
            runtime: Duration::ZERO,
        };
        assert_eq!(report.exit_code(), 137);
        assert_eq!(
            report.into_result(),
            Err(SessionError::abnormal_exit(137, "killed"))
        );
    }
}
