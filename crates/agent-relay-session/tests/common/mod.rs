//! Fake agents and helpers shared by the integration tests.

#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use agent_relay_core::{AgentConfig, ProtocolVariant};
use agent_relay_session::{AgentSession, ChannelStatus};
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Scratch space for one fake agent.
pub struct Sandbox {
    pub dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        init_tracing();
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write `body` as a shell script and return a command line running it.
    pub fn script(&self, body: &str) -> String {
        let path = self.path("agent.sh");
        std::fs::write(&path, body).unwrap();
        format!("/bin/sh {}", quote(&path))
    }

    /// Config for a fake agent with fast polling and a short stop grace.
    pub fn config(&self, protocol: ProtocolVariant, command: String) -> AgentConfig {
        AgentConfig::new("worker-1", protocol, command, self.dir.path())
            .with_state_dir(self.path("state"))
            .with_env("ARGS_FILE", self.path("args").display().to_string())
            .with_env("INPUT_FILE", self.path("input").display().to_string())
            .with_poll_interval(Duration::from_millis(20))
            .with_stop_grace(Duration::from_millis(500))
    }

    /// Arguments of the most recent launch, one per entry.
    pub fn last_args(&self) -> Vec<String> {
        read_lines(&self.path("args"))
    }

    /// Request lines the fake agent read from stdin.
    pub fn inputs(&self) -> Vec<String> {
        read_lines(&self.path("input"))
    }
}

fn quote(path: &Path) -> String {
    shlex::try_quote(path.to_str().unwrap()).unwrap().into_owned()
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll the session until `predicate` holds.
pub async fn wait_for_status(session: &AgentSession, predicate: impl Fn(&ChannelStatus) -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if predicate(&session.status().await.unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never reached the expected state");
}
