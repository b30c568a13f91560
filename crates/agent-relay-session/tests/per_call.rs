#![cfg(unix)]

mod common;

use std::{sync::Arc, time::Duration};

use agent_relay_core::{DeliverySource, ProtocolVariant, SessionError, StaticBootstrap};
use agent_relay_session::{AgentSession, ChannelState};
use common::{Sandbox, TIMEOUT, wait_for_status};

/// Per-call agent. Behaviour is picked by the message, its last argument.
const AGENT: &str = r#"
printf '%s\n' "$@" > "$ARGS_FILE"
for message; do :; done
case "$message" in
  *kill*) kill -9 $$ ;;
  *fail*) echo "bad things" >&2; exit 2 ;;
  *hang*) sleep 30 ;;
  *stdin*)
    cat > /dev/null
    printf '{"content":"read all input"}\n' >> "$AGENT_RELAY_OUTBOX"
    ;;
  *done*)
    printf '{"content":"working"}\n' >> "$AGENT_RELAY_OUTBOX"
    touch "$AGENT_RELAY_DONE_FILE"
    sleep 30
    ;;
  *)
    printf '{"content":"first","ts":1}\n' >> "$AGENT_RELAY_OUTBOX"
    echo "noise on stdout"
    printf 'not json\n{"content":"second"}\n' >> "$AGENT_RELAY_OUTBOX"
    ;;
esac
"#;

async fn open(sandbox: &Sandbox) -> AgentSession {
    let config = sandbox.config(ProtocolVariant::PerCall, sandbox.script(AGENT));
    AgentSession::builder(config).open().await.unwrap()
}

#[tokio::test]
async fn test_side_channel_messages_are_delivered_in_order() {
    let sandbox = Sandbox::new();
    let session = open(&sandbox).await;

    let (deliveries, outcome) = tokio::time::timeout(TIMEOUT, session.send_collect("hello"))
        .await
        .unwrap()
        .unwrap();

    let texts: Vec<&str> = deliveries.iter().map(|d| d.text.as_str()).collect();
    assert_eq!(texts, vec!["first", "second"]);
    assert!(deliveries.iter().all(|d| d.source == DeliverySource::SideChannel));
    assert_eq!(outcome.deliveries, 2);
    assert_eq!(sandbox.last_args().last().map(String::as_str), Some("hello"));

    let log = std::fs::read_to_string(session.config().log_path()).unwrap();
    assert!(log.contains("[stdout] noise on stdout"));

    let status = session.status().await.unwrap();
    assert_eq!(status.state, ChannelState::Idle);
    assert_eq!(status.messages_sent, 1);
}

#[tokio::test]
async fn test_earlier_messages_are_not_replayed() {
    let sandbox = Sandbox::new();
    let session = open(&sandbox).await;

    for _ in 0..2 {
        let (deliveries, _) = tokio::time::timeout(TIMEOUT, session.send_collect("hello"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deliveries.len(), 2);
    }
}

#[tokio::test]
async fn test_killed_process_is_abnormal_exit() {
    let sandbox = Sandbox::new();
    let session = open(&sandbox).await;

    let (deliveries, completion) = session.send_streaming("kill");
    let err = tokio::time::timeout(TIMEOUT, completion)
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SessionError::AbnormalExit { code: 137, .. }));

    let deliveries: Vec<_> = futures::StreamExt::collect(deliveries).await;
    assert!(deliveries.is_empty());
}

#[tokio::test]
async fn test_failure_carries_stderr() {
    let sandbox = Sandbox::new();
    let session = open(&sandbox).await;

    let err = tokio::time::timeout(TIMEOUT, session.send("fail", |_| {}))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err, SessionError::abnormal_exit(2, "bad things"));
}

#[tokio::test]
async fn test_tool_reading_stdin_sees_end_of_input() {
    let sandbox = Sandbox::new();
    let session = open(&sandbox).await;

    let (deliveries, _) = tokio::time::timeout(TIMEOUT, session.send_collect("stdin"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].text, "read all input");
}

#[tokio::test]
async fn test_dash_message_is_not_an_option() {
    let sandbox = Sandbox::new();
    let session = open(&sandbox).await;

    tokio::time::timeout(TIMEOUT, session.send("--hello", |_| {}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sandbox.last_args(), vec!["--", "--hello"]);
}

#[tokio::test]
async fn test_done_marker_completes_turn_early() {
    let sandbox = Sandbox::new();
    let session = open(&sandbox).await;

    let started = std::time::Instant::now();
    let (deliveries, _) = tokio::time::timeout(TIMEOUT, session.send_collect("done"))
        .await
        .unwrap()
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].text, "working");
    assert!(!session.config().done_marker_path().exists());
}

#[tokio::test]
async fn test_concurrent_send_and_stop() {
    let sandbox = Sandbox::new();
    let session = open(&sandbox).await;

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.send("hang", |_| {}).await }
    });
    wait_for_status(&session, |s| s.in_flight).await;

    let second = session.send("hello", |_| {}).await;
    assert_eq!(second.unwrap_err(), SessionError::ConcurrencyViolation);

    session.stop().await.unwrap();
    session.stop().await.unwrap();
    let first = tokio::time::timeout(TIMEOUT, first).await.unwrap().unwrap();
    assert_eq!(first.unwrap_err(), SessionError::Cancelled);
    assert_eq!(session.status().await.unwrap().state, ChannelState::Idle);
}

#[tokio::test]
async fn test_bootstrap_on_first_call_only() {
    let sandbox = Sandbox::new();
    let config = sandbox.config(ProtocolVariant::PerCall, sandbox.script(AGENT));
    let session = AgentSession::builder(config)
        .bootstrap(Arc::new(StaticBootstrap("ROLE: tester".into())))
        .open()
        .await
        .unwrap();

    session.send("hello", |_| {}).await.unwrap();
    assert_eq!(sandbox.last_args()[0], "ROLE: tester");

    session.send("hello", |_| {}).await.unwrap();
    assert_eq!(sandbox.last_args(), vec!["hello"]);
}
