// ABOUTME: Tests for AgentSession state transitions, dispatch order and failure handling.
// ABOUTME: Uses the scripted MockConnector and an in-memory directory behind the resident cache.

use anyhow::bail;
use async_trait::async_trait;
use bihua_agent::testing::RecordingHandler;
use bihua_agent::{InboundMessage, MessageHandler, Replier};
use bihua_core::testing::{MemoryDirectory, MockConnector};
use bihua_core::{
    AgentSession, EntityStateCache, ResidentRecord, SessionConnector, SessionSettings,
    SessionState,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const ALPHA: &str = "@alpha:example.org";

struct Harness {
    _tmp: TempDir,
    connector: MockConnector,
    residents: Arc<EntityStateCache<ResidentRecord>>,
}

fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let directory = MemoryDirectory::new();
    directory.insert_resident(json!({
        "name": ALPHA,
        "displayname": "Alpha",
        "user_type": "bot"
    }));
    let residents = Arc::new(EntityStateCache::new(
        tmp.path(),
        "https://hs.example.org",
        "placeholder",
        Arc::new(directory),
    ));
    Harness {
        _tmp: tmp,
        connector: MockConnector::new(),
        residents,
    }
}

fn settings(join_room: Option<&str>) -> SessionSettings {
    SessionSettings {
        secret: "agent-pw".to_string(),
        join_room: join_room.map(str::to_string),
        sync_timeout: Duration::from_millis(20),
    }
}

async fn session(h: &Harness, handler: Arc<dyn MessageHandler>, join: Option<&str>) -> AgentSession {
    let connection = h.connector.connect(ALPHA).await.unwrap();
    AgentSession::new(ALPHA, connection, handler, Arc::clone(&h.residents), settings(join))
}

fn message(id: &str, sender: &str, body: &str) -> InboundMessage {
    InboundMessage::new(id, sender, "!lobby:example.org", body)
}

#[tokio::test]
async fn test_session_listens_dispatches_and_stops() {
    let h = harness();
    let handler = RecordingHandler::replying("echo: ");
    let session = session(&h, Arc::new(handler.clone()), None).await;
    let mut states = session.subscribe_state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(session.run(cancel.clone()));

    states
        .wait_for(|s| *s == SessionState::Listening)
        .await
        .unwrap();
    let probe = h.connector.probe(ALPHA).unwrap();
    assert_eq!(probe.logins(), vec!["agent-pw".to_string()]);

    assert!(probe.deliver(message("$1", "@bob:example.org", "first")));
    assert!(probe.deliver(message("$2", ALPHA, "my own echo")));
    assert!(probe.deliver(message("$3", "@bob:example.org", "second")));
    tokio::time::timeout(Duration::from_secs(5), handler.wait_for(2))
        .await
        .unwrap();

    let bodies: Vec<String> = handler.events().into_iter().map(|e| e.body).collect();
    assert_eq!(bodies, vec!["first", "second"]);
    assert_eq!(
        probe.sent(),
        vec![
            ("!lobby:example.org".to_string(), "echo: first".to_string()),
            ("!lobby:example.org".to_string(), "echo: second".to_string()),
        ]
    );

    cancel.cancel();
    let final_state = task.await.unwrap();
    assert_eq!(final_state, SessionState::Stopped);
    assert_eq!(*states.borrow(), SessionState::Stopped);
    assert!(probe.logged_out());
}

#[tokio::test]
async fn test_login_records_last_login() {
    let h = harness();
    let session = session(&h, Arc::new(RecordingHandler::new()), None).await;
    let mut states = session.subscribe_state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(session.run(cancel.clone()));

    states
        .wait_for(|s| *s == SessionState::Listening)
        .await
        .unwrap();
    let record = h.residents.load(ALPHA).await.unwrap().found().unwrap();
    assert!(record.last_login_epoch_ms > 0);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_rejected_login_fails_without_listening() {
    let h = harness();
    h.connector.reject_login(ALPHA);
    let handler = RecordingHandler::new();
    let session = session(&h, Arc::new(handler.clone()), Some("!lobby:example.org")).await;
    let states = session.subscribe_state();

    let final_state = session.run(CancellationToken::new()).await;

    match final_state {
        SessionState::Failed(reason) => assert!(reason.starts_with("login"), "got {}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(states.borrow().is_terminal());
    let probe = h.connector.probe(ALPHA).unwrap();
    assert!(probe.joined().is_empty());
    assert!(handler.events().is_empty());
}

#[tokio::test]
async fn test_joins_room_after_login() {
    let h = harness();
    let session = session(&h, Arc::new(RecordingHandler::new()), Some("!lobby:example.org")).await;
    let mut states = session.subscribe_state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(session.run(cancel.clone()));

    states
        .wait_for(|s| *s == SessionState::Listening)
        .await
        .unwrap();
    assert_eq!(
        h.connector.probe(ALPHA).unwrap().joined(),
        vec!["!lobby:example.org".to_string()]
    );

    cancel.cancel();
    assert_eq!(task.await.unwrap(), SessionState::Stopped);
}

#[tokio::test]
async fn test_failed_join_still_logs_out() {
    let h = harness();
    h.connector.reject_join(ALPHA);
    let session = session(&h, Arc::new(RecordingHandler::new()), Some("!lobby:example.org")).await;

    let state = session.run(CancellationToken::new()).await;

    assert!(matches!(state, SessionState::Failed(ref reason) if reason.starts_with("join")));
    assert!(h.connector.probe(ALPHA).unwrap().logged_out());
}

#[tokio::test]
async fn test_sync_failure_fails_session() {
    let h = harness();
    let session = session(&h, Arc::new(RecordingHandler::new()), None).await;
    let mut states = session.subscribe_state();
    let task = tokio::spawn(session.run(CancellationToken::new()));

    states
        .wait_for(|s| *s == SessionState::Listening)
        .await
        .unwrap();
    h.connector.probe(ALPHA).unwrap().break_sync();

    match task.await.unwrap() {
        SessionState::Failed(reason) => assert!(reason.starts_with("sync"), "got {}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
}

/// Fails on messages saying "boom", records the rest
#[derive(Clone, Default)]
struct FlakyHandler {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn on_message(&self, event: &InboundMessage, _replier: &dyn Replier) -> anyhow::Result<()> {
        if event.body == "boom" {
            bail!("handler exploded");
        }
        self.seen.lock().unwrap().push(event.body.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_handler_error_does_not_stop_session() {
    let h = harness();
    let handler = FlakyHandler::default();
    let session = session(&h, Arc::new(handler.clone()), None).await;
    let mut states = session.subscribe_state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(session.run(cancel.clone()));

    states
        .wait_for(|s| *s == SessionState::Listening)
        .await
        .unwrap();
    let probe = h.connector.probe(ALPHA).unwrap();
    probe.deliver(message("$1", "@bob:example.org", "boom"));
    probe.deliver(message("$2", "@bob:example.org", "still here"));

    tokio::time::timeout(Duration::from_secs(5), async {
        while handler.seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(*states.borrow(), SessionState::Listening);
    assert_eq!(*handler.seen.lock().unwrap(), vec!["still here".to_string()]);

    cancel.cancel();
    assert_eq!(task.await.unwrap(), SessionState::Stopped);
}
