//! End-to-end integration tests for the Dialoguard turn pipeline.
//!
//! These drive the HTTP gateway against a scripted upstream and a real
//! SQLite store on disk, from request to committed rows.

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use dialoguard_agent::TurnPipeline;
use dialoguard_agent::testing::{
    ScriptedProvider, StreamEnd, StreamScript, envelope_asking_about, envelope_reply,
};
use dialoguard_config::{AppConfig, KeywordEntry};
use dialoguard_core::error::{NotifyError, ProviderError};
use dialoguard_core::{ConversationId, ConversationStore, Notifier, Role};
use dialoguard_store::SqliteStore;
use http_body_util::BodyExt;
use tower::ServiceExt;

// ── Fixtures ─────────────────────────────────────────────────────────────

/// Records every delivery attempt; recipients containing "down" fail.
#[derive(Default)]
struct RecordingNotifier {
    attempts: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, recipient: &str, _subject: &str, _body: &str) -> Result<(), NotifyError> {
        self.attempts.lock().unwrap().push(recipient.to_string());
        if recipient.contains("down") {
            return Err(NotifyError::DeliveryFailed {
                recipient: recipient.into(),
                reason: "503".into(),
            });
        }
        Ok(())
    }
}

struct Harness {
    app: Router,
    provider: Arc<ScriptedProvider>,
    notifier: Arc<RecordingNotifier>,
    store: Arc<SqliteStore>,
    dir: tempfile::TempDir,
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.instructions.base = r#"You help people prepare for a wellbeing check-in.
[TOPIC:id="t1" name="Sleep" keywords="sleep,rest"]
[TOPIC:id="t2" name="Nutrition" keywords="food,meals"]"#
        .into();
    config.safety.keywords = vec![KeywordEntry::Phrase("harm myself".into())];
    config.safety.recipients = vec![
        "oncall@example.org".into(),
        "down@example.org".into(),
        "lead@example.org".into(),
    ];
    config
}

async fn harness(provider: ScriptedProvider) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("dialoguard.db")).await.unwrap());
    let provider = Arc::new(provider);
    let notifier = Arc::new(RecordingNotifier::default());

    let pipeline = TurnPipeline::new(&config(), provider.clone(), store.clone(), notifier.clone()).unwrap();
    let app = dialoguard_gateway::build_router(Arc::new(pipeline));

    Harness {
        app,
        provider,
        notifier,
        store,
        dir,
    }
}

fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn send_text(app: &Router, request: Request<Body>) -> String {
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn conversation_of(json: &serde_json::Value) -> String {
    json["conversation_id"].as_str().unwrap().to_string()
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn blocking_turn_persists_across_reopen() {
    let h = harness(ScriptedProvider::with_replies([envelope_reply("Good morning!")])).await;

    let (status, json) = send(&h.app, post("/v1/chat", serde_json::json!({"user_id": "ana", "message": "Morning"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["text"], "Good morning!");
    let conversation_id = ConversationId::from(conversation_of(&json).as_str());

    drop(h.app);
    let reopened = SqliteStore::open(&h.dir.path().join("dialoguard.db")).await.unwrap();
    let messages = reopened.get_messages(&conversation_id, 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].content, "Good morning!");
    assert!(messages[1].valid);
    assert!(messages[1].context_sent.is_some());
}

#[tokio::test]
async fn preflight_emergency_blocks_and_notifies_everyone() {
    let h = harness(ScriptedProvider::new()).await;

    let (status, json) = send(
        &h.app,
        post("/v1/chat", serde_json::json!({"user_id": "ana", "message": "I want to harm myself today"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["blocked"], true);
    assert_eq!(json["safety"]["danger_level"], "emergency");
    assert_eq!(h.provider.complete_calls(), 0);

    // Every recipient attempted even though one failed
    assert_eq!(
        *h.notifier.attempts.lock().unwrap(),
        vec!["oncall@example.org", "down@example.org", "lead@example.org"]
    );

    let conversation_id = conversation_of(&json);
    let stored = h
        .store
        .get_conversation(&ConversationId::from(conversation_id.as_str()))
        .await
        .unwrap()
        .unwrap();
    assert!(stored.blocked);

    let (status, json) = send(
        &h.app,
        post(
            "/v1/chat",
            serde_json::json!({"user_id": "ana", "conversation_id": conversation_id, "message": "hello"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["message"], config().safety.supportive_message);
    // The block was not re-applied, so nobody was notified twice
    assert_eq!(h.notifier.attempts.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn progress_reaches_completion_through_confirmations() {
    let h = harness(ScriptedProvider::with_replies([envelope_asking_about("How do you sleep?", "t1")])).await;

    let (_, json) = send(&h.app, post("/v1/chat", serde_json::json!({"user_id": "ana", "message": "Hi"}))).await;
    let conversation_id = conversation_of(&json);
    assert_eq!(json["progress"]["pending_topic"], "t1");

    let confirm = |topic: &str| {
        post(
            &format!("/v1/conversations/{conversation_id}/topics/{topic}/confirm?user_id=ana"),
            serde_json::json!({}),
        )
    };

    let (_, first) = send(&h.app, confirm("t1")).await;
    assert_eq!(first["percentage"], 50.0);

    let (_, again) = send(&h.app, confirm("t1")).await;
    assert_eq!(again["percentage"], 50.0);

    let (_, done) = send(&h.app, confirm("t2")).await;
    assert_eq!(done["percentage"], 100.0);
    assert_eq!(done["is_complete"], true);

    let (status, report) = send(
        &h.app,
        Request::builder()
            .uri(format!("/v1/conversations/{conversation_id}/progress?user_id=ana"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["covered"], 2);
}

#[tokio::test]
async fn streaming_turn_commits_exactly_once() {
    let reply = envelope_reply("Hello");
    let h = harness(ScriptedProvider::with_stream(StreamScript::split(&reply, 2))).await;

    let body = send_text(&h.app, post("/v1/chat/stream", serde_json::json!({"user_id": "ana", "message": "Hi"}))).await;
    assert_eq!(body.matches("event: chunk").count(), 2);
    assert_eq!(body.matches("event: done").count(), 1);

    let done = body
        .lines()
        .skip_while(|line| *line != "event: done")
        .find_map(|line| line.strip_prefix("data: "))
        .unwrap();
    let done: serde_json::Value = serde_json::from_str(done).unwrap();
    let conversation_id = ConversationId::from(conversation_of(&done).as_str());

    let messages = h.store.get_messages(&conversation_id, 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Hello");
    assert_eq!(messages[1].usage.as_ref().map(|u| u.total_tokens), Some(15));
}

#[tokio::test]
async fn interrupted_stream_saves_partial_reply() {
    let script = StreamScript::split("Half of an ans", 2)
        .ending(StreamEnd::Error(ProviderError::StreamInterrupted("connection reset".into())));
    let h = harness(ScriptedProvider::with_replies([envelope_reply("Welcome back.")])).await;
    h.provider.push_stream(script);

    let (_, opened) = send(&h.app, post("/v1/chat", serde_json::json!({"user_id": "ana", "message": "Hi"}))).await;
    let conversation_id = conversation_of(&opened);

    let body = send_text(
        &h.app,
        post(
            "/v1/chat/stream",
            serde_json::json!({"user_id": "ana", "conversation_id": conversation_id, "message": "Tell me more"}),
        ),
    )
    .await;
    assert!(body.contains("event: error"));
    assert!(body.contains(r#""partial_saved":true"#));
    assert!(!body.contains("event: done"));

    let messages = h
        .store
        .get_messages(&ConversationId::from(conversation_id.as_str()), 10)
        .await
        .unwrap();
    assert_eq!(messages.len(), 4);
    assert!(messages[3].content.starts_with("Half of an ans"));
    assert!(!messages[3].valid);
}

#[tokio::test]
async fn open_conversation_cap_rejects_another_conversation() {
    let limit = config().rate_limit.max_open_conversations as usize;
    let replies: Vec<String> = (0..limit).map(|i| envelope_reply(&format!("reply {i}"))).collect();
    let h = harness(ScriptedProvider::with_replies(replies)).await;

    for _ in 0..limit {
        let (status, _) = send(&h.app, post("/v1/chat", serde_json::json!({"user_id": "ana", "message": "Hi"}))).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(h.store.count_open_conversations("ana").await.unwrap(), limit);

    let (status, json) = send(&h.app, post("/v1/chat", serde_json::json!({"user_id": "ana", "message": "Hi"}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["error"], "rate_limited");
    assert_eq!(h.provider.complete_calls(), limit);

    // Another user is unaffected
    let (status, _) = send(&h.app, post("/v1/chat", serde_json::json!({"user_id": "ben", "message": "Hi"}))).await;
    assert_ne!(status, StatusCode::TOO_MANY_REQUESTS);
}
