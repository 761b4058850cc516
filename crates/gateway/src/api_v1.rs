//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST /v1/chat`                                        — Blocking turn
//! - `POST /v1/chat/stream`                                 — Streaming turn over SSE
//! - `GET  /v1/topics`                                      — The parsed topic catalog
//! - `GET  /v1/conversations/{id}/progress`                 — Progress report
//! - `POST /v1/conversations/{id}/topics/{topic_id}/confirm` — Confirm a topic

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use dialoguard_agent::{StreamEvent, TurnPipeline, TurnRequest, TurnResponse};
use dialoguard_core::error::{Error, ProgressError, StoreError};
use dialoguard_core::{ConversationId, MessagePayload};
use dialoguard_progress::{ParseStrategy, ProgressReport, Topic};

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiV1State {
    pub pipeline: Arc<TurnPipeline>,
}

pub type SharedApiState = Arc<ApiV1State>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .route("/topics", get(topics_handler))
        .route("/conversations/{id}/progress", get(progress_handler))
        .route("/conversations/{id}/topics/{topic_id}/confirm", post(confirm_topic_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Owning user; the host authenticates, this API only scopes by it
    #[serde(default = "default_user")]
    pub user_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: MessagePayload,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub narrow_viewport: bool,
}

fn default_user() -> String {
    "anonymous".into()
}

impl ChatRequest {
    fn into_turn(self) -> Result<TurnRequest, ApiError> {
        if self.message.trim().is_empty() && self.payload.is_none() {
            return Err(ApiError::bad_request("message must not be empty"));
        }
        Ok(TurnRequest {
            user_id: self.user_id,
            conversation_id: self.conversation_id.as_deref().map(ConversationId::from),
            message: self.message,
            payload: self.payload,
            language: self.language,
            narrow_viewport: self.narrow_viewport,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    #[serde(default = "default_user")]
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopicListResponse {
    pub strategy: Option<ParseStrategy>,
    pub count: usize,
    pub tracking_enabled: bool,
    pub topics: Vec<Topic>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable code
    pub error: String,
    /// Non-technical message safe to show the user
    pub message: String,
}

// ── Errors ────────────────────────────────────────────────────────────────

/// A pipeline error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse {
                error: "bad_request".into(),
                message: message.into(),
            },
        }
    }

    fn not_found(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorResponse {
                error: "not_found".into(),
                message: format!("{what} not found"),
            },
        }
    }
}

/// HTTP status for each error kind.
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::Provider(_) | Error::SchemaValidation(_) => StatusCode::BAD_GATEWAY,
        Error::SafetyBlocked { .. } => StatusCode::FORBIDDEN,
        Error::Store(StoreError::ConversationNotFound(_) | StoreError::MessageNotFound(_)) => StatusCode::NOT_FOUND,
        Error::Progress(ProgressError::UnknownTopic(_)) => StatusCode::NOT_FOUND,
        Error::Progress(ProgressError::Disabled) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status = status_for(&error);
        if status.is_server_error() {
            error!(code = error.code(), error = %error, "Request failed");
        } else {
            warn!(code = error.code(), error = %error, "Request rejected");
        }
        Self {
            status,
            body: ErrorResponse {
                error: error.code().into(),
                message: error.user_message(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /v1/chat` — one blocking turn.
async fn chat_handler(
    State(state): State<SharedApiState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    let turn = payload.into_turn()?;
    info!(user_id = %turn.user_id, conversation_id = ?turn.conversation_id, "v1/chat request");

    let response = state.pipeline.handle_turn(turn).await?;
    Ok(Json(response))
}

/// `POST /v1/chat/stream` — one streaming turn as SSE events.
///
/// Errors before the upstream call come back as a plain JSON error;
/// afterwards they arrive as an `error` event.
async fn chat_stream_handler(
    State(state): State<SharedApiState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let turn = payload.into_turn()?;
    info!(user_id = %turn.user_id, conversation_id = ?turn.conversation_id, "v1/chat/stream SSE request");

    let rx = state.pipeline.handle_turn_streaming(turn).await?;

    let stream = ReceiverStream::new(rx).map(|event: StreamEvent| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.event_type()).data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /v1/topics`
async fn topics_handler(State(state): State<SharedApiState>) -> Json<TopicListResponse> {
    let tracker = state.pipeline.tracker();
    let catalog = tracker.catalog();
    Json(TopicListResponse {
        strategy: catalog.strategy(),
        count: catalog.len(),
        tracking_enabled: tracker.enabled(),
        topics: catalog.topics().to_vec(),
    })
}

/// `GET /v1/conversations/{id}/progress`
async fn progress_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    Query(owner): Query<OwnerQuery>,
) -> Result<Json<ProgressReport>, ApiError> {
    let conversation_id = owned_conversation(&state, &id, &owner.user_id).await?;
    let report = state.pipeline.tracker().report(&conversation_id).await?;
    Ok(Json(report))
}

/// `POST /v1/conversations/{id}/topics/{topic_id}/confirm`
async fn confirm_topic_handler(
    State(state): State<SharedApiState>,
    Path((id, topic_id)): Path<(String, String)>,
    Query(owner): Query<OwnerQuery>,
) -> Result<Json<ProgressReport>, ApiError> {
    let conversation_id = owned_conversation(&state, &id, &owner.user_id).await?;
    let report = state.pipeline.tracker().confirm_topic(&conversation_id, &topic_id).await?;
    info!(
        conversation_id = %conversation_id,
        topic = %topic_id,
        percentage = report.percentage,
        "Topic confirmed via API"
    );
    Ok(Json(report))
}

/// The conversation id when it exists, is live and belongs to `user_id`.
async fn owned_conversation(state: &ApiV1State, id: &str, user_id: &str) -> Result<ConversationId, ApiError> {
    let conversation_id = ConversationId::from(id);
    let conversation = state
        .pipeline
        .store()
        .get_conversation(&conversation_id)
        .await
        .map_err(Error::from)?;

    match conversation {
        Some(c) if c.user_id == user_id && !c.is_deleted() => Ok(conversation_id),
        _ => Err(ApiError::not_found("Conversation")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use dialoguard_agent::testing::{ScriptedProvider, StreamScript, envelope_asking_about, envelope_reply};
    use dialoguard_config::{AppConfig, KeywordEntry};
    use dialoguard_core::error::RateLimitError;
    use dialoguard_notify::TracingNotifier;
    use dialoguard_store::InMemoryStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.instructions.base = "[TOPIC: Sleep | sleep]\n[TOPIC: Food | eat]".into();
        config.safety.keywords = vec![KeywordEntry::Phrase("harm myself".into())];
        config.store.backend = "memory".into();
        config
    }

    fn test_state(provider: ScriptedProvider) -> SharedApiState {
        let pipeline = TurnPipeline::new(
            &config(),
            Arc::new(provider),
            Arc::new(InMemoryStore::new()),
            Arc::new(TracingNotifier),
        )
        .unwrap();
        Arc::new(ApiV1State {
            pipeline: Arc::new(pipeline),
        })
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn chat_returns_committed_turn() {
        let app = v1_router(test_state(ScriptedProvider::with_replies([envelope_reply("Hello!")])));

        let response = app
            .oneshot(post_json("/chat", serde_json::json!({"user_id": "u1", "message": "Hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["text"], "Hello!");
        assert_eq!(json["blocked"], false);
        assert_eq!(json["envelope"]["type"], "response");
        assert!(json["conversation_id"].is_string());
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let app = v1_router(test_state(ScriptedProvider::new()));
        let response = app
            .oneshot(post_json("/chat", serde_json::json!({"message": "   "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn exhausted_retries_map_to_bad_gateway() {
        let app = v1_router(test_state(ScriptedProvider::with_replies(["a", "b", "c"])));
        let response = app
            .oneshot(post_json("/chat", serde_json::json!({"message": "Hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json = body_json(response).await;
        assert_eq!(json["error"], "schema_validation_failed");
        assert!(!json["message"].as_str().unwrap().contains("attempt"));
    }

    #[tokio::test]
    async fn blocked_conversation_is_forbidden() {
        let state = test_state(ScriptedProvider::new());
        let app = v1_router(state.clone());

        let response = app
            .clone()
            .oneshot(post_json(
                "/chat",
                serde_json::json!({"user_id": "u1", "message": "I want to harm myself today"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["blocked"], true);
        let conversation_id = json["conversation_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(post_json(
                "/chat",
                serde_json::json!({"user_id": "u1", "conversation_id": conversation_id, "message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"], "safety_blocked");
    }

    #[tokio::test]
    async fn stream_emits_sse_events() {
        let reply = envelope_reply("Streaming hello");
        let app = v1_router(test_state(ScriptedProvider::with_stream(StreamScript::split(&reply, 2))));

        let response = app
            .oneshot(post_json("/chat/stream", serde_json::json!({"message": "Hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap().to_str().unwrap(),
            "text/event-stream"
        );

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text.matches("event: chunk").count(), 2);
        assert!(text.contains("event: done"));
        assert!(text.contains(r#""valid":true"#));
    }

    #[tokio::test]
    async fn topics_are_listed() {
        let app = v1_router(test_state(ScriptedProvider::new()));
        let response = app
            .oneshot(Request::builder().uri("/topics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: TopicListResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(json.count, 2);
        assert_eq!(json.strategy, Some(ParseStrategy::InlineMarkers));
        assert_eq!(json.topics[0].id, "sleep");
    }

    #[tokio::test]
    async fn confirm_and_read_progress() {
        let state = test_state(ScriptedProvider::with_replies([envelope_asking_about("Sleep?", "sleep")]));
        let app = v1_router(state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/chat", serde_json::json!({"user_id": "u1", "message": "Hi"})))
            .await
            .unwrap();
        let conversation_id = body_json(response).await["conversation_id"].as_str().unwrap().to_string();

        let confirm = |topic: &str| {
            post_json(
                &format!("/conversations/{conversation_id}/topics/{topic}/confirm?user_id=u1"),
                serde_json::json!({}),
            )
        };

        let response = app.clone().oneshot(confirm("sleep")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["percentage"], 50.0);

        let response = app.clone().oneshot(confirm("unknown")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "progress_error");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/conversations/{conversation_id}/progress?user_id=u1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["covered"], 1);
        assert_eq!(json["total"], 2);

        // Another user cannot see it
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/conversations/{conversation_id}/progress?user_id=u2"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn status_mapping() {
        let limited = Error::RateLimited(RateLimitError::TooManyRequests {
            user_id: "u".into(),
            limit: 1,
        });
        assert_eq!(status_for(&limited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            status_for(&Error::Store(StoreError::Storage("disk".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status_for(&Error::Progress(ProgressError::Disabled)), StatusCode::CONFLICT);
    }
}
