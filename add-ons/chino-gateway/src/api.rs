//! HTTP routes over the core registry.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Json, Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use chino_core::bus::{EventPayload, Interrupt, SpeechReady, INTERRUPT, SPEECH_READY};
use chino_core::memory::UserInput;
use chino_core::{CoreError, CoreRegistry, TurnOutcome};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CoreRegistry>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(registry: Arc<CoreRegistry>) -> Self {
        Self {
            registry,
            started_at: Instant::now(),
        }
    }
}

/// Core failures become a 500 with the message in the body.
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(target: "chino::gateway", error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": self.0.to_string() })),
        )
            .into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/dialog/chat", post(chat))
        .route("/api/v1/dialog/submit", post(submit))
        .route("/api/v1/dialog/history", get(history))
        .route("/api/v1/dialog/clear", post(clear))
        .route("/api/v1/dialog/status", get(dialog_status))
        .route("/api/v1/dialog/interrupt", post(interrupt))
        .route("/api/v1/bus/status", get(bus_status))
        .route("/api/v1/memory/summaries", get(summaries))
        .route("/api/v1/memory/summaries/:id", delete(delete_summary))
        .route("/api/v1/memory/stats", get(memory_stats))
        .route("/api/v1/router/status", get(router_status))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.registry.config();
    Json(json!({
        "status": "ok",
        "app_name": config.app_name,
        "version": GATEWAY_VERSION,
        "llm_mode": config.llm.mode,
        "model": state.registry.model().name(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// Synchronous turn: answers with the reply, or 500 if the model failed.
async fn chat(State(state): State<AppState>, Json(input): Json<UserInput>) -> ApiResult {
    if input.text.trim().is_empty() {
        return Ok((StatusCode::BAD_REQUEST, Json(json!({ "ok": false, "error": "text is empty" }))).into_response());
    }
    let outcome = state.registry.dialog().respond_to(input).await?;
    let body = match outcome {
        TurnOutcome::Published(reply) => json!({
            "ok": true,
            "response_id": reply.response_id,
            "sentences": reply.sentences,
            "latency_ms": reply.latency_ms,
            "interrupted": false,
        }),
        TurnOutcome::Suppressed { response_id, latency_ms } => json!({
            "ok": true,
            "response_id": response_id,
            "sentences": [],
            "latency_ms": latency_ms,
            "interrupted": true,
        }),
    };
    Ok(Json(body).into_response())
}

/// Fire-and-forget: publish `speech_ready` and return immediately.
async fn submit(State(state): State<AppState>, Json(input): Json<UserInput>) -> impl IntoResponse {
    if input.text.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "ok": false, "error": "text is empty" })));
    }
    let bus = Arc::clone(state.registry.bus());
    let payload = EventPayload::SpeechReady(SpeechReady::from(input));
    tokio::spawn(async move {
        bus.publish(SPEECH_READY, payload).await;
    });
    (StatusCode::ACCEPTED, Json(json!({ "ok": true, "accepted": true })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn history(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> ApiResult {
    let turns = state.registry.memory().recent_turns(q.limit).await?;
    Ok(Json(json!({ "ok": true, "count": turns.len(), "turns": turns })).into_response())
}

async fn clear(State(state): State<AppState>) -> ApiResult {
    state.registry.dialog().clear_conversation().await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn dialog_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.dialog().status())
}

#[derive(Debug, Default, Deserialize)]
struct InterruptRequest {
    reason: Option<String>,
}

async fn interrupt(State(state): State<AppState>, body: Option<Json<InterruptRequest>>) -> impl IntoResponse {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "api".to_string());
    let delivered = state
        .registry
        .bus()
        .publish(
            INTERRUPT,
            EventPayload::Interrupt(Interrupt {
                reason,
                source: "api".to_string(),
            }),
        )
        .await;
    Json(json!({ "ok": true, "delivered": delivered }))
}

async fn bus_status(State(state): State<AppState>) -> impl IntoResponse {
    let bus = state.registry.bus();
    Json(json!({
        "stats": bus.stats(),
        "recent": bus.history(20),
    }))
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    limit: Option<usize>,
    min_importance: Option<f32>,
}

async fn summaries(State(state): State<AppState>, Query(q): Query<SummaryQuery>) -> impl IntoResponse {
    let memory = state.registry.memory();
    let list = memory
        .recent_summaries(q.limit.unwrap_or(10), q.min_importance.unwrap_or(0.0))
        .await;
    Json(json!({
        "ok": true,
        "long_term_enabled": memory.long_term().is_some(),
        "count": list.len(),
        "summaries": list,
    }))
}

async fn delete_summary(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let Some(store) = state.registry.memory().long_term().cloned() else {
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "error": "long-term memory disabled" })),
        )
            .into_response());
    };
    let deleted = tokio::task::spawn_blocking(move || store.delete(id))
        .await
        .map_err(CoreError::from)??;
    if deleted {
        Ok(Json(json!({ "ok": true, "deleted": id })).into_response())
    } else {
        Ok((StatusCode::NOT_FOUND, Json(json!({ "ok": false, "error": "no such summary" }))).into_response())
    }
}

async fn memory_stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.registry.memory().stats().await?;
    Ok(Json(stats).into_response())
}

async fn router_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.router().status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chino_core::config::{CoreConfig, LlmMode};
    use chino_core::llm::{ReplySentence, ScriptedModel, ScriptedReply};
    use chino_core::memory::{InMemorySummaryStore, NewSummary, SummaryStore, Turn, UserTurn};
    use tower::ServiceExt;

    fn test_registry(model: ScriptedModel) -> (Arc<CoreRegistry>, Arc<InMemorySummaryStore>) {
        let summaries = Arc::new(InMemorySummaryStore::new());
        let registry = CoreRegistry::builder(CoreConfig::default())
            .with_model(LlmMode::Mock, Arc::new(model))
            .with_summary_store(summaries.clone())
            .build()
            .unwrap();
        (registry, summaries)
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_model() {
        let (registry, _) = test_registry(ScriptedModel::echo());
        let (status, json) = send(build_app(AppState::new(registry)), get_req("/api/v1/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["model"], "scripted");
        assert_eq!(json["llm_mode"], "mock");
    }

    #[tokio::test]
    async fn chat_returns_reply_and_records_history() {
        let (registry, _) = test_registry(ScriptedModel::new([ScriptedReply::Sentences(vec![
            ReplySentence::plain("Hello."),
            ReplySentence::plain("How are you?"),
        ])]));
        let app = build_app(AppState::new(registry));

        let (status, json) = send(app.clone(), post_json("/api/v1/dialog/chat", json!({ "text": "hi" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sentences"].as_array().unwrap().len(), 2);
        assert_eq!(json["sentences"][1]["text_spoken"], "How are you?");
        assert_eq!(json["interrupted"], false);

        let (_, history) = send(app, get_req("/api/v1/dialog/history")).await;
        assert!(history["count"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn history_stats_and_clear_read_the_buffer() {
        let (registry, _) = test_registry(ScriptedModel::echo());
        let app = build_app(AppState::new(registry));
        send(app.clone(), post_json("/api/v1/dialog/chat", json!({ "text": "hi" }))).await;

        let (status, history) = send(app.clone(), get_req("/api/v1/dialog/history?limit=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["count"], 1);
        assert_eq!(history["turns"][0]["text_spoken"], "You said: hi");

        let (_, stats) = send(app.clone(), get_req("/api/v1/memory/stats")).await;
        assert_eq!(stats["short_term_turns"], 2);

        let (status, _) = send(app.clone(), post_json("/api/v1/dialog/clear", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let (_, history) = send(app, get_req("/api/v1/dialog/history")).await;
        assert_eq!(history["count"], 0);
    }

    #[tokio::test]
    async fn chat_model_failure_is_a_500() {
        let (registry, _) = test_registry(ScriptedModel::new([ScriptedReply::Fail("backend down".into())]));
        let (status, json) = send(
            build_app(AppState::new(registry)),
            post_json("/api/v1/dialog/chat", json!({ "text": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].as_str().unwrap().contains("backend down"));
    }

    #[tokio::test]
    async fn submit_is_accepted_and_answered_in_background() {
        let (registry, _) = test_registry(ScriptedModel::echo());
        let app = build_app(AppState::new(Arc::clone(&registry)));
        let (status, _) = send(app, post_json("/api/v1/dialog/submit", json!({ "text": "ping" }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while registry.dialog().status().turns_completed == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("turn completed");
    }

    #[tokio::test]
    async fn blank_text_is_rejected() {
        let (registry, _) = test_registry(ScriptedModel::echo());
        let (status, _) = send(
            build_app(AppState::new(registry)),
            post_json("/api/v1/dialog/chat", json!({ "text": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn summaries_can_be_listed_and_deleted() {
        let (registry, store) = test_registry(ScriptedModel::echo());
        let id = store
            .add(NewSummary {
                session_id: "s".into(),
                summary: "User likes tea.".into(),
                turns: vec![Turn::User(UserTurn {
                    session_id: "s".into(),
                    message: "I like tea".into(),
                    emotion: "normal".into(),
                    lang: "en".into(),
                    source: "text".into(),
                    interrupt: false,
                    timestamp_ms: 1,
                    input_id: String::new(),
                })],
                token_count: 20,
                importance: 0.7,
                metadata: json!({}),
            })
            .unwrap();
        let app = build_app(AppState::new(registry));

        let (_, listed) = send(app.clone(), get_req("/api/v1/memory/summaries?limit=5")).await;
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["summaries"][0]["summary"], "User likes tea.");

        let del = Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/memory/summaries/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app.clone(), del).await;
        assert_eq!(status, StatusCode::OK);

        let again = Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/memory/summaries/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app, again).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn interrupt_and_status_endpoints() {
        let (registry, _) = test_registry(ScriptedModel::echo());
        let app = build_app(AppState::new(registry));

        let (status, json) = send(app.clone(), post_json("/api/v1/dialog/interrupt", json!({ "reason": "barge-in" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["delivered"].as_u64().unwrap() >= 2);

        let (_, dialog) = send(app.clone(), get_req("/api/v1/dialog/status")).await;
        assert_eq!(dialog["state"], "idle");
        let (_, bus) = send(app.clone(), get_req("/api/v1/bus/status")).await;
        assert_eq!(bus["recent"][0]["event"], "interrupt");
        let (_, router) = send(app.clone(), get_req("/api/v1/router/status")).await;
        assert_eq!(router["total"], 0);
        let (status, stats) = send(app, get_req("/api/v1/memory/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["short_term_turns"], 0);
    }
}
