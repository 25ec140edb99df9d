use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use scribe_core::coordinator::{ControlError, RunState, SessionEvent};
use scribe_core::outline::PlanOutcome;
use scribe_core::{Coordinator, DocumentRequest, SessionHandle};
use scribe_store::StoreError;
use scribe_store::models::Outline;
use scribe_store::queries::{reports as report_db, sessions as session_db};

/// Events a subscriber may fall behind by before it starts missing some.
const BROADCAST_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<ControlError> for AppError {
    fn from(err: ControlError) -> Self {
        let status = match &err {
            ControlError::UnknownSession(_) | ControlError::UnknownDocument(_) => {
                StatusCode::NOT_FOUND
            }
            ControlError::AlreadyFinished { .. } | ControlError::Released(_) => {
                StatusCode::CONFLICT
            }
            ControlError::ReportUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        if matches!(err, StoreError::SessionNotFound(_)) {
            Self::not_found(err.to_string())
        } else {
            Self::internal(err.into())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub prompt: String,
    #[serde(default)]
    pub template_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanResponse {
    Accepted { outline: Outline, markdown: String },
    Fallback { reason: String, attempts: u32 },
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub prompt: String,
    #[serde(default)]
    pub template_id: Option<String>,
    /// Regenerate an existing document instead of starting a new one.
    #[serde(default)]
    pub document_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub session_id: Uuid,
    pub document_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub session_id: Uuid,
    pub action: &'static str,
    /// `None` once the session has finished.
    pub run_state: Option<RunState>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Shared server state.
///
/// Each live session has a forwarder task draining its bounded event queue
/// into a broadcast channel, so the session never waits on HTTP clients.
#[derive(Clone)]
pub struct AppState {
    coordinator: Coordinator,
    live: Arc<Mutex<HashMap<Uuid, broadcast::Sender<SessionEvent>>>>,
}

impl AppState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn forward(&self, handle: SessionHandle) {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let SessionHandle {
            session_id,
            mut events,
            join,
            ..
        } = handle;
        self.live.lock().await.insert(session_id, tx.clone());

        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                // No subscribers is fine.
                let _ = tx.send(event);
            }
            match join.await {
                Ok(outcome) => {
                    debug!(session_id = %session_id, phase = %outcome.phase, "forwarder done")
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "session task failed"),
            }
            live.lock().await.remove(&session_id);
        });
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/plan", post(plan))
        .route("/api/sessions", get(list_sessions).post(start_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/events", get(session_events))
        .route("/api/sessions/{id}/pause", post(pause_session))
        .route("/api/sessions/{id}/resume", post(resume_session))
        .route("/api/sessions/{id}/abort", post(abort_session))
        .route("/api/documents/{id}/revise", post(revise_document))
        .route("/api/documents/{id}/reports", get(list_reports))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(coordinator: Coordinator, bind: &str, port: u16) -> Result<()> {
    let state = AppState::new(coordinator);
    let app = build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("scribe serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    info!("scribe serve shut down");
    Ok(())
}

/// Wait for Ctrl+C, then abort and release live sessions so their event
/// streams end.
async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    let live: Vec<Uuid> = state.live.lock().await.keys().copied().collect();
    for session_id in live {
        let stopped = match state.coordinator.abort(session_id).await {
            Ok(()) => state.coordinator.release(session_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stopped {
            debug!(session_id = %session_id, error = %e, "abort on shutdown");
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(state): State<AppState>) -> Html<String> {
    let sessions = session_db::list_sessions(state.coordinator.store()).await;

    let rows = if sessions.is_empty() {
        "<tr><td colspan=\"3\">No sessions yet.</td></tr>".to_string()
    } else {
        sessions
            .iter()
            .map(|s| {
                format!(
                    "<tr><td><a href=\"/api/sessions/{id}\">{id}</a></td><td>{phase}</td><td>{document}</td></tr>",
                    id = s.id,
                    phase = s.phase,
                    document = s.document_id,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    Html(format!(
        "<!DOCTYPE html>\
<html><head><title>scribe</title></head><body>\
<h1>scribe</h1>\
<p><a href=\"/api/sessions\">/api/sessions</a></p>\
<table><tr><th>Session</th><th>Phase</th><th>Document</th></tr>{rows}</table>\
</body></html>"
    ))
}

async fn plan(
    State(state): State<AppState>,
    Json(body): Json<PlanRequest>,
) -> Result<Json<PlanResponse>, AppError> {
    if body.prompt.trim().is_empty() {
        return Err(AppError::bad_request("prompt is empty"));
    }
    let outcome = state
        .coordinator
        .plan(&body.prompt, body.template_id.as_deref())
        .await;
    let response = match outcome {
        PlanOutcome::Accepted(outline) => PlanResponse::Accepted {
            markdown: outline.to_markdown(),
            outline,
        },
        PlanOutcome::Fallback { reason, attempts } => PlanResponse::Fallback { reason, attempts },
    };
    Ok(Json(response))
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(session_db::list_sessions(state.coordinator.store()).await)
}

async fn start_session(
    State(state): State<AppState>,
    Json(body): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartResponse>), AppError> {
    if body.prompt.trim().is_empty() {
        return Err(AppError::bad_request("prompt is empty"));
    }
    let mut request = DocumentRequest::new(body.prompt);
    if let Some(document_id) = body.document_id {
        request.document_id = document_id;
    }
    if let Some(template_id) = body.template_id {
        request = request.with_template(template_id);
    }

    let handle = state.coordinator.start(request).await;
    let response = StartResponse {
        session_id: handle.session_id,
        document_id: handle.document_id,
    };
    state.forward(handle).await;
    info!(session_id = %response.session_id, "session started over HTTP");
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let snapshot = state.coordinator.store().snapshot(id).await?;
    Ok(Json(snapshot).into_response())
}

/// Server-sent events for one session, ending with `finished`.
///
/// Subscribers only see events from the moment they connect; the session
/// snapshot covers what came before. A session that already finished
/// yields its `finished` event alone.
async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let rx = state.live.lock().await.get(&id).map(|tx| tx.subscribe());
    let store = state.coordinator.store().clone();
    if session_db::get_session(&store, id).await.is_none() {
        return Err(AppError::not_found(format!("session {id} not found")));
    }

    let stream = async_stream::stream! {
        if let Some(mut rx) = rx {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let done = event.is_finished();
                        yield to_sse(&event);
                        if done {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(session_id = %id, skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        // The session finished before or while we subscribed.
        if let Some(session) = session_db::get_session(&store, id).await {
            if session.phase.is_terminal() {
                yield to_sse(&SessionEvent::Finished { phase: session.phase });
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &SessionEvent) -> Result<Event, axum::Error> {
    let value = serde_json::to_value(event).map_err(axum::Error::new)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("event")
        .to_string();
    Ok(Event::default().event(kind).data(value.to_string()))
}

async fn control_response(
    state: &AppState,
    session_id: Uuid,
    action: &'static str,
) -> Json<ControlResponse> {
    Json(ControlResponse {
        session_id,
        action,
        run_state: state.coordinator.run_state(session_id).await,
    })
}

async fn pause_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, AppError> {
    state.coordinator.pause(id).await?;
    Ok(control_response(&state, id, "pause").await)
}

async fn resume_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, AppError> {
    state.coordinator.resume(id).await?;
    Ok(control_response(&state, id, "resume").await)
}

async fn abort_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, AppError> {
    state.coordinator.abort(id).await?;
    Ok(control_response(&state, id, "abort").await)
}

async fn revise_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let report = state.coordinator.revise_global(id).await?;
    Ok(Json(report).into_response())
}

async fn list_reports(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let reports = report_db::list_reports(state.coordinator.store(), id).await;
    if reports.is_empty()
        && session_db::latest_session_for_document(state.coordinator.store(), id)
            .await
            .is_none()
    {
        return Err(AppError::not_found(format!("document {id} not found")));
    }
    Ok(Json(reports).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use scribe_core::Coordinator;
    use scribe_core::capability::NoRetrieval;
    use scribe_store::Store;
    use scribe_store::models::SessionPhase;
    use scribe_test_utils::{
        Gate, PLANNING_MARKER, REPORT_OUTLINE, ScriptedGenerator, fast_config,
    };

    use super::*;

    const INTRO: &str = "Revenue across every region grew during the quarter. \
        Customer demand in each region stayed strong.";
    const BODY: &str = "Regional revenue figures show the strongest customer growth \
        in the northern region. Revenue per customer rose in every region.";
    const CONCLUSION: &str = "Next quarter the regions expect revenue to keep growing \
        as customer demand holds across the region.";

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn report_generator() -> ScriptedGenerator {
        ScriptedGenerator::new()
            .with_outline(REPORT_OUTLINE)
            .with_section("Intro", INTRO)
            .with_section("Body", BODY)
            .with_section("Conclusion", CONCLUSION)
    }

    fn app_with(generator: ScriptedGenerator) -> Router {
        let coordinator = Coordinator::new(
            fast_config(),
            Arc::new(generator),
            Arc::new(NoRetrieval),
            Store::in_memory(),
        )
        .unwrap();
        build_router(AppState::new(coordinator))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> axum::response::Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 4 * 1_048_576)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn start(app: &Router, prompt: &str) -> (String, String) {
        let body = serde_json::json!({ "prompt": prompt });
        let resp = send(app, "POST", "/api/sessions", Some(body)).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let json = body_json(resp).await;
        (
            json["session_id"].as_str().unwrap().to_string(),
            json["document_id"].as_str().unwrap().to_string(),
        )
    }

    /// Poll the snapshot endpoint until the session reaches one of `phases`.
    async fn wait_for_phase(app: &Router, session_id: &str, phases: &[&str]) -> serde_json::Value {
        for _ in 0..500 {
            let resp = send(app, "GET", &format!("/api/sessions/{session_id}"), None).await;
            let json = body_json(resp).await;
            let phase = json["session"]["phase"].as_str().unwrap_or_default().to_string();
            if phases.contains(&phase.as_str()) {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {session_id} never reached {phases:?}");
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_index_returns_html() {
        let app = app_with(report_generator());
        let resp = send(&app, "GET", "/", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .expect("should have content-type header")
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.contains("text/html"), "got: {content_type}");
    }

    #[tokio::test]
    async fn test_plan_returns_accepted_outline() {
        let app = app_with(report_generator());
        let resp = send(
            &app,
            "POST",
            "/api/plan",
            Some(serde_json::json!({ "prompt": "Quarterly report" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["outline"]["title"], "Quarterly Report");
        assert!(json["markdown"].as_str().unwrap().contains("## Body"));
    }

    #[tokio::test]
    async fn test_plan_reports_fallback() {
        let app = app_with(ScriptedGenerator::new().with_outline("no headings at all"));
        let resp = send(
            &app,
            "POST",
            "/api/plan",
            Some(serde_json::json!({ "prompt": "Quarterly report" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "fallback");
        assert_eq!(json["attempts"], 2);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_bad_request() {
        let app = app_with(report_generator());
        let body = serde_json::json!({ "prompt": "  " });
        let resp = send(&app, "POST", "/api/sessions", Some(body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_session_runs_to_completion_and_revises() {
        let app = app_with(report_generator());
        let (session_id, document_id) = start(&app, "Quarterly report").await;

        let snapshot = wait_for_phase(&app, &session_id, &["completed", "failed"]).await;
        assert_eq!(snapshot["session"]["phase"], "completed");
        let sections = snapshot["sections"].as_array().unwrap();
        assert_eq!(sections.len(), 3);
        assert!(sections.iter().all(|s| s["state"] == "completed"));
        assert_eq!(snapshot["reports"].as_array().unwrap().len(), 1);

        let resp = send(&app, "POST", &format!("/api/documents/{document_id}/revise"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let report = body_json(resp).await;
        assert_eq!(report["sections_checked"], 3);

        let resp = send(&app, "GET", &format!("/api/documents/{document_id}/reports"), None).await;
        let reports = body_json(resp).await;
        assert_eq!(reports.as_array().unwrap().len(), 2);

        let resp = send(&app, "GET", "/api/sessions", None).await;
        let list = body_json(resp).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_stream_live_session() {
        let gate = Gate::new();
        let generator = report_generator().gate(PLANNING_MARKER, 0, gate.clone());
        let app = app_with(generator);
        let (session_id, _) = start(&app, "Quarterly report").await;

        let resp = send(&app, "GET", &format!("/api/sessions/{session_id}/events"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        gate.open();

        let text = body_text(resp).await;
        assert!(text.contains("event: outline_ready"), "missing outline: {text}");
        assert!(text.contains("event: increment"));
        assert!(text.contains("event: section_completed"));
        let finished = text.find("event: finished").expect("missing finished event");
        let last_increment = text.rfind("event: increment").unwrap();
        assert!(last_increment < finished);
    }

    #[tokio::test]
    async fn test_events_of_finished_session_yield_only_finished() {
        let app = app_with(report_generator());
        let (session_id, _) = start(&app, "Quarterly report").await;
        wait_for_phase(&app, &session_id, &["completed", "failed"]).await;
        // Let the forwarder drop its channel.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let resp = send(&app, "GET", &format!("/api/sessions/{session_id}/events"), None).await;
        let text = body_text(resp).await;
        assert!(text.contains("event: finished"));
        assert!(text.contains("\"completed\""));
        assert!(!text.contains("event: increment"));
    }

    #[tokio::test]
    async fn test_pause_resume_abort_over_http() {
        let gate = Gate::new();
        let generator = report_generator().gate(PLANNING_MARKER, 0, gate.clone());
        let app = app_with(generator);
        let (session_id, _) = start(&app, "Quarterly report").await;

        let resp = send(&app, "POST", &format!("/api/sessions/{session_id}/pause"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["run_state"], "paused");

        gate.open();
        let snapshot = wait_for_phase(&app, &session_id, &["paused", "failed"]).await;
        assert_eq!(snapshot["session"]["phase"], "paused");

        // Abort on a held session keeps it paused and resumable.
        let resp = send(&app, "POST", &format!("/api/sessions/{session_id}/abort"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["run_state"], "aborted");
        let snapshot = wait_for_phase(&app, &session_id, &["paused"]).await;
        assert_eq!(snapshot["session"]["phase"], "paused");

        let resp = send(&app, "POST", &format!("/api/sessions/{session_id}/resume"), None).await;
        assert_eq!(body_json(resp).await["run_state"], "running");

        let snapshot = wait_for_phase(&app, &session_id, &["completed", "failed"]).await;
        assert_eq!(snapshot["session"]["phase"], "completed");

        // Let the session task drop its control.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let resp = send(&app, "POST", &format!("/api/sessions/{session_id}/pause"), None).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let app = app_with(report_generator());
        let random_id = Uuid::new_v4();
        for (method, uri) in [
            ("GET", format!("/api/sessions/{random_id}")),
            ("GET", format!("/api/sessions/{random_id}/events")),
            ("POST", format!("/api/sessions/{random_id}/pause")),
            ("POST", format!("/api/documents/{random_id}/revise")),
            ("GET", format!("/api/documents/{random_id}/reports")),
        ] {
            let resp = send(&app, method, &uri, None).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{method} {uri}");
        }
    }

    #[test]
    fn sse_event_conversion_accepts_every_shape() {
        let events = [
            SessionEvent::Finished {
                phase: SessionPhase::Completed,
            },
            SessionEvent::Fallback {
                reason: "too shallow".to_string(),
            },
        ];
        for event in &events {
            assert!(to_sse(event).is_ok());
        }
    }
}
