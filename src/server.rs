//! HTTP invocation surface
//!
//! Every path that is not reserved maps to `execute(path, input)`. Paths
//! starting with `/_` are reserved for observability and never spawn.

use axum::{
    body::Bytes,
    extract::{Json, Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::LifecycleError;
use crate::lifecycle::{DramaEvent, Endpoint, LifecycleEngine};

struct ServerError(anyhow::Error);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": format!("{:#}", self.0) })),
        )
            .into_response()
    }
}

impl<E> From<E> for ServerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: LifecycleEngine,
}

#[derive(Debug, Deserialize)]
struct InvokeParams {
    input: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/_endpoints", get(list_endpoints))
        .route("/_drama", get(list_drama))
        .route("/_drama/stream", get(drama_stream))
        .route("/_reload", post(reload))
        .fallback(invoke)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: AppState, addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🌐 Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("🛑 Shutdown requested");
    }
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Endpoint Evolution is alive",
        "endpoints": state.engine.store().len().await,
    }))
}

async fn list_endpoints(State(state): State<AppState>) -> Json<Vec<Endpoint>> {
    Json(state.engine.endpoints().await)
}

async fn list_drama(State(state): State<AppState>) -> Json<Vec<DramaEvent>> {
    Json(state.engine.drama().snapshot().await)
}

async fn drama_stream(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = BroadcastStream::new(state.engine.drama().subscribe()).filter_map(|event| {
        let event = event.ok()?;
        Event::default().event("drama").json_data(&event).ok().map(Ok)
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn reload(State(state): State<AppState>) -> Result<Json<Value>, ServerError> {
    let summary = state.engine.reload().await?;
    Ok(Json(json!({ "success": true, "reloaded": summary })))
}

/// Input precedence: `?input=`, then the body (JSON when declared), then null.
fn request_input(params: InvokeParams, headers: &HeaderMap, body: &Bytes) -> Value {
    if let Some(input) = params.input {
        return Value::String(input);
    }
    if body.is_empty() {
        return Value::Null;
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));
    if is_json {
        if let Ok(value) = serde_json::from_slice(body) {
            return value;
        }
    }
    Value::String(String::from_utf8_lossy(body).into_owned())
}

async fn invoke(
    State(state): State<AppState>,
    uri: Uri,
    Query(params): Query<InvokeParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    if path.starts_with("/_") {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "path": path, "error": "reserved path" })),
        )
            .into_response();
    }

    let input = request_input(params, &headers, &body);
    match state.engine.execute(&path, input).await {
        Ok(invocation) => {
            let mut body = json!({
                "success": true,
                "path": invocation.path,
                "result": invocation.result,
            });
            if let Some(from) = invocation.redirected_from {
                body["redirectedFrom"] = json!(from);
            }
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => {
            let status = match &err {
                LifecycleError::Execution { .. } | LifecycleError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
                LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
                LifecycleError::GenerationRefused { .. }
                | LifecycleError::GenerationEmpty { .. }
                | LifecycleError::GenerationTransport { .. } => StatusCode::BAD_GATEWAY,
            };
            let path = match &err {
                LifecycleError::Execution { path, .. } => path.clone(),
                _ => path,
            };
            (
                status,
                Json(json!({ "success": false, "path": path, "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
