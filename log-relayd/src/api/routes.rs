use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use shared::protocol::{INVALID_CODE_MESSAGE, NEW_LOG_EVENT, VIEW_PREFIX};
use crate::api::page;
use crate::config::Config;
use crate::error::{RelayError, RelayResult};
use crate::registry_manager::RegistryHandle;
use crate::relay::broadcaster::Broadcaster;
use crate::relay::ingress::{self, Ingress, Route};
use crate::relay::viewer::{IdleTeardown, ViewerFeed};
use crate::upstream::client::ProviderClient;
use crate::upstream::streams::StreamManager;

const MISSING_FIELDS: &str = "Data missing";

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub streams: Arc<StreamManager>,
    pub broadcaster: Arc<Broadcaster>,
    pub ingress: Arc<Ingress>,
    /// Public base URL without trailing slash
    pub public_url: Arc<str>,
    pub stop_when_idle: bool,
    /// Ends open viewer feeds so graceful shutdown can complete
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: &Config,
        registry: RegistryHandle,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let client = ProviderClient::new(&config.upstream)?;
        let broadcaster = Arc::new(Broadcaster::new(config.broadcast.viewer_buffer));
        let streams = Arc::new(StreamManager::new(client, registry.clone(), config.server.base_url()));
        let ingress = Arc::new(Ingress::new(broadcaster.clone(), config.ingress.untagged_fanout));

        Ok(Self {
            registry,
            streams,
            broadcaster,
            ingress,
            public_url: Arc::from(config.server.base_url()),
            stop_when_idle: config.streams.stop_when_idle,
            shutdown,
        })
    }
}

#[derive(Deserialize)]
pub struct CreateLinkRequest {
    pub api_key: Option<String>,
    pub service_id: Option<String>,
}

#[derive(Serialize)]
pub struct CreateLinkResponse {
    pub status: &'static str,
    pub code: String,
    pub link: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Either a link code, or a raw key/service pair as older clients send it
#[derive(Deserialize)]
pub struct StartStreamRequest {
    pub code: Option<String>,
    pub api: Option<String>,
    pub srv: Option<String>,
}

#[derive(Deserialize)]
pub struct StopStreamRequest {
    pub stream_id: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/create_link", post(create_link))
        .route("/view/:code", get(view_logs))
        .route("/view/:code/events", get(view_events))
        .route("/start_stream", post(start_stream))
        .route("/stop_stream", post(stop_stream))
        .route("/webhook", post(webhook))
        .route("/webhook/:route", post(webhook_for_stream))
        .route("/healthz", get(healthz))
        .with_state(state)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> RelayResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| {
            tracing::debug!("Unreadable request body: {}", e);
            RelayError::Validation(MISSING_FIELDS.to_string())
        })
}

/// Viewer-facing failures: unknown links get a plain page, anything else the JSON error
fn view_error(e: RelayError) -> Response {
    match e {
        RelayError::NotFound(_) => (StatusCode::NOT_FOUND, INVALID_CODE_MESSAGE).into_response(),
        other => other.into_response(),
    }
}

async fn create_link(
    State(state): State<AppState>,
    payload: Result<Json<CreateLinkRequest>, JsonRejection>,
) -> RelayResult<Json<CreateLinkResponse>> {
    let request = json_body(payload)?;
    let (Some(api_key), Some(service_id)) = (non_empty(request.api_key), non_empty(request.service_id)) else {
        return Err(RelayError::Validation(MISSING_FIELDS.to_string()));
    };

    let entry = state.registry.create_code(api_key, service_id).await?;

    Ok(Json(CreateLinkResponse {
        status: "success",
        link: format!("{}{}/{}", state.public_url, VIEW_PREFIX, entry.code),
        code: entry.code,
        expires_at: entry.expires_at,
    }))
}

async fn view_logs(State(state): State<AppState>, Path(code): Path<String>) -> Response {
    match state.registry.resolve(&code).await {
        Ok(entry) => Html(page::terminal_page(&entry)).into_response(),
        Err(e) => view_error(e),
    }
}

async fn view_events(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, Response> {
    let entry = state.registry.resolve(&code).await.map_err(view_error)?;

    let on_idle = state.stop_when_idle.then(|| IdleTeardown {
        streams: state.streams.clone(),
        shutdown: state.shutdown.clone(),
    });
    let feed = ViewerFeed::open(state.broadcaster.clone(), &entry.code, on_idle).map_err(|e| {
        tracing::error!("Viewer could not join {}: {}", entry.code, e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })?;

    let stream = feed
        .map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Ok::<_, Infallible>(Event::default().event(NEW_LOG_EVENT).data(data))
        })
        .take_until(state.shutdown.clone().cancelled_owned());

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn start_stream(
    State(state): State<AppState>,
    payload: Result<Json<StartStreamRequest>, JsonRejection>,
) -> RelayResult<Json<Value>> {
    let request = json_body(payload)?;

    let (credential, service_id, code) = match non_empty(request.code) {
        Some(code) => {
            let entry = state.registry.resolve(&code).await?;
            (entry.credential, entry.service_id, Some(entry.code))
        }
        None => match (non_empty(request.api), non_empty(request.srv)) {
            (Some(api), Some(srv)) => (api, srv, None),
            _ => return Err(RelayError::Validation(MISSING_FIELDS.to_string())),
        },
    };

    let stream_id = state
        .streams
        .subscribe(&credential, &service_id, code.as_deref())
        .await?;

    Ok(Json(json!({ "status": "connected", "stream_id": stream_id })))
}

async fn stop_stream(
    State(state): State<AppState>,
    payload: Result<Json<StopStreamRequest>, JsonRejection>,
) -> RelayResult<Json<Value>> {
    let request = json_body(payload)?;
    let stream_id = non_empty(request.stream_id)
        .ok_or_else(|| RelayError::Validation("stream_id missing".to_string()))?;

    let released = state.streams.unsubscribe(&stream_id).await;

    Ok(Json(json!({ "status": "stopped", "stream_id": stream_id, "released": released })))
}

/// Provider pushes are acknowledged no matter what happens downstream
const ACK: (StatusCode, &str) = (StatusCode::OK, "OK");

async fn webhook(State(state): State<AppState>, body: Bytes) -> (StatusCode, &'static str) {
    state.ingress.ingest(Route::Untagged, ingress::parse_batch(&body));
    ACK
}

async fn webhook_for_stream(
    State(state): State<AppState>,
    Path(route): Path<String>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let batch = ingress::parse_batch(&body);
    match state.streams.codes_for_route(&route) {
        Some(codes) if !codes.is_empty() => {
            state.ingress.ingest(Route::Groups(&codes), batch);
        }
        // Subscription started without a link
        Some(_) => {
            state.ingress.ingest(Route::Untagged, batch);
        }
        None => {
            tracing::warn!("Dropped {} lines pushed to unknown route {}", batch.len(), route);
        }
    }
    ACK
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "viewers": state.broadcaster.viewer_count(),
        "streams": state.streams.active_count(),
    }))
}
