//! In-process stand-in for the provider's log-stream API, for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{delete, post},
    Router,
};
use crate::config::UpstreamConfig;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<RecordedCall>>,
    reply: Mutex<Option<(u16, String)>>,
    create_delay: Mutex<Option<Duration>>,
    issued: AtomicU64,
}

pub struct MockProvider {
    base_url: String,
    state: Arc<MockState>,
}

impl MockProvider {
    /// Serve on an ephemeral localhost port. Creates answer 201 with a fresh
    /// id and deletes answer 204 until `respond_with` overrides them.
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/log-streams", post(handle))
            .route("/log-streams/:id", delete(handle))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    /// A base URL nothing is listening on
    pub async fn closed_base_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    pub fn config(&self) -> UpstreamConfig {
        UpstreamConfig {
            api_base: self.base_url.clone(),
            timeout_secs: 5,
        }
    }

    /// Answer every subsequent call with this status and body
    pub fn respond_with(&self, status: u16, body: &str) {
        *self.state.reply.lock().unwrap() = Some((status, body.to_string()));
    }

    /// Hold every create this long before answering
    pub fn delay_creates(&self, delay: Duration) {
        *self.state.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn calls_with(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.method == method).count()
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.calls.lock().unwrap().push(RecordedCall {
        method: method.to_string(),
        path: uri.path().to_string(),
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null),
    });

    if let Some((status, body)) = state.reply.lock().unwrap().clone() {
        return (StatusCode::from_u16(status).unwrap(), body).into_response();
    }

    if method == Method::DELETE {
        return StatusCode::NO_CONTENT.into_response();
    }

    let delay = *state.create_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let n = state.issued.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::CREATED, format!(r#"{{"id":"str-{}"}}"#, n)).into_response()
}
