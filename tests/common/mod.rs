//! Shared fixtures: an in-process fake runtime and recording collaborators

#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use ollama_manager::download::{DownloadSink, PullProgress};
use ollama_manager::notify::Notifier;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted answer for `POST /api/pull`
#[derive(Debug, Clone)]
pub enum PullScript {
    /// Stream these records, then close the stream
    Lines(Vec<String>),
    /// Stream these records, then keep the response open forever
    Stall(Vec<String>),
    /// Fail the request with this status
    Status(u16),
}

#[derive(Default)]
pub struct FakeState {
    /// Installed models as `/api/tags` reports them
    pub installed: Mutex<Vec<serde_json::Value>>,
    pub scripts: Mutex<HashMap<String, PullScript>>,
    /// Models installed once their pull is requested
    pub install_on_pull: Mutex<HashMap<String, serde_json::Value>>,
    pub pull_requests: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeState {
    pub fn install(&self, name: &str, parameter_size: &str) {
        self.installed.lock().unwrap().push(tag(name, parameter_size));
    }

    pub fn script(&self, model: &str, script: PullScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(model.to_string(), script);
    }

    pub fn install_when_pulled(&self, name: &str, parameter_size: &str) {
        self.install_on_pull
            .lock()
            .unwrap()
            .insert(name.to_string(), tag(name, parameter_size));
    }
}

pub fn tag(name: &str, parameter_size: &str) -> serde_json::Value {
    json!({
        "name": name,
        "model": name,
        "size": 4_661_224_676u64,
        "modified_at": "2024-05-01T10:00:00Z",
        "digest": "365c0bd3c000",
        "details": { "family": "llama", "format": "gguf", "parameter_size": parameter_size }
    })
}

/// Progress records of a typical pull ending in `success`
pub fn successful_pull() -> Vec<String> {
    vec![
        r#"{"status":"pulling manifest"}"#.to_string(),
        r#"{"status":"pulling 6a0746a1ec1a","digest":"sha256:6a07","total":100,"completed":40}"#
            .to_string(),
        r#"{"status":"pulling 6a0746a1ec1a","digest":"sha256:6a07","total":100,"completed":100}"#
            .to_string(),
        r#"{"status":"verifying sha256 digest"}"#.to_string(),
        r#"{"status":"writing manifest"}"#.to_string(),
        r#"{"status":"success"}"#.to_string(),
    ]
}

#[derive(Deserialize)]
struct NameRequest {
    name: String,
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({ "version": "0.3.12" }))
}

async fn tags(State(state): State<Arc<FakeState>>) -> Json<serde_json::Value> {
    let models = state.installed.lock().unwrap().clone();
    Json(json!({ "models": models }))
}

async fn pull(State(state): State<Arc<FakeState>>, Json(request): Json<NameRequest>) -> Response {
    state.pull_requests.lock().unwrap().push(request.name.clone());

    let script = state
        .scripts
        .lock()
        .unwrap()
        .get(&request.name)
        .cloned()
        .unwrap_or_else(|| PullScript::Lines(successful_pull()));

    if let Some(model) = state.install_on_pull.lock().unwrap().remove(&request.name) {
        state.installed.lock().unwrap().push(model);
    }

    let (lines, stall) = match script {
        PullScript::Status(code) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return (status, "pull refused").into_response();
        }
        PullScript::Lines(lines) => (lines, false),
        PullScript::Stall(lines) => (lines, true),
    };

    let chunks = futures::stream::iter(
        lines
            .into_iter()
            .map(|line| Ok::<_, std::io::Error>(Bytes::from(format!("{}\n", line)))),
    );

    let body = if stall {
        Body::from_stream(futures::StreamExt::chain(chunks, futures::stream::pending()))
    } else {
        Body::from_stream(chunks)
    };

    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}

async fn remove(State(state): State<Arc<FakeState>>, Json(request): Json<NameRequest>) -> StatusCode {
    let mut installed = state.installed.lock().unwrap();
    let before = installed.len();
    installed.retain(|m| m["name"] != request.name.as_str());

    if installed.len() == before {
        return StatusCode::NOT_FOUND;
    }
    state.deleted.lock().unwrap().push(request.name);
    StatusCode::OK
}

/// Fake runtime HTTP surface on an ephemeral loopback port
pub struct FakeOllama {
    pub address: String,
    pub state: Arc<FakeState>,
}

impl FakeOllama {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new()
            .route("/api/version", get(version))
            .route("/api/tags", get(tags))
            .route("/api/pull", post(pull))
            .route("/api/delete", delete(remove))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { address, state }
    }
}

// ============================================================================
// Recording collaborators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Error,
    Info,
    Warning,
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<(NoticeKind, String)>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<(NoticeKind, String)> {
        self.notices.lock().unwrap().clone()
    }

    pub fn count(&self, kind: NoticeKind) -> usize {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    fn push(&self, kind: NoticeKind, message: &str) {
        self.notices.lock().unwrap().push((kind, message.to_string()));
    }
}

impl Notifier for RecordingNotifier {
    fn success(&self, message: &str) {
        self.push(NoticeKind::Success, message);
    }
    fn error(&self, message: &str) {
        self.push(NoticeKind::Error, message);
    }
    fn info(&self, message: &str) {
        self.push(NoticeKind::Info, message);
    }
    fn warning(&self, message: &str) {
        self.push(NoticeKind::Warning, message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Started(String),
    Progress(String, String),
    Stopped(String),
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, model: &str) -> Vec<SinkEvent> {
        self.events()
            .into_iter()
            .filter(|e| match e {
                SinkEvent::Started(m) | SinkEvent::Progress(m, _) | SinkEvent::Stopped(m) => m == model,
            })
            .collect()
    }
}

impl DownloadSink for RecordingSink {
    fn started(&self, model: &str) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Started(model.to_string()));
    }

    fn progress(&self, model: &str, progress: &PullProgress) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Progress(model.to_string(), progress.status.clone()));
    }

    fn stopped(&self, model: &str) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Stopped(model.to_string()));
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
