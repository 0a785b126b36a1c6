//! Test harness: an in-process backend double and a server spawner.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use genq_gateway::backend::DATA_VERSION_HEADER;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub const BACKEND_RETRY_AFTER_SECS: u64 = 7;

/// Backend double. `/query` answers one NDJSON row per call; a `None`
/// version makes both endpoints answer 503.
#[derive(Clone, Default)]
pub struct MockBackend {
    version: Arc<Mutex<Option<String>>>,
    query_calls: Arc<AtomicUsize>,
    last_query: Arc<Mutex<Option<serde_json::Value>>>,
}

impl MockBackend {
    pub fn with_version(version: &str) -> Self {
        let mock = Self::default();
        mock.set_version(Some(version));
        mock
    }

    pub fn set_version(&self, version: Option<&str>) {
        if let Ok(mut current) = self.version.lock() {
            *current = version.map(str::to_string);
        }
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn last_query(&self) -> Option<serde_json::Value> {
        self.last_query.lock().ok().and_then(|q| q.clone())
    }

    fn version(&self) -> Option<String> {
        self.version.lock().ok().and_then(|v| v.clone())
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/info", get(mock_info))
            .route("/query", post(mock_query))
            .with_state(self.clone())
    }
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, BACKEND_RETRY_AFTER_SECS.to_string())],
        Json(serde_json::json!({
            "error": "Service Temporarily Unavailable",
            "message": "database is preprocessing"
        })),
    )
        .into_response()
}

async fn mock_info(State(mock): State<MockBackend>) -> Response {
    match mock.version() {
        Some(version) => (
            [(DATA_VERSION_HEADER, version)],
            r#"{"version":"0.4.0"}"#,
        )
            .into_response(),
        None => unavailable(),
    }
}

async fn mock_query(
    State(mock): State<MockBackend>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let Some(version) = mock.version() else {
        return unavailable();
    };

    mock.query_calls.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut last) = mock.last_query.lock() {
        *last = Some(body);
    }

    (
        [(DATA_VERSION_HEADER, version)],
        "{\"count\":42,\"country\":\"Switzerland\"}\n{\"count\":7,\"country\":\"Germany\"}\n",
    )
        .into_response()
}

pub async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

/// Writes `contents` to a fresh file under the system temp dir.
pub fn write_temp_file(name: &str, contents: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let suffix = COUNTER.fetch_add(1, Ordering::Relaxed);

    let dir = std::env::temp_dir().join(format!("genq_e2e_{}_{}", std::process::id(), suffix));
    std::fs::create_dir_all(&dir).expect("temp dir create should succeed");
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("temp file write should succeed");
    path
}
