use super::constants::*;
use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Default)]
struct BackendState {
    /// Token of every stream request, in order.
    stream_tokens: Vec<String>,
    /// Open streams; dropping a sender ends that stream.
    streams: Vec<mpsc::UnboundedSender<String>>,
    notifications: Vec<Value>,
    unread: u64,
    list_requests: usize,
}

type SharedState = Arc<Mutex<BackendState>>;

/// Fake backend on an ephemeral port.
pub struct TestServer {
    pub base_url: String,
    state: SharedState,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let state: SharedState = Arc::new(Mutex::new(BackendState::default()));

        let app = Router::new()
            .route("/notifications", get(list_notifications))
            .route("/notifications/unread-count", get(unread_count))
            .route("/notifications/stream", get(stream))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        Self {
            base_url,
            state,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn stream_tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().stream_tokens.clone()
    }

    /// Stream requests received so far, including ended ones.
    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().stream_tokens.len()
    }

    pub fn list_requests(&self) -> usize {
        self.state.lock().unwrap().list_requests
    }

    pub async fn wait_for_connections(&self, count: usize) {
        let start = std::time::Instant::now();
        while self.connection_count() < count {
            if start.elapsed() > Duration::from_millis(WAIT_TIMEOUT_MS) {
                panic!(
                    "Expected {} stream connections, got {}",
                    count,
                    self.connection_count()
                );
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    /// Send one frame on every open stream.
    pub fn push(&self, frame: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .streams
            .retain(|stream| stream.send(frame.to_string()).is_ok());
    }

    /// End every open stream, as a server restart would.
    pub fn drop_streams(&self) {
        self.state.lock().unwrap().streams.clear();
    }

    /// What `GET /notifications` returns, newest first.
    pub fn set_notifications(&self, notifications: Vec<Value>) {
        self.state.lock().unwrap().notifications = notifications;
    }

    pub fn set_unread(&self, count: u64) {
        self.state.lock().unwrap().unread = count;
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.lock().unwrap().streams.clear();
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn stream(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handshake = json!({
        "type": "connection",
        "message": "Connected to notification stream",
    });
    let _ = tx.send(handshake.to_string());
    {
        let mut state = state.lock().unwrap();
        state
            .stream_tokens
            .push(params.get("token").cloned().unwrap_or_default());
        state.streams.push(tx);
    }

    let frames = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|data| (Ok::<_, Infallible>(Event::default().data(data)), rx))
    });
    Sse::new(frames)
}

async fn list_notifications(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let mut state = state.lock().unwrap();
    state.list_requests += 1;
    let page: usize = params
        .get("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(1);
    let per_page: usize = params
        .get("perPage")
        .and_then(|p| p.parse().ok())
        .unwrap_or(20);
    let items: Vec<Value> = state
        .notifications
        .iter()
        .skip((page.saturating_sub(1)) * per_page)
        .take(per_page)
        .cloned()
        .collect();
    Json(json!({
        "notifications": items,
        "totalCount": state.notifications.len(),
        "currentPage": page,
        "perPage": per_page,
    }))
}

async fn unread_count(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "count": state.lock().unwrap().unread }))
}
