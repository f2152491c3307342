//! Scripted control + broadcast server for unit tests.
//!
//! One axum app serves both legs on a loopback port:
//! ```text
//! POST /api/device/*      control plane (records every request, scripted failures)
//! GET  /app/{key}         broadcast socket (handshake, signed subscribe, pushes)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chief_protocol::device::{paths, BroadcastParams};
use chief_protocol::pusher::{events, sign_channel, PusherFrame};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::ControlConfig;

/// Path used in the request log for socket-side events.
pub(crate) const WS_SUBSCRIBE: &str = "ws:subscribe";
pub(crate) const WS_PING: &str = "ws:ping";
pub(crate) const WS_PONG: &str = "ws:pong";

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub path: String,
    pub auth: Option<String>,
    pub body: Value,
}

/// What a fresh socket hears before the client may subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opening {
    Established,
    /// An unrelated event, then `connection_established`
    NoiseFirst,
    /// `pusher:error` 4001 instead of the handshake
    ErrorFirst,
    /// Nothing at all
    Silent,
}

enum Push {
    Frame(String),
    Drop,
}

struct MockState {
    port: u16,
    requests: Mutex<Vec<RecordedRequest>>,
    failures: Mutex<HashMap<String, VecDeque<u16>>>,
    sessions: AtomicU64,
    socket_seq: AtomicU64,
    sockets: Mutex<Vec<(u64, mpsc::UnboundedSender<Push>)>>,
    activity_timeout: AtomicU64,
    reject_subscriptions: AtomicBool,
    opening: Mutex<Opening>,
}

impl MockState {
    fn record(&self, path: &str, auth: Option<String>, body: Value) {
        self.requests
            .lock()
            .unwrap()
            .push(RecordedRequest {
                path: path.to_string(),
                auth,
                body,
            });
    }

    fn take_failure(&self, path: &str) -> Option<u16> {
        self.failures
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(|queue| queue.pop_front())
    }
}

pub(crate) struct MockServer {
    pub base_url: String,
    state: Arc<MockState>,
}

impl MockServer {
    pub const DEVICE_ID: i64 = 42;
    pub const APP_KEY: &'static str = "test-app-key";
    pub const APP_SECRET: &'static str = "test-app-secret";

    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(MockState {
            port,
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            sessions: AtomicU64::new(0),
            socket_seq: AtomicU64::new(0),
            sockets: Mutex::new(Vec::new()),
            activity_timeout: AtomicU64::new(120),
            reject_subscriptions: AtomicBool::new(false),
            opening: Mutex::new(Opening::Established),
        });

        let app = Router::new()
            .route(paths::CONNECT, post(connect))
            .route(paths::DISCONNECT, post(ack_disconnect))
            .route(paths::HEARTBEAT, post(ack_heartbeat))
            .route(paths::MESSAGES, post(ingest))
            .route(paths::CHANNEL_AUTH, post(channel_auth))
            .route("/app/{key}", get(ws_handler))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        MockServer {
            base_url: format!("http://127.0.0.1:{port}"),
            state,
        }
    }

    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            server_url: self.base_url.clone(),
            chief_version: "0.0.0-test".into(),
            device_name: "test-device".into(),
            request_timeout: Duration::from_secs(5),
            max_response_bytes: 64 * 1024,
        }
    }

    pub fn broadcast_params(&self) -> BroadcastParams {
        BroadcastParams {
            key: Self::APP_KEY.into(),
            host: "127.0.0.1".into(),
            port: self.state.port,
            scheme: "http".into(),
        }
    }

    /// The next calls to `path` answer with these statuses, in order.
    pub fn fail_next(&self, path: &str, statuses: &[u16]) {
        self.state
            .failures
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .extend(statuses.iter().copied());
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.path).collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }

    pub fn set_activity_timeout(&self, secs: u64) {
        self.state.activity_timeout.store(secs, Ordering::SeqCst);
    }

    pub fn reject_subscriptions(&self, reject: bool) {
        self.state
            .reject_subscriptions
            .store(reject, Ordering::SeqCst);
    }

    /// Applies to sockets opened from now on.
    pub fn set_opening(&self, opening: Opening) {
        *self.state.opening.lock().unwrap() = opening;
    }

    pub fn live_sockets(&self) -> usize {
        self.state.sockets.lock().unwrap().len()
    }

    /// Sends a raw frame to every live socket.
    pub fn push_frame(&self, frame: Value) {
        let text = frame.to_string();
        self.state
            .sockets
            .lock()
            .unwrap()
            .retain(|(_, tx)| tx.send(Push::Frame(text.clone())).is_ok());
    }

    /// Pushes a `chief.command` with the payload string-encoded, like the server does.
    pub fn push_command(&self, channel: &str, payload: Value) {
        self.push_frame(json!({
            "event": events::COMMAND,
            "channel": channel,
            "data": payload.to_string(),
        }));
    }

    /// Closes every live socket without a close frame.
    pub fn drop_sockets(&self) {
        for (_, tx) in self.state.sockets.lock().unwrap().iter() {
            let _ = tx.send(Push::Drop);
        }
    }
}

/// Polls `condition` every 10ms for up to 5s.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// =============================================================================
// Control Plane Handlers
// =============================================================================

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn parse_body(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

fn scripted(state: &MockState, path: &str) -> Option<Response> {
    let status = state.take_failure(path)?;
    let status = StatusCode::from_u16(status).unwrap();
    Some(
        (
            status,
            Json(json!({"error": "scripted", "message": format!("scripted {}", status.as_u16())})),
        )
            .into_response(),
    )
}

async fn connect(State(state): State<Arc<MockState>>, headers: HeaderMap, body: Bytes) -> Response {
    state.record(paths::CONNECT, bearer(&headers), parse_body(&body));
    if let Some(response) = scripted(&state, paths::CONNECT) {
        return response;
    }
    let session = state.sessions.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "type": "welcome",
        "protocol_version": 1,
        "device_id": MockServer::DEVICE_ID,
        "session_id": format!("sess-{session}"),
        "reverb": {
            "key": MockServer::APP_KEY,
            "host": "127.0.0.1",
            "port": state.port,
            "scheme": "http",
        }
    }))
    .into_response()
}

async fn ack_disconnect(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.record(paths::DISCONNECT, bearer(&headers), parse_body(&body));
    scripted(&state, paths::DISCONNECT).unwrap_or_else(|| Json(json!({"ok": true})).into_response())
}

async fn ack_heartbeat(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.record(paths::HEARTBEAT, bearer(&headers), parse_body(&body));
    scripted(&state, paths::HEARTBEAT).unwrap_or_else(|| StatusCode::NO_CONTENT.into_response())
}

async fn ingest(State(state): State<Arc<MockState>>, headers: HeaderMap, body: Bytes) -> Response {
    let body = parse_body(&body);
    state.record(paths::MESSAGES, bearer(&headers), body.clone());
    if let Some(response) = scripted(&state, paths::MESSAGES) {
        return response;
    }
    let accepted = body["messages"].as_array().map(Vec::len).unwrap_or(0);
    let session = state.sessions.load(Ordering::SeqCst);
    Json(json!({
        "accepted": accepted,
        "batch_id": body["batch_id"],
        "session_id": format!("sess-{session}"),
    }))
    .into_response()
}

async fn channel_auth(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = parse_body(&body);
    state.record(paths::CHANNEL_AUTH, bearer(&headers), body.clone());
    if let Some(response) = scripted(&state, paths::CHANNEL_AUTH) {
        return response;
    }
    let socket_id = body["socket_id"].as_str().unwrap_or_default();
    let channel = body["channel_name"].as_str().unwrap_or_default();
    let auth = sign_channel(MockServer::APP_KEY, MockServer::APP_SECRET, socket_id, channel).unwrap();
    Json(json!({ "auth": auth })).into_response()
}

// =============================================================================
// Broadcast Socket
// =============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(key): Path<String>,
    State(state): State<Arc<MockState>>,
) -> Response {
    if key != MockServer::APP_KEY {
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<MockState>) {
    let seq = state.socket_seq.fetch_add(1, Ordering::SeqCst) + 1;
    let socket_id = format!("{}.{}", 1000 + seq, 5000 + seq);
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    state.sockets.lock().unwrap().push((seq, push_tx));

    let established = json!({
        "event": events::CONNECTION_ESTABLISHED,
        "data": json!({
            "socket_id": socket_id,
            "activity_timeout": state.activity_timeout.load(Ordering::SeqCst),
        })
        .to_string(),
    });

    let opening = *state.opening.lock().unwrap();
    let greeting = match opening {
        Opening::Established => vec![established],
        Opening::NoiseFirst => vec![
            json!({"event": "pusher:cache_miss", "data": "{}"}),
            established,
        ],
        Opening::ErrorFirst => vec![json!({
            "event": events::ERROR,
            "data": {"code": 4001, "message": "Application does not exist"},
        })],
        Opening::Silent => Vec::new(),
    };

    let mut open = true;
    for frame in greeting {
        if socket
            .send(Message::Text(frame.to_string().into()))
            .await
            .is_err()
        {
            open = false;
            break;
        }
    }

    if open {
        loop {
            tokio::select! {
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let Some(reply) = on_client_frame(&state, &socket_id, text.as_str()) else {
                            continue;
                        };
                        if socket.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                push = push_rx.recv() => match push {
                    Some(Push::Frame(text)) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Push::Drop) | None => break,
                },
            }
        }
    }

    state.sockets.lock().unwrap().retain(|(id, _)| *id != seq);
}

fn on_client_frame(state: &MockState, socket_id: &str, text: &str) -> Option<String> {
    let frame = PusherFrame::parse(text).ok()?;
    match frame.event.as_str() {
        events::SUBSCRIBE => {
            state.record(WS_SUBSCRIBE, None, frame.data.clone());
            let channel = frame.data["channel"].as_str().unwrap_or_default();
            let auth = frame.data["auth"].as_str().unwrap_or_default();
            let expected =
                sign_channel(MockServer::APP_KEY, MockServer::APP_SECRET, socket_id, channel).ok()?;

            if auth != expected || state.reject_subscriptions.load(Ordering::SeqCst) {
                return Some(
                    json!({
                        "event": events::ERROR,
                        "data": {"code": 4009, "message": "Connection is unauthorized"},
                    })
                    .to_string(),
                );
            }
            Some(
                json!({
                    "event": events::SUBSCRIPTION_SUCCEEDED,
                    "channel": channel,
                    "data": "{}",
                })
                .to_string(),
            )
        }
        events::PING => {
            state.record(WS_PING, None, Value::Null);
            PusherFrame::pong().to_json().ok()
        }
        events::PONG => {
            state.record(WS_PONG, None, Value::Null);
            None
        }
        _ => None,
    }
}
