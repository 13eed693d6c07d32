//! In-process MCP servers for integration tests.
#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header::AUTHORIZATION},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;

const SESSION_ID: &str = "mock-session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// POST /mcp answers with JSON bodies.
    Streamable,
    /// POST /mcp answers `tools/call` with an event-stream body.
    StreamableEventBodies,
    /// POST /mcp is refused; only the legacy SSE endpoints work.
    SseOnly,
    /// Accepts connections but never answers.
    Hanging,
    /// Completes the handshake, then never answers `tools/list` or DELETE.
    StalledDiscovery,
}

#[derive(Clone)]
struct MockState {
    name: String,
    tools: Arc<Vec<String>>,
    mode: Mode,
    sse: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    calls: Arc<AtomicUsize>,
    endpoint: Arc<Mutex<String>>,
    last_auth: Arc<Mutex<Option<String>>>,
    refusing: Arc<AtomicBool>,
}

pub struct MockServer {
    pub addr: SocketAddr,
    state: MockState,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(name: &str, tools: &[&str], mode: Mode) -> Self {
        let state = MockState {
            name: name.to_string(),
            tools: Arc::new(tools.iter().map(ToString::to_string).collect()),
            mode,
            sse: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicUsize::new(0)),
            endpoint: Arc::new(Mutex::new("/messages?session_id=mock".to_string())),
            last_auth: Arc::new(Mutex::new(None)),
            refusing: Arc::new(AtomicBool::new(false)),
        };

        let app = Router::new()
            .route("/mcp", post(streamable_post).delete(streamable_delete))
            .route("/sse", get(sse_stream))
            .route("/messages", post(sse_post))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state, task }
    }

    pub fn streamable_url(&self) -> String {
        format!("http://{}/mcp", self.addr)
    }

    pub fn sse_url(&self) -> String {
        format!("http://{}/sse", self.addr)
    }

    /// End the open SSE stream as if the server went away.
    pub fn drop_sse_stream(&self) {
        self.state.sse.lock().unwrap().take();
    }

    /// Answer every later `initialize` with 503.
    pub fn refuse_new_sessions(&self) {
        self.state.refusing.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Message endpoint announced to later SSE clients.
    pub fn announce_endpoint(&self, endpoint: impl Into<String>) {
        *self.state.endpoint.lock().unwrap() = endpoint.into();
    }

    pub fn messages_url(&self) -> String {
        format!("http://{}/messages?session_id=mock", self.addr)
    }

    pub fn last_auth(&self) -> Option<String> {
        self.state.last_auth.lock().unwrap().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A URL nothing listens on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/mcp")
}

fn tool_json(name: &str) -> Value {
    if name.starts_with("add_") {
        json!({
            "name": name,
            "description": format!("{name} tool"),
            "inputSchema": {
                "type": "object",
                "properties": {
                    "amount": {"type": "number"},
                    "note": {"type": "string"}
                },
                "required": ["amount"]
            }
        })
    } else {
        json!({
            "name": name,
            "description": format!("{name} tool"),
            "inputSchema": {"type": "object", "properties": {"month": {"type": "string"}}}
        })
    }
}

fn text(value: &str) -> Value {
    json!({"content": [{"type": "text", "text": value}]})
}

impl MockState {
    async fn handle(&self, method: &str, params: &Value) -> Result<Value, (i64, String)> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": self.name, "version": "0.0.1"}
            })),
            "tools/list" if self.mode == Mode::StalledDiscovery => std::future::pending().await,
            "tools/list" => Ok(json!({
                "tools": self.tools.iter().map(|t| tool_json(t)).collect::<Vec<_>>()
            })),
            "tools/call" => {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let tool = params["name"].as_str().unwrap_or_default();
                let args = params["arguments"].clone();
                if !self.tools.iter().any(|t| t == tool) {
                    return Err((-32602, format!("unknown tool {tool}")));
                }
                match tool {
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        Ok(text("slow done"))
                    }
                    "explode" => Ok(json!({
                        "content": [{"type": "text", "text": "boom"}],
                        "isError": true
                    })),
                    _ => Ok(text(&format!("{}:{}:{}", self.name, tool, args))),
                }
            }
            "ping" => Ok(json!({})),
            _ => Err((-32601, "Method not found".to_string())),
        }
    }

    async fn answer(&self, body: &Value) -> Option<Value> {
        let id = body.get("id")?.clone();
        let method = body.get("method")?.as_str()?.to_string();
        let params = body.get("params").cloned().unwrap_or(Value::Null);
        Some(match self.handle(&method, &params).await {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        })
    }
}

async fn streamable_post(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    match state.mode {
        Mode::SseOnly => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
        Mode::Hanging => return std::future::pending().await,
        Mode::Streamable | Mode::StreamableEventBodies | Mode::StalledDiscovery => {}
    }

    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        *state.last_auth.lock().unwrap() = Some(auth.to_string());
    }

    let method = body["method"].as_str().unwrap_or_default().to_string();
    let has_session = headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) == Some(SESSION_ID);
    if method == "initialize" && state.refusing.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if method != "initialize" && !has_session {
        return (StatusCode::BAD_REQUEST, "missing session id").into_response();
    }

    let Some(reply) = state.answer(&body).await else {
        return StatusCode::ACCEPTED.into_response();
    };

    if method == "tools/call" && state.mode == Mode::StreamableEventBodies {
        let event = Event::default().event("message").data(reply.to_string());
        return Sse::new(stream::once(async move { Ok::<_, Infallible>(event) })).into_response();
    }

    let mut response = Json(reply).into_response();
    if method == "initialize" {
        response
            .headers_mut()
            .insert("mcp-session-id", HeaderValue::from_static(SESSION_ID));
    }
    response
}

async fn streamable_delete(State(state): State<MockState>) -> StatusCode {
    if state.mode == Mode::StalledDiscovery {
        return std::future::pending().await;
    }
    StatusCode::OK
}

async fn sse_stream(State(state): State<MockState>, headers: HeaderMap) -> Response {
    if state.mode == Mode::Hanging {
        return std::future::pending().await;
    }
    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        *state.last_auth.lock().unwrap() = Some(auth.to_string());
    }

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    *state.sse.lock().unwrap() = Some(tx);

    let announced = state.endpoint.lock().unwrap().clone();
    let endpoint = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(announced))
    });
    let messages = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, Infallible>(Event::default().event("message").data(data)));

    Sse::new(endpoint.chain(messages)).into_response()
}

async fn sse_post(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        *state.last_auth.lock().unwrap() = Some(auth.to_string());
    }
    let Some(tx) = state.sse.lock().unwrap().clone() else {
        return StatusCode::NOT_FOUND;
    };
    tokio::spawn(async move {
        if let Some(reply) = state.answer(&body).await {
            let _ = tx.send(reply.to_string());
        }
    });
    StatusCode::ACCEPTED
}
