//! One live conversation with one MCP server.
//!
//! A [`Session`] runs an rmcp client service over the transport that won the
//! candidate walk. rmcp correlates responses with requests, so calls can be
//! pipelined and may complete out of order; the session adds the lifecycle,
//! per-call deadlines and cancellation on top.
//!
//! Losing the channel moves a session to `failed`. For SSE that happens as
//! soon as the event stream ends. A streamable session whose server offers
//! no standing GET stream only finds out on its next request.

use crate::mcp::{
    config::{ServerConfig, TransportCandidate, TransportKind},
    error::{AttemptFailure, CandidateFailure, ConnectError, DiscoveryError, McpError, RequestError},
    policy,
    registry::ToolDescriptor,
    transport::{self, Monitored, SseClientTransport},
};
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, ClientInfo, ErrorCode, RawContent, ServerInfo},
    service::{Peer, RoleClient, RunningService, ServiceError, ServiceExt},
    transport::Transport,
};
use serde::Serialize;
use serde_json::Value;
use std::{
    fmt,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tokio::{
    sync::{Mutex, watch},
    time::Instant,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on tearing down the rmcp service during `close`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Ready,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Ready | Self::Closed | Self::Failed)
                | (Self::Ready, Self::Closed | Self::Failed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


/// Name and version this client announces during `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub name: String,
    pub version: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ClientIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    fn to_client_info(&self) -> ClientInfo {
        let mut info = ClientInfo::default();
        info.client_info.name.clone_from(&self.name);
        info.client_info.version.clone_from(&self.version);
        info
    }
}

/// Per-session knobs handed down by the client.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub http: reqwest::Client,
    pub client_info: ClientIdentity,
    pub call_timeout: Duration,
    /// Cancelling this cancels the session and everything in flight on it.
    pub parent: CancellationToken,
}

/// Join the text blocks of a tool result, one per line.
pub fn text_content(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|content| match &content.raw {
            RawContent::Text(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

type ClientService = RunningService<RoleClient, ClientInfo>;

pub struct Session {
    id: SessionId,
    server: String,
    kind: TransportKind,
    url: String,
    state: watch::Sender<SessionState>,
    peer: Peer<RoleClient>,
    service: Mutex<Option<ClientService>>,
    server_info: Option<ServerInfo>,
    call_timeout: Duration,
    tools: RwLock<Arc<[ToolDescriptor]>>,
    /// Cancels in-flight requests; fired by `close` and the client's shutdown.
    cancel: CancellationToken,
    /// Stops the rmcp service without cancelling in-flight requests, so they
    /// observe the lost connection instead.
    halt: CancellationToken,
    _cancel_on_drop: DropGuard,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("state", &self.state())
            .field("tools", &self.tool_count())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Walk the server's transport candidates until one completes the
    /// `initialize` handshake, or every candidate has failed.
    pub async fn open(
        server: &str,
        config: &ServerConfig,
        settings: &SessionSettings,
        deadline: Instant,
    ) -> Result<Arc<Self>, ConnectError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let mut attempts = Vec::new();

        for candidate in policy::candidate_plan(config) {
            let reason = if settings.parent.is_cancelled() {
                AttemptFailure::Cancelled
            } else if Instant::now() >= deadline {
                AttemptFailure::TimedOut(budget)
            } else {
                let attempt = Self::attempt(server, &candidate, settings);
                let outcome = tokio::select! {
                    () = settings.parent.cancelled() => Err(AttemptFailure::Cancelled),
                    result = tokio::time::timeout_at(deadline, attempt) => {
                        result.unwrap_or(Err(AttemptFailure::TimedOut(budget)))
                    }
                };
                match outcome {
                    Ok(session) => {
                        info!(
                            name: "mcp.session.connected",
                            server = %server,
                            transport = %candidate.kind,
                            url = %candidate.url,
                            session_id = %session.id(),
                            "connected to MCP server"
                        );
                        return Ok(session);
                    }
                    Err(reason) => reason,
                }
            };

            warn!(
                name: "mcp.transport.candidate_failed",
                server = %server,
                transport = %candidate.kind,
                url = %candidate.url,
                error = %reason,
                "transport candidate failed"
            );
            let stop = !policy::should_fall_back(&reason);
            attempts.push(CandidateFailure {
                kind: candidate.kind,
                url: candidate.url,
                reason,
            });
            if stop {
                break;
            }
        }

        Err(ConnectError {
            server: server.to_string(),
            attempts,
        })
    }

    async fn attempt(
        server: &str,
        candidate: &TransportCandidate,
        settings: &SessionSettings,
    ) -> Result<Arc<Self>, AttemptFailure> {
        let http = transport::authorized_client(&settings.http, candidate.credentials.as_ref())
            .map_err(AttemptFailure::Transport)?;
        match candidate.kind {
            TransportKind::Streamable => {
                let channel =
                    transport::streamable(&candidate.url, http).map_err(AttemptFailure::Transport)?;
                Self::establish(server, candidate.kind, &candidate.url, channel, settings).await
            }
            TransportKind::Sse => {
                let channel = SseClientTransport::connect(&candidate.url, http)
                    .await
                    .map_err(AttemptFailure::Transport)?;
                Self::establish(server, candidate.kind, &candidate.url, channel, settings).await
            }
        }
    }

    /// Run the `initialize` handshake over an already-open channel.
    ///
    /// rmcp drops the channel again when the handshake fails.
    pub async fn establish<T>(
        server: &str,
        kind: TransportKind,
        url: &str,
        channel: T,
        settings: &SessionSettings,
    ) -> Result<Arc<Self>, AttemptFailure>
    where
        T: Transport<RoleClient> + 'static,
    {
        let cancel = settings.parent.child_token();
        let halt = cancel.child_token();
        let lost = CancellationToken::new();

        let service = settings
            .client_info
            .to_client_info()
            .serve_with_ct(Monitored::new(channel, lost.clone()), halt.clone())
            .await
            .map_err(AttemptFailure::Handshake)?;

        let server_info = service.peer_info().cloned();
        if let Some(remote) = &server_info {
            info!(
                name: "mcp.session.initialized",
                server = %server,
                transport = %kind,
                protocol_version = ?remote.protocol_version,
                remote = %remote.server_info.name,
                "MCP handshake complete"
            );
        }

        let (state, _) = watch::channel(SessionState::Connecting);
        let session = Arc::new(Self {
            id: SessionId::new(),
            server: server.to_string(),
            kind,
            url: url.to_string(),
            state,
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
            server_info,
            call_timeout: settings.call_timeout,
            tools: RwLock::new(Arc::from(Vec::new())),
            cancel: cancel.clone(),
            halt,
            _cancel_on_drop: cancel.clone().drop_guard(),
        });
        session.transition(SessionState::Ready);

        let watched = Arc::downgrade(&session);
        tokio::spawn(async move {
            tokio::select! {
                () = lost.cancelled() => {
                    if let Some(session) = watched.upgrade() {
                        session.fail(&"connection closed by server");
                    }
                }
                () = cancel.cancelled() => {}
            }
        });

        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    fn fail(&self, error: &dyn fmt::Display) {
        if self.transition(SessionState::Failed) {
            warn!(
                name: "mcp.session.failed",
                server = %self.server,
                session_id = %self.id,
                error = %error,
                "MCP session failed"
            );
            self.halt.cancel();
        }
    }

    /// Resolves once the session is `closed` or `failed`.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_closed) => self.state(),
        }
    }

    /// What the server reported about itself during `initialize`.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Tools from the last successful `list_tools`.
    pub fn tools(&self) -> Arc<[ToolDescriptor]> {
        Arc::clone(&self.tools.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn tool_count(&self) -> usize {
        self.tools().len()
    }

    fn has_tool(&self, remote_name: &str) -> bool {
        self.tools().iter().any(|t| t.remote_name() == remote_name)
    }

    /// Bound a request by the call timeout and the session's cancellation.
    async fn guarded<T>(
        &self,
        request: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, RequestError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(RequestError::Cancelled),
            result = tokio::time::timeout(self.call_timeout, request) => match result {
                Ok(outcome) => outcome.map_err(RequestError::from),
                Err(_elapsed) => Err(RequestError::Timeout(self.call_timeout)),
            },
        }
    }

    /// Fetch every page of `tools/list` and remember the result.
    pub async fn list_tools(&self) -> Result<Arc<[ToolDescriptor]>, DiscoveryError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(self.discovery_error(RequestError::Unavailable(state)));
        }

        let remote = match self.guarded(self.peer.list_all_tools()).await {
            Ok(remote) => remote,
            Err(RequestError::Rpc { code, .. }) if code == i64::from(ErrorCode::METHOD_NOT_FOUND.0) => {
                debug!(server = %self.server, "server does not implement tools/list");
                Vec::new()
            }
            Err(err) => {
                if !matches!(err, RequestError::Cancelled) {
                    self.fail(&err);
                }
                return Err(self.discovery_error(err));
            }
        };

        let tools: Arc<[ToolDescriptor]> = remote
            .iter()
            .map(|tool| ToolDescriptor::from_remote(tool, &self.server, self.id))
            .collect();
        for tool in tools.iter() {
            debug!(
                name: "mcp.tool.discovered",
                server = %self.server,
                tool = %tool.name(),
                "MCP tool discovered"
            );
        }

        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&tools);
        Ok(tools)
    }

    fn discovery_error(&self, source: RequestError) -> DiscoveryError {
        DiscoveryError {
            server: self.server.clone(),
            source,
        }
    }

    /// Invoke a tool by the name this server knows it under.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(McpError::SessionUnavailable {
                server: self.server.clone(),
                state,
            });
        }
        if !self.has_tool(name) {
            return Err(McpError::UnknownTool {
                name: name.to_string(),
            });
        }

        let arguments = match arguments {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(McpError::InvalidArguments {
                    tool: name.to_string(),
                    reason: format!("expected a JSON object, got {other}"),
                });
            }
        };
        let params = CallToolRequestParam {
            name: name.to_string().into(),
            arguments: Some(arguments),
        };

        debug!(name: "mcp.tool.call", server = %self.server, tool = %name, "calling MCP tool");
        match self.guarded(self.peer.call_tool(params)).await {
            Ok(result) if result.is_error == Some(true) => Err(McpError::Tool {
                server: self.server.clone(),
                tool: name.to_string(),
                message: text_content(&result),
                code: None,
                result: Some(result),
            }),
            Ok(result) => Ok(result),
            Err(RequestError::Rpc { code, message, .. }) => Err(McpError::Tool {
                server: self.server.clone(),
                tool: name.to_string(),
                message,
                code: Some(code),
                result: None,
            }),
            Err(RequestError::Cancelled) => Err(McpError::Cancelled {
                server: self.server.clone(),
                operation: "tools/call",
            }),
            Err(err) => {
                if err.is_disconnect() {
                    self.fail(&err);
                }
                Err(McpError::Invocation {
                    server: self.server.clone(),
                    tool: name.to_string(),
                    source: err,
                })
            }
        }
    }

    /// Close the session. Safe from any state and safe to repeat.
    ///
    /// Waits at most a couple of seconds for rmcp to release the channel.
    pub async fn close(&self) {
        let was_live = self.transition(SessionState::Closed);
        self.cancel.cancel();

        let service = self.service.lock().await.take();
        if let Some(service) = service {
            match tokio::time::timeout(CLOSE_TIMEOUT, service.cancel()).await {
                Ok(Ok(reason)) => debug!(server = %self.server, reason = ?reason, "MCP service stopped"),
                Ok(Err(err)) => debug!(server = %self.server, error = %err, "MCP service task failed"),
                Err(_elapsed) => debug!(server = %self.server, "MCP service did not stop in time"),
            }
        }

        if was_live {
            info!(
                name: "mcp.session.closed",
                server = %self.server,
                session_id = %self.id,
                "MCP session closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::error::TransportError;
    use rmcp::model::{ClientJsonRpcMessage, ServerJsonRpcMessage};
    use serde_json::json;
    use std::{
        io,
        sync::atomic::{AtomicBool, Ordering},
    };
    use tokio::sync::mpsc;

    enum Reply {
        Result(Value),
        Error(i64, &'static str),
        After(Duration, Value),
        Silent,
    }

    type Handler = dyn Fn(&str, &Value) -> Reply + Send + Sync;

    /// In-memory server: every request the client sends is answered by
    /// `handler`, everything the client sends is recorded in `seen`.
    struct Scripted {
        handler: Arc<Handler>,
        outbound: mpsc::UnboundedSender<ServerJsonRpcMessage>,
        inbound: mpsc::UnboundedReceiver<ServerJsonRpcMessage>,
        seen: Arc<std::sync::Mutex<Vec<Value>>>,
        hangup: CancellationToken,
        released: Arc<AtomicBool>,
    }

    struct ScriptedServer {
        inject: mpsc::UnboundedSender<ServerJsonRpcMessage>,
        seen: Arc<std::sync::Mutex<Vec<Value>>>,
        hangup: CancellationToken,
        released: Arc<AtomicBool>,
    }

    impl ScriptedServer {
        fn inject(&self, message: Value) {
            let message = serde_json::from_value(message).expect("valid server message");
            self.inject.send(message).unwrap();
        }

        fn seen(&self) -> Vec<Value> {
            self.seen.lock().unwrap().clone()
        }

        async fn wait_for_message(&self, matches: impl Fn(&Value) -> bool) -> Value {
            for _ in 0..100 {
                if let Some(found) = self.seen().into_iter().find(|m| matches(m)) {
                    return found;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("client never sent the expected message: {:?}", self.seen());
        }
    }

    fn respond(id: &Value, body: Result<Value, (i64, &str)>) -> ServerJsonRpcMessage {
        let message = match body {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        };
        serde_json::from_value(message).expect("valid server reply")
    }

    impl Transport<RoleClient> for Scripted {
        type Error = io::Error;

        fn send(
            &mut self,
            item: ClientJsonRpcMessage,
        ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
            let message = serde_json::to_value(&item);
            let handler = Arc::clone(&self.handler);
            let outbound = self.outbound.clone();
            let seen = Arc::clone(&self.seen);
            async move {
                let message = message.map_err(io::Error::other)?;
                seen.lock().unwrap().push(message.clone());
                let (Some(id), Some(method)) = (message.get("id"), message["method"].as_str()) else {
                    return Ok(());
                };
                match handler(method, &message["params"]) {
                    Reply::Result(result) => {
                        let _ = outbound.send(respond(id, Ok(result)));
                    }
                    Reply::Error(code, text) => {
                        let _ = outbound.send(respond(id, Err((code, text))));
                    }
                    Reply::After(delay, result) => {
                        let reply = respond(id, Ok(result));
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = outbound.send(reply);
                        });
                    }
                    Reply::Silent => {}
                }
                Ok(())
            }
        }

        async fn receive(&mut self) -> Option<ServerJsonRpcMessage> {
            tokio::select! {
                () = self.hangup.cancelled() => None,
                message = self.inbound.recv() => message,
            }
        }

        async fn close(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    impl Drop for Scripted {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn scripted<F>(handler: F) -> (Scripted, ScriptedServer)
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let hangup = CancellationToken::new();
        let released = Arc::new(AtomicBool::new(false));
        let server = ScriptedServer {
            inject: outbound.clone(),
            seen: Arc::clone(&seen),
            hangup: hangup.clone(),
            released: Arc::clone(&released),
        };
        let transport = Scripted {
            handler: Arc::new(handler),
            outbound,
            inbound,
            seen,
            hangup,
            released,
        };
        (transport, server)
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            http: reqwest::Client::new(),
            client_info: ClientIdentity::new("session-tests", "0.0.1"),
            call_timeout: Duration::from_secs(5),
            parent: CancellationToken::new(),
        }
    }

    fn initialize_reply() -> Reply {
        Reply::Result(json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "fake", "version": "1.2.3"}
        }))
    }

    const METHOD_NOT_FOUND: i64 = -32601;

    fn tool(name: &str) -> Value {
        json!({"name": name, "inputSchema": {"type": "object"}})
    }

    fn text(value: &str) -> Value {
        json!({"content": [{"type": "text", "text": value}]})
    }

    /// Handshake, one tool per name, `tools/call` echoes the tool name.
    fn standard(method: &str, params: &Value) -> Reply {
        match method {
            "initialize" => initialize_reply(),
            "tools/list" => Reply::Result(json!({"tools": [tool("fast"), tool("slow"), tool("broken"), tool("rpc_fail"), tool("hang")]})),
            "tools/call" => match params["name"].as_str().unwrap_or_default() {
                "slow" => Reply::After(Duration::from_millis(150), text("slow")),
                "broken" => Reply::Result(json!({
                    "content": [{"type": "text", "text": "disk full"}],
                    "isError": true
                })),
                "rpc_fail" => Reply::Error(-32602, "bad params"),
                "hang" => Reply::Silent,
                other => Reply::Result(text(other)),
            },
            _ => Reply::Error(METHOD_NOT_FOUND, "no such method"),
        }
    }

    async fn establish_with(
        transport: Scripted,
        settings: &SessionSettings,
    ) -> Result<Arc<Session>, AttemptFailure> {
        Session::establish("fake", TransportKind::Streamable, "mem://fake", transport, settings).await
    }

    async fn ready_session(settings: &SessionSettings) -> (Arc<Session>, ScriptedServer) {
        let (transport, server) = scripted(standard);
        let session = establish_with(transport, settings).await.unwrap();
        session.list_tools().await.unwrap();
        (session, server)
    }

    #[tokio::test]
    async fn handshake_then_paged_discovery() {
        let (transport, server) = scripted(|method, params| match method {
            "initialize" => initialize_reply(),
            "tools/list" => match params["cursor"].as_str() {
                None => Reply::Result(json!({"tools": [tool("a")], "nextCursor": "page-2"})),
                Some("page-2") => Reply::Result(json!({"tools": [tool("b")]})),
                Some(_) => Reply::Error(-32602, "bad cursor"),
            },
            _ => Reply::Error(METHOD_NOT_FOUND, "no such method"),
        });

        let session = establish_with(transport, &settings()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(
            session.server_info().map(|i| i.server_info.name.as_str()),
            Some("fake")
        );

        let tools = session.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(ToolDescriptor::name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(tools.iter().all(|t| t.session_id() == session.id() && t.server() == "fake"));

        let seen = server.seen();
        assert_eq!(seen[0]["method"], "initialize");
        assert_eq!(seen[0]["params"]["clientInfo"]["name"], "session-tests");
        assert!(seen.iter().any(|m| m["method"] == "notifications/initialized"));
    }

    #[tokio::test]
    async fn missing_tools_list_means_no_tools() {
        let (transport, _server) = scripted(|method, _| match method {
            "initialize" => initialize_reply(),
            _ => Reply::Error(METHOD_NOT_FOUND, "Method not found"),
        });
        let session = establish_with(transport, &settings()).await.unwrap();
        assert!(session.list_tools().await.unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn failed_handshake_releases_the_channel() {
        let (transport, server) = scripted(|_, _| Reply::Error(-32600, "unsupported protocol"));
        let err = establish_with(transport, &settings()).await.unwrap_err();
        assert!(matches!(err, AttemptFailure::Handshake(_)));
        assert!(server.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pipelined_calls_resolve_to_their_own_responses() {
        let (session, _server) = ready_session(&settings()).await;

        let started = std::time::Instant::now();
        let (slow, fast) = tokio::join!(
            session.call_tool("slow", json!({})),
            async {
                let result = session.call_tool("fast", json!({})).await;
                (result, started.elapsed())
            }
        );

        assert_eq!(text_content(&slow.unwrap()), "slow");
        let (fast, fast_elapsed) = fast;
        assert_eq!(text_content(&fast.unwrap()), "fast");
        assert!(fast_elapsed < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn remote_failures_are_tool_errors() {
        let (session, _server) = ready_session(&settings()).await;

        match session.call_tool("broken", Value::Null).await {
            Err(McpError::Tool { message, code: None, result: Some(_), .. }) => {
                assert_eq!(message, "disk full");
            }
            other => panic!("expected tool error, got {other:?}"),
        }
        assert!(matches!(
            session.call_tool("rpc_fail", json!({})).await,
            Err(McpError::Tool { code: Some(-32602), .. })
        ));
        assert!(matches!(
            session.call_tool("nope", json!({})).await,
            Err(McpError::UnknownTool { ref name }) if name == "nope"
        ));
        assert!(matches!(
            session.call_tool("fast", json!([1, 2])).await,
            Err(McpError::InvalidArguments { ref tool, .. }) if tool == "fast"
        ));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn call_timeout_keeps_session_ready() {
        let mut settings = settings();
        settings.call_timeout = Duration::from_millis(100);
        let (session, _server) = ready_session(&settings).await;

        let err = session.call_tool("hang", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            McpError::Invocation { source: RequestError::Timeout(_), .. }
        ));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(text_content(&session.call_tool("fast", json!({})).await.unwrap()), "fast");
    }

    #[tokio::test]
    async fn close_cancels_in_flight_and_is_idempotent() {
        let (session, server) = ready_session(&settings()).await;

        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call_tool("hang", json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.close().await;
        session.close().await;

        assert!(matches!(
            pending.await.unwrap(),
            Err(McpError::Cancelled { operation: "tools/call", .. })
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(server.released.load(Ordering::SeqCst));
        assert!(matches!(
            session.call_tool("fast", json!({})).await,
            Err(McpError::SessionUnavailable { state: SessionState::Closed, .. })
        ));
    }

    #[tokio::test]
    async fn peer_hangup_fails_the_session() {
        let (session, server) = ready_session(&settings()).await;

        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call_tool("hang", json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.hangup.cancel();

        assert_eq!(session.wait_terminal().await, SessionState::Failed);
        assert!(matches!(pending.await.unwrap(), Err(McpError::Invocation { .. })));
        session.close().await;
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn server_pings_are_answered() {
        let (session, server) = ready_session(&settings()).await;

        server.inject(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}));
        let pong = server.wait_for_message(|m| m["id"] == "srv-1").await;
        assert_eq!(pong["result"], json!({}));

        server.inject(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}));
        assert_eq!(text_content(&session.call_tool("fast", json!({})).await.unwrap()), "fast");
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_in_flight_calls() {
        let settings = settings();
        let (session, _server) = ready_session(&settings).await;

        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call_tool("hang", json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        settings.parent.cancel();

        assert!(matches!(
            pending.await.unwrap(),
            Err(McpError::Cancelled { operation: "tools/call", .. })
        ));
    }

    #[tokio::test]
    async fn open_records_each_failed_candidate() {
        let config = ServerConfig::new([
            TransportCandidate::streamable("ftp://tools.example/mcp"),
            TransportCandidate::sse("not a url"),
        ]);
        let deadline = Instant::now() + Duration::from_secs(5);

        let err = Session::open("broken", &config, &settings(), deadline)
            .await
            .unwrap_err();

        assert_eq!(err.server, "broken");
        assert_eq!(err.attempts.len(), 2);
        assert!(matches!(
            err.attempts[0].reason,
            AttemptFailure::Transport(TransportError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            err.attempts[1].reason,
            AttemptFailure::Transport(TransportError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn expired_deadline_skips_the_network() {
        let config = ServerConfig::streamable("http://127.0.0.1:9/mcp")
            .or_else(TransportCandidate::sse("http://127.0.0.1:9/sse"));

        let err = Session::open("late", &config, &settings(), Instant::now())
            .await
            .unwrap_err();

        assert_eq!(err.attempts.len(), 2);
        assert!(err
            .attempts
            .iter()
            .all(|a| matches!(a.reason, AttemptFailure::TimedOut(_))));
    }

    #[tokio::test]
    async fn cancellation_stops_the_candidate_walk() {
        let settings = settings();
        settings.parent.cancel();
        let config = ServerConfig::streamable("http://127.0.0.1:9/mcp")
            .or_else(TransportCandidate::sse("http://127.0.0.1:9/sse"));

        let err = Session::open(
            "stopped",
            &config,
            &settings,
            Instant::now() + Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts.len(), 1);
        assert!(matches!(err.attempts[0].reason, AttemptFailure::Cancelled));
    }

    #[test]
    fn state_machine_transitions() {
        use SessionState::{Closed, Connecting, Failed, Ready};
        assert!(Connecting.can_transition_to(Ready));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Closed));
        assert!(!Ready.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Closed));
        assert!(Failed.is_terminal() && Closed.is_terminal());
    }

    #[test]
    fn result_text_skips_non_text_blocks() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "data": "aGk=", "mimeType": "image/png"},
                {"type": "text", "text": "second"}
            ]
        }))
        .unwrap();
        assert_eq!(text_content(&result), "first\nsecond");
    }
}
