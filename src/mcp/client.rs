//! The client facade: owns one session per server and the published registry.

use crate::mcp::{
    config::{ServerConfig, TransportKind},
    error::{DiscoveryError, McpError, RequestError, ServerFailure},
    policy::Timeouts,
    registry::{CollisionPolicy, NameCollision, Registry, SharedRegistry},
    session::{ClientIdentity, Session, SessionId, SessionSettings, SessionState},
};
use rmcp::model::CallToolResult;
use futures::future::join_all;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    convert::Infallible,
    sync::{Arc, PoisonError, RwLock, Weak},
};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub collision_policy: CollisionPolicy,
    pub timeouts: Timeouts,
    /// Announced to servers in `initialize`.
    pub client_info: ClientIdentity,
}

/// A server that came up during `start`.
#[derive(Debug, Clone)]
pub struct ReadyServer {
    pub transport: TransportKind,
    /// Tools the server advertised, before collision handling.
    pub tool_count: usize,
    /// Collisions this server lost.
    pub collisions: Vec<NameCollision>,
}

/// Per-server outcome of [`McpClient::start`].
#[derive(Debug, Default)]
pub struct StartSummary {
    pub ready: BTreeMap<String, ReadyServer>,
    pub failed: BTreeMap<String, ServerFailure>,
}

impl StartSummary {
    pub fn all_ready(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Concurrent client for many MCP servers.
///
/// Cheap to clone; clones share sessions and the registry. Call
/// [`McpClient::shutdown`] to release connections deterministically; dropping
/// the last clone cancels everything still running.
#[derive(Debug, Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    options: ClientOptions,
    http: reqwest::Client,
    configs: RwLock<BTreeMap<String, ServerConfig>>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    registry: SharedRegistry,
    /// Serialises session-map changes with the registry rebuild that follows.
    writer: Mutex<()>,
    shutdown: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}

impl McpClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                options,
                http: reqwest::Client::new(),
                configs: RwLock::new(BTreeMap::new()),
                sessions: RwLock::new(HashMap::new()),
                registry: SharedRegistry::new(),
                writer: Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Connect to every server concurrently and publish the merged registry.
    ///
    /// Never fails as a whole: each server ends up in either `ready` or
    /// `failed` of the returned summary. Servers already known to the client
    /// under the same name are replaced.
    pub async fn start<I>(&self, servers: I) -> StartSummary
    where
        I: IntoIterator<Item = (String, ServerConfig)>,
    {
        let servers: BTreeMap<String, ServerConfig> = servers.into_iter().collect();
        info!(
            name: "mcp.client.starting",
            server_count = servers.len(),
            "starting MCP servers"
        );

        write_lock(&self.inner.configs).extend(servers.clone());

        let tasks = servers.into_iter().map(|(name, config)| {
            let inner = Arc::clone(&self.inner);
            let task_name = name.clone();
            let handle =
                tokio::spawn(async move { inner.open_and_discover(&task_name, &config).await });
            async move {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(err) => Err(ServerFailure::Aborted {
                        server: name.clone(),
                        reason: err.to_string(),
                    }),
                };
                (name, outcome)
            }
        });

        let mut summary = StartSummary::default();
        let mut opened = Vec::new();
        for (name, outcome) in join_all(tasks).await {
            match outcome {
                Ok(session) => opened.push((name, session)),
                Err(failure) => {
                    warn!(
                        name: "mcp.server.failed",
                        server = %name,
                        error = %failure,
                        "MCP server unavailable"
                    );
                    summary.failed.insert(name, failure);
                }
            }
        }

        let shutdown = &self.inner.shutdown;
        let mut installed = Vec::new();
        let mut rejected = Vec::new();
        let (registry, displaced) = self
            .inner
            .commit(|sessions| {
                let mut displaced = Vec::new();
                for (name, session) in opened {
                    let state = session.state();
                    if shutdown.is_cancelled() {
                        let reason = "client shut down before the server was published".to_string();
                        rejected.push((name, session, reason));
                        continue;
                    }
                    if state != SessionState::Ready {
                        let reason = format!("session was {state} before it could be published");
                        rejected.push((name, session, reason));
                        continue;
                    }
                    displaced.extend(sessions.insert(name.clone(), Arc::clone(&session)));
                    installed.push((name, session));
                }
                displaced
            })
            .await;
        close_all(displaced).await;

        let mut unpublished = Vec::with_capacity(rejected.len());
        for (name, session, reason) in rejected {
            warn!(name: "mcp.server.failed", server = %name, error = %reason, "MCP server unavailable");
            summary.failed.insert(
                name.clone(),
                ServerFailure::Aborted {
                    server: name,
                    reason,
                },
            );
            unpublished.push(session);
        }
        close_all(unpublished).await;

        for (name, session) in installed {
            self.inner.watch(name.clone(), Arc::clone(&session));
            let collisions: Vec<NameCollision> = registry
                .collisions()
                .iter()
                .filter(|c| c.loser == name)
                .cloned()
                .collect();
            for collision in &collisions {
                warn!(
                    name: "mcp.tool.collision",
                    tool = %collision.tool,
                    winner = %collision.winner,
                    loser = %collision.loser,
                    renamed_to = ?collision.renamed_to,
                    "tool name collision"
                );
            }
            summary.ready.insert(
                name,
                ReadyServer {
                    transport: session.transport_kind(),
                    tool_count: session.tool_count(),
                    collisions,
                },
            );
        }

        info!(
            name: "mcp.client.started",
            ready = summary.ready.len(),
            failed = summary.failed.len(),
            tool_count = registry.len(),
            "MCP client started"
        );
        summary
    }

    /// Current registry snapshot. Never blocks on a rebuild.
    pub fn tools(&self) -> Arc<Registry> {
        self.inner.registry.snapshot()
    }

    /// Route a call to the server that owns `name`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let unknown = || McpError::UnknownTool {
            name: name.to_string(),
        };
        let tool = self.tools().lookup(name).ok_or_else(unknown)?;

        tool.input_schema()
            .validate(&arguments)
            .map_err(|violation| McpError::InvalidArguments {
                tool: name.to_string(),
                reason: violation.to_string(),
            })?;

        let session = self.inner.session(tool.server()).ok_or_else(unknown)?;
        if session.id() != tool.session_id() {
            debug!(tool = %name, server = %tool.server(), "registry entry predates a reconnect");
        }
        session.call_tool(tool.remote_name(), arguments).await
    }

    /// Reconnect one server from its stored config.
    ///
    /// On success the new session replaces the old one and the old session
    /// is closed after the new registry is published. On failure the
    /// server's tools are withdrawn.
    pub async fn refresh(&self, server: &str) -> Result<usize, McpError> {
        let config = read_lock(&self.inner.configs)
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer(server.to_string()))?;

        match self.inner.open_and_discover(server, &config).await {
            Ok(session) => {
                let tool_count = session.tool_count();
                let name = server.to_string();
                let fresh = Arc::clone(&session);
                let shutdown = &self.inner.shutdown;
                let mut installed = false;
                let (_, displaced) = self
                    .inner
                    .commit(|sessions| {
                        if shutdown.is_cancelled() {
                            return vec![fresh];
                        }
                        if fresh.state() != SessionState::Ready {
                            return sessions.remove(&name).into_iter().chain([fresh]).collect();
                        }
                        installed = true;
                        sessions.insert(name, fresh).into_iter().collect()
                    })
                    .await;
                close_all(displaced).await;
                if shutdown.is_cancelled() {
                    return Err(McpError::Cancelled {
                        server: server.to_string(),
                        operation: "refresh",
                    });
                }
                if !installed {
                    return Err(McpError::SessionUnavailable {
                        server: server.to_string(),
                        state: session.state(),
                    });
                }
                self.inner.watch(server.to_string(), session);
                info!(
                    name: "mcp.server.refreshed",
                    server = %server,
                    tool_count,
                    "MCP server refreshed"
                );
                Ok(tool_count)
            }
            Err(failure) => {
                warn!(
                    name: "mcp.server.failed",
                    server = %server,
                    error = %failure,
                    "MCP server refresh failed"
                );
                let name = server.to_string();
                let (_, displaced) = self
                    .inner
                    .commit(move |sessions| sessions.remove(&name).into_iter().collect())
                    .await;
                close_all(displaced).await;
                Err(failure.into())
            }
        }
    }

    /// Close and forget one server. Returns whether it was known.
    pub async fn remove_server(&self, server: &str) -> bool {
        let known = write_lock(&self.inner.configs).remove(server).is_some();
        let name = server.to_string();
        let (_, displaced) = self
            .inner
            .commit(move |sessions| sessions.remove(&name).into_iter().collect())
            .await;
        let had_session = !displaced.is_empty();
        close_all(displaced).await;
        if known || had_session {
            info!(name: "mcp.server.removed", server = %server, "MCP server removed");
        }
        known || had_session
    }

    /// The live session for `server`, if any.
    pub fn session(&self, server: &str) -> Option<Arc<Session>> {
        self.inner.session(server)
    }

    pub fn session_state(&self, server: &str) -> Option<SessionState> {
        self.inner.session(server).map(|s| s.state())
    }

    pub fn session_id(&self, server: &str) -> Option<SessionId> {
        self.inner.session(server).map(|s| s.id())
    }

    /// State of every server with a live session.
    pub fn server_states(&self) -> BTreeMap<String, SessionState> {
        read_lock(&self.inner.sessions)
            .iter()
            .map(|(name, session)| (name.clone(), session.state()))
            .collect()
    }

    /// Cancel in-flight work, close every session and publish an empty
    /// registry. Safe to call more than once, or before `start`.
    pub async fn shutdown(&self) {
        let first = !self.inner.shutdown.is_cancelled();
        self.inner.shutdown.cancel();
        let (_, displaced) = self
            .inner
            .commit(|sessions| sessions.drain().map(|(_, session)| session).collect())
            .await;
        let closed = displaced.len();
        close_all(displaced).await;
        if first {
            info!(name: "mcp.client.shutdown", sessions_closed = closed, "MCP client shut down");
        }
    }
}

impl ClientInner {
    fn session(&self, server: &str) -> Option<Arc<Session>> {
        read_lock(&self.sessions).get(server).cloned()
    }

    fn settings(&self, config: &ServerConfig) -> SessionSettings {
        SessionSettings {
            http: self.http.clone(),
            client_info: self.options.client_info.clone(),
            call_timeout: self.options.timeouts.call_for(config),
            parent: self.shutdown.clone(),
        }
    }

    /// Open plus discovery, both inside the server's connect budget.
    async fn open_and_discover(
        &self,
        server: &str,
        config: &ServerConfig,
    ) -> Result<Arc<Session>, ServerFailure> {
        let budget = self.options.timeouts.connect_for(config);
        let deadline = Instant::now() + budget;
        let settings = self.settings(config);

        let session = Session::open(server, config, &settings, deadline).await?;
        let discovered = match tokio::time::timeout_at(deadline, session.list_tools()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(DiscoveryError {
                server: server.to_string(),
                source: RequestError::Timeout(budget),
            }),
        };

        match discovered {
            Ok(tools) => {
                info!(
                    name: "mcp.server.ready",
                    server = %server,
                    transport = %session.transport_kind(),
                    tool_count = tools.len(),
                    "MCP server ready"
                );
                Ok(session)
            }
            Err(err) => {
                // Detached so the close cannot run past the connect deadline.
                tokio::spawn(async move { session.close().await });
                Err(err.into())
            }
        }
    }

    /// Apply `mutate` to the session map and publish the rebuilt registry,
    /// all under the writer lock. Returns sessions the caller must close.
    async fn commit<F>(&self, mutate: F) -> (Arc<Registry>, Vec<Arc<Session>>)
    where
        F: FnOnce(&mut HashMap<String, Arc<Session>>) -> Vec<Arc<Session>>,
    {
        let _writer = self.writer.lock().await;
        let displaced = mutate(&mut write_lock(&self.sessions));
        let registry = self.build_registry();
        (self.registry.publish(registry), displaced)
    }

    fn build_registry(&self) -> Registry {
        let sessions = read_lock(&self.sessions);
        let ready = sessions
            .iter()
            .filter(|(_, session)| session.state() == SessionState::Ready)
            .map(|(name, session)| (name.clone(), Ok::<_, Infallible>(session.tools().to_vec())));
        Registry::merge(ready, self.options.collision_policy)
    }

    /// Evict `session` once it ends on its own.
    fn watch(self: &Arc<Self>, server: String, session: Arc<Session>) {
        let inner: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let state = tokio::select! {
                () = shutdown.cancelled() => return,
                state = session.wait_terminal() => state,
            };
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let id = session.id();
            let (registry, displaced) = inner
                .commit(|sessions| {
                    if sessions.get(&server).is_some_and(|s| s.id() == id) {
                        sessions.remove(&server).into_iter().collect()
                    } else {
                        Vec::new()
                    }
                })
                .await;
            if !displaced.is_empty() {
                warn!(
                    name: "mcp.server.lost",
                    server = %server,
                    state = %state,
                    tool_count = registry.len(),
                    "MCP session ended; tools withdrawn"
                );
            }
            close_all(displaced).await;
        });
    }
}

async fn close_all(sessions: Vec<Arc<Session>>) {
    join_all(sessions.iter().map(|session| session.close())).await;
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
