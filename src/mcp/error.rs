//! Error taxonomy for transports, sessions and the client facade.

use crate::mcp::{config::TransportKind, session::SessionState};
use rmcp::{
    model::CallToolResult,
    service::{ClientInitializeError, ServiceError},
};
use serde_json::Value;
use std::{fmt, time::Duration};
use thiserror::Error;

/// Failures of a channel before or beneath the MCP service.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected content type {0:?}")]
    UnexpectedContentType(Option<String>),

    #[error("event stream ended before announcing a message endpoint")]
    MissingEndpoint,

    #[error("message endpoint {endpoint} is not on the origin of {stream}")]
    CrossOriginEndpoint { endpoint: String, stream: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("credentials are not a valid header value")]
    InvalidCredentials,

    #[error("event stream error: {0}")]
    Stream(#[from] sse_stream::Error),
}

/// Failure of one request on a live session.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Service(ServiceError),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("server returned error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("session is {0}")]
    Unavailable(SessionState),

    #[error("connection lost before a response arrived")]
    ConnectionLost,

    #[error("request cancelled")]
    Cancelled,
}

impl RequestError {
    /// Whether the session's channel is gone for good.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost | Self::Service(ServiceError::TransportSend(_))
        )
    }
}

impl From<ServiceError> for RequestError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::McpError(data) => Self::Rpc {
                code: i64::from(data.code.0),
                message: data.message.into_owned(),
                data: data.data,
            },
            ServiceError::TransportClosed => Self::ConnectionLost,
            ServiceError::Cancelled { .. } => Self::Cancelled,
            ServiceError::Timeout { timeout } => Self::Timeout(timeout),
            other => Self::Service(other),
        }
    }
}

/// Why a single transport candidate was abandoned.
#[derive(Debug, Error)]
pub enum AttemptFailure {
    #[error("transport: {0}")]
    Transport(#[source] TransportError),

    #[error("initialize: {0}")]
    Handshake(#[source] ClientInitializeError),

    #[error("connect deadline of {0:?} exceeded")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub struct CandidateFailure {
    pub kind: TransportKind,
    pub url: String,
    pub reason: AttemptFailure,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.url, self.reason)
    }
}

fn describe_attempts(attempts: &[CandidateFailure]) -> String {
    if attempts.is_empty() {
        return "no transport candidates configured".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Every candidate for a server failed.
#[derive(Debug, Error)]
#[error("could not connect to server '{server}': {}", describe_attempts(.attempts))]
pub struct ConnectError {
    pub server: String,
    pub attempts: Vec<CandidateFailure>,
}

/// `tools/list` failed on an otherwise connected server.
#[derive(Debug, Error)]
#[error("tool discovery failed for server '{server}': {source}")]
pub struct DiscoveryError {
    pub server: String,
    #[source]
    pub source: RequestError,
}

/// Per-server entry in a start summary.
#[derive(Debug, Error)]
pub enum ServerFailure {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("startup task for server '{server}' aborted: {reason}")]
    Aborted { server: String, reason: String },
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    #[error("invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("calling tool '{tool}' on server '{server}' failed: {source}")]
    Invocation {
        server: String,
        tool: String,
        #[source]
        source: RequestError,
    },

    #[error("tool '{tool}' on server '{server}' reported an error: {message}")]
    Tool {
        server: String,
        tool: String,
        message: String,
        code: Option<i64>,
        result: Option<CallToolResult>,
    },

    #[error("{operation} on server '{server}' was cancelled")]
    Cancelled {
        server: String,
        operation: &'static str,
    },

    #[error("server '{server}' is {state}")]
    SessionUnavailable { server: String, state: SessionState },

    #[error("unknown server: '{0}'")]
    UnknownServer(String),
}

impl From<ServerFailure> for McpError {
    fn from(failure: ServerFailure) -> Self {
        match failure {
            ServerFailure::Connect(err) => Self::Connect(err),
            ServerFailure::Discovery(err) => Self::Discovery(err),
            ServerFailure::Aborted { server, .. } => Self::Cancelled {
                server,
                operation: "startup",
            },
        }
    }
}
