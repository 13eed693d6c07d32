//! Model Context Protocol (MCP) client for many remote servers at once.
//!
//! Servers are reached over streamable HTTP or the legacy HTTP+SSE
//! transport, with per-server fallback between the two. The protocol itself
//! is spoken by `rmcp`. Every server's tools
//! are merged into one [`registry::Registry`] and invoked through
//! [`client::McpClient::call_tool`], which routes to the owning server.
//!
//! # Configuration
//!
//! Servers are configured by name:
//!
//! ```json
//! {
//!   "servers": {
//!     "expense": {
//!       "transport": "streamable_http",
//!       "url": "http://localhost:8000/mcp"
//!     },
//!     "inventory": {
//!       "candidates": [
//!         { "kind": "streamable", "url": "http://localhost:8001/mcp" },
//!         { "kind": "sse", "url": "http://localhost:8001/sse" }
//!       ],
//!       "credentials": "${INVENTORY_TOKEN}",
//!       "connect_timeout_ms": 10000
//!     }
//!   }
//! }
//! ```
//!
//! # Tool Naming
//!
//! Tools keep the name their server gives them. When two servers export the
//! same name, the server that sorts first keeps it and the collision is
//! recorded; see [`registry::CollisionPolicy`].

pub mod client;
pub mod config;
pub mod error;
pub mod policy;
pub mod registry;
pub mod schema;
pub mod session;
pub mod transport;

pub use client::{ClientOptions, McpClient, ReadyServer, StartSummary};
pub use config::{Credentials, McpConfig, ServerConfig, TransportCandidate, TransportKind};
pub use error::{ConnectError, DiscoveryError, McpError, ServerFailure};
pub use registry::{CollisionPolicy, NameCollision, Registry, ToolDescriptor};
pub use rmcp::model::CallToolResult;
pub use session::{ClientIdentity, Session, SessionId, SessionState, text_content};
