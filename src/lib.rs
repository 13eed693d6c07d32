//! Multi-server MCP client
//!
//! Connects concurrently to any number of remote Model Context Protocol tool
//! servers, negotiates a transport per server, discovers their tools and
//! exposes them through one name-addressable registry.
//!
//! # Architecture
//!
//! - **Transport**: streamable HTTP and legacy SSE framing
//! - **Session**: handshake, discovery and calls against one server
//! - **Registry**: merged, immutable snapshot of every ready server's tools
//! - **Client**: parallel startup, routing, refresh and shutdown
//!
//! # Modules
//!
//! - [`config`]: application configuration (file, environment, CLI)
//! - [`mcp`]: the client itself

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod mcp;

pub use mcp::{ClientOptions, McpClient, McpError, StartSummary};
