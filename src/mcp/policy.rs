//! Connect-time fallback rules and timeout resolution.
//!
//! Only the transport candidate walk during `open` is retried. Tool calls are
//! never retried here; callers decide.

use crate::mcp::{
    config::{ServerConfig, TransportCandidate},
    error::AttemptFailure,
};
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Client-wide timeouts used when a server does not override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub call: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            call: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl Timeouts {
    /// Budget shared by connect, handshake and discovery for one server.
    pub fn connect_for(&self, server: &ServerConfig) -> Duration {
        server.connect_timeout().unwrap_or(self.connect)
    }

    pub fn call_for(&self, server: &ServerConfig) -> Duration {
        server.call_timeout().unwrap_or(self.call)
    }
}

/// Candidates in the order they are tried.
///
/// Repeats of an earlier kind and URL are dropped. Candidates without their
/// own credentials inherit the server-level ones.
pub fn candidate_plan(server: &ServerConfig) -> Vec<TransportCandidate> {
    let mut plan: Vec<TransportCandidate> = Vec::with_capacity(server.candidates().len());
    for candidate in server.candidates() {
        if plan
            .iter()
            .any(|seen| seen.kind == candidate.kind && seen.url == candidate.url)
        {
            continue;
        }
        let mut candidate = candidate.clone();
        if candidate.credentials.is_none() {
            candidate.credentials = server.credentials().cloned();
        }
        plan.push(candidate);
    }
    plan
}

/// Whether the walk continues after `failure`.
pub fn should_fall_back(failure: &AttemptFailure) -> bool {
    !matches!(failure, AttemptFailure::Cancelled)
}
