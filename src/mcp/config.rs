use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};

/// Wire transport used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[serde(alias = "streamable_http", alias = "streamable-http", alias = "http")]
    Streamable,
    Sse,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streamable => "streamable",
            Self::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque bearer token passed through to the server.
///
/// Never printed: `Debug` is redacted and nothing logs the inner value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(String);

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    fn expanded(&self) -> Self {
        Self(expand_env_placeholders(&self.0))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCandidate {
    pub kind: TransportKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl TransportCandidate {
    pub fn new(kind: TransportKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            credentials: None,
        }
    }

    pub fn streamable(url: impl Into<String>) -> Self {
        Self::new(TransportKind::Streamable, url)
    }

    pub fn sse(url: impl Into<String>) -> Self {
        Self::new(TransportKind::Sse, url)
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Everything needed to reach one named server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ServerEntry")]
pub struct ServerConfig {
    candidates: Vec<TransportCandidate>,
    credentials: Option<Credentials>,
    call_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(candidates: impl IntoIterator<Item = TransportCandidate>) -> Self {
        Self {
            candidates: candidates.into_iter().collect(),
            credentials: None,
            call_timeout: None,
            connect_timeout: None,
        }
    }

    pub fn streamable(url: impl Into<String>) -> Self {
        Self::new([TransportCandidate::streamable(url)])
    }

    pub fn sse(url: impl Into<String>) -> Self {
        Self::new([TransportCandidate::sse(url)])
    }

    /// Append a candidate tried after the ones already configured.
    #[must_use]
    pub fn or_else(mut self, candidate: TransportCandidate) -> Self {
        self.candidates.push(candidate);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn candidates(&self) -> &[TransportCandidate] {
        &self.candidates
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Resolve `${VAR}` placeholders in URLs and credentials.
    #[must_use]
    pub fn with_env_expanded(mut self) -> Self {
        for candidate in &mut self.candidates {
            candidate.url = expand_env_placeholders(&candidate.url);
            candidate.credentials = candidate.credentials.as_ref().map(Credentials::expanded);
        }
        self.credentials = self.credentials.as_ref().map(Credentials::expanded);
        self
    }
}

/// On-disk shape of a server entry: the full candidate list or the
/// single-transport shorthand.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServerEntry {
    Full {
        candidates: Vec<TransportCandidate>,
        #[serde(default)]
        credentials: Option<Credentials>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        connect_timeout_ms: Option<u64>,
    },
    Shorthand {
        #[serde(default = "default_transport")]
        transport: TransportKind,
        url: String,
        #[serde(default)]
        credentials: Option<Credentials>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        connect_timeout_ms: Option<u64>,
        #[serde(default)]
        fallback_sse: bool,
    },
}

fn default_transport() -> TransportKind {
    TransportKind::Streamable
}

impl From<ServerEntry> for ServerConfig {
    fn from(entry: ServerEntry) -> Self {
        let (candidates, credentials, timeout_ms, connect_timeout_ms) = match entry {
            ServerEntry::Full {
                candidates,
                credentials,
                timeout_ms,
                connect_timeout_ms,
            } => (candidates, credentials, timeout_ms, connect_timeout_ms),
            ServerEntry::Shorthand {
                transport,
                url,
                credentials,
                timeout_ms,
                connect_timeout_ms,
                fallback_sse,
            } => {
                let mut candidates = vec![TransportCandidate::new(transport, url.clone())];
                if fallback_sse && transport != TransportKind::Sse {
                    candidates.push(TransportCandidate::sse(url));
                }
                (candidates, credentials, timeout_ms, connect_timeout_ms)
            }
        };

        Self {
            candidates,
            credentials,
            call_timeout: timeout_ms.map(Duration::from_millis),
            connect_timeout: connect_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// The server map as it appears in a config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpConfig {
    #[serde(default, alias = "mcpServers", alias = "mcpservers")]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl McpConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    #[must_use]
    pub fn with_env_expanded(self) -> Self {
        Self {
            servers: self
                .servers
                .into_iter()
                .map(|(name, server)| (name, server.with_env_expanded()))
                .collect(),
        }
    }
}

/// Expand `${NAME}` placeholders from the process environment.
/// Unset variables leave the placeholder untouched.
pub fn expand_env_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(value) if !name.is_empty() => out.push_str(&value),
            _ => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
