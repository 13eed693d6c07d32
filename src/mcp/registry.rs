use crate::mcp::{schema::InputSchema, session::SessionId};
use rmcp::model::Tool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::warn;

/// A discovered tool as the registry exposes it.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    name: String,
    remote_name: String,
    description: Option<String>,
    input_schema: InputSchema,
    server: String,
    session_id: SessionId,
}

impl ToolDescriptor {
    pub fn from_remote(tool: &Tool, server: &str, session_id: SessionId) -> Self {
        Self {
            name: tool.name.to_string(),
            remote_name: tool.name.to_string(),
            description: tool.description.as_deref().map(str::to_string),
            input_schema: InputSchema::from_value(Value::Object((*tool.input_schema).clone())),
            server: server.to_string(),
            session_id,
        }
    }

    fn renamed(mut self, name: String) -> Self {
        self.name = name;
        self
    }

    /// Name under which the registry exposes the tool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name the owning server knows the tool by.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn input_schema(&self) -> &InputSchema {
        &self.input_schema
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

/// How a later server's tool is treated when its name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Drop the later tool.
    #[default]
    RejectLater,
    /// Keep the later tool as `{server}__{tool}`.
    QualifyLater,
}

/// Two servers exported the same tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCollision {
    pub tool: String,
    pub winner: String,
    pub loser: String,
    /// Set when the loser's tool was kept under a qualified name.
    pub renamed_to: Option<String>,
}

impl fmt::Display for NameCollision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tool '{}' from server '{}' collides with server '{}'",
            self.tool, self.loser, self.winner
        )?;
        match &self.renamed_to {
            Some(name) => write!(f, "; exposed as '{name}'"),
            None => f.write_str("; dropped"),
        }
    }
}

/// Immutable name → tool mapping built from every ready session.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    tools: HashMap<String, ToolDescriptor>,
    collisions: Vec<NameCollision>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a registry from per-server discovery outcomes.
    ///
    /// Servers are visited in name order, so the result does not depend on
    /// the order in which discovery finished. Failed servers contribute
    /// nothing.
    pub fn merge<I, E>(results: I, policy: CollisionPolicy) -> Self
    where
        I: IntoIterator<Item = (String, Result<Vec<ToolDescriptor>, E>)>,
    {
        let ordered: BTreeMap<String, Vec<ToolDescriptor>> = results
            .into_iter()
            .filter_map(|(server, result)| result.ok().map(|tools| (server, tools)))
            .collect();

        let mut registry = Self::default();
        for (server, tools) in ordered {
            let mut listed = BTreeSet::new();
            for tool in tools {
                if !listed.insert(tool.remote_name().to_string()) {
                    warn!(server = %server, tool = %tool.remote_name(), "server listed a tool twice; keeping the first");
                    continue;
                }
                registry.insert(&server, tool, policy);
            }
        }
        registry
    }

    fn insert(&mut self, server: &str, tool: ToolDescriptor, policy: CollisionPolicy) {
        let Some(winner) = self.tools.get(tool.name()).map(|t| t.server().to_string()) else {
            self.tools.insert(tool.name().to_string(), tool);
            return;
        };
        if winner == server {
            // A qualified name from this server already took the slot.
            warn!(server = %server, tool = %tool.name(), "tool name already taken by the same server; dropping");
            return;
        }

        let mut collision = NameCollision {
            tool: tool.name().to_string(),
            winner,
            loser: server.to_string(),
            renamed_to: None,
        };

        if policy == CollisionPolicy::QualifyLater {
            let qualified = sanitize_tool_name(&format!("{server}__{}", tool.name()));
            if !self.tools.contains_key(&qualified) {
                collision.renamed_to = Some(qualified.clone());
                self.tools.insert(qualified.clone(), tool.renamed(qualified));
            }
        }

        self.collisions.push(collision);
    }

    /// Registry names, sorted.
    pub fn names(&self) -> BTreeSet<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn describe(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn lookup(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tools owned by `server`, sorted by name.
    pub fn tools_for(&self, server: &str) -> Vec<&ToolDescriptor> {
        let mut tools: Vec<_> = self.tools.values().filter(|t| t.server() == server).collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    pub fn collisions(&self) -> &[NameCollision] {
        &self.collisions
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }
}

/// Restrict a tool name to `[A-Za-z0-9_-]`.
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Published registry snapshot. Readers clone the `Arc`; writers swap it.
#[derive(Debug, Default)]
pub struct SharedRegistry {
    current: RwLock<Arc<Registry>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Registry> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the published registry, returning the new snapshot.
    pub fn publish(&self, registry: Registry) -> Arc<Registry> {
        let next = Arc::new(registry);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
        next
    }
}
