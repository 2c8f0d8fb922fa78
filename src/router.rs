//! Dispatch of `server.tool` names used by submitted code.
//!
//! `host.*` calls round-trip to the host over the connection the round
//! arrived on; `local.*` calls are answered inside the script engine and
//! only misses reach the router. Other servers can be registered by
//! embedding code.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::script::{check_local_tools, Dispatch, ScriptError};
use crate::session::Session;

/// Server name for tools that run on the host.
pub const REMOTE_SERVER: &str = "host";

/// Server name for tools compiled inside the sandbox.
pub const LOCAL_SERVER: &str = "local";

/// Why a routed call failed. The `Display` form is what the script sees.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Invalid tool name: {0}. Expected format: server.tool_name")]
    InvalidName(String),

    #[error("Unknown tool server: {server}. Available: {available}")]
    UnknownServer { server: String, available: String },

    #[error("{server}.{tool}: {message}")]
    Failed {
        server: String,
        tool: String,
        message: String,
    },
}

/// A named set of tools reachable through the router.
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Run `tool` (the part after the first dot). Errors are bare messages;
    /// the router prefixes them with the full tool name.
    async fn call(&self, tool: &str, args: Map<String, Value>) -> Result<Value, String>;
}

/// Tools the host exposed for one round, reached through the session over
/// the connection that submitted the round.
pub struct RemoteToolServer {
    session: Arc<Session>,
    conn_id: u64,
    allowed: HashSet<String>,
}

impl RemoteToolServer {
    /// Expose `allowed` to a round that arrived on `conn_id`.
    pub fn new(
        session: Arc<Session>,
        conn_id: u64,
        allowed: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            session,
            conn_id,
            allowed: allowed.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ToolServer for RemoteToolServer {
    async fn call(&self, tool: &str, args: Map<String, Value>) -> Result<Value, String> {
        if !self.allowed.contains(tool) {
            return Err(format!("Unknown tool: {tool}"));
        }
        self.session.call_remote(self.conn_id, tool, args).await
    }
}

/// The `localTools` of an `execute` message.
///
/// The script engine answers calls to these names itself, so only names
/// that were never defined get this far.
#[derive(Debug, Default)]
pub struct LocalToolServer {
    sources: BTreeMap<String, String>,
}

impl LocalToolServer {
    /// Check every source's shape. The first invalid one fails the set.
    pub fn compile(sources: &BTreeMap<String, String>) -> Result<Self, ScriptError> {
        check_local_tools(sources)?;
        Ok(Self {
            sources: sources.clone(),
        })
    }

    /// Validated sources, keyed by tool name without the `local.` prefix.
    pub const fn sources(&self) -> &BTreeMap<String, String> {
        &self.sources
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.sources.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl ToolServer for LocalToolServer {
    async fn call(&self, tool: &str, _args: Map<String, Value>) -> Result<Value, String> {
        debug!(tool, "Local tool not defined in this round");
        Err(format!("Unknown tool: {tool}"))
    }
}

/// Maps server names to [`ToolServer`]s and splits `server.tool` names.
#[derive(Default)]
pub struct ToolRouter {
    servers: BTreeMap<String, Arc<dyn ToolServer>>,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `server` under `name`, replacing any earlier one.
    pub fn register(&mut self, name: impl Into<String>, server: Arc<dyn ToolServer>) {
        self.servers.insert(name.into(), server);
    }

    /// Registered server names, sorted.
    pub fn server_names(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    /// Split `name` on its first dot and call the matching server.
    pub async fn route(&self, name: &str, args: Map<String, Value>) -> Result<Value, RouteError> {
        let (server, tool) = split_name(name)?;
        let Some(target) = self.servers.get(server) else {
            return Err(RouteError::UnknownServer {
                server: server.to_string(),
                available: self.server_names().join(", "),
            });
        };
        debug!(server, tool, "Routing tool call");
        target
            .call(tool, args)
            .await
            .map_err(|message| RouteError::Failed {
                server: server.to_string(),
                tool: tool.to_string(),
                message,
            })
    }
}

#[async_trait]
impl Dispatch for ToolRouter {
    async fn call(&self, name: &str, args: Map<String, Value>) -> Result<Value, String> {
        self.route(name, args).await.map_err(|e| e.to_string())
    }
}

fn split_name(name: &str) -> Result<(&str, &str), RouteError> {
    match name.split_once('.') {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Ok((server, tool)),
        _ => Err(RouteError::InvalidName(name.to_string())),
    }
}
