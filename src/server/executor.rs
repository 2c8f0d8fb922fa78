//! Runs one `execute` round inside the sandbox.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::router::{LocalToolServer, RemoteToolServer, ToolRouter, LOCAL_SERVER, REMOTE_SERVER};
use crate::script::{ScriptEngine, ScriptError};
use crate::session::Session;
use crate::transport::{codec, Message, Outbound};

/// Error code attached to failed rounds.
pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";

#[derive(Clone)]
pub struct Executor {
    session: Arc<Session>,
    engine: ScriptEngine,
}

impl Executor {
    pub const fn new(session: Arc<Session>, engine: ScriptEngine) -> Self {
        Self { session, engine }
    }

    /// Check the local tools, then run the code with a router exposing
    /// `host.*` (restricted to `remote_tools`, over `conn_id` only) and
    /// `local.*`.
    pub async fn run(
        &self,
        conn_id: u64,
        code: &str,
        remote_tools: Vec<String>,
        local_tools: &BTreeMap<String, String>,
    ) -> Result<Value, ScriptError> {
        let local = LocalToolServer::compile(local_tools)?;

        let mut router = ToolRouter::new();
        router.register(
            REMOTE_SERVER,
            Arc::new(RemoteToolServer::new(
                self.session.clone(),
                conn_id,
                remote_tools,
            )),
        );
        if !local.is_empty() {
            router.register(LOCAL_SERVER, Arc::new(local));
        }

        self.engine.run(code, local_tools, Arc::new(router)).await
    }

    /// Run a round in the background and answer with `result` or `error`
    /// on the connection that submitted it.
    pub fn spawn(
        &self,
        conn_id: u64,
        outbound: Outbound,
        code: String,
        remote_tools: Vec<String>,
        local_tools: BTreeMap<String, String>,
    ) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            let reply = executor
                .round(conn_id, &code, remote_tools, &local_tools)
                .await;
            if !outbound.send(&reply) {
                debug!(conn_id, "Round finished after its connection closed");
            }
        })
    }

    #[instrument(skip_all, fields(conn_id, code_len = code.len(), remote = remote_tools.len(), local = local_tools.len()))]
    async fn round(
        &self,
        conn_id: u64,
        code: &str,
        remote_tools: Vec<String>,
        local_tools: &BTreeMap<String, String>,
    ) -> Message {
        match self.run(conn_id, code, remote_tools, local_tools).await {
            Ok(data) => {
                info!("Execution complete");
                let reply = Message::Result { data };
                // An oversized result must still settle the round.
                match codec::encode(&reply) {
                    Ok(_) => reply,
                    Err(e) => {
                        error!(error = %e, "Result cannot be sent");
                        Message::error(format!("Failed to send result: {e}"), Some(EXECUTION_ERROR))
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "Execution failed");
                let message = if message.is_empty() {
                    "Execution failed".to_string()
                } else {
                    message
                };
                Message::error(message, Some(EXECUTION_ERROR))
            }
        }
    }
}
