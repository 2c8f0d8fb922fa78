//! Embedded JavaScript engine for code submitted to the relay.
//!
//! Each round runs in a fresh V8 isolate (via `deno_core`) with a single
//! extension. Submitted code is the body of an async function whose only
//! parameter is `call(name, args)`; every call that is not a local tool
//! leaves the isolate through a [`Dispatch`] supplied by the caller.
//!
//! Local tool sources must look like a function literal before they are
//! evaluated. They run inside the same isolate and are not handed `call`.

// `op2` expands to unsafe V8 glue.
#[allow(unsafe_code)]
mod runtime;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

pub const EXECUTION_TIMEOUT: &str = "Execution timeout";
pub const MEMORY_LIMIT: &str = "Memory limit exceeded";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("SyntaxError: {0}")]
    Syntax(String),

    /// Message of whatever the code threw, including failed tool calls,
    /// which arrive already prefixed with their origin.
    #[error("{0}")]
    Thrown(String),

    #[error("Invalid local tool: {0}")]
    InvalidFunction(String),

    /// Stopped from outside: timeout, heap limit or cancellation.
    #[error("{0}")]
    Terminated(String),

    #[error("Script engine failed: {0}")]
    Engine(String),
}

/// The single capability a running script has.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn call(&self, name: &str, args: Map<String, Value>) -> Result<Value, String>;
}

/// Per-round resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptLimits {
    pub timeout: Duration,
    pub max_heap_bytes: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_heap_bytes: 256 * 1024 * 1024,
        }
    }
}

fn function_guard() -> &'static [Regex; 2] {
    static GUARD: OnceLock<[Regex; 2]> = OnceLock::new();
    GUARD.get_or_init(|| {
        [
            Regex::new(r"^(async\s+)?function\s*\(").expect("valid regex"),
            Regex::new(r"(?s)^(async\s+)?\(.*?\)\s*=>").expect("valid regex"),
        ]
    })
}

/// Whether `source` starts with a function or arrow-function signature.
pub fn looks_like_function(source: &str) -> bool {
    let source = source.trim();
    function_guard().iter().any(|re| re.is_match(source))
}

/// Check every local tool source. The first one that does not look like a
/// function literal fails the whole set.
pub fn check_local_tools(sources: &BTreeMap<String, String>) -> Result<(), ScriptError> {
    match sources.iter().find(|(_, source)| !looks_like_function(source)) {
        Some((name, _)) => Err(ScriptError::InvalidFunction(name.clone())),
        None => Ok(()),
    }
}

/// Runs submitted code under [`ScriptLimits`].
#[derive(Debug, Clone, Default)]
pub struct ScriptEngine {
    limits: ScriptLimits,
}

impl ScriptEngine {
    pub const fn new(limits: ScriptLimits) -> Self {
        Self { limits }
    }

    pub const fn limits(&self) -> ScriptLimits {
        self.limits
    }

    /// Run `code` to completion in a fresh isolate.
    ///
    /// The value the code returns is the result (`undefined` becomes
    /// `null`). Past the timeout the isolate is terminated and the round
    /// fails with `Execution timeout`, without waiting for tool calls
    /// still in flight.
    #[instrument(skip_all, fields(code_len = code.len(), local = local_tools.len()))]
    pub async fn run(
        &self,
        code: &str,
        local_tools: &BTreeMap<String, String>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Value, ScriptError> {
        check_local_tools(local_tools)?;

        let (ready, isolate) = oneshot::channel();
        let (cancel, cancelled) = oneshot::channel::<()>();
        let (done, finished) = oneshot::channel();
        let job = runtime::Job {
            code: code.to_string(),
            local_tools: local_tools.clone(),
            dispatch,
            handle: tokio::runtime::Handle::current(),
            max_heap_bytes: self.limits.max_heap_bytes,
        };
        runtime::spawn(
            job,
            runtime::Control {
                ready,
                cancel: cancelled,
                done,
            },
        )
        .map_err(|e| ScriptError::Engine(e.to_string()))?;

        match tokio::time::timeout(self.limits.timeout, finished).await {
            Ok(Ok(outcome)) => {
                debug!(ok = outcome.is_ok(), "Isolate finished");
                outcome
            }
            Ok(Err(_)) => Err(ScriptError::Engine("isolate thread exited".into())),
            Err(_) => {
                warn!(timeout = ?self.limits.timeout, "Execution timed out, terminating isolate");
                drop(cancel);
                tokio::spawn(async move {
                    if let Ok(handle) = isolate.await {
                        handle.terminate_execution();
                    }
                });
                Err(ScriptError::Terminated(EXECUTION_TIMEOUT.into()))
            }
        }
    }
}
