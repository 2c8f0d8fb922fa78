//! Host-side execution rounds.
//!
//! A round generates code for a request while connecting to the sandbox's
//! relay, runs the code there, and reports the outcome. The sandbox itself
//! is owned by the caller and may serve many rounds.

pub mod codegen;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use self::codegen::{
    build_system_prompt, extract_code, CodeGenerator, GeneratedCode, GenerationFailure,
};

use crate::client::{RelayClient, RelayClientConfig, RoundOutcome};
use crate::error::{RelayError, Result};
use crate::events::{EventSink, ExecutionEvent};
use crate::sandbox::Sandbox;
use crate::tool::ToolRegistry;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Port the relay listens on inside the sandbox.
    pub relay_port: u16,
    /// Connect with `wss://` instead of `ws://`.
    pub secure: bool,
    /// Deadline for one execution round.
    pub execution_timeout: Duration,
    pub connect_timeout: Duration,
    /// Appended to the system prompt.
    pub instructions: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            relay_port: 8080,
            secure: true,
            execution_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            instructions: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.relay_port == 0 {
            return Err(RelayError::Configuration("relay_port must not be 0".into()));
        }
        if self.execution_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(RelayError::Configuration("timeouts must be positive".into()));
        }
        Ok(())
    }
}

/// Outcome of running code in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

/// Outcome of a full request: generated code plus its execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub result: ExecutionResult,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    tools: Arc<ToolRegistry>,
    generator: Arc<dyn CodeGenerator>,
    sandbox: Arc<dyn Sandbox>,
    events: EventSink,
    remote_tools: Vec<String>,
    local_tools: BTreeMap<String, String>,
    system_prompt: String,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        tools: ToolRegistry,
        generator: Arc<dyn CodeGenerator>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Result<Self> {
        config.validate()?;
        let system_prompt =
            build_system_prompt(&tools.catalogue_doc(), config.instructions.as_deref());
        Ok(Self {
            remote_tools: tools.remote_names(),
            local_tools: tools.local_sources(),
            tools: Arc::new(tools),
            config,
            generator,
            sandbox,
            events: EventSink::default(),
            system_prompt,
        })
    }

    /// Deliver execution events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn tool_documentation(&self) -> String {
        self.tools.catalogue_doc()
    }

    pub fn relay_url(&self) -> String {
        let scheme = if self.config.secure { "wss" } else { "ws" };
        format!("{scheme}://{}/ws", self.sandbox.host(self.config.relay_port))
    }

    /// Generate code for `request` and run it in the sandbox.
    #[instrument(skip_all, fields(sandbox = %self.sandbox.id()))]
    pub async fn run(&self, request: &str) -> Result<RunResult> {
        let started = Instant::now();
        debug!(request_len = request.len(), "Generating code");

        let client = self.client();
        let (generated, connected) = tokio::join!(
            self.generator.generate(request, &self.system_prompt),
            client.connect(),
        );
        let generated = match (generated, connected) {
            (Ok(generated), Ok(())) => generated,
            (Err(failure), connected) => {
                if connected.is_ok() {
                    client.disconnect().await;
                }
                return Err(failure.into());
            }
            (Ok(_), Err(e)) => return Err(e),
        };

        let code = match extract_code(&generated.code) {
            Ok(code) => code,
            Err(e) => {
                client.disconnect().await;
                return Err(e);
            }
        };
        info!(code_len = code.len(), "Code generated");

        self.events.emit(ExecutionEvent::CodeGenerated {
            code: code.clone(),
            explanation: generated.explanation.clone(),
        });
        self.events.emit(ExecutionEvent::EnvironmentReady {
            sandbox_id: self.sandbox.id().to_string(),
        });

        let mut result = self.execute_with(&client, &code).await;
        result.execution_time_ms = elapsed_ms(started);
        Ok(RunResult {
            code,
            explanation: generated.explanation,
            result,
        })
    }

    /// Run already-written code in the sandbox.
    #[instrument(skip_all, fields(sandbox = %self.sandbox.id()))]
    pub async fn execute_code(&self, code: &str) -> Result<ExecutionResult> {
        let client = self.client();
        client.connect().await?;
        Ok(self.execute_with(&client, code).await)
    }

    /// A client bound to a fresh per-round credential.
    fn client(&self) -> RelayClient {
        let mut config = RelayClientConfig::new(self.relay_url(), Uuid::new_v4().to_string());
        config.connect_timeout = self.config.connect_timeout;
        config.reconnect = false;
        RelayClient::with_events(config, self.tools.clone(), self.events.clone())
    }

    async fn execute_with(&self, client: &RelayClient, code: &str) -> ExecutionResult {
        let started = Instant::now();
        let outcome = match client.execute(code, self.remote_tools.clone(), self.local_tools.clone()) {
            Ok(()) => client.wait_for_result(self.config.execution_timeout).await,
            Err(e) => RoundOutcome::failure(e.to_string()),
        };
        client.disconnect().await;

        let output = outcome.data.as_ref().map(render_output).unwrap_or_default();
        let error = (!outcome.success)
            .then(|| outcome.error.unwrap_or_else(|| "Execution failed".to_string()));
        if let Some(error) = &error {
            warn!(%error, "Execution failed");
        } else {
            info!(elapsed_ms = elapsed_ms(started), "Execution complete");
        }

        self.events.emit(ExecutionEvent::Complete {
            success: outcome.success,
            output: output.clone(),
            error: error.clone(),
        });
        ExecutionResult {
            success: outcome.success,
            output,
            error,
            execution_time_ms: elapsed_ms(started),
        }
    }
}

fn render_output(data: &Value) -> String {
    match data {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
