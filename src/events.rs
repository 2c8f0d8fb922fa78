//! Structured execution events.
//!
//! Events are delivered in order over an unbounded channel. For any call id
//! the `tool_call` event is sent before its `tool_result` or `tool_error`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    CodeGenerated {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
    },
    EnvironmentReady {
        sandbox_id: String,
    },
    ToolCall {
        tool: String,
        arguments: Map<String, Value>,
        call_id: String,
    },
    ToolResult {
        tool: String,
        result: Value,
        call_id: String,
        duration_ms: u64,
    },
    ToolError {
        tool: String,
        error: String,
        call_id: String,
    },
    Result {
        data: Value,
    },
    Complete {
        success: bool,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ExecutionEvent {
    /// Correlation id of tool events.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall { call_id, .. }
            | Self::ToolResult { call_id, .. }
            | Self::ToolError { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

/// Optional event channel. Emitting without a subscriber is a no-op.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<ExecutionEvent>>);

impl EventSink {
    pub const fn new(tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        Self(Some(tx))
    }

    /// A sink plus the receiver that observes it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.0 {
            // A dropped receiver just means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }
}
