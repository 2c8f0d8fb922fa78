//! Error taxonomy shared by the host and the sandbox side of the relay.
//!
//! Every error carries a machine-readable code and serializes to a
//! structured `{name, code, message, cause?}` object for observability.

use serde_json::{json, Value};
use thiserror::Error;

use crate::transport::codec::CodecError;

/// Sub-classification of protocol failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorCode {
    /// The frame could not be decoded at all.
    InvalidFrame,
    /// The frame decoded but the message violates the shape rules.
    InvalidMessage,
    /// A well-formed message arrived where another kind was expected.
    UnexpectedType,
}

impl ProtocolErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidFrame => "INVALID_FRAME",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::UnexpectedType => "UNEXPECTED_TYPE",
        }
    }
}

impl std::fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Cause = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the relay library.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{message}")]
    CodeGeneration {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("{message}")]
    Execution {
        message: String,
        output: Option<String>,
        #[source]
        cause: Option<Cause>,
    },

    #[error("{message}")]
    Tool {
        message: String,
        tool_name: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("{message}")]
    RelayConnection {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("{0}")]
    RelayTimeout(String),

    #[error("{message}")]
    Protocol {
        message: String,
        protocol_code: ProtocolErrorCode,
    },

    #[error("{message}")]
    Sandbox {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("{0}")]
    Configuration(String),
}

impl RelayError {
    pub fn code_generation(message: impl Into<String>) -> Self {
        Self::CodeGeneration {
            message: message.into(),
            cause: None,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            output: None,
            cause: None,
        }
    }

    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            message: message.into(),
            tool_name: tool_name.into(),
            cause: None,
        }
    }

    pub fn connection(message: impl Into<String>, cause: Option<Cause>) -> Self {
        Self::RelayConnection {
            message: message.into(),
            cause,
        }
    }

    pub fn protocol(message: impl Into<String>, protocol_code: ProtocolErrorCode) -> Self {
        Self::Protocol {
            message: message.into(),
            protocol_code,
        }
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox {
            message: message.into(),
            cause: None,
        }
    }

    /// Type name as exposed in the structured form.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CodeGeneration { .. } => "CodeGenerationError",
            Self::Execution { .. } => "ExecutionError",
            Self::Tool { .. } => "ToolError",
            Self::RelayConnection { .. } => "RelayConnectionError",
            Self::RelayTimeout(_) => "RelayTimeoutError",
            Self::Protocol { .. } => "ProtocolError",
            Self::Sandbox { .. } => "SandboxError",
            Self::Configuration(_) => "ConfigurationError",
        }
    }

    /// Machine-readable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::CodeGeneration { .. } => "CODE_GENERATION_ERROR",
            Self::Execution { .. } => "EXECUTION_ERROR",
            Self::Tool { .. } => "TOOL_ERROR",
            Self::RelayConnection { .. } => "RELAY_CONNECTION_ERROR",
            Self::RelayTimeout(_) => "RELAY_TIMEOUT_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Sandbox { .. } => "SANDBOX_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    fn cause(&self) -> Option<&Cause> {
        match self {
            Self::CodeGeneration { cause, .. }
            | Self::Execution { cause, .. }
            | Self::Tool { cause, .. }
            | Self::RelayConnection { cause, .. }
            | Self::Sandbox { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    /// Structured form: `{name, code, message, cause?}` plus variant extras.
    pub fn to_json(&self) -> Value {
        let mut value = json!({
            "name": self.name(),
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(cause) = self.cause() {
            value["cause"] = Value::String(cause.to_string());
        }
        match self {
            Self::Execution {
                output: Some(output),
                ..
            } => value["output"] = Value::String(output.clone()),
            Self::Tool { tool_name, .. } => value["toolName"] = Value::String(tool_name.clone()),
            Self::Protocol { protocol_code, .. } => {
                value["protocolCode"] = Value::String(protocol_code.as_str().to_string());
            }
            _ => {}
        }
        value
    }
}

impl From<&CodecError> for ProtocolErrorCode {
    fn from(err: &CodecError) -> Self {
        match err {
            CodecError::UnknownMessageType(_) => Self::UnexpectedType,
            CodecError::Invalid(_) => Self::InvalidMessage,
            _ => Self::InvalidFrame,
        }
    }
}

impl From<CodecError> for RelayError {
    fn from(err: CodecError) -> Self {
        Self::protocol(err.to_string(), ProtocolErrorCode::from(&err))
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(RelayError::code_generation("x").code(), "CODE_GENERATION_ERROR");
        assert_eq!(RelayError::execution("x").code(), "EXECUTION_ERROR");
        assert_eq!(RelayError::tool("add", "x").code(), "TOOL_ERROR");
        assert_eq!(RelayError::connection("x", None).code(), "RELAY_CONNECTION_ERROR");
        assert_eq!(RelayError::RelayTimeout("x".into()).code(), "RELAY_TIMEOUT_ERROR");
        assert_eq!(
            RelayError::protocol("x", ProtocolErrorCode::InvalidFrame).code(),
            "PROTOCOL_ERROR"
        );
        assert_eq!(RelayError::sandbox("x").code(), "SANDBOX_ERROR");
        assert_eq!(RelayError::Configuration("x".into()).code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn json_includes_cause_and_extras() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = RelayError::connection("Failed to connect to relay", Some(Box::new(io)));
        let json = err.to_json();
        assert_eq!(json["name"], "RelayConnectionError");
        assert_eq!(json["code"], "RELAY_CONNECTION_ERROR");
        assert_eq!(json["message"], "Failed to connect to relay");
        assert_eq!(json["cause"], "refused");

        let err = RelayError::tool("get_users", "boom");
        assert_eq!(err.to_json()["toolName"], "get_users");

        let err = RelayError::protocol("bad", ProtocolErrorCode::UnexpectedType);
        assert_eq!(err.to_json()["protocolCode"], "UNEXPECTED_TYPE");
        assert!(err.to_json().get("cause").is_none());
    }

    #[test]
    fn execution_output_is_serialized() {
        let err = RelayError::Execution {
            message: "failed".into(),
            output: Some("partial".into()),
            cause: None,
        };
        assert_eq!(err.to_json()["output"], "partial");
    }

    #[test]
    fn codec_errors_map_to_protocol_errors() {
        let err: RelayError = CodecError::UnknownMessageType("bogus".into()).into();
        assert!(matches!(
            err,
            RelayError::Protocol {
                protocol_code: ProtocolErrorCode::UnexpectedType,
                ..
            }
        ));
    }
}
