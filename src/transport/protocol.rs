//! Relay message types.
//!
//! Seven message kinds travel between the host client and the sandbox
//! server. The JSON shape (`{"type": "...", ...}`) is the logical schema;
//! the bytes on the wire come from [`super::codec`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum length of a correlation id.
pub const MAX_ID_LEN: usize = 64;

/// Maximum length of a tool name.
pub const MAX_TOOL_NAME_LEN: usize = 128;

/// Maximum length of an error message carried in a frame.
pub const MAX_ERROR_LEN: usize = 4096;

/// Maximum length of an error code.
pub const MAX_CODE_LEN: usize = 64;

/// A relay message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Sandbox asks the host to run a tool.
    ToolCall {
        id: String,
        tool: String,
        #[serde(default)]
        arguments: Map<String, Value>,
    },
    /// Host answers a `ToolCall`.
    ToolResult {
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Host submits code for one execution round.
    Execute {
        code: String,
        #[serde(rename = "remoteTools", default)]
        remote_tools: Vec<String>,
        #[serde(rename = "localTools", default)]
        local_tools: BTreeMap<String, String>,
    },
    /// Return value of a successful round.
    Result {
        #[serde(default)]
        data: Value,
    },
    /// Failure, either of a round (no id) or of a correlated request.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Ping {
        id: String,
    },
    Pong {
        id: String,
    },
}

/// Discriminant of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ToolCall,
    ToolResult,
    Execute,
    Result,
    Error,
    Ping,
    Pong,
}

impl MessageKind {
    pub const ALL: [Self; 7] = [
        Self::ToolCall,
        Self::ToolResult,
        Self::Execute,
        Self::Result,
        Self::Error,
        Self::Ping,
        Self::Pong,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Execute => "execute",
            Self::Result => "result",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Wire tag for the kind.
    pub const fn tag(self) -> u8 {
        match self {
            Self::ToolCall => 1,
            Self::ToolResult => 2,
            Self::Execute => 3,
            Self::Result => 4,
            Self::Error => 5,
            Self::Ping => 6,
            Self::Pong => 7,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

impl Message {
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::ToolCall { .. } => MessageKind::ToolCall,
            Self::ToolResult { .. } => MessageKind::ToolResult,
            Self::Execute { .. } => MessageKind::Execute,
            Self::Result { .. } => MessageKind::Result,
            Self::Error { .. } => MessageKind::Error,
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
        }
    }

    /// Correlation id, if the message carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::ToolCall { id, .. }
            | Self::ToolResult { id, .. }
            | Self::Ping { id }
            | Self::Pong { id } => Some(id),
            Self::Error { id, .. } => id.as_deref(),
            Self::Execute { .. } | Self::Result { .. } => None,
        }
    }

    /// Round-level error with an error message clamped to the frame limit.
    pub fn error(error: impl Into<String>, code: Option<&str>) -> Self {
        Self::Error {
            id: None,
            error: clamp_error(error.into()),
            code: code.map(str::to_string),
        }
    }

    /// Check the shape rules every frame must satisfy.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::ToolCall { id, tool, .. } => {
                validate_id(id)?;
                validate_tool_name(tool)
            }
            Self::ToolResult { id, error, .. } => {
                validate_id(id)?;
                if let Some(error) = error {
                    validate_len("error", error, MAX_ERROR_LEN)?;
                }
                Ok(())
            }
            Self::Error { id, error, code } => {
                if let Some(id) = id {
                    validate_id(id)?;
                }
                if error.is_empty() {
                    return Err("error must not be empty".into());
                }
                validate_len("error", error, MAX_ERROR_LEN)?;
                if let Some(code) = code {
                    validate_len("code", code, MAX_CODE_LEN)?;
                }
                Ok(())
            }
            Self::Ping { id } | Self::Pong { id } => validate_id(id),
            Self::Execute { .. } | Self::Result { .. } => Ok(()),
        }
    }
}

/// Whether `name` matches `^[A-Za-z][A-Za-z0-9_]*$` within the length limit.
pub fn is_valid_tool_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_TOOL_NAME_LEN
        && first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Truncate an error message to [`MAX_ERROR_LEN`] bytes on a char boundary.
pub fn clamp_error(mut error: String) -> String {
    if error.len() > MAX_ERROR_LEN {
        let mut end = MAX_ERROR_LEN;
        while !error.is_char_boundary(end) {
            end -= 1;
        }
        error.truncate(end);
    }
    error
}

fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("id must not be empty".into());
    }
    validate_len("id", id, MAX_ID_LEN)
}

fn validate_tool_name(tool: &str) -> Result<(), String> {
    if is_valid_tool_name(tool) {
        Ok(())
    } else {
        Err(format!("Invalid tool name format: {tool:?}"))
    }
}

fn validate_len(field: &str, value: &str, max: usize) -> Result<(), String> {
    if value.chars().count() > max {
        return Err(format!("{field} exceeds {max} characters"));
    }
    Ok(())
}
