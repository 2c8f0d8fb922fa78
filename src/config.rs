//! Relay server configuration.
//!
//! Sources, lowest priority first: built-in defaults, the
//! `SANDBOX_RELAY_CONFIG` JSON environment variable or a TOML file, the
//! `RELAY_HOST` / `RELAY_PORT` / `RELAY_CALL_TIMEOUT` overrides, and finally
//! command-line flags applied by the binary.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::error::RelayError;
use crate::script::ScriptLimits;
use crate::transport::MAX_FRAME_SIZE;

/// Environment variable holding the full configuration as JSON.
pub const CONFIG_ENV: &str = "SANDBOX_RELAY_CONFIG";

/// Smallest heap V8 can start an isolate with.
const MIN_HEAP_MB: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Interface to listen on.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Per remote tool call timeout.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,

    /// Wall-clock budget for one `execute` round inside the script engine.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_seconds: u64,

    /// V8 heap ceiling per round, in MiB.
    #[serde(default = "default_max_heap_mb")]
    pub max_heap_mb: usize,

    /// Largest accepted frame in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default)]
    pub debug: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            call_timeout_seconds: default_call_timeout(),
            execution_timeout_seconds: default_execution_timeout(),
            max_heap_mb: default_max_heap_mb(),
            max_message_size: default_max_message_size(),
            debug: false,
        }
    }
}

impl RelayConfig {
    /// Load from `path` if given, else from [`CONFIG_ENV`], else defaults,
    /// then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => match std::env::var(CONFIG_ENV) {
                Ok(json) => Self::from_json(&json)?,
                Err(_) => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse TOML configuration")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).with_context(|| format!("Failed to parse {CONFIG_ENV}"))
    }

    /// Apply `RELAY_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("RELAY_HOST") {
            debug!(%host, "RELAY_HOST override");
            self.host = host;
        }
        if let Some(port) = lookup("RELAY_PORT") {
            self.port = port
                .parse()
                .map_err(|_| RelayError::Configuration(format!("Invalid RELAY_PORT: {port}")))?;
        }
        if let Some(timeout) = lookup("RELAY_CALL_TIMEOUT") {
            self.call_timeout_seconds = timeout.parse().map_err(|_| {
                RelayError::Configuration(format!("Invalid RELAY_CALL_TIMEOUT: {timeout}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.host.trim().is_empty() {
            return Err(RelayError::Configuration("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(RelayError::Configuration("port must not be 0".into()));
        }
        if self.call_timeout_seconds == 0 {
            return Err(RelayError::Configuration(
                "call_timeout_seconds must be positive".into(),
            ));
        }
        if self.execution_timeout_seconds == 0 {
            return Err(RelayError::Configuration(
                "execution_timeout_seconds must be positive".into(),
            ));
        }
        if self.max_heap_mb < MIN_HEAP_MB {
            return Err(RelayError::Configuration(format!(
                "max_heap_mb must be at least {MIN_HEAP_MB}"
            )));
        }
        if self.max_message_size == 0 || self.max_message_size > MAX_FRAME_SIZE {
            return Err(RelayError::Configuration(format!(
                "max_message_size must be between 1 and {MAX_FRAME_SIZE}"
            )));
        }
        Ok(())
    }

    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    /// Per-round limits handed to the script engine.
    pub const fn script_limits(&self) -> ScriptLimits {
        ScriptLimits {
            timeout: Duration::from_secs(self.execution_timeout_seconds),
            max_heap_bytes: self.max_heap_mb * 1024 * 1024,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        Ok(addr
            .parse()
            .map_err(|_| RelayError::Configuration(format!("Invalid listen address {addr}")))?)
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

const fn default_port() -> u16 {
    8080
}

const fn default_call_timeout() -> u64 {
    30
}

const fn default_execution_timeout() -> u64 {
    300
}

const fn default_max_heap_mb() -> usize {
    256
}

const fn default_max_message_size() -> usize {
    MAX_FRAME_SIZE
}
