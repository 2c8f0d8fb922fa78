//! Isolated execution environment as seen by the orchestrator.
//!
//! Provisioning and teardown belong to the caller; the orchestrator only
//! needs an identifier and the address at which the relay listens, so one
//! environment can serve many rounds.

/// An environment that runs the relay server.
pub trait Sandbox: Send + Sync {
    /// Identifier reported in `environment_ready` events.
    fn id(&self) -> &str;

    /// `host:port` under which the relay port is reachable from the host.
    fn host(&self, port: u16) -> String;
}

/// A relay reachable on a fixed host, e.g. a server started on this machine
/// or inside a container with a published port.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    id: String,
    hostname: String,
    port_override: Option<u16>,
}

impl LocalSandbox {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            port_override: None,
        }
    }

    /// Ignore the requested port and always use `port`. Useful when the relay
    /// was bound to an ephemeral port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port_override = Some(port);
        self
    }
}

impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn host(&self, port: u16) -> String {
        format!("{}:{}", self.hostname, self.port_override.unwrap_or(port))
    }
}
