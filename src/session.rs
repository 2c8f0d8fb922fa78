//! Server-side relay session.
//!
//! A session binds one socket to one bearer token. The first token that
//! authorizes fixes it until the socket detaches; a connection presenting a
//! different token is refused, one presenting the same token replaces the
//! attached socket.
//!
//! Remote tool calls are tracked in a pending map keyed by correlation id.
//! Every entry leaves the map exactly once: on its `tool_result`, on its
//! timer, or when the socket detaches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::transport::{Message, Outbound};

/// Result of one remote call as seen by the script.
pub type CallOutcome = Result<Value, String>;

/// Failure for calls cut off by a detach, a replacement, or a round whose
/// connection is gone.
pub const CONNECTION_CLOSED: &str = "Connection closed";
/// Failure for calls with no `tool_result` within the call timeout.
pub const CALL_TIMEOUT: &str = "Timeout";

/// Why a connection was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Session is bound to a different token")]
    TokenMismatch,
}

struct PendingCall {
    resolver: oneshot::Sender<CallOutcome>,
    timer: AbortHandle,
}

struct Attachment {
    conn_id: u64,
    outbound: Outbound,
    /// Dropped when the attachment ends, which closes its socket.
    _close: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    token: Option<String>,
    attached: Option<Attachment>,
    pending: HashMap<String, PendingCall>,
}

/// Relay session shared by the connection handlers and running rounds.
pub struct Session {
    inner: Mutex<Inner>,
    /// Deadline for each remote tool call.
    call_timeout: Duration,
    next_conn: AtomicU64,
}

impl Session {
    /// Create an unbound session whose remote calls time out after
    /// `call_timeout`.
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            call_timeout,
            next_conn: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Check a bearer token, binding it if the session is unbound.
    pub fn authorize(&self, token: Option<&str>) -> Result<(), SessionError> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(SessionError::MissingToken)?;
        let mut inner = self.lock();
        match &inner.token {
            Some(bound) if bound != token => {
                warn!("Rejecting connection with mismatched token");
                Err(SessionError::TokenMismatch)
            }
            Some(_) => Ok(()),
            None => {
                debug!("Session bound to new token");
                inner.token = Some(token.to_string());
                Ok(())
            }
        }
    }

    /// Attach an authorized socket, replacing any previous one.
    ///
    /// Returns the connection id that must be passed to [`Session::detach`]
    /// and a receiver that completes once this attachment is replaced or
    /// detached. The connection handler closes its socket when it fires.
    pub fn attach(&self, token: &str, outbound: Outbound) -> (u64, oneshot::Receiver<()>) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (close, closed) = oneshot::channel();
        let mut inner = self.lock();
        if let Some(previous) = inner.attached.take() {
            info!(
                previous = previous.conn_id,
                conn_id, "Replacing attached connection"
            );
            fail_pending(&mut inner);
        }
        inner.token = Some(token.to_string());
        inner.attached = Some(Attachment {
            conn_id,
            outbound,
            _close: close,
        });
        info!(conn_id, "Connection attached");
        (conn_id, closed)
    }

    /// Detach `conn_id` if it is still the attached connection.
    ///
    /// Fails every pending call with `Connection closed` and unbinds the token.
    pub fn detach(&self, conn_id: u64) -> bool {
        let mut inner = self.lock();
        if inner.attached.as_ref().map(|a| a.conn_id) != Some(conn_id) {
            debug!(conn_id, "Stale connection closed, nothing to detach");
            return false;
        }
        inner.attached = None;
        inner.token = None;
        let failed = fail_pending(&mut inner);
        info!(conn_id, failed, "Connection detached");
        true
    }

    /// Whether a host socket is attached and still writable.
    pub fn is_connected(&self) -> bool {
        self.lock()
            .attached
            .as_ref()
            .is_some_and(|a| !a.outbound.is_closed())
    }

    /// Whether `conn_id` is the attached connection.
    pub fn is_attached(&self, conn_id: u64) -> bool {
        self.lock().attached.as_ref().map(|a| a.conn_id) == Some(conn_id)
    }

    /// Number of remote calls waiting for a `tool_result`.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Ask the host behind `conn_id` to run `tool` and wait for its
    /// `tool_result`.
    ///
    /// Fails with `Connection closed` when `conn_id` is no longer attached,
    /// so a round never calls out over a connection it did not arrive on.
    pub async fn call_remote(
        self: &Arc<Self>,
        conn_id: u64,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> CallOutcome {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();

        let outbound = {
            let mut inner = self.lock();
            let Some(outbound) = inner
                .attached
                .as_ref()
                .filter(|a| a.conn_id == conn_id)
                .map(|a| a.outbound.clone())
            else {
                debug!(conn_id, tool, "Round's connection is gone");
                return Err(CONNECTION_CLOSED.to_string());
            };
            let timer = self.spawn_timer(id.clone());
            inner.pending.insert(
                id.clone(),
                PendingCall {
                    resolver: tx,
                    timer,
                },
            );
            outbound
        };

        debug!(call_id = %id, tool, "Dispatching remote tool call");
        let sent = outbound.send(&Message::ToolCall {
            id: id.clone(),
            tool: tool.to_string(),
            arguments,
        });
        if !sent {
            self.resolve(&id, Err(CONNECTION_CLOSED.to_string()));
        }

        rx.await.unwrap_or_else(|_| Err(CONNECTION_CLOSED.to_string()))
    }

    fn spawn_timer(self: &Arc<Self>, id: String) -> AbortHandle {
        let session: Weak<Self> = Arc::downgrade(self);
        let timeout = self.call_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = session.upgrade() {
                if session.resolve(&id, Err(CALL_TIMEOUT.to_string())) {
                    warn!(call_id = %id, "Remote tool call timed out");
                }
            }
        })
        .abort_handle()
    }

    /// Settle a pending call. Returns `false` if `id` was not pending, which
    /// makes late or duplicate results harmless.
    pub fn resolve(&self, id: &str, outcome: CallOutcome) -> bool {
        let Some(call) = self.lock().pending.remove(id) else {
            debug!(call_id = %id, "Result for unknown or settled call");
            return false;
        };
        call.timer.abort();
        // The waiting script may already be gone.
        let _ = call.resolver.send(outcome);
        true
    }
}

fn fail_pending(inner: &mut Inner) -> usize {
    let count = inner.pending.len();
    for (_, call) in inner.pending.drain() {
        call.timer.abort();
        let _ = call.resolver.send(Err(CONNECTION_CLOSED.to_string()));
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::decode;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Conn {
        id: u64,
        rx: mpsc::UnboundedReceiver<Bytes>,
        closed: oneshot::Receiver<()>,
    }

    fn session(timeout_secs: u64) -> Arc<Session> {
        Arc::new(Session::new(Duration::from_secs(timeout_secs)))
    }

    fn attached(session: &Session) -> Conn {
        let (outbound, rx) = Outbound::channel();
        session.authorize(Some("tok")).unwrap();
        let (id, closed) = session.attach("tok", outbound);
        Conn { id, rx, closed }
    }

    fn spawn_call(
        session: &Arc<Session>,
        conn_id: u64,
        tool: &str,
    ) -> tokio::task::JoinHandle<CallOutcome> {
        let session = session.clone();
        let tool = tool.to_string();
        tokio::spawn(async move { session.call_remote(conn_id, &tool, Map::new()).await })
    }

    async fn next_call(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> (String, String) {
        match decode(&rx.recv().await.unwrap()).unwrap() {
            Message::ToolCall { id, tool, .. } => (id, tool),
            other => panic!("expected tool_call, got {other:?}"),
        }
    }

    #[test]
    fn first_token_binds() {
        let session = session(30);
        assert_eq!(session.authorize(None), Err(SessionError::MissingToken));
        assert_eq!(session.authorize(Some("")), Err(SessionError::MissingToken));
        assert!(session.authorize(Some("a")).is_ok());
        assert_eq!(session.authorize(Some("b")), Err(SessionError::TokenMismatch));
        assert!(session.authorize(Some("a")).is_ok());
    }

    #[tokio::test]
    async fn remote_call_resolves_with_result() {
        let session = session(30);
        let mut conn = attached(&session);

        let call = tokio::spawn({
            let session = session.clone();
            let args = json!({"a": 2, "b": 3}).as_object().cloned().unwrap();
            async move { session.call_remote(conn.id, "add", args).await }
        });
        let (id, tool) = next_call(&mut conn.rx).await;
        assert_eq!(tool, "add");
        assert_eq!(session.pending_count(), 1);

        assert!(session.resolve(&id, Ok(json!(5))));
        assert!(!session.resolve(&id, Ok(json!(6))), "second resolution is a no-op");
        assert_eq!(call.await.unwrap(), Ok(json!(5)));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_only_the_slow_call() {
        let session = session(30);
        let mut conn = attached(&session);

        let slow = spawn_call(&session, conn.id, "slow");
        let fast = spawn_call(&session, conn.id, "fast");

        let mut ids = HashMap::new();
        for _ in 0..2 {
            let (id, tool) = next_call(&mut conn.rx).await;
            ids.insert(tool, id);
        }
        session.resolve(&ids["fast"], Ok(json!("done")));
        assert_eq!(fast.await.unwrap(), Ok(json!("done")));

        let started = tokio::time::Instant::now();
        assert_eq!(slow.await.unwrap(), Err(CALL_TIMEOUT.to_string()));
        assert!(started.elapsed() >= Duration::from_secs(29));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn detach_fails_all_pending() {
        let session = session(30);
        let mut conn = attached(&session);

        let calls: Vec<_> = (0..5)
            .map(|i| spawn_call(&session, conn.id, &format!("t{i}")))
            .collect();
        for _ in 0..5 {
            next_call(&mut conn.rx).await;
        }
        assert_eq!(session.pending_count(), 5);

        assert!(session.detach(conn.id));
        for call in calls {
            assert_eq!(call.await.unwrap(), Err(CONNECTION_CLOSED.to_string()));
        }
        assert_eq!(session.pending_count(), 0);
        assert!(!session.is_connected());
        assert!(conn.closed.await.is_err(), "detach signals the handler");

        // Unbound again: a new token may bind.
        assert!(session.authorize(Some("other")).is_ok());
    }

    #[tokio::test]
    async fn stale_detach_is_ignored() {
        let session = session(30);
        let first = attached(&session);
        let second = attached(&session);
        assert_ne!(first.id, second.id);

        assert!(!session.detach(first.id));
        assert!(session.is_connected());
        assert!(session.is_attached(second.id));
        assert!(session.detach(second.id));
    }

    #[tokio::test]
    async fn replacing_connection_fails_pending_calls() {
        let session = session(30);
        let mut conn = attached(&session);
        let call = spawn_call(&session, conn.id, "t");
        next_call(&mut conn.rx).await;

        let _second = attached(&session);
        assert_eq!(call.await.unwrap(), Err(CONNECTION_CLOSED.to_string()));
    }

    #[tokio::test]
    async fn replaced_connection_is_closed_and_cut_off() {
        let session = session(30);
        let first = attached(&session);
        let mut second = attached(&session);

        // The first handler is told to close its socket.
        assert!(first.closed.await.is_err());
        assert!(!session.is_attached(first.id));

        // A round that arrived on the first socket cannot reach the second.
        assert_eq!(
            spawn_call(&session, first.id, "slow").await.unwrap(),
            Err(CONNECTION_CLOSED.to_string())
        );
        assert!(second.rx.try_recv().is_err());
        assert_eq!(session.pending_count(), 0);

        let call = spawn_call(&session, second.id, "fast");
        let (id, tool) = next_call(&mut second.rx).await;
        assert_eq!(tool, "fast");
        session.resolve(&id, Ok(json!(1)));
        assert_eq!(call.await.unwrap(), Ok(json!(1)));
    }

    #[tokio::test]
    async fn call_without_connection_fails_fast() {
        let session = session(30);
        assert_eq!(
            session.call_remote(1, "t", Map::new()).await,
            Err(CONNECTION_CLOSED.to_string())
        );
        assert_eq!(session.pending_count(), 0);
    }
}
