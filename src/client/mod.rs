//! Host side of the relay.
//!
//! [`RelayClient`] owns the websocket to the sandbox, answers `tool_call`
//! frames from the tool registry, and tracks the single outstanding
//! execution round. Each connection runs a reader and a writer task; the
//! writer drains an [`Outbound`] channel, so dropping the channel closes the
//! socket gracefully.

pub mod backoff;

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::SplitStream;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};

pub use self::backoff::BackoffConfig;

use crate::error::{RelayError, Result};
use crate::events::{EventSink, ExecutionEvent};
use crate::tool::ToolRegistry;
use crate::transport::codec::{self, json_peer_mismatch};
use crate::transport::protocol::clamp_error;
use crate::transport::{Message, Outbound, MAX_FRAME_SIZE};

pub const EXECUTION_TIMEOUT: &str = "Execution timeout";
pub const CONNECTION_CLOSED: &str = "Connection closed";
pub const UNKNOWN_TOOL: &str = "Unknown tool";
pub const RESULT_TOO_LARGE: &str = "Result too large";

/// How long `disconnect` waits for the sandbox to acknowledge the close.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection settings for a [`RelayClient`].
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// `ws://` or `wss://` URL of the relay's `/ws` endpoint.
    pub url: String,
    /// Bearer token presented during the handshake.
    pub token: String,
    /// Deadline for the websocket handshake.
    pub connect_timeout: Duration,
    /// Reconnect after an unexpected close.
    pub reconnect: bool,
    /// Consecutive failed reconnects before giving up.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Largest frame sent or accepted, in bytes.
    pub max_message_size: usize,
}

impl RelayClientConfig {
    /// Defaults: 30s connect timeout, reconnect with up to 5 retries,
    /// 10 MiB frames.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            connect_timeout: Duration::from_secs(30),
            reconnect: true,
            max_retries: 5,
            backoff: BackoffConfig::default(),
            max_message_size: MAX_FRAME_SIZE,
        }
    }

    /// Reject non-websocket URLs, empty tokens and bad backoff settings.
    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(RelayError::Configuration(format!(
                "Relay URL must use ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.token.is_empty() {
            return Err(RelayError::Configuration("Relay token must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(RelayError::Configuration(
                "connect_timeout must be positive".into(),
            ));
        }
        self.backoff.validate()
    }
}

/// How an execution round ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl RoundOutcome {
    /// A round that returned `data`.
    pub const fn success(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    /// A round that failed with `error`.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// State of the current execution round, reset by every `execute`.
#[derive(Debug, Default)]
pub struct ExecutionState {
    started: bool,
    resolved: bool,
    data: Option<Value>,
    error: Option<String>,
    resolver: Option<oneshot::Sender<RoundOutcome>>,
}

impl ExecutionState {
    const fn is_settled(&self) -> bool {
        self.resolved || self.error.is_some()
    }

    fn outcome(&self) -> Option<RoundOutcome> {
        if self.resolved {
            Some(RoundOutcome::success(self.data.clone()))
        } else {
            self.error.as_ref().map(RoundOutcome::failure)
        }
    }

    /// Settle the round once; later outcomes are ignored.
    fn settle(&mut self, outcome: RoundOutcome) -> bool {
        if self.is_settled() {
            return false;
        }
        if outcome.success {
            self.resolved = true;
            self.data.clone_from(&outcome.data);
        } else {
            self.error.clone_from(&outcome.error);
        }
        if let Some(resolver) = self.resolver.take() {
            let _ = resolver.send(outcome);
        }
        true
    }
}

#[derive(Default)]
struct ClientState {
    outbound: Option<Outbound>,
    generation: u64,
    closing: bool,
    retry_count: u32,
    execution: ExecutionState,
    pings: HashMap<String, oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
}

struct Inner {
    config: RelayClientConfig,
    tools: Arc<ToolRegistry>,
    events: EventSink,
    state: Mutex<ClientState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn outbound(&self) -> Option<Outbound> {
        self.lock().outbound.clone()
    }

    fn send(&self, msg: &Message) -> bool {
        match self.outbound() {
            Some(outbound) => outbound.send(msg),
            None => {
                debug!(kind = %msg.kind(), "Not connected, dropping message");
                false
            }
        }
    }
}

/// Host endpoint of the relay. Cloning yields another handle to the same
/// connection.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    /// A disconnected client that answers tool calls from `tools` and
    /// discards events.
    pub fn new(config: RelayClientConfig, tools: Arc<ToolRegistry>) -> Self {
        Self::with_events(config, tools, EventSink::default())
    }

    /// Like [`RelayClient::new`], reporting progress to `events`.
    pub fn with_events(config: RelayClientConfig, tools: Arc<ToolRegistry>, events: EventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                tools,
                events,
                state: Mutex::new(ClientState::default()),
            }),
        }
    }

    /// Whether a socket is open and its writer is still running. False
    /// while a reconnect is pending.
    pub fn connected(&self) -> bool {
        self.inner
            .lock()
            .outbound
            .as_ref()
            .is_some_and(|o| !o.is_closed())
    }

    /// Open the socket. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        if self.connected() {
            return Ok(());
        }
        self.inner.config.validate()?;
        self.inner.lock().closing = false;
        open(&self.inner).await
    }

    /// Close the socket without reconnecting. Also stops a reconnect loop
    /// that is waiting out its backoff.
    pub async fn disconnect(&self) {
        let reader = {
            let mut state = self.inner.lock();
            state.closing = true;
            state.outbound = None;
            state.reader.take()
        };
        let Some(mut reader) = reader else {
            return;
        };
        if tokio::time::timeout(CLOSE_GRACE, &mut reader).await.is_err() {
            debug!("Relay did not acknowledge close, dropping connection");
            reader.abort();
            let generation = self.inner.lock().generation;
            on_closed(&self.inner, generation);
        }
        info!("Disconnected from relay");
    }

    /// Start a round: reset the execution state and send `execute`.
    ///
    /// Fails while the previous round is unsettled or when not connected.
    pub fn execute(
        &self,
        code: &str,
        remote_tools: Vec<String>,
        local_tools: BTreeMap<String, String>,
    ) -> Result<()> {
        let outbound = {
            let mut state = self.inner.lock();
            if state.execution.started && !state.execution.is_settled() {
                return Err(RelayError::execution(
                    "Previous execution round has not settled",
                ));
            }
            let Some(outbound) = state.outbound.clone().filter(|o| !o.is_closed()) else {
                return Err(RelayError::connection("Not connected to relay", None));
            };
            state.execution = ExecutionState {
                started: true,
                ..ExecutionState::default()
            };
            outbound
        };
        debug!(code_len = code.len(), "Executing code");
        let sent = outbound.send(&Message::Execute {
            code: code.to_string(),
            remote_tools,
            local_tools,
        });
        if !sent {
            self.inner
                .lock()
                .execution
                .settle(RoundOutcome::failure(CONNECTION_CLOSED));
            return Err(RelayError::connection("Failed to send execute", None));
        }
        Ok(())
    }

    /// Wait for the current round to settle, at most `timeout`.
    ///
    /// A round that already settled returns immediately. On timeout the
    /// round is settled as `Execution timeout`; later frames do not change
    /// it.
    pub async fn wait_for_result(&self, timeout: Duration) -> RoundOutcome {
        let rx = {
            let mut state = self.inner.lock();
            if let Some(outcome) = state.execution.outcome() {
                return outcome;
            }
            let (tx, rx) = oneshot::channel();
            state.execution.resolver = Some(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => RoundOutcome::failure(CONNECTION_CLOSED),
            Err(_) => {
                let mut state = self.inner.lock();
                state.execution.resolver = None;
                // A result that raced the timer wins.
                if let Some(outcome) = state.execution.outcome() {
                    return outcome;
                }
                warn!(timeout_ms = timeout.as_millis(), "Execution timed out");
                state.execution.error = Some(EXECUTION_TIMEOUT.to_string());
                RoundOutcome::failure(EXECUTION_TIMEOUT)
            }
        }
    }

    /// Round-trip a `ping` and return the latency.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.lock().pings.insert(id.clone(), tx);

        let started = Instant::now();
        if !self.inner.send(&Message::Ping { id: id.clone() }) {
            self.inner.lock().pings.remove(&id);
            return Err(RelayError::connection("Not connected to relay", None));
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(RelayError::connection(CONNECTION_CLOSED, None)),
            Err(_) => {
                self.inner.lock().pings.remove(&id);
                Err(RelayError::RelayTimeout(format!(
                    "No pong within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }
}

fn ws_request(
    config: &RelayClientConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::connection(format!("Invalid relay URL {}", config.url), Some(Box::new(e))))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", config.token))
        .map_err(|e| RelayError::connection("Invalid relay token", Some(Box::new(e))))?;
    request.headers_mut().insert(header::AUTHORIZATION, bearer);
    Ok(request)
}

#[instrument(skip_all, fields(url = %inner.config.url))]
async fn open(inner: &Arc<Inner>) -> Result<()> {
    let config = &inner.config;
    let request = ws_request(config)?;
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_message_size))
        .max_frame_size(Some(config.max_message_size));

    let connecting = connect_async_with_config(request, Some(ws_config), true);
    let (stream, _) = match tokio::time::timeout(config.connect_timeout, connecting).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(e)) => {
            return Err(RelayError::connection(
                format!("Failed to connect to relay at {}", config.url),
                Some(Box::new(e)),
            ))
        }
        Err(_) => {
            return Err(RelayError::connection(
                format!(
                    "Connection timeout ({}ms)",
                    config.connect_timeout.as_millis()
                ),
                None,
            ))
        }
    };

    let (mut sink, source) = stream.split();
    let (outbound, mut frames) = Outbound::channel();

    let generation = {
        let mut state = inner.lock();
        state.generation += 1;
        state.outbound = Some(outbound);
        state.retry_count = 0;
        state.generation
    };

    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if sink.send(WsMessage::Binary(frame)).await.is_err() {
                debug!("Relay send failed, socket closed");
                break;
            }
        }
        let _ = sink.close().await;
    });
    let reader = tokio::spawn(read_loop(inner.clone(), source, generation));
    inner.lock().reader = Some(reader);

    info!(generation, "Connected to relay");
    Ok(())
}

async fn read_loop(inner: Arc<Inner>, mut source: WsSource, generation: u64) {
    while let Some(result) = source.next().await {
        match result {
            Ok(WsMessage::Binary(data)) => on_frame(&inner, &data),
            Ok(WsMessage::Text(_)) => {
                let error = json_peer_mismatch().to_string();
                warn!(%error, "Relay speaks the JSON protocol");
                inner.lock().execution.settle(RoundOutcome::failure(error));
            }
            Ok(WsMessage::Close(frame)) => {
                debug!(?frame, "Relay closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Relay connection error");
                break;
            }
        }
    }
    on_closed(&inner, generation);
}

fn on_closed(inner: &Arc<Inner>, generation: u64) {
    let reconnect = {
        let mut state = inner.lock();
        if state.generation != generation {
            return;
        }
        state.generation += 1;
        state.outbound = None;
        state.reader = None;
        state.pings.clear();
        if state.execution.started || state.execution.resolver.is_some() {
            state
                .execution
                .settle(RoundOutcome::failure(CONNECTION_CLOSED));
        }
        !state.closing && inner.config.reconnect
    };
    info!(reconnect, "Relay connection closed");
    if reconnect {
        tokio::spawn(reconnect_loop(inner.clone()));
    }
}

fn reconnect_loop(inner: Arc<Inner>) -> BoxFuture<'static, ()> {
    async move {
        loop {
            let attempt = {
                let mut state = inner.lock();
                if state.closing {
                    return;
                }
                if state.retry_count >= inner.config.max_retries {
                    debug!(retries = state.retry_count, "Max retries exceeded");
                    return;
                }
                state.retry_count += 1;
                state.retry_count
            };

            let delay = inner.config.backoff.delay(attempt);
            info!(attempt, delay_ms = delay.as_millis(), "Reconnecting");
            tokio::time::sleep(delay).await;
            if inner.lock().closing {
                return;
            }

            match open(&inner).await {
                Ok(()) => return,
                Err(e) => warn!(attempt, error = %e, "Reconnect failed"),
            }
        }
    }
    .boxed()
}

fn on_frame(inner: &Arc<Inner>, data: &[u8]) {
    if data.len() > inner.config.max_message_size {
        warn!(len = data.len(), "Frame exceeds size limit");
        return;
    }
    let msg = match codec::decode(data) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "Failed to decode frame");
            return;
        }
    };

    match msg {
        Message::ToolCall {
            id,
            tool,
            arguments,
        } => handle_tool_call(inner, id, tool, arguments),
        Message::Result { data } => {
            debug!("Round result received");
            inner.events.emit(ExecutionEvent::Result { data: data.clone() });
            inner
                .lock()
                .execution
                .settle(RoundOutcome::success(Some(data)));
        }
        Message::Error { error, code, .. } => {
            debug!(%error, ?code, "Round failed");
            inner.lock().execution.settle(RoundOutcome::failure(error));
        }
        Message::Ping { id } => {
            inner.send(&Message::Pong { id });
        }
        Message::Pong { id } => {
            if let Some(waiter) = inner.lock().pings.remove(&id) {
                let _ = waiter.send(());
            }
        }
        Message::ToolResult { .. } | Message::Execute { .. } => {
            warn!(kind = %msg.kind(), "Unexpected message from relay");
        }
    }
}

/// Answer a `tool_call` from the registry.
///
/// `tool_call` is emitted before the handler runs. The terminal event
/// (`tool_result` or `tool_error`) is emitted only once the reply is known
/// to fit in a frame, so the events never claim a success the sandbox did
/// not receive.
fn handle_tool_call(inner: &Arc<Inner>, id: String, tool: String, arguments: Map<String, Value>) {
    debug!(call_id = %id, %tool, "Tool call");
    inner.events.emit(ExecutionEvent::ToolCall {
        tool: tool.clone(),
        arguments: arguments.clone(),
        call_id: id.clone(),
    });

    let inner = inner.clone();
    tokio::spawn(async move {
        let started = Instant::now();
        let outcome = match inner.tools.remote(&tool) {
            None => Err(UNKNOWN_TOOL.to_string()),
            Some(handler) => match AssertUnwindSafe(handler.execute(arguments))
                .catch_unwind()
                .await
            {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => {
                    warn!(call_id = %id, %tool, "Tool handler panicked");
                    Err("Execution failed".to_string())
                }
            },
        };

        let outcome = outcome.and_then(|result| {
            let reply = Message::ToolResult {
                id: id.clone(),
                success: true,
                result: Some(result.clone()),
                error: None,
            };
            match codec::encode(&reply) {
                Ok(frame) if frame.len() <= inner.config.max_message_size => Ok((result, frame)),
                Ok(frame) => {
                    warn!(call_id = %id, %tool, len = frame.len(), "Tool result exceeds frame limit");
                    Err(RESULT_TOO_LARGE.to_string())
                }
                Err(e) => {
                    warn!(call_id = %id, %tool, error = %e, "Tool result cannot be encoded");
                    Err(RESULT_TOO_LARGE.to_string())
                }
            }
        });

        match outcome {
            Ok((result, frame)) => {
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                inner.events.emit(ExecutionEvent::ToolResult {
                    tool,
                    result,
                    call_id: id,
                    duration_ms,
                });
                match inner.outbound() {
                    Some(outbound) => {
                        outbound.send_frame(frame);
                    }
                    None => debug!("Not connected, dropping tool result"),
                }
            }
            Err(error) => {
                let error = if error.is_empty() {
                    "Execution failed".to_string()
                } else {
                    clamp_error(error)
                };
                warn!(call_id = %id, %tool, %error, "Tool failed");
                inner.events.emit(ExecutionEvent::ToolError {
                    tool,
                    error: error.clone(),
                    call_id: id.clone(),
                });
                inner.send(&Message::ToolResult {
                    id,
                    success: false,
                    result: None,
                    error: Some(error),
                });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolDefinition;
    use crate::transport::decode;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    async fn add(args: Map<String, Value>) -> anyhow::Result<Value> {
        let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(json!(a + b))
    }

    async fn fail(_: Map<String, Value>) -> anyhow::Result<Value> {
        anyhow::bail!("database offline")
    }

    async fn huge(_: Map<String, Value>) -> anyhow::Result<Value> {
        Ok(Value::String("x".repeat(MAX_FRAME_SIZE + 10)))
    }

    struct Harness {
        client: RelayClient,
        frames: mpsc::UnboundedReceiver<Bytes>,
        events: mpsc::UnboundedReceiver<ExecutionEvent>,
    }

    impl Harness {
        /// A client whose socket is replaced by an in-memory channel.
        fn new() -> Self {
            let tools = ToolRegistry::new([
                ToolDefinition::new("add", "Add two numbers", add),
                ToolDefinition::new("fail", "Always fails", fail),
                ToolDefinition::new("huge", "Returns too much data", huge),
            ])
            .unwrap();
            let (sink, events) = EventSink::channel();
            let client = RelayClient::with_events(
                RelayClientConfig::new("ws://127.0.0.1:1/ws", "tok"),
                Arc::new(tools),
                sink,
            );
            let (outbound, frames) = Outbound::channel();
            {
                let mut state = client.inner.lock();
                state.outbound = Some(outbound);
                state.generation = 1;
            }
            Self {
                client,
                frames,
                events,
            }
        }

        fn deliver(&self, msg: &Message) {
            on_frame(&self.client.inner, &codec::encode(msg).unwrap());
        }

        async fn next_frame(&mut self) -> Message {
            decode(&self.frames.recv().await.unwrap()).unwrap()
        }
    }

    fn tool_call(id: &str, tool: &str, args: Value) -> Message {
        Message::ToolCall {
            id: id.into(),
            tool: tool.into(),
            arguments: args.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn answers_tool_call() {
        let mut h = Harness::new();
        h.deliver(&tool_call("c1", "add", json!({"a": 2, "b": 3})));

        assert_eq!(
            h.next_frame().await,
            Message::ToolResult {
                id: "c1".into(),
                success: true,
                result: Some(json!(5)),
                error: None,
            }
        );
        assert!(matches!(h.events.recv().await, Some(ExecutionEvent::ToolCall { call_id, .. }) if call_id == "c1"));
        assert!(matches!(
            h.events.recv().await,
            Some(ExecutionEvent::ToolResult { call_id, result, .. }) if call_id == "c1" && result == json!(5)
        ));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_not_fatal() {
        let mut h = Harness::new();
        h.deliver(&tool_call("c2", "nope", json!({})));
        assert_eq!(
            h.next_frame().await,
            Message::ToolResult {
                id: "c2".into(),
                success: false,
                result: None,
                error: Some("Unknown tool".into()),
            }
        );
        assert!(matches!(h.events.recv().await, Some(ExecutionEvent::ToolCall { .. })));
        assert!(matches!(
            h.events.recv().await,
            Some(ExecutionEvent::ToolError { error, .. }) if error == "Unknown tool"
        ));

        // Session still usable.
        h.deliver(&Message::Ping { id: "p1".into() });
        assert_eq!(h.next_frame().await, Message::Pong { id: "p1".into() });
        assert!(h.client.connected());
    }

    #[tokio::test]
    async fn failing_tool_returns_error_result() {
        let mut h = Harness::new();
        h.deliver(&tool_call("c3", "fail", json!({})));
        assert_eq!(
            h.next_frame().await,
            Message::ToolResult {
                id: "c3".into(),
                success: false,
                result: None,
                error: Some("database offline".into()),
            }
        );
    }

    #[tokio::test]
    async fn events_keep_call_before_result_per_id() {
        let mut h = Harness::new();
        for i in 0..10 {
            h.deliver(&tool_call(&format!("c{i}"), "add", json!({"a": i, "b": 1})));
        }
        for _ in 0..10 {
            h.next_frame().await;
        }

        let mut seen_call = std::collections::HashSet::new();
        for _ in 0..20 {
            let event = h.events.recv().await.unwrap();
            let id = event.call_id().unwrap().to_string();
            match event {
                ExecutionEvent::ToolCall { .. } => assert!(seen_call.insert(id)),
                _ => assert!(seen_call.contains(&id), "result before call for {id}"),
            }
        }
    }

    #[tokio::test]
    async fn result_settles_round() {
        let mut h = Harness::new();
        h.client.execute("return 1", vec![], BTreeMap::new()).unwrap();
        assert!(matches!(h.next_frame().await, Message::Execute { .. }));

        let waiter = tokio::spawn({
            let client = h.client.clone();
            async move { client.wait_for_result(Duration::from_secs(5)).await }
        });
        tokio::task::yield_now().await;
        h.deliver(&Message::Result { data: json!(1) });

        assert_eq!(waiter.await.unwrap(), RoundOutcome::success(Some(json!(1))));
        // Already resolved: returns immediately.
        assert_eq!(
            h.client.wait_for_result(Duration::ZERO).await,
            RoundOutcome::success(Some(json!(1)))
        );
        assert!(matches!(h.events.recv().await, Some(ExecutionEvent::Result { .. })));
    }

    #[tokio::test]
    async fn stored_error_is_returned() {
        let h = Harness::new();
        h.client.execute("throw 'x'", vec![], BTreeMap::new()).unwrap();
        h.deliver(&Message::error("x", None));
        assert_eq!(
            h.client.wait_for_result(Duration::from_secs(1)).await,
            RoundOutcome::failure("x")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_no_earlier_than_deadline() {
        let h = Harness::new();
        h.client.execute("return 1", vec![], BTreeMap::new()).unwrap();

        let started = tokio::time::Instant::now();
        let outcome = h.client.wait_for_result(Duration::from_secs(10)).await;
        assert_eq!(outcome, RoundOutcome::failure(EXECUTION_TIMEOUT));
        assert!(started.elapsed() >= Duration::from_secs(10));

        // The timeout settled the round; a late result does not change it.
        h.deliver(&Message::Result { data: json!(1) });
        assert_eq!(
            h.client.wait_for_result(Duration::ZERO).await,
            RoundOutcome::failure(EXECUTION_TIMEOUT)
        );
    }

    #[tokio::test]
    async fn one_round_at_a_time() {
        let h = Harness::new();
        h.client.execute("return 1", vec![], BTreeMap::new()).unwrap();
        let err = h.client.execute("return 2", vec![], BTreeMap::new()).unwrap_err();
        assert_eq!(err.code(), "EXECUTION_ERROR");

        h.deliver(&Message::Result { data: json!(1) });
        assert!(h.client.execute("return 2", vec![], BTreeMap::new()).is_ok());
        // New round starts unresolved.
        assert!(!h.client.inner.lock().execution.is_settled());
    }

    #[tokio::test]
    async fn close_fails_in_flight_wait() {
        let h = Harness::new();
        h.client.inner.lock().closing = true;
        h.client.execute("return 1", vec![], BTreeMap::new()).unwrap();
        let waiter = tokio::spawn({
            let client = h.client.clone();
            async move { client.wait_for_result(Duration::from_secs(5)).await }
        });
        tokio::task::yield_now().await;

        on_closed(&h.client.inner, 1);
        assert_eq!(waiter.await.unwrap(), RoundOutcome::failure(CONNECTION_CLOSED));
        assert!(!h.client.connected());
    }

    #[tokio::test]
    async fn ping_resolves_on_pong() {
        let mut h = Harness::new();
        let ping = tokio::spawn({
            let client = h.client.clone();
            async move { client.ping(Duration::from_secs(5)).await }
        });
        let Message::Ping { id } = h.next_frame().await else {
            panic!("expected ping");
        };
        h.deliver(&Message::Pong { id });
        assert_ok!(ping.await.unwrap());
    }

    #[tokio::test]
    async fn execute_requires_connection() {
        let client = RelayClient::new(
            RelayClientConfig::new("ws://127.0.0.1:1/ws", "tok"),
            Arc::new(ToolRegistry::default()),
        );
        let err = client.execute("return 1", vec![], BTreeMap::new()).unwrap_err();
        assert_eq!(err.code(), "RELAY_CONNECTION_ERROR");
    }

    #[tokio::test]
    async fn connect_failure_is_a_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = RelayClientConfig::new(format!("ws://{addr}/ws"), "tok");
        config.reconnect = false;
        let client = RelayClient::new(config, Arc::new(ToolRegistry::default()));
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.code(), "RELAY_CONNECTION_ERROR");
        assert!(!client.connected());
    }

    #[tokio::test]
    async fn oversized_result_is_reported_as_error() {
        let mut h = Harness::new();
        h.deliver(&tool_call("c4", "huge", json!({})));
        assert_eq!(
            h.next_frame().await,
            Message::ToolResult {
                id: "c4".into(),
                success: false,
                result: None,
                error: Some(RESULT_TOO_LARGE.into()),
            }
        );
        assert!(matches!(h.events.recv().await, Some(ExecutionEvent::ToolCall { .. })));
        assert!(matches!(
            h.events.recv().await,
            Some(ExecutionEvent::ToolError { call_id, error, .. }) if call_id == "c4" && error == RESULT_TOO_LARGE
        ));
        assert!(h.events.try_recv().is_err(), "no success event for an undeliverable result");
    }

    /// Bare websocket listener that counts TCP accepts. The first
    /// `handshakes` connections complete the handshake and are handed to the
    /// test; later ones are dropped before the handshake.
    struct FlakyRelay {
        url: String,
        accepted: Arc<std::sync::atomic::AtomicUsize>,
        sockets: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
    }

    impl FlakyRelay {
        async fn start(handshakes: usize) -> Self {
            use std::sync::atomic::{AtomicUsize, Ordering};

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ws://{}/ws", listener.local_addr().unwrap());
            let accepted = Arc::new(AtomicUsize::new(0));
            let (tx, sockets) = mpsc::unbounded_channel();
            tokio::spawn({
                let accepted = accepted.clone();
                async move {
                    while let Ok((stream, _)) = listener.accept().await {
                        let n = accepted.fetch_add(1, Ordering::SeqCst) + 1;
                        if n > handshakes {
                            drop(stream);
                            continue;
                        }
                        if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                            let _ = tx.send(ws);
                        }
                    }
                }
            });
            Self {
                url,
                accepted,
                sockets,
            }
        }

        fn accepted(&self) -> usize {
            self.accepted.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn next_socket(&mut self) -> WebSocketStream<TcpStream> {
            tokio::time::timeout(Duration::from_secs(5), self.sockets.recv())
                .await
                .expect("client did not reconnect")
                .unwrap()
        }

        fn client(
            &self,
            max_retries: u32,
            base: Duration,
        ) -> (RelayClient, mpsc::UnboundedReceiver<ExecutionEvent>) {
            let mut config = RelayClientConfig::new(self.url.clone(), "tok");
            config.max_retries = max_retries;
            config.backoff = BackoffConfig {
                base,
                max: base * 4,
                jitter: 0.0,
            };
            let (sink, events) = EventSink::channel();
            let client = RelayClient::with_events(config, Arc::new(ToolRegistry::default()), sink);
            (client, events)
        }
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting: {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn unexpected_close_reconnects() {
        let mut relay = FlakyRelay::start(usize::MAX).await;
        let (client, _events) = relay.client(3, Duration::from_millis(10));
        client.connect().await.unwrap();

        let first = relay.next_socket().await;
        drop(first);
        let _second = relay.next_socket().await;

        eventually("reconnected", || client.connected()).await;
        assert_eq!(relay.accepted(), 2);
        assert_eq!(client.inner.lock().retry_count, 0);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn retry_budget_resets_after_a_successful_reconnect() {
        let mut relay = FlakyRelay::start(usize::MAX).await;
        // One retry per outage: a second outage only reconnects if the
        // first success reset the count.
        let (client, _events) = relay.client(1, Duration::from_millis(10));
        client.connect().await.unwrap();

        for expected in 2..=3 {
            drop(relay.next_socket().await);
            eventually("reconnected", || client.connected() && relay.accepted() == expected).await;
            assert_eq!(client.inner.lock().retry_count, 0);
        }
        client.disconnect().await;
    }

    #[tokio::test]
    async fn gives_up_silently_after_max_retries() {
        let mut relay = FlakyRelay::start(1).await;
        let (client, mut events) = relay.client(3, Duration::from_millis(10));
        client.connect().await.unwrap();

        drop(relay.next_socket().await);
        eventually("three retries", || relay.accepted() == 4).await;
        eventually("loop finished", || client.inner.lock().retry_count == 3).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(relay.accepted(), 4, "no attempts past max_retries");
        assert!(!client.connected());
        assert!(events.try_recv().is_err(), "giving up emits nothing");
    }

    #[tokio::test]
    async fn disconnect_during_backoff_stops_reconnecting() {
        let mut relay = FlakyRelay::start(usize::MAX).await;
        let (client, _events) = relay.client(5, Duration::from_millis(300));
        client.connect().await.unwrap();

        drop(relay.next_socket().await);
        eventually("close noticed", || !client.connected()).await;
        client.disconnect().await;

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(relay.accepted(), 1);
        assert!(!client.connected());
    }

    #[test]
    fn config_validation() {
        assert_ok!(RelayClientConfig::new("ws://h/ws", "t").validate());
        assert_err!(RelayClientConfig::new("http://h/ws", "t").validate());
        assert_err!(RelayClientConfig::new("wss://h/ws", "").validate());
    }
}
