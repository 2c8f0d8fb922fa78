//! Relay endpoint that runs inside the sandbox.
//!
//! `GET /ws` upgrades an authorized host connection to a websocket carrying
//! binary frames; `GET /health` reports whether a host is attached.

pub mod executor;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub use self::executor::Executor;

use crate::config::RelayConfig;
use crate::error::ProtocolErrorCode;
use crate::script::ScriptEngine;
use crate::session::Session;
use crate::transport::{codec, Message, Outbound};

/// Headroom above `max_message_size` so oversized frames reach the handler
/// and get an error reply instead of a dropped socket.
const FRAME_SLACK: usize = 64 * 1024;

/// Shared state behind the axum routes.
#[derive(Clone)]
pub struct AppState {
    session: Arc<Session>,
    executor: Executor,
    max_message_size: usize,
}

impl AppState {
    pub fn new(config: &RelayConfig) -> Self {
        let session = Arc::new(Session::new(config.call_timeout()));
        Self {
            executor: Executor::new(session.clone(), ScriptEngine::new(config.script_limits())),
            session,
            max_message_size: config.max_message_size,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

/// Routes: `/ws`, `/health`, and 404 for everything else.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
}

/// A bound relay listener, ready to serve.
pub struct RelayServer {
    listener: TcpListener,
    state: AppState,
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let addr = config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay on {addr}"))?;
        Ok(Self {
            listener,
            state: AppState::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn session(&self) -> Arc<Session> {
        self.state.session.clone()
    }

    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `shutdown` completes, then drain open connections.
    pub async fn serve_with_shutdown(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        info!(addr = %self.local_addr()?, "Relay listening");
        axum::serve(self.listener, app(self.state))
            .with_graceful_shutdown(shutdown)
            .await
            .context("Relay server failed")
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "connected": state.session.is_connected(),
        "encoding": "binary",
    }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer_token(&headers);
    if let Err(e) = state.session.authorize(token) {
        warn!(error = %e, "Unauthorized relay connection");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    let token = token.unwrap_or_default().to_string();
    let limit = state.max_message_size + FRAME_SLACK;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn handle_socket(socket: WebSocket, state: AppState, token: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound, mut outbound_rx) = Outbound::channel();
    let (conn_id, mut replaced) = state.session.attach(&token, outbound.clone());

    let (stop, mut stopped) = oneshot::channel::<()>();
    let writer = tokio::spawn(async move {
        let mut stopping = false;
        loop {
            let frame = tokio::select! {
                frame = outbound_rx.recv() => frame,
                _ = &mut stopped, if !stopping => {
                    // Refuse new frames, flush what is queued.
                    stopping = true;
                    outbound_rx.close();
                    continue;
                }
            };
            let Some(frame) = frame else { break };
            if ws_tx.send(WsMessage::Binary(frame)).await.is_err() {
                debug!(conn_id, "Websocket send failed, host disconnected");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let result = tokio::select! {
            _ = &mut replaced => {
                info!(conn_id, "Connection superseded, closing");
                break;
            }
            next = ws_rx.next() => match next {
                Some(result) => result,
                None => break,
            },
        };
        match result {
            Ok(WsMessage::Binary(data)) => handle_frame(&state, conn_id, &outbound, &data),
            Ok(WsMessage::Text(_)) => {
                warn!(conn_id, "Text frame from host");
                outbound.send(&Message::error(
                    "Binary protocol required",
                    Some(ProtocolErrorCode::InvalidFrame.as_str()),
                ));
            }
            Ok(WsMessage::Close(_)) => {
                debug!(conn_id, "Host sent close frame");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(conn_id, error = %e, "Websocket error");
                break;
            }
        }
    }

    state.session.detach(conn_id);
    // Rounds still running hold clones of `outbound`.
    let _ = stop.send(());
    drop(outbound);
    if writer.await.is_err() {
        debug!(conn_id, "Writer task ended abnormally");
    }
}

/// Handle one binary frame. Bad frames are answered individually and never
/// close the connection.
fn handle_frame(state: &AppState, conn_id: u64, outbound: &Outbound, data: &[u8]) {
    if data.len() > state.max_message_size {
        warn!(len = data.len(), "Frame exceeds size limit");
        outbound.send(&Message::error(
            "Message too large",
            Some(ProtocolErrorCode::InvalidFrame.as_str()),
        ));
        return;
    }

    let msg = match codec::decode(data) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, len = data.len(), "Failed to decode frame");
            outbound.send(&Message::error(
                e.to_string(),
                Some(ProtocolErrorCode::from(&e).as_str()),
            ));
            return;
        }
    };
    debug!(kind = %msg.kind(), "Frame received");

    match msg {
        Message::ToolResult {
            id,
            success,
            result,
            error,
        } => {
            let outcome = if success {
                Ok(result.unwrap_or(Value::Null))
            } else {
                Err(error.unwrap_or_else(|| "Tool call failed".to_string()))
            };
            state.session.resolve(&id, outcome);
        }
        Message::Error {
            id: Some(id), error, ..
        } => {
            state.session.resolve(&id, Err(error));
        }
        Message::Error { id: None, error, .. } => {
            warn!(%error, "Host reported an error");
        }
        Message::Execute {
            code,
            remote_tools,
            local_tools,
        } => {
            info!(
                conn_id,
                code_len = code.len(),
                remote = remote_tools.len(),
                local = local_tools.len(),
                "Execute received"
            );
            state
                .executor
                .spawn(conn_id, outbound.clone(), code, remote_tools, local_tools);
        }
        Message::Ping { id } => {
            outbound.send(&Message::Pong { id });
        }
        Message::Pong { id } => debug!(%id, "Pong"),
        Message::ToolCall { .. } | Message::Result { .. } => {
            let kind = msg.kind();
            warn!(%kind, "Unexpected message from host");
            outbound.send(&Message::error(
                format!("Unexpected message type: {kind}"),
                Some(ProtocolErrorCode::UnexpectedType.as_str()),
            ));
        }
    }
}
