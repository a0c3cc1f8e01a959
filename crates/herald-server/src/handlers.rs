//! Connection handlers for the Herald server.
//!
//! This module handles the WebSocket handshake, the per-connection event
//! loop, and the health endpoint.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use herald_core::{ClientInfo, Gateway, GatewayError, SessionHandle, SessionId};
use herald_protocol::{
    ClientEvent, Encoding, ErrorCode, FrameCodec, Version, WireFrame, PROTOCOL_VERSION,
};
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Server configuration.
    pub config: Config,
    /// Cancelled when the server shuts down; closes every connection.
    pub shutdown: CancellationToken,
}

impl AppState {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, config: Config, shutdown: CancellationToken) -> Self {
        Self {
            gateway,
            config,
            shutdown,
        }
    }
}

/// Handshake query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Bearer credential, when not sent in the `Authorization` header.
    pub token: Option<String>,
    /// Protocol version spoken by the client.
    pub v: Option<String>,
    /// Wire encoding, `json` (default) or `msgpack`.
    pub encoding: Option<String>,
    /// Device class, for presence and logs.
    pub device: Option<String>,
}

/// Reasons a connection is refused before upgrade.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(String),

    #[error("Unknown encoding {0}")]
    UnknownEncoding(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl HandshakeError {
    fn status(&self) -> StatusCode {
        match self {
            HandshakeError::UnsupportedVersion(_) | HandshakeError::UnknownEncoding(_) => {
                StatusCode::BAD_REQUEST
            }
            HandshakeError::Gateway(e) => match e.code() {
                ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
                ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                ErrorCode::Forbidden => StatusCode::FORBIDDEN,
                ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::Malformed => StatusCode::BAD_REQUEST,
                ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            HandshakeError::UnsupportedVersion(_) => "unsupported_version",
            HandshakeError::UnknownEncoding(_) => "unknown_encoding",
            HandshakeError::Gateway(e) => error_label(e.code()),
        }
    }
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        metrics::record_rejection(self.reason());
        let body = Json(serde_json::json!({
            "error": self.reason(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

fn error_label(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::Unauthenticated => "unauthenticated",
        ErrorCode::Forbidden => "forbidden",
        ErrorCode::RateLimited => "rate_limited",
        ErrorCode::Malformed => "malformed",
        ErrorCode::Unavailable => "unavailable",
        ErrorCode::Internal => "internal",
    }
}

/// Bind a TCP listener, optionally with `SO_REUSEPORT` so several worker
/// processes can share the port.
///
/// # Errors
///
/// Returns an error if the socket cannot be created or bound.
pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create socket")?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true).context("Failed to set SO_REUSEPORT")?;
    }
    #[cfg(not(unix))]
    if reuse_port {
        warn!("SO_REUSEPORT is not supported on this platform");
    }
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into()).context("Failed to register listener")
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve connections on `listener` until the state's shutdown token fires.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(
    config: Config,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
    reuse_port: bool,
) -> Result<()> {
    let addr = config.bind_addr()?;
    let listener = bind_listener(addr, reuse_port)?;

    info!("Herald server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    serve(listener, Arc::new(AppState::new(gateway, config, shutdown))).await
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let gateway = &state.gateway;
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "process": gateway.process().to_string(),
        "connections": gateway.registry().session_count(),
        "users": gateway.connected_users_count(),
    }))
}

/// Extract a bearer credential from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, HandshakeError> {
    if let Some(v) = &params.v {
        match v.parse::<Version>() {
            Ok(version) if version.is_compatible_with(&PROTOCOL_VERSION) => {}
            _ => return Err(HandshakeError::UnsupportedVersion(v.clone())),
        }
    }

    let encoding = match params.encoding.as_deref() {
        None => Encoding::Json,
        Some(name) => name
            .parse()
            .map_err(|_| HandshakeError::UnknownEncoding(name.to_string()))?,
    };

    let token = bearer_token(&headers).or(params.token.as_deref());
    let user = state.gateway.authenticate(token).await.map_err(|e| {
        debug!(error = %e, "Handshake rejected");
        e
    })?;
    state.gateway.admit(&user).await?;

    let client = ClientInfo {
        device: params.device.unwrap_or_else(|| "unknown".to_string()),
        transport: "websocket".to_string(),
        encoding,
    };
    let max_frame_size = state.config.limits.max_frame_size;

    Ok(ws
        .max_message_size(max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, user, client)))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    user: String,
    client: ClientInfo,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let gateway = state.gateway.clone();
    let mut codec = FrameCodec::new(client.encoding);
    let SessionHandle {
        id,
        mut outbound,
        cancel,
        ..
    } = gateway.connect(&user, client).await;

    debug!(
        connection = %id,
        user = %user,
        encoding = codec.encoding().as_str(),
        "WebSocket connected"
    );

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = tokio::time::interval(gateway.settings().heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    // Event processing loop
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(connection = %id, "Session evicted");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            // Events queued for this session
            Some(event) = outbound.recv() => {
                match codec.encode(&*event) {
                    Ok(frame) => {
                        if send_frame(&mut sender, frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(
                            connection = %id,
                            event = %event.event,
                            error = %e,
                            "Failed to encode event"
                        );
                        metrics::record_error("encode");
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_event(text.len(), "inbound");
                        match codec.decode_text::<ClientEvent>(&text) {
                            Ok(event) => handle_event(&gateway, &id, event).await,
                            Err(e) => gateway.reject_malformed(&id, &e),
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_event(data.len(), "inbound");
                        match codec.decode_binary::<ClientEvent>(&data) {
                            Ok(events) => {
                                for event in events {
                                    handle_event(&gateway, &id, event).await;
                                }
                            }
                            Err(e) => gateway.reject_malformed(&id, &e),
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        gateway.touch(&id);
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        gateway.touch(&id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    gateway.disconnect(&id).await;
    debug!(connection = %id, "WebSocket disconnected");
}

async fn handle_event(gateway: &Gateway, session: &SessionId, event: ClientEvent) {
    if let Err(e) = gateway.handle(session, event).await {
        metrics::record_error(error_label(e.code()));
    }
}

/// Write an encoded frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: WireFrame) -> Result<()> {
    metrics::record_event(frame.len(), "outbound");
    let message = match frame {
        WireFrame::Text(text) => Message::Text(text),
        WireFrame::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_handshake_status() {
        let unauthenticated: HandshakeError =
            GatewayError::Authentication(herald_core::AuthError::Missing).into();
        assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(unauthenticated.reason(), "unauthenticated");

        let limited: HandshakeError = GatewayError::RateLimited.into();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

        let version = HandshakeError::UnsupportedVersion("2.0".into());
        assert_eq!(version.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bind_listener_ephemeral() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), true).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
