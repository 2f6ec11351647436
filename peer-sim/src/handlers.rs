//! # WebSocket Handlers
//!
//! The proxy-facing side of the simulated peer:
//! - Upgrading HTTP connections to WebSocket (with optional bearer check)
//! - Managing the lifecycle of each connection (outbound task, cleanup)
//! - Dispatching incoming relay messages to the peer state

use crate::state::{FailureReason, PeerState};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use relay_protocol::{decode, decode_slice, encode, RelayMessage};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Header carrying the identity a proxy presents on connect.
pub const IDENTITY_HEADER: &str = "x-relay-identity";

// ─── WebSocket Upgrade Endpoint ─────────────────────────────────

/// `GET /ws`: Upgrades the HTTP connection to a WebSocket connection.
///
/// When the peer is configured with an auth token, the upgrade is refused
/// with `401` unless the request carries `Authorization: Bearer <token>`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(app): State<AppState>,
) -> Response {
    if let Some(expected) = &app.auth_token {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            warn!("Rejecting proxy connection with missing or bad token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let identity = headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let state = app.peer.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, state, identity))
}

// ─── Connection Lifecycle ───────────────────────────────────────

/// Manages the full lifecycle of a single proxy connection.
///
/// ## Flow:
/// 1. Assign a unique connection ID and register the connection
/// 2. Spawn an outbound task that encodes and sends queued messages
/// 3. Process incoming frames on the current task
/// 4. On disconnect: drop the connection and fail its pending requests
async fn handle_connection(socket: WebSocket, state: PeerState, identity: Option<String>) {
    let conn_id = Uuid::new_v4().to_string();
    info!(
        "New connection: {} (identity {})",
        conn_id,
        identity.as_deref().unwrap_or("-")
    );

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayMessage>();
    state.add_connection(&conn_id, tx.clone(), identity);

    // ── Outbound Task ──
    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sink.send(Message::Text(encode(&msg).into())).await.is_err() {
                break; // WebSocket closed; stop sending
            }
        }
    });

    // ── Inbound Loop ──
    while let Some(frame) = ws_stream.next().await {
        let decoded = match frame {
            Ok(Message::Text(text)) => decode(text.as_str()),
            Ok(Message::Binary(bytes)) => decode_slice(&bytes),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                error!("Connection {} read error: {}", conn_id, e);
                break;
            }
        };
        match decoded {
            Ok(msg) => handle_message(&state, &conn_id, &tx, msg),
            Err(e) => warn!("Connection {}: dropping frame: {}", conn_id, e),
        }
    }

    // ── Cleanup on Disconnect ──
    info!("Disconnecting: {}", conn_id);
    outbound_task.abort();
    state.remove_connection(&conn_id);
}

/// Applies one message received from a proxy connection.
pub fn handle_message(
    state: &PeerState,
    conn_id: &str,
    tx: &mpsc::UnboundedSender<RelayMessage>,
    msg: RelayMessage,
) {
    match msg {
        RelayMessage::SetupProxyClient => {
            state.register_proxy(conn_id);
        }

        RelayMessage::HttpResponse {
            request_id,
            response,
        } => {
            let status = response.status;
            match state.complete(conn_id, request_id, response) {
                Ok(()) => info!("Request {} completed with status {}", request_id, status),
                Err(e) => warn!("Response from {} rejected: {}", conn_id, e),
            }
        }

        RelayMessage::Error {
            request_id: Some(request_id),
            message,
        } => {
            warn!("Proxy {} failed request {}: {}", conn_id, request_id, message);
            if let Err(e) = state.fail(conn_id, request_id, FailureReason::ProxyError(message)) {
                warn!("Error report from {} rejected: {}", conn_id, e);
            }
        }
        RelayMessage::Error {
            request_id: None,
            message,
        } => {
            warn!("Proxy {} reported: {}", conn_id, message);
        }

        RelayMessage::HttpRequest { request_id, .. } => {
            let _ = tx.send(RelayMessage::Error {
                request_id: Some(request_id),
                message: "proxy clients are not allowed to send http requests".to_string(),
            });
        }
    }
}
