//! # Per-Request Relay
//!
//! One spawned task per inbound `http_request`:
//!
//! ```text
//! Peer ──http_request──→ [Relay Task] ──HTTP──→ Internet
//! Peer ←─http_response── [Relay Task] ←────────┘
//!      ←─error──────────   (on failure)
//! ```
//!
//! The task answers on the session that delivered the request and nowhere
//! else. It sends exactly one terminal message for its request id.

use crate::executor::Executor;
use crate::session::SessionSender;
use crate::state::{AgentState, RelayCounters};
use relay_protocol::{HttpRequest, RelayMessage, RequestId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Executes `request` and reports the outcome under `request_id`.
///
/// If the session has closed by the time the call completes, the result is
/// dropped by [`SessionSender::send`].
pub async fn handle_http_relay<E: Executor>(
    executor: Arc<E>,
    state: Arc<AgentState>,
    session: SessionSender,
    request_id: RequestId,
    request: HttpRequest,
    timeout: Option<Duration>,
) {
    let method = request.method;
    let url = request.url.clone();
    info!("Request {}: {} {}", request_id, method, url);

    let reply = match executor.execute(request, timeout).await {
        Ok(response) => {
            info!(
                "Request {}: {} {} → {} ({} bytes)",
                request_id,
                method,
                url,
                response.status,
                response.body.len()
            );
            RelayMessage::HttpResponse {
                request_id,
                response,
            }
        }
        Err(e) => {
            warn!("Request {}: {} {} failed: {}", request_id, method, url, e);
            RelayMessage::Error {
                request_id: Some(request_id),
                message: e.to_string(),
            }
        }
    };

    let counter = match reply {
        RelayMessage::HttpResponse { .. } => &state.counters.responses_sent,
        _ => &state.counters.errors_sent,
    };
    if session.send(reply) {
        RelayCounters::bump(counter);
    }
}
