//! # REST API Endpoints
//!
//! Lets tests and humans drive the simulated peer: list proxies, submit a
//! request for relaying, read its outcome.

use crate::state::{RequestState, SubmitError};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use relay_protocol::{HttpRequest, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Response item representing a single registered proxy.
#[derive(Serialize)]
pub struct ProxyListItem {
    pub conn_id: String,
    pub identity: Option<String>,
    pub in_flight: usize,
}

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub request: HttpRequest,
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitResponse {
    pub request_id: RequestId,
}

/// `GET /api/proxies`: Returns all proxies currently registered.
pub async fn list_proxies(State(app): State<AppState>) -> Json<Vec<ProxyListItem>> {
    let proxies = app
        .peer
        .proxies()
        .into_iter()
        .map(|(conn_id, proxy)| ProxyListItem {
            conn_id,
            identity: proxy.identity,
            in_flight: proxy.assigned.len(),
        })
        .collect();
    Json(proxies)
}

/// `POST /api/requests`: Hands a request to one of the proxies.
///
/// `201` with the assigned ID, or `503` when no proxy is registered.
pub async fn submit_request(
    State(app): State<AppState>,
    Json(input): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, Json<serde_json::Value>)> {
    let timeout = input.timeout_ms.map(Duration::from_millis);
    match app.peer.submit(input.request, timeout) {
        Ok(request_id) => Ok((StatusCode::CREATED, Json(SubmitResponse { request_id }))),
        Err(e @ SubmitError::NoProxiesConnected) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// `GET /api/requests/{id}`: Returns the state of a submitted request.
pub async fn get_request(
    State(app): State<AppState>,
    Path(id): Path<RequestId>,
) -> Result<Json<RequestState>, StatusCode> {
    app.peer
        .request_state(id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
