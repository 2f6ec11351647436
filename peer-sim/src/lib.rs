//! # Peer Simulator
//!
//! A stand-in for the sandboxed peer, for development and end-to-end tests
//! of the relay agent. Agents connect to `/ws`, announce themselves with
//! `setup_proxy_client`, and receive the requests submitted through the REST
//! API; their answers are stored until read back.

pub mod api;
pub mod handlers;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

pub use state::{FailureReason, PeerState, RequestState};

/// Shared application state, cloned and passed to each request handler.
#[derive(Clone)]
pub struct AppState {
    pub peer: PeerState,
    /// Bearer token proxies must present on `/ws`. Open when `None`.
    pub auth_token: Option<String>,
}

pub fn app(peer: PeerState, auth_token: Option<String>) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/api/proxies", get(api::list_proxies))
        .route("/api/requests", post(api::submit_request))
        .route("/api/requests/{id}", get(api::get_request))
        .layer(CorsLayer::permissive())
        .with_state(AppState { peer, auth_token })
}

pub async fn run(
    listener: TcpListener,
    peer: PeerState,
    auth_token: Option<String>,
) -> Result<(), std::io::Error> {
    axum::serve(listener, app(peer, auth_token)).await
}
