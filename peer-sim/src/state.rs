//! # Peer State
//!
//! Holds the shared state of the simulated peer:
//! - **Connection registry**: every open WebSocket, keyed by connection ID
//! - **Proxy registry**: connections that announced themselves with
//!   `setup_proxy_client`, with the request IDs assigned to each
//! - **Request registry**: every submitted request and its outcome
//!
//! Request IDs come from a counter. A request goes to the proxy at index
//! `request_id % proxy_count`, with proxies ordered by connection ID, so
//! consecutive requests are spread over all registered proxies.
//!
//! All registries use [`DashMap`]; no guard is ever held across an `.await`
//! or while touching another entry of the same map.

use dashmap::DashMap;
use relay_protocol::{HttpRequest, HttpResponse, RelayMessage, RequestId};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

/// Sender feeding one connection's outbound WebSocket queue.
pub type ClientTx = mpsc::UnboundedSender<RelayMessage>;

/// Why a request ended without a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("request timed out")]
    RequestTimeout,

    #[error("proxy error: {0}")]
    ProxyError(String),

    #[error("proxy disconnected")]
    ProxyDisconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("no proxies connected")]
    NoProxiesConnected,
}

/// A proxy answered something it cannot answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("connection {0} is not a registered proxy")]
    UnknownProxy(String),

    #[error("request {0} is not assigned to this proxy")]
    NotAssigned(RequestId),
}

/// Lifecycle of one submitted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Completed { response: HttpResponse },
    Failed { reason: FailureReason },
}

impl RequestState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, RequestState::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct RelayedRequest {
    pub request: HttpRequest,
    /// Connection ID of the proxy the request was handed to.
    pub proxy: String,
    pub state: RequestState,
}

#[derive(Debug, Clone)]
pub struct ProxyInfo {
    pub tx: ClientTx,
    pub identity: Option<String>,
    pub assigned: HashSet<RequestId>,
}

#[derive(Debug, Clone)]
struct ConnectionInfo {
    tx: ClientTx,
    identity: Option<String>,
}

/// Shared peer state, cloned into every handler.
#[derive(Clone, Default)]
pub struct PeerState {
    connections: Arc<DashMap<String, ConnectionInfo>>,
    proxies: Arc<DashMap<String, ProxyInfo>>,
    requests: Arc<DashMap<RequestId, RelayedRequest>>,
    next_id: Arc<AtomicU64>,
    settled: Arc<Notify>,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Connections & Proxies ──────────────────────────────────

    pub fn add_connection(&self, conn_id: &str, tx: ClientTx, identity: Option<String>) {
        self.connections
            .insert(conn_id.to_string(), ConnectionInfo { tx, identity });
    }

    /// Promotes an open connection to a proxy that receives requests.
    pub fn register_proxy(&self, conn_id: &str) -> bool {
        let Some(conn) = self.connections.get(conn_id).map(|c| c.clone()) else {
            return false;
        };
        self.proxies.insert(
            conn_id.to_string(),
            ProxyInfo {
                tx: conn.tx,
                identity: conn.identity,
                assigned: HashSet::new(),
            },
        );
        info!("Proxy registered: {}", conn_id);
        true
    }

    /// Forgets a connection. Requests still pending on it fail with
    /// [`FailureReason::ProxyDisconnected`].
    pub fn remove_connection(&self, conn_id: &str) {
        self.connections.remove(conn_id);
        let Some((_, proxy)) = self.proxies.remove(conn_id) else {
            return;
        };
        info!(
            "Proxy {} disconnected with {} request(s) in flight",
            conn_id,
            proxy.assigned.len()
        );
        for request_id in proxy.assigned {
            self.settle(request_id, RequestState::Failed {
                reason: FailureReason::ProxyDisconnected,
            });
        }
    }

    pub fn proxies(&self) -> Vec<(String, ProxyInfo)> {
        let mut proxies: Vec<_> = self
            .proxies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        proxies.sort_by(|a, b| a.0.cmp(&b.0));
        proxies
    }

    // ─── Requests ───────────────────────────────────────────────

    /// Assigns an ID to `request`, hands it to a proxy and returns the ID.
    ///
    /// With a `timeout`, the request fails with
    /// [`FailureReason::RequestTimeout`] if it is still pending when the
    /// timeout elapses. Must be called from within a tokio runtime.
    pub fn submit(
        &self,
        request: HttpRequest,
        timeout: Option<Duration>,
    ) -> Result<RequestId, SubmitError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let proxy_ids: Vec<String> = self.proxies().into_iter().map(|(id, _)| id).collect();
        if proxy_ids.is_empty() {
            return Err(SubmitError::NoProxiesConnected);
        }
        let proxy_id = proxy_ids[(request_id % proxy_ids.len() as u64) as usize].clone();

        let tx = match self.proxies.get_mut(&proxy_id) {
            Some(mut proxy) => {
                proxy.assigned.insert(request_id);
                proxy.tx.clone()
            }
            // Disconnected between listing and assignment.
            None => return Err(SubmitError::NoProxiesConnected),
        };

        self.requests.insert(
            request_id,
            RelayedRequest {
                request: request.clone(),
                proxy: proxy_id.clone(),
                state: RequestState::Pending,
            },
        );
        info!(
            "Request {} ({} {}) → proxy {}",
            request_id, request.method, request.url, proxy_id
        );

        if tx
            .send(RelayMessage::HttpRequest {
                request_id,
                request,
            })
            .is_err()
        {
            self.release(&proxy_id, request_id);
            self.settle(request_id, RequestState::Failed {
                reason: FailureReason::ProxyDisconnected,
            });
            return Ok(request_id);
        }

        if let Some(timeout) = timeout {
            let state = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if state.is_pending(request_id) {
                    warn!("Request {} timed out after {:?}", request_id, timeout);
                    state.release(&proxy_id, request_id);
                    state.settle(request_id, RequestState::Failed {
                        reason: FailureReason::RequestTimeout,
                    });
                }
            });
        }
        Ok(request_id)
    }

    /// Records a proxy's response.
    pub fn complete(
        &self,
        conn_id: &str,
        request_id: RequestId,
        response: HttpResponse,
    ) -> Result<(), CompletionError> {
        self.take_assignment(conn_id, request_id)?;
        self.settle(request_id, RequestState::Completed { response });
        Ok(())
    }

    /// Records a proxy's failure report.
    pub fn fail(
        &self,
        conn_id: &str,
        request_id: RequestId,
        reason: FailureReason,
    ) -> Result<(), CompletionError> {
        self.take_assignment(conn_id, request_id)?;
        self.settle(request_id, RequestState::Failed { reason });
        Ok(())
    }

    pub fn request_state(&self, request_id: RequestId) -> Option<RequestState> {
        self.requests.get(&request_id).map(|r| r.state.clone())
    }

    pub fn request(&self, request_id: RequestId) -> Option<RelayedRequest> {
        self.requests.get(&request_id).map(|r| r.clone())
    }

    /// Waits until the request is settled or `timeout` elapses, and returns
    /// its state at that point. `None` for unknown IDs.
    pub async fn wait_settled(
        &self,
        request_id: RequestId,
        timeout: Duration,
    ) -> Option<RequestState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.request_state(request_id)?;
            if state.is_settled() {
                return Some(state);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Some(state);
            }
        }
    }

    fn is_pending(&self, request_id: RequestId) -> bool {
        matches!(self.request_state(request_id), Some(RequestState::Pending))
    }

    fn take_assignment(&self, conn_id: &str, request_id: RequestId) -> Result<(), CompletionError> {
        let mut proxy = self
            .proxies
            .get_mut(conn_id)
            .ok_or_else(|| CompletionError::UnknownProxy(conn_id.to_string()))?;
        if proxy.assigned.remove(&request_id) {
            Ok(())
        } else {
            Err(CompletionError::NotAssigned(request_id))
        }
    }

    fn release(&self, conn_id: &str, request_id: RequestId) {
        if let Some(mut proxy) = self.proxies.get_mut(conn_id) {
            proxy.assigned.remove(&request_id);
        }
    }

    /// Moves a pending request to its final state. Settled requests keep
    /// their first outcome.
    fn settle(&self, request_id: RequestId, outcome: RequestState) {
        if let Some(mut entry) = self.requests.get_mut(&request_id) {
            if entry.state.is_settled() {
                warn!("Request {} already settled, ignoring new outcome", request_id);
                return;
            }
            entry.state = outcome;
        }
        self.settled.notify_waiters();
    }
}
