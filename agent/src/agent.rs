//! # Relay Loop
//!
//! Owns the channel session and dispatches work. Handles:
//! - Connection establishment and reconnect (capped exponential backoff)
//! - Proxy announcement (`setup_proxy_client`) on connect
//! - Fan-out of every inbound `http_request` into its own task
//! - Clean teardown of in-flight work on disconnect
//!
//! ## Lifecycle
//! 1. `Connecting`: open a session through the [`Connector`]
//! 2. `Connected`: announce the agent, dispatch inbound messages until the
//!    session reports `Closed`
//! 3. `Disconnected`: abort the session's in-flight requests, drop the session
//! 4. Wait for the backoff delay and go to step 1
//!
//! In-flight requests belong to the session that delivered them. They are
//! aborted when that session closes, so a result is never delivered on a
//! later session where the peer may already have reused the request id.

use crate::backoff::Backoff;
use crate::channel::Connector;
use crate::config::RelayConfig;
use crate::executor::Executor;
use crate::relay::handle_http_relay;
use crate::session::{Session, SessionEvent, SessionSender};
use crate::state::{AgentState, ChannelState, RelayCounters};
use relay_protocol::RelayMessage;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct RelayAgent<C, E> {
    connector: C,
    executor: Arc<E>,
    config: RelayConfig,
    state: Arc<AgentState>,
}

impl<C: Connector, E: Executor> RelayAgent<C, E> {
    pub fn new(connector: C, executor: E, config: RelayConfig) -> Self {
        Self {
            connector,
            executor: Arc::new(executor),
            config,
            state: Arc::new(AgentState::new()),
        }
    }

    pub fn state(&self) -> Arc<AgentState> {
        self.state.clone()
    }

    // ─── Main Connection Loop ───────────────────────────────────

    /// Runs the relay loop forever. Never returns; stop it by dropping or
    /// aborting the future.
    pub async fn run(&self) {
        let mut backoff = Backoff::new(self.config.reconnect);

        loop {
            self.state.set_channel_state(ChannelState::Connecting);
            info!("Connecting to peer channel");

            match self.connector.open().await {
                Ok(session) => {
                    backoff.reset();
                    let reason = self.serve(session).await;
                    warn!("Disconnected from peer: {}", reason);
                }
                Err(e) => {
                    self.state.set_channel_state(ChannelState::Disconnected);
                    error!("Connection failed: {}", e);
                }
            }

            let delay = backoff.next_delay();
            info!("Reconnecting in {:?}...", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Drives one connected session until it closes. Returns the close reason.
    async fn serve(&self, mut session: Session) -> String {
        let sender = session.sender();
        self.state.install_session(sender.clone()).await;
        self.state.set_channel_state(ChannelState::Connected);
        RelayCounters::bump(&self.state.counters.sessions_opened);
        info!("Connected (session {})", session.id());

        if self.config.announce {
            sender.send(RelayMessage::SetupProxyClient);
        }

        let mut in_flight = JoinSet::new();
        let reason = loop {
            tokio::select! {
                event = session.next_event() => match event {
                    SessionEvent::Message(msg) => self.dispatch(msg, &sender, &mut in_flight),
                    SessionEvent::Closed(reason) => break reason,
                },
                Some(joined) = in_flight.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Relay task panicked: {}", e);
                        }
                    }
                }
            }
        };

        // ── Disconnect Cleanup ──
        if !in_flight.is_empty() {
            info!(
                "Aborting {} in-flight request(s) of session {}",
                in_flight.len(),
                session.id()
            );
        }
        in_flight.shutdown().await;
        self.state.clear_session().await;
        self.state.set_channel_state(ChannelState::Disconnected);
        reason
    }

    // ─── Inbound Message Dispatch ───────────────────────────────

    fn dispatch(&self, msg: RelayMessage, session: &SessionSender, in_flight: &mut JoinSet<()>) {
        match msg {
            RelayMessage::HttpRequest {
                request_id,
                request,
            } => {
                RelayCounters::bump(&self.state.counters.requests_received);
                in_flight.spawn(handle_http_relay(
                    self.executor.clone(),
                    self.state.clone(),
                    session.clone(),
                    request_id,
                    request,
                    self.config.request_timeout,
                ));
            }

            // The agent only answers requests. Responses and setup messages
            // coming the other way point at a peer/protocol mismatch.
            RelayMessage::HttpResponse { request_id, .. } => {
                warn!("Ignoring unexpected http_response for request {}", request_id);
            }
            RelayMessage::SetupProxyClient => {
                warn!("Ignoring unexpected setup_proxy_client from peer");
            }

            RelayMessage::Error {
                request_id,
                message,
            } => match request_id {
                Some(id) => warn!("Peer reported error for request {}: {}", id, message),
                None => warn!("Peer reported error: {}", message),
            },
        }
        debug!("{} task(s) in flight", in_flight.len());
    }
}
