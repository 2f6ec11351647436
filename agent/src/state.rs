//! # Agent State
//!
//! State shared between the relay loop, its per-request tasks and whoever
//! embeds the agent (the binary's shutdown path, tests):
//! - [`ChannelState`]: where the loop is in its connect cycle, published on
//!   a `watch` channel so observers can wait for transitions
//! - the handle of the current session, replaced on every reconnect
//! - relay counters, summarised by [`AgentStatus`]

use crate::session::SessionSender;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// Connection state of the relay loop. There is no terminal state: after
/// `Disconnected` the loop always goes back to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
        })
    }
}

/// Point-in-time summary of the agent, for logs and embedders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    pub state: ChannelState,
    pub session_id: Option<u64>,
    pub sessions_opened: u64,
    pub requests_received: u64,
    pub responses_sent: u64,
    pub errors_sent: u64,
}

#[derive(Debug, Default)]
pub struct RelayCounters {
    pub sessions_opened: AtomicU64,
    pub requests_received: AtomicU64,
    pub responses_sent: AtomicU64,
    pub errors_sent: AtomicU64,
}

impl RelayCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct AgentState {
    channel_state: watch::Sender<ChannelState>,

    /// Handle of the session currently owned by the relay loop.
    /// `None` while not connected.
    session: RwLock<Option<SessionSender>>,

    pub counters: RelayCounters,
}

impl AgentState {
    pub fn new() -> Self {
        let (channel_state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            channel_state,
            session: RwLock::new(None),
            counters: RelayCounters::default(),
        }
    }

    pub fn channel_state(&self) -> ChannelState {
        *self.channel_state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.channel_state.subscribe()
    }

    pub(crate) fn set_channel_state(&self, state: ChannelState) {
        let previous = self.channel_state.send_replace(state);
        if previous != state {
            debug!("Channel state: {} → {}", previous, state);
        }
    }

    /// Makes `sender` the current session handle, dropping the previous one.
    pub(crate) async fn install_session(&self, sender: SessionSender) {
        *self.session.write().await = Some(sender);
    }

    pub(crate) async fn clear_session(&self) {
        *self.session.write().await = None;
    }

    pub async fn current_session(&self) -> Option<SessionSender> {
        self.session.read().await.clone()
    }

    /// Closes the current session, if any. The relay loop sees the closure
    /// like any other and reconnects unless it is being shut down.
    pub async fn close_session(&self) {
        if let Some(session) = self.session.read().await.as_ref() {
            session.close();
        }
    }

    pub async fn status(&self) -> AgentStatus {
        let session_id = self.session.read().await.as_ref().map(|s| s.id());
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        AgentStatus {
            state: self.channel_state(),
            session_id,
            sessions_opened: load(&self.counters.sessions_opened),
            requests_received: load(&self.counters.requests_received),
            responses_sent: load(&self.counters.responses_sent),
            errors_sent: load(&self.counters.errors_sent),
        }
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}
