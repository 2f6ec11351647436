//! # Relay Agent
//!
//! Performs HTTP requests on behalf of a sandboxed peer that has no network
//! access of its own. The peer sends request descriptors over a persistent
//! duplex channel; the agent executes each one concurrently and answers with
//! a response or an error under the peer's request id.
//!
//! ## Modules
//! - [`agent`]: the relay loop (connect, dispatch, reconnect)
//! - [`relay`]: the per-request task
//! - [`executor`]: outbound HTTP execution
//! - [`session`] / [`channel`]: one open channel instance and how to open it
//! - [`state`]: connection state and counters shared with observers

pub mod agent;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod relay;
pub mod session;
pub mod state;

pub use agent::RelayAgent;
pub use channel::{Connector, WsConnector};
pub use config::{AgentConfig, ChannelConfig, RelayConfig};
pub use error::{AgentError, ConnectError, ExecutionError};
pub use executor::{Executor, HttpExecutor};
pub use session::{Frame, Session, SessionEvent, SessionSender};
pub use state::{AgentState, AgentStatus, ChannelState};
