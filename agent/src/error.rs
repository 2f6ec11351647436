//! # Agent Errors
//!
//! Typed failures of the relay agent. None of these terminate the relay
//! loop: connect errors trigger a reconnect, execution errors are reported
//! to the peer as `error` envelopes. Only [`AgentError`] (startup problems)
//! reaches `main`.

use std::error::Error as StdError;
use std::time::Duration;

/// Opening or authenticating the channel failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid channel request: {0}")]
    InvalidRequest(String),

    #[error("handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("handshake with {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    /// For [`Connector`](crate::channel::Connector) implementations whose
    /// channel cannot be opened for reasons other than a failed handshake.
    #[error("channel unavailable: {0}")]
    Unavailable(String),
}

/// An outbound HTTP call did not produce a response.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    #[error("reading response body from {url} failed: {reason}")]
    Body { url: String, reason: String },

    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
}

/// Configuration rejected at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid gateway url {url:?}: {reason}")]
    GatewayUrl { url: String, reason: String },

    #[error("reconnect max delay ({max:?}) is shorter than the initial delay ({initial:?})")]
    Backoff { initial: Duration, max: Duration },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Errors that stop the agent before the relay loop starts.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),
}

/// Renders an error and its whole source chain on one line
/// (`outer: cause: root cause`), since the outermost message of most
/// client errors alone says little.
pub fn error_chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}
