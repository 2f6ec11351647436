//! # Agent Configuration
//!
//! Command-line flags (each with an environment fallback) and the validated
//! configuration built from them.

use crate::error::ConfigError;
use clap::Args;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Default gateway URL. Used when neither the flag nor the env var is set.
pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:7070/ws";

/// Raw flags, as parsed by clap.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// WebSocket URL of the gateway the peer is reachable through.
    #[arg(long, env = "RELAY_GATEWAY_URL", default_value = DEFAULT_GATEWAY_URL)]
    pub gateway_url: String,

    /// Identity presented to the gateway. A random one is generated per
    /// process when omitted.
    #[arg(long, env = "RELAY_IDENTITY")]
    pub identity: Option<String>,

    /// Bearer token sent with the channel handshake.
    #[arg(long, env = "RELAY_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Per-request timeout for outbound HTTP calls. No limit when omitted.
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_MS", value_name = "MS")]
    pub request_timeout_ms: Option<u64>,

    /// Timeout for opening the channel.
    #[arg(long, env = "RELAY_CONNECT_TIMEOUT_MS", value_name = "MS", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Delay before the first reconnect attempt.
    #[arg(long, env = "RELAY_RECONNECT_INITIAL_MS", value_name = "MS", default_value_t = 1_000)]
    pub reconnect_initial_ms: u64,

    /// Upper bound for the reconnect delay.
    #[arg(long, env = "RELAY_RECONNECT_MAX_MS", value_name = "MS", default_value_t = 60_000)]
    pub reconnect_max_ms: u64,

    /// Interval between transport pings on an open channel.
    #[arg(long, env = "RELAY_HEARTBEAT_SECS", value_name = "SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Do not announce this agent with a setup message after connecting.
    #[arg(long)]
    pub no_setup: bool,
}

/// Parameters for opening the duplex channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub gateway_url: Url,
    pub identity: String,
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Reconnect delay bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Behaviour of the relay loop itself.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub request_timeout: Option<Duration>,
    pub reconnect: BackoffConfig,
    /// Send `setup_proxy_client` once per session after connecting.
    pub announce: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            reconnect: BackoffConfig::default(),
            announce: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub channel: ChannelConfig,
    pub relay: RelayConfig,
}

impl AgentConfig {
    pub fn from_args(args: ConfigArgs) -> Result<Self, ConfigError> {
        let gateway_url = parse_gateway_url(&args.gateway_url)?;

        if args.connect_timeout_ms == 0 {
            return Err(ConfigError::Zero("connect timeout"));
        }
        if args.heartbeat_secs == 0 {
            return Err(ConfigError::Zero("heartbeat interval"));
        }
        if args.request_timeout_ms == Some(0) {
            return Err(ConfigError::Zero("request timeout"));
        }

        let reconnect = BackoffConfig {
            initial: Duration::from_millis(args.reconnect_initial_ms),
            max: Duration::from_millis(args.reconnect_max_ms),
        };
        if reconnect.max < reconnect.initial {
            return Err(ConfigError::Backoff {
                initial: reconnect.initial,
                max: reconnect.max,
            });
        }

        Ok(Self {
            channel: ChannelConfig {
                gateway_url,
                identity: args
                    .identity
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                auth_token: args.auth_token,
                connect_timeout: Duration::from_millis(args.connect_timeout_ms),
                heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            },
            relay: RelayConfig {
                request_timeout: args.request_timeout_ms.map(Duration::from_millis),
                reconnect,
                announce: !args.no_setup,
            },
        })
    }
}

fn parse_gateway_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::GatewayUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::GatewayUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other:?}, expected ws or wss"),
        }),
    }
}
