//! # Channel Connector
//!
//! Opens the duplex channel to the peer. The relay loop only sees the
//! [`Connector`] trait; [`WsConnector`] is the production implementation,
//! a WebSocket to the gateway (rustls for `wss://`).
//!
//! The gateway authenticates the agent from the handshake headers:
//! - `x-relay-identity`: the agent identity
//! - `Authorization: Bearer <token>`: only when a token is configured

use crate::config::ChannelConfig;
use crate::error::ConnectError;
use crate::session::{Frame, Session};
use futures::{future, SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::info;

pub const IDENTITY_HEADER: &str = "x-relay-identity";

/// Opens new channel sessions.
pub trait Connector: Send + Sync + 'static {
    fn open(&self) -> impl Future<Output = Result<Session, ConnectError>> + Send;
}

pub struct WsConnector {
    config: ChannelConfig,
    next_session: AtomicU64,
}

impl WsConnector {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            next_session: AtomicU64::new(1),
        }
    }

    fn client_request(&self) -> Result<Request, ConnectError> {
        let mut request = self
            .config
            .gateway_url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::InvalidRequest(e.to_string()))?;

        let identity = HeaderValue::from_str(&self.config.identity)
            .map_err(|e| ConnectError::InvalidRequest(format!("identity: {e}")))?;
        request
            .headers_mut()
            .insert(HeaderName::from_static(IDENTITY_HEADER), identity);

        if let Some(token) = &self.config.auth_token {
            let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ConnectError::InvalidRequest(format!("auth token: {e}")))?;
            bearer.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, bearer);
        }
        Ok(request)
    }
}

impl Connector for WsConnector {
    async fn open(&self) -> Result<Session, ConnectError> {
        let request = self.client_request()?;
        let url = self.config.gateway_url.to_string();
        let timeout = self.config.connect_timeout;

        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| ConnectError::Timeout {
                url: url.clone(),
                timeout,
            })?
            .map_err(|source| ConnectError::Handshake {
                url: url.clone(),
                source,
            })?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        info!("Channel to {} open (session {})", url, id);

        let (sink, stream) = ws_stream.split();
        let sink = sink.with(|frame: Frame| future::ready(Ok::<_, WsError>(to_ws_message(frame))));
        let stream = stream.filter_map(|item| future::ready(from_ws_message(item)));

        Ok(Session::start(
            id,
            sink,
            stream,
            self.config.heartbeat_interval,
        ))
    }
}

fn to_ws_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Ping(payload) => Message::Ping(payload.into()),
        Frame::Pong(payload) => Message::Pong(payload.into()),
        Frame::Close(reason) => Message::Close(reason.map(|reason| CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        })),
    }
}

/// Pings are answered by tungstenite itself; they and pongs still reach the
/// session as proof that the peer is alive.
fn from_ws_message(item: Result<Message, WsError>) -> Option<Result<Frame, WsError>> {
    match item {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.to_string()))),
        Ok(Message::Binary(bytes)) => Some(Ok(Frame::Binary(bytes.to_vec()))),
        Ok(Message::Close(frame)) => Some(Ok(Frame::Close(
            frame.map(|frame| frame.reason.to_string()),
        ))),
        Ok(Message::Ping(payload)) => Some(Ok(Frame::Ping(payload.to_vec()))),
        Ok(Message::Pong(payload)) => Some(Ok(Frame::Pong(payload.to_vec()))),
        Ok(Message::Frame(_)) => None,
        Err(e) => Some(Err(e)),
    }
}
