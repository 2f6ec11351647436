//! # Channel Session
//!
//! One open instance of the duplex channel. A session owns two background
//! tasks:
//! - **Reader**: pulls raw frames off the transport, decodes them with the
//!   relay codec and queues them as [`SessionEvent::Message`]. Frames that
//!   fail to decode are logged and dropped; they never end the session.
//! - **Writer**: drains the outbound queue fed by [`SessionSender`], encodes
//!   each message into a text frame, and sends a transport ping every
//!   heartbeat interval. The session closes when a ping cannot be written
//!   or when nothing at all has arrived from the peer for two intervals.
//!
//! Peer-initiated, transport-initiated and agent-initiated closure all end
//! up as a single [`SessionEvent::Closed`] carrying a reason. Once a session
//! is closed every [`SessionSender`] pointing at it turns into a no-op.

use futures::{Sink, SinkExt, Stream, StreamExt};
use relay_protocol::{decode, decode_slice, encode, DecodeError, RelayMessage};
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub type SessionId = u64;

/// A raw transport frame, before decoding / after encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<String>),
}

/// What the relay loop receives from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Message(RelayMessage),
    Closed(String),
}

#[derive(Debug)]
enum Outbound {
    Message(RelayMessage),
    Close,
}

// ─── Outbound Handle ────────────────────────────────────────────

/// Cloneable handle for sending messages on one session.
#[derive(Debug, Clone)]
pub struct SessionSender {
    id: SessionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SessionSender {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queues a message for the writer task.
    ///
    /// Returns `false` (and logs) when the session has already closed; the
    /// message is discarded.
    pub fn send(&self, msg: RelayMessage) -> bool {
        let kind = msg.kind();
        if self.tx.send(Outbound::Message(msg)).is_err() {
            debug!("Session {} closed, dropping outbound {}", self.id, kind);
            return false;
        }
        true
    }

    /// Asks the writer to close the transport. Surfaces as
    /// `SessionEvent::Closed("closed by agent")`.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ─── Session ────────────────────────────────────────────────────

pub struct Session {
    id: SessionId,
    sender: SessionSender,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    closed: Option<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    /// Starts a session over an already-opened transport.
    ///
    /// `sink` and `stream` are the two halves of the transport; whatever
    /// handshake the channel needs must have completed before this call.
    pub fn start<S, R, SE, RE>(id: SessionId, sink: S, stream: R, heartbeat: Duration) -> Self
    where
        S: Sink<Frame, Error = SE> + Send + 'static,
        SE: Display + Send + 'static,
        R: Stream<Item = Result<Frame, RE>> + Send + 'static,
        RE: Display + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (seen_tx, seen_rx) = watch::channel(Instant::now());

        let writer = tokio::spawn(write_frames(
            id,
            Box::pin(sink),
            out_rx,
            event_tx.clone(),
            Heartbeat {
                interval: heartbeat,
                last_seen: seen_rx,
            },
        ));
        let reader = tokio::spawn(read_frames(id, Box::pin(stream), event_tx, seen_tx));

        info!("Session {} started", id);
        Self {
            id,
            sender: SessionSender { id, tx: out_tx },
            events,
            closed: None,
            reader,
            writer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    /// Waits for the next decoded message or for closure.
    ///
    /// After the first `Closed` the transport tasks are stopped and every
    /// further call returns the same `Closed` immediately.
    pub async fn next_event(&mut self) -> SessionEvent {
        if let Some(reason) = &self.closed {
            return SessionEvent::Closed(reason.clone());
        }

        let event = self
            .events
            .recv()
            .await
            .unwrap_or_else(|| SessionEvent::Closed("session tasks ended".to_string()));

        if let SessionEvent::Closed(reason) = &event {
            info!("Session {} closed: {}", self.id, reason);
            self.closed = Some(reason.clone());
            self.stop_tasks();
        }
        event
    }

    fn stop_tasks(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

// ─── Transport Tasks ────────────────────────────────────────────

/// Heartbeats without any inbound frame before the channel counts as dead.
const MISSED_HEARTBEATS: u32 = 2;

struct Heartbeat {
    interval: Duration,
    /// When the reader last saw any frame from the peer.
    last_seen: watch::Receiver<Instant>,
}

async fn write_frames<S, E>(
    id: SessionId,
    mut sink: Pin<Box<S>>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
    heartbeat: Heartbeat,
) where
    S: Sink<Frame, Error = E> + Send,
    E: Display + Send,
{
    let interval = heartbeat.interval;
    let silence_limit = interval.saturating_mul(MISSED_HEARTBEATS);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(Outbound::Message(msg)) => {
                    if let Err(e) = sink.send(Frame::Text(encode(&msg))).await {
                        break format!("transport error on send: {e}");
                    }
                }
                // `None` only happens once the session itself is gone.
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Frame::Close(None)).await;
                    let _ = sink.close().await;
                    break "closed by agent".to_string();
                }
            },
            _ = ticker.tick() => {
                let silent_for = heartbeat.last_seen.borrow().elapsed();
                if silent_for > silence_limit {
                    break format!("heartbeat timed out: nothing received for {silent_for:?}");
                }
                if let Err(e) = sink.send(Frame::Ping(Vec::new())).await {
                    break format!("heartbeat failed: {e}");
                }
            }
        }
    };

    debug!("Session {} writer stopped", id);
    let _ = events.send(SessionEvent::Closed(reason));
}

async fn read_frames<R, E>(
    id: SessionId,
    mut stream: Pin<Box<R>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    last_seen: watch::Sender<Instant>,
) where
    R: Stream<Item = Result<Frame, E>> + Send,
    E: Display + Send,
{
    let reason = loop {
        let next = stream.next().await;
        if let Some(Ok(_)) = next {
            last_seen.send_replace(Instant::now());
        }
        match next {
            Some(Ok(Frame::Text(text))) => deliver(id, decode(&text), &events),
            Some(Ok(Frame::Binary(bytes))) => deliver(id, decode_slice(&bytes), &events),
            Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
            Some(Ok(Frame::Close(reason))) => {
                break match reason {
                    Some(reason) if !reason.is_empty() => format!("closed by peer: {reason}"),
                    _ => "closed by peer".to_string(),
                };
            }
            Some(Err(e)) => break format!("transport error: {e}"),
            None => break "connection lost".to_string(),
        }
    };

    debug!("Session {} reader stopped", id);
    let _ = events.send(SessionEvent::Closed(reason));
}

fn deliver(
    id: SessionId,
    decoded: Result<RelayMessage, DecodeError>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    match decoded {
        Ok(msg) => {
            let _ = events.send(SessionEvent::Message(msg));
        }
        Err(e) => warn!("Session {}: dropping frame: {}", id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use relay_protocol::{HttpMethod, HttpRequest};

    struct PeerEnd {
        to_agent: fmpsc::UnboundedSender<Result<Frame, String>>,
        from_agent: fmpsc::UnboundedReceiver<Frame>,
    }

    fn start(heartbeat: Duration) -> (Session, PeerEnd) {
        let (to_agent, agent_rx) = fmpsc::unbounded();
        let (agent_tx, from_agent) = fmpsc::unbounded();
        let session = Session::start(1, agent_tx, agent_rx, heartbeat);
        (
            session,
            PeerEnd {
                to_agent,
                from_agent,
            },
        )
    }

    fn request_frame(id: u64) -> Frame {
        Frame::Text(encode(&RelayMessage::HttpRequest {
            request_id: id,
            request: HttpRequest::new("http://example.test/", HttpMethod::Get, vec![], None),
        }))
    }

    const LONG: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn decodes_inbound_frames() {
        let (mut session, peer) = start(LONG);
        peer.to_agent.unbounded_send(Ok(request_frame(3))).unwrap();

        match session.next_event().await {
            SessionEvent::Message(msg) => assert_eq!(msg.request_id(), Some(3)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_closing() {
        let (mut session, peer) = start(LONG);
        peer.to_agent
            .unbounded_send(Ok(Frame::Text(r#"{"type":"bogus"}"#.to_string())))
            .unwrap();
        peer.to_agent
            .unbounded_send(Ok(Frame::Binary(vec![0xde, 0xad])))
            .unwrap();
        peer.to_agent.unbounded_send(Ok(request_frame(4))).unwrap();

        match session.next_event().await {
            SessionEvent::Message(msg) => assert_eq!(msg.request_id(), Some(4)),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!session.sender().is_closed());
    }

    #[tokio::test]
    async fn outbound_messages_are_encoded_as_text() {
        let (session, mut peer) = start(LONG);
        let msg = RelayMessage::Error {
            request_id: Some(1),
            message: "nope".to_string(),
        };
        assert!(session.sender().send(msg.clone()));

        match peer.from_agent.next().await {
            Some(Frame::Text(text)) => assert_eq!(decode(&text).unwrap(), msg),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_close_surfaces_once_and_disables_sends() {
        let (mut session, peer) = start(LONG);
        let sender = session.sender();
        peer.to_agent
            .unbounded_send(Ok(Frame::Close(Some("going away".to_string()))))
            .unwrap();

        assert_eq!(
            session.next_event().await,
            SessionEvent::Closed("closed by peer: going away".to_string())
        );
        // Repeated calls keep reporting the same closure.
        assert_eq!(
            session.next_event().await,
            SessionEvent::Closed("closed by peer: going away".to_string())
        );

        tokio::task::yield_now().await;
        let msg = RelayMessage::Error {
            request_id: None,
            message: "late".to_string(),
        };
        // The writer has been stopped; give the abort a moment to land.
        for _ in 0..100 {
            if sender.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!sender.send(msg));
    }

    #[tokio::test]
    async fn transport_end_and_error_close_the_session() {
        let (mut session, peer) = start(LONG);
        drop(peer.to_agent);
        assert_eq!(
            session.next_event().await,
            SessionEvent::Closed("connection lost".to_string())
        );

        let (mut session, peer) = start(LONG);
        peer.to_agent.unbounded_send(Err("reset".to_string())).unwrap();
        assert_eq!(
            session.next_event().await,
            SessionEvent::Closed("transport error: reset".to_string())
        );
    }

    #[tokio::test]
    async fn agent_close_sends_close_frame() {
        let (mut session, mut peer) = start(LONG);
        session.sender().close();

        assert_eq!(
            session.next_event().await,
            SessionEvent::Closed("closed by agent".to_string())
        );
        assert_eq!(peer.from_agent.next().await, Some(Frame::Close(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_the_transport() {
        let (_session, mut peer) = start(Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(peer.from_agent.next().await, Some(Frame::Ping(Vec::new())));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_closes_the_session() {
        let (mut session, _peer) = start(Duration::from_secs(30));

        match session.next_event().await {
            SessionEvent::Closed(reason) => {
                assert!(reason.starts_with("heartbeat timed out"), "{reason}")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_the_session_alive() {
        let (mut session, mut peer) = start(Duration::from_secs(30));
        tokio::spawn(async move {
            while let Some(frame) = peer.from_agent.next().await {
                if let Frame::Ping(payload) = frame {
                    let _ = peer.to_agent.unbounded_send(Ok(Frame::Pong(payload)));
                }
            }
        });

        let outcome = tokio::time::timeout(Duration::from_secs(600), session.next_event()).await;
        assert!(outcome.is_err(), "session closed: {outcome:?}");
    }
}
