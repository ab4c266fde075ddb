//! Reconnecting agent connection.
//!
//! One [`AgentClient`] owns at most one live connection at a time. Each
//! connection runs three tasks: a writer that is the only one touching the
//! socket sink, a read loop that dispatches inbound envelopes to handlers,
//! and a heartbeat loop. A read failure ends the connection and, unless the
//! client was closed, starts a reconnect loop with exponential backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use classos_core::retry::Backoff;
use classos_core::{Envelope, HeartbeatPayload, MessageType};
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::handler::{HandlerTable, MessageHandler};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Produces the payload of each heartbeat.
pub type HeartbeatSource = Arc<dyn Fn() -> HeartbeatPayload + Send + Sync>;

const OUTBOUND_CAPACITY: usize = 64;

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no dial in progress.
    Disconnected,
    /// Dialing.
    Connecting,
    /// Upgraded; read, write and heartbeat loops are running.
    Connected,
}

/// A frame for the writer plus where to report the write result.
struct Outgoing {
    frame: Message,
    ack: oneshot::Sender<Result<()>>,
}

/// The live connection.
struct Link {
    generation: u64,
    outbound: mpsc::Sender<Outgoing>,
    token: CancellationToken,
    writer: JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    backoff: Mutex<Backoff>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    handlers: HandlerTable,
    heartbeat: RwLock<HeartbeatSource>,
    done: CancellationToken,
}

/// Agent-side connection to the broker.
///
/// Cheap to clone; clones share the connection, the handler table and the
/// shutdown signal.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("server_url", &self.inner.config.server_url)
            .field("state", &self.state())
            .field("handlers", &self.inner.handlers.len())
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    /// New, disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        let backoff = Backoff::new(config.reconnect);
        let heartbeat: HeartbeatSource = Arc::new(default_heartbeat);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                backoff: Mutex::new(backoff),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                handlers: HandlerTable::default(),
                heartbeat: RwLock::new(heartbeat),
                done: CancellationToken::new(),
            }),
        }
    }

    /// Use `source` to build heartbeat payloads.
    #[must_use]
    pub fn with_heartbeat<F>(self, source: F) -> Self
    where
        F: Fn() -> HeartbeatPayload + Send + Sync + 'static,
    {
        *self.inner.heartbeat.write() = Arc::new(source);
        self
    }

    /// Register the handler for `kind`, replacing any previous one.
    pub fn on(&self, kind: MessageType, handler: impl MessageHandler + 'static) {
        self.inner.handlers.insert(kind, Arc::new(handler));
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Failed dials since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.inner.backoff.lock().attempts()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Dial once. On success the retry counter resets and the connection
    /// loops start; on failure the error is returned without retrying.
    pub async fn connect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Cancelled);
        }
        let config = &self.inner.config;
        let url = dial_url(&config.server_url, &config.device_token)?;

        self.set_state(ConnectionState::Connecting);
        info!(server_url = %config.server_url, "connecting to broker");
        let ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ClientError::Dial(Box::new(err)));
            }
        };

        self.inner.backoff.lock().reset();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.inner.done.child_token();
        let (sink, stream) = ws.split();
        let (outbound, queue) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(write_loop(sink, queue, config.write_timeout, token.clone()));

        let previous = self.inner.link.lock().replace(Link {
            generation,
            outbound,
            token: token.clone(),
            writer,
        });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        self.set_state(ConnectionState::Connected);
        info!(generation, "connection established");

        let _ = tokio::spawn(self.clone().read_loop(stream, generation, token.clone()));
        let _ = tokio::spawn(self.clone().heartbeat_loop(token));
        Ok(())
    }

    /// Dial until connected, waiting `min(base * 2^attempts, cap)` between
    /// failures. Returns [`ClientError::Cancelled`] if the client is closed
    /// first.
    pub async fn connect_with_retry(&self) -> Result<()> {
        loop {
            let err = match self.connect().await {
                Ok(()) => return Ok(()),
                Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                Err(err) => err,
            };

            let (attempt, delay) = {
                let mut backoff = self.inner.backoff.lock();
                let delay = backoff.next_delay();
                (backoff.attempts(), delay)
            };
            warn!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "failed to connect, retrying"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.inner.done.cancelled() => return Err(ClientError::Cancelled),
            }
        }
    }

    /// Send `payload` as a `kind` envelope.
    pub async fn send<P: Serialize>(&self, kind: MessageType, payload: &P) -> Result<()> {
        self.send_envelope(Envelope::new(kind, payload)?).await
    }

    /// Send a prepared envelope and wait for the write to complete.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let frame = Message::text(envelope.to_json()?);
        let outbound = self
            .inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(ClientError::NotConnected)?;

        let (ack, written) = oneshot::channel();
        outbound
            .send(Outgoing { frame, ack })
            .await
            .map_err(|_| ClientError::NotConnected)?;
        written.await.map_err(|_| ClientError::NotConnected)?
    }

    /// Send one heartbeat built by the heartbeat source.
    pub async fn send_heartbeat(&self) -> Result<()> {
        let source = Arc::clone(&self.inner.heartbeat.read());
        self.send(MessageType::Heartbeat, &source()).await
    }

    /// Stop retrying and heartbeating, and close the connection.
    pub async fn close(&self) {
        self.inner.done.cancel();
        let link = self.inner.link.lock().take();
        self.set_state(ConnectionState::Disconnected);

        if let Some(link) = link {
            link.token.cancel();
            match tokio::time::timeout(self.inner.config.write_timeout, link.writer).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "writer task failed"),
                Err(_) => warn!("writer did not stop in time"),
            }
        }
        info!("client closed");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), state);
        if previous != state {
            debug!(?previous, ?state, "connection state changed");
        }
    }

    async fn read_loop(self, mut stream: SplitStream<WsStream>, generation: u64, token: CancellationToken) {
        loop {
            let next = tokio::select! {
                () = token.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()).await,
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => self.dispatch(text).await,
                    Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "connection closed by broker");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    error!(error = %err, "error reading message");
                    break;
                }
                None => {
                    info!("connection closed");
                    break;
                }
            }
        }

        token.cancel();
        self.detach(generation);
        if !self.is_closed() {
            self.schedule_reconnect();
        }
    }

    async fn dispatch(&self, raw: &str) {
        let envelope = match Envelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(error = %err, "failed to decode message");
                return;
            }
        };
        let Ok(kind) = envelope.kind() else {
            warn!(message_type = %envelope.message_type, "no handler for message type");
            return;
        };
        let Some(handler) = self.inner.handlers.get(kind) else {
            warn!(message_type = %kind, "no handler for message type");
            return;
        };
        if let Err(err) = handler.handle(self, envelope).await {
            error!(message_type = %kind, error = %err, "error handling message");
        }
    }

    async fn heartbeat_loop(self, token: CancellationToken) {
        let period = self.inner.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.send_heartbeat().await {
                        error!(error = %err, "failed to send heartbeat");
                    }
                }
            }
        }
    }

    /// Drop the link of `generation` if it is still the current one.
    fn detach(&self, generation: u64) {
        let detached = {
            let mut link = self.inner.link.lock();
            if link.as_ref().is_some_and(|l| l.generation == generation) {
                *link = None;
                true
            } else {
                false
            }
        };
        if detached {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn schedule_reconnect(&self) {
        info!("scheduling reconnection");
        let client = self.clone();
        let _ = tokio::spawn(async move {
            if let Err(err) = client.connect_with_retry().await {
                debug!(error = %err, "reconnect abandoned");
            }
        });
    }
}

/// Only writer of a connection's sink.
///
/// A failed write is reported to its sender and logged; the connection is
/// only torn down by the read loop or by cancellation.
async fn write_loop<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Outgoing>,
    write_timeout: Duration,
    token: CancellationToken,
) where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let next = tokio::select! {
            () = token.cancelled() => {
                let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
                return;
            }
            next = queue.recv() => next,
        };
        let Some(Outgoing { frame, ack }) = next else {
            return;
        };

        let result = match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ClientError::Write(Box::new(err))),
            Err(_) => Err(ClientError::WriteTimeout),
        };
        if let Err(err) = &result {
            warn!(error = %err, "write failed");
        }
        let _ = ack.send(result);
    }
}

fn default_heartbeat() -> HeartbeatPayload {
    HeartbeatPayload {
        status: "online".into(),
        ..HeartbeatPayload::default()
    }
}

/// `server_url` with the credential appended as the `token` query parameter.
fn dial_url(server_url: &str, token: &str) -> Result<String> {
    if !(server_url.starts_with("ws://") || server_url.starts_with("wss://")) {
        return Err(ClientError::InvalidUrl(server_url.to_string()));
    }
    let separator = if server_url.contains('?') { '&' } else { '?' };
    Ok(format!(
        "{server_url}{separator}token={}",
        utf8_percent_encode(token, NON_ALPHANUMERIC)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn refused_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}/ws")
    }

    #[test]
    fn dial_url_appends_encoded_token() {
        assert_eq!(
            dial_url("ws://broker:8080/ws", "device_lab-01").unwrap(),
            "ws://broker:8080/ws?token=device%5Flab%2D01"
        );
        assert_eq!(
            dial_url("ws://broker/ws?v=1", "a b").unwrap(),
            "ws://broker/ws?v=1&token=a%20b"
        );
    }

    #[test]
    fn dial_url_rejects_other_schemes() {
        assert_matches!(
            dial_url("http://broker/ws", "device_x"),
            Err(ClientError::InvalidUrl(_))
        );
    }

    #[test]
    fn default_heartbeat_is_online() {
        let hb = default_heartbeat();
        assert_eq!(hb.status, "online");
        assert!(hb.username.is_empty());
    }

    #[tokio::test]
    async fn new_client_is_disconnected() {
        let client = AgentClient::new(ClientConfig::new("ws://127.0.0.1:1/ws", "device_x"));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.attempts(), 0);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let client = AgentClient::new(ClientConfig::new("ws://127.0.0.1:1/ws", "device_x"));
        assert_matches!(client.send_heartbeat().await, Err(ClientError::NotConnected));
    }

    #[tokio::test]
    async fn failed_connect_does_not_retry() {
        let client = AgentClient::new(ClientConfig::new(refused_url(), "device_x"));
        assert_matches!(client.connect().await, Err(ClientError::Dial(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.attempts(), 0);
    }

    #[tokio::test]
    async fn connect_after_close_is_cancelled() {
        let client = AgentClient::new(ClientConfig::new(refused_url(), "device_x"));
        client.close().await;
        assert!(client.is_closed());
        assert_matches!(client.connect().await, Err(ClientError::Cancelled));
    }

    #[tokio::test]
    async fn retry_backs_off_until_closed() {
        let mut config = ClientConfig::new(refused_url(), "device_x");
        config.reconnect.base_delay_ms = 10;
        config.reconnect.max_delay_ms = 40;
        let client = AgentClient::new(config);

        let retrying = tokio::spawn({
            let client = client.clone();
            async move { client.connect_with_retry().await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(client.attempts() >= 2);

        client.close().await;
        let result = tokio::time::timeout(Duration::from_secs(5), retrying)
            .await
            .unwrap()
            .unwrap();
        assert_matches!(result, Err(ClientError::Cancelled));
    }

    #[test]
    fn debug_hides_internals() {
        let client = AgentClient::new(ClientConfig::new("ws://broker/ws", "device_secret"));
        let rendered = format!("{client:?}");
        assert!(rendered.contains("ws://broker/ws"));
        assert!(!rendered.contains("device_secret"));
    }

    /// Refuses every frame.
    struct BrokenSink;

    impl Sink<Message> for BrokenSink {
        type Error = tungstenite::Error;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
            std::task::Poll::Ready(Err(tungstenite::Error::ConnectionClosed))
        }

        fn start_send(
            self: std::pin::Pin<&mut Self>,
            _item: Message,
        ) -> std::result::Result<(), Self::Error> {
            Err(tungstenite::Error::ConnectionClosed)
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_write_keeps_the_connection() {
        let sink = BrokenSink;
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let writer = tokio::spawn(write_loop(sink, rx, Duration::from_secs(1), token.clone()));

        for _ in 0..2 {
            let (ack, written) = oneshot::channel();
            tx.send(Outgoing {
                frame: Message::text("{}"),
                ack,
            })
            .await
            .unwrap();
            assert_matches!(written.await.unwrap(), Err(ClientError::Write(_)));
        }
        assert!(!token.is_cancelled());

        drop(tx);
        writer.await.unwrap();
    }
}
