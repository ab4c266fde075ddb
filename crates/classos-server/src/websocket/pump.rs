//! Session lifecycle: the inbound and outbound pumps of one upgraded socket.
//!
//! The outbound pump is the only writer. It drains the session queue in
//! bursts (everything queued since the last drain is fed, then flushed
//! once) and pings on a fixed interval. The inbound pump reads one frame at
//! a time under a read deadline that any frame, pongs included, resets.
//! Whichever side stops first brings the other one down, and the session
//! is unregistered from the hub exactly once. When the broker shuts down the
//! outbound pump sends a Close frame and stops.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, instrument, warn};

use super::hub::Hub;
use super::session::Session;
use crate::config::SessionTiming;
use crate::metrics::{
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_SESSION_DURATION_SECONDS, WS_SESSIONS_ACTIVE,
};
use crate::routing::MessageRouter;

/// Why the inbound pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundExit {
    PeerClosed,
    ReadError,
    DeadlineExpired,
    WriterStopped,
}

/// Why a write failed.
#[derive(Debug, Error)]
enum WriteFailure {
    #[error("socket error: {0}")]
    Socket(axum::Error),
    #[error("write deadline expired")]
    TimedOut,
}

/// Run a session from upgrade to teardown.
#[instrument(skip_all, fields(
    session_id = %session.id(),
    client_id = session.client_id(),
    role = %session.role(),
))]
pub async fn run_session(
    socket: WebSocket,
    session: Arc<Session>,
    queue: mpsc::Receiver<Arc<str>>,
    hub: Hub,
    router: Arc<MessageRouter>,
    timing: SessionTiming,
    shutdown: CancellationToken,
) {
    let role = session.role().as_str();
    if !hub.register(Arc::clone(&session)) {
        warn!("session could not be registered");
        return;
    }
    info!(channel = session.channel(), "client connected");
    counter!(WS_CONNECTIONS_TOTAL, "role" => role).increment(1);
    gauge!(WS_SESSIONS_ACTIVE).increment(1.0);

    let (sink, stream) = socket.split();
    let writer_stopped = CancellationToken::new();

    let outbound = tokio::spawn(
        outbound_pump(sink, queue, timing, shutdown, writer_stopped.clone()).in_current_span(),
    );
    let exit = inbound_pump(stream, &session, &router, timing.pong_wait, &writer_stopped).await;

    let _ = hub.unregister(&session);
    if outbound.await.is_err() {
        warn!("outbound pump panicked");
    }

    info!(?exit, dropped_frames = session.dropped_frames(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL, "role" => role).increment(1);
    gauge!(WS_SESSIONS_ACTIVE).decrement(1.0);
    histogram!(WS_SESSION_DURATION_SECONDS).record(session.age().as_secs_f64());
}

async fn inbound_pump(
    mut stream: SplitStream<WebSocket>,
    session: &Session,
    router: &MessageRouter,
    pong_wait: Duration,
    writer_stopped: &CancellationToken,
) -> InboundExit {
    loop {
        let read = tokio::select! {
            () = writer_stopped.cancelled() => return InboundExit::WriterStopped,
            read = tokio::time::timeout(pong_wait, stream.next()) => read,
        };

        let msg = match read {
            Err(_) => {
                warn!(timeout_secs = pong_wait.as_secs(), "read deadline expired");
                return InboundExit::DeadlineExpired;
            }
            Ok(None) => return InboundExit::PeerClosed,
            Ok(Some(Err(err))) => {
                debug!(error = %err, "read failed");
                return InboundExit::ReadError;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        session.touch();
        match msg {
            Message::Text(text) => {
                let _ = router.route(session, text.as_str()).await;
            }
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    let _ = router.route(session, text).await;
                }
                Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
            },
            Message::Close(_) => return InboundExit::PeerClosed,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn outbound_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Arc<str>>,
    timing: SessionTiming,
    shutdown: CancellationToken,
    stopped: CancellationToken,
) {
    let _guard = stopped.drop_guard();
    let mut ping = tokio::time::interval(timing.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        let result = tokio::select! {
            () = shutdown.cancelled() => {
                debug!("broker shutting down");
                let _ = bounded(timing.write_wait, sink.send(Message::Close(None))).await;
                return;
            }
            next = queue.recv() => match next {
                Some(first) => write_burst(&mut sink, first, &mut queue, timing.write_wait).await,
                None => {
                    debug!("queue closed by hub");
                    let _ = bounded(timing.write_wait, sink.send(Message::Close(None))).await;
                    return;
                }
            },
            _ = ping.tick() => bounded(timing.write_wait, sink.send(Message::Ping(Bytes::new()))).await,
        };

        if let Err(failure) = result {
            debug!(error = %failure, "write failed");
            return;
        }
    }
}

/// Feed `first` plus everything already queued, then flush once.
async fn write_burst(
    sink: &mut SplitSink<WebSocket, Message>,
    first: Arc<str>,
    queue: &mut mpsc::Receiver<Arc<str>>,
    write_wait: Duration,
) -> Result<(), WriteFailure> {
    let burst = async {
        sink.feed(text_frame(&first)).await?;
        while let Ok(next) = queue.try_recv() {
            sink.feed(text_frame(&next)).await?;
        }
        sink.flush().await
    };
    bounded(write_wait, burst).await
}

async fn bounded<F>(limit: Duration, write: F) -> Result<(), WriteFailure>
where
    F: Future<Output = Result<(), axum::Error>>,
{
    match tokio::time::timeout(limit, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(WriteFailure::Socket(err)),
        Err(_) => Err(WriteFailure::TimedOut),
    }
}

fn text_frame(frame: &str) -> Message {
    Message::Text(frame.to_owned().into())
}
