//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Reader, writer and pinger tasks of one live connection."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use fleet_logging::{log_operation, LogContext, Outcome};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_rustls::TlsStream;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::TransportError;
use crate::router::HandlerRouter;
use crate::wire::{FrameSender, Outbound};

pub(crate) type WsStream = WebSocketStream<TlsStream<TcpStream>>;

const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// One established connection.
///
/// A single writer task owns the sink; the reader dispatches frames in
/// arrival order; the pinger keeps the peer's read deadline fed. Any task
/// that hits a fault fires `closed`, which takes the other two down.
pub(crate) struct ConnectionManager {
    endpoint: String,
    peer: String,
    generation: u64,
    sender: FrameSender,
    closed: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub(crate) fn spawn(
        stream: WsStream,
        peer: impl Into<String>,
        generation: u64,
        config: Arc<ProxyConfig>,
        router: Arc<HandlerRouter>,
    ) -> Arc<Self> {
        let peer = peer.into();
        let closed = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = FrameSender::new(peer.clone(), tx, closed.clone());
        let (sink, stream) = stream.split();

        let link = Link {
            endpoint: config.name.clone(),
            peer: peer.clone(),
            generation,
            closed: closed.clone(),
        };
        let tasks = vec![
            tokio::spawn(write_loop(sink, rx, link.clone())),
            tokio::spawn(read_loop(
                stream,
                config.clone(),
                router,
                sender.clone(),
                link.clone(),
            )),
            tokio::spawn(ping_loop(sender.clone(), config.heartbeat_period, link)),
        ];

        Arc::new(Self {
            endpoint: config.name.clone(),
            peer,
            generation,
            sender,
            closed,
            tasks: Mutex::new(tasks),
        })
    }

    pub(crate) fn sender(&self) -> &FrameSender {
        &self.sender
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolves once the connection is lost or shut down.
    pub(crate) async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send a close frame and wait up to `grace` for the tasks to exit.
    pub(crate) async fn shutdown(&self, grace: Duration) {
        self.closed.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = Instant::now() + grace;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                debug!(
                    endpoint = %self.endpoint,
                    peer = %self.peer,
                    "connection task aborted after grace period"
                );
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Identity shared by the three tasks of a connection.
#[derive(Clone)]
struct Link {
    endpoint: String,
    peer: String,
    generation: u64,
    closed: CancellationToken,
}

impl Link {
    fn fault(&self, event: &str, err: &TransportError) {
        let ctx = LogContext::new()
            .with_endpoint(&self.endpoint)
            .with_peer(&self.peer)
            .with_generation(self.generation);
        log_operation(Some(&ctx), event, &err.to_string(), Outcome::Fault);
        self.closed.cancel();
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Frame>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    link: Link,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = link.closed.cancelled() => None,
            next = rx.recv() => next,
        };
        let Some(outbound) = next else {
            break;
        };
        if let Err(err) = sink.send(outbound.into_frame()).await {
            link.fault("ws.write", &TransportError::WriteFailed(err.to_string()));
            return;
        }
    }

    let close = async {
        let _ = sink.send(Frame::Close(None)).await;
        let _ = sink.close().await;
    };
    let _ = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, close).await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    config: Arc<ProxyConfig>,
    router: Arc<HandlerRouter>,
    reply: FrameSender,
    link: Link,
) {
    let deadline = config.heartbeat_deadline;
    let failure = loop {
        let next = tokio::select! {
            biased;
            _ = link.closed.cancelled() => return,
            next = tokio::time::timeout(deadline, stream.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                break TransportError::ReadFailed(format!("no frame or pong within {deadline:?}"))
            }
            Ok(None) => break TransportError::ReadFailed("connection closed".to_owned()),
            Ok(Some(Err(err))) => break TransportError::from_read(err, config.read_limit),
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Frame::Text(text) => {
                router.route(&link.peer, text.as_bytes(), &reply).await;
            }
            Frame::Binary(data) => {
                router.route(&link.peer, &data, &reply).await;
            }
            Frame::Close(close) => {
                let reason = close
                    .map(|frame| format!("peer closed: {} {}", u16::from(frame.code), frame.reason))
                    .unwrap_or_else(|| "peer closed".to_owned());
                break TransportError::ReadFailed(reason);
            }
            Frame::Ping(_) | Frame::Pong(_) | Frame::Frame(_) => {}
        }
    };
    link.fault("ws.read", &failure);
}

async fn ping_loop(sender: FrameSender, period: Duration, link: Link) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = link.closed.cancelled() => return,
            _ = ticker.tick() => {
                if sender.ping().is_err() {
                    return;
                }
            }
        }
    }
}
