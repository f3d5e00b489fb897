//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Dialing proxy with retry, reconnection and a bounded backlog."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fleet_logging::{fleet_warn, log_operation, LogContext, Outcome};
use fleet_msg::{Bus, Message, MessagingError};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::{TlsConnector, TlsStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, CLIENT_NAME_HEADER};
use crate::conn::{ConnectionManager, WsStream};
use crate::error::{Result, TransportError};
use crate::router::HandlerRouter;
use crate::state::{ConnectionState, ConnectionStatus, StateCell};
use crate::wire::WsMessage;

/// Client side of the cloud/edge link.
///
/// The proxy owns a bus endpoint named after its config: messages sent to
/// that endpoint are written to the server, and inbound frames are routed to
/// local modules. A lost connection is redialed in cycles of `retry_count`
/// attempts until [`WsClientProxy::stop`] is called.
#[derive(Clone)]
pub struct WsClientProxy {
    inner: Arc<ClientInner>,
}

struct Buffered {
    frame: WsMessage,
    sync_id: Option<String>,
}

struct ClientInner {
    config: Arc<ProxyConfig>,
    tls: Arc<rustls::ClientConfig>,
    bus: Bus,
    router: Arc<HandlerRouter>,
    state: StateCell,
    conn: RwLock<Option<Arc<ConnectionManager>>>,
    backlog: Mutex<VecDeque<Buffered>>,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    registered: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsClientProxy {
    /// An idle proxy; nothing is dialed or registered until `start`.
    pub fn new(config: ProxyConfig, tls: Arc<rustls::ClientConfig>, bus: Bus) -> Self {
        Self::build(config, tls, bus, CancellationToken::new())
    }

    /// Like [`WsClientProxy::new`], but cancelling `parent` aborts dialing and
    /// halts reconnection.
    pub fn with_parent(
        config: ProxyConfig,
        tls: Arc<rustls::ClientConfig>,
        bus: Bus,
        parent: &CancellationToken,
    ) -> Self {
        Self::build(config, tls, bus, parent.child_token())
    }

    fn build(
        config: ProxyConfig,
        tls: Arc<rustls::ClientConfig>,
        bus: Bus,
        cancel: CancellationToken,
    ) -> Self {
        let config = Arc::new(config);
        let router = Arc::new(HandlerRouter::new(config.clone(), bus.clone()));
        Self {
            inner: Arc::new(ClientInner {
                state: StateCell::new(config.name.clone()),
                config,
                tls,
                bus,
                router,
                conn: RwLock::new(None),
                backlog: Mutex::new(VecDeque::new()),
                cancel,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                registered: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bus endpoint name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Register the bus endpoint, dial, and spawn the reconnect supervisor and
    /// the bus-to-wire forwarder. Fails with `DialFailed` once every attempt
    /// of the first cycle failed.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) || inner.cancel.is_cancelled() {
            return Err(TransportError::Stopped(inner.config.name.clone()));
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted(inner.config.name.clone()));
        }
        if let Err(err) = inner.bus.register(&inner.config.name) {
            inner.started.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        inner.registered.store(true, Ordering::SeqCst);

        inner.state.transition(ConnectionState::Connecting, &inner.peer());
        let stream = match inner.dial_cycle().await {
            Ok(stream) => stream,
            Err(err) => {
                inner.state.transition(ConnectionState::Disconnected, &inner.peer());
                inner.release_endpoint();
                inner.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        inner.launch(stream).await
    }

    /// Write one frame to the server.
    pub fn send(&self, frame: WsMessage) -> Result<()> {
        self.inner.send(frame)
    }

    /// Encode and write `msg`. While a reconnect is in progress the frame is
    /// buffered instead and flushed once the link is back.
    pub fn send_message(&self, msg: &Message) -> Result<()> {
        self.inner.send_message(msg)
    }

    /// True while a connection is installed and not yet lost.
    pub fn is_connected(&self) -> bool {
        self.inner.state.state() == ConnectionState::Connected
    }

    /// Current state and connection generation.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.current()
    }

    /// Watch connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.state.subscribe()
    }

    /// Frames waiting for the next connection.
    pub fn backlog_len(&self) -> usize {
        self.inner.backlog.lock().len()
    }

    /// Close the connection, halt reconnection and release the bus endpoint.
    /// Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let peer = inner.peer();
        inner.state.transition(ConnectionState::Stopping, &peer);
        inner.cancel.cancel();

        let grace = inner.config.shutdown_grace;
        let deadline = Instant::now() + grace;
        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }
        let conn = inner.conn.write().take();
        if let Some(conn) = conn {
            conn.shutdown(grace).await;
        }

        inner.release_endpoint();
        let dropped: Vec<Buffered> = inner.backlog.lock().drain(..).collect();
        for buffered in dropped {
            if let Some(id) = buffered.sync_id {
                inner.bus.cancel_pending(&id);
            }
        }
        inner.state.transition(ConnectionState::Stopped, &peer);
        Ok(())
    }
}

impl ClientInner {
    fn peer(&self) -> String {
        self.config.address()
    }

    fn log_context<'a>(&'a self, peer: &'a str) -> LogContext<'a> {
        LogContext::new()
            .with_endpoint(&self.config.name)
            .with_peer(peer)
            .with_generation(self.state.current().generation)
    }

    fn send(&self, frame: WsMessage) -> Result<()> {
        if self.state.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected(self.config.name.clone()));
        }
        let conn = self
            .conn
            .read()
            .clone()
            .ok_or_else(|| TransportError::NotConnected(self.config.name.clone()))?;
        conn.sender().send(frame)
    }

    fn send_message(&self, msg: &Message) -> Result<()> {
        let frame = WsMessage::from_message(msg)?;
        match self.send(frame.clone()) {
            Err(TransportError::NotConnected(_)) if self.reconnecting() => {
                let sync_id = msg.header.is_sync.then(|| msg.header.id.clone());
                self.buffer(Buffered { frame, sync_id });
                if self.state.state() == ConnectionState::Connected {
                    self.flush_backlog();
                }
                Ok(())
            }
            other => other,
        }
    }

    /// Started, not stopping, and between connections.
    fn reconnecting(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && !self.cancel.is_cancelled()
            && matches!(
                self.state.state(),
                ConnectionState::Disconnected | ConnectionState::Connecting
            )
    }

    fn buffer(&self, item: Buffered) {
        let mut backlog = self.backlog.lock();
        backlog.push_back(item);
        while backlog.len() > self.config.backlog_limit {
            let Some(oldest) = backlog.pop_front() else {
                break;
            };
            let peer = self.peer();
            log_operation(
                Some(&self.log_context(&peer)),
                "ws.backlog",
                "backlog full; oldest frame dropped",
                Outcome::Dropped,
            );
            if let Some(id) = oldest.sync_id {
                self.bus.cancel_pending(&id);
            }
        }
    }

    fn flush_backlog(&self) {
        let Some(conn) = self.conn.read().clone() else {
            return;
        };
        let mut backlog = self.backlog.lock();
        while let Some(item) = backlog.pop_front() {
            if let Err(err) = conn.sender().send(item.frame.clone()) {
                debug!(endpoint = %self.config.name, error = %err, "backlog flush interrupted");
                backlog.push_front(item);
                return;
            }
        }
    }

    /// Publish a fresh connection; the generation increments on `Connected`.
    fn install(&self, stream: WsStream) -> Arc<ConnectionManager> {
        let generation = self.state.current().generation + 1;
        let conn = ConnectionManager::spawn(
            stream,
            self.peer(),
            generation,
            self.config.clone(),
            self.router.clone(),
        );
        *self.conn.write() = Some(conn.clone());
        self.flush_backlog();
        self.state.transition(ConnectionState::Connected, &self.peer());
        // Frames buffered between the first flush and the transition.
        self.flush_backlog();
        conn
    }

    /// Up to `retry_count` dials separated by `retry_backoff`.
    async fn dial_cycle(&self) -> Result<WsStream> {
        let attempts = self.config.retry_count.max(1);
        let peer = self.peer();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(TransportError::Cancelled(self.config.name.clone()))
                }
                outcome = self.dial() => outcome,
            };
            match outcome {
                Ok(stream) => {
                    info!(endpoint = %self.config.name, peer = %peer, attempt, "websocket connected");
                    return Ok(stream);
                }
                Err(err) => {
                    warn!(
                        endpoint = %self.config.name,
                        peer = %peer,
                        attempt,
                        attempts,
                        error = %err,
                        "dial attempt failed"
                    );
                    last_error = err.to_string();
                }
            }
            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        return Err(TransportError::Cancelled(self.config.name.clone()))
                    }
                    _ = tokio::time::sleep(self.config.retry_backoff) => {}
                }
            }
        }

        let err = TransportError::DialFailed {
            target: peer.clone(),
            attempts,
            reason: last_error,
        };
        log_operation(
            Some(&self.log_context(&peer)),
            "ws.dial",
            &err.to_string(),
            Outcome::Fault,
        );
        Err(err)
    }

    /// TCP connect, TLS handshake and WebSocket upgrade under one deadline.
    async fn dial(&self) -> Result<WsStream> {
        let peer = self.peer();
        let request = self.handshake_request()?;
        let server_name = ServerName::try_from(self.config.host.as_str())
            .map_err(|err| TransportError::Tls(err.to_string()))?
            .to_owned();
        let connector = TlsConnector::from(self.tls.clone());
        let frame_config = self.config.frame_config();

        let handshake = async {
            let tcp = TcpStream::connect(&peer).await?;
            let _ = tcp.set_nodelay(true);
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|err| TransportError::HandshakeFailed {
                    peer: peer.clone(),
                    reason: err.to_string(),
                })?;
            let (stream, _response) = tokio_tungstenite::client_async_with_config(
                request,
                TlsStream::Client(tls),
                Some(frame_config),
            )
            .await
            .map_err(|err| TransportError::HandshakeFailed {
                peer: peer.clone(),
                reason: err.to_string(),
            })?;
            Ok::<_, TransportError>(stream)
        };

        match tokio::time::timeout(self.config.handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::HandshakeFailed {
                peer: peer.clone(),
                reason: format!("timed out after {:?}", self.config.handshake_timeout),
            }),
        }
    }

    fn handshake_request(&self) -> Result<Request> {
        let invalid = |reason: String| TransportError::HandshakeFailed {
            peer: self.peer(),
            reason,
        };
        let mut request = self
            .config
            .url()
            .into_client_request()
            .map_err(|err| invalid(err.to_string()))?;
        let name = HeaderName::from_bytes(CLIENT_NAME_HEADER.as_bytes())
            .map_err(|err| invalid(err.to_string()))?;
        let value = HeaderValue::from_str(&self.config.client_name)
            .map_err(|err| invalid(err.to_string()))?;
        request.headers_mut().insert(name, value);
        Ok(request)
    }

    /// Install the first connection and hand the supervisor and forwarder to
    /// `stop`. A cancellation that raced the dial tears the connection down.
    async fn launch(self: &Arc<Self>, stream: WsStream) -> Result<()> {
        let conn = self.install(stream);
        {
            // `stop` cancels before draining `tasks`, so under this lock
            // either both tasks are handed over or the cancellation is seen.
            let mut tasks = self.tasks.lock();
            if !self.cancel.is_cancelled() {
                let supervisor = tokio::spawn(supervise(self.clone(), conn));
                let forwarder = tokio::spawn(forward(self.clone()));
                tasks.extend([supervisor, forwarder]);
                return Ok(());
            }
        }
        self.abandon_start().await;
        Err(TransportError::Cancelled(self.config.name.clone()))
    }

    /// Undo a `start` whose first connection landed after cancellation.
    async fn abandon_start(&self) {
        let peer = self.peer();
        let conn = self.conn.write().take();
        if let Some(conn) = conn {
            conn.shutdown(self.config.shutdown_grace).await;
        }
        self.release_endpoint();
        if self.stopped.load(Ordering::SeqCst) {
            self.state.transition(ConnectionState::Stopped, &peer);
        } else {
            self.state.transition(ConnectionState::Disconnected, &peer);
            self.started.store(false, Ordering::SeqCst);
        }
    }

    fn release_endpoint(&self) {
        if self.registered.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.bus.unregister(&self.config.name) {
                debug!(endpoint = %self.config.name, error = %err, "endpoint already released");
            }
        }
    }
}

/// Wait for the live connection to drop, then redial until it is back or the
/// proxy stops.
async fn supervise(inner: Arc<ClientInner>, mut conn: Arc<ConnectionManager>) {
    let peer = inner.peer();
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => return,
            _ = conn.closed() => {}
        }
        if inner.cancel.is_cancelled() {
            return;
        }
        inner.conn.write().take();
        inner.state.transition(ConnectionState::Disconnected, &peer);
        conn.shutdown(inner.config.shutdown_grace).await;

        loop {
            inner.state.transition(ConnectionState::Connecting, &peer);
            match inner.dial_cycle().await {
                Ok(stream) => {
                    if inner.cancel.is_cancelled() {
                        return;
                    }
                    conn = inner.install(stream);
                    break;
                }
                Err(TransportError::Cancelled(_)) => return,
                Err(_) => {
                    inner.state.transition(ConnectionState::Disconnected, &peer);
                    tokio::select! {
                        biased;
                        _ = inner.cancel.cancelled() => return,
                        _ = tokio::time::sleep(inner.config.retry_backoff) => {}
                    }
                }
            }
        }
    }
}

/// Drain the proxy's bus endpoint onto the wire.
async fn forward(inner: Arc<ClientInner>) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => return,
            next = inner.bus.receive(&inner.config.name) => match next {
                Ok(msg) => msg,
                Err(MessagingError::ChannelClosed(_)) => return,
                Err(err) => {
                    debug!(endpoint = %inner.config.name, error = %err, "forwarder stopped");
                    return;
                }
            },
        };
        if let Err(err) = inner.send_message(&msg) {
            let peer = inner.peer();
            fleet_warn!(
                context = inner.log_context(&peer).with_msg_id(&msg.header.id),
                "message not forwarded: {}",
                err
            );
            if msg.header.is_sync {
                inner.bus.cancel_pending(&msg.header.id);
            }
        }
    }
}
