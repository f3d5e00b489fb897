//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Accepting proxy holding one connection per named edge client."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fleet_logging::{fleet_warn, log_operation, LogContext, Outcome};
use fleet_msg::{Bus, Message, MessagingError};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, CLIENT_NAME_HEADER, REAL_IP_HEADER};
use crate::conn::{ConnectionManager, WsStream};
use crate::error::{Result, TransportError};
use crate::router::HandlerRouter;
use crate::state::{ConnectionState, ConnectionStatus, StateCell};
use crate::wire::{WsMessage, WsSvrMessage};

static CLIENT_NAME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]([-_a-zA-Z0-9]{0,62}[a-zA-Z0-9])?$").ok());

/// Whether `name` is acceptable as a `clientName` header value.
pub fn valid_client_name(name: &str) -> bool {
    CLIENT_NAME
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name))
}

/// A connected edge client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub name: String,
    /// `X-Real-IP` when a fronting proxy supplied it, else the socket address.
    pub address: String,
    pub connected_at: DateTime<Utc>,
    pub generation: u64,
}

/// Called with the peer on connect and on disconnect.
pub type PeerCallback = Arc<dyn Fn(&PeerInfo) + Send + Sync>;

struct ClientSlot {
    conn: Arc<ConnectionManager>,
    info: PeerInfo,
}

type ClientMap = Arc<DashMap<String, ClientSlot>>;

/// Writes frames to connected clients by name.
#[derive(Clone)]
pub struct WsSvrSender {
    clients: ClientMap,
}

impl WsSvrSender {
    /// Encode `msg` and write it to `client_id`.
    pub fn send(&self, client_id: &str, msg: &Message) -> Result<()> {
        let ws_message = WsMessage::from_message(msg)?;
        self.send_frame(WsSvrMessage {
            ws_message,
            client_name: client_id.to_owned(),
        })
    }

    pub fn send_frame(&self, frame: WsSvrMessage) -> Result<()> {
        let sender = self
            .clients
            .get(&frame.client_name)
            .map(|slot| slot.conn.sender().clone())
            .ok_or_else(|| TransportError::UnknownClient(frame.client_name.clone()))?;
        sender.send(frame.ws_message)
    }
}

/// Server side of the cloud/edge link.
///
/// Every accepted client must present a certificate from the fleet CA and a
/// unique `clientName` header. Inbound messages are stamped with the client's
/// name in `header.node_id`; messages sent to the proxy's bus endpoint are
/// written to the client named by their `header.node_id`.
#[derive(Clone)]
pub struct WsServerProxy {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: Arc<ProxyConfig>,
    tls: Arc<rustls::ServerConfig>,
    bus: Bus,
    router: Arc<HandlerRouter>,
    state: StateCell,
    clients: ClientMap,
    /// One permit per upgraded or upgrading client, `max_clients` in all.
    admission: Arc<Semaphore>,
    generation: AtomicU64,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    registered: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    on_connect: RwLock<Option<PeerCallback>>,
    on_disconnect: RwLock<Option<PeerCallback>>,
}

impl WsServerProxy {
    /// An idle proxy; nothing is bound or registered until `start`.
    pub fn new(config: ProxyConfig, tls: Arc<rustls::ServerConfig>, bus: Bus) -> Self {
        let config = Arc::new(config);
        let router = Arc::new(HandlerRouter::for_server(config.clone(), bus.clone()));
        Self {
            inner: Arc::new(ServerInner {
                state: StateCell::new(config.name.clone()),
                admission: Arc::new(Semaphore::new(
                    config.max_clients.min(Semaphore::MAX_PERMITS),
                )),
                config,
                tls,
                bus,
                router,
                clients: Arc::new(DashMap::new()),
                generation: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                registered: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                on_connect: RwLock::new(None),
                on_disconnect: RwLock::new(None),
            }),
        }
    }

    /// Called once per client after it enters the peer table.
    pub fn on_connect(&self, callback: impl Fn(&PeerInfo) + Send + Sync + 'static) {
        *self.inner.on_connect.write() = Some(Arc::new(callback));
    }

    /// Called once per client after it leaves the peer table.
    pub fn on_disconnect(&self, callback: impl Fn(&PeerInfo) + Send + Sync + 'static) {
        *self.inner.on_disconnect.write() = Some(Arc::new(callback));
    }

    /// Bus endpoint name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Bind, register the bus endpoint and start accepting. Returns the bound
    /// address, which differs from the configured one when port 0 was asked.
    pub async fn start(&self) -> Result<SocketAddr> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped(inner.config.name.clone()));
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted(inner.config.name.clone()));
        }
        let address = inner.config.address();
        inner.state.transition(ConnectionState::Connecting, &address);

        let bound = async {
            let listener = TcpListener::bind(&address).await?;
            let local = listener.local_addr()?;
            Ok::<_, TransportError>((listener, local))
        };
        let (listener, local) = match bound.await {
            Ok(bound) => bound,
            Err(err) => {
                inner.state.transition(ConnectionState::Disconnected, &address);
                inner.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        if let Err(err) = inner.bus.register(&inner.config.name) {
            inner.state.transition(ConnectionState::Disconnected, &address);
            inner.started.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        inner.registered.store(true, Ordering::SeqCst);
        inner
            .state
            .transition(ConnectionState::Connected, &local.to_string());
        info!(endpoint = %inner.config.name, address = %local, "websocket server listening");

        let acceptor = tokio::spawn(accept_loop(inner.clone(), listener));
        let forwarder = tokio::spawn(forward(inner.clone()));
        inner.tasks.lock().extend([acceptor, forwarder]);
        Ok(local)
    }

    /// Handle for writing to clients by name.
    pub fn sender(&self) -> WsSvrSender {
        WsSvrSender {
            clients: self.inner.clients.clone(),
        }
    }

    /// Encode `msg` and write it to `client_id`.
    pub fn send(&self, client_id: &str, msg: &Message) -> Result<()> {
        self.sender().send(client_id, msg)
    }

    /// Write a pre-addressed frame.
    pub fn send_frame(&self, frame: WsSvrMessage) -> Result<()> {
        self.sender().send_frame(frame)
    }

    /// True while `client_id` holds an open connection.
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner
            .clients
            .get(client_id)
            .is_some_and(|slot| !slot.conn.is_closed())
    }

    /// Peer table entry of `client_id`.
    pub fn peer(&self, client_id: &str) -> Option<PeerInfo> {
        self.inner.clients.get(client_id).map(|slot| slot.info.clone())
    }

    /// Connected clients sorted by name.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .inner
            .clients
            .iter()
            .map(|slot| slot.info.clone())
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    /// Listener state; `Connected` while accepting.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.current()
    }

    /// Watch listener state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.state.subscribe()
    }

    /// Stop accepting, close every client connection and release the bus
    /// endpoint. Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let address = inner.config.address();
        inner.state.transition(ConnectionState::Stopping, &address);
        inner.cancel.cancel();

        let grace = inner.config.shutdown_grace;
        let deadline = Instant::now() + grace;
        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }

        let conns: Vec<Arc<ConnectionManager>> = inner
            .clients
            .iter()
            .map(|slot| slot.conn.clone())
            .collect();
        for conn in conns {
            conn.shutdown(grace).await;
        }
        inner.clients.clear();

        if inner.registered.swap(false, Ordering::SeqCst) {
            if let Err(err) = inner.bus.unregister(&inner.config.name) {
                debug!(endpoint = %inner.config.name, error = %err, "endpoint already released");
            }
        }
        inner.state.transition(ConnectionState::Stopped, &address);
        Ok(())
    }
}

impl ServerInner {
    async fn serve_client(self: Arc<Self>, tcp: TcpStream, remote: SocketAddr) {
        let remote_label = remote.to_string();
        let _ = tcp.set_nodelay(true);
        let upgraded = tokio::time::timeout(self.config.handshake_timeout, self.upgrade(tcp))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::HandshakeFailed {
                    peer: remote_label.clone(),
                    reason: format!("timed out after {:?}", self.config.handshake_timeout),
                })
            });
        let Admitted {
            stream,
            name,
            real_ip,
            permit,
        } = match upgraded {
            Ok(upgraded) => upgraded,
            Err(err) => {
                let ctx = LogContext::new()
                    .with_endpoint(&self.config.name)
                    .with_peer(&remote_label);
                log_operation(Some(&ctx), "ws.accept", &err.to_string(), Outcome::Fault);
                return;
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = ConnectionManager::spawn(
            stream,
            name.clone(),
            generation,
            self.config.clone(),
            self.router.clone(),
        );
        let info = PeerInfo {
            name: name.clone(),
            address: real_ip.unwrap_or(remote_label),
            connected_at: Utc::now(),
            generation: conn.generation(),
        };
        let inserted = match self.clients.entry(name.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ClientSlot {
                    conn: conn.clone(),
                    info: info.clone(),
                });
                true
            }
        };
        let ctx = LogContext::new()
            .with_endpoint(&self.config.name)
            .with_peer(&name)
            .with_generation(generation);
        if !inserted {
            let err = TransportError::DuplicateClient(name.clone());
            log_operation(Some(&ctx), "ws.accept", &err.to_string(), Outcome::Fault);
            conn.shutdown(self.config.shutdown_grace).await;
            return;
        }
        log_operation(
            Some(&ctx),
            "ws.client",
            &format!("client connected from {}", info.address),
            Outcome::Success,
        );
        let on_connect = self.on_connect.read().clone();
        if let Some(callback) = on_connect {
            callback(&info);
        }

        tokio::select! {
            _ = conn.closed() => {}
            _ = self.cancel.cancelled() => {}
        }
        self.clients
            .remove_if(&name, |_, slot| slot.info.generation == generation);
        drop(permit);
        conn.shutdown(self.config.shutdown_grace).await;
        log_operation(Some(&ctx), "ws.client", "client disconnected", Outcome::Success);
        let on_disconnect = self.on_disconnect.read().clone();
        if let Some(callback) = on_disconnect {
            callback(&info);
        }
    }

    /// TLS accept, then the WebSocket upgrade with header validation.
    async fn upgrade(&self, tcp: TcpStream) -> Result<Admitted> {
        let peer = tcp
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let tls = TlsAcceptor::from(self.tls.clone())
            .accept(tcp)
            .await
            .map_err(|err| TransportError::HandshakeFailed {
                peer: peer.clone(),
                reason: err.to_string(),
            })?;

        let mut identity: Option<(String, Option<String>, OwnedSemaphorePermit)> = None;
        let clients = &self.clients;
        let admission = &self.admission;
        let max_clients = self.config.max_clients;
        let callback = |request: &Request, response: Response| {
            match check_request(request, clients, admission, max_clients) {
                Ok(found) => {
                    identity = Some(found);
                    Ok(response)
                }
                Err(err) => Err(reject(&err)),
            }
        };
        let stream = tokio_tungstenite::accept_hdr_async_with_config(
            TlsStream::Server(tls),
            callback,
            Some(self.config.frame_config()),
        )
        .await
        .map_err(|err| TransportError::HandshakeFailed {
            peer: peer.clone(),
            reason: err.to_string(),
        })?;

        let (name, real_ip, permit) = identity.ok_or_else(|| TransportError::HandshakeFailed {
            peer,
            reason: "upgrade completed without a client name".to_owned(),
        })?;
        Ok(Admitted {
            stream,
            name,
            real_ip,
            permit,
        })
    }
}

/// An upgraded client holding its admission permit until it disconnects.
struct Admitted {
    stream: WsStream,
    name: String,
    real_ip: Option<String>,
    permit: OwnedSemaphorePermit,
}

fn check_request(
    request: &Request,
    clients: &DashMap<String, ClientSlot>,
    admission: &Arc<Semaphore>,
    max_clients: usize,
) -> Result<(String, Option<String>, OwnedSemaphorePermit)> {
    let name = request
        .headers()
        .get(CLIENT_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !valid_client_name(name) {
        return Err(TransportError::InvalidClientName(name.to_owned()));
    }
    if clients.contains_key(name) {
        return Err(TransportError::DuplicateClient(name.to_owned()));
    }
    let permit = admission
        .clone()
        .try_acquire_owned()
        .map_err(|_| TransportError::TooManyClients(max_clients))?;
    let real_ip = request
        .headers()
        .get(REAL_IP_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    Ok((name.to_owned(), real_ip, permit))
}

fn reject(err: &TransportError) -> ErrorResponse {
    let status = match err {
        TransportError::DuplicateClient(_) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = status;
    response
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((tcp, remote)) => {
                tokio::spawn(inner.clone().serve_client(tcp, remote));
            }
            Err(err) => {
                warn!(endpoint = %inner.config.name, error = %err, "accept failed");
            }
        }
    }
}

/// Drain the proxy's bus endpoint to the client named in `header.node_id`.
async fn forward(inner: Arc<ServerInner>) {
    let sender = WsSvrSender {
        clients: inner.clients.clone(),
    };
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
        if let Err(err) = sender.send(&msg.header.node_id, &msg) {
            fleet_warn!(
                context = LogContext::new()
                    .with_endpoint(&inner.config.name)
                    .with_peer(&msg.header.node_id)
                    .with_msg_id(&msg.header.id),
                "message not forwarded: {}",
                err
            );
            if msg.header.is_sync {
                inner.bus.cancel_pending(&msg.header.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_names_follow_dns_label_rules() {
        assert!(valid_client_name("edge-01"));
        assert!(valid_client_name("a"));
        assert!(valid_client_name("node_7"));
        assert!(!valid_client_name(""));
        assert!(!valid_client_name("-edge"));
        assert!(!valid_client_name("edge-"));
        assert!(!valid_client_name("edge 01"));
        assert!(!valid_client_name(&"x".repeat(65)));
        assert!(valid_client_name(&"x".repeat(64)));
    }

    #[test]
    fn requests_without_a_name_are_rejected() {
        let clients = DashMap::new();
        let request = Request::builder()
            .uri("wss://127.0.0.1:10000/")
            .body(())
            .expect("request");
        let err = check_request(&request, &clients, &Arc::new(Semaphore::new(1)), 1).expect_err("no header");
        assert_eq!(reject(&err).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn real_ip_header_is_picked_up() {
        let clients = DashMap::new();
        let request = Request::builder()
            .uri("wss://127.0.0.1:10000/")
            .header(CLIENT_NAME_HEADER, "edge-01")
            .header(REAL_IP_HEADER, "10.1.2.3")
            .body(())
            .expect("request");
        let (name, real_ip, _permit) = check_request(&request, &clients, &Arc::new(Semaphore::new(1)), 1).expect("accepted");
        assert_eq!(name, "edge-01");
        assert_eq!(real_ip.as_deref(), Some("10.1.2.3"));
    }
}
