//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Process-local bus: named endpoints, sync correlation, timeouts."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fleet_common::BusConfig;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::logging::{log_message, MessageDirection, MessagingMetricsExporter};
use crate::message::Message;
use crate::{MessagingError, Result};

struct Endpoint {
    tx: mpsc::Sender<Message>,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    closed: CancellationToken,
}

struct PendingSlot {
    token: u64,
    tx: oneshot::Sender<Result<Message>>,
    since: Instant,
}

struct Inner {
    config: BusConfig,
    endpoints: DashMap<String, Endpoint>,
    pending: DashMap<String, PendingSlot>,
    next_token: AtomicU64,
    metrics: Option<MessagingMetricsExporter>,
}

/// Registry of named endpoints plus the pending-sync table.
///
/// Cloning is cheap; every clone addresses the same endpoints.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("endpoints", &self.inner.endpoints.len())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl Bus {
    /// Create an empty bus.
    pub fn new(config: BusConfig) -> Self {
        Self::build(config, None)
    }

    /// Create an empty bus that records activity into `metrics`.
    pub fn with_metrics(config: BusConfig, metrics: MessagingMetricsExporter) -> Self {
        Self::build(config, Some(metrics))
    }

    fn build(config: BusConfig, metrics: Option<MessagingMetricsExporter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                endpoints: DashMap::new(),
                pending: DashMap::new(),
                next_token: AtomicU64::new(1),
                metrics,
            }),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Create a fresh endpoint channel under `name`.
    pub fn register(&self, name: &str) -> Result<()> {
        match self.inner.endpoints.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(MessagingError::AlreadyRegistered(name.to_owned())),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(self.inner.config.endpoint_capacity.max(1));
                slot.insert(Endpoint {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                    closed: CancellationToken::new(),
                });
                debug!(endpoint = %name, "endpoint registered");
                Ok(())
            }
        }
    }

    /// Remove `name` and close its channel; in-flight receivers observe `ChannelClosed`.
    pub fn unregister(&self, name: &str) -> Result<()> {
        match self.inner.endpoints.remove(name) {
            Some((_, endpoint)) => {
                endpoint.closed.cancel();
                debug!(endpoint = %name, "endpoint unregistered");
                Ok(())
            }
            None => Err(MessagingError::NotRegistered(name.to_owned())),
        }
    }

    /// Whether `name` currently has an endpoint.
    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.endpoints.contains_key(name)
    }

    /// Deliver `msg`: requests go to the destination endpoint, responses
    /// (non-empty `parent_id`) go to the waiting sync caller.
    pub async fn send(&self, msg: Message) -> Result<()> {
        if msg.is_response() {
            return self.send_resp(msg);
        }
        self.enqueue(msg).await
    }

    /// Wait for the next message on `name`.
    pub async fn receive(&self, name: &str) -> Result<Message> {
        let (rx, closed) = self
            .inner
            .endpoints
            .get(name)
            .map(|endpoint| (endpoint.rx.clone(), endpoint.closed.clone()))
            .ok_or_else(|| MessagingError::ChannelClosed(name.to_owned()))?;

        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => None,
            next = async { rx.lock().await.recv().await } => next,
        };

        match next {
            Some(msg) => {
                log_message(MessageDirection::Inbound, &msg);
                if let Some(metrics) = &self.inner.metrics {
                    metrics.observe_received();
                }
                Ok(msg)
            }
            None => Err(MessagingError::ChannelClosed(name.to_owned())),
        }
    }

    /// Send a request and wait for its response.
    ///
    /// A zero `timeout` selects the configured default.
    pub async fn send_sync(&self, msg: Message, timeout: Duration) -> Result<Message> {
        self.begin_sync(msg, timeout).await?.wait().await
    }

    /// [`Bus::send_sync`] that gives up with `Cancelled` if `cancel` fires
    /// before the request has been enqueued. Once enqueued, only the
    /// response or the timeout end the call.
    pub async fn send_sync_with_cancel(
        &self,
        msg: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let id = msg.header.id.clone();
        let pending = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MessagingError::Cancelled(id)),
            pending = self.begin_sync(msg, timeout) => pending?,
        };
        pending.wait().await
    }

    /// First half of a sync call: park a response slot under `msg.id`, then
    /// enqueue the request. The returned handle awaits the response.
    ///
    /// Fails with `DuplicatePending` while another caller waits on the same id.
    pub async fn begin_sync(&self, mut msg: Message, timeout: Duration) -> Result<PendingResponse> {
        let timeout = if timeout.is_zero() {
            self.inner.config.sync_timeout
        } else {
            timeout
        };
        msg.header.is_sync = true;
        let id = msg.header.id.clone();

        let (tx, rx) = oneshot::channel();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        match self.inner.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                debug!(msg_id = %id, "sync request id already awaiting a response");
                return Err(MessagingError::DuplicatePending(id));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingSlot {
                    token,
                    tx,
                    since: Instant::now(),
                });
            }
        }
        let guard = PendingGuard {
            inner: self.inner.clone(),
            id: id.clone(),
            token,
        };

        self.enqueue(msg).await?;
        Ok(PendingResponse {
            id,
            rx,
            timeout,
            guard,
        })
    }

    /// Hand a response to the caller waiting on `msg.parent_id`.
    pub fn send_resp(&self, msg: Message) -> Result<()> {
        let parent_id = msg.header.parent_id.clone();
        let Some((_, slot)) = self.inner.pending.remove(&parent_id) else {
            debug!(parent_id = %parent_id, msg_id = %msg.header.id, "dropping response without waiter");
            self.observe_dropped();
            return Err(MessagingError::NoSuchPending(parent_id));
        };

        log_message(MessageDirection::Response, &msg);
        if let Some(metrics) = &self.inner.metrics {
            metrics.observe_latency(slot.since.elapsed());
        }
        slot.tx
            .send(Ok(msg))
            .map_err(|_| MessagingError::NoSuchPending(parent_id))
    }

    /// Fail the sync call waiting on `id` with `Cancelled`. Returns whether a
    /// caller was waiting.
    pub fn cancel_pending(&self, id: &str) -> bool {
        match self.inner.pending.remove(id) {
            Some((_, slot)) => {
                let _ = slot.tx.send(Err(MessagingError::Cancelled(id.to_owned())));
                true
            }
            None => false,
        }
    }

    /// Whether a sync caller is waiting on `id`.
    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.pending.contains_key(id)
    }

    /// Number of sync callers currently waiting.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    async fn enqueue(&self, msg: Message) -> Result<()> {
        let destination = msg.router.destination.clone();
        let tx = self
            .inner
            .endpoints
            .get(&destination)
            .map(|endpoint| endpoint.tx.clone())
            .ok_or_else(|| MessagingError::NoSuchEndpoint(destination.clone()))?;

        log_message(MessageDirection::Outbound, &msg);
        let timeout = self.inner.config.send_timeout;
        match tx.send_timeout(msg, timeout).await {
            Ok(()) => {
                if let Some(metrics) = &self.inner.metrics {
                    metrics.observe_sent();
                }
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.observe_dropped();
                Err(MessagingError::SendTimeout {
                    destination,
                    timeout,
                })
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.observe_dropped();
                Err(MessagingError::NoSuchEndpoint(destination))
            }
        }
    }

    fn observe_dropped(&self) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.observe_dropped();
        }
    }
}

/// Removes a pending-sync entry when the owning call ends, however it ends.
struct PendingGuard {
    inner: Arc<Inner>,
    id: String,
    token: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        // Only the slot this call parked; a later caller may reuse the id.
        self.inner
            .pending
            .remove_if(&self.id, |_, slot| slot.token == self.token);
    }
}

/// An enqueued sync request awaiting its response.
pub struct PendingResponse {
    id: String,
    rx: oneshot::Receiver<Result<Message>>,
    timeout: Duration,
    guard: PendingGuard,
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PendingResponse {
    /// Id of the request.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response, the timeout, or cancellation of the entry.
    /// The pending entry is gone when this returns.
    pub async fn wait(self) -> Result<Message> {
        let PendingResponse {
            id,
            rx,
            timeout,
            guard,
        } = self;
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MessagingError::Cancelled(id)),
            Err(_) => Err(MessagingError::ReceiveTimeout { id, timeout }),
        };
        drop(guard);
        outcome
    }
}
