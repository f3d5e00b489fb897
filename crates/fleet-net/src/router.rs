//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Route table and inbound frame dispatch onto the bus."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use fleet_logging::{fleet_debug, fleet_error, fleet_warn, log_operation, LogContext, Outcome};
use fleet_msg::{route_key, Bus, Message, MessagingError, PendingResponse};

use crate::config::ProxyConfig;
use crate::error::{Result, TransportError};
use crate::wire::{FrameSender, WsMessage};

/// `option:resource -> module` map consulted for every inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: HashMap<String, String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route; each option/resource pair maps to one module.
    pub fn insert(&mut self, option: &str, resource: &str, module: &str) -> Result<()> {
        let key = route_key(option, resource);
        if self.routes.contains_key(&key) {
            return Err(TransportError::DuplicateRoute(key));
        }
        self.routes.insert(key, module.to_owned());
        Ok(())
    }

    /// Builder form of [`RouteTable::insert`].
    pub fn route(mut self, option: &str, resource: &str, module: &str) -> Result<Self> {
        self.insert(option, resource, module)?;
        Ok(self)
    }

    pub fn lookup(&self, option: &str, resource: &str) -> Option<&str> {
        self.routes
            .get(&route_key(option, resource))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// What became of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Request handed to `module`.
    Dispatched { module: String },
    /// Response handed to the local sync caller.
    Response,
    /// Frame logged and discarded; the connection stays up.
    Dropped,
}

/// Turns inbound frames into bus traffic for one proxy.
///
/// Requests are re-addressed from the proxy's endpoint to the module named by
/// the route table. Responses bypass the table and complete the local sync
/// call they answer. Sync requests from the peer are parked on the bus and
/// their answer is written back over the same connection.
#[derive(Debug)]
pub struct HandlerRouter {
    config: Arc<ProxyConfig>,
    bus: Bus,
    stamp_node_id: bool,
}

impl HandlerRouter {
    /// Router for a client proxy.
    pub fn new(config: Arc<ProxyConfig>, bus: Bus) -> Self {
        Self {
            config,
            bus,
            stamp_node_id: false,
        }
    }

    /// Router for a server proxy; inbound messages carry the client's name in
    /// `header.node_id` so replies can be addressed back to it.
    pub fn for_server(config: Arc<ProxyConfig>, bus: Bus) -> Self {
        Self {
            config,
            bus,
            stamp_node_id: true,
        }
    }

    pub async fn route(&self, peer: &str, payload: &[u8], reply: &FrameSender) -> RouteOutcome {
        let endpoint = self.config.name.as_str();
        let mut msg = match Message::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                let ctx = LogContext::new().with_endpoint(endpoint).with_peer(peer);
                let reason = TransportError::DecodeFailed(err.to_string());
                log_operation(Some(&ctx), "ws.frame", &reason.to_string(), Outcome::Dropped);
                return RouteOutcome::Dropped;
            }
        };
        if self.stamp_node_id {
            msg.header.node_id = peer.to_owned();
        }

        if msg.is_response() {
            return match self.bus.send_resp(msg) {
                Ok(()) => RouteOutcome::Response,
                Err(err) => {
                    fleet_debug!(
                        context = LogContext::new().with_endpoint(endpoint).with_peer(peer),
                        "response dropped: {}",
                        err
                    );
                    RouteOutcome::Dropped
                }
            };
        }

        let Some(module) = self
            .config
            .routes
            .lookup(&msg.router.option, &msg.router.resource)
            .map(str::to_owned)
        else {
            fleet_error!(
                context = LogContext::new()
                    .with_endpoint(endpoint)
                    .with_peer(peer)
                    .with_msg_id(&msg.header.id),
                "no handler for {}; frame dropped",
                msg.route_key()
            );
            return RouteOutcome::Dropped;
        };

        let option = std::mem::take(&mut msg.router.option);
        let resource = std::mem::take(&mut msg.router.resource);
        msg.set_route(endpoint, module.clone(), option, resource);

        if msg.header.is_sync {
            match self.bus.begin_sync(msg, self.config.sync_timeout).await {
                Ok(pending) => {
                    tokio::spawn(answer_peer(
                        pending,
                        reply.clone(),
                        self.config.name.clone(),
                        peer.to_owned(),
                    ));
                }
                Err(err) => {
                    self.dropped(peer, &module, &err);
                    return RouteOutcome::Dropped;
                }
            }
        } else if let Err(err) = self.bus.send(msg).await {
            self.dropped(peer, &module, &err);
            return RouteOutcome::Dropped;
        }
        RouteOutcome::Dispatched { module }
    }

    fn dropped(&self, peer: &str, module: &str, err: &MessagingError) {
        let ctx = LogContext::new()
            .with_endpoint(&self.config.name)
            .with_peer(peer);
        log_operation(
            Some(&ctx),
            "ws.dispatch",
            &format!("delivery to '{module}' failed: {err}"),
            Outcome::Dropped,
        );
    }
}

/// Write the local module's answer to a peer's sync request back to the peer.
async fn answer_peer(pending: PendingResponse, reply: FrameSender, endpoint: String, peer: String) {
    let request_id = pending.id().to_owned();
    let ctx = LogContext::new()
        .with_endpoint(&endpoint)
        .with_peer(&peer)
        .with_msg_id(&request_id);
    let resp = match pending.wait().await {
        Ok(resp) => resp,
        Err(err) => {
            fleet_warn!(context = ctx, "no local answer for remote request: {}", err);
            return;
        }
    };
    let sent = WsMessage::from_message(&resp).and_then(|frame| reply.send(frame));
    if let Err(err) = sent {
        log_operation(
            Some(&ctx),
            "ws.reply",
            &format!("response not written: {err}"),
            Outcome::Dropped,
        );
    }
}
