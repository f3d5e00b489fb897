//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Per-module handler table and the conventional receive loop."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::bus::Bus;
use crate::message::{route_key, Message};
use crate::module::ModuleContext;
use crate::{MessagingError, Result};

/// Status codes carried in [`RespMsg::status`].
pub mod status {
    /// Handler completed.
    pub const SUCCESS: &str = "00000000";
    /// Request body could not be parsed.
    pub const PARSE_BODY: &str = "00001001";
    /// Downstream response could not be obtained.
    pub const GET_RESPONSE: &str = "00001002";
    /// A nested sync send failed.
    pub const SEND_SYNC: &str = "00001003";
    /// No handler for the option/resource pair.
    pub const RESOURCE_OPTION_NOT_FOUND: &str = "00001004";
    /// Request parameters failed validation.
    pub const PARAM_INVALID: &str = "00001005";
    /// Request parameters could not be converted.
    pub const PARAM_CONVERT: &str = "00001006";
    /// Payload had an unexpected shape.
    pub const TYPE_ASSERT: &str = "00001007";
    /// A response message could not be built.
    pub const NEW_MSG: &str = "00001008";
}

/// Handler result written into the response's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespMsg {
    /// One of the [`status`] codes.
    pub status: String,
    /// Human-readable detail.
    pub msg: String,
    /// Optional payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl RespMsg {
    /// Successful result carrying `data`.
    pub fn success(data: Value) -> Self {
        Self {
            status: status::SUCCESS.to_owned(),
            msg: String::new(),
            data,
        }
    }

    /// Failed result.
    pub fn failure(status: &str, msg: impl Into<String>) -> Self {
        Self {
            status: status.to_owned(),
            msg: msg.into(),
            data: Value::Null,
        }
    }

    /// Whether the status is [`status::SUCCESS`].
    pub fn is_success(&self) -> bool {
        self.status == status::SUCCESS
    }
}

/// Boxed async handler for one option/resource pair.
pub type HandlerFn = Arc<dyn Fn(Message) -> BoxFuture<'static, RespMsg> + Send + Sync>;

/// Collects handlers before the table is frozen.
#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerTableBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `option:resource`. Keys are unique.
    pub fn handle<F, Fut>(mut self, option: &str, resource: &str, handler: F) -> Result<Self>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RespMsg> + Send + 'static,
    {
        let key = route_key(option, resource);
        if self.handlers.contains_key(&key) {
            return Err(MessagingError::DuplicateHandler(key));
        }
        let handler: HandlerFn = Arc::new(move |msg| handler(msg).boxed());
        self.handlers.insert(key, handler);
        Ok(self)
    }

    /// Freeze the table.
    pub fn build(self) -> HandlerTable {
        HandlerTable {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Read-only `option:resource -> handler` map.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<HashMap<String, HandlerFn>>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("routes", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerTable {
    /// Start building a table.
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::new()
    }

    /// Handler for the pair, if any.
    pub fn get(&self, option: &str, resource: &str) -> Option<&HandlerFn> {
        self.handlers.get(&route_key(option, resource))
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Conventional module receive loop.
///
/// Each message is dispatched on its own task so a slow or faulting
/// handler never stalls the loop. Sync requests get a response built with
/// [`Message::new_response`] whose content is the handler's [`RespMsg`].
/// Returns when `ctx.shutdown` fires or the endpoint closes.
pub async fn serve(ctx: &ModuleContext, table: &HandlerTable) {
    while let Some(msg) = ctx.next_message().await {
        let bus = ctx.bus.clone();
        let table = table.clone();
        let module = ctx.name.clone();
        tokio::spawn(async move {
            dispatch(&module, &bus, &table, msg).await;
        });
    }
    debug!(module = %ctx.name, "dispatch loop stopped");
}

async fn dispatch(module: &str, bus: &Bus, table: &HandlerTable, msg: Message) {
    let result = match table.get(&msg.router.option, &msg.router.resource) {
        Some(handler) => {
            let handler = handler.clone();
            let request = msg.clone();
            match AssertUnwindSafe(async move { handler(request).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(
                        module = %module,
                        msg_id = %msg.header.id,
                        route = %msg.route_key(),
                        panic = %reason,
                        "handler panicked"
                    );
                    RespMsg::failure(status::GET_RESPONSE, format!("handler panicked: {reason}"))
                }
            }
        }
        None => {
            error!(
                module = %module,
                msg_id = %msg.header.id,
                route = %msg.route_key(),
                "no handler registered for route"
            );
            RespMsg::failure(
                status::RESOURCE_OPTION_NOT_FOUND,
                format!("no handler for {}", msg.route_key()),
            )
        }
    };

    if !msg.header.is_sync {
        return;
    }

    let mut resp = match msg.new_response() {
        Ok(resp) => resp,
        Err(err) => {
            error!(module = %module, msg_id = %msg.header.id, error = %err, "failed to build response");
            return;
        }
    };
    if let Err(err) = resp.fill_content(&result) {
        error!(module = %module, msg_id = %msg.header.id, error = %err, "failed to encode response");
        return;
    }
    if let Err(err) = bus.send(resp).await {
        warn!(module = %module, msg_id = %msg.header.id, error = %err, "response not delivered");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn echo_table() -> HandlerTable {
        HandlerTable::builder()
            .handle("GET", "/ping", |msg: Message| async move {
                RespMsg::success(json!({"echo": msg.content}))
            })
            .expect("ping route")
            .handle("POST", "/boom", |_msg: Message| async move {
                let nothing: Option<RespMsg> = None;
                nothing.expect("handler exploded")
            })
            .expect("boom route")
            .build()
    }

    fn context(bus: &Bus, name: &str) -> ModuleContext {
        ModuleContext {
            name: name.to_owned(),
            bus: bus.clone(),
            shutdown: CancellationToken::new(),
        }
    }

    #[test]
    fn duplicate_routes_are_rejected() {
        let err = HandlerTable::builder()
            .handle("GET", "/a", |_m: Message| async { RespMsg::success(Value::Null) })
            .expect("first")
            .handle("GET", "/a", |_m: Message| async { RespMsg::success(Value::Null) })
            .err()
            .expect("duplicate");
        assert!(matches!(err, MessagingError::DuplicateHandler(key) if key == "GET:/a"));
    }

    #[test]
    fn resp_msg_omits_null_data() {
        let encoded = serde_json::to_value(RespMsg::failure(status::PARAM_INVALID, "bad"))
            .expect("encode");
        assert_eq!(encoded, json!({"status": "00001005", "msg": "bad"}));
        assert!(RespMsg::success(json!(1)).is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serve_answers_sync_requests() {
        let bus = Bus::default();
        bus.register("caller").expect("register");
        bus.register("svc").expect("register");
        let ctx = context(&bus, "svc");
        let table = echo_table();
        let loop_ctx = ctx.clone();
        let server = tokio::spawn(async move { serve(&loop_ctx, &table).await });

        let req = Message::request("caller", "svc", "GET", "/ping")
            .expect("msg")
            .with_content(json!("ping"));
        let resp = bus
            .send_sync(req, Duration::from_secs(2))
            .await
            .expect("response");
        let body: RespMsg = resp.parse_content().expect("resp msg");
        assert!(body.is_success());
        assert_eq!(body.data, json!({"echo": "ping"}));

        ctx.shutdown.cancel();
        server.await.expect("loop exits");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_handler_does_not_stop_the_loop() {
        let bus = Bus::default();
        bus.register("caller").expect("register");
        bus.register("svc").expect("register");
        let ctx = context(&bus, "svc");
        let table = echo_table();
        let loop_ctx = ctx.clone();
        let server = tokio::spawn(async move { serve(&loop_ctx, &table).await });

        let boom = Message::request("caller", "svc", "POST", "/boom").expect("msg");
        let resp = bus
            .send_sync(boom, Duration::from_secs(2))
            .await
            .expect("failure response");
        let body: RespMsg = resp.parse_content().expect("resp msg");
        assert_eq!(body.status, status::GET_RESPONSE);

        let ping = Message::request("caller", "svc", "GET", "/ping").expect("msg");
        let resp = bus
            .send_sync(ping, Duration::from_secs(2))
            .await
            .expect("loop still serving");
        assert!(resp
            .parse_content::<RespMsg>()
            .expect("resp msg")
            .is_success());

        ctx.shutdown.cancel();
        server.await.expect("loop exits");
    }

    #[tokio::test]
    async fn unknown_route_gets_not_found_status() {
        let bus = Bus::default();
        bus.register("caller").expect("register");
        bus.register("svc").expect("register");
        let ctx = context(&bus, "svc");
        let table = echo_table();
        let loop_ctx = ctx.clone();
        let server = tokio::spawn(async move { serve(&loop_ctx, &table).await });

        let req = Message::request("caller", "svc", "DELETE", "/nodes").expect("msg");
        let resp = bus
            .send_sync(req, Duration::from_secs(2))
            .await
            .expect("response");
        let body: RespMsg = resp.parse_content().expect("resp msg");
        assert_eq!(body.status, status::RESOURCE_OPTION_NOT_FOUND);

        bus.unregister("svc").expect("unregister");
        server.await.expect("loop exits on close");
    }
}
