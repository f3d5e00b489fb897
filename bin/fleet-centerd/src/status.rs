//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "binary"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Built-in module answering peer and link queries over the bus."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use async_trait::async_trait;
use fleet_msg::{serve, status, HandlerTable, Message, Module, ModuleContext, RespMsg};
use fleet_net::WsServerProxy;
use serde_json::json;
use tracing::warn;

pub const MODULE_NAME: &str = "fleetstatus";

/// Answers `GET /peers` and `GET /status` for the local server proxy.
///
/// Edge nodes reach it through a `[[websocket.routes]]` entry pointing at
/// `fleetstatus`.
pub struct FleetStatusModule {
    table: HandlerTable,
}

impl FleetStatusModule {
    pub fn new(server: WsServerProxy) -> fleet_msg::Result<Self> {
        let peers_server = server.clone();
        let table = HandlerTable::builder()
            .handle("GET", "/peers", move |_msg: Message| {
                let server = peers_server.clone();
                async move {
                    match serde_json::to_value(server.peers()) {
                        Ok(peers) => RespMsg::success(peers),
                        Err(err) => {
                            warn!(error = %err, "failed to encode peer list");
                            RespMsg::failure(status::GET_RESPONSE, err.to_string())
                        }
                    }
                }
            })?
            .handle("GET", "/status", move |_msg: Message| {
                let server = server.clone();
                async move {
                    let current = server.status();
                    RespMsg::success(json!({
                        "proxy": server.name(),
                        "state": current.state.as_str(),
                        "generation": current.generation,
                        "peers": server.peers().len(),
                    }))
                }
            })?
            .build();
        Ok(Self { table })
    }
}

#[async_trait]
impl Module for FleetStatusModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    async fn start(&self, ctx: ModuleContext) {
        serve(&ctx, &self.table).await;
    }
}
