//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Metrics collection and export utilities."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use fleet_net::{ConnectionState, ConnectionStatus};
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder, TEXT_FORMAT};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics` and a
/// liveness probe at `/healthz`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new()
        .route(
            "/metrics",
            get({
                let registry = registry.clone();
                move || metrics_handler(registry.clone())
            }),
        )
        .route("/healthz", get(|| async { "ok" }));

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;
    let addr = listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint. Returns `text/plain` metrics even on large registries.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address; differs from the requested one when port 0 was used.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Link health of the WebSocket proxies, labelled by proxy name.
#[derive(Clone, Debug)]
pub struct TransportMetrics {
    registry: SharedRegistry,
    connected: IntGaugeVec,
    reconnects: IntCounterVec,
    peers: IntGaugeVec,
}

impl TransportMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let connected = IntGaugeVec::new(
            Opts::new(
                "fleet_ws_connected",
                "Indicator (0/1) whether the proxy currently holds a live connection or listener",
            ),
            &["proxy"],
        )?;
        registry.register(Box::new(connected.clone()))?;

        let reconnects = IntCounterVec::new(
            Opts::new(
                "fleet_ws_reconnects_total",
                "Connections re-established after the first one",
            ),
            &["proxy"],
        )?;
        registry.register(Box::new(reconnects.clone()))?;

        let peers = IntGaugeVec::new(
            Opts::new(
                "fleet_ws_peers",
                "Edge clients currently attached to a server proxy",
            ),
            &["proxy"],
        )?;
        registry.register(Box::new(peers.clone()))?;

        Ok(Self {
            registry,
            connected,
            reconnects,
            peers,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_connected(&self, proxy: &str, connected: bool) {
        self.connected
            .with_label_values(&[proxy])
            .set(if connected { 1 } else { 0 });
    }

    pub fn record_reconnects(&self, proxy: &str, count: u64) {
        self.reconnects.with_label_values(&[proxy]).inc_by(count);
    }

    pub fn set_peers(&self, proxy: &str, count: usize) {
        self.peers.with_label_values(&[proxy]).set(count as i64);
    }

    /// Follow a proxy's status channel until the proxy goes away.
    pub fn track(
        &self,
        proxy: impl Into<String>,
        mut status: watch::Receiver<ConnectionStatus>,
    ) -> JoinHandle<()> {
        let metrics = self.clone();
        let proxy = proxy.into();
        tokio::spawn(async move {
            let mut counted = 0;
            loop {
                let current = *status.borrow_and_update();
                metrics.set_connected(&proxy, current.state == ConnectionState::Connected);
                let reconnects = current.generation.saturating_sub(1);
                if reconnects > counted {
                    metrics.record_reconnects(&proxy, reconnects - counted);
                    counted = reconnects;
                }
                if current.state == ConnectionState::Stopped || status.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

pub use prometheus;
