//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Structured message tracing and bus metrics."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use tracing::debug;

use crate::message::Message;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message enqueued on an endpoint.
    Outbound,
    /// Message taken off an endpoint.
    Inbound,
    /// Response handed to a waiting sync caller.
    Response,
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, message: &Message) {
    debug!(
        msg_id = %message.header.id,
        parent_id = %message.header.parent_id,
        source = %message.router.source,
        destination = %message.router.destination,
        option = %message.router.option,
        resource = %message.router.resource,
        is_sync = message.header.is_sync,
        direction = ?direction,
        "bus activity"
    );
}

/// Prometheus metric handles for bus activity.
#[derive(Clone)]
pub struct MessagingMetricsExporter {
    sent: IntCounter,
    received: IntCounter,
    dropped: IntCounter,
    latency: Histogram,
}

impl MessagingMetricsExporter {
    /// Register bus metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounter::with_opts(Opts::new(
            "fleet_bus_messages_sent_total",
            "Messages enqueued on bus endpoints",
        ))?;
        let received = IntCounter::with_opts(Opts::new(
            "fleet_bus_messages_received_total",
            "Messages consumed from bus endpoints",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "fleet_bus_messages_dropped_total",
            "Messages that failed to deliver",
        ))?;
        let latency = Histogram::with_opts(HistogramOpts::new(
            "fleet_bus_sync_latency_seconds",
            "Observed latency between a sync request and its response",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            sent,
            received,
            dropped,
            latency,
        })
    }

    /// Record a sent message.
    pub fn observe_sent(&self) {
        self.sent.inc();
    }

    /// Record a received message.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Record a dropped message.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Record sync round-trip latency.
    pub fn observe_latency(&self, duration: Duration) {
        self.latency.observe(duration.as_secs_f64());
    }
}
