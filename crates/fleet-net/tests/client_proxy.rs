//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "tests"
//! fleet_type: "source"
//! fleet_scope: "test"
//! fleet_description: "Client proxy behaviour against a scripted TLS peer."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use fleet_msg::{Bus, Message, MessagingError};
use fleet_net::{
    ConnectionState, ConnectionStatus, ProxyConfig, RouteTable, TlsAssets, TransportError,
    WsClientProxy, WsMessage,
};
use fleet_testharness::{PeerStep, ScriptedPeer, TestPki};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;

fn client_tls(pki: &TestPki) -> Arc<rustls::ClientConfig> {
    TlsAssets::from_pem(
        pki.ca_pem.as_bytes(),
        pki.client_cert_pem.as_bytes(),
        pki.client_key_pem.as_bytes(),
    )
    .expect("client assets")
    .client_config()
    .expect("client config")
}

fn config_for(peer: &ScriptedPeer) -> ProxyConfig {
    ProxyConfig::new("cloudhub", "127.0.0.1", peer.port())
        .with_client_name("edge-01")
        .with_retry(5, Duration::from_millis(100))
        .with_heartbeat(Duration::from_millis(200), Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_millis(500))
}

async fn wait_for(
    rx: &mut watch::Receiver<ConnectionStatus>,
    reached: impl Fn(&ConnectionStatus) -> bool,
) -> ConnectionStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = *rx.borrow_and_update();
            if reached(&status) {
                return status;
            }
            rx.changed().await.expect("proxy alive");
        }
    })
    .await
    .expect("state reached in time")
}

fn frame_for(option: &str, resource: &str) -> String {
    let msg = Message::request("cloudhub", "edgehub", option, resource)
        .expect("msg")
        .with_content(json!({"probe": resource}));
    String::from_utf8(msg.encode().expect("encode")).expect("utf8")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_after_the_peer_drops() {
    let pki = TestPki::generate().expect("pki");
    let peer = ScriptedPeer::start(&pki, |index| {
        if index == 0 {
            vec![PeerStep::Sleep(Duration::from_secs(1))]
        } else {
            vec![PeerStep::Hold]
        }
    })
    .await
    .expect("peer");
    let proxy = WsClientProxy::new(config_for(&peer), client_tls(&pki), Bus::default());
    let mut status = proxy.subscribe();

    proxy.start().await.expect("start");
    assert!(proxy.is_connected());
    assert_eq!(proxy.status().generation, 1);

    wait_for(&mut status, |s| s.state != ConnectionState::Connected).await;
    let back = wait_for(&mut status, |s| {
        s.state == ConnectionState::Connected && s.generation >= 2
    })
    .await;
    assert_eq!(back.generation, 2);
    assert!(peer.accepted() >= 2);

    proxy.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversize_frame_closes_and_redials() {
    let pki = TestPki::generate().expect("pki");
    let peer = ScriptedPeer::start(&pki, |index| {
        if index == 0 {
            vec![
                PeerStep::Sleep(Duration::from_millis(100)),
                PeerStep::SendText("x".repeat(2 * 1024 * 1024)),
                PeerStep::Hold,
            ]
        } else {
            vec![PeerStep::Hold]
        }
    })
    .await
    .expect("peer");
    let proxy = WsClientProxy::new(config_for(&peer), client_tls(&pki), Bus::default());
    let mut status = proxy.subscribe();

    proxy.start().await.expect("start");
    let back = wait_for(&mut status, |s| {
        s.state == ConnectionState::Connected && s.generation >= 2
    })
    .await;
    assert_eq!(back.generation, 2);
    assert_eq!(peer.accepted(), 2);

    proxy.stop().await.expect("stop");
}

/// Collects formatted log output of the current thread.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// Single-threaded so every task logs through the thread-local subscriber.
#[tokio::test]
async fn unknown_route_is_dropped_without_closing() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let pki = TestPki::generate().expect("pki");
    let unknown = frame_for("DELETE", "/nothing");
    let known = frame_for("PUT", "/nodes");
    let peer = ScriptedPeer::start(&pki, move |_| {
        vec![
            PeerStep::Sleep(Duration::from_millis(100)),
            PeerStep::SendText(unknown.clone()),
            PeerStep::SendText(known.clone()),
            PeerStep::Hold,
        ]
    })
    .await
    .expect("peer");

    let bus = Bus::default();
    bus.register("nodemanager").expect("register module");
    let routes = RouteTable::new()
        .route("PUT", "/nodes", "nodemanager")
        .expect("route");
    let proxy = WsClientProxy::new(
        config_for(&peer).with_routes(routes),
        client_tls(&pki),
        bus.clone(),
    );
    proxy.start().await.expect("start");

    let delivered = tokio::time::timeout(Duration::from_secs(5), bus.receive("nodemanager"))
        .await
        .expect("delivered in time")
        .expect("delivered");
    assert_eq!(delivered.router.source, "cloudhub");
    assert_eq!(delivered.router.resource, "/nodes");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        proxy.status(),
        ConnectionStatus {
            state: ConnectionState::Connected,
            generation: 1
        }
    );

    let errors: Vec<String> = logs
        .lines()
        .into_iter()
        .filter(|line| line.contains("ERROR"))
        .collect();
    assert_eq!(errors.len(), 1, "error records: {errors:?}");
    assert!(errors[0].contains("DELETE:/nothing"));
    assert!(peer.received().is_empty());

    proxy.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_sent_during_a_reconnect_are_flushed() {
    let pki = TestPki::generate().expect("pki");
    let peer = ScriptedPeer::start(&pki, |index| {
        if index == 0 {
            vec![PeerStep::Sleep(Duration::from_millis(300))]
        } else {
            vec![
                PeerStep::DelayHandshake(Duration::from_secs(1)),
                PeerStep::Hold,
            ]
        }
    })
    .await
    .expect("peer");
    let proxy = WsClientProxy::new(config_for(&peer), client_tls(&pki), Bus::default());
    let mut status = proxy.subscribe();
    proxy.start().await.expect("start");

    wait_for(&mut status, |s| s.state == ConnectionState::Connecting).await;
    let msg = Message::request("edgemanager", "cloudhub", "POST", "/status")
        .expect("msg")
        .with_content(json!({"healthy": true}));
    proxy.send_message(&msg).expect("buffered");
    assert_eq!(proxy.backlog_len(), 1);
    assert!(matches!(
        proxy.send(WsMessage::Text("raw".into())),
        Err(TransportError::NotConnected(_))
    ));

    wait_for(&mut status, |s| {
        s.state == ConnectionState::Connected && s.generation == 2
    })
    .await;
    assert_eq!(proxy.backlog_len(), 0);

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(text) = peer.received().into_iter().next() {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("flushed frame reaches the peer");
    let decoded = Message::decode(delivered.as_bytes()).expect("decode");
    assert_eq!(decoded.header.id, msg.header.id);

    proxy.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backlog_overflow_cancels_the_oldest_sync_caller() {
    let pki = TestPki::generate().expect("pki");
    let peer = ScriptedPeer::start(&pki, |index| {
        if index == 0 {
            vec![PeerStep::Sleep(Duration::from_millis(300))]
        } else {
            vec![
                PeerStep::DelayHandshake(Duration::from_secs(2)),
                PeerStep::Hold,
            ]
        }
    })
    .await
    .expect("peer");
    let bus = Bus::default();
    let proxy = WsClientProxy::new(
        config_for(&peer).with_backlog_limit(1),
        client_tls(&pki),
        bus.clone(),
    );
    let mut status = proxy.subscribe();
    proxy.start().await.expect("start");
    wait_for(&mut status, |s| s.state == ConnectionState::Connecting).await;

    let sync_call = |resource: &'static str| {
        let bus = bus.clone();
        tokio::spawn(async move {
            let req = Message::request("edgemanager", "cloudhub", "GET", resource).expect("msg");
            bus.send_sync(req, Duration::from_secs(10)).await
        })
    };
    let oldest = sync_call("/first");
    tokio::time::timeout(Duration::from_secs(5), async {
        while proxy.backlog_len() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first request buffered");
    let newest = sync_call("/second");

    let outcome = tokio::time::timeout(Duration::from_secs(5), oldest)
        .await
        .expect("oldest caller released")
        .expect("join");
    assert!(matches!(outcome, Err(MessagingError::Cancelled(_))));
    assert_eq!(proxy.backlog_len(), 1);
    assert_eq!(bus.pending_count(), 1);

    proxy.stop().await.expect("stop");
    let outcome = tokio::time::timeout(Duration::from_secs(5), newest)
        .await
        .expect("newest caller released")
        .expect("join");
    assert!(outcome.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bus_messages_reach_the_peer_with_the_client_name_header() {
    let pki = TestPki::generate().expect("pki");
    let peer = ScriptedPeer::start(&pki, |_| vec![PeerStep::Hold])
        .await
        .expect("peer");
    let bus = Bus::default();
    let proxy = WsClientProxy::new(config_for(&peer), client_tls(&pki), bus.clone());
    proxy.start().await.expect("start");
    assert!(bus.is_registered("cloudhub"));

    let msg = Message::request("edgemanager", "cloudhub", "POST", "/status").expect("msg");
    bus.send(msg.clone()).await.expect("enqueue");

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(text) = peer.received().into_iter().next() {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("forwarded");
    assert_eq!(
        Message::decode(delivered.as_bytes())
            .expect("decode")
            .header
            .id,
        msg.header.id
    );

    let handshakes = peer.handshakes();
    assert!(handshakes[0]
        .iter()
        .any(|(name, value)| name == "clientname" && value == "edge-01"));

    proxy.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_releases_everything_and_is_idempotent() {
    let pki = TestPki::generate().expect("pki");
    let peer = ScriptedPeer::start(&pki, |_| vec![PeerStep::Hold])
        .await
        .expect("peer");
    let bus = Bus::default();
    let proxy = WsClientProxy::new(config_for(&peer), client_tls(&pki), bus.clone());
    proxy.start().await.expect("start");
    assert!(matches!(
        proxy.start().await,
        Err(TransportError::AlreadyStarted(_))
    ));

    proxy.stop().await.expect("stop");
    proxy.stop().await.expect("second stop");
    assert_eq!(proxy.status().state, ConnectionState::Stopped);
    assert!(!bus.is_registered("cloudhub"));
    assert!(matches!(
        proxy.send(WsMessage::Text("late".into())),
        Err(TransportError::NotConnected(_))
    ));
    let msg = Message::request("edgemanager", "cloudhub", "POST", "/status").expect("msg");
    assert!(matches!(
        proxy.send_message(&msg),
        Err(TransportError::NotConnected(_))
    ));
}
