//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "tests"
//! fleet_type: "source"
//! fleet_scope: "test"
//! fleet_description: "Bus and module manager end-to-end behaviour."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleet_common::BusConfig;
use fleet_msg::{
    serve, Bus, HandlerTable, Message, MessagingError, Module, ModuleContext, ModuleManager,
    RespMsg,
};
use serde_json::{json, Value};

fn echo_loop(bus: Bus, name: &'static str) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(req) = bus.receive(name).await {
            let mut resp = req.new_response().expect("response");
            resp.content = json!("pong");
            bus.send(resp).await.expect("respond");
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_round_trip_correlates_response() {
    let bus = Bus::default();
    bus.register("A").expect("register A");
    bus.register("B").expect("register B");
    let echo = echo_loop(bus.clone(), "B");

    let req = Message::request("A", "B", "GET", "/ping")
        .expect("request")
        .with_content(json!("ping"));
    let req_id = req.header.id.clone();
    let resp = bus
        .send_sync(req, Duration::from_secs(5))
        .await
        .expect("response");

    assert_eq!(resp.header.parent_id, req_id);
    assert_eq!(resp.router.source, "B");
    assert_eq!(resp.router.destination, "A");
    assert_eq!(resp.content, json!("pong"));
    assert!(!bus.is_pending(&req_id));

    bus.unregister("B").expect("unregister");
    echo.await.expect("echo loop exits");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_timeout_cleans_pending_entry() {
    let bus = Bus::default();
    bus.register("A").expect("register A");
    bus.register("B").expect("register B");

    let req = Message::request("A", "B", "GET", "/ping").expect("request");
    let req_id = req.header.id.clone();
    let started = Instant::now();
    let err = bus
        .send_sync(req, Duration::from_millis(100))
        .await
        .expect_err("nobody answers");
    let elapsed = started.elapsed();

    assert!(matches!(err, MessagingError::ReceiveTimeout { ref id, .. } if *id == req_id));
    assert!(elapsed >= Duration::from_millis(100), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "elapsed {elapsed:?}");
    assert!(!bus.is_pending(&req_id));
    assert_eq!(bus.pending_count(), 0);
}

#[tokio::test]
async fn stray_response_reports_no_such_pending() {
    let bus = Bus::default();
    bus.register("A").expect("register A");
    let mut stray = Message::request("B", "A", "GET", "/ping").expect("message");
    stray.header.parent_id = "never-seen".into();

    assert!(matches!(
        bus.send_resp(stray),
        Err(MessagingError::NoSuchPending(parent)) if parent == "never-seen"
    ));
    assert_eq!(bus.pending_count(), 0);
    assert!(bus.is_registered("A"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_senders_keep_their_own_order() {
    const SENDERS: usize = 4;
    const PER_SENDER: u64 = 200;

    let bus = Bus::new(BusConfig {
        endpoint_capacity: 8,
        ..BusConfig::default()
    });
    bus.register("sink").expect("register sink");

    let mut producers = Vec::new();
    for sender in 0..SENDERS {
        let bus = bus.clone();
        producers.push(tokio::spawn(async move {
            for seq in 0..PER_SENDER {
                let msg = Message::request(format!("p{sender}"), "sink", "POST", "/seq")
                    .expect("message")
                    .with_content(json!(seq));
                bus.send(msg).await.expect("send");
            }
        }));
    }

    let mut last: HashMap<String, u64> = HashMap::new();
    for _ in 0..(SENDERS as u64 * PER_SENDER) {
        let msg = bus.receive("sink").await.expect("receive");
        let seq = msg.content.as_u64().expect("sequence");
        if let Some(previous) = last.insert(msg.router.source.clone(), seq) {
            assert!(seq > previous, "out of order from {}", msg.router.source);
        }
    }
    for producer in producers {
        producer.await.expect("producer");
    }
    assert!(last.values().all(|seq| *seq == PER_SENDER - 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_responses_reach_only_one_waiter() {
    let bus = Bus::default();
    bus.register("A").expect("register A");
    bus.register("B").expect("register B");

    let responder = {
        let bus = bus.clone();
        tokio::spawn(async move {
            let req = bus.receive("B").await.expect("request");
            let first = req.new_response().expect("response");
            let second = req.new_response().expect("response");
            let delivered = bus.send(first).await.is_ok();
            let duplicate = bus.send(second).await;
            (delivered, duplicate)
        })
    };

    let req = Message::request("A", "B", "GET", "/once").expect("request");
    let req_id = req.header.id.clone();
    let resp = bus
        .send_sync(req, Duration::from_secs(2))
        .await
        .expect("response");
    assert_eq!(resp.header.parent_id, req_id);

    let (delivered, duplicate) = responder.await.expect("responder");
    assert!(delivered);
    assert!(matches!(duplicate, Err(MessagingError::NoSuchPending(_))));
}

#[test]
fn unregister_twice_has_no_other_effect() {
    let bus = Bus::default();
    bus.register("A").expect("register A");
    bus.register("B").expect("register B");
    bus.unregister("A").expect("first unregister");
    assert!(matches!(
        bus.unregister("A"),
        Err(MessagingError::NotRegistered(_))
    ));
    assert!(bus.is_registered("B"));
    bus.register("A").expect("name can be reused");
}

struct VersionModule;

#[async_trait]
impl Module for VersionModule {
    fn name(&self) -> &str {
        "edgemanager"
    }

    async fn start(&self, ctx: ModuleContext) {
        let table = HandlerTable::builder()
            .handle(
                "GET",
                "/edgemanager/v1/software/edge/version-info",
                |msg: Message| async move {
                    RespMsg::success(json!({"node": msg.header.node_id, "version": "5.0.1"}))
                },
            )
            .expect("route")
            .build();
        serve(&ctx, &table).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn module_manager_drives_registered_modules() {
    let bus = Bus::default();
    let manager = ModuleManager::new(bus.clone());
    manager
        .register(Arc::new(VersionModule))
        .expect("register module");
    bus.register("restful").expect("register caller");
    assert_eq!(manager.start(), 1);

    let req = Message::request(
        "restful",
        "edgemanager",
        "GET",
        "/edgemanager/v1/software/edge/version-info",
    )
    .expect("request")
    .with_node_id("edge-01");
    let resp = manager
        .send_sync_message(req, Duration::from_secs(2))
        .await
        .expect("response");
    let body: RespMsg = resp.parse_content().expect("resp body");
    assert!(body.is_success());
    assert_eq!(body.data["node"], Value::from("edge-01"));

    manager.shutdown(Duration::from_secs(1)).await;
    assert!(matches!(
        manager.send_message(Message::request("restful", "nowhere", "GET", "/").expect("msg")).await,
        Err(MessagingError::NoSuchEndpoint(_))
    ));
}
