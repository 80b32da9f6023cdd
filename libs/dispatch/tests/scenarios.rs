//! End-to-end dispatcher scenarios: request/reply, routing failures,
//! timeouts, orphans, validation and event fan-out

mod common;

use common::*;
use dispatch_core::{codes, DispatchConfig, Inbound, Kind, Message};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[tokio::test]
async fn test_memory_set_gets_exact_reply() {
    let (mut dispatcher, mut egress) = boot(DispatchConfig::default(), vec![memory_capability()]);

    dispatcher.submit_json(SET_C1);
    dispatcher.run_until_idle().await;

    let expected = Message::new(Kind::Reply, "Memory.Set", json!({"success": true}))
        .with_id("r1")
        .with_timestamp(1001)
        .with_causation("c1");

    let out = drain(&mut egress);
    assert_eq!(out.len(), 1);
    assert_eq!(*out[0], expected);
    assert!(!dispatcher.is_correlation_live("c1"));

    let stats = dispatcher.stats();
    assert_eq!(stats.live_correlations, 0);
    assert_eq!(stats.pending_timers, 0);
    assert_eq!(stats.counters.dispatched_requests, 1);
    assert_eq!(stats.counters.resolved, 1);
    assert_eq!(stats.actors["memory"].messages_processed, 1);
}

#[tokio::test]
async fn test_reply_survives_wire_round_trip() {
    let (mut dispatcher, mut egress) = boot(DispatchConfig::default(), vec![memory_capability()]);
    dispatcher.submit_json(SET_C1);
    dispatcher.run_until_idle().await;

    let reply = drain(&mut egress).pop().unwrap();
    let text = reply.to_json().unwrap();
    assert!(!text.contains("timeout"));
    assert_eq!(Message::from_json(&text).unwrap(), *reply);
}

#[tokio::test]
async fn test_unrouted_command_yields_single_routing_error() {
    let (mut dispatcher, mut egress) = boot(DispatchConfig::default(), vec![memory_capability()]);

    let command = Message::command("Billing.Charge", json!({"amount": 10})).with_id("b1");
    dispatcher.submit(command);
    dispatcher.run_until_idle().await;

    let out = drain(&mut egress);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind(), Kind::Error);
    assert_eq!(out[0].error_code(), Some(codes::ROUTING_ERROR));
    assert_eq!(out[0].causation(), Some("b1"));

    let stats = dispatcher.stats();
    assert!(!dispatcher.is_correlation_live("b1"));
    assert_eq!(stats.counters.routing_failures, 1);
    assert_eq!(stats.counters.dispatched_requests, 0);
    assert_eq!(stats.counters.system_processed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_late_reply_is_orphan() {
    let (mut dispatcher, mut egress) = boot(DispatchConfig::default(), vec![memory_capability()]);
    let start = Instant::now();

    let slow = Message::command("Memory.Slow", json!({"delay_ms": 200}))
        .with_id("s1")
        .with_timeout(50);
    dispatcher.submit(slow);
    dispatcher.run_until_idle().await;

    let out = drain(&mut egress);
    let outcomes = outcomes_for(&out, "s1");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].error_code(), Some(codes::TIMEOUT));
    assert!(Instant::now() - start >= Duration::from_millis(200));

    let stats = dispatcher.stats();
    assert_eq!(stats.counters.timeouts, 1);
    assert_eq!(stats.counters.orphans, 1);
    assert_eq!(stats.recent_orphans, vec!["rs1".to_string()]);
    assert_eq!(stats.live_correlations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_never_fires_early() {
    let (mut dispatcher, mut egress) = boot(DispatchConfig::default(), vec![memory_capability()]);

    let slow = Message::command("Memory.Slow", json!({"delay_ms": 1_000}))
        .with_id("s2")
        .with_timeout(50);
    dispatcher.submit(slow);
    dispatcher.turn();

    tokio::time::advance(Duration::from_millis(49)).await;
    dispatcher.turn();
    assert!(drain(&mut egress).is_empty());
    assert!(dispatcher.is_correlation_live("s2"));

    tokio::time::advance(Duration::from_millis(1)).await;
    let report = dispatcher.turn();
    assert_eq!(report.timers_fired, 1);
    let out = drain(&mut egress);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].error_code(), Some(codes::TIMEOUT));
    assert_eq!(out[0].causation(), Some("s2"));
}

#[tokio::test]
async fn test_every_request_resolves_exactly_once() {
    let (mut dispatcher, mut egress) = boot(DispatchConfig::default(), vec![memory_capability()]);

    for i in 0..20 {
        let msg_type = if i % 4 == 0 { "Memory.Unknown" } else { "Memory.Set" };
        dispatcher.submit(Message::command(msg_type, json!({"key": format!("k{}", i)})).with_id(format!("c{}", i)));
    }
    dispatcher.run_until_idle().await;

    let out = drain(&mut egress);
    for i in 0..20 {
        let id = format!("c{}", i);
        let outcomes = outcomes_for(&out, &id);
        assert_eq!(outcomes.len(), 1, "request {} resolved {} times", id, outcomes.len());
        if i % 4 == 0 {
            assert_eq!(outcomes[0].error_code(), Some(codes::ROUTING_ERROR));
        } else {
            assert_eq!(outcomes[0].kind(), Kind::Reply);
        }
    }
    assert_eq!(dispatcher.stats().live_correlations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_live_request_id_is_rejected() {
    let (mut dispatcher, mut egress) = boot(DispatchConfig::default(), vec![memory_capability()]);
    let slow = || Message::command("Memory.Slow", json!({"delay_ms": 50})).with_id("s1");

    dispatcher.submit(slow());
    dispatcher.submit(slow());
    // Both items are taken before the first reply can arrive
    dispatcher.turn();
    dispatcher.turn();
    assert!(dispatcher.is_correlation_live("s1"));
    dispatcher.run_until_idle().await;

    let out = drain(&mut egress);
    let outcomes = outcomes_for(&out, "s1");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].kind(), Kind::Reply);

    let rejected: Vec<_> = out
        .iter()
        .filter(|m| m.error_code() == Some(codes::VALIDATION_ERROR))
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].causation(), None);
    assert!(rejected[0].data()["message"].as_str().unwrap().contains("s1"));

    let stats = dispatcher.stats();
    assert_eq!(stats.counters.dispatched_requests, 1);
    assert_eq!(stats.live_correlations, 0);
    assert!(!stats.actors["memory"].processing);
}

#[tokio::test]
async fn test_invalid_items_become_validation_errors() {
    let config = DispatchConfig {
        max_message_bytes: 512,
        ..DispatchConfig::default()
    };
    let (mut dispatcher, mut egress) = boot(config, vec![memory_capability()]);

    dispatcher.submit_json("{not json");
    dispatcher.submit_json(r#"{"kind":"shout","type":"Memory.Set","data":{},"metadata":{"id":"v1","timestamp":1}}"#);
    dispatcher.submit(Message::command("memory.set", json!({})).with_id("v2"));
    dispatcher.submit(Message::command("Memory.Set", json!({"key": "big", "value": "x".repeat(1024)})).with_id("v3"));
    dispatcher.run_until_idle().await;

    let out = drain(&mut egress);
    assert_eq!(out.len(), 4);
    assert!(out.iter().all(|m| m.error_code() == Some(codes::VALIDATION_ERROR)));
    let causations: Vec<_> = out.iter().map(|m| m.causation()).collect();
    assert_eq!(causations, vec![None, Some("v1"), Some("v2"), Some("v3")]);

    let stats = dispatcher.stats();
    assert_eq!(stats.counters.validation_failures, 4);
    assert_eq!(stats.counters.dispatched_requests, 0);
}

#[tokio::test]
async fn test_events_fan_out_to_subscribers_and_egress() {
    let seen = Arc::new(AtomicUsize::new(0));
    let (mut dispatcher, mut egress) = boot(
        DispatchConfig::default(),
        vec![memory_capability(), audit_capability(Arc::clone(&seen))],
    );

    dispatcher.submit_json(SET_C1);
    dispatcher.submit(Message::command("Memory.Delete", json!({"key": "a"})).with_id("d1"));
    dispatcher.run_until_idle().await;

    let out = drain(&mut egress);
    let delete = outcomes_for(&out, "d1");
    assert_eq!(delete.len(), 1);
    assert_eq!(delete[0].data()["removed"], true);

    let changed: Vec<_> = out.iter().filter(|m| m.msg_type() == "Memory.Changed").collect();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].kind(), Kind::Event);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.stats().counters.delivered_events, 1);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_command_dispatches_after_delay() {
    let (mut dispatcher, mut egress) = boot(DispatchConfig::default(), vec![memory_capability()]);
    let start = Instant::now();

    dispatcher.schedule(
        Duration::from_millis(250),
        Message::command("Memory.Set", json!({"key": "later"})).with_id("c9"),
    );
    dispatcher.run_until_idle().await;

    let out = drain(&mut egress);
    assert_eq!(outcomes_for(&out, "c9").len(), 1);
    assert!(Instant::now() - start >= Duration::from_millis(250));
}

#[tokio::test]
async fn test_run_loop_drains_ingress_until_closed() {
    let (mut dispatcher, mut egress) = boot(DispatchConfig::default(), vec![memory_capability()]);
    let (tx, rx) = mpsc::unbounded_channel();

    tx.send(Inbound::Raw(SET_C1.to_string())).unwrap();
    tx.send(Inbound::Message(
        Message::command("Memory.Get", json!({"key": "a"})).with_id("c2"),
    ))
    .unwrap();
    drop(tx);

    dispatcher.run(rx, std::future::pending()).await;

    let out = drain(&mut egress);
    let get = outcomes_for(&out, "c2");
    assert_eq!(outcomes_for(&out, "c1").len(), 1);
    assert_eq!(get.len(), 1);
    assert_eq!(get[0].data()["value"], "b");
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown_signal() {
    let (mut dispatcher, _egress) = boot(DispatchConfig::default(), vec![memory_capability()]);
    let (_tx, rx) = mpsc::unbounded_channel::<Inbound>();

    tokio::time::timeout(Duration::from_secs(5), dispatcher.run(rx, async {}))
        .await
        .expect("run loop should stop on shutdown");
}
