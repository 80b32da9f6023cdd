//! Actor faults, bounded restarts, quarantine and operator clear

mod common;

use common::*;
use dispatch_core::{codes, HandlerId, Kind, Message};
use serde_json::json;

fn crash(id: &str) -> Message {
    Message::command("Memory.Crash", json!({})).with_id(id)
}

fn set(id: &str) -> Message {
    Message::command("Memory.Set", json!({"key": "a", "value": "b"})).with_id(id)
}

#[tokio::test]
async fn test_panic_reports_fault_and_respawns() {
    let (mut dispatcher, mut egress) = boot(test_config(3), vec![memory_capability()]);

    dispatcher.submit(crash("k1"));
    dispatcher.run_until_idle().await;

    let out = drain(&mut egress);
    let notice = out
        .iter()
        .find(|m| m.msg_type() == "System.ActorFault")
        .expect("fault notice");
    assert_eq!(notice.kind(), Kind::Event);
    assert_eq!(notice.data()["handler"], "memory");
    assert_eq!(notice.data()["category"], "panic");
    assert_eq!(notice.data()["directive"], "restart");
    assert_eq!(notice.causation(), Some("k1"));

    let outcomes = outcomes_for(&out, "k1");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].error_code(), Some(codes::ACTOR_FAULT));
    assert_eq!(outcomes[0].data()["handler"], "memory");

    assert!(out.iter().any(|m| m.msg_type() == "System.ActorRespawned"));

    let stats = dispatcher.stats();
    assert_eq!(stats.counters.actor_faults, 1);
    assert_eq!(stats.counters.respawns, 1);
    assert_eq!(stats.actors["memory"].faults, 1);
    assert!(stats.actors["memory"].healthy);

    // Scheduler kept running and the fresh instance serves requests
    dispatcher.submit(set("c1"));
    dispatcher.run_until_idle().await;
    let out = drain(&mut egress);
    let reply = outcomes_for(&out, "c1");
    assert_eq!(reply.len(), 1);
    assert_eq!(reply[0].kind(), Kind::Reply);
    assert_eq!(reply[0].id(), "r1");
}

#[tokio::test]
async fn test_declared_error_is_a_fault() {
    let (mut dispatcher, mut egress) = boot(test_config(3), vec![memory_capability()]);

    // Missing key makes the handler return an error
    dispatcher.submit(Message::command("Memory.Get", json!({})).with_id("g1"));
    dispatcher.run_until_idle().await;

    let out = drain(&mut egress);
    let outcomes = outcomes_for(&out, "g1");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].error_code(), Some(codes::ACTOR_FAULT));
    let notice = out.iter().find(|m| m.msg_type() == "System.ActorFault").unwrap();
    assert_eq!(notice.data()["category"], "handler_error");
}

#[tokio::test]
async fn test_budget_exhaustion_quarantines_until_cleared() {
    let (mut dispatcher, mut egress) = boot(test_config(1), vec![memory_capability()]);
    let memory = HandlerId::new("memory");

    dispatcher.submit(crash("k1"));
    dispatcher.run_until_idle().await;
    assert!(dispatcher.is_healthy(&memory));

    dispatcher.submit(crash("k2"));
    dispatcher.run_until_idle().await;
    assert!(!dispatcher.is_healthy(&memory));

    let out = drain(&mut egress);
    let quarantine = out
        .iter()
        .filter(|m| m.msg_type() == "System.ActorFault")
        .last()
        .unwrap();
    assert_eq!(quarantine.data()["directive"], "quarantine");
    assert_eq!(outcomes_for(&out, "k2")[0].error_code(), Some(codes::ACTOR_FAULT));

    let stats = dispatcher.stats();
    assert_eq!(stats.unhealthy, vec!["memory".to_string()]);
    assert_eq!(stats.counters.quarantines, 1);
    assert!(!stats.actors["memory"].healthy);

    // Routes fail fast while quarantined
    dispatcher.submit(set("c1"));
    dispatcher.run_until_idle().await;
    let out = drain(&mut egress);
    let outcomes = outcomes_for(&out, "c1");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].error_code(), Some(codes::HANDLER_UNHEALTHY));
    assert_eq!(outcomes[0].data()["handler"], "memory");
    assert!(!dispatcher.is_correlation_live("c1"));

    assert!(dispatcher.clear_unhealthy(&memory));
    assert!(!dispatcher.clear_unhealthy(&memory));

    dispatcher.submit(set("c2"));
    dispatcher.run_until_idle().await;
    let out = drain(&mut egress);
    let outcomes = outcomes_for(&out, "c2");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].kind(), Kind::Reply);
}

#[tokio::test]
async fn test_subscriber_faults_follow_the_same_budget() {
    let (mut dispatcher, mut egress) = boot(test_config(1), vec![faulty_subscriber_capability()]);
    let faulty = HandlerId::new("faulty");

    dispatcher.submit(Message::event("Memory.Changed", json!({"n": 1})));
    dispatcher.run_until_idle().await;
    assert!(dispatcher.is_healthy(&faulty));

    dispatcher.submit(Message::event("Memory.Changed", json!({"n": 2})));
    dispatcher.run_until_idle().await;
    assert!(!dispatcher.is_healthy(&faulty));

    let out = drain(&mut egress);
    let directives: Vec<_> = out
        .iter()
        .filter(|m| m.msg_type() == "System.ActorFault")
        .map(|m| m.data()["directive"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(directives, vec!["restart", "quarantine"]);
    // Events own no correlation, so no error outcome is emitted
    assert!(out.iter().all(|m| m.error_code() != Some(codes::ACTOR_FAULT)));
    assert_eq!(out.iter().filter(|m| m.msg_type() == "Memory.Changed").count(), 2);

    // Quarantined subscribers are skipped; the event still reaches egress
    dispatcher.submit(Message::event("Memory.Changed", json!({"n": 3})));
    dispatcher.run_until_idle().await;
    let out = drain(&mut egress);
    assert_eq!(out.iter().filter(|m| m.msg_type() == "Memory.Changed").count(), 1);
    assert!(out.iter().all(|m| m.msg_type() != "System.ActorFault"));

    let stats = dispatcher.stats();
    assert_eq!(stats.counters.actor_faults, 2);
    assert_eq!(stats.counters.quarantines, 1);
    assert_eq!(stats.unhealthy, vec!["faulty".to_string()]);
}

#[tokio::test]
async fn test_clear_request_on_control_lane() {
    let (mut dispatcher, mut egress) = boot(test_config(0), vec![memory_capability()]);
    let memory = HandlerId::new("memory");

    dispatcher.submit(crash("k1"));
    dispatcher.run_until_idle().await;
    assert!(!dispatcher.is_healthy(&memory));

    dispatcher.submit(Message::event("System.ClearUnhealthy", json!({"handler": "memory"})));
    dispatcher.submit(set("c1"));
    dispatcher.run_until_idle().await;

    assert!(dispatcher.is_healthy(&memory));
    let out = drain(&mut egress);
    assert_eq!(outcomes_for(&out, "c1")[0].kind(), Kind::Reply);
    // Control requests are consumed by the core, never published
    assert!(out.iter().all(|m| m.msg_type() != "System.ClearUnhealthy"));
}

#[tokio::test]
async fn test_stranded_requests_fail_with_unhealthy() {
    let (mut dispatcher, mut egress) = boot(test_config(0), vec![memory_capability()]);

    // c1 may already sit in the mailbox when k1 quarantines the handler;
    // either way it gets exactly one HANDLER_UNHEALTHY outcome
    dispatcher.submit(crash("k1"));
    dispatcher.submit(set("c1"));
    dispatcher.submit(set("c2"));
    dispatcher.run_until_idle().await;

    let out = drain(&mut egress);
    let k1 = outcomes_for(&out, "k1");
    assert_eq!(k1.len(), 1);
    assert_eq!(k1[0].error_code(), Some(codes::ACTOR_FAULT));
    for id in ["c1", "c2"] {
        let outcomes = outcomes_for(&out, id);
        assert_eq!(outcomes.len(), 1, "{} resolved {} times", id, outcomes.len());
        assert_eq!(outcomes[0].error_code(), Some(codes::HANDLER_UNHEALTHY));
    }

    let stats = dispatcher.stats();
    assert_eq!(stats.live_correlations, 0);
    assert_eq!(stats.actors["memory"].in_flight, 0);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let (mut dispatcher, _egress) = boot(test_config(3), vec![memory_capability()]);
    dispatcher.submit(set("c1"));
    dispatcher.run_until_idle().await;
    dispatcher.shutdown().await;
    dispatcher.shutdown().await;
}
