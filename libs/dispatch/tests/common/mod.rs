//! Shared test handlers and helpers for dispatcher integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use dispatch_core::{
    Capability, Contract, DispatchConfig, Dispatcher, Egress, Handler, HandlerError, Kind, Message,
    SupervisorConfig,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SET_C1: &str = r#"{"kind":"command","type":"Memory.Set","data":{"key":"a","value":"b"},"metadata":{"id":"c1","timestamp":1000}}"#;

/// Key/value store. Replies mirror the request id (`c1` → `r1`) and stamp
/// `request.timestamp + 1` so expected replies can be written literally.
#[derive(Default)]
pub struct MemoryHandler {
    store: HashMap<String, Value>,
}

fn key_of(msg: &Message) -> Result<String, HandlerError> {
    msg.data()
        .get("key")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HandlerError::new("missing key"))
}

pub fn mirrored_reply(request: &Message, data: Value) -> Message {
    Message::new(Kind::Reply, request.msg_type(), data)
        .with_id(format!("r{}", request.id().trim_start_matches('c')))
        .with_timestamp(request.timestamp() + 1)
        .with_causation(request.id())
}

#[async_trait]
impl Handler for MemoryHandler {
    async fn handle(&mut self, msg: Arc<Message>) -> Result<Vec<Message>, HandlerError> {
        match msg.msg_type() {
            "Memory.Set" => {
                let key = key_of(&msg)?;
                let value = msg.data().get("value").cloned().unwrap_or(Value::Null);
                self.store.insert(key, value);
                Ok(vec![mirrored_reply(&msg, json!({"success": true}))])
            }
            "Memory.Get" => {
                let key = key_of(&msg)?;
                let value = self.store.get(&key).cloned().unwrap_or(Value::Null);
                Ok(vec![mirrored_reply(&msg, json!({"value": value}))])
            }
            "Memory.Delete" => {
                let key = key_of(&msg)?;
                let removed = self.store.remove(&key).is_some();
                Ok(vec![
                    mirrored_reply(&msg, json!({"removed": removed})),
                    Message::event("Memory.Changed", json!({"key": key, "op": "delete"})),
                ])
            }
            "Memory.Slow" => {
                let delay = msg.data().get("delay_ms").and_then(Value::as_u64).unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(vec![mirrored_reply(&msg, json!({"success": true}))])
            }
            "Memory.Crash" => panic!("memory corrupted"),
            other => Err(HandlerError::new(format!("unsupported type {}", other))),
        }
    }
}

pub fn memory_capability() -> Capability {
    let types = ["Memory.Set", "Memory.Get", "Memory.Delete", "Memory.Slow", "Memory.Crash"];
    let inbound = Contract::one_of(types.iter().map(|t| Contract::message(Kind::Command, *t)).collect());
    let mut outbound: Vec<Contract> = types.iter().map(|t| Contract::message(Kind::Reply, *t)).collect();
    outbound.push(Contract::message(Kind::Event, "Memory.Changed"));

    Capability::new(
        "memory",
        inbound,
        Contract::one_of(outbound),
        Arc::new(|| Box::new(MemoryHandler::default()) as Box<dyn Handler>),
    )
}

/// Counts `Memory.Changed` events it receives
pub struct AuditHandler {
    seen: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for AuditHandler {
    async fn handle(&mut self, _msg: Arc<Message>) -> Result<Vec<Message>, HandlerError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

pub fn audit_capability(seen: Arc<AtomicUsize>) -> Capability {
    Capability::new(
        "audit",
        Contract::none(),
        Contract::none(),
        Arc::new(move || {
            Box::new(AuditHandler {
                seen: Arc::clone(&seen),
            }) as Box<dyn Handler>
        }),
    )
    .with_subscriptions(["Memory.Changed"])
}

/// Subscribes to `Memory.Changed` and panics on every delivery
pub struct FaultySubscriber;

#[async_trait]
impl Handler for FaultySubscriber {
    async fn handle(&mut self, _msg: Arc<Message>) -> Result<Vec<Message>, HandlerError> {
        panic!("subscriber exploded")
    }
}

pub fn faulty_subscriber_capability() -> Capability {
    Capability::new(
        "faulty",
        Contract::none(),
        Contract::none(),
        Arc::new(|| Box::new(FaultySubscriber) as Box<dyn Handler>),
    )
    .with_subscriptions(["Memory.Changed"])
}

/// Small backoff so supervision tests finish quickly
pub fn test_config(max_restarts: u32) -> DispatchConfig {
    DispatchConfig {
        supervisor: SupervisorConfig {
            max_restarts,
            window_ms: 60_000,
            backoff_ms: 10,
        },
        ..DispatchConfig::default()
    }
}

/// Boot and discard the boot summary
pub fn boot(config: DispatchConfig, capabilities: Vec<Capability>) -> (Dispatcher, Egress) {
    let (dispatcher, mut egress) = Dispatcher::boot(config, capabilities).expect("boot");
    let summary = egress.try_recv().expect("boot summary");
    assert_eq!(summary.msg_type(), "System.Boot");
    (dispatcher, egress)
}

pub fn drain(egress: &mut Egress) -> Vec<Arc<Message>> {
    std::iter::from_fn(|| egress.try_recv().ok()).collect()
}

/// Terminal outcomes answering `request_id`
pub fn outcomes_for<'a>(out: &'a [Arc<Message>], request_id: &str) -> Vec<&'a Arc<Message>> {
    out.iter()
        .filter(|m| m.kind().is_terminal() && m.causation() == Some(request_id))
        .collect()
}
