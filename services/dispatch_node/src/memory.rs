//! In-process key/value capability mounted by the node
//!
//! Handles `Memory.Set`, `Memory.Get` and `Memory.Delete` commands/queries and
//! publishes `Memory.Changed` after every mutation.

use async_trait::async_trait;
use dispatch_core::{Capability, Contract, Handler, HandlerError, Kind, KindPattern, Message, TypePattern};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

pub const HANDLER_ID: &str = "memory";

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Map<String, Value>,
}

impl MemoryStore {
    fn key(msg: &Message) -> Result<String, HandlerError> {
        msg.data()
            .get("key")
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .ok_or_else(|| HandlerError::new(format!("{} requires a non-empty 'key'", msg.msg_type())))
    }

    fn changed(key: &str, op: &str) -> Message {
        Message::event("Memory.Changed", json!({ "key": key, "op": op }))
    }
}

#[async_trait]
impl Handler for MemoryStore {
    async fn handle(&mut self, msg: Arc<Message>) -> Result<Vec<Message>, HandlerError> {
        let key = Self::key(&msg)?;
        debug!(msg_type = %msg.msg_type(), key = %key, "Memory request");

        match msg.msg_type() {
            "Memory.Set" => {
                let value = msg.data().get("value").cloned().unwrap_or(Value::Null);
                self.entries.insert(key.clone(), value);
                Ok(vec![
                    Message::reply_to(&msg, json!({ "success": true })),
                    Self::changed(&key, "set"),
                ])
            }
            "Memory.Get" => {
                let value = self.entries.get(&key).cloned();
                Ok(vec![Message::reply_to(
                    &msg,
                    json!({ "found": value.is_some(), "value": value.unwrap_or(Value::Null) }),
                )])
            }
            "Memory.Delete" => {
                let removed = self.entries.remove(&key).is_some();
                let mut outputs = vec![Message::reply_to(&msg, json!({ "removed": removed }))];
                if removed {
                    outputs.push(Self::changed(&key, "delete"));
                }
                Ok(outputs)
            }
            other => Err(HandlerError::new(format!("unsupported type {}", other))),
        }
    }
}

pub fn capability() -> Capability {
    let inbound = Contract::one_of(vec![
        Contract::message(Kind::Command, "Memory.Set"),
        Contract::message(Kind::Command, "Memory.Delete"),
        Contract::Message {
            kind: KindPattern::OneOf(vec![Kind::Query, Kind::Command]),
            msg_type: TypePattern::Literal("Memory.Get".to_string()),
        },
    ]);
    let outbound = Contract::one_of(vec![
        Contract::Message {
            kind: KindPattern::Exactly(Kind::Reply),
            msg_type: TypePattern::Prefix("Memory.".to_string()),
        },
        Contract::message(Kind::Event, "Memory.Changed"),
    ]);

    Capability::new(
        HANDLER_ID,
        inbound,
        outbound,
        Arc::new(|| Box::new(MemoryStore::default()) as Box<dyn Handler>),
    )
}
