//! Capability Router
//!
//! Static routing index built once at boot from each handler's declared
//! inbound contract. A contract is discoverable only when it reduces to a
//! finite set of `(kind, literal type)` pairs; open-ended types fail boot.
//! Event fan-out comes from the separately declared subscription lists.
//!
//! After boot the index is immutable and lookups are plain hash-map reads.

use crate::error::{BootError, RouteError};
use crate::mailbox::HandlerFactory;
use crate::message::{is_valid_type, Kind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Stable handler identifier, cheap to clone
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct HandlerId(Arc<str>);

impl HandlerId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Kind side of a contract alternative
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindPattern {
    Exactly(Kind),
    OneOf(Vec<Kind>),
    Any,
}

impl KindPattern {
    fn matches(&self, kind: Kind) -> bool {
        match self {
            KindPattern::Exactly(k) => *k == kind,
            KindPattern::OneOf(kinds) => kinds.contains(&kind),
            KindPattern::Any => true,
        }
    }
}

/// Type side of a contract alternative
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypePattern {
    Literal(String),
    /// Any type starting with the prefix, e.g. `Memory.`
    Prefix(String),
    Any,
}

impl TypePattern {
    fn matches(&self, msg_type: &str) -> bool {
        match self {
            TypePattern::Literal(t) => t == msg_type,
            TypePattern::Prefix(p) => msg_type.starts_with(p.as_str()),
            TypePattern::Any => true,
        }
    }
}

/// Declared message contract: a tree of alternatives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contract {
    Message { kind: KindPattern, msg_type: TypePattern },
    OneOf(Vec<Contract>),
}

impl Contract {
    /// Single literal `(kind, type)` alternative
    pub fn message(kind: Kind, msg_type: impl Into<String>) -> Self {
        Contract::Message {
            kind: KindPattern::Exactly(kind),
            msg_type: TypePattern::Literal(msg_type.into()),
        }
    }

    pub fn one_of(alternatives: Vec<Contract>) -> Self {
        Contract::OneOf(alternatives)
    }

    /// Accepts every message. Valid for outbound contracts only.
    pub fn any() -> Self {
        Contract::Message {
            kind: KindPattern::Any,
            msg_type: TypePattern::Any,
        }
    }

    /// Nothing matches
    pub fn none() -> Self {
        Contract::OneOf(Vec::new())
    }

    pub fn matches(&self, kind: Kind, msg_type: &str) -> bool {
        match self {
            Contract::Message { kind: k, msg_type: t } => k.matches(kind) && t.matches(msg_type),
            Contract::OneOf(alternatives) => alternatives.iter().any(|c| c.matches(kind, msg_type)),
        }
    }

    /// Reduce the contract to its finite `(kind, type)` set. The error string
    /// names the first alternative that is not enumerable.
    pub fn enumerate(&self) -> std::result::Result<BTreeSet<(Kind, String)>, String> {
        let mut pairs = BTreeSet::new();
        self.collect_pairs(&mut pairs)?;
        Ok(pairs)
    }

    fn collect_pairs(&self, pairs: &mut BTreeSet<(Kind, String)>) -> std::result::Result<(), String> {
        match self {
            Contract::OneOf(alternatives) => {
                for alternative in alternatives {
                    alternative.collect_pairs(pairs)?;
                }
                Ok(())
            }
            Contract::Message { kind, msg_type } => {
                let literal = match msg_type {
                    TypePattern::Literal(t) if is_valid_type(t) => t,
                    TypePattern::Literal(t) => return Err(format!("'{}' is not a valid type literal", t)),
                    TypePattern::Prefix(p) => return Err(format!("open type prefix '{}*'", p)),
                    TypePattern::Any => return Err("open type (any)".to_string()),
                };
                let kinds: Vec<Kind> = match kind {
                    KindPattern::Exactly(k) => vec![*k],
                    KindPattern::OneOf(ks) if !ks.is_empty() => ks.clone(),
                    KindPattern::OneOf(_) => return Err(format!("empty kind set for '{}'", literal)),
                    KindPattern::Any => return Err(format!("open kind for '{}'", literal)),
                };
                for k in kinds {
                    pairs.insert((k, literal.clone()));
                }
                Ok(())
            }
        }
    }
}

/// Everything a business handler module exports to the core
pub struct Capability {
    pub id: HandlerId,
    pub inbound: Contract,
    pub outbound: Contract,
    pub subscriptions: Vec<String>,
    pub factory: HandlerFactory,
}

impl Capability {
    pub fn new(id: impl AsRef<str>, inbound: Contract, outbound: Contract, factory: HandlerFactory) -> Self {
        Self {
            id: HandlerId::new(id),
            inbound,
            outbound,
            subscriptions: Vec::new(),
            factory,
        }
    }

    pub fn with_subscriptions<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions = event_types.into_iter().map(Into::into).collect();
        self
    }

    /// Discover the `(kind, type)` pairs this capability handles
    pub fn discover(&self) -> std::result::Result<BTreeSet<(Kind, String)>, BootError> {
        self.inbound
            .enumerate()
            .map_err(|detail| BootError::non_enumerable(self.id.as_str(), detail))
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("id", &self.id)
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

/// Resolved destination(s) for a routable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Command/query: exactly one handler
    Single(HandlerId),
    /// Event: zero or more subscribers in declaration order
    FanOut(Vec<HandlerId>),
}

/// Write-once routing index
#[derive(Debug, Default)]
pub struct CapabilityIndex {
    handlers: HashMap<(Kind, String), HandlerId>,
    subscribers: HashMap<String, Vec<HandlerId>>,
    declared: Vec<HandlerId>,
}

impl CapabilityIndex {
    /// Build the index. Any non-enumerable contract, unroutable kind or
    /// duplicate claim is a fatal boot error.
    pub fn build(capabilities: &[Capability]) -> std::result::Result<Self, BootError> {
        let mut index = CapabilityIndex::default();
        let mut seen = HashSet::new();

        for capability in capabilities {
            let id = &capability.id;
            if !seen.insert(id.clone()) {
                return Err(BootError::DuplicateHandler {
                    handler: id.to_string(),
                });
            }
            index.declared.push(id.clone());

            for (kind, msg_type) in capability.discover()? {
                if !kind.is_request() {
                    return Err(BootError::UnroutableKind {
                        handler: id.to_string(),
                        kind,
                        msg_type,
                    });
                }
                if let Some(existing) = index.handlers.get(&(kind, msg_type.clone())) {
                    return Err(BootError::DuplicateRoute {
                        kind,
                        msg_type,
                        first: existing.to_string(),
                        second: id.to_string(),
                    });
                }
                debug!(handler = %id, kind = %kind, msg_type = %msg_type, "Discovered route");
                index.handlers.insert((kind, msg_type), id.clone());
            }

            for event_type in &capability.subscriptions {
                if !is_valid_type(event_type) {
                    return Err(BootError::InvalidSubscription {
                        handler: id.to_string(),
                        msg_type: event_type.clone(),
                    });
                }
                let subscribers = index.subscribers.entry(event_type.clone()).or_default();
                if !subscribers.contains(id) {
                    subscribers.push(id.clone());
                }
            }
        }

        Ok(index)
    }

    /// O(1) lookup. Events with no subscribers route to an empty fan-out.
    pub fn route(&self, kind: Kind, msg_type: &str) -> std::result::Result<Route, RouteError> {
        match kind {
            Kind::Command | Kind::Query => self
                .handlers
                .get(&(kind, msg_type.to_string()))
                .cloned()
                .map(Route::Single)
                .ok_or_else(|| RouteError::NoRoute {
                    kind,
                    msg_type: msg_type.to_string(),
                }),
            Kind::Event => Ok(Route::FanOut(
                self.subscribers.get(msg_type).cloned().unwrap_or_default(),
            )),
            Kind::Reply | Kind::Error => Err(RouteError::NoRoute {
                kind,
                msg_type: msg_type.to_string(),
            }),
        }
    }

    /// Handler ids in declaration order
    pub fn handler_ids(&self) -> &[HandlerId] {
        &self.declared
    }

    pub fn contains_handler(&self, id: &HandlerId) -> bool {
        self.declared.contains(id)
    }

    /// `handler -> ["kind Type", ...]`, sorted
    pub fn handler_summary(&self) -> BTreeMap<String, Vec<String>> {
        let mut summary: BTreeMap<String, Vec<String>> = self
            .declared
            .iter()
            .map(|id| (id.to_string(), Vec::new()))
            .collect();
        for ((kind, msg_type), id) in &self.handlers {
            summary
                .entry(id.to_string())
                .or_default()
                .push(format!("{} {}", kind, msg_type));
        }
        for routes in summary.values_mut() {
            routes.sort();
        }
        summary
    }

    /// `event type -> [subscriber, ...]`
    pub fn subscription_summary(&self) -> BTreeMap<String, Vec<String>> {
        self.subscribers
            .iter()
            .map(|(t, ids)| (t.clone(), ids.iter().map(ToString::to_string).collect()))
            .collect()
    }

    pub fn route_count(&self) -> usize {
        self.handlers.len()
    }
}
