//! Message Routing and Scheduling Core
//!
//! Cooperative dispatcher that moves structured messages between
//! independently running handler actors. A single coordinating task owns all
//! routing, timer and correlation state; actors process their private
//! mailboxes concurrently and report back through one channel.
//!
//! # Architecture
//!
//! ```text
//!   ingress ──► Lanes ──────────► Tick Scheduler ──────► egress
//!               System | User     Validate → Route →
//!                 ▲               Dispatch → Bookkeep
//!                 │                  │        │
//!   Timer Wheel ──┘                  ▼        ▼
//!   (timeouts, retries,       Capability   Correlation
//!    deferred delivery)       Index        Table
//!                 ▲                  │
//!                 │                  ▼
//!            Supervisor ◄── reports ── Actor hosts (one mailbox each)
//! ```
//!
//! # Guarantees
//!
//! - Every System item queued at turn start is processed before any User item
//! - At most one User item per turn; FIFO within each lane
//! - Every validated, routed command/query gets exactly one terminal outcome
//!   (reply, error or timeout error) with `causation == request.id`
//! - Timer payloads are never delivered before their deadline
//! - Routing is fixed at boot; a non-enumerable contract fails boot
//!
//! # Example
//!
//! ```rust,no_run
//! use dispatch_core::{Capability, Contract, DispatchConfig, Dispatcher, Kind, Message};
//! # use dispatch_core::{Handler, HandlerError};
//! # use std::sync::Arc;
//! # struct Memory;
//! # #[async_trait::async_trait]
//! # impl Handler for Memory {
//! #     async fn handle(&mut self, msg: Arc<Message>) -> Result<Vec<Message>, HandlerError> {
//! #         Ok(vec![Message::reply_to(&msg, serde_json::json!({"success": true}))])
//! #     }
//! # }
//!
//! # async fn demo() -> dispatch_core::Result<()> {
//! let memory = Capability::new(
//!     "memory",
//!     Contract::message(Kind::Command, "Memory.Set"),
//!     Contract::message(Kind::Reply, "Memory.Set"),
//!     Arc::new(|| Box::new(Memory) as Box<dyn Handler>),
//! );
//! let (mut dispatcher, mut egress) = Dispatcher::boot(DispatchConfig::default(), vec![memory])?;
//! dispatcher.submit(Message::command("Memory.Set", serde_json::json!({"key": "a"})));
//! dispatcher.run_until_idle().await;
//! while let Ok(out) = egress.try_recv() {
//!     println!("{}", out.to_json()?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod correlation;
pub mod error;
pub mod lanes;
pub mod mailbox;
pub mod message;
pub mod router;
pub mod scheduler;
pub mod stats;
pub mod supervisor;
pub mod timer;

pub use config::{DispatchConfig, SupervisorConfig};
pub use correlation::{CorrelationEntry, CorrelationTable};
pub use error::{codes, BootError, DispatchError, HandlerError, Result, RouteError, ValidationError};
pub use lanes::{Lane, Lanes};
pub use mailbox::{ActorReport, ActorStats, Fault, Handler, HandlerFactory};
pub use message::{Kind, Message};
pub use router::{Capability, CapabilityIndex, Contract, HandlerId, KindPattern, Route, TypePattern};
pub use scheduler::{Dispatcher, Egress, Inbound, Origin};
pub use stats::{ActorSnapshot, Counters, DispatchStats, TurnReport};
pub use supervisor::{Supervisor, SupervisorDirective};
pub use timer::{TimerId, TimerKind, TimerWheel};
