//! Mailbox Actor Runtime
//!
//! Each handler runs inside an actor host: a tokio task owning a private
//! unbounded inbox. `Mailbox::send` never blocks the scheduler. The host
//! drains its inbox strictly one message at a time, validates every output
//! against the handler's outbound contract, and reports back to the
//! coordinating thread over a single report channel. Panics inside handler
//! bodies are caught here and surface as faults.
//!
//! After a fault the host drops the handler instance and parks: queued
//! messages stay buffered until the supervisor sends a fresh instance
//! (`Control::Respawn`) or stops the host, which returns undelivered
//! messages to the core.

use crate::error::{DispatchError, HandlerError, Result};
use crate::message::{Kind, Message};
use crate::router::{Contract, HandlerId};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Business logic wrapped by an actor. Outputs are validated by the runtime.
#[async_trait]
pub trait Handler: Send + 'static {
    /// Process one message to completion
    async fn handle(&mut self, msg: Arc<Message>) -> std::result::Result<Vec<Message>, HandlerError>;

    /// Called when a fresh instance is installed
    async fn on_start(&mut self) -> std::result::Result<(), HandlerError> {
        Ok(())
    }

    /// Called before an instance is discarded (not after a panic)
    async fn on_stop(&mut self) {}
}

/// Produces fresh handler instances; called once at boot and on every respawn
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// Why an actor faulted
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    Panicked(String),
    Declared(HandlerError),
    StartFailed(HandlerError),
    InvalidOutput {
        kind: Kind,
        msg_type: String,
        reason: String,
    },
}

impl Fault {
    pub fn category(&self) -> &'static str {
        match self {
            Fault::Panicked(_) => "panic",
            Fault::Declared(_) => "handler_error",
            Fault::StartFailed(_) => "start_failed",
            Fault::InvalidOutput { .. } => "invalid_output",
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Panicked(msg) => write!(f, "handler panicked: {}", msg),
            Fault::Declared(err) => write!(f, "handler error: {}", err),
            Fault::StartFailed(err) => write!(f, "handler failed to start: {}", err),
            Fault::InvalidOutput { kind, msg_type, reason } => {
                write!(f, "invalid output ({}, {}): {}", kind, msg_type, reason)
            }
        }
    }
}

/// Actor → coordinator reports. Exactly one per delivered message.
#[derive(Debug)]
pub enum ActorReport {
    Completed {
        handler: HandlerId,
        input: Arc<Message>,
        outputs: Vec<Message>,
    },
    Faulted {
        handler: HandlerId,
        /// None when the fault happened outside message processing
        input: Option<Arc<Message>>,
        fault: Fault,
    },
    /// Undelivered message handed back by a stopping host
    Returned {
        handler: HandlerId,
        message: Arc<Message>,
    },
}

enum Control {
    Respawn(Box<dyn Handler>),
    Stop,
}

/// Per-actor counters, shared between the host task and the coordinator
#[derive(Debug, Default)]
pub struct ActorStats {
    pub messages_processed: AtomicU64,
    pub total_processing_time_ns: AtomicU64,
    pub faults: AtomicU64,
    pub processing: AtomicBool,
    last_fault: Mutex<Option<String>>,
}

impl ActorStats {
    pub fn record_message_handled(&self, duration: Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn avg_processing_time_ns(&self) -> f64 {
        let count = self.messages_processed.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_processing_time_ns.load(Ordering::Relaxed) as f64 / count as f64
    }

    fn record_fault(&self, fault: &Fault) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        *self.last_fault.lock() = Some(fault.to_string());
    }

    pub fn last_fault(&self) -> Option<String> {
        self.last_fault.lock().clone()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Relaxed)
    }
}

/// Sending half of an actor's inbox
#[derive(Clone)]
pub struct Mailbox {
    handler: HandlerId,
    messages: mpsc::UnboundedSender<Arc<Message>>,
    control: mpsc::UnboundedSender<Control>,
}

impl Mailbox {
    /// Non-blocking enqueue
    pub fn send(&self, msg: Arc<Message>) -> Result<()> {
        self.messages.send(msg).map_err(|_| {
            warn!(handler = %self.handler, "Mailbox closed");
            DispatchError::Shutdown
        })
    }

    /// Install a fresh handler instance in a parked host
    fn respawn(&self, handler: Box<dyn Handler>) -> bool {
        self.control.send(Control::Respawn(handler)).is_ok()
    }

    fn stop(&self) -> bool {
        self.control.send(Control::Stop).is_ok()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox").field("handler", &self.handler).finish()
    }
}

struct MailboxReceiver {
    messages: mpsc::UnboundedReceiver<Arc<Message>>,
    control: mpsc::UnboundedReceiver<Control>,
}

/// Coordinator-side handle to one running actor host
pub struct ActorCell {
    pub id: HandlerId,
    mailbox: Mailbox,
    factory: HandlerFactory,
    outbound: Arc<Contract>,
    max_message_bytes: usize,
    reports: mpsc::UnboundedSender<ActorReport>,
    stats: Arc<ActorStats>,
    task: Option<JoinHandle<()>>,
    /// Messages handed to the host and not yet reported back
    pub in_flight: usize,
}

impl ActorCell {
    /// Create the first instance and start its host task
    pub fn spawn(
        id: HandlerId,
        factory: HandlerFactory,
        outbound: Contract,
        max_message_bytes: usize,
        reports: mpsc::UnboundedSender<ActorReport>,
    ) -> Self {
        let stats = Arc::new(ActorStats::default());
        let outbound = Arc::new(outbound);
        let (mailbox, task) = start_host(
            id.clone(),
            (factory)(),
            Arc::clone(&outbound),
            max_message_bytes,
            reports.clone(),
            Arc::clone(&stats),
        );
        Self {
            id,
            mailbox,
            factory,
            outbound,
            max_message_bytes,
            reports,
            stats,
            task: Some(task),
            in_flight: 0,
        }
    }

    /// Hand a message to the actor without waiting
    pub fn deliver(&mut self, msg: Arc<Message>) -> Result<()> {
        self.mailbox.send(msg)?;
        self.in_flight += 1;
        Ok(())
    }

    /// Replace the faulted instance with a fresh one from the factory,
    /// keeping the buffered inbox
    pub fn respawn(&mut self) {
        let fresh = (self.factory)();
        if !self.mailbox.respawn(fresh) {
            info!(handler = %self.id, "Actor host gone, starting a new one");
            self.restart_host();
        }
    }

    /// Stop the host; undelivered messages come back as `Returned` reports
    pub fn stop(&mut self) {
        self.mailbox.stop();
    }

    /// Start a brand new host with an empty inbox (after quarantine is cleared).
    /// The old host is told to stop and left to hand back its inbox.
    pub fn restart_host(&mut self) {
        self.mailbox.stop();
        self.task.take();
        let (mailbox, task) = start_host(
            self.id.clone(),
            (self.factory)(),
            Arc::clone(&self.outbound),
            self.max_message_bytes,
            self.reports.clone(),
            Arc::clone(&self.stats),
        );
        self.mailbox = mailbox;
        self.task = Some(task);
    }

    pub fn stats(&self) -> Arc<ActorStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for the host to exit after `stop`, aborting if it lingers
    pub async fn join(&mut self, grace: Duration) {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(handler = %self.id, "Actor host did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl fmt::Debug for ActorCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorCell")
            .field("id", &self.id)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

fn start_host(
    id: HandlerId,
    handler: Box<dyn Handler>,
    outbound: Arc<Contract>,
    max_message_bytes: usize,
    reports: mpsc::UnboundedSender<ActorReport>,
    stats: Arc<ActorStats>,
) -> (Mailbox, JoinHandle<()>) {
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
    let mailbox = Mailbox {
        handler: id.clone(),
        messages: msg_tx,
        control: ctl_tx,
    };
    let host = ActorHost {
        id,
        handler: None,
        receiver: MailboxReceiver {
            messages: msg_rx,
            control: ctl_rx,
        },
        outbound,
        max_message_bytes,
        reports,
        stats,
    };
    let task = tokio::spawn(host.run(handler));
    (mailbox, task)
}

/// Task-side actor: owns the inbox and the current handler instance
struct ActorHost {
    id: HandlerId,
    handler: Option<Box<dyn Handler>>,
    receiver: MailboxReceiver,
    outbound: Arc<Contract>,
    max_message_bytes: usize,
    reports: mpsc::UnboundedSender<ActorReport>,
    stats: Arc<ActorStats>,
}

impl ActorHost {
    async fn run(mut self, initial: Box<dyn Handler>) {
        self.install(initial).await;

        loop {
            let parked = self.handler.is_none();
            tokio::select! {
                biased;

                ctrl = self.receiver.control.recv() => match ctrl {
                    Some(Control::Respawn(fresh)) => self.install(fresh).await,
                    Some(Control::Stop) | None => break,
                },
                msg = self.receiver.messages.recv(), if !parked => match msg {
                    Some(msg) => self.process(msg).await,
                    None => break,
                },
            }
        }

        self.shutdown().await;
    }

    async fn install(&mut self, mut fresh: Box<dyn Handler>) {
        if let Some(mut old) = self.handler.take() {
            old.on_stop().await;
        }
        match AssertUnwindSafe(fresh.on_start()).catch_unwind().await {
            Ok(Ok(())) => {
                debug!(handler = %self.id, "Actor instance started");
                self.handler = Some(fresh);
            }
            Ok(Err(e)) => self.fault(None, Fault::StartFailed(e)),
            Err(panic) => self.fault(None, Fault::Panicked(panic_message(panic.as_ref()))),
        }
    }

    async fn process(&mut self, msg: Arc<Message>) {
        let Some(handler) = self.handler.as_mut() else {
            return;
        };

        self.stats.processing.store(true, Ordering::Relaxed);
        let start = Instant::now();
        let result = AssertUnwindSafe(handler.handle(Arc::clone(&msg)))
            .catch_unwind()
            .await;
        self.stats.processing.store(false, Ordering::Relaxed);

        match result {
            Ok(Ok(outputs)) => match self.check_outputs(&outputs) {
                Ok(()) => {
                    self.stats.record_message_handled(start.elapsed());
                    debug!(
                        handler = %self.id,
                        message_id = %msg.id(),
                        outputs = outputs.len(),
                        processing_ns = start.elapsed().as_nanos() as u64,
                        "Message processed"
                    );
                    self.report(ActorReport::Completed {
                        handler: self.id.clone(),
                        input: msg,
                        outputs,
                    });
                }
                Err(fault) => {
                    self.terminate().await;
                    self.fault(Some(msg), fault);
                }
            },
            Ok(Err(e)) => {
                self.terminate().await;
                self.fault(Some(msg), Fault::Declared(e));
            }
            Err(panic) => {
                // A panicked instance is dropped without on_stop
                self.handler = None;
                self.fault(Some(msg), Fault::Panicked(panic_message(panic.as_ref())));
            }
        }
    }

    /// Every output must be well-formed and inside the outbound contract
    fn check_outputs(&self, outputs: &[Message]) -> std::result::Result<(), Fault> {
        for output in outputs {
            if let Err(e) = output.validate(self.max_message_bytes) {
                return Err(Fault::InvalidOutput {
                    kind: output.kind(),
                    msg_type: output.msg_type().to_string(),
                    reason: e.to_string(),
                });
            }
            if !self.outbound.matches(output.kind(), output.msg_type()) {
                return Err(Fault::InvalidOutput {
                    kind: output.kind(),
                    msg_type: output.msg_type().to_string(),
                    reason: "not declared in outbound contract".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn terminate(&mut self) {
        if let Some(mut handler) = self.handler.take() {
            handler.on_stop().await;
        }
    }

    fn fault(&mut self, input: Option<Arc<Message>>, fault: Fault) {
        warn!(
            handler = %self.id,
            message_id = input.as_ref().map(|m| m.id()).unwrap_or("-"),
            fault = %fault,
            category = fault.category(),
            "Actor fault"
        );
        self.stats.record_fault(&fault);
        self.handler = None;
        self.report(ActorReport::Faulted {
            handler: self.id.clone(),
            input,
            fault,
        });
    }

    fn report(&self, report: ActorReport) {
        if self.reports.send(report).is_err() {
            debug!(handler = %self.id, "Coordinator gone, dropping actor report");
        }
    }

    async fn shutdown(&mut self) {
        self.terminate().await;
        self.receiver.messages.close();
        let mut returned = 0usize;
        while let Ok(message) = self.receiver.messages.try_recv() {
            returned += 1;
            self.report(ActorReport::Returned {
                handler: self.id.clone(),
                message,
            });
        }
        info!(handler = %self.id, returned, "Actor host stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
