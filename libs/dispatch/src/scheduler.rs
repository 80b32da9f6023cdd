//! Tick Scheduler
//!
//! The dispatcher core. One coordinating task owns the lanes, the timer
//! wheel, the correlation table and the supervisor; actors only talk back
//! through reports that are folded in at the start of each turn.
//!
//! A turn:
//! 1. fold buffered actor reports into the lanes
//! 2. fire ready timers
//! 3. drain the System lane completely
//! 4. process exactly one User item
//!
//! Every item goes through Validate → Route → Dispatch → Bookkeep. Schema
//! and routing failures become System-lane errors in place and are never
//! retried. The host yields between turns.

use crate::config::DispatchConfig;
use crate::correlation::{CorrelationEntry, CorrelationTable};
use crate::error::{codes, Result, RouteError, ValidationError};
use crate::lanes::{Lane, Lanes};
use crate::mailbox::{ActorCell, ActorReport, Fault};
use crate::message::{Kind, Message};
use crate::router::{Capability, CapabilityIndex, HandlerId, Route};
use crate::stats::{ActorSnapshot, Counters, DispatchStats, TurnReport};
use crate::supervisor::{Supervisor, SupervisorDirective};
use crate::timer::{TimerId, TimerKind, TimerWheel};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Boot summary event
pub const BOOT_TYPE: &str = "System.Boot";
/// Fault notice emitted for every actor fault
pub const ACTOR_FAULT_TYPE: &str = "System.ActorFault";
/// Notice emitted after a fresh instance is installed
pub const ACTOR_RESPAWNED_TYPE: &str = "System.ActorRespawned";
/// Internal retry payload fired after the supervisor backoff
pub const RESPAWN_TYPE: &str = "System.Respawn";
/// Operator request: `{"handler": "<id>"}`
pub const CLEAR_UNHEALTHY_TYPE: &str = "System.ClearUnhealthy";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Outbound stream towards the transport boundary
pub type Egress = mpsc::UnboundedReceiver<Arc<Message>>;

/// Items arriving from the transport boundary
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Unparsed wire record, validated inside the turn
    Raw(String),
    Message(Message),
}

/// Where a lane item came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Ingress,
    Actor(HandlerId),
    Timer(TimerKind),
    /// Core-generated notice or error that never resolves a correlation
    Notice,
    /// Core-generated terminal meant to resolve a live correlation
    Resolution,
}

#[derive(Debug)]
enum Body {
    Parsed(Arc<Message>),
    Raw(String),
}

#[derive(Debug)]
struct Envelope {
    body: Body,
    origin: Origin,
}

impl Envelope {
    fn new(msg: Arc<Message>, origin: Origin) -> Self {
        Self {
            body: Body::Parsed(msg),
            origin,
        }
    }
}

#[derive(Debug, Serialize)]
struct BootSummary<'a> {
    handlers: BTreeMap<String, Vec<String>>,
    subscriptions: BTreeMap<String, Vec<String>>,
    defaults: &'a DispatchConfig,
}

/// Cooperative two-lane dispatcher
pub struct Dispatcher {
    config: Arc<DispatchConfig>,
    index: CapabilityIndex,
    actors: HashMap<HandlerId, ActorCell>,
    lanes: Lanes<Envelope>,
    timers: TimerWheel,
    correlations: CorrelationTable,
    supervisor: Supervisor,
    reports: mpsc::UnboundedReceiver<ActorReport>,
    pending_reports: VecDeque<ActorReport>,
    pending_respawn: HashMap<HandlerId, TimerId>,
    egress: mpsc::UnboundedSender<Arc<Message>>,
    counters: Counters,
    recent_orphans: VecDeque<Arc<Message>>,
    shut_down: bool,
}

impl Dispatcher {
    /// Build the routing index, start one actor per capability and publish
    /// the boot summary. Any contract problem is fatal. Must be called from
    /// within a Tokio runtime.
    pub fn boot(config: DispatchConfig, capabilities: Vec<Capability>) -> Result<(Self, Egress)> {
        config.validate()?;
        let index = CapabilityIndex::build(&capabilities)?;

        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();

        let mut actors = HashMap::with_capacity(capabilities.len());
        for capability in capabilities {
            let Capability {
                id,
                outbound,
                factory,
                ..
            } = capability;
            let cell = ActorCell::spawn(
                id.clone(),
                factory,
                outbound,
                config.max_message_bytes,
                report_tx.clone(),
            );
            actors.insert(id, cell);
        }

        let dispatcher = Self {
            supervisor: Supervisor::new(&config.supervisor),
            config: Arc::new(config),
            index,
            actors,
            lanes: Lanes::new(),
            timers: TimerWheel::new(),
            correlations: CorrelationTable::new(),
            reports: report_rx,
            pending_reports: VecDeque::new(),
            pending_respawn: HashMap::new(),
            egress: egress_tx,
            counters: Counters::default(),
            recent_orphans: VecDeque::new(),
            shut_down: false,
        };
        dispatcher.publish_boot_summary()?;
        Ok((dispatcher, egress_rx))
    }

    fn publish_boot_summary(&self) -> Result<()> {
        let summary = BootSummary {
            handlers: self.index.handler_summary(),
            subscriptions: self.index.subscription_summary(),
            defaults: &self.config,
        };
        let data = serde_json::to_value(&summary)?;
        info!(
            handlers = self.index.handler_ids().len(),
            routes = self.index.route_count(),
            default_timeout_ms = self.config.default_timeout_ms,
            summary = %data,
            "Dispatcher booted"
        );
        let event = Message::event(BOOT_TYPE, data);
        if self.egress.send(Arc::new(event)).is_err() {
            debug!("Egress closed before boot summary");
        }
        Ok(())
    }

    // ----- ingress -----------------------------------------------------

    /// Enqueue a typed message on its default lane
    pub fn submit(&mut self, msg: Message) -> Lane {
        let lane = self.classify(msg.msg_type());
        self.submit_to(lane, msg);
        lane
    }

    /// Enqueue a typed message on an explicit lane
    pub fn submit_to(&mut self, lane: Lane, msg: Message) {
        self.lanes.enqueue(lane, Envelope::new(Arc::new(msg), Origin::Ingress));
    }

    /// Enqueue an unparsed wire record. The lane follows the record's
    /// `type` when it can be read; anything else lands on User and fails
    /// validation there.
    pub fn submit_json(&mut self, text: impl Into<String>) -> Lane {
        let text = text.into();
        let lane = raw_field(&text, "/type").map_or(Lane::User, |msg_type| self.classify(&msg_type));
        self.lanes.enqueue(
            lane,
            Envelope {
                body: Body::Raw(text),
                origin: Origin::Ingress,
            },
        );
        lane
    }

    fn accept(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Raw(text) => {
                self.submit_json(text);
            }
            Inbound::Message(msg) => {
                self.submit(msg);
            }
        }
    }

    /// Deliver `msg` into the User lane no earlier than `delay` from now
    pub fn schedule(&mut self, delay: Duration, msg: Message) -> TimerId {
        self.timers
            .schedule(Instant::now(), delay, Arc::new(msg), TimerKind::Scheduled)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Operator clear of a quarantined handler; starts a fresh host
    pub fn clear_unhealthy(&mut self, handler: &HandlerId) -> bool {
        if !self.supervisor.clear(handler) {
            return false;
        }
        if let Some(cell) = self.actors.get_mut(handler) {
            cell.restart_host();
        }
        true
    }

    fn classify(&self, msg_type: &str) -> Lane {
        Lane::classify(msg_type, &self.config.control_prefixes)
    }

    // ----- turns -------------------------------------------------------

    /// Run exactly one turn
    pub fn turn(&mut self) -> TurnReport {
        let mut report = TurnReport::default();
        self.counters.turns += 1;

        self.fold_reports();
        report.timers_fired = self.fire_timers(Instant::now());

        while let Some(envelope) = self.lanes.pop_system() {
            self.process(Lane::System, envelope);
            report.system += 1;
        }

        if let Some(envelope) = self.lanes.pop_user() {
            self.process(Lane::User, envelope);
            report.user = 1;
        }

        report
    }

    /// Turn until no lane item, report, live correlation, timer or busy actor
    /// remains
    pub async fn run_until_idle(&mut self) {
        loop {
            self.turn();
            if !self.lanes.is_empty() || !self.pending_reports.is_empty() {
                tokio::task::yield_now().await;
                continue;
            }
            if self.is_quiescent() {
                break;
            }
            if !self.wait_for_work().await {
                break;
            }
        }
    }

    /// Long-lived loop: accepts ingress until it closes or `shutdown`
    /// resolves, then drains outstanding work and stops all actors
    pub async fn run<F>(&mut self, mut ingress: mpsc::UnboundedReceiver<Inbound>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ingress_open = true;
        info!("Dispatcher loop started");

        loop {
            while ingress_open {
                match ingress.try_recv() {
                    Ok(inbound) => self.accept(inbound),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => ingress_open = false,
                }
            }

            self.turn();

            if !self.lanes.is_empty() || !self.pending_reports.is_empty() {
                tokio::task::yield_now().await;
                continue;
            }
            if !ingress_open && self.is_quiescent() {
                break;
            }

            let deadline = self.timers.next_deadline();
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                inbound = ingress.recv(), if ingress_open => match inbound {
                    Some(inbound) => self.accept(inbound),
                    None => ingress_open = false,
                },
                report = self.reports.recv() => {
                    if let Some(report) = report {
                        self.pending_reports.push_back(report);
                    }
                }
                _ = sleep_until(deadline) => {}
            }
        }

        self.shutdown().await;
    }

    /// Wait for an actor report or the next timer deadline
    async fn wait_for_work(&mut self) -> bool {
        let deadline = self.timers.next_deadline();
        tokio::select! {
            report = self.reports.recv() => match report {
                Some(report) => {
                    self.pending_reports.push_back(report);
                    true
                }
                None => deadline.is_some(),
            },
            _ = sleep_until(deadline) => true,
        }
    }

    fn is_quiescent(&self) -> bool {
        self.lanes.is_empty()
            && self.pending_reports.is_empty()
            && self.correlations.is_empty()
            && self.timers.is_empty()
            && self.actors.values().all(|cell| cell.in_flight == 0)
    }

    fn fold_reports(&mut self) {
        while let Ok(report) = self.reports.try_recv() {
            self.pending_reports.push_back(report);
        }
        while let Some(report) = self.pending_reports.pop_front() {
            self.handle_report(report);
        }
    }

    fn fire_timers(&mut self, now: Instant) -> usize {
        let ready = self.timers.pop_ready(now);
        let fired = ready.len();
        for entry in ready {
            self.counters.timers_fired += 1;
            match entry.kind {
                TimerKind::Timeout => {
                    let request = &entry.payload;
                    debug!(message_id = %request.id(), timer = %entry.id, "Request timed out");
                    let timeout = self
                        .correlations
                        .get(request.id())
                        .map(|e| Instant::now().saturating_duration_since(e.created_at))
                        .unwrap_or_default();
                    let error = Message::error_to(
                        request,
                        codes::TIMEOUT,
                        format!("no terminal outcome within {}ms", timeout.as_millis()),
                    );
                    self.lanes
                        .enqueue(Lane::System, Envelope::new(Arc::new(error), Origin::Resolution));
                }
                TimerKind::Scheduled => {
                    self.lanes
                        .enqueue(Lane::User, Envelope::new(entry.payload, Origin::Timer(TimerKind::Scheduled)));
                }
                TimerKind::Retry => {
                    self.lanes
                        .enqueue(Lane::System, Envelope::new(entry.payload, Origin::Timer(TimerKind::Retry)));
                }
            }
        }
        fired
    }

    // ----- pipeline ----------------------------------------------------

    fn process(&mut self, lane: Lane, envelope: Envelope) {
        let Envelope { body, origin } = envelope;

        let msg = match self.validate(body, &origin) {
            Ok(msg) => msg,
            Err((causation, err)) => {
                self.reject(causation, err);
                return;
            }
        };

        self.counters.record_processed(lane);
        debug!(
            lane = %lane,
            message_id = %msg.id(),
            kind = %msg.kind(),
            msg_type = %msg.msg_type(),
            origin = ?origin,
            "Processing message"
        );

        if self.handle_control(&msg, &origin) {
            return;
        }

        match msg.kind() {
            Kind::Command | Kind::Query => self.dispatch_request(msg),
            Kind::Event => self.dispatch_event(msg),
            Kind::Reply | Kind::Error => self.settle(msg, origin),
        }
    }

    fn validate(
        &self,
        body: Body,
        origin: &Origin,
    ) -> std::result::Result<Arc<Message>, (Option<String>, ValidationError)> {
        let msg = match body {
            // Core-generated items are well-formed by construction
            Body::Parsed(msg) if matches!(origin, Origin::Notice | Origin::Resolution) => return Ok(msg),
            Body::Parsed(msg) => msg,
            Body::Raw(text) => match Message::from_json(&text) {
                Ok(msg) => Arc::new(msg),
                Err(err) => return Err((raw_field(&text, "/metadata/id"), err)),
            },
        };
        match msg.validate(self.config.max_message_bytes) {
            Ok(()) => Ok(msg),
            Err(err) => {
                let id = Some(msg.id().to_string()).filter(|id| !id.is_empty());
                Err((id, err))
            }
        }
    }

    fn reject(&mut self, causation: Option<String>, err: ValidationError) {
        self.counters.validation_failures += 1;
        warn!(
            causation = causation.as_deref().unwrap_or("-"),
            error = %err,
            "Message failed validation"
        );
        let error = Message::validation_error(causation, err.to_string());
        self.lanes
            .enqueue(Lane::System, Envelope::new(Arc::new(error), Origin::Notice));
    }

    fn route_failure(&mut self, msg: &Message, err: RouteError) {
        self.counters.routing_failures += 1;
        warn!(
            message_id = %msg.id(),
            kind = %msg.kind(),
            msg_type = %msg.msg_type(),
            error = %err,
            "Routing failed"
        );
        let error = match &err {
            RouteError::Unhealthy { handler } => {
                Message::handler_error_to(msg, err.code(), err.to_string(), handler)
            }
            RouteError::NoRoute { .. } => Message::error_to(msg, err.code(), err.to_string()),
        };
        self.lanes
            .enqueue(Lane::System, Envelope::new(Arc::new(error), Origin::Notice));
    }

    /// Core-handled control events. Returns true when consumed.
    fn handle_control(&mut self, msg: &Arc<Message>, origin: &Origin) -> bool {
        if msg.kind() != Kind::Event {
            return false;
        }
        match msg.msg_type() {
            RESPAWN_TYPE => {
                match (origin, handler_field(msg)) {
                    (Origin::Timer(TimerKind::Retry), Some(handler)) => self.respawn(handler),
                    _ => warn!(message_id = %msg.id(), origin = ?origin, "Ignoring respawn request"),
                }
                true
            }
            CLEAR_UNHEALTHY_TYPE => {
                match handler_field(msg) {
                    Some(handler) => {
                        let cleared = self.clear_unhealthy(&handler);
                        info!(handler = %handler, cleared, "Clear unhealthy requested");
                    }
                    None => warn!(message_id = %msg.id(), "Clear request without handler"),
                }
                true
            }
            _ => false,
        }
    }

    fn resolve_single(&self, msg: &Message) -> std::result::Result<HandlerId, RouteError> {
        match self.index.route(msg.kind(), msg.msg_type())? {
            Route::Single(handler) if !self.supervisor.is_healthy(&handler) => Err(RouteError::Unhealthy {
                handler: handler.to_string(),
            }),
            Route::Single(handler) => Ok(handler),
            Route::FanOut(_) => Err(RouteError::NoRoute {
                kind: msg.kind(),
                msg_type: msg.msg_type().to_string(),
            }),
        }
    }

    /// Command/query: one handler, one correlation, one timeout
    fn dispatch_request(&mut self, msg: Arc<Message>) {
        let handler = match self.resolve_single(&msg) {
            Ok(handler) => handler,
            Err(err) => {
                self.route_failure(&msg, err);
                return;
            }
        };

        if self.correlations.is_live(msg.id()) {
            // Causation left empty so the live request still sees exactly one outcome
            self.reject(
                None,
                ValidationError::DuplicateRequest {
                    id: msg.id().to_string(),
                },
            );
            return;
        }

        let Some(cell) = self.actors.get_mut(&handler) else {
            self.route_failure(
                &msg,
                RouteError::NoRoute {
                    kind: msg.kind(),
                    msg_type: msg.msg_type().to_string(),
                },
            );
            return;
        };
        if cell.deliver(Arc::clone(&msg)).is_err() {
            self.route_failure(
                &msg,
                RouteError::Unhealthy {
                    handler: handler.to_string(),
                },
            );
            return;
        }

        let now = Instant::now();
        let timeout = msg
            .timeout_ms()
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.default_timeout());
        let timer = self
            .timers
            .schedule(now, timeout, Arc::clone(&msg), TimerKind::Timeout);
        let entry = CorrelationEntry {
            request_id: msg.id().to_string(),
            created_at: now,
            handler: handler.clone(),
            timeout_timer: timer,
            kind: msg.kind(),
            msg_type: msg.msg_type().to_string(),
        };
        if let Err(err) = self.correlations.open(entry) {
            self.timers.cancel(timer);
            warn!(error = %err, "Correlation already live");
            return;
        }

        self.counters.dispatched_requests += 1;
        debug!(
            handler = %handler,
            message_id = %msg.id(),
            timeout_ms = timeout.as_millis() as u64,
            "Request dispatched"
        );
    }

    /// Event: fan out to healthy subscribers and publish
    fn dispatch_event(&mut self, msg: Arc<Message>) {
        let subscribers = match self.index.route(Kind::Event, msg.msg_type()) {
            Ok(Route::FanOut(subscribers)) => subscribers,
            _ => Vec::new(),
        };

        for subscriber in subscribers {
            if !self.supervisor.is_healthy(&subscriber) {
                self.counters.skipped_unhealthy += 1;
                debug!(handler = %subscriber, message_id = %msg.id(), "Skipping unhealthy subscriber");
                continue;
            }
            if let Some(cell) = self.actors.get_mut(&subscriber) {
                if cell.deliver(Arc::clone(&msg)).is_ok() {
                    self.counters.delivered_events += 1;
                }
            }
        }

        self.publish(msg);
    }

    /// Reply/error: resolve the live correlation or observe an orphan
    fn settle(&mut self, msg: Arc<Message>, origin: Origin) {
        if origin == Origin::Notice {
            self.publish(msg);
            return;
        }

        // Only the handler that received a request may answer it
        let foreign = match (&origin, msg.causation()) {
            (Origin::Actor(sender), Some(cause)) => self
                .correlations
                .get(cause)
                .map_or(false, |entry| &entry.handler != sender),
            _ => false,
        };
        if foreign {
            debug!(
                message_id = %msg.id(),
                causation = msg.causation().unwrap_or("-"),
                "Outcome sent by a handler that does not own the request"
            );
            self.observe_orphan(msg, origin);
            return;
        }

        let entry = msg
            .causation()
            .and_then(|cause| self.correlations.resolve(cause));

        match entry {
            Some(entry) => {
                self.timers.cancel(entry.timeout_timer);
                self.counters.resolved += 1;
                if origin == Origin::Resolution && msg.error_code() == Some(codes::TIMEOUT) {
                    self.counters.timeouts += 1;
                }
                debug!(
                    request_id = %entry.request_id,
                    handler = %entry.handler,
                    outcome = %msg.kind(),
                    latency_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Correlation resolved"
                );
                self.publish(msg);
            }
            None => self.observe_orphan(msg, origin),
        }
    }

    fn observe_orphan(&mut self, msg: Arc<Message>, origin: Origin) {
        self.counters.orphans += 1;
        warn!(
            message_id = %msg.id(),
            causation = msg.causation().unwrap_or("-"),
            kind = %msg.kind(),
            origin = ?origin,
            "Orphan outcome observed, not delivered"
        );
        if self.config.orphan_history == 0 {
            return;
        }
        if self.recent_orphans.len() == self.config.orphan_history {
            self.recent_orphans.pop_front();
        }
        self.recent_orphans.push_back(msg);
    }

    fn publish(&mut self, msg: Arc<Message>) {
        self.counters.published += 1;
        if self.egress.send(msg).is_err() {
            debug!("Egress closed, dropping outbound message");
        }
    }

    // ----- actor reports and supervision -------------------------------

    fn handle_report(&mut self, report: ActorReport) {
        match report {
            ActorReport::Completed {
                handler, outputs, ..
            } => {
                self.settle_in_flight(&handler);
                for output in outputs {
                    let lane = self.classify(output.msg_type());
                    self.lanes
                        .enqueue(lane, Envelope::new(Arc::new(output), Origin::Actor(handler.clone())));
                }
            }
            ActorReport::Faulted {
                handler,
                input,
                fault,
            } => self.on_fault(handler, input, fault),
            ActorReport::Returned { handler, message } => {
                self.settle_in_flight(&handler);
                if message.kind().is_request() && self.correlations.is_live(message.id()) {
                    let error = Message::handler_error_to(
                        &message,
                        codes::HANDLER_UNHEALTHY,
                        format!("Handler '{}' is unhealthy", handler),
                        handler.as_str(),
                    );
                    self.lanes
                        .enqueue(Lane::System, Envelope::new(Arc::new(error), Origin::Resolution));
                } else {
                    debug!(handler = %handler, message_id = %message.id(), "Dropping returned message");
                }
            }
        }
    }

    fn settle_in_flight(&mut self, handler: &HandlerId) {
        if let Some(cell) = self.actors.get_mut(handler) {
            cell.in_flight = cell.in_flight.saturating_sub(1);
        }
    }

    fn on_fault(&mut self, handler: HandlerId, input: Option<Arc<Message>>, fault: Fault) {
        if input.is_some() {
            self.settle_in_flight(&handler);
        }
        self.counters.actor_faults += 1;

        let now = Instant::now();
        let directive = self.supervisor.on_fault(&handler, now);
        let (directive_name, attempt) = match directive {
            SupervisorDirective::Restart { attempt, .. } => ("restart", Some(attempt)),
            SupervisorDirective::Quarantine => ("quarantine", None),
        };

        let mut notice = Message::event(
            ACTOR_FAULT_TYPE,
            json!({
                "handler": handler.as_str(),
                "fault": fault.to_string(),
                "category": fault.category(),
                "message_id": input.as_ref().map(|m| m.id()),
                "directive": directive_name,
                "attempt": attempt,
            }),
        );
        if let Some(input) = &input {
            notice = notice.with_causation(input.id());
        }
        self.lanes
            .enqueue(Lane::System, Envelope::new(Arc::new(notice), Origin::Notice));

        if let Some(input) = &input {
            let owned = self
                .correlations
                .get(input.id())
                .map(|entry| entry.handler == handler)
                .unwrap_or(false);
            if input.kind().is_request() && owned {
                let error =
                    Message::handler_error_to(input, codes::ACTOR_FAULT, fault.to_string(), handler.as_str());
                self.lanes
                    .enqueue(Lane::System, Envelope::new(Arc::new(error), Origin::Resolution));
            }
        }

        match directive {
            SupervisorDirective::Restart { after, .. } => {
                if !self.pending_respawn.contains_key(&handler) {
                    let payload = Message::event(RESPAWN_TYPE, json!({ "handler": handler.as_str() }));
                    let timer = self
                        .timers
                        .schedule(now, after, Arc::new(payload), TimerKind::Retry);
                    self.pending_respawn.insert(handler, timer);
                }
            }
            SupervisorDirective::Quarantine => {
                self.counters.quarantines += 1;
                if let Some(timer) = self.pending_respawn.remove(&handler) {
                    self.timers.cancel(timer);
                }
                if let Some(cell) = self.actors.get_mut(&handler) {
                    cell.stop();
                }
            }
        }
    }

    fn respawn(&mut self, handler: HandlerId) {
        self.pending_respawn.remove(&handler);
        if !self.supervisor.is_healthy(&handler) {
            debug!(handler = %handler, "Skipping respawn of quarantined handler");
            return;
        }
        let Some(cell) = self.actors.get_mut(&handler) else {
            warn!(handler = %handler, "Respawn for unknown handler");
            return;
        };
        cell.respawn();
        self.counters.respawns += 1;
        info!(handler = %handler, "Actor respawned");

        let notice = Message::event(ACTOR_RESPAWNED_TYPE, json!({ "handler": handler.as_str() }));
        self.lanes
            .enqueue(Lane::System, Envelope::new(Arc::new(notice), Origin::Notice));
    }

    // ----- inspection and shutdown -------------------------------------

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn index(&self) -> &CapabilityIndex {
        &self.index
    }

    pub fn is_correlation_live(&self, request_id: &str) -> bool {
        self.correlations.is_live(request_id)
    }

    pub fn is_healthy(&self, handler: &HandlerId) -> bool {
        self.supervisor.is_healthy(handler)
    }

    pub fn stats(&self) -> DispatchStats {
        let actors = self
            .actors
            .iter()
            .map(|(id, cell)| {
                let stats = cell.stats();
                (
                    id.to_string(),
                    ActorSnapshot {
                        messages_processed: stats.messages_processed.load(Ordering::Relaxed),
                        avg_processing_time_ns: stats.avg_processing_time_ns(),
                        faults: stats.faults.load(Ordering::Relaxed),
                        in_flight: cell.in_flight,
                        processing: stats.is_processing(),
                        healthy: self.supervisor.is_healthy(id),
                        last_fault: stats.last_fault(),
                    },
                )
            })
            .collect();

        DispatchStats {
            counters: self.counters.clone(),
            live_correlations: self.correlations.len(),
            pending_timers: self.timers.len(),
            lane_depth: self.lanes.len_per_lane(),
            unhealthy: self
                .supervisor
                .unhealthy()
                .iter()
                .map(ToString::to_string)
                .collect(),
            recent_orphans: self
                .recent_orphans
                .iter()
                .map(|m| m.id().to_string())
                .collect(),
            actors,
        }
    }

    /// Stop every actor host and wait briefly for them to exit
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!(actors = self.actors.len(), "Shutting down dispatcher");
        for cell in self.actors.values_mut() {
            cell.stop();
        }
        for cell in self.actors.values_mut() {
            cell.join(SHUTDOWN_GRACE).await;
        }
        info!(stats = ?self.counters, "Dispatcher shutdown complete");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Best-effort string field of a record that may not parse as a message
fn raw_field(text: &str, pointer: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn handler_field(msg: &Message) -> Option<HandlerId> {
    msg.data()
        .get("handler")
        .and_then(Value::as_str)
        .map(HandlerId::new)
}
