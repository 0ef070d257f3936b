//! Inbound dispatch and the outbound pump
//!
//! Every command the transport receives lands on one inbound queue with two
//! priority levels. The dispatcher drains it (high first), creates serving
//! activities for remote requests, routes replies to the activity waiting for
//! them, and answers protocol housekeeping (READY, STATUS) itself. The
//! outbound pump is the only task that talks to the transport.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::RuntimeConfig;
use super::activity::{Activity, ActivityTable};
use super::command::{Argument, Command, CommandKind, NAK_NOT_FOUND};
use super::condition::{PlacementEvaluator, Tier};
use super::dedup::DuplicateCache;
use super::error::{ActivityError, RuntimeError, TransportError, TransportResult};
use super::mailbox::{DoorbellReceiver, Envelope, Outbox, Target};
use super::transport::Transport;
use super::worker::Worker;

/// Remaining wait below which the start-time hold spins instead of sleeping
const SPIN_WINDOW: Duration = Duration::from_millis(1);

/// Sending side of the inbound queue, held by transports
#[derive(Clone)]
pub struct InboundHandle {
    high: mpsc::UnboundedSender<Envelope>,
    low: mpsc::UnboundedSender<Envelope>,
}

impl InboundHandle {
    /// Decode a payload received from `from` and queue it
    pub fn deliver(&self, from: Tier, bytes: &[u8]) -> Result<(), RuntimeError> {
        let command = Command::decode(bytes)?;
        Ok(self.deliver_command(from, command)?)
    }

    /// Queue an already decoded command
    pub fn deliver_command(&self, from: Tier, command: Command) -> TransportResult<()> {
        let lane = if command.kind() == CommandKind::Go {
            &self.high
        } else {
            &self.low
        };
        lane.send(Envelope::new(from, command))
            .map_err(|_| TransportError::Closed("inbound queue".to_string()))
    }
}

/// Receiving side of the inbound queue
pub struct InboundReceiver {
    high: mpsc::UnboundedReceiver<Envelope>,
    low: mpsc::UnboundedReceiver<Envelope>,
}

impl InboundReceiver {
    /// Next envelope, high priority first
    pub async fn recv(&mut self) -> Option<Envelope> {
        tokio::select! {
            biased;
            Some(envelope) = self.high.recv() => Some(envelope),
            Some(envelope) = self.low.recv() => Some(envelope),
            else => None,
        }
    }
}

/// Create the two-level inbound queue
pub fn inbound_queue() -> (InboundHandle, InboundReceiver) {
    let (high, high_rx) = mpsc::unbounded_channel();
    let (low, low_rx) = mpsc::unbounded_channel();
    (
        InboundHandle { high, low },
        InboundReceiver {
            high: high_rx,
            low: low_rx,
        },
    )
}

/// Inbound dispatcher
pub struct EventLoop {
    inbound: InboundReceiver,
    table: Arc<ActivityTable>,
    evaluator: Arc<dyn PlacementEvaluator>,
    config: Arc<RuntimeConfig>,
    dedup: DuplicateCache,
    control: Outbox,
}

impl EventLoop {
    /// Build a dispatcher; `control` carries the replies it sends itself
    pub fn new(
        inbound: InboundReceiver,
        table: Arc<ActivityTable>,
        evaluator: Arc<dyn PlacementEvaluator>,
        config: Arc<RuntimeConfig>,
        control: Outbox,
    ) -> Self {
        Self {
            inbound,
            dedup: DuplicateCache::new(config.dedup_cache_size),
            table,
            evaluator,
            config,
            control,
        }
    }

    /// Dispatch until every inbound handle is dropped
    pub async fn run(mut self) {
        while let Some(envelope) = self.inbound.recv().await {
            self.dispatch(envelope).await;
        }
        tracing::debug!("inbound queue closed");
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        let kind = envelope.command.kind();
        tracing::debug!(
            kind = %kind,
            activity = %envelope.command.id(),
            from = %envelope.origin,
            "dispatch"
        );

        match kind {
            CommandKind::RexecAsy | CommandKind::RexecAsy2 | CommandKind::RexecAsyCbk => {
                if !self.is_duplicate(&envelope.command) {
                    self.serve(envelope);
                }
            }
            CommandKind::RexecSyn => {
                if !self.is_duplicate(&envelope.command) {
                    self.serve_sync(envelope).await;
                }
            }
            CommandKind::Ready => self.grant_start(&envelope),
            CommandKind::RexecResGet => match self.table.served(envelope.command.id()) {
                Some(activity) => route(&activity, envelope),
                None => self.reject(&envelope, NAK_NOT_FOUND),
            },
            CommandKind::RexecKill => match self.table.served(envelope.command.id()) {
                Some(activity) => route(&activity, envelope),
                None => tracing::debug!(activity = %envelope.command.id(), "kill for unknown activity"),
            },
            CommandKind::Status => self.report_status(&envelope),
            CommandKind::RexecAck
            | CommandKind::RexecNak
            | CommandKind::RexecResPut
            | CommandKind::Timeout => match self.table.local(envelope.command.id()) {
                Some(activity) => route(&activity, envelope),
                None => tracing::debug!(
                    kind = %kind,
                    activity = %envelope.command.id(),
                    "reply for unknown activity dropped"
                ),
            },
            CommandKind::Go => {
                tracing::warn!(activity = %envelope.command.id(), "unexpected start signal dropped")
            }
        }
    }

    fn is_duplicate(&mut self, command: &Command) -> bool {
        let duplicate = self.dedup.duplicate(command);
        if duplicate {
            tracing::debug!(kind = %command.kind(), activity = %command.id(), "duplicate request dropped");
        }
        duplicate
    }

    /// Create the serving activity and its worker
    fn spawn_server(&self, envelope: &Envelope) -> Option<Arc<Activity>> {
        let command = &envelope.command;
        let Some(template) = self.table.template(command.name()) else {
            self.reject(envelope, NAK_NOT_FOUND);
            return None;
        };

        let activity = match self
            .table
            .create_with_id(command.name(), command.id().clone(), true)
        {
            Ok(activity) => activity,
            Err(ActivityError::DuplicateInstance(id)) => {
                tracing::debug!(activity = %id, "already serving; request ignored");
                return None;
            }
            Err(e) => {
                tracing::warn!(activity = %command.id(), error = %e, "cannot serve request");
                return None;
            }
        };

        let worker = Worker::new(
            activity.clone(),
            template,
            self.table.clone(),
            self.evaluator.clone(),
            self.config.clone(),
        );
        activity.attach_task(tokio::spawn(worker.run()));
        Some(activity)
    }

    fn serve(&self, envelope: Envelope) {
        if let Some(activity) = self.spawn_server(&envelope) {
            route(&activity, envelope);
        }
    }

    async fn serve_sync(&mut self, envelope: Envelope) {
        if self.table.template(envelope.command.name()).is_none() {
            self.reject(&envelope, NAK_NOT_FOUND);
            return;
        }

        let start = if self.evaluator.current_root_tier() == self.config.tier {
            None
        } else {
            self.rendezvous(&envelope.command).await
        };

        let Some(activity) = self.spawn_server(&envelope) else {
            return;
        };
        match start {
            Some(start) => {
                tokio::spawn(async move {
                    hold_until(start).await;
                    route(&activity, envelope);
                });
            }
            None => route(&activity, envelope),
        }
    }

    /// Ask the root tier for a start time and wait for it
    async fn rendezvous(&mut self, request: &Command) -> Option<DateTime<Utc>> {
        let root = self.evaluator.current_root_tier();
        let ready = Command::new(
            CommandKind::Ready,
            "READY",
            request.name(),
            request.id().clone(),
            self.config.originator(),
            Vec::new(),
        )
        .ok()?;
        if let Err(e) = self.control.send(Target::Tier(root), ready) {
            tracing::warn!(error = %e, "cannot publish READY; starting immediately");
            return None;
        }

        let deadline = Instant::now() + self.config.sync_start_timeout();
        loop {
            match tokio::time::timeout_at(deadline, self.inbound.high.recv()).await {
                Ok(Some(envelope))
                    if envelope.command.kind() == CommandKind::Go
                        && envelope.command.id() == request.id() =>
                {
                    let start = parse_start_time(envelope.command.option());
                    if start.is_none() {
                        tracing::warn!(option = envelope.command.option(), "unreadable start time");
                    }
                    return start;
                }
                Ok(Some(envelope)) => {
                    tracing::debug!(activity = %envelope.command.id(), "stale start signal dropped")
                }
                Ok(None) | Err(_) => {
                    tracing::warn!(activity = %request.id(), "no start signal; starting immediately");
                    return None;
                }
            }
        }
    }

    fn grant_start(&self, envelope: &Envelope) {
        let start = Utc::now()
            + chrono::Duration::from_std(self.config.sync_start_delay()).unwrap_or_default();
        let option = format_start_time(start);
        match Command::reply_to(
            &envelope.command,
            CommandKind::Go,
            option,
            self.config.originator(),
            Vec::new(),
        ) {
            Ok(go) => self.reply(envelope.origin, go),
            Err(e) => tracing::warn!(error = %e, "cannot build start signal"),
        }
    }

    fn report_status(&self, envelope: &Envelope) {
        let Some(activity) = self.table.served(envelope.command.id()) else {
            self.reject(envelope, NAK_NOT_FOUND);
            return;
        };
        match Command::reply_to(
            &envelope.command,
            CommandKind::RexecAck,
            self.config.tier.label(),
            self.config.originator(),
            vec![Argument::Str(activity.state().label().to_string())],
        ) {
            Ok(reply) => self.reply(envelope.origin, reply),
            Err(e) => tracing::warn!(error = %e, "cannot build status reply"),
        }
    }

    fn reject(&self, envelope: &Envelope, reason: &str) {
        tracing::debug!(activity = %envelope.command.id(), name = envelope.command.name(), reason, "rejecting");
        match Command::reply_to(
            &envelope.command,
            CommandKind::RexecNak,
            self.config.tier.label(),
            self.config.originator(),
            vec![Argument::Str(reason.to_string())],
        ) {
            Ok(nak) => self.reply(envelope.origin, nak),
            Err(e) => tracing::warn!(error = %e, "cannot build rejection"),
        }
    }

    fn reply(&self, tier: Tier, command: Command) {
        if let Err(e) = self.control.send(Target::Tier(tier), command) {
            tracing::warn!(tier = %tier, error = %e, "control reply dropped");
        }
    }
}

fn route(activity: &Activity, envelope: Envelope) {
    let kind = envelope.command.kind();
    if let Err(e) = activity.deliver(envelope) {
        tracing::warn!(activity = %activity.id(), kind = %kind, error = %e, "inbox rejected command");
    }
}

/// Start time as carried in a GOGOGO option: seconds since the Unix epoch
pub fn format_start_time(start: DateTime<Utc>) -> String {
    format!("{:.3}", start.timestamp_millis() as f64 / 1000.0)
}

/// Parse a GOGOGO option
pub fn parse_start_time(option: &str) -> Option<DateTime<Utc>> {
    let seconds: f64 = option.trim().parse().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((seconds * 1000.0).round() as i64).single()
}

/// Wait until the wall clock reaches `start`
///
/// Sleeps for the coarse part and spins through the last millisecond, so the
/// caller is never released early.
pub async fn hold_until(start: DateTime<Utc>) {
    let remaining = (start - Utc::now()).to_std().unwrap_or_default();
    if remaining > SPIN_WINDOW {
        tokio::time::sleep(remaining - SPIN_WINDOW).await;
    }
    while Utc::now() < start {
        std::hint::spin_loop();
        tokio::task::yield_now().await;
    }
}

/// Drain outboxes into the transport whenever their doorbell rings
pub async fn run_outbound_pump(mut doorbell: DoorbellReceiver, transport: Arc<dyn Transport>) {
    while let Some(lane) = doorbell.recv().await {
        for outbound in lane.drain() {
            let command = &outbound.command;
            match outbound.target {
                Target::Broadcast => {
                    for tier in Tier::ALL {
                        if transport.is_connected(tier) {
                            send(transport.as_ref(), tier, command);
                        }
                    }
                }
                Target::Tier(tier) => send(transport.as_ref(), tier, command),
            }
        }
    }
    tracing::debug!("outbound pump stopped");
}

fn send(transport: &dyn Transport, tier: Tier, command: &Command) {
    match transport.send(tier, command) {
        Ok(()) => tracing::trace!(tier = %tier, kind = %command.kind(), activity = %command.id(), "sent"),
        Err(e) => tracing::warn!(tier = %tier, kind = %command.kind(), error = %e, "send failed"),
    }
}
