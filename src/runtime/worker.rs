//! Per-activity worker serving remote requests
//!
//! The dispatcher spawns one worker for each activity it creates on behalf of
//! a remote caller. The worker is the only consumer of that activity's inbox,
//! so at most one callback runs per activity id. It frees the activity when
//! it is done.

use std::sync::Arc;
use tracing::Instrument;

use super::RuntimeConfig;
use super::activity::{Activity, ActivityTable, ActivityTemplate, ExecutionKind};
use super::command::{
    Argument, Command, CommandKind, EMPTY_MARKER, NAK_CONDITION_FALSE, NAK_ILLEGAL_PARAMS,
    RESULTS_MARKER,
};
use super::condition::{PlacementEvaluator, Tier};
use super::error::{CommandResult, RuntimeError};
use super::mailbox::{Envelope, Target};

/// What the worker does after handling a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    Finish,
}

/// Task state for one served activity
pub struct Worker {
    activity: Arc<Activity>,
    template: ActivityTemplate,
    table: Arc<ActivityTable>,
    evaluator: Arc<dyn PlacementEvaluator>,
    config: Arc<RuntimeConfig>,
}

impl Worker {
    /// Bind a worker to a freshly created activity
    pub fn new(
        activity: Arc<Activity>,
        template: ActivityTemplate,
        table: Arc<ActivityTable>,
        evaluator: Arc<dyn PlacementEvaluator>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            activity,
            template,
            table,
            evaluator,
            config,
        }
    }

    /// Serve until the activity is finished, killed or freed
    pub async fn run(self) {
        let span = tracing::debug_span!("worker", activity = %self.activity.id());
        async move {
            while let Some(envelope) = self.activity.inbox().recv().await {
                if self.handle(envelope).await == Next::Finish {
                    break;
                }
            }
            self.table.free(&self.activity);
            tracing::debug!(state = %self.activity.state(), "worker finished");
        }
        .instrument(span)
        .await
    }

    async fn handle(&self, envelope: Envelope) -> Next {
        let kind = envelope.command.kind();
        match kind {
            CommandKind::RexecSyn => self.serve(&envelope).await,
            k if k.is_async_request() => self.serve(&envelope).await,
            CommandKind::RexecResGet => {
                self.publish_result(&envelope);
                Next::Finish
            }
            CommandKind::RexecKill => {
                tracing::info!("killed by {}", envelope.command.originator());
                Next::Finish
            }
            other => {
                tracing::debug!(kind = %other, "unexpected command ignored");
                Next::Continue
            }
        }
    }

    async fn serve(&self, envelope: &Envelope) -> Next {
        let command = &envelope.command;
        let tier = self.config.tier;

        if !self.evaluator.is_eligible(command.option(), tier) {
            self.table.free(&self.activity);
            self.reply(envelope.origin, self.nak(command, NAK_CONDITION_FALSE));
            return Next::Finish;
        }
        if !self.template.kind.accepts(command.kind())
            || self.template.signature.check(command.args()).is_err()
        {
            self.table.free(&self.activity);
            self.reply(envelope.origin, self.nak(command, NAK_ILLEGAL_PARAMS));
            return Next::Finish;
        }

        self.reply(
            envelope.origin,
            Command::reply_to(
                command,
                CommandKind::RexecAck,
                tier.label(),
                self.config.originator(),
                vec![Argument::Int(self.config.default_lease_ms as i64)],
            ),
        );

        self.activity.set_arguments(command.args().to_vec());
        self.activity.mark_running();
        self.activity.touch();
        self.execute(command.args().to_vec()).await;

        match self.template.kind {
            ExecutionKind::Async => Next::Finish,
            ExecutionKind::Sync => self.await_result_pull().await,
        }
    }

    async fn execute(&self, args: Vec<Argument>) {
        let callback = self.template.callback.clone();
        match tokio::task::spawn_blocking(move || callback(&args)).await {
            Ok(Ok(result)) => {
                self.activity.set_result(result);
                self.activity.mark_completed();
            }
            Ok(Err(e)) => {
                tracing::warn!(name = %self.template.name, error = %e, "callback failed");
                self.activity.mark_error();
            }
            Err(e) => {
                tracing::error!(name = %self.template.name, error = %e, "callback panicked");
                self.activity.mark_error();
            }
        }
        self.activity.touch();
    }

    async fn await_result_pull(&self) -> Next {
        let retention = self.config.result_retention();
        loop {
            let Some(envelope) = self.activity.inbox().recv_timeout(retention).await else {
                tracing::debug!("result never pulled");
                return Next::Finish;
            };
            match envelope.command.kind() {
                CommandKind::RexecResGet => {
                    self.publish_result(&envelope);
                    return Next::Finish;
                }
                CommandKind::RexecKill => return Next::Finish,
                other => tracing::debug!(kind = %other, "ignored while holding result"),
            }
        }
    }

    fn publish_result(&self, envelope: &Envelope) {
        let (marker, args) = match self.activity.result() {
            Some(value) => (RESULTS_MARKER, vec![value]),
            None => (EMPTY_MARKER, Vec::new()),
        };
        self.reply(
            envelope.origin,
            Command::reply_to(
                &envelope.command,
                CommandKind::RexecResPut,
                self.config.tier.label(),
                marker,
                args,
            ),
        );
    }

    fn nak(&self, request: &Command, reason: &str) -> CommandResult<Command> {
        tracing::debug!(reason, option = request.option(), "rejecting request");
        Command::reply_to(
            request,
            CommandKind::RexecNak,
            self.config.tier.label(),
            self.config.originator(),
            vec![Argument::Str(reason.to_string())],
        )
    }

    fn reply(&self, tier: Tier, reply: CommandResult<Command>) {
        let sent = match reply {
            Ok(command) => self
                .activity
                .outbox()
                .send(Target::Tier(tier), command)
                .map_err(RuntimeError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            tracing::warn!(tier = %tier, error = %e, "reply dropped");
        }
    }
}
