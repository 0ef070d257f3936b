//! Synchronous remote execution
//!
//! A synchronous call first asks the root tier alone to accept the activity.
//! If at least one tier acknowledges, the same activity is broadcast to every
//! tier (the root recognizes it by id and ignores it), the caller sleeps for
//! the advertised lease, and then pulls the result.

use std::sync::Arc;
use std::time::Duration;

use super::Invoker;
use super::activity::{Activity, ActivityState};
use super::command::{Argument, Command, CommandKind};
use super::condition::{UNCONDITIONAL, root_condition};
use super::error::{ActivityError, Result};

impl Invoker {
    /// Run `name` synchronously and return its result
    ///
    /// `Ok(None)` means no tier produced a result in time: the root never
    /// accepted the request or every result reply was empty or missing.
    pub async fn rexec_sync(&self, name: &str, args: Vec<Argument>) -> Result<Option<Argument>> {
        let activity = self.prepare(name, &args)?;
        let outcome = self.run_sync(&activity, args).await;

        self.runs.remove(activity.id());
        self.table.free(&activity);
        outcome
    }

    /// Template lookup, argument check and local activity allocation
    pub(crate) fn prepare(&self, name: &str, args: &[Argument]) -> Result<Arc<Activity>> {
        let template = self
            .table
            .template(name)
            .ok_or_else(|| ActivityError::NotFound(name.to_string()))?;
        template
            .signature
            .check(args)
            .map_err(|e| ActivityError::ParameterError {
                name: name.to_string(),
                detail: e.to_string(),
            })?;

        let activity = self.table.create(name, false)?;
        activity.set_arguments(args.to_vec());
        Ok(activity)
    }

    async fn run_sync(&self, activity: &Activity, args: Vec<Argument>) -> Result<Option<Argument>> {
        let root = self.evaluator.current_root_tier();
        let root_only = root_condition(root);
        let originator = self.config.originator();
        let name = activity.name();
        let id = activity.id().clone();

        let root_cmd = Command::new(
            CommandKind::RexecSyn,
            root_only.clone(),
            name,
            id.clone(),
            originator.clone(),
            args.clone(),
        )?;
        let broadcast_cmd = Command::new(
            CommandKind::RexecSyn,
            UNCONDITIONAL,
            name,
            id.clone(),
            originator.clone(),
            args,
        )?;

        let entry = match self.runs.insert(&root_cmd, self.evaluator.as_ref()) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(activity = %id, error = %e, "cannot track synchronous call");
                activity.set_state(ActivityState::FatalError);
                return Ok(None);
            }
        };
        let expected = entry.expected_replies;
        tracing::debug!(activity = %id, root = %root, expected, "synchronous call");

        // Acknowledgment phase: only the root may accept.
        activity.outbox().broadcast(root_cmd)?;
        let ack_timeout = self.config.ack_timeout();
        let mut errors = 0;
        for i in 0..expected {
            let reply = activity.await_reply(ack_timeout).await?;
            match reply.kind() {
                CommandKind::Timeout | CommandKind::RexecNak => errors += 1,
                _ => {
                    activity.store_reply(i - errors, reply);
                }
            }
        }
        if errors == expected {
            tracing::warn!(activity = %id, "root did not accept the activity");
            activity.mark_timed_out();
            return Ok(None);
        }
        activity.raise_state(ActivityState::Started);

        // Broadcast phase, then pull results after the lease.
        activity.outbox().broadcast(broadcast_cmd)?;
        let lease = activity.lease_hint();
        tokio::time::sleep(lease).await;

        let pull = Command::new(
            CommandKind::RexecResGet,
            root_only,
            name,
            id.clone(),
            originator,
            Vec::new(),
        )?;
        activity.outbox().broadcast(pull)?;

        let result = self.collect_result(activity, expected, lease).await?;
        match &result {
            Some(_) => activity.mark_completed(),
            None => {
                tracing::debug!(activity = %id, "no result arrived");
                activity.mark_timed_out();
            }
        }
        Ok(result)
    }

    /// Collect one result reply per expected slot; the first with results wins
    ///
    /// Acknowledgments and rejections arriving this late belong to the
    /// earlier phases and do not use up a slot.
    async fn collect_result(
        &self,
        activity: &Activity,
        expected: usize,
        lease: Duration,
    ) -> Result<Option<Argument>> {
        let mut wait = lease.max(self.config.ack_timeout());
        let mut result = None;
        let mut slot = 0;
        while slot < expected {
            let reply = activity.await_reply(wait).await?;
            if !matches!(reply.kind(), CommandKind::RexecResPut | CommandKind::Timeout) {
                tracing::trace!(activity = %activity.id(), kind = %reply.kind(), "late reply discarded");
                continue;
            }
            if result.is_none() && reply.carries_results() {
                result = reply.args().first().cloned();
            }
            slot += 1;
            wait = self.config.result_grace();
        }
        Ok(result)
    }
}
