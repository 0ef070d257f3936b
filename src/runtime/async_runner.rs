//! Asynchronous remote execution
//!
//! One request fans out to every tier admitted by the placement condition.
//! The caller collects one reply per expected tier, folds them into the
//! activity state and, when some tier stayed silent, attempts a single
//! recovery through the device tier.

use std::sync::Arc;

use super::Invoker;
use super::activity::{Activity, ActivityState};
use super::command::{
    Argument, Command, CommandKind, NAK_CONDITION_FALSE, NAK_ILLEGAL_PARAMS, NAK_NOT_FOUND,
};
use super::condition::Tier;
use super::error::{Result, RuntimeError};
use super::mailbox::Target;
use super::runtable::RunEntry;

impl Invoker {
    /// Fan `name` out to the tiers admitted by `condition`
    ///
    /// The returned activity stays allocated so its state and replies can be
    /// inspected; release it with [`super::Runtime::free`].
    pub async fn rexec_async(
        &self,
        name: &str,
        condition: &str,
        args: Vec<Argument>,
    ) -> Result<Arc<Activity>> {
        let activity = self.prepare(name, &args)?;
        let request = Command::new(
            CommandKind::RexecAsy,
            condition,
            name,
            activity.id().clone(),
            self.config.originator(),
            args,
        )?;

        let entry = match self.runs.insert(&request, self.evaluator.as_ref()) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(activity = %activity.id(), error = %e, "cannot track asynchronous call");
                activity.set_state(ActivityState::FatalError);
                return Ok(activity);
            }
        };

        if let Err(e) = activity.outbox().broadcast(request) {
            tracing::error!(activity = %activity.id(), error = %e, "outbox full");
            activity.set_state(ActivityState::FatalError);
            self.runs.remove(activity.id());
            return Ok(activity);
        }

        let outcome = self.gather(&activity, &entry).await;
        activity.touch();
        self.runs.remove(activity.id());
        outcome.map(|()| activity)
    }

    async fn gather(&self, activity: &Activity, entry: &RunEntry) -> Result<()> {
        let timeout = self.config.reply_timeout();
        let mut errors = 0;
        for i in 0..entry.expected_replies {
            let reply = activity.await_reply(timeout).await?;
            if reply.kind() == CommandKind::Timeout {
                errors += 1;
            } else {
                activity.store_reply(i - errors, reply);
            }
        }

        if errors > 0 {
            tracing::debug!(activity = %activity.id(), errors, "missing replies");
            activity.raise_state(ActivityState::Partial);
            self.recover_missing(activity, entry);
        } else {
            for reply in activity.replies() {
                activity.raise_state(reply_severity(&reply));
            }
        }
        tracing::debug!(activity = %activity.id(), state = %activity.state(), "asynchronous call settled");
        Ok(())
    }

    /// Single recovery attempt for silent tiers
    fn recover_missing(&self, activity: &Activity, entry: &RunEntry) {
        let replies = activity.replies();
        let device_replied = replies.iter().any(|r| r.option() == Tier::Device.label());

        if !device_replied {
            tracing::warn!(activity = %activity.id(), "no device reply; giving up");
            activity.set_state(ActivityState::FatalError);
            let sent = Command::new(
                CommandKind::RexecKill,
                "",
                activity.name(),
                activity.id().clone(),
                self.config.originator(),
                Vec::new(),
            )
            .map_err(RuntimeError::from)
            .and_then(|kill| Ok(activity.outbox().broadcast(kill)?));
            if let Err(e) = sent {
                tracing::debug!(activity = %activity.id(), error = %e, "kill not sent");
            }
            return;
        }

        let acknowledged = activity
            .reply(0)
            .is_some_and(|first| first.kind() == CommandKind::RexecAck);
        if !acknowledged {
            return;
        }

        match entry.command.rebuild(CommandKind::RexecAsy2) {
            Ok(retry) => {
                tracing::info!(activity = %activity.id(), "re-requesting through the device tier");
                if let Err(e) = activity.outbox().send(Target::Tier(Tier::Device), retry) {
                    tracing::warn!(activity = %activity.id(), error = %e, "retry not sent");
                }
            }
            Err(e) => tracing::warn!(activity = %activity.id(), error = %e, "cannot rebuild retry"),
        }
    }
}

/// State implied by a single reply
fn reply_severity(reply: &Command) -> ActivityState {
    match (reply.kind(), reply.nak_reason()) {
        (CommandKind::RexecAck, _) => ActivityState::Started,
        (CommandKind::RexecNak, Some(NAK_ILLEGAL_PARAMS)) => ActivityState::ParameterError,
        (CommandKind::RexecNak, Some(NAK_NOT_FOUND)) => ActivityState::FatalError,
        (CommandKind::RexecNak, Some(NAK_CONDITION_FALSE)) => ActivityState::NegativeCond,
        _ => ActivityState::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::ActivityId;

    fn reply(kind: CommandKind, args: Vec<Argument>) -> Command {
        Command::new(kind, "FOG", "f", ActivityId::new("1"), "fog", args).unwrap()
    }

    #[test]
    fn test_reply_severity() {
        let nak = |reason: &str| reply(CommandKind::RexecNak, vec![Argument::Str(reason.into())]);
        assert_eq!(reply_severity(&reply(CommandKind::RexecAck, vec![])), ActivityState::Started);
        assert_eq!(reply_severity(&nak(NAK_ILLEGAL_PARAMS)), ActivityState::ParameterError);
        assert_eq!(reply_severity(&nak(NAK_NOT_FOUND)), ActivityState::FatalError);
        assert_eq!(reply_severity(&nak(NAK_CONDITION_FALSE)), ActivityState::NegativeCond);
        assert_eq!(reply_severity(&nak("SOMETHING-ELSE")), ActivityState::Empty);
    }
}
