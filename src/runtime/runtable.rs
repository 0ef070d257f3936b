//! In-flight remote invocations
//!
//! One entry per activity id, created when a runner dispatches a request and
//! removed by the same runner once its replies are accounted for. Entries are
//! never evicted by age.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use super::activity::ActivityId;
use super::command::Command;
use super::condition::PlacementEvaluator;
use super::error::RunTableError;

/// Bookkeeping for one dispatched invocation
#[derive(Debug, Clone)]
pub struct RunEntry {
    /// Activity the replies belong to
    pub id: ActivityId,
    /// How many replies the runner waits for
    pub expected_replies: usize,
    /// The request that was sent
    pub command: Command,
    /// When the entry was inserted
    pub created_at: DateTime<Utc>,
}

/// Table of in-flight invocations
#[derive(Default)]
pub struct RunTable {
    entries: Mutex<HashMap<ActivityId, RunEntry>>,
}

impl RunTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `command`, sizing the expected replies from its condition
    pub fn insert(
        &self,
        command: &Command,
        evaluator: &dyn PlacementEvaluator,
    ) -> Result<RunEntry, RunTableError> {
        let mut entries = self.entries.lock();
        match entries.entry(command.id().clone()) {
            Entry::Occupied(_) => Err(RunTableError::DuplicateEntry(command.id().clone())),
            Entry::Vacant(slot) => {
                let entry = RunEntry {
                    id: command.id().clone(),
                    expected_replies: evaluator.resolve_expected_replies(command.option()),
                    command: command.clone(),
                    created_at: Utc::now(),
                };
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    /// Entry for the activity `command` belongs to
    pub fn find(&self, command: &Command) -> Option<RunEntry> {
        self.entries.lock().get(command.id()).cloned()
    }

    /// Drop the entry for `id`
    pub fn remove(&self, id: &ActivityId) -> Option<RunEntry> {
        self.entries.lock().remove(id)
    }

    /// Number of in-flight invocations
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::command::CommandKind;
    use crate::runtime::condition::{StaticTopology, Tier};

    fn request(id: &str) -> Command {
        Command::new(CommandKind::RexecAsy, "true", "f", ActivityId::new(id), "dev", Vec::new()).unwrap()
    }

    #[test]
    fn test_insert_find_remove() {
        let table = RunTable::new();
        let topology = StaticTopology::new(&[Tier::Device, Tier::Fog]);
        let cmd = request("a");

        let entry = table.insert(&cmd, &topology).unwrap();
        assert_eq!(entry.expected_replies, 2);
        assert_eq!(table.find(&cmd).unwrap().id, ActivityId::new("a"));
        assert_eq!(table.len(), 1);

        assert!(table.remove(cmd.id()).is_some());
        assert!(table.find(&cmd).is_none());
        assert!(table.remove(cmd.id()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_one_entry_per_activity() {
        let table = RunTable::new();
        let topology = StaticTopology::new(&Tier::ALL);
        table.insert(&request("a"), &topology).unwrap();
        assert!(matches!(
            table.insert(&request("a"), &topology),
            Err(RunTableError::DuplicateEntry(id)) if id.as_str() == "a"
        ));
        table.insert(&request("b"), &topology).unwrap();
        assert_eq!(table.len(), 2);
    }
}
