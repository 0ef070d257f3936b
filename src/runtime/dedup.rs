//! Recently seen requests
//!
//! Brokers may redeliver the same request. The dispatcher remembers the last
//! few request keys and drops repeats. The option is part of the key: the
//! synchronous runner sends one activity twice, first root-only and then
//! unconditionally, and tiers that rejected the first copy must still see the
//! second.

use std::collections::{HashSet, VecDeque};

use super::activity::ActivityId;
use super::command::{Command, CommandKind};

/// Identity of a request for duplicate suppression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    kind: CommandKind,
    id: ActivityId,
    option: String,
}

impl RequestKey {
    /// Key of `command`
    pub fn of(command: &Command) -> Self {
        Self {
            kind: command.kind(),
            id: command.id().clone(),
            option: command.option().to_string(),
        }
    }
}

/// Bounded FIFO set of request keys
#[derive(Debug)]
pub struct DuplicateCache {
    order: VecDeque<RequestKey>,
    seen: HashSet<RequestKey>,
    limit: usize,
}

impl DuplicateCache {
    /// Remember at most `limit` keys
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            order: VecDeque::with_capacity(limit),
            seen: HashSet::with_capacity(limit),
            limit,
        }
    }

    /// Record `command`; returns `true` if its key was already present
    pub fn duplicate(&mut self, command: &Command) -> bool {
        let key = RequestKey::of(command);
        if self.seen.contains(&key) {
            return true;
        }
        if self.order.len() == self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        false
    }

    /// Number of remembered keys
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: CommandKind, id: &str, option: &str) -> Command {
        Command::new(kind, option, "f", ActivityId::new(id), "dev", Vec::new()).unwrap()
    }

    #[test]
    fn test_repeats_are_flagged() {
        let mut cache = DuplicateCache::new(4);
        assert!(!cache.duplicate(&request(CommandKind::RexecSyn, "a", "true")));
        assert!(cache.duplicate(&request(CommandKind::RexecSyn, "a", "true")));
        // same id, different kind is a new request
        assert!(!cache.duplicate(&request(CommandKind::RexecResGet, "a", "true")));
        // root-only copy followed by the unconditional copy
        assert!(!cache.duplicate(&request(CommandKind::RexecSyn, "a", "machtype === \"FOG\"")));
    }

    #[test]
    fn test_oldest_key_is_evicted() {
        let mut cache = DuplicateCache::new(2);
        cache.duplicate(&request(CommandKind::RexecAsy, "a", "true"));
        cache.duplicate(&request(CommandKind::RexecAsy, "b", "true"));
        cache.duplicate(&request(CommandKind::RexecAsy, "c", "true"));
        assert_eq!(cache.len(), 2);
        assert!(!cache.duplicate(&request(CommandKind::RexecAsy, "a", "true")));
        assert!(cache.duplicate(&request(CommandKind::RexecAsy, "c", "true")));
    }
}
