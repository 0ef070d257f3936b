//! Runtime status for the CLI and tests
//!
//! A `RuntimeStatus` is a serializable point-in-time view of a node: who it
//! is, where it sits in the hierarchy, and what it is currently doing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RuntimeConfig;
use super::activity::{ActivitySummary, ActivityTable};
use super::condition::{PlacementEvaluator, StaticTopology, Tier};
use super::runtable::RunTable;

/// Snapshot of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    /// Node identity
    pub device_id: Uuid,
    /// Application tag
    pub app_tag: String,
    /// Tier this node runs on
    pub tier: Tier,
    /// Linked tiers
    pub links: Vec<Tier>,
    /// Root tier derived from the links
    pub root_tier: Tier,
    /// Registered template names
    pub templates: Vec<String>,
    /// Live activities
    pub activities: Vec<ActivitySummary>,
    /// Slot capacity of the activity table
    pub activity_capacity: usize,
    /// Remote invocations awaiting replies
    pub in_flight: usize,
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
}

impl RuntimeStatus {
    /// Capture the status of a running node
    pub fn capture(config: &RuntimeConfig, table: &ActivityTable, runs: &RunTable) -> Self {
        Self {
            templates: table.template_names(),
            activities: table.snapshot(),
            activity_capacity: table.capacity(),
            in_flight: runs.len(),
            ..Self::from_config(config)
        }
    }

    /// Status of a node that is not running, derived from its configuration
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            device_id: config.device_id,
            app_tag: config.app_tag.clone(),
            tier: config.tier,
            links: config.links.clone(),
            root_tier: StaticTopology::new(&config.links).current_root_tier(),
            templates: Vec::new(),
            activities: Vec::new(),
            activity_capacity: config.activity_capacity,
            in_flight: 0,
            captured_at: Utc::now(),
        }
    }

    /// Number of free activity slots
    pub fn free_slots(&self) -> usize {
        self.activity_capacity.saturating_sub(self.activities.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::{ActivityTemplate, ExecutionKind};
    use crate::runtime::mailbox;

    #[test]
    fn test_status_from_config() {
        let config = RuntimeConfig {
            links: vec![Tier::Device, Tier::Fog],
            ..RuntimeConfig::default()
        };
        let status = RuntimeStatus::from_config(&config);
        assert_eq!(status.root_tier, Tier::Fog);
        assert_eq!(status.free_slots(), config.activity_capacity);
    }

    #[test]
    fn test_capture_lists_live_activities() {
        let config = RuntimeConfig::default();
        let (bell, _rx) = mailbox::doorbell();
        let table = ActivityTable::new(4, 4, bell);
        table
            .register(ActivityTemplate::new("ping", "", ExecutionKind::Async, |_| Ok(None)).unwrap())
            .unwrap();
        let activity = table.create("ping", false).unwrap();

        let status = RuntimeStatus::capture(&config, &table, &RunTable::new());
        assert_eq!(status.templates, vec!["ping".to_string()]);
        assert_eq!(status.activities.len(), 1);
        assert_eq!(&status.activities[0].id, activity.id());
        assert_eq!(status.free_slots(), 3);

        let json = serde_json::to_string(&status).unwrap();
        let back: RuntimeStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.activities[0].name, "ping");
    }
}
