//! Tiers and the placement-condition boundary
//!
//! The core never interprets placement expressions itself; it asks a
//! [`PlacementEvaluator`]. [`StaticTopology`] is the reference evaluator used
//! when the set of reachable tiers is fixed at startup. It understands the
//! unconditional condition (`true`, `-`, or empty), bare tier labels, and the
//! root-tier form produced by [`root_condition`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution location in the placement hierarchy
///
/// Ordering follows root precedence: `Cloud > Fog > Device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Tier index 0
    Device,
    /// Tier index 1
    Fog,
    /// Tier index 2
    Cloud,
}

impl Tier {
    /// All tiers in index order
    pub const ALL: [Tier; 3] = [Tier::Device, Tier::Fog, Tier::Cloud];

    /// Transport index (device=0, fog=1, cloud=2)
    pub fn index(self) -> usize {
        match self {
            Tier::Device => 0,
            Tier::Fog => 1,
            Tier::Cloud => 2,
        }
    }

    /// Tier for a transport index
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Protocol label carried in reply options
    pub fn label(self) -> &'static str {
        match self {
            Tier::Device => "DEVICE",
            Tier::Fog => "FOG",
            Tier::Cloud => "CLOUD",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEVICE" => Ok(Tier::Device),
            "FOG" => Ok(Tier::Fog),
            "CLOUD" => Ok(Tier::Cloud),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Condition string that restricts execution to `tier`
pub fn root_condition(tier: Tier) -> String {
    format!("machtype === \"{}\"", tier.label())
}

/// Condition string that admits every tier
pub const UNCONDITIONAL: &str = "true";

/// Placement-condition evaluator consulted by the runners and workers
pub trait PlacementEvaluator: Send + Sync {
    /// Number of replies to expect for a command carrying `option`
    fn resolve_expected_replies(&self, option: &str) -> usize;

    /// Highest-precedence tier currently reachable
    fn current_root_tier(&self) -> Tier;

    /// Whether a node at `tier` may run a command carrying `option`
    fn is_eligible(&self, option: &str, tier: Tier) -> bool;
}

/// Evaluator over a fixed set of reachable tiers
#[derive(Debug, Clone)]
pub struct StaticTopology {
    reachable: [bool; 3],
}

impl StaticTopology {
    /// Build from the list of reachable tiers
    pub fn new(tiers: &[Tier]) -> Self {
        let mut reachable = [false; 3];
        for tier in tiers {
            reachable[tier.index()] = true;
        }
        Self { reachable }
    }

    /// Whether `tier` is reachable
    pub fn reaches(&self, tier: Tier) -> bool {
        self.reachable[tier.index()]
    }

    /// Reachable tiers in index order
    pub fn tiers(&self) -> Vec<Tier> {
        Tier::ALL.into_iter().filter(|t| self.reaches(*t)).collect()
    }

    fn targeted_tier(option: &str) -> Option<Tier> {
        let option = option.trim();
        if let Ok(tier) = option.parse() {
            return Some(tier);
        }
        let rest = option.strip_prefix("machtype")?.trim_start();
        let rest = rest.strip_prefix("===").or_else(|| rest.strip_prefix("=="))?;
        rest.trim().trim_matches(|c| c == '"' || c == '\'').parse().ok()
    }
}

impl PlacementEvaluator for StaticTopology {
    /// Every reachable tier evaluates the condition and answers, either with
    /// an acknowledgment or a negative-condition rejection.
    fn resolve_expected_replies(&self, _option: &str) -> usize {
        self.reachable.iter().filter(|r| **r).count()
    }

    fn current_root_tier(&self) -> Tier {
        Tier::ALL
            .into_iter()
            .rev()
            .find(|t| self.reaches(*t))
            .unwrap_or(Tier::Device)
    }

    fn is_eligible(&self, option: &str, tier: Tier) -> bool {
        match option.trim() {
            "" | "-" | UNCONDITIONAL => true,
            other => Self::targeted_tier(other) == Some(tier),
        }
    }
}
