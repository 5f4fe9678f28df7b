//! The action registry: an immutable catalog of what each action type
//! demands before it may run. Seeded at boot; changed only by migration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use warden_core::Zone;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostImpact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryDifficulty {
    Trivial,
    Moderate,
    Hard,
}

/// Whether a decision blocks the action or only records it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    Shadow,
    #[default]
    Enforce,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub action_type: String,
    pub reversible: bool,
    pub zone_required: Zone,
    pub requires_pre_approval: bool,
    pub post_review_required: bool,
    pub cost_impact: CostImpact,
    pub recovery_difficulty: RecoveryDifficulty,
    pub enforcement: EnforcementMode,
}

impl ActionSpec {
    /// Conservative defaults for an action the catalog has never seen.
    pub fn unknown(action_type: &str) -> Self {
        Self {
            action_type: action_type.to_string(),
            reversible: true,
            zone_required: Zone::Sandbox,
            requires_pre_approval: false,
            post_review_required: false,
            cost_impact: CostImpact::Low,
            recovery_difficulty: RecoveryDifficulty::Trivial,
            enforcement: EnforcementMode::Enforce,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    entries: HashMap<String, ActionSpec>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in catalog.
    pub fn seeded() -> Self {
        let mut registry = Self::new();
        let entry = |action: &str,
                     reversible: bool,
                     zone: Zone,
                     pre: bool,
                     post: bool,
                     cost: CostImpact,
                     recovery: RecoveryDifficulty,
                     enforcement: EnforcementMode| ActionSpec {
            action_type: action.to_string(),
            reversible,
            zone_required: zone,
            requires_pre_approval: pre,
            post_review_required: post,
            cost_impact: cost,
            recovery_difficulty: recovery,
            enforcement,
        };

        for spec in [
            entry(
                "message.post",
                true,
                Zone::Sandbox,
                false,
                false,
                CostImpact::Low,
                RecoveryDifficulty::Trivial,
                EnforcementMode::Enforce,
            ),
            entry(
                "tool.invoke",
                true,
                Zone::Sandbox,
                false,
                false,
                CostImpact::Low,
                RecoveryDifficulty::Trivial,
                EnforcementMode::Enforce,
            ),
            entry(
                "data.read",
                true,
                Zone::Sandbox,
                false,
                false,
                CostImpact::Low,
                RecoveryDifficulty::Trivial,
                EnforcementMode::Enforce,
            ),
            entry(
                "data.write",
                false,
                Zone::Supervised,
                false,
                true,
                CostImpact::Medium,
                RecoveryDifficulty::Moderate,
                EnforcementMode::Enforce,
            ),
            entry(
                "egress.http",
                false,
                Zone::Supervised,
                false,
                false,
                CostImpact::Medium,
                RecoveryDifficulty::Moderate,
                EnforcementMode::Enforce,
            ),
            entry(
                "external.write",
                false,
                Zone::HighStakes,
                true,
                true,
                CostImpact::High,
                RecoveryDifficulty::Hard,
                EnforcementMode::Enforce,
            ),
            entry(
                "capability.grant",
                false,
                Zone::HighStakes,
                true,
                true,
                CostImpact::High,
                RecoveryDifficulty::Hard,
                EnforcementMode::Enforce,
            ),
            entry(
                "run.execute",
                true,
                Zone::Sandbox,
                false,
                false,
                CostImpact::Medium,
                RecoveryDifficulty::Trivial,
                EnforcementMode::Enforce,
            ),
            entry(
                "workspace.config.write",
                false,
                Zone::HighStakes,
                true,
                false,
                CostImpact::High,
                RecoveryDifficulty::Hard,
                EnforcementMode::Enforce,
            ),
        ] {
            registry.entries.insert(spec.action_type.clone(), spec);
        }
        registry
    }

    pub fn with_entry(mut self, spec: ActionSpec) -> Self {
        self.entries.insert(spec.action_type.clone(), spec);
        self
    }

    pub fn get(&self, action_type: &str) -> Option<&ActionSpec> {
        self.entries.get(action_type)
    }

    /// Lookup with conservative fallback for unknown actions.
    pub fn resolve(&self, action_type: &str) -> ActionSpec {
        self.entries
            .get(action_type)
            .cloned()
            .unwrap_or_else(|| ActionSpec::unknown(action_type))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_catalog_has_high_stakes_writes() {
        let registry = ActionRegistry::seeded();
        let spec = registry.get("external.write").unwrap();
        assert_eq!(spec.zone_required, Zone::HighStakes);
        assert!(spec.requires_pre_approval);
        assert!(!spec.reversible);
    }

    #[test]
    fn unknown_action_gets_conservative_default() {
        let registry = ActionRegistry::seeded();
        let spec = registry.resolve("never.seen.before");
        assert_eq!(spec.zone_required, Zone::Sandbox);
        assert_eq!(spec.enforcement, EnforcementMode::Enforce);
        assert!(!spec.requires_pre_approval);
    }
}
