//! Lifecycle states for workspaces and agents.

use serde::{Deserialize, Serialize};

/// Where a target sits in the active → probation → sunset ladder.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Active,
    Probation,
    Sunset,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::Probation => "probation",
            LifecycleState::Sunset => "sunset",
        }
    }
}

impl core::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_escalate_in_order() {
        assert!(LifecycleState::Active < LifecycleState::Probation);
        assert!(LifecycleState::Probation < LifecycleState::Sunset);
    }
}
