//! Execution zones.

use serde::{Deserialize, Serialize};

/// How much gating an action requires.
///
/// Zones are totally ordered: `Sandbox < Supervised < HighStakes`. An actor
/// operating in a lower zone than an action demands is denied with
/// `zone_insufficient`.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    #[default]
    Sandbox,
    Supervised,
    HighStakes,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Sandbox => "sandbox",
            Zone::Supervised => "supervised",
            Zone::HighStakes => "high_stakes",
        }
    }

    /// Whether this zone satisfies a required minimum.
    pub fn satisfies(&self, required: Zone) -> bool {
        *self >= required
    }
}

impl core::fmt::Display for Zone {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zones_are_ordered() {
        assert!(Zone::Sandbox < Zone::Supervised);
        assert!(Zone::Supervised < Zone::HighStakes);

        assert!(Zone::HighStakes.satisfies(Zone::Supervised));
        assert!(!Zone::Sandbox.satisfies(Zone::Supervised));
        assert!(Zone::Supervised.satisfies(Zone::Supervised));
    }

    #[test]
    fn wire_form_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&Zone::HighStakes).unwrap(),
            "\"high_stakes\""
        );
    }
}
