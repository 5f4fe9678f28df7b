//! Strongly-typed identifiers used across the control plane.
//!
//! Entity identifiers are opaque prefixed strings (`ws_…`, `run_…`) so that
//! an id pasted into a log line or an incident report is self-describing.
//! `EventId` stays a bare UUID: every append mints a fresh one and the
//! idempotent-replay path must return the stored value byte-for-byte.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of an event row. Fresh UUID per append.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Mint a new event id.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for EventId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for EventId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("EventId: {e}")))?;
        Ok(Self(uuid))
    }
}

macro_rules! impl_prefixed_id {
    ($t:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(String);

        impl $t {
            /// Mint a new identifier: `<prefix>_<uuidv7-simple>`.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let rest = s.strip_prefix(concat!($prefix, "_")).ok_or_else(|| {
                    DomainError::invalid_id(format!(
                        "{}: expected '{}_' prefix, got '{s}'",
                        stringify!($t),
                        $prefix,
                    ))
                })?;
                if rest.is_empty() {
                    return Err(DomainError::invalid_id(format!(
                        "{}: empty suffix",
                        stringify!($t)
                    )));
                }
                Ok(Self(s.to_string()))
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_prefixed_id!(WorkspaceId, "ws");
impl_prefixed_id!(MissionId, "msn");
impl_prefixed_id!(RoomId, "room");
impl_prefixed_id!(ThreadId, "thr");
impl_prefixed_id!(RunId, "run");
impl_prefixed_id!(StepId, "step");
impl_prefixed_id!(AgentId, "agent");
impl_prefixed_id!(PrincipalId, "prin");
impl_prefixed_id!(ApprovalId, "apr");
impl_prefixed_id!(IncidentId, "inc");
impl_prefixed_id!(TokenId, "cap");

/// Free-form identifier grouping events of one logical workflow.
///
/// Unlike the prefixed ids above this carries whatever the caller supplies;
/// a fresh one is a `corr_` prefixed UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(format!("corr_{}", Uuid::now_v7().simple()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ids_round_trip() {
        let id = RunId::new();
        assert!(id.as_str().starts_with("run_"));

        let parsed: RunId = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        let err = "ws_0123abcd".parse::<RunId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(_)));

        assert!("run_".parse::<RunId>().is_err());
        assert!("run".parse::<RunId>().is_err());
    }

    #[test]
    fn event_id_parses_uuid() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<EventId>().is_err());
    }

    #[test]
    fn correlation_id_accepts_free_form() {
        let c = CorrelationId::from_string("deploy-2024-review");
        assert_eq!(c.as_str(), "deploy-2024-review");
    }
}
