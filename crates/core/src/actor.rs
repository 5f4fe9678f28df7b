//! Actors and learning-ledger subject keys.

use serde::{Deserialize, Serialize};

use crate::id::{AgentId, PrincipalId};

/// Who performed an action.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Service,
    User,
    Agent,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Service => "service",
            ActorType::User => "user",
            ActorType::Agent => "agent",
        }
    }
}

/// The acting identity recorded on every event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    pub id: String,
}

impl Actor {
    pub fn service(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Service,
            id: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::User,
            id: id.into(),
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Agent,
            id: id.into(),
        }
    }
}

impl core::fmt::Display for Actor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.actor_type.as_str(), self.id)
    }
}

/// Key under which constraints and mistake counters accumulate.
///
/// Resolution falls through: a known agent keys as `agent:<id>`, else a
/// known principal keys as `principal:<id>`, else the raw actor keys as
/// `actor:<type>:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectKey(String);

impl SubjectKey {
    pub fn for_agent(agent_id: &AgentId) -> Self {
        Self(format!("agent:{agent_id}"))
    }

    pub fn for_principal(principal_id: &PrincipalId) -> Self {
        Self(format!("principal:{principal_id}"))
    }

    pub fn for_actor(actor: &Actor) -> Self {
        Self(format!("actor:{}:{}", actor.actor_type.as_str(), actor.id))
    }

    /// Fall-through resolution per the ledger keying rules.
    pub fn resolve(
        agent_id: Option<&AgentId>,
        principal_id: Option<&PrincipalId>,
        actor: &Actor,
    ) -> Self {
        if let Some(agent) = agent_id {
            return Self::for_agent(agent);
        }
        if let Some(principal) = principal_id {
            return Self::for_principal(principal);
        }
        Self::for_actor(actor)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_key_falls_through() {
        let actor = Actor::agent("runner-1");
        let agent = AgentId::new();
        let principal = PrincipalId::new();

        let k = SubjectKey::resolve(Some(&agent), Some(&principal), &actor);
        assert_eq!(k.as_str(), format!("agent:{agent}"));

        let k = SubjectKey::resolve(None, Some(&principal), &actor);
        assert_eq!(k.as_str(), format!("principal:{principal}"));

        let k = SubjectKey::resolve(None, None, &actor);
        assert_eq!(k.as_str(), "actor:agent:runner-1");
    }

    #[test]
    fn actor_serializes_with_type_tag() {
        let json = serde_json::to_value(Actor::user("u-9")).unwrap();
        assert_eq!(json["type"], "user");
        assert_eq!(json["id"], "u-9");
    }
}
