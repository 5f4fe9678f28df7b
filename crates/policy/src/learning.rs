//! The learning ledger: denials become constraints, repeats become
//! `mistake.repeated`.
//!
//! Every non-allow policy decision is folded into two counters keyed by
//! `(workspace, subject_key, category, pattern_hash)`: the constraint row
//! (drives `constraint_learned_block`) and the mistake counter (surfaces
//! `mistake.repeated` on the 2nd observation).

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tracing::warn;

use warden_core::{Actor, CorrelationId, ReasonCode, SubjectKey, WorkspaceId};
use warden_events::data::{ConstraintLearned, LearningFromFailure, MistakeRepeated};
use warden_events::{canonical_json, EventData, EventSink, StreamRef};

use crate::capability::PolicyStoreError;

/// Keys whose values never reach the ledger.
static SECRET_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(secret|token|password|api[_-]?key|authorization|cookie|bearer|private[_-]?key)")
        .unwrap()
});

const MAX_STRING_LEN: usize = 240;
const MAX_DEPTH: usize = 3;

/// Strip secrets, truncate strings to 240 chars, cap depth at 3.
pub fn sanitize_context(value: &JsonValue) -> JsonValue {
    sanitize_at(value, 0)
}

fn sanitize_at(value: &JsonValue, depth: usize) -> JsonValue {
    if depth >= MAX_DEPTH {
        return JsonValue::Null;
    }
    match value {
        JsonValue::String(s) => {
            if s.chars().count() > MAX_STRING_LEN {
                JsonValue::String(s.chars().take(MAX_STRING_LEN).collect())
            } else {
                value.clone()
            }
        }
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| sanitize_at(v, depth + 1)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .filter(|(k, _)| !SECRET_KEY.is_match(k))
                .map(|(k, v)| (k.clone(), sanitize_at(v, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Deterministic fingerprint of a denial pattern.
pub fn pattern_hash(
    category: &str,
    action: &str,
    reason_code: ReasonCode,
    blocked: bool,
    sanitized_context: &JsonValue,
) -> String {
    let doc = json!({
        "category": category,
        "action": action,
        "reason_code": reason_code,
        "blocked": blocked,
        "context": sanitized_context,
    });
    hex::encode(Sha256::digest(canonical_json(&doc).as_bytes()))
}

/// Fingerprint of the request shape alone.
///
/// Unlike [`pattern_hash`] this excludes the decision's reason code, so a
/// *new* request can be matched against previously learned constraints
/// before its own outcome is known.
pub fn context_hash(category: &str, action: &str, sanitized_context: &JsonValue) -> String {
    let doc = json!({
        "category": category,
        "action": action,
        "context": sanitized_context,
    });
    hex::encode(Sha256::digest(canonical_json(&doc).as_bytes()))
}

/// A learned constraint row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub workspace_id: WorkspaceId,
    pub subject_key: SubjectKey,
    pub category: String,
    pub pattern_hash: String,
    /// Request-shape fingerprint used for check-time lookups.
    pub context_hash: String,
    pub action: String,
    pub reason_code: ReasonCode,
    pub seen_count: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage seam for constraints and mistake counters.
#[async_trait]
pub trait ConstraintStore: Send + Sync {
    /// A live constraint matching this request shape, if any.
    async fn find_live(
        &self,
        workspace_id: &WorkspaceId,
        subject_key: &SubjectKey,
        category: &str,
        context_hash: &str,
    ) -> Result<Option<Constraint>, PolicyStoreError>;

    /// Record one more observation; returns the row after the bump.
    #[allow(clippy::too_many_arguments)]
    async fn upsert_seen(
        &self,
        workspace_id: &WorkspaceId,
        subject_key: &SubjectKey,
        category: &str,
        pattern_hash: &str,
        context_hash: &str,
        action: &str,
        reason_code: ReasonCode,
        now: DateTime<Utc>,
    ) -> Result<Constraint, PolicyStoreError>;

    /// Bump the mistake counter; returns the new repeat count.
    async fn bump_mistake(
        &self,
        workspace_id: &WorkspaceId,
        subject_key: &SubjectKey,
        category: &str,
        pattern_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, PolicyStoreError>;
}

type ConstraintKey = (WorkspaceId, SubjectKey, String, String);

/// In-memory ledger storage for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryConstraintStore {
    constraints: RwLock<HashMap<ConstraintKey, Constraint>>,
    mistakes: RwLock<HashMap<ConstraintKey, u64>>,
}

impl InMemoryConstraintStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConstraintStore for InMemoryConstraintStore {
    async fn find_live(
        &self,
        workspace_id: &WorkspaceId,
        subject_key: &SubjectKey,
        category: &str,
        context_hash: &str,
    ) -> Result<Option<Constraint>, PolicyStoreError> {
        let constraints = self
            .constraints
            .read()
            .map_err(|_| PolicyStoreError::Storage("lock poisoned".to_string()))?;
        Ok(constraints
            .values()
            .find(|c| {
                c.active
                    && &c.workspace_id == workspace_id
                    && &c.subject_key == subject_key
                    && c.category == category
                    && c.context_hash == context_hash
            })
            .cloned())
    }

    async fn upsert_seen(
        &self,
        workspace_id: &WorkspaceId,
        subject_key: &SubjectKey,
        category: &str,
        pattern_hash: &str,
        context_hash: &str,
        action: &str,
        reason_code: ReasonCode,
        now: DateTime<Utc>,
    ) -> Result<Constraint, PolicyStoreError> {
        let mut constraints = self
            .constraints
            .write()
            .map_err(|_| PolicyStoreError::Storage("lock poisoned".to_string()))?;
        let key = (
            workspace_id.clone(),
            subject_key.clone(),
            category.to_string(),
            pattern_hash.to_string(),
        );
        let row = constraints
            .entry(key)
            .and_modify(|c| {
                c.seen_count += 1;
                c.updated_at = now;
            })
            .or_insert_with(|| Constraint {
                workspace_id: workspace_id.clone(),
                subject_key: subject_key.clone(),
                category: category.to_string(),
                pattern_hash: pattern_hash.to_string(),
                context_hash: context_hash.to_string(),
                action: action.to_string(),
                reason_code,
                seen_count: 1,
                active: true,
                created_at: now,
                updated_at: now,
            });
        Ok(row.clone())
    }

    async fn bump_mistake(
        &self,
        workspace_id: &WorkspaceId,
        subject_key: &SubjectKey,
        category: &str,
        pattern_hash: &str,
        _now: DateTime<Utc>,
    ) -> Result<u64, PolicyStoreError> {
        let mut mistakes = self
            .mistakes
            .write()
            .map_err(|_| PolicyStoreError::Storage("lock poisoned".to_string()))?;
        let key = (
            workspace_id.clone(),
            subject_key.clone(),
            category.to_string(),
            pattern_hash.to_string(),
        );
        let count = mistakes.entry(key).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

/// Folds non-allow decisions into the ledger and emits the learning events.
pub struct LearningLedger {
    store: Arc<dyn ConstraintStore>,
    sink: Arc<dyn EventSink>,
}

/// What the gate hands the ledger about one non-allow decision.
#[derive(Debug, Clone)]
pub struct FailureObservation {
    pub workspace_id: WorkspaceId,
    pub subject_key: SubjectKey,
    pub category: String,
    pub action: String,
    pub reason_code: ReasonCode,
    pub blocked: bool,
    pub context: JsonValue,
    pub actor: Actor,
    pub correlation_id: CorrelationId,
    pub stream: StreamRef,
}

impl LearningLedger {
    pub fn new(store: Arc<dyn ConstraintStore>, sink: Arc<dyn EventSink>) -> Self {
        Self { store, sink }
    }

    pub fn store(&self) -> &Arc<dyn ConstraintStore> {
        &self.store
    }

    /// Record one non-allow decision.
    ///
    /// Emits `learning.from_failure` and `constraint.learned` on every
    /// observation, plus `mistake.repeated` exactly on the 2nd.
    pub async fn record_failure(
        &self,
        observation: FailureObservation,
    ) -> Result<(), PolicyStoreError> {
        let now = Utc::now();
        let sanitized = sanitize_context(&observation.context);
        let hash = pattern_hash(
            &observation.category,
            &observation.action,
            observation.reason_code,
            observation.blocked,
            &sanitized,
        );
        let shape = context_hash(&observation.category, &observation.action, &sanitized);

        let constraint = self
            .store
            .upsert_seen(
                &observation.workspace_id,
                &observation.subject_key,
                &observation.category,
                &hash,
                &shape,
                &observation.action,
                observation.reason_code,
                now,
            )
            .await?;

        let repeat_count = self
            .store
            .bump_mistake(
                &observation.workspace_id,
                &observation.subject_key,
                &observation.category,
                &hash,
                now,
            )
            .await?;

        self.emit(
            &observation,
            EventData::LearningFromFailure(LearningFromFailure {
                subject_key: observation.subject_key.clone(),
                category: observation.category.clone(),
                reason_code: observation.reason_code,
                action: Some(observation.action.clone()),
            }),
        )
        .await;
        self.emit(
            &observation,
            EventData::ConstraintLearned(ConstraintLearned {
                subject_key: observation.subject_key.clone(),
                category: observation.category.clone(),
                pattern_hash: hash.clone(),
                reason_code: observation.reason_code,
                seen_count: constraint.seen_count,
            }),
        )
        .await;

        if repeat_count == 2 {
            self.emit(
                &observation,
                EventData::MistakeRepeated(MistakeRepeated {
                    subject_key: observation.subject_key.clone(),
                    category: observation.category.clone(),
                    pattern_hash: hash,
                    repeat_count,
                }),
            )
            .await;
        }

        Ok(())
    }

    // Ledger emissions are best-effort: a sink failure must not turn a
    // policy decision into an error.
    async fn emit(&self, observation: &FailureObservation, data: EventData) {
        let event = data.new_event(
            observation.workspace_id.clone(),
            observation.stream.clone(),
            observation.actor.clone(),
            observation.correlation_id.clone(),
        );
        if let Err(err) = self.sink.append(event).await {
            warn!(error = %err, event_type = data.event_type(), "learning ledger emission failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_drops_secret_keys() {
        let ctx = json!({
            "api_key": "sk-abc",
            "Authorization": "Bearer xyz",
            "note": "fine",
            "nested": {"cookie": "session=1", "ok": 1}
        });
        let clean = sanitize_context(&ctx);
        assert!(clean.get("api_key").is_none());
        assert!(clean.get("Authorization").is_none());
        assert_eq!(clean["note"], "fine");
        assert!(clean["nested"].get("cookie").is_none());
        assert_eq!(clean["nested"]["ok"], 1);
    }

    #[test]
    fn sanitize_truncates_and_caps_depth() {
        let long = "x".repeat(500);
        let ctx = json!({"msg": long, "a": {"b": {"c": {"d": 1}}}});
        let clean = sanitize_context(&ctx);
        assert_eq!(clean["msg"].as_str().unwrap().len(), MAX_STRING_LEN);
        // depth 3 boundary: objects beyond it collapse to null
        assert_eq!(clean["a"]["b"]["c"], JsonValue::Null);
    }

    #[test]
    fn pattern_hash_is_stable_and_discriminating() {
        let ctx = json!({"room": "room_1"});
        let a = pattern_hash("egress", "egress.http", ReasonCode::EgressDomainBlocked, true, &ctx);
        let b = pattern_hash("egress", "egress.http", ReasonCode::EgressDomainBlocked, true, &ctx);
        assert_eq!(a, b);

        let c = pattern_hash("egress", "egress.http", ReasonCode::QuotaExceeded, true, &ctx);
        assert_ne!(a, c);
    }

    #[test]
    fn context_hash_ignores_reason_but_not_shape() {
        let ctx = json!({"egress_domain": "api.example.com"});
        let a = context_hash("egress", "egress.http", &ctx);
        let b = context_hash("egress", "egress.http", &ctx);
        assert_eq!(a, b);

        let other = context_hash(
            "egress",
            "egress.http",
            &json!({"egress_domain": "evil.example.net"}),
        );
        assert_ne!(a, other);
    }
}
