//! Workspace-scoped read-model storage.
//!
//! Projections write through this trait. The watermark guard lives here:
//! an upsert carrying an `occurred_at` older than the stored row's is
//! dropped, which makes handlers commutative across delivery orders.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use warden_core::WorkspaceId;

/// Key/value store for one projection's rows, isolated per workspace.
pub trait ReadModelStore<K, V>: Send + Sync {
    fn get(&self, workspace_id: &WorkspaceId, key: &K) -> Option<V>;

    fn list(&self, workspace_id: &WorkspaceId) -> Vec<V>;

    /// Upsert guarded by the per-row occurred-at watermark.
    ///
    /// Returns false (and leaves the row untouched) when `occurred_at` is
    /// not newer than the stored row's watermark.
    fn upsert_if_newer(
        &self,
        workspace_id: &WorkspaceId,
        key: K,
        value: V,
        occurred_at: DateTime<Utc>,
    ) -> bool;

    /// Unguarded upsert for owners writing outside the event fold (lease
    /// bookkeeping). The watermark only ever moves forward.
    fn upsert(&self, workspace_id: &WorkspaceId, key: K, value: V, occurred_at: DateTime<Utc>);

    /// Drop all rows of one workspace (deterministic rebuilds).
    fn clear_workspace(&self, workspace_id: &WorkspaceId);
}

struct Versioned<V> {
    value: V,
    last_event_occurred_at: DateTime<Utc>,
}

/// In-memory read-model store for tests/dev.
pub struct InMemoryReadModelStore<K, V> {
    rows: RwLock<HashMap<(WorkspaceId, K), Versioned<V>>>,
}

impl<K, V> InMemoryReadModelStore<K, V> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryReadModelStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ReadModelStore<K, V> for InMemoryReadModelStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, workspace_id: &WorkspaceId, key: &K) -> Option<V> {
        let rows = self.rows.read().ok()?;
        rows.get(&(workspace_id.clone(), key.clone()))
            .map(|v| v.value.clone())
    }

    fn list(&self, workspace_id: &WorkspaceId) -> Vec<V> {
        match self.rows.read() {
            Ok(rows) => rows
                .iter()
                .filter(|((ws, _), _)| ws == workspace_id)
                .map(|(_, v)| v.value.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn upsert_if_newer(
        &self,
        workspace_id: &WorkspaceId,
        key: K,
        value: V,
        occurred_at: DateTime<Utc>,
    ) -> bool {
        let Ok(mut rows) = self.rows.write() else {
            return false;
        };
        match rows.entry((workspace_id.clone(), key)) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                if entry.get().last_event_occurred_at < occurred_at {
                    entry.insert(Versioned {
                        value,
                        last_event_occurred_at: occurred_at,
                    });
                    true
                } else {
                    false
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Versioned {
                    value,
                    last_event_occurred_at: occurred_at,
                });
                true
            }
        }
    }

    fn upsert(&self, workspace_id: &WorkspaceId, key: K, value: V, occurred_at: DateTime<Utc>) {
        let Ok(mut rows) = self.rows.write() else {
            return;
        };
        let entry = rows
            .entry((workspace_id.clone(), key))
            .and_modify(|v| {
                if v.last_event_occurred_at < occurred_at {
                    v.last_event_occurred_at = occurred_at;
                }
            })
            .or_insert_with(|| Versioned {
                value: value.clone(),
                last_event_occurred_at: occurred_at,
            });
        entry.value = value;
    }

    fn clear_workspace(&self, workspace_id: &WorkspaceId) {
        if let Ok(mut rows) = self.rows.write() {
            rows.retain(|(ws, _), _| ws != workspace_id);
        }
    }
}
