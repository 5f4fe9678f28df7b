//! Capability tokens: delegable bearers of scopes.
//!
//! Tokens form a parent → children DAG (never cycles: a parent exists
//! before its children). A child's scopes are a subset of its parent's
//! (attenuation), enforced at insert. Revoking a token transitively
//! invalidates its subtree for new checks; events already written under it
//! remain valid.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use warden_core::{PrincipalId, TokenId, WorkspaceId};

/// Delegation chains deeper than this are rejected outright; in practice a
/// chain this deep is indistinguishable from a cycle.
pub const MAX_DELEGATION_DEPTH: usize = 16;

#[derive(Debug, Error, Clone)]
pub enum PolicyStoreError {
    #[error("attenuation violated: {0}")]
    AttenuationViolated(String),
    #[error("delegation too deep (> {MAX_DELEGATION_DEPTH})")]
    DelegationTooDeep,
    #[error("parent token not found: {0}")]
    ParentMissing(TokenId),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Scope sets. `"*"` in a set grants every member of that dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Scopes {
    #[serde(default)]
    pub rooms: BTreeSet<String>,
    #[serde(default)]
    pub tools: BTreeSet<String>,
    #[serde(default)]
    pub egress_domains: BTreeSet<String>,
    #[serde(default)]
    pub action_types: BTreeSet<String>,
    #[serde(default)]
    pub data_read: bool,
    #[serde(default)]
    pub data_write: bool,
}

fn set_contains(set: &BTreeSet<String>, key: &str) -> bool {
    set.contains("*") || set.contains(key)
}

fn set_subset(child: &BTreeSet<String>, parent: &BTreeSet<String>) -> bool {
    if parent.contains("*") {
        return true;
    }
    if child.contains("*") {
        return false;
    }
    child.is_subset(parent)
}

fn set_intersect(a: &BTreeSet<String>, b: &BTreeSet<String>) -> BTreeSet<String> {
    if a.contains("*") {
        return b.clone();
    }
    if b.contains("*") {
        return a.clone();
    }
    a.intersection(b).cloned().collect()
}

impl Scopes {
    /// Everything: the root grant of a workspace owner.
    pub fn all() -> Self {
        let star = || BTreeSet::from(["*".to_string()]);
        Self {
            rooms: star(),
            tools: star(),
            egress_domains: star(),
            action_types: star(),
            data_read: true,
            data_write: true,
        }
    }

    pub fn allows_action(&self, action_type: &str) -> bool {
        set_contains(&self.action_types, action_type)
    }

    pub fn allows_room(&self, room: &str) -> bool {
        set_contains(&self.rooms, room)
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        set_contains(&self.tools, tool)
    }

    pub fn allows_egress_domain(&self, domain: &str) -> bool {
        set_contains(&self.egress_domains, domain)
    }

    /// Is `self` (the child) within `parent`?
    pub fn within(&self, parent: &Scopes) -> bool {
        set_subset(&self.rooms, &parent.rooms)
            && set_subset(&self.tools, &parent.tools)
            && set_subset(&self.egress_domains, &parent.egress_domains)
            && set_subset(&self.action_types, &parent.action_types)
            && (!self.data_read || parent.data_read)
            && (!self.data_write || parent.data_write)
    }

    /// Intersection along every dimension.
    pub fn intersect(&self, other: &Scopes) -> Scopes {
        Scopes {
            rooms: set_intersect(&self.rooms, &other.rooms),
            tools: set_intersect(&self.tools, &other.tools),
            egress_domains: set_intersect(&self.egress_domains, &other.egress_domains),
            action_types: set_intersect(&self.action_types, &other.action_types),
            data_read: self.data_read && other.data_read,
            data_write: self.data_write && other.data_write,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub token_id: TokenId,
    pub workspace_id: WorkspaceId,
    pub issued_to_principal_id: PrincipalId,
    pub granted_by_principal_id: PrincipalId,
    pub parent_token_id: Option<TokenId>,
    pub scopes: Scopes,
    pub valid_until: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl CapabilityToken {
    /// A token is effective iff not revoked and not expired.
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.valid_until.map_or(true, |until| until > now)
    }
}

/// Storage seam for tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(
        &self,
        workspace_id: &WorkspaceId,
        token_id: &TokenId,
    ) -> Result<Option<CapabilityToken>, PolicyStoreError>;

    /// Insert a token, enforcing attenuation against its parent.
    async fn insert(&self, token: CapabilityToken) -> Result<(), PolicyStoreError>;

    /// Mark a token revoked. Descendants become ineffective on resolution.
    async fn revoke(
        &self,
        workspace_id: &WorkspaceId,
        token_id: &TokenId,
        at: DateTime<Utc>,
    ) -> Result<(), PolicyStoreError>;
}

/// Resolve a token's effective scopes by walking its delegation chain.
///
/// Returns `None` when the token, or any ancestor, is missing, expired or
/// revoked. Scopes intersect along the walk; already-resolved ancestors are
/// memoized within the call.
pub async fn resolve_effective_scopes(
    store: &dyn TokenStore,
    workspace_id: &WorkspaceId,
    token_id: &TokenId,
    now: DateTime<Utc>,
) -> Result<Option<Scopes>, PolicyStoreError> {
    let mut memo: HashMap<TokenId, Option<Scopes>> = HashMap::new();
    resolve_inner(store, workspace_id, token_id, now, &mut memo).await
}

// Recursion expressed as an explicit walk: async recursion would need
// boxing and the chain is short anyway.
async fn resolve_inner(
    store: &dyn TokenStore,
    workspace_id: &WorkspaceId,
    token_id: &TokenId,
    now: DateTime<Utc>,
    memo: &mut HashMap<TokenId, Option<Scopes>>,
) -> Result<Option<Scopes>, PolicyStoreError> {
    // Collect the chain leaf → root.
    let mut chain: Vec<CapabilityToken> = Vec::new();
    let mut cursor = Some(token_id.clone());
    while let Some(current) = cursor {
        if let Some(cached) = memo.get(&current) {
            // Ancestor already resolved: fold the collected suffix onto it.
            return Ok(fold_chain(cached.clone(), &chain, now));
        }
        if chain.len() >= MAX_DELEGATION_DEPTH {
            return Err(PolicyStoreError::DelegationTooDeep);
        }
        let Some(token) = store.get(workspace_id, &current).await? else {
            memo.insert(current, None);
            return Ok(None);
        };
        cursor = token.parent_token_id.clone();
        chain.push(token);
    }

    // Root reached: fold from the root down, memoizing along the way.
    let mut resolved: Option<Scopes> = Some(Scopes::all());
    for token in chain.iter().rev() {
        resolved = match (&resolved, token.is_effective(now)) {
            (Some(acc), true) => Some(acc.intersect(&token.scopes)),
            _ => None,
        };
        memo.insert(token.token_id.clone(), resolved.clone());
    }
    Ok(resolved)
}

fn fold_chain(
    base: Option<Scopes>,
    suffix: &[CapabilityToken],
    now: DateTime<Utc>,
) -> Option<Scopes> {
    let mut resolved = base;
    for token in suffix.iter().rev() {
        resolved = match (&resolved, token.is_effective(now)) {
            (Some(acc), true) => Some(acc.intersect(&token.scopes)),
            _ => None,
        };
    }
    resolved
}

/// In-memory token store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<(WorkspaceId, TokenId), CapabilityToken>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(
        &self,
        workspace_id: &WorkspaceId,
        token_id: &TokenId,
    ) -> Result<Option<CapabilityToken>, PolicyStoreError> {
        let tokens = self
            .tokens
            .read()
            .map_err(|_| PolicyStoreError::Storage("lock poisoned".to_string()))?;
        Ok(tokens
            .get(&(workspace_id.clone(), token_id.clone()))
            .cloned())
    }

    async fn insert(&self, token: CapabilityToken) -> Result<(), PolicyStoreError> {
        let mut tokens = self
            .tokens
            .write()
            .map_err(|_| PolicyStoreError::Storage("lock poisoned".to_string()))?;

        if let Some(parent_id) = &token.parent_token_id {
            let parent = tokens
                .get(&(token.workspace_id.clone(), parent_id.clone()))
                .ok_or_else(|| PolicyStoreError::ParentMissing(parent_id.clone()))?;
            if !token.scopes.within(&parent.scopes) {
                return Err(PolicyStoreError::AttenuationViolated(format!(
                    "token {} widens scopes beyond parent {}",
                    token.token_id, parent_id
                )));
            }
        }

        tokens.insert(
            (token.workspace_id.clone(), token.token_id.clone()),
            token,
        );
        Ok(())
    }

    async fn revoke(
        &self,
        workspace_id: &WorkspaceId,
        token_id: &TokenId,
        at: DateTime<Utc>,
    ) -> Result<(), PolicyStoreError> {
        let mut tokens = self
            .tokens
            .write()
            .map_err(|_| PolicyStoreError::Storage("lock poisoned".to_string()))?;
        if let Some(token) = tokens.get_mut(&(workspace_id.clone(), token_id.clone())) {
            token.revoked_at.get_or_insert(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(
        ws: &WorkspaceId,
        parent: Option<&CapabilityToken>,
        scopes: Scopes,
    ) -> CapabilityToken {
        CapabilityToken {
            token_id: TokenId::new(),
            workspace_id: ws.clone(),
            issued_to_principal_id: PrincipalId::new(),
            granted_by_principal_id: PrincipalId::new(),
            parent_token_id: parent.map(|p| p.token_id.clone()),
            scopes,
            valid_until: None,
            revoked_at: None,
        }
    }

    fn scoped(actions: &[&str]) -> Scopes {
        Scopes {
            action_types: actions.iter().map(|s| s.to_string()).collect(),
            ..Scopes::default()
        }
    }

    #[tokio::test]
    async fn child_scopes_attenuate() {
        let ws = WorkspaceId::new();
        let store = InMemoryTokenStore::new();

        let root = token(&ws, None, Scopes::all());
        store.insert(root.clone()).await.unwrap();

        let child = token(&ws, Some(&root), scoped(&["tool.invoke"]));
        store.insert(child.clone()).await.unwrap();

        // Widening beyond the child fails under the child as parent.
        let grandchild = token(&ws, Some(&child), scoped(&["tool.invoke", "data.write"]));
        let err = store.insert(grandchild).await.unwrap_err();
        assert!(matches!(err, PolicyStoreError::AttenuationViolated(_)));
    }

    #[tokio::test]
    async fn resolution_intersects_chain() {
        let ws = WorkspaceId::new();
        let store = InMemoryTokenStore::new();
        let now = Utc::now();

        let root = token(&ws, None, Scopes::all());
        store.insert(root.clone()).await.unwrap();
        let mid = token(&ws, Some(&root), scoped(&["tool.invoke", "message.post"]));
        store.insert(mid.clone()).await.unwrap();
        let leaf = token(&ws, Some(&mid), scoped(&["tool.invoke"]));
        store.insert(leaf.clone()).await.unwrap();

        let scopes = resolve_effective_scopes(&store, &ws, &leaf.token_id, now)
            .await
            .unwrap()
            .unwrap();
        assert!(scopes.allows_action("tool.invoke"));
        assert!(!scopes.allows_action("message.post"));
        assert!(!scopes.data_write);
    }

    #[tokio::test]
    async fn revoked_ancestor_kills_subtree() {
        let ws = WorkspaceId::new();
        let store = InMemoryTokenStore::new();
        let now = Utc::now();

        let root = token(&ws, None, Scopes::all());
        store.insert(root.clone()).await.unwrap();
        let leaf = token(&ws, Some(&root), scoped(&["tool.invoke"]));
        store.insert(leaf.clone()).await.unwrap();

        store.revoke(&ws, &root.token_id, now).await.unwrap();

        let resolved = resolve_effective_scopes(&store, &ws, &leaf.token_id, now)
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn expired_token_is_ineffective() {
        let ws = WorkspaceId::new();
        let store = InMemoryTokenStore::new();
        let now = Utc::now();

        let mut t = token(&ws, None, Scopes::all());
        t.valid_until = Some(now - chrono::Duration::seconds(1));
        store.insert(t.clone()).await.unwrap();

        let resolved = resolve_effective_scopes(&store, &ws, &t.token_id, now)
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn missing_token_resolves_to_none() {
        let ws = WorkspaceId::new();
        let store = InMemoryTokenStore::new();
        let resolved = resolve_effective_scopes(&store, &ws, &TokenId::new(), Utc::now())
            .await
            .unwrap();
        assert!(resolved.is_none());
    }
}
