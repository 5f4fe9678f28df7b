//! Owner sessions: opaque bearer tokens, stored only as salted hashes.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use warden_core::PrincipalId;

/// `sha256(secret || ":" || token)`, hex-encoded. The raw token never
/// touches storage.
pub fn hash_session_token(secret: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct SessionRow {
    principal_id: PrincipalId,
    expires_at: DateTime<Utc>,
}

/// In-memory session store keyed by token hash.
pub struct SessionStore {
    secret: String,
    sessions: RwLock<HashMap<String, SessionRow>>,
}

impl SessionStore {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a session; returns the raw bearer token exactly once.
    pub fn issue(&self, principal_id: PrincipalId, ttl: Duration) -> String {
        let token = format!("wst_{}", Uuid::new_v4().simple());
        let hash = hash_session_token(&self.secret, &token);
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(
                hash,
                SessionRow {
                    principal_id,
                    expires_at: Utc::now() + ttl,
                },
            );
        }
        token
    }

    /// Resolve a bearer token to its principal, if live.
    pub fn verify(&self, token: &str) -> Option<PrincipalId> {
        let hash = hash_session_token(&self.secret, token);
        let sessions = self.sessions.read().ok()?;
        let row = sessions.get(&hash)?;
        (row.expires_at > Utc::now()).then(|| row.principal_id.clone())
    }

    pub fn revoke(&self, token: &str) {
        let hash = hash_session_token(&self.secret, token);
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(&hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_salted() {
        let a = hash_session_token("secret", "tok");
        let b = hash_session_token("secret", "tok");
        let c = hash_session_token("other", "tok");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn issue_verify_revoke() {
        let store = SessionStore::new("dev-secret");
        let principal = PrincipalId::new();

        let token = store.issue(principal.clone(), Duration::hours(1));
        assert_eq!(store.verify(&token), Some(principal));
        assert_eq!(store.verify("wst_bogus"), None);

        store.revoke(&token);
        assert_eq!(store.verify(&token), None);
    }

    #[test]
    fn expired_session_fails_verification() {
        let store = SessionStore::new("dev-secret");
        let token = store.issue(PrincipalId::new(), Duration::seconds(-1));
        assert_eq!(store.verify(&token), None);
    }
}
