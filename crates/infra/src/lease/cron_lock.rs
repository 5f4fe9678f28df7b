//! Distributed leader lock with fencing tokens.
//!
//! `acquire` inserts a lease row or steals an expired one; success returns a
//! fresh `lock_token`. Every later write (`heartbeat`, `release`) is keyed
//! by `(lock_name, lock_token)`: zero rows updated means the lease moved on
//! and the holder must stop.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// The fencing token no longer matches: the lock was stolen or expired.
    #[error("lock lost")]
    LockLost,
    /// A run lease heartbeat/release lost its claim token.
    #[error("lease lost")]
    LeaseLost,
    #[error("storage failure: {0}")]
    Storage(String),
}

#[async_trait]
pub trait CronLockStore: Send + Sync {
    /// Try to take the lock. Returns the fencing token on success, `None`
    /// when a live lease is held elsewhere.
    async fn acquire(
        &self,
        lock_name: &str,
        holder_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, LeaseError>;

    /// Extend the lease. `LockLost` when the token no longer matches.
    async fn heartbeat(
        &self,
        lock_name: &str,
        lock_token: Uuid,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), LeaseError>;

    /// Drop the lease if still held under this token.
    async fn release(&self, lock_name: &str, lock_token: Uuid) -> Result<(), LeaseError>;
}

#[derive(Debug, Clone)]
struct LockRow {
    holder_id: String,
    lock_token: Uuid,
    expires_at: DateTime<Utc>,
}

/// In-memory lock store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCronLockStore {
    locks: Mutex<HashMap<String, LockRow>>,
}

impl InMemoryCronLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CronLockStore for InMemoryCronLockStore {
    async fn acquire(
        &self,
        lock_name: &str,
        holder_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, LeaseError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LeaseError::Storage("lock poisoned".to_string()))?;
        let expires_at = now + chrono::Duration::from_std(lease).unwrap_or_default();

        match locks.get(lock_name) {
            Some(row) if row.expires_at > now => Ok(None),
            _ => {
                let token = Uuid::new_v4();
                locks.insert(
                    lock_name.to_string(),
                    LockRow {
                        holder_id: holder_id.to_string(),
                        lock_token: token,
                        expires_at,
                    },
                );
                Ok(Some(token))
            }
        }
    }

    async fn heartbeat(
        &self,
        lock_name: &str,
        lock_token: Uuid,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), LeaseError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LeaseError::Storage("lock poisoned".to_string()))?;
        match locks.get_mut(lock_name) {
            Some(row) if row.lock_token == lock_token => {
                row.expires_at = now + chrono::Duration::from_std(lease).unwrap_or_default();
                Ok(())
            }
            _ => Err(LeaseError::LockLost),
        }
    }

    async fn release(&self, lock_name: &str, lock_token: Uuid) -> Result<(), LeaseError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LeaseError::Storage("lock poisoned".to_string()))?;
        if let Some(row) = locks.get(lock_name) {
            if row.lock_token == lock_token {
                locks.remove(lock_name);
            }
        }
        Ok(())
    }
}

/// Postgres lock store over `cron_locks`.
pub struct PgCronLockStore {
    pool: PgPool,
}

impl PgCronLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CronLockStore for PgCronLockStore {
    async fn acquire(
        &self,
        lock_name: &str,
        holder_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, LeaseError> {
        let token = Uuid::new_v4();
        let expires_at = now + chrono::Duration::from_std(lease).unwrap_or_default();

        // Insert, or steal only an expired row.
        let result = sqlx::query(
            r#"
            INSERT INTO cron_locks (lock_name, holder_id, lock_token, acquired_at, expires_at, heartbeat_at)
            VALUES ($1, $2, $3, $4, $5, $4)
            ON CONFLICT (lock_name) DO UPDATE SET
                holder_id = EXCLUDED.holder_id,
                lock_token = EXCLUDED.lock_token,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at,
                heartbeat_at = EXCLUDED.heartbeat_at
            WHERE cron_locks.expires_at < $4
            "#,
        )
        .bind(lock_name)
        .bind(holder_id)
        .bind(token)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| LeaseError::Storage(e.to_string()))?;

        Ok((result.rows_affected() == 1).then_some(token))
    }

    async fn heartbeat(
        &self,
        lock_name: &str,
        lock_token: Uuid,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), LeaseError> {
        let expires_at = now + chrono::Duration::from_std(lease).unwrap_or_default();
        let result = sqlx::query(
            r#"
            UPDATE cron_locks SET expires_at = $3, heartbeat_at = $4
            WHERE lock_name = $1 AND lock_token = $2
            "#,
        )
        .bind(lock_name)
        .bind(lock_token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| LeaseError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(LeaseError::LockLost);
        }
        Ok(())
    }

    async fn release(&self, lock_name: &str, lock_token: Uuid) -> Result<(), LeaseError> {
        sqlx::query("DELETE FROM cron_locks WHERE lock_name = $1 AND lock_token = $2")
            .bind(lock_name)
            .bind(lock_token)
            .execute(&self.pool)
            .await
            .map_err(|e| LeaseError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn second_holder_is_rejected_while_live() {
        let store = InMemoryCronLockStore::new();
        let now = Utc::now();

        let token = store.acquire("heart_cron", "a", LEASE, now).await.unwrap();
        assert!(token.is_some());
        let denied = store.acquire("heart_cron", "b", LEASE, now).await.unwrap();
        assert!(denied.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_stolen() {
        let store = InMemoryCronLockStore::new();
        let now = Utc::now();

        let token_a = store
            .acquire("heart_cron", "a", LEASE, now)
            .await
            .unwrap()
            .unwrap();

        let later = now + chrono::Duration::seconds(31);
        let token_b = store
            .acquire("heart_cron", "b", LEASE, later)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(token_a, token_b);

        // The old holder is fenced out.
        let err = store
            .heartbeat("heart_cron", token_a, LEASE, later)
            .await
            .unwrap_err();
        assert_eq!(err, LeaseError::LockLost);
    }

    #[tokio::test]
    async fn release_only_with_matching_token() {
        let store = InMemoryCronLockStore::new();
        let now = Utc::now();

        let token = store
            .acquire("heart_cron", "a", LEASE, now)
            .await
            .unwrap()
            .unwrap();
        // Wrong token: release is a no-op.
        store.release("heart_cron", Uuid::new_v4()).await.unwrap();
        assert!(store.acquire("heart_cron", "b", LEASE, now).await.unwrap().is_none());

        store.release("heart_cron", token).await.unwrap();
        assert!(store.acquire("heart_cron", "b", LEASE, now).await.unwrap().is_some());
    }
}
