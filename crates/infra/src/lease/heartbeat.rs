//! Background lease heartbeat.
//!
//! A long-lived task that extends a cron lock on an interval until stopped
//! or fenced out. Losing the lock flips a flag the owner polls at each unit
//! of work, so in-flight sweeps stop promptly instead of writing under a
//! lease someone else now holds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::cron_lock::{CronLockStore, LeaseError};

pub struct HeartbeatWorker;

/// Handle to a running heartbeat task.
pub struct HeartbeatHandle {
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
}

impl HeartbeatWorker {
    /// Spawn a heartbeat for `(lock_name, lock_token)` every `interval`,
    /// extending by `lease` each time.
    pub fn spawn(
        store: Arc<dyn CronLockStore>,
        lock_name: impl Into<String>,
        lock_token: Uuid,
        interval: Duration,
        lease: Duration,
    ) -> HeartbeatHandle {
        let lock_name = lock_name.into();
        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = lost.clone();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!(lock_name, "heartbeat stopped");
                            return;
                        }
                    }
                }

                match store
                    .heartbeat(&lock_name, lock_token, lease, Utc::now())
                    .await
                {
                    Ok(()) => {}
                    Err(LeaseError::LockLost) => {
                        warn!(lock_name, "lease lost, stopping heartbeat");
                        lost_flag.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(err) => {
                        // Transient storage failure: keep trying; the lease
                        // outlives a missed beat or two.
                        warn!(lock_name, error = %err, "heartbeat failed");
                    }
                }
            }
        });

        HeartbeatHandle {
            stop_tx,
            join: Some(join),
            lost,
        }
    }
}

impl HeartbeatHandle {
    /// The fencing token stopped matching: abandon in-flight work.
    pub fn lock_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop the heartbeat and wait for the task to exit.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::cron_lock::InMemoryCronLockStore;

    #[tokio::test]
    async fn heartbeat_keeps_lease_alive() {
        let store = Arc::new(InMemoryCronLockStore::new());
        let token = store
            .acquire("heart_cron", "a", Duration::from_millis(100), Utc::now())
            .await
            .unwrap()
            .unwrap();

        let handle = HeartbeatWorker::spawn(
            store.clone(),
            "heart_cron",
            token,
            Duration::from_millis(20),
            Duration::from_millis(100),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Still held: a second holder cannot acquire.
        assert!(store
            .acquire("heart_cron", "b", Duration::from_millis(100), Utc::now())
            .await
            .unwrap()
            .is_none());
        assert!(!handle.lock_lost());
        handle.stop().await;
    }

    #[tokio::test]
    async fn fenced_out_heartbeat_sets_lost_flag() {
        let store = Arc::new(InMemoryCronLockStore::new());
        let token = store
            .acquire("heart_cron", "a", Duration::from_millis(40), Utc::now())
            .await
            .unwrap()
            .unwrap();

        // Beat slower than the lease so the lock expires before the first
        // extension attempt.
        let handle = HeartbeatWorker::spawn(
            store.clone(),
            "heart_cron",
            token,
            Duration::from_millis(100),
            Duration::from_millis(40),
        );

        // Steal the lease after expiry.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let stolen = store
            .acquire(
                "heart_cron",
                "b",
                Duration::from_secs(10),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(stolen.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.lock_lost());
        handle.stop().await;
    }
}
