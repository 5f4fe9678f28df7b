//! Cron health counter: consecutive failures drive the watchdog.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct CronHealth {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

pub trait CronHealthStore: Send + Sync {
    fn get(&self) -> CronHealth;

    /// A clean tick resets the failure streak.
    fn record_success(&self, now: DateTime<Utc>);

    /// A failed tick; returns the new consecutive-failure count.
    fn record_failure(&self, error: &str, now: DateTime<Utc>) -> u32;
}

#[derive(Debug, Default)]
pub struct InMemoryCronHealthStore {
    health: Mutex<CronHealth>,
}

impl InMemoryCronHealthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CronHealthStore for InMemoryCronHealthStore {
    fn get(&self) -> CronHealth {
        self.health.lock().map(|h| h.clone()).unwrap_or_default()
    }

    fn record_success(&self, now: DateTime<Utc>) {
        if let Ok(mut health) = self.health.lock() {
            health.consecutive_failures = 0;
            health.last_error = None;
            health.last_success_at = Some(now);
            health.last_run_at = Some(now);
        }
    }

    fn record_failure(&self, error: &str, now: DateTime<Utc>) -> u32 {
        match self.health.lock() {
            Ok(mut health) => {
                health.consecutive_failures += 1;
                health.last_error = Some(error.to_string());
                health.last_run_at = Some(now);
                health.consecutive_failures
            }
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_and_reset() {
        let store = InMemoryCronHealthStore::new();
        let now = Utc::now();

        assert_eq!(store.record_failure("a", now), 1);
        assert_eq!(store.record_failure("b", now), 2);
        assert_eq!(store.get().last_error.as_deref(), Some("b"));

        store.record_success(now);
        let health = store.get();
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_error.is_none());
    }
}
