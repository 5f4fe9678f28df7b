//! The heart-cron tick: jitter, leader lease, bounded-concurrency sweeps,
//! health accounting and the watchdog.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use warden_core::{Actor, CorrelationId, IncidentId, WorkspaceId};
use warden_events::data::IncidentOpened;
use warden_events::{EventData, StreamRef};

use crate::config::CronConfig;
use crate::event_store::EventStore;
use crate::lease::cron_lock::CronLockStore;
use crate::lease::heartbeat::HeartbeatWorker;

use super::health::CronHealthStore;
use super::sweeps::{Sweep, SweepError, SweepOutcome, WorkspaceDirectory};

/// Stream that carries operator-facing events with no workspace of their
/// own (watchdog incidents).
pub const SYSTEM_WORKSPACE: &str = "ws_system";

const LOCK_NAME: &str = "heart_cron";

/// UTC window anchor: `floor(now / window_sec) * window_sec`, formatted
/// `YYYY-MM-DDTHH:MM:SSZ`. Every cron idempotency key embeds it so reruns
/// within one window collapse.
pub fn window_anchor(now: DateTime<Utc>, window_sec: u64) -> String {
    let window = window_sec.max(1) as i64;
    let floored = now.timestamp().div_euclid(window) * window;
    let anchored = Utc
        .timestamp_opt(floored, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    anchored.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub acquired: bool,
    pub halted: bool,
    pub lock_lost: bool,
    pub outcomes: Vec<(&'static str, SweepOutcome)>,
    pub consecutive_failures: u32,
}

pub struct HeartCron {
    config: CronConfig,
    holder_id: String,
    locks: Arc<dyn CronLockStore>,
    health: Arc<dyn CronHealthStore>,
    events: Arc<dyn EventStore>,
    directory: Arc<dyn WorkspaceDirectory>,
    sweeps: Vec<Arc<dyn Sweep>>,
}

impl HeartCron {
    pub fn new(
        config: CronConfig,
        holder_id: impl Into<String>,
        locks: Arc<dyn CronLockStore>,
        health: Arc<dyn CronHealthStore>,
        events: Arc<dyn EventStore>,
        directory: Arc<dyn WorkspaceDirectory>,
    ) -> Self {
        Self {
            config,
            holder_id: holder_id.into(),
            locks,
            health,
            events,
            directory,
            sweeps: Vec::new(),
        }
    }

    pub fn register(mut self, sweep: Arc<dyn Sweep>) -> Self {
        self.sweeps.push(sweep);
        self
    }

    /// One scheduler tick. Safe to call from many replicas; only the lease
    /// holder does work.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        // Desynchronize replicas.
        if !self.config.jitter_max.is_zero() {
            let jitter_ms = rand::thread_rng().gen_range(0..self.config.jitter_max.as_millis() as u64);
            tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
        }

        let health = self.health.get();
        report.consecutive_failures = health.consecutive_failures;
        if health.consecutive_failures >= self.config.watchdog_halt_threshold {
            warn!(
                consecutive_failures = health.consecutive_failures,
                "cron halted by watchdog"
            );
            report.halted = true;
            return report;
        }

        let now = Utc::now();
        let token = match self
            .locks
            .acquire(LOCK_NAME, &self.holder_id, self.config.lock_lease, now)
            .await
        {
            Ok(Some(token)) => token,
            Ok(None) => return report,
            Err(err) => {
                warn!(error = %err, "cron lock acquire failed");
                report.consecutive_failures =
                    self.health.record_failure(&err.to_string(), now);
                return report;
            }
        };
        report.acquired = true;

        let heartbeat = HeartbeatWorker::spawn(
            self.locks.clone(),
            LOCK_NAME,
            token,
            self.config.lock_heartbeat,
            self.config.lock_lease,
        );

        let result = self.run_sweeps(&heartbeat, &mut report).await;

        let now = Utc::now();
        match result {
            Ok(()) => {
                self.health.record_success(now);
                report.consecutive_failures = 0;
            }
            Err(err) => {
                let failures = self.health.record_failure(&err.to_string(), now);
                report.consecutive_failures = failures;
                if matches!(err, SweepError::LockLost) {
                    report.lock_lost = true;
                }
                if failures >= self.config.watchdog_alert_threshold {
                    self.emit_watchdog_incident(now, failures).await;
                }
            }
        }

        report.lock_lost |= heartbeat.lock_lost();
        heartbeat.stop().await;
        if let Err(err) = self.locks.release(LOCK_NAME, token).await {
            warn!(error = %err, "cron lock release failed");
        }

        info!(
            acquired = report.acquired,
            sweeps = report.outcomes.len(),
            failures = report.consecutive_failures,
            "cron tick finished"
        );
        report
    }

    async fn run_sweeps(
        &self,
        heartbeat: &crate::lease::heartbeat::HeartbeatHandle,
        report: &mut TickReport,
    ) -> Result<(), SweepError> {
        let workspaces = self.directory.workspaces();
        let now = Utc::now();

        for sweep in &self.sweeps {
            if heartbeat.lock_lost() {
                return Err(SweepError::LockLost);
            }

            let semaphore = Arc::new(Semaphore::new(self.config.workspace_concurrency));
            let mut handles = Vec::with_capacity(workspaces.len());
            for workspace_id in &workspaces {
                if heartbeat.lock_lost() {
                    return Err(SweepError::LockLost);
                }
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| SweepError::Events("semaphore closed".to_string()))?;
                let sweep = sweep.clone();
                let workspace_id = workspace_id.clone();
                let config = self.config.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    sweep.run(&workspace_id, now, &config).await
                }));
            }

            let mut total = SweepOutcome::default();
            for handle in handles {
                let outcome = handle
                    .await
                    .map_err(|e| SweepError::Events(format!("sweep task panicked: {e}")))??;
                total.absorb(outcome);
            }
            report.outcomes.push((sweep.name(), total));
        }
        Ok(())
    }

    async fn emit_watchdog_incident(&self, now: DateTime<Utc>, failures: u32) {
        let anchor = window_anchor(now, self.config.window_sec);
        let key = format!("cron:watchdog:{anchor}");
        let workspace: WorkspaceId = match SYSTEM_WORKSPACE.parse() {
            Ok(ws) => ws,
            Err(_) => return,
        };
        let data = EventData::IncidentOpened(IncidentOpened {
            incident_id: IncidentId::new(),
            category: "cron.watchdog".to_string(),
            entity_type: Some("cron".to_string()),
            entity_id: Some(LOCK_NAME.to_string()),
            summary: Some(format!("{failures} consecutive cron failures")),
        });
        let event = data
            .new_event(
                workspace.clone(),
                StreamRef::workspace(&workspace),
                Actor::service("heart-cron"),
                CorrelationId::from_string(key.clone()),
            )
            .with_idempotency_key(key);
        if let Err(err) = self.events.append(event).await {
            warn!(error = %err, "failed to append watchdog incident");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_anchor_floors_to_window() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 10, 47, 13).unwrap();
        assert_eq!(window_anchor(t, 3600), "2024-03-05T10:00:00Z");
        assert_eq!(window_anchor(t, 60), "2024-03-05T10:47:00Z");

        // Same window, same anchor; next window, new anchor.
        let later = Utc.with_ymd_and_hms(2024, 3, 5, 10, 59, 59).unwrap();
        assert_eq!(window_anchor(t, 3600), window_anchor(later, 3600));
        let next = Utc.with_ymd_and_hms(2024, 3, 5, 11, 0, 0).unwrap();
        assert_ne!(window_anchor(t, 3600), window_anchor(next, 3600));
    }
}
