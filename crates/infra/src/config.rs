//! Environment configuration.
//!
//! Plain structs resolved once at boot. Every knob has a default; malformed
//! values fall back with a warning rather than failing the process.

use std::time::Duration;

use tracing::warn;

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "unparseable value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    env_u64(name, default as u64) as u32
}

fn env_ms(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_u64(name, default_ms))
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Cron runtime knobs.
#[derive(Debug, Clone)]
pub struct CronConfig {
    pub lock_lease: Duration,
    /// Capped to a third of the lease; a slower beat would let the lease
    /// expire between extensions.
    pub lock_heartbeat: Duration,
    pub tick_interval: Duration,
    pub jitter_max: Duration,
    pub batch_limit: usize,
    pub workspace_concurrency: usize,
    pub window_sec: u64,
    pub approval_timeout: Duration,
    pub run_stuck_timeout: Duration,
    pub demoted_stale: Duration,
    pub watchdog_alert_threshold: u32,
    pub watchdog_halt_threshold: u32,
}

impl Default for CronConfig {
    fn default() -> Self {
        let lock_lease = Duration::from_millis(30_000);
        Self {
            lock_lease,
            lock_heartbeat: lock_lease / 3,
            tick_interval: Duration::from_millis(60_000),
            jitter_max: Duration::from_millis(5_000),
            batch_limit: 25,
            workspace_concurrency: 4,
            window_sec: 3_600,
            approval_timeout: Duration::from_millis(21_600_000),
            run_stuck_timeout: Duration::from_millis(1_800_000),
            demoted_stale: Duration::from_millis(86_400_000),
            watchdog_alert_threshold: 3,
            watchdog_halt_threshold: 10,
        }
    }
}

impl CronConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let lock_lease = env_ms("CRON_LOCK_LEASE_MS", defaults.lock_lease.as_millis() as u64);
        let heartbeat_raw = env_ms(
            "CRON_LOCK_HEARTBEAT_MS",
            (lock_lease / 3).as_millis() as u64,
        );
        let lock_heartbeat = heartbeat_raw.min(lock_lease / 3);
        if heartbeat_raw > lock_lease / 3 {
            warn!(
                requested_ms = heartbeat_raw.as_millis() as u64,
                capped_ms = lock_heartbeat.as_millis() as u64,
                "CRON_LOCK_HEARTBEAT_MS capped to a third of the lease"
            );
        }

        let batch_limit = env_u64("CRON_BATCH_LIMIT", defaults.batch_limit as u64)
            .clamp(1, 100) as usize;

        Self {
            lock_lease,
            lock_heartbeat,
            tick_interval: env_ms(
                "CRON_TICK_INTERVAL_MS",
                defaults.tick_interval.as_millis() as u64,
            ),
            jitter_max: env_ms("CRON_JITTER_MAX_MS", defaults.jitter_max.as_millis() as u64),
            batch_limit,
            workspace_concurrency: env_u64(
                "CRON_WORKSPACE_CONCURRENCY",
                defaults.workspace_concurrency as u64,
            )
            .max(1) as usize,
            window_sec: env_u64("CRON_WINDOW_SEC", defaults.window_sec).max(1),
            approval_timeout: env_ms(
                "CRON_APPROVAL_TIMEOUT_MS",
                defaults.approval_timeout.as_millis() as u64,
            ),
            run_stuck_timeout: env_ms(
                "CRON_RUN_STUCK_TIMEOUT_MS",
                defaults.run_stuck_timeout.as_millis() as u64,
            ),
            demoted_stale: env_ms(
                "CRON_DEMOTED_STALE_MS",
                defaults.demoted_stale.as_millis() as u64,
            ),
            watchdog_alert_threshold: env_u32(
                "CRON_WATCHDOG_ALERT_THRESHOLD",
                defaults.watchdog_alert_threshold,
            ),
            watchdog_halt_threshold: env_u32(
                "CRON_WATCHDOG_HALT_THRESHOLD",
                defaults.watchdog_halt_threshold,
            ),
        }
    }
}

/// Message rate limiting knobs.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub agent_per_min: u32,
    pub agent_per_hour: u32,
    pub experiment_per_hour: u32,
    pub global_per_min: u32,
    pub heartbeat_per_min: u32,
    pub streak_threshold: u32,
    pub incident_mute_sec: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            agent_per_min: 30,
            agent_per_hour: 600,
            experiment_per_hour: 120,
            global_per_min: 300,
            heartbeat_per_min: 60,
            streak_threshold: 3,
            incident_mute_sec: 3_600,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            agent_per_min: env_u32("MESSAGES_RATE_LIMIT_AGENT_PER_MIN", defaults.agent_per_min),
            agent_per_hour: env_u32(
                "MESSAGES_RATE_LIMIT_AGENT_PER_HOUR",
                defaults.agent_per_hour,
            ),
            experiment_per_hour: env_u32(
                "MESSAGES_RATE_LIMIT_EXPERIMENT_PER_HOUR",
                defaults.experiment_per_hour,
            ),
            global_per_min: env_u32(
                "MESSAGES_RATE_LIMIT_GLOBAL_PER_MIN",
                defaults.global_per_min,
            ),
            heartbeat_per_min: env_u32(
                "MESSAGES_HEARTBEAT_LIMIT_PER_MIN",
                defaults.heartbeat_per_min,
            ),
            streak_threshold: env_u32("RATE_LIMIT_STREAK_THRESHOLD", defaults.streak_threshold),
            incident_mute_sec: env_u64("RATE_LIMIT_INCIDENT_MUTE_SEC", defaults.incident_mute_sec),
        }
    }
}

/// Promotion/automation loop knobs (workspace-tunable thresholds).
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    pub promotion_enabled: bool,
    pub pass_threshold: u32,
    pub fail_threshold: u32,
    pub severe_threshold: u32,
    pub quarantine_threshold: u32,
    pub window_days: i64,
    /// Test-only kill: handlers fail on entry to exercise the fallback.
    pub fail_test: bool,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            promotion_enabled: true,
            pass_threshold: 3,
            fail_threshold: 3,
            severe_threshold: 5,
            quarantine_threshold: 6,
            window_days: 7,
            fail_test: false,
        }
    }
}

impl AutomationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            promotion_enabled: env_bool("PROMOTION_LOOP_ENABLED", defaults.promotion_enabled),
            pass_threshold: env_u32("PROMOTION_PASS_THRESHOLD", defaults.pass_threshold),
            fail_threshold: env_u32("PROMOTION_FAIL_THRESHOLD", defaults.fail_threshold),
            severe_threshold: env_u32("PROMOTION_SEVERE_THRESHOLD", defaults.severe_threshold),
            quarantine_threshold: env_u32(
                "PROMOTION_QUARANTINE_THRESHOLD",
                defaults.quarantine_threshold,
            ),
            window_days: env_u64("PROMOTION_WINDOW_DAYS", defaults.window_days as u64) as i64,
            fail_test: env_bool("AUTOMATION_FAIL_TEST", defaults.fail_test),
        }
    }
}

/// Secrets-at-rest key (encryption itself lives outside the core).
#[derive(Debug, Clone, Default)]
pub struct SecretsConfig {
    pub master_key: Option<String>,
}

impl SecretsConfig {
    pub fn from_env() -> Self {
        let master_key = std::env::var("SECRETS_MASTER_KEY").ok();
        if master_key.is_none() {
            warn!("SECRETS_MASTER_KEY not set; secret storage endpoints will refuse writes");
        }
        Self { master_key }
    }
}

/// Gate-level flags.
#[derive(Debug, Clone, Default)]
pub struct PolicyEnvConfig {
    pub kill_switch: bool,
}

impl PolicyEnvConfig {
    pub fn from_env() -> Self {
        Self {
            kill_switch: env_bool("POLICY_KILL_SWITCH", false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cron = CronConfig::default();
        assert_eq!(cron.lock_heartbeat, cron.lock_lease / 3);
        assert!(cron.watchdog_alert_threshold < cron.watchdog_halt_threshold);
        assert!((1..=100).contains(&cron.batch_limit));

        let auto = AutomationConfig::default();
        assert!(auto.fail_threshold <= auto.severe_threshold);
        assert!(auto.severe_threshold <= auto.quarantine_threshold);
    }
}
