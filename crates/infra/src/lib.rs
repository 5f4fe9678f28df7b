//! Infrastructure: event storage, projections, leases, cron, rate limiting,
//! egress, approvals, automation and lifecycle.

pub mod approval;
pub mod automation;
pub mod config;
pub mod cron;
pub mod egress;
pub mod event_store;
pub mod lease;
pub mod projections;
pub mod rate_limit;
pub mod survival;

#[cfg(test)]
mod integration_tests;
