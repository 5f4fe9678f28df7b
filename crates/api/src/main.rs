use std::sync::Arc;

use warden_api::{build_app, AppState};
use warden_infra::cron::{
    ApprovalTimeoutSweep, CandidateLock, DemotedStaleSweep, HeartCron, InMemoryCandidateLocks,
    InMemoryCronHealthStore, RunStuckSweep,
};
use warden_infra::lease::InMemoryCronLockStore;

#[tokio::main]
async fn main() {
    warden_observability::init();

    let state = AppState::in_memory();

    // Scheduler: leader-elected sweeps over this node's stores.
    let candidate_locks: Arc<dyn CandidateLock> = Arc::new(InMemoryCandidateLocks::new());
    let cron = HeartCron::new(
        state.cron_config.clone(),
        format!("api-{}", uuid::Uuid::now_v7().simple()),
        Arc::new(InMemoryCronLockStore::new()),
        Arc::new(InMemoryCronHealthStore::new()),
        state.events.clone(),
        state.directory.clone(),
    )
    .register(Arc::new(ApprovalTimeoutSweep::new(
        state.approvals.clone(),
        state.events.clone(),
        candidate_locks.clone(),
    )))
    .register(Arc::new(RunStuckSweep::new(
        state.runs.clone(),
        state.events.clone(),
        candidate_locks.clone(),
    )))
    .register(Arc::new(DemotedStaleSweep::new(
        state.runs.clone(),
        state.incidents.clone(),
        state.events.clone(),
        candidate_locks,
    )));

    {
        let state = state.clone();
        let interval = state.cron_config.tick_interval;
        tokio::spawn(async move {
            loop {
                let _ = cron.tick().await;
                state.pump().await;
                tokio::time::sleep(interval).await;
            }
        });
    }

    let app = build_app(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr, error = %err, "failed to bind");
            std::process::exit(1);
        }
    };

    if let Ok(local) = listener.local_addr() {
        tracing::info!(%local, "listening");
    }

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "server exited");
        std::process::exit(1);
    }
}
