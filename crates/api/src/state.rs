//! Application state: every component wired over shared stores.
//!
//! The HTTP layer is thin; this is where the event store, the projector
//! engine, the gate, the lease manager and the automation loop meet. A
//! single `pump()` drains the change feed after writes: projections first,
//! then the reactive automation triggers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;

use warden_core::{ApprovalId, IncidentId, RunId};
use warden_infra::approval::ApprovalCoordinator;
use warden_infra::automation::AutomationLoop;
use warden_infra::config::{
    AutomationConfig, CronConfig, PolicyEnvConfig, RateLimitConfig, SecretsConfig,
};
use warden_infra::cron::InMemoryWorkspaceDirectory;
use warden_infra::egress::{EgressGateway, EgressLog};
use warden_infra::event_store::{EventStore, InMemoryEventStore};
use warden_infra::lease::{InMemoryRunLeaseStore, RunLeaseManager};
use warden_infra::projections::{
    ApprovalReadModel, ApprovalsProjection, ApprovalsReadView, EgressProjection,
    IncidentReadModel, IncidentsProjection, InMemoryProjectorBookkeeping,
    InMemoryReadModelStore, LifecycleProjection, MessageReadModel, MessagesProjection,
    ProjectorEngine, RunReadModel, RunsProjection, ScorecardReadModel, ScorecardsProjection,
    ToolCallsProjection,
};
use warden_infra::rate_limit::{InMemoryRateLimitStore, RateLimiter};
use warden_policy::{
    ActionRegistry, InMemoryConstraintStore, InMemoryQuotaProbe, InMemoryTokenStore,
    LearningLedger, PolicyGate, PolicyGateConfig,
};

pub type RunStore = InMemoryReadModelStore<RunId, RunReadModel>;
pub type ApprovalStore = InMemoryReadModelStore<ApprovalId, ApprovalReadModel>;
pub type IncidentStore = InMemoryReadModelStore<IncidentId, IncidentReadModel>;
pub type MessageStore = InMemoryReadModelStore<String, MessageReadModel>;
pub type ScorecardStore = InMemoryReadModelStore<String, ScorecardReadModel>;

pub struct AppState {
    pub events: Arc<dyn EventStore>,
    pub engine: ProjectorEngine,
    pub automation: AutomationLoop<ApprovalStore, IncidentStore, ScorecardStore>,
    pub runs: Arc<RunStore>,
    pub approvals: Arc<ApprovalStore>,
    pub incidents: Arc<IncidentStore>,
    pub messages: Arc<MessageStore>,
    pub scorecards: Arc<ScorecardStore>,
    pub lease_manager: RunLeaseManager,
    pub coordinator: Arc<ApprovalCoordinator<ApprovalStore>>,
    pub egress: EgressGateway<ApprovalStore>,
    pub egress_log: Arc<EgressLog>,
    pub rate_limiter: RateLimiter,
    pub tokens: Arc<InMemoryTokenStore>,
    pub directory: Arc<InMemoryWorkspaceDirectory>,
    pub cron_config: CronConfig,
    /// Recognized for the secrets endpoints; encryption at rest lives
    /// outside this service.
    pub secrets: SecretsConfig,
    feed_cursor: Mutex<u64>,
}

impl AppState {
    /// Wire the whole plane over in-memory stores.
    pub fn in_memory() -> Arc<Self> {
        let events: Arc<InMemoryEventStore> = Arc::new(InMemoryEventStore::new());
        let events_dyn: Arc<dyn EventStore> = events.clone();

        let runs: Arc<RunStore> = Arc::new(InMemoryReadModelStore::new());
        let approvals: Arc<ApprovalStore> = Arc::new(InMemoryReadModelStore::new());
        let incidents: Arc<IncidentStore> = Arc::new(InMemoryReadModelStore::new());
        let messages: Arc<MessageStore> = Arc::new(InMemoryReadModelStore::new());
        let scorecards: Arc<ScorecardStore> = Arc::new(InMemoryReadModelStore::new());
        let tool_calls = Arc::new(InMemoryReadModelStore::new());
        let lifecycle = Arc::new(InMemoryReadModelStore::new());
        let egress_rows = Arc::new(InMemoryReadModelStore::new());

        let engine = ProjectorEngine::new(InMemoryProjectorBookkeeping::arc())
            .register(Arc::new(RunsProjection::new(runs.clone())))
            .register(Arc::new(ApprovalsProjection::new(approvals.clone())))
            .register(Arc::new(IncidentsProjection::new(incidents.clone())))
            .register(Arc::new(MessagesProjection::new(messages.clone())))
            .register(Arc::new(ScorecardsProjection::new(scorecards.clone())))
            .register(Arc::new(ToolCallsProjection::new(tool_calls)))
            .register(Arc::new(LifecycleProjection::new(lifecycle)))
            .register(Arc::new(EgressProjection::new(egress_rows)));

        let registry = ActionRegistry::seeded();
        let tokens = Arc::new(InMemoryTokenStore::new());
        let gate = Arc::new(PolicyGate::new(
            registry.clone(),
            tokens.clone(),
            Arc::new(ApprovalsReadView::new(approvals.clone())),
            Arc::new(InMemoryQuotaProbe::unlimited()),
            LearningLedger::new(Arc::new(InMemoryConstraintStore::new()), events.clone()),
            events.clone(),
            PolicyGateConfig {
                kill_switch: PolicyEnvConfig::from_env().kill_switch,
                ..Default::default()
            },
        ));

        let coordinator = Arc::new(ApprovalCoordinator::new(
            events_dyn.clone(),
            approvals.clone(),
            registry,
        ));
        let egress_log = Arc::new(EgressLog::new());
        let egress = EgressGateway::new(
            gate,
            events_dyn.clone(),
            coordinator.clone(),
            egress_log.clone(),
        );

        let lease_manager = RunLeaseManager::new(
            Arc::new(InMemoryRunLeaseStore::new(runs.clone())),
            events_dyn.clone(),
            Duration::from_secs(60),
        );

        let automation = AutomationLoop::new(
            events_dyn.clone(),
            approvals.clone(),
            incidents.clone(),
            scorecards.clone(),
            AutomationConfig::from_env(),
        );

        let rate_limiter = RateLimiter::new(
            RateLimitConfig::from_env(),
            Arc::new(InMemoryRateLimitStore::new()),
            events.clone(),
        );

        Arc::new(Self {
            events: events_dyn,
            engine,
            automation,
            runs,
            approvals,
            incidents,
            messages,
            scorecards,
            lease_manager,
            coordinator,
            egress,
            egress_log,
            rate_limiter,
            tokens,
            directory: Arc::new(InMemoryWorkspaceDirectory::new()),
            cron_config: CronConfig::from_env(),
            secrets: SecretsConfig::from_env(),
            feed_cursor: Mutex::new(0),
        })
    }

    /// Drain the change feed: project, then run automation triggers.
    ///
    /// Write paths call this before answering so reads observe their own
    /// writes; a background task calls it on an interval for events other
    /// nodes appended.
    pub async fn pump(&self) {
        let mut cursor = self.feed_cursor.lock().await;
        loop {
            let batch = match self.events.read_feed(*cursor, 200).await {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(error = %err, "change feed read failed");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }
            for event in batch {
                self.engine.apply(&event).await;
                self.automation.handle(&event).await;
                *cursor = event.global_seq;
            }
        }
    }
}
