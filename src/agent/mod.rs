//! Agent - autonomous DAO participant
//!
//! The agent watches telemetry and the DAO's shared decision value, raises
//! proposals when a configured rule fires, and votes on every proposal that
//! becomes active.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        RESTART SUPERVISOR                         │
//! │                                                                   │
//! │  ┌────────────────┐  ┌─────────────────┐  ┌────────────────┐     │
//! │  │ MetricsMonitor │  │ ProposalMonitor │  │  ValueMonitor  │     │
//! │  └───────┬────────┘  └────────┬────────┘  └───────┬────────┘     │
//! │          │                    │                   │               │
//! │   ┌──────┴────────────────────┴───────────────────┴──────┐       │
//! │   │ ConfigStore · VoteDecision · ProposalBook · Proposer  │       │
//! │   └───────────────────────────────────────────────────────┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Workers never talk to each other directly; they share lock-guarded state
//! and the external ledger/telemetry systems.

pub mod metrics_monitor;
pub mod proposal_monitor;
pub mod proposer;
pub mod state;
pub mod supervisor;
pub mod value_monitor;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{AgentConfig, ConfigError, Settings};
use crate::ledger::{ActionValue, GovernanceClient, LedgerError, ProposalId, Stance, ValueStore};
use crate::telemetry::query::{QueryCompiler, QueryError};
use crate::telemetry::{TelemetryClient, TelemetryError};
use proposer::{ProposalOutcome, Proposer, VoteOutcome};
use state::{ConfigStore, ProposalBook, VoteDecision};
use supervisor::{RestartHandle, RestartSupervisor, SupervisorState, SupervisorStatus};

/// Agent errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Agent already started")]
    AlreadyStarted,
}

/// Intervals and timeouts used by the workers
#[derive(Debug, Clone)]
pub struct AgentTimings {
    /// Sleep between worker iterations
    pub poll_interval: Duration,
    /// Bound on each ledger or telemetry call made by a worker
    pub call_timeout: Duration,
    /// Bound on each action endpoint POST
    pub dispatch_timeout: Duration,
}

impl Default for AgentTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Settings> for AgentTimings {
    fn from(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            call_timeout: Duration::from_secs(settings.ledger.call_timeout_secs),
            dispatch_timeout: Duration::from_secs(settings.agent.dispatch_timeout_secs),
        }
    }
}

/// External collaborators the agent works through
#[derive(Clone)]
pub struct AgentClients {
    pub governance: Arc<dyn GovernanceClient>,
    pub store: Arc<dyn ValueStore>,
    pub telemetry: Arc<dyn TelemetryClient>,
    pub compiler: Arc<dyn QueryCompiler>,
}

/// State shared by the supervisor, the workers and the public entry points
pub struct AgentContext {
    pub device_name: String,
    pub timings: AgentTimings,
    pub clients: AgentClients,
    pub config: ConfigStore,
    pub vote: VoteDecision,
    pub book: Arc<ProposalBook>,
    pub proposer: Proposer,
    pub http: reqwest::Client,
    /// Last value read from the store by the value monitor
    pub last_value: RwLock<Option<ActionValue>>,
    pub supervisor: RwLock<SupervisorStatus>,
}

/// Snapshot of the agent for the status API
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub device_name: String,
    pub supervisor: SupervisorStatus,
    pub vote_decision: Stance,
    pub cooldown: Vec<String>,
    pub pending: Vec<ProposalId>,
    pub voted: Vec<ProposalId>,
    pub last_value: Option<ActionValue>,
    pub config: AgentConfig,
}

/// The agent: owns the shared state and the restart supervisor
pub struct Agent {
    ctx: Arc<AgentContext>,
    restart: RestartHandle,
    stop_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(
        device_name: impl Into<String>,
        config: AgentConfig,
        clients: AgentClients,
        timings: AgentTimings,
    ) -> Self {
        let device_name = device_name.into();
        let book = Arc::new(ProposalBook::new());
        let proposer = Proposer::new(
            device_name.clone(),
            clients.governance.clone(),
            clients.store.clone(),
            book.clone(),
            timings.call_timeout,
        );

        let ctx = Arc::new(AgentContext {
            device_name,
            config: ConfigStore::new(config, book.clone()),
            vote: VoteDecision::default(),
            book,
            proposer,
            http: reqwest::Client::new(),
            last_value: RwLock::new(None),
            supervisor: RwLock::new(SupervisorStatus::default()),
            timings,
            clients,
        });

        let (stop_tx, _) = watch::channel(false);

        Self {
            ctx,
            restart: RestartHandle::new(),
            stop_tx,
            supervisor: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub fn device_name(&self) -> &str {
        &self.ctx.device_name
    }

    /// Spawn the supervisor, which spawns the first worker generation
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut slot = self.supervisor.lock().await;
        if slot.is_some() {
            return Err(AgentError::AlreadyStarted);
        }
        // Cleared so the agent can be started again after a shutdown
        self.stop_tx.send_replace(false);

        let supervisor = RestartSupervisor::new(
            self.ctx.clone(),
            self.restart.clone(),
            self.stop_tx.subscribe(),
        );
        *slot = Some(tokio::spawn(supervisor.run()));

        info!(device_name = %self.ctx.device_name, "Agent started");
        Ok(())
    }

    /// Stop all workers and the supervisor
    pub async fn shutdown(&self) {
        self.stop_tx.send_replace(true);
        if let Some(handle) = self.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Supervisor task ended abnormally");
            }
        }
        info!("Agent stopped");
    }

    /// Replace the operating configuration and clear the cooldown set.
    /// An invalid configuration is rejected and the running one is kept.
    pub async fn update_config(&self, config: AgentConfig) -> Result<bool, AgentError> {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Configuration update rejected");
            return Err(e.into());
        }
        self.ctx.config.update(config).await;
        Ok(true)
    }

    /// Propose setting the shared value to `action`
    pub async fn create_proposal(
        &self,
        action: ActionValue,
        message: &str,
    ) -> Result<ProposalOutcome, AgentError> {
        Ok(self.ctx.proposer.create_proposal(action, message).await?)
    }

    /// Vote on a proposal
    pub async fn vote(
        &self,
        proposal_id: &ProposalId,
        stance: Stance,
        reason: &str,
    ) -> Result<VoteOutcome, AgentError> {
        Ok(self.ctx.proposer.cast_vote(proposal_id, stance, reason).await?)
    }

    /// Handle used to request a coordinated worker restart
    pub fn restart_handle(&self) -> RestartHandle {
        self.restart.clone()
    }

    pub async fn status(&self) -> AgentStatus {
        let ctx = &self.ctx;
        AgentStatus {
            device_name: ctx.device_name.clone(),
            supervisor: ctx.supervisor.read().await.clone(),
            vote_decision: ctx.vote.current().await,
            cooldown: ctx.book.cooldown().await,
            pending: ctx.book.pending().await,
            voted: ctx.book.voted().await,
            last_value: *ctx.last_value.read().await,
            config: (*ctx.config.snapshot().await).clone(),
        }
    }

    pub async fn supervisor_state(&self) -> SupervisorState {
        self.ctx.supervisor.read().await.state
    }
}

/// Run a ledger call with an upper bound on its duration
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout(limit.as_secs())),
    }
}
