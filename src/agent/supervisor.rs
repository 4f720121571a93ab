//! Restart supervisor - owns the worker generations
//!
//! Workers run until their generation's shutdown signal fires. A restart
//! request drains the current generation (signal, then join every worker)
//! and spawns a fresh one. The restart flag reads `true` from the moment a
//! restart is requested until a generation spawned after that request is
//! running. A request arriving mid-restart triggers one more restart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::metrics_monitor::MetricsMonitor;
use super::proposal_monitor::ProposalMonitor;
use super::value_monitor::ValueMonitor;
use super::{AgentContext, AgentError};

/// Supervisor phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Not started yet, or stopped
    #[default]
    Stopped,
    Running,
    Draining,
    Respawning,
}

/// Supervisor state as reported by the status API
#[derive(Debug, Clone, Default, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    /// Number of generations spawned so far
    pub generation: u64,
    /// Identifier of the running generation
    pub generation_id: Option<Uuid>,
    pub workers: Vec<&'static str>,
    pub restarts: u64,
}

/// Restart requests issued and served so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RestartCount {
    requested: u64,
    completed: u64,
}

impl RestartCount {
    fn outstanding(&self) -> bool {
        self.requested > self.completed
    }
}

/// Shared restart flag
#[derive(Clone)]
pub struct RestartHandle {
    count: Arc<watch::Sender<RestartCount>>,
}

impl RestartHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RestartCount::default());
        Self { count: Arc::new(tx) }
    }

    /// Ask the supervisor to restart all workers
    pub fn request(&self) {
        self.count.send_modify(|count| count.requested += 1);
        info!("Worker restart requested");
    }

    pub fn is_requested(&self) -> bool {
        self.count.borrow().outstanding()
    }

    /// Wait until the flag reads `value`
    pub async fn wait_for(&self, value: bool) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|count| count.outstanding() == value).await;
    }

    fn subscribe(&self) -> watch::Receiver<RestartCount> {
        self.count.subscribe()
    }

    /// Requests made up to now; the supervisor serves them all at once
    fn pending(&self) -> u64 {
        self.count.borrow().requested
    }

    /// Mark every request up to `served` as done
    fn complete(&self, served: u64) {
        self.count.send_modify(|count| count.completed = count.completed.max(served));
    }
}

impl Default for RestartHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Shutdown signal observed by one worker generation
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    generation: u64,
}

impl Shutdown {
    pub fn new(rx: watch::Receiver<bool>, generation: u64) -> Self {
        Self { rx, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration` or until shutdown. Returns true on shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let rx = &mut self.rx;
        let signalled = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = async { let _ = rx.wait_for(|stop| *stop).await; } => true,
        };
        signalled || self.is_set()
    }
}

/// A periodic agent worker
#[async_trait]
pub trait Worker: Send + 'static {
    fn name(&self) -> &'static str;

    /// Called once before the first iteration
    async fn start(&mut self) {}

    /// One polling iteration
    async fn iterate(&mut self) -> Result<(), AgentError>;
}

/// Drive a worker until shutdown. The signal is checked at each iteration
/// boundary and interrupts the sleep between iterations.
pub async fn run_worker<W: Worker>(mut worker: W, interval: Duration, mut shutdown: Shutdown) {
    let name = worker.name();
    let generation = shutdown.generation();
    info!(worker = name, generation, "Worker started");

    worker.start().await;

    while !shutdown.is_set() {
        if let Err(e) = worker.iterate().await {
            error!(worker = name, error = %e, "Worker iteration failed");
        }
        if shutdown.sleep(interval).await {
            break;
        }
    }

    info!(worker = name, generation, "Worker stopped");
}

struct WorkerHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

fn spawn<W: Worker>(worker: W, interval: Duration, shutdown: &Shutdown) -> WorkerHandle {
    let name = worker.name();
    let handle = tokio::spawn(run_worker(worker, interval, shutdown.clone()));
    WorkerHandle { name, handle }
}

/// Spawns, drains and respawns the worker generations
pub struct RestartSupervisor {
    ctx: Arc<AgentContext>,
    restart: RestartHandle,
    stop: watch::Receiver<bool>,
    workers: Vec<WorkerHandle>,
}

impl RestartSupervisor {
    pub fn new(ctx: Arc<AgentContext>, restart: RestartHandle, stop: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            restart,
            stop,
            workers: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        let mut generation_tx = self.spawn_generation().await;
        let mut restart_rx = self.restart.subscribe();

        loop {
            let stop = &mut self.stop;
            let stopping = tokio::select! {
                _ = async { let _ = restart_rx.wait_for(RestartCount::outstanding).await; } => false,
                _ = async { let _ = stop.wait_for(|stop| *stop).await; } => true,
            };
            if stopping {
                break;
            }

            let served = self.restart.pending();
            info!("Restarting workers");
            self.drain(&generation_tx).await;
            self.set_state(SupervisorState::Respawning).await;
            generation_tx = self.spawn_generation().await;
            self.ctx.supervisor.write().await.restarts += 1;
            self.restart.complete(served);
            info!("Workers restarted");
        }

        self.drain(&generation_tx).await;
        let mut status = self.ctx.supervisor.write().await;
        status.state = SupervisorState::Stopped;
        status.generation_id = None;
        status.workers.clear();
    }

    /// Signal the current generation and wait for every worker to finish
    async fn drain(&mut self, generation_tx: &watch::Sender<bool>) {
        self.set_state(SupervisorState::Draining).await;
        generation_tx.send_replace(true);

        let workers = std::mem::take(&mut self.workers);
        let names: Vec<_> = workers.iter().map(|w| w.name).collect();
        let results = join_all(workers.into_iter().map(|w| w.handle)).await;

        for (name, result) in names.into_iter().zip(results) {
            if let Err(e) = result {
                error!(worker = name, error = %e, "Worker task failed");
            }
        }
        debug!("Worker generation drained");
    }

    async fn spawn_generation(&mut self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        let interval = self.ctx.timings.poll_interval;
        let generation = self.ctx.supervisor.read().await.generation + 1;
        let shutdown = Shutdown::new(rx, generation);

        let metrics = MetricsMonitor::new(self.ctx.clone());
        let proposals = ProposalMonitor::new(self.ctx.clone());
        let values = ValueMonitor::new(self.ctx.clone());

        self.workers = vec![
            spawn(metrics, interval, &shutdown),
            spawn(proposals, interval, &shutdown),
            spawn(values, interval, &shutdown),
        ];

        let generation_id = Uuid::new_v4();
        let mut status = self.ctx.supervisor.write().await;
        status.state = SupervisorState::Running;
        status.generation = generation;
        status.generation_id = Some(generation_id);
        status.workers = self.workers.iter().map(|w| w.name).collect();

        info!(
            generation = status.generation,
            generation_id = %generation_id,
            workers = self.workers.len(),
            "Worker generation spawned"
        );
        tx
    }

    async fn set_state(&self, state: SupervisorState) {
        self.ctx.supervisor.write().await.state = state;
    }
}
