//! Public API types for the in-process stevedore engine.

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use stevedore_sched::SchedulerConfig;
use stevedore_state::{
    ClientAllocUpdate, ClientStatus, DeploymentStatus, Evaluation, Job, JobId, JobType, LogEntry,
    Node, NodeStatus, SharedClock, StateError, StateStore, TriggeredBy,
};

use crate::applier::ApplierConfig;
use crate::broker::{BrokerError, BrokerStats};
use crate::engine::{Control, EngineInner};
use crate::watcher::WatcherConfig;

/// Configuration for the in-process engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of scheduling workers to run concurrently.
    pub worker_count: usize,
    /// Plan submissions retried against fresh snapshots before nacking.
    pub max_plan_attempts: u32,
    /// Whether the engine starts with leadership (single-process default).
    pub start_as_leader: bool,
    /// Housekeeping tick: lease expiry, delayed-eval promotion, blocked
    /// release, status snapshots.
    pub tick: Duration,
    /// Evaluation broker tunables.
    pub broker: crate::broker::BrokerConfig,
    /// Plan applier tunables.
    pub applier: ApplierConfig,
    /// Scheduler tunables.
    pub scheduler: SchedulerConfig,
    /// Deployment watcher tunables.
    pub watcher: WatcherConfig,
}

impl EngineConfig {
    /// Default plan retry budget.
    pub const DEFAULT_MAX_PLAN_ATTEMPTS: u32 = 2;

    /// Default housekeeping tick.
    pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

    /// Default worker count: one per core, capped.
    pub fn default_worker_count() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(64)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: Self::default_worker_count(),
            max_plan_attempts: Self::DEFAULT_MAX_PLAN_ATTEMPTS,
            start_as_leader: true,
            tick: Self::DEFAULT_TICK,
            broker: crate::broker::BrokerConfig::default(),
            applier: ApplierConfig::default(),
            scheduler: SchedulerConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The state store rejected the write.
    #[error(transparent)]
    State(#[from] StateError),
    /// The broker rejected the eval (e.g. pending cap reached).
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// What a worker is doing right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state")]
pub enum WorkerState {
    /// Waiting for work.
    Idle,
    /// Processing an evaluation.
    Scheduling {
        /// Eval being processed.
        eval_id: String,
        /// Job the eval belongs to.
        job_id: JobId,
    },
}

/// Snapshot of a single worker's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    /// Worker index (0-based).
    pub worker_idx: usize,
    /// Current state.
    pub state: WorkerState,
    /// Evals this worker has finished (acked, failed or nacked).
    pub evals_processed: u64,
}

/// Engine event stream payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started.
    Started,
    /// Leadership changed.
    LeadershipChanged {
        /// Whether this engine now holds leadership.
        leader: bool,
    },
    /// Graceful shutdown requested.
    StopRequested,
    /// A worker began processing an eval.
    EvalStarted {
        /// Worker index (0-based).
        worker_idx: usize,
        /// Eval id.
        eval_id: String,
        /// Job the eval belongs to.
        job_id: JobId,
    },
    /// An eval completed and its plan (if any) was committed.
    EvalCompleted {
        /// Worker index (0-based).
        worker_idx: usize,
        /// Eval id.
        eval_id: String,
        /// Job the eval belongs to.
        job_id: JobId,
        /// Allocations the committed plan created or updated.
        placed: usize,
    },
    /// An eval failed permanently.
    EvalFailed {
        /// Worker index (0-based).
        worker_idx: usize,
        /// Eval id.
        eval_id: String,
        /// Failure description.
        message: String,
    },
    /// An eval was nacked and will retry.
    EvalNacked {
        /// Worker index (0-based).
        worker_idx: usize,
        /// Eval id.
        eval_id: String,
    },
    /// A non-fatal problem.
    Warning {
        /// Warning message.
        message: String,
    },
    /// Engine stopped.
    Stopped,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// Whether this engine holds leadership.
    pub leader: bool,
    /// Whether a stop was requested.
    pub stop_requested: bool,
    /// Broker queue depths.
    pub broker: BrokerStats,
    /// Per-worker snapshots.
    pub workers: Vec<WorkerSnapshot>,
}

impl StatusSnapshot {
    pub(crate) fn initial(worker_count: usize) -> Self {
        Self {
            leader: false,
            stop_requested: false,
            broker: BrokerStats::default(),
            workers: (0..worker_count)
                .map(|worker_idx| WorkerSnapshot {
                    worker_idx,
                    state: WorkerState::Idle,
                    evals_processed: 0,
                })
                .collect(),
        }
    }
}

/// Handle to a running in-process engine instance.
pub struct EngineHandle {
    pub(crate) inner: std::sync::Arc<EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<()>,
}

/// Start an engine with a fresh state store and the system clock.
pub fn start_engine(config: EngineConfig) -> EngineHandle {
    let store = StateStore::new();
    let clock: SharedClock = std::sync::Arc::new(stevedore_state::SystemClock);
    start_engine_with(config, store, clock)
}

/// Start an engine against an existing store and clock. Multiple engines
/// may share one store; only the leader schedules.
pub fn start_engine_with(
    config: EngineConfig,
    store: StateStore,
    clock: SharedClock,
) -> EngineHandle {
    crate::engine::start_engine_with(config, store, clock)
}

impl EngineHandle {
    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine status snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Handle to the shared state store.
    pub fn store(&self) -> StateStore {
        self.inner.store.clone()
    }

    /// Grant or revoke leadership. Gaining leadership rebuilds the broker
    /// from the store; losing it flushes all queues and cancels workers.
    pub fn set_leader(&self, leader: bool) {
        let _ = self.inner.control_tx.send(Control::SetLeader(leader));
    }

    /// Request a graceful shutdown.
    pub fn request_stop(&self) {
        if !self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.inner.event_tx.send(EngineEvent::StopRequested);
            let _ = self.inner.control_tx.send(Control::Stop);
        }
    }

    /// Wait for the engine to stop.
    pub async fn wait(self) {
        let _ = self.join.await;
    }

    /// Register (or update) a job and queue its evaluation. Returns the
    /// eval id.
    pub fn register_job(&self, job: Job) -> Result<String, EngineError> {
        self.inner.store.apply(LogEntry::UpsertJob(job.clone()))?;
        let stamped = self
            .inner
            .store
            .snapshot()
            .job(&job.id)
            .ok_or(StateError::UnknownJob(job.id.clone()))?;
        self.queue_eval(&stamped, TriggeredBy::JobRegister)
    }

    /// Deregister a job: all its allocations stop. Returns the eval id.
    pub fn deregister_job(&self, job_id: &JobId) -> Result<String, EngineError> {
        self.inner
            .store
            .apply(LogEntry::DeregisterJob {
                job_id: job_id.clone(),
            })?;
        let stamped = self
            .inner
            .store
            .snapshot()
            .job(job_id)
            .ok_or(StateError::UnknownJob(job_id.clone()))?;
        self.queue_eval(&stamped, TriggeredBy::JobDeregister)
    }

    /// Register or update a worker node. System jobs are re-evaluated so
    /// they can expand onto it.
    pub fn register_node(&self, node: Node) -> Result<(), EngineError> {
        self.inner.store.apply(LogEntry::UpsertNode(node))?;
        let snapshot = self.inner.store.snapshot();
        for job in snapshot.jobs() {
            if matches!(job.job_type, JobType::System | JobType::Sysbatch) && !job.stopped() {
                self.queue_eval(job, TriggeredBy::NodeUpdate)?;
            }
        }
        Ok(())
    }

    /// Record a node status transition and re-evaluate affected jobs.
    pub fn set_node_status(&self, node_id: &str, status: NodeStatus) -> Result<(), EngineError> {
        self.inner.store.apply(LogEntry::UpdateNodeStatus {
            node_id: node_id.to_string(),
            status,
            timestamp: self.inner.clock.now(),
        })?;
        self.queue_node_evals(node_id, TriggeredBy::NodeUpdate)
    }

    /// Start (or stop) draining a node; its allocations migrate off.
    pub fn drain_node(
        &self,
        node_id: &str,
        drain: bool,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        self.inner.store.apply(LogEntry::UpdateNodeDrain {
            node_id: node_id.to_string(),
            drain,
            deadline,
        })?;
        self.queue_node_evals(node_id, TriggeredBy::NodeDrain)
    }

    /// Apply client-side allocation status reports, re-evaluating jobs
    /// whose allocations failed or finished.
    pub fn update_allocs_from_client(
        &self,
        updates: Vec<ClientAllocUpdate>,
    ) -> Result<(), EngineError> {
        let snapshot = self.inner.store.snapshot();
        let mut triggers: Vec<(JobId, TriggeredBy)> = Vec::new();
        for update in &updates {
            if let Some(alloc) = snapshot.alloc(&update.alloc_id) {
                match update.client_status {
                    ClientStatus::Failed => {
                        triggers.push((alloc.job_id.clone(), TriggeredBy::AllocFailure));
                    }
                    ClientStatus::Complete => {
                        triggers.push((alloc.job_id.clone(), TriggeredBy::AllocStop));
                    }
                    _ => {}
                }
            }
        }
        self.inner
            .store
            .apply(LogEntry::UpdateAllocsFromClient(updates))?;
        triggers.sort_by(|a, b| a.0.cmp(&b.0));
        triggers.dedup_by(|a, b| a.0 == b.0);
        let snapshot = self.inner.store.snapshot();
        for (job_id, trigger) in triggers {
            if let Some(job) = snapshot.job(&job_id) {
                self.queue_eval(&job, trigger)?;
            }
        }
        Ok(())
    }

    /// Promote a deployment's canaries, all groups or a subset.
    pub fn promote_deployment(
        &self,
        deployment_id: &str,
        groups: Option<Vec<String>>,
    ) -> Result<(), EngineError> {
        self.inner
            .store
            .apply(LogEntry::UpdateDeploymentPromotion {
                deployment_id: deployment_id.to_string(),
                groups,
            })?;
        self.queue_deployment_eval(deployment_id)
    }

    /// Pause or resume a deployment.
    pub fn set_deployment_paused(
        &self,
        deployment_id: &str,
        paused: bool,
    ) -> Result<(), EngineError> {
        let (status, description) = if paused {
            (DeploymentStatus::Paused, "deployment paused by operator")
        } else {
            (DeploymentStatus::Running, "deployment resumed by operator")
        };
        self.inner.store.apply(LogEntry::UpdateDeploymentStatus {
            deployment_id: deployment_id.to_string(),
            status,
            description: description.to_string(),
        })?;
        if !paused {
            self.queue_deployment_eval(deployment_id)?;
        }
        Ok(())
    }

    /// Mark a deployment failed.
    pub fn fail_deployment(&self, deployment_id: &str) -> Result<(), EngineError> {
        self.inner.store.apply(LogEntry::UpdateDeploymentStatus {
            deployment_id: deployment_id.to_string(),
            status: DeploymentStatus::Failed,
            description: "deployment marked failed by operator".to_string(),
        })?;
        Ok(())
    }

    /// Manually set allocation health within a deployment (the `manual`
    /// health-check mode).
    pub fn set_alloc_health(
        &self,
        deployment_id: &str,
        healthy: Vec<String>,
        unhealthy: Vec<String>,
    ) -> Result<(), EngineError> {
        self.inner
            .store
            .apply(LogEntry::UpdateDeploymentAllocHealth {
                deployment_id: deployment_id.to_string(),
                healthy,
                unhealthy,
                timestamp: self.inner.clock.now(),
            })?;
        self.queue_deployment_eval(deployment_id)
    }

    fn queue_eval(&self, job: &Job, triggered_by: TriggeredBy) -> Result<String, EngineError> {
        let eval = Evaluation::new(job, triggered_by);
        self.inner
            .store
            .apply(LogEntry::UpsertEvals(vec![eval.clone()]))?;
        let stamped = self
            .inner
            .store
            .snapshot()
            .eval(&eval.id)
            .map(|e| Evaluation::clone(&e))
            .unwrap_or(eval);
        let id = stamped.id.clone();
        match self.inner.broker.enqueue(stamped) {
            Ok(cancelled) => {
                if !cancelled.is_empty() {
                    self.inner.store.apply(LogEntry::UpsertEvals(cancelled))?;
                }
                Ok(id)
            }
            // A follower persists the eval; the leader's broker restores it.
            Err(BrokerError::NotLeader) => Ok(id),
            Err(err) => Err(err.into()),
        }
    }

    fn queue_node_evals(
        &self,
        node_id: &str,
        triggered_by: TriggeredBy,
    ) -> Result<(), EngineError> {
        let snapshot = self.inner.store.snapshot();
        let mut jobs: Vec<JobId> = snapshot
            .allocs_on_node(node_id)
            .into_iter()
            .filter(|a| !a.terminal())
            .map(|a| a.job_id.clone())
            .collect();
        jobs.sort();
        jobs.dedup();
        for job_id in jobs {
            if let Some(job) = snapshot.job(&job_id) {
                self.queue_eval(&job, triggered_by)?;
            }
        }
        Ok(())
    }

    fn queue_deployment_eval(&self, deployment_id: &str) -> Result<(), EngineError> {
        let snapshot = self.inner.store.snapshot();
        let Some(deployment) = snapshot.deployment(deployment_id) else {
            return Err(StateError::UnknownDeployment(deployment_id.to_string()).into());
        };
        if let Some(job) = snapshot.job(&deployment.job_id) {
            self.queue_eval(&job, TriggeredBy::DeploymentWatcher)?;
        }
        Ok(())
    }
}
