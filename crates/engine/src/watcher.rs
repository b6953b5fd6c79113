//! The deployment watcher: drives rolling updates from allocation health.
//!
//! One task on the leader follows the store's event stream and a periodic
//! sweep. It marks replacements healthy after `min_healthy_time`, unhealthy
//! on failure or `healthy_deadline` expiry, promotes canaries, fails groups
//! past their progress deadline (optionally auto-reverting to the prior
//! stable version), and emits evaluations whenever forward progress is
//! possible. It mutates deployments and evals only, never allocations
//! directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use stevedore_state::{
    ClientStatus, Deployment, DeploymentStatus, EvalStatus, Evaluation, HealthCheckMode, Job,
    LogEntry, SharedClock, StateSnapshot, StateStore, TriggeredBy,
};

use crate::broker::EvalBroker;

/// Watcher tunables.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Sweep interval for deadline and health-timer checks.
    pub tick: Duration,
}

impl WatcherConfig {
    /// Default sweep interval.
    pub const DEFAULT_TICK: Duration = Duration::from_millis(500);
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            tick: Self::DEFAULT_TICK,
        }
    }
}

/// The rolling-update controller.
pub struct DeploymentWatcher {
    store: StateStore,
    broker: Arc<EvalBroker>,
    clock: SharedClock,
    config: WatcherConfig,
    /// First observed `Running` report per allocation, for
    /// `min_healthy_time` accounting.
    running_since: HashMap<String, DateTime<Utc>>,
}

impl DeploymentWatcher {
    /// New watcher; call [`DeploymentWatcher::run`] to drive it.
    pub fn new(
        store: StateStore,
        broker: Arc<EvalBroker>,
        clock: SharedClock,
        config: WatcherConfig,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            config,
            running_since: HashMap::new(),
        }
    }

    /// Follow store events and sweep on an interval until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.store.subscribe();
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(_) => self.sweep(),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => self.sweep(),
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = tick.tick() => self.sweep(),
            }
        }
    }

    /// One pass over every active deployment.
    fn sweep(&mut self) {
        let snapshot = self.store.snapshot();
        let now = self.clock.now();

        // Track first-running observations for health timers.
        for alloc in snapshot.allocs() {
            if alloc.deployment_id.is_some() && alloc.client_status == ClientStatus::Running {
                self.running_since.entry(alloc.id.clone()).or_insert(now);
            }
        }
        self.running_since
            .retain(|id, _| snapshot.alloc(id).is_some_and(|a| !a.terminal()));

        for deployment in snapshot.active_deployments() {
            self.check_deployment(&snapshot, &deployment, now);
        }
    }

    fn check_deployment(
        &self,
        snapshot: &StateSnapshot,
        deployment: &Deployment,
        now: DateTime<Utc>,
    ) {
        // Superseded or stopped jobs cancel their rollout.
        let current = snapshot.job(&deployment.job_id);
        let superseded = match &current {
            None => true,
            Some(job) => job.version != deployment.job_version || job.stopped(),
        };
        if superseded {
            info!(deployment = %deployment.id, job = %deployment.job_id, "cancelling superseded deployment");
            let _ = self.store.apply(LogEntry::UpdateDeploymentStatus {
                deployment_id: deployment.id.clone(),
                status: DeploymentStatus::Cancelled,
                description: "cancelled because the job was updated or stopped".to_string(),
            });
            return;
        }
        let Some(job) = snapshot.job_version(&deployment.job_id, deployment.job_version) else {
            return;
        };

        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        for alloc in snapshot.allocs_for_deployment(&deployment.id) {
            if alloc.deployment_healthy().is_some() {
                continue;
            }
            let Some(update) = job.update_for(&alloc.task_group) else {
                continue;
            };
            if update.health_check == HealthCheckMode::Manual {
                continue;
            }
            match alloc.client_status {
                ClientStatus::Failed | ClientStatus::Lost => unhealthy.push(alloc.id.clone()),
                ClientStatus::Running => {
                    let since = self
                        .running_since
                        .get(&alloc.id)
                        .copied()
                        .unwrap_or(now);
                    let min_healthy = chrono::Duration::from_std(update.min_healthy_time)
                        .unwrap_or_else(|_| chrono::Duration::seconds(10));
                    if now - since >= min_healthy {
                        healthy.push(alloc.id.clone());
                    } else if past_healthy_deadline(&alloc.created_at, update.healthy_deadline, now)
                    {
                        unhealthy.push(alloc.id.clone());
                    }
                }
                // Disconnected-but-within-grace allocations count as
                // neither healthy nor unhealthy.
                ClientStatus::Unknown => {}
                ClientStatus::Pending => {
                    if past_healthy_deadline(&alloc.created_at, update.healthy_deadline, now) {
                        unhealthy.push(alloc.id.clone());
                    }
                }
                ClientStatus::Complete => {}
            }
        }

        let health_changed = !healthy.is_empty() || !unhealthy.is_empty();
        if health_changed {
            if let Err(err) = self.store.apply(LogEntry::UpdateDeploymentAllocHealth {
                deployment_id: deployment.id.clone(),
                healthy: healthy.clone(),
                unhealthy: unhealthy.clone(),
                timestamp: now,
            }) {
                warn!(deployment = %deployment.id, error = %err, "failed to record alloc health");
                return;
            }
        }

        // Re-read the counters the health update refreshed.
        let snapshot = self.store.snapshot();
        let Some(deployment) = snapshot.deployment(&deployment.id) else {
            return;
        };

        // Auto-promotion: all canaries healthy.
        if deployment.requires_promotion() {
            let auto = deployment.groups.values().all(|g| {
                g.desired_canaries == 0
                    || (g.auto_promote
                        && g.placed_canaries.len() as u32 >= g.desired_canaries
                        && canaries_healthy(&snapshot, &g.placed_canaries))
            });
            if auto {
                info!(deployment = %deployment.id, "auto-promoting canaries");
                let _ = self.store.apply(LogEntry::UpdateDeploymentPromotion {
                    deployment_id: deployment.id.clone(),
                    groups: None,
                });
                self.emit_eval(&job);
                return;
            }
        }

        // Completion.
        if deployment.complete() {
            info!(deployment = %deployment.id, job = %deployment.job_id, "deployment successful");
            let _ = self.store.apply(LogEntry::UpdateDeploymentStatus {
                deployment_id: deployment.id.clone(),
                status: DeploymentStatus::Successful,
                description: "deployment completed successfully".to_string(),
            });
            let _ = self.store.apply(LogEntry::UpdateJobStability {
                job_id: deployment.job_id.clone(),
                version: deployment.job_version,
                stable: true,
            });
            return;
        }

        // Progress deadline.
        let overdue = deployment
            .groups
            .values()
            .any(|g| {
                !g.complete()
                    && g.require_progress_by
                        .map(|deadline| deadline <= now)
                        .unwrap_or(false)
            });
        if overdue && deployment.status == DeploymentStatus::Running {
            warn!(deployment = %deployment.id, job = %deployment.job_id, "deployment failed its progress deadline");
            let _ = self.store.apply(LogEntry::UpdateDeploymentStatus {
                deployment_id: deployment.id.clone(),
                status: DeploymentStatus::Failed,
                description: "deployment failed to make progress by the deadline".to_string(),
            });
            let auto_revert = deployment.groups.values().any(|g| g.auto_revert);
            if auto_revert {
                self.revert_job(&snapshot, &deployment);
            }
            return;
        }

        // A health change frees rolling-update budget: keep the job moving.
        if health_changed {
            self.emit_eval(&job);
        }
    }

    /// Re-register the most recent stable version below the failed one.
    fn revert_job(&self, snapshot: &StateSnapshot, deployment: &Deployment) {
        let Some(stable) =
            snapshot.latest_stable_job(&deployment.job_id, deployment.job_version)
        else {
            warn!(job = %deployment.job_id, "auto-revert requested but no stable version exists");
            return;
        };
        info!(
            job = %deployment.job_id,
            from_version = deployment.job_version,
            to_version = stable.version,
            "auto-reverting job"
        );
        let mut revert = Job::clone(&stable);
        revert.stop = false;
        if self
            .store
            .apply(LogEntry::UpsertJob(revert))
            .is_ok()
        {
            if let Some(job) = self.store.snapshot().job(&deployment.job_id) {
                self.emit_eval(&job);
            }
        }
    }

    /// Persist and enqueue a deployment-watcher eval for the job.
    fn emit_eval(&self, job: &Job) {
        let mut eval = Evaluation::new(job, TriggeredBy::DeploymentWatcher);
        eval.status = EvalStatus::Pending;
        if let Err(err) = self.store.apply(LogEntry::UpsertEvals(vec![eval.clone()])) {
            warn!(job = %job.id, error = %err, "failed to persist deployment eval");
            return;
        }
        if let Some(eval) = self.store.snapshot().eval(&eval.id) {
            let _ = self.broker.enqueue(Evaluation::clone(&eval));
        }
    }
}

fn past_healthy_deadline(
    created_at: &DateTime<Utc>,
    deadline: Duration,
    now: DateTime<Utc>,
) -> bool {
    let deadline = chrono::Duration::from_std(deadline).unwrap_or_else(|_| chrono::Duration::seconds(300));
    *created_at + deadline <= now
}

fn canaries_healthy(snapshot: &StateSnapshot, canaries: &[String]) -> bool {
    canaries.iter().all(|id| {
        snapshot
            .alloc(id)
            .map(|a| a.deployment_healthy() == Some(true))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use std::collections::HashMap as StdHashMap;
    use stevedore_state::{
        Allocation, Clock, DesiredStatus, JobId, JobStatus, JobType, ManualClock, Node, NodeStatus,
        PlanCommit, Resources, SchedulingEligibility, Task, TaskGroup, UpdateStrategy,
    };

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            datacenter: "dc1".to_string(),
            node_class: String::new(),
            attributes: StdHashMap::new(),
            resources: Resources::new(16_000, 32_768, 100_000),
            reserved: Resources::default(),
            host_volumes: StdHashMap::new(),
            status: NodeStatus::Ready,
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain: false,
            drain_deadline: None,
            status_updated_at: Utc::now(),
            create_index: 0,
            modify_index: 0,
        }
    }

    fn job(update: UpdateStrategy) -> Job {
        Job {
            id: JobId::default_ns("web"),
            job_type: JobType::Service,
            priority: 50,
            datacenters: vec!["dc1".to_string()],
            constraints: Vec::new(),
            affinities: Vec::new(),
            spreads: Vec::new(),
            task_groups: vec![TaskGroup {
                name: "api".to_string(),
                count: 2,
                tasks: vec![Task {
                    name: "main".to_string(),
                    driver: "exec".to_string(),
                    config_hash: 1,
                    env: StdHashMap::new(),
                    resources: Resources::new(100, 128, 0),
                }],
                constraints: Vec::new(),
                affinities: Vec::new(),
                spreads: Vec::new(),
                ports: Vec::new(),
                volumes: Vec::new(),
                update: None,
                reschedule: None,
                migrate: None,
                max_client_disconnect: None,
            }],
            update: Some(update),
            reschedule: None,
            migrate: None,
            version: 0,
            stop: false,
            stable: false,
            status: JobStatus::Running,
            create_index: 0,
            modify_index: 0,
        }
    }

    fn alloc(id: &str, job: &Job, index: u32, deployment: &str, canary: bool) -> Allocation {
        Allocation {
            id: id.to_string(),
            job_id: job.id.clone(),
            job_version: job.version,
            task_group: "api".to_string(),
            name: format!("web.api[{index}]"),
            index,
            node_id: "n1".to_string(),
            resources: Resources::new(100, 128, 0),
            ports: Vec::new(),
            task_env: StdHashMap::new(),
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status: ClientStatus::Pending,
            previous_allocation: None,
            next_allocation: None,
            deployment_id: Some(deployment.to_string()),
            canary,
            deployment_status: None,
            follow_up_eval_id: None,
            reschedule_events: Vec::new(),
            created_at: Utc::now(),
            create_index: 0,
            modify_index: 0,
        }
    }

    struct Harness {
        store: StateStore,
        broker: Arc<EvalBroker>,
        clock: ManualClock,
        watcher: DeploymentWatcher,
        job: Job,
        deployment_id: String,
    }

    fn harness(update: UpdateStrategy) -> Harness {
        let store = StateStore::new();
        let clock = ManualClock::new(Utc::now());
        let shared: SharedClock = Arc::new(clock.clone());
        let broker = Arc::new(EvalBroker::new(BrokerConfig::default(), shared.clone()));
        broker.set_enabled(true);

        store.apply(LogEntry::UpsertNode(node("n1"))).unwrap();
        let j = job(update.clone());
        store.apply(LogEntry::UpsertJob(j.clone())).unwrap();
        let j = Job::clone(&store.snapshot().job(&j.id).unwrap());

        let deployment = Deployment::new(&j, clock.now());
        let deployment_id = deployment.id.clone();
        store
            .apply(LogEntry::UpsertDeployment(deployment))
            .unwrap();

        let watcher = DeploymentWatcher::new(
            store.clone(),
            broker.clone(),
            shared,
            WatcherConfig::default(),
        );
        Harness {
            store,
            broker,
            clock,
            watcher,
            job: j,
            deployment_id,
        }
    }

    fn commit_allocs(h: &Harness, allocs: Vec<Allocation>) {
        h.store
            .apply(LogEntry::ApplyPlanResults(PlanCommit {
                allocs,
                ..PlanCommit::default()
            }))
            .unwrap();
    }

    fn report_running(h: &Harness, ids: &[&str]) {
        h.store
            .apply(LogEntry::UpdateAllocsFromClient(
                ids.iter()
                    .map(|id| stevedore_state::ClientAllocUpdate {
                        alloc_id: id.to_string(),
                        client_status: ClientStatus::Running,
                    })
                    .collect(),
            ))
            .unwrap();
    }

    #[tokio::test]
    async fn running_allocs_become_healthy_after_min_healthy_time() {
        let mut h = harness(UpdateStrategy {
            max_parallel: 2,
            min_healthy_time: Duration::from_secs(10),
            ..UpdateStrategy::default()
        });
        commit_allocs(
            &h,
            vec![
                alloc("a1", &h.job, 0, &h.deployment_id, false),
                alloc("a2", &h.job, 1, &h.deployment_id, false),
            ],
        );
        report_running(&h, &["a1", "a2"]);

        // First sweep records running-since; nothing healthy yet.
        h.watcher.sweep();
        let dep = h.store.snapshot().deployment(&h.deployment_id).unwrap();
        assert_eq!(dep.groups["api"].healthy, 0);

        h.clock.advance(Duration::from_secs(11));
        h.watcher.sweep();
        let dep = h.store.snapshot().deployment(&h.deployment_id).unwrap();
        assert_eq!(dep.groups["api"].healthy, 2);
        // All desired instances healthy: the rollout completed.
        assert_eq!(dep.status, DeploymentStatus::Successful);
        // The finished version is now the stable revert target.
        let job = h.store.snapshot().job(&h.job.id).unwrap();
        assert!(job.stable);
    }

    #[tokio::test]
    async fn failed_alloc_is_marked_unhealthy() {
        let mut h = harness(UpdateStrategy {
            max_parallel: 1,
            ..UpdateStrategy::default()
        });
        commit_allocs(&h, vec![alloc("a1", &h.job, 0, &h.deployment_id, false)]);
        h.store
            .apply(LogEntry::UpdateAllocsFromClient(vec![
                stevedore_state::ClientAllocUpdate {
                    alloc_id: "a1".to_string(),
                    client_status: ClientStatus::Failed,
                },
            ]))
            .unwrap();

        h.watcher.sweep();
        let dep = h.store.snapshot().deployment(&h.deployment_id).unwrap();
        assert_eq!(dep.groups["api"].unhealthy, 1);
    }

    #[tokio::test]
    async fn health_change_emits_deployment_watcher_eval() {
        let mut h = harness(UpdateStrategy {
            max_parallel: 1,
            min_healthy_time: Duration::from_secs(5),
            ..UpdateStrategy::default()
        });
        commit_allocs(&h, vec![alloc("a1", &h.job, 0, &h.deployment_id, false)]);
        report_running(&h, &["a1"]);
        h.watcher.sweep();
        h.clock.advance(Duration::from_secs(6));
        h.watcher.sweep();

        let snap = h.store.snapshot();
        assert!(
            snap.evals()
                .any(|e| e.triggered_by == TriggeredBy::DeploymentWatcher),
            "expected a deployment-watcher eval"
        );
        assert!(h.broker.stats().ready >= 1);
    }

    #[tokio::test]
    async fn canaries_auto_promote_when_healthy() {
        let mut h = harness(UpdateStrategy {
            max_parallel: 2,
            canary: 1,
            auto_promote: true,
            min_healthy_time: Duration::from_secs(5),
            ..UpdateStrategy::default()
        });
        commit_allocs(&h, vec![alloc("c1", &h.job, 2, &h.deployment_id, true)]);
        report_running(&h, &["c1"]);
        h.watcher.sweep();
        h.clock.advance(Duration::from_secs(6));
        h.watcher.sweep();
        // Health landed; one more sweep observes it and promotes.
        h.watcher.sweep();

        let dep = h.store.snapshot().deployment(&h.deployment_id).unwrap();
        assert!(dep.groups["api"].promoted, "canary group should promote");
    }

    #[tokio::test]
    async fn progress_deadline_fails_and_auto_reverts() {
        let mut h = harness(UpdateStrategy {
            max_parallel: 1,
            auto_revert: true,
            progress_deadline: Duration::from_secs(60),
            ..UpdateStrategy::default()
        });
        // Make version 0 the stable fallback, then roll a new version that
        // never becomes healthy.
        h.store
            .apply(LogEntry::UpdateJobStability {
                job_id: h.job.id.clone(),
                version: 0,
                stable: true,
            })
            .unwrap();
        let mut v1 = h.job.clone();
        v1.task_groups[0].tasks[0].config_hash = 2;
        h.store.apply(LogEntry::UpsertJob(v1)).unwrap();
        let v1 = Job::clone(&h.store.snapshot().job(&h.job.id).unwrap());
        assert_eq!(v1.version, 1);

        let deployment = Deployment::new(&v1, h.clock.now());
        let dep_id = deployment.id.clone();
        h.store
            .apply(LogEntry::UpsertDeployment(deployment))
            .unwrap();

        h.clock.advance(Duration::from_secs(61));
        h.watcher.sweep();

        let snap = h.store.snapshot();
        let dep = snap.deployment(&dep_id).unwrap();
        assert_eq!(dep.status, DeploymentStatus::Failed);
        // Auto-revert re-registered the stable version as version 2.
        let job = snap.job(&h.job.id).unwrap();
        assert_eq!(job.version, 2);
        assert_eq!(job.task_groups[0].tasks[0].config_hash, 1);
    }

    #[tokio::test]
    async fn newer_job_version_cancels_deployment() {
        let mut h = harness(UpdateStrategy::default());
        let mut v1 = h.job.clone();
        v1.task_groups[0].tasks[0].config_hash = 9;
        h.store.apply(LogEntry::UpsertJob(v1)).unwrap();

        h.watcher.sweep();
        let dep = h.store.snapshot().deployment(&h.deployment_id).unwrap();
        assert_eq!(dep.status, DeploymentStatus::Cancelled);
    }
}
