//! The plan applier: single-writer serialization of plan commits.
//!
//! Workers submit plans over a bounded channel (backpressure: submissions
//! block when the queue is full). The applier takes them FIFO, re-validates
//! each touched node against the authoritative state, and commits the
//! accepted subset as one atomic log entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use stevedore_state::{
    Allocation, Evaluation, JobId, LogEntry, Plan, PlanCommit, PlanResult, PlanStop, StateError,
    StateSnapshot, StateStore, TriggeredBy,
};

use crate::broker::EvalBroker;

/// Applier tunables.
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    /// Bounded submission queue depth; workers block beyond it.
    pub queue_depth: usize,
    /// Plans whose snapshot lags the committed index by more than this are
    /// rejected outright with a refresh index.
    pub max_snapshot_lag: u64,
    /// Plans creating more allocations than this are rejected; the worker
    /// must split.
    pub max_plan_size: usize,
}

impl ApplierConfig {
    /// Default submission queue depth.
    pub const DEFAULT_QUEUE_DEPTH: usize = 64;
    /// Default snapshot-lag cutoff.
    pub const DEFAULT_MAX_SNAPSHOT_LAG: u64 = 4096;
    /// Default plan size cap.
    pub const DEFAULT_MAX_PLAN_SIZE: usize = 256;
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            queue_depth: Self::DEFAULT_QUEUE_DEPTH,
            max_snapshot_lag: Self::DEFAULT_MAX_SNAPSHOT_LAG,
            max_plan_size: Self::DEFAULT_MAX_PLAN_SIZE,
        }
    }
}

/// Why a submission failed outright (distinct from per-node rejection).
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The applier is gone; the submitter is no longer on the leader.
    #[error("not the leader")]
    NotLeader,
    /// The plan exceeds the size cap and must be split.
    #[error("plan creates {allocs} allocations, above the cap of {max}")]
    Oversized {
        /// Allocations the plan would create.
        allocs: usize,
        /// Configured cap.
        max: usize,
    },
    /// The commit itself failed validation in the store.
    #[error(transparent)]
    State(#[from] StateError),
}

struct PlanRequest {
    plan: Plan,
    reply: oneshot::Sender<Result<PlanResult, ApplyError>>,
}

/// Submission side of the applier queue. Cheap to clone; dropping the
/// applier task turns every submit into [`ApplyError::NotLeader`].
#[derive(Clone)]
pub struct ApplierHandle {
    tx: mpsc::Sender<PlanRequest>,
}

impl ApplierHandle {
    /// Submit a plan and wait for the applier's verdict.
    pub async fn submit(&self, plan: Plan) -> Result<PlanResult, ApplyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PlanRequest { plan, reply })
            .await
            .map_err(|_| ApplyError::NotLeader)?;
        rx.await.map_err(|_| ApplyError::NotLeader)?
    }
}

/// The leader-side applier task.
pub struct PlanApplier {
    rx: mpsc::Receiver<PlanRequest>,
    store: StateStore,
    broker: Arc<EvalBroker>,
    config: ApplierConfig,
}

/// Build the submission handle and the applier task it feeds. The broker
/// receives evals the applier commits (e.g. for preempted jobs).
pub fn applier_channel(
    store: StateStore,
    broker: Arc<EvalBroker>,
    config: ApplierConfig,
) -> (ApplierHandle, PlanApplier) {
    let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
    (
        ApplierHandle { tx },
        PlanApplier {
            rx,
            store,
            broker,
            config,
        },
    )
}

impl PlanApplier {
    /// Consume submissions until every handle is dropped (leader
    /// step-down).
    pub async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            let result = self.evaluate(request.plan);
            let _ = request.reply.send(result);
        }
    }

    /// Re-validate one plan against the current state and commit its
    /// accepted subset.
    fn evaluate(&self, plan: Plan) -> Result<PlanResult, ApplyError> {
        if plan.alloc_count() > self.config.max_plan_size {
            return Err(ApplyError::Oversized {
                allocs: plan.alloc_count(),
                max: self.config.max_plan_size,
            });
        }

        let snapshot = self.store.snapshot();
        let latest = snapshot.latest_index();

        if plan.snapshot_index.saturating_add(self.config.max_snapshot_lag) < latest {
            let rejected: Vec<String> = plan.touched_nodes().cloned().collect();
            debug!(
                eval = %plan.eval_id,
                snapshot_index = plan.snapshot_index,
                latest,
                "plan snapshot is older than the retained window; rejecting"
            );
            return Ok(PlanResult {
                accepted_allocs: Vec::new(),
                rejected_nodes: rejected,
                index: latest,
                refresh_index: Some(latest),
            });
        }

        let mut commit = PlanCommit::default();
        let mut rejected_nodes = Vec::new();
        let mut accepted_ids = Vec::new();

        for node_id in plan.touched_nodes() {
            match self.check_node(&snapshot, &plan, node_id) {
                Ok(()) => {
                    if let Some(allocs) = plan.node_allocs.get(node_id) {
                        for alloc in allocs {
                            accepted_ids.push(alloc.id.clone());
                            commit.allocs.push(alloc.clone());
                        }
                    }
                    if let Some(stops) = plan.node_stops.get(node_id) {
                        commit.stops.extend(stops.iter().cloned());
                    }
                    if let Some(evictions) = plan.node_preemptions.get(node_id) {
                        for alloc_id in evictions {
                            commit.preemptions.push(PlanStop {
                                alloc_id: alloc_id.clone(),
                                description: format!(
                                    "preempted by higher priority job {}",
                                    plan.job_id
                                ),
                            });
                        }
                    }
                }
                Err(reason) => {
                    warn!(
                        eval = %plan.eval_id,
                        node = %node_id,
                        reason,
                        "rejecting plan subset for node"
                    );
                    rejected_nodes.push(node_id.clone());
                }
            }
        }

        // Preempted jobs get a fresh eval in the same commit.
        commit.evals = self.preemption_evals(&snapshot, &commit.preemptions);

        // The deployment rides along only when the placements that justify
        // it were accepted.
        if rejected_nodes.is_empty() {
            commit.deployment = plan.deployment.clone();
        }

        let commit_evals: Vec<Evaluation> = commit.evals.clone();
        let index = if commit.is_empty() {
            latest
        } else {
            self.store.apply(LogEntry::ApplyPlanResults(commit))?
        };

        // Hand back the committed records with their stamped indices.
        let committed = self.store.snapshot();
        let accepted_allocs: Vec<Allocation> = accepted_ids
            .iter()
            .filter_map(|id| committed.alloc(id).map(|a| Allocation::clone(&a)))
            .collect();

        // Queue the evals the commit carried.
        for eval in commit_evals {
            let stamped = committed
                .eval(&eval.id)
                .map(|e| Evaluation::clone(&e))
                .unwrap_or(eval);
            let _ = self.broker.enqueue(stamped);
        }

        let refresh_index = if rejected_nodes.is_empty() {
            None
        } else {
            Some(committed.latest_index())
        };
        Ok(PlanResult {
            accepted_allocs,
            rejected_nodes,
            index,
            refresh_index,
        })
    }

    /// Every check the scheduler's snapshot may have gone stale on.
    fn check_node(
        &self,
        snapshot: &StateSnapshot,
        plan: &Plan,
        node_id: &str,
    ) -> Result<(), &'static str> {
        let Some(node) = snapshot.node(node_id) else {
            return Err("node no longer exists");
        };
        let new_allocs = plan.node_allocs.get(node_id);
        let placements = new_allocs.map(Vec::as_slice).unwrap_or(&[]);
        let creates_new = placements
            .iter()
            .any(|a| snapshot.alloc(&a.id).is_none());
        if creates_new && !node.ready() {
            return Err("node is not ready for placements");
        }

        // Ids this plan removes from the node, one way or another.
        let mut removed: HashSet<&str> = HashSet::new();
        if let Some(stops) = plan.node_stops.get(node_id) {
            removed.extend(stops.iter().map(|s| s.alloc_id.as_str()));
        }
        if let Some(evictions) = plan.node_preemptions.get(node_id) {
            removed.extend(evictions.iter().map(String::as_str));
        }
        for alloc in placements {
            // An update replaces its own prior record.
            removed.insert(alloc.id.as_str());
        }

        let live: Vec<Arc<Allocation>> = snapshot
            .allocs_on_node(node_id)
            .into_iter()
            .filter(|a| a.should_run() && !removed.contains(a.id.as_str()))
            .collect();

        let mut used = stevedore_state::Resources::default();
        let mut used_ports: HashSet<u16> = HashSet::new();
        for alloc in &live {
            used.add(&alloc.resources);
            used_ports.extend(alloc.ports.iter().map(|p| p.port));
        }
        for alloc in placements {
            used.add(&alloc.resources);
            for port in &alloc.ports {
                if !used_ports.insert(port.port) {
                    return Err("port already in use on node");
                }
            }
        }
        if node.available().fits(&used).is_err() {
            return Err("node resources exhausted");
        }

        // No two live allocations may share (job, group, index).
        for alloc in placements {
            let conflict = snapshot.allocs().any(|existing| {
                existing.id != alloc.id
                    && existing.job_id == alloc.job_id
                    && existing.task_group == alloc.task_group
                    && existing.name == alloc.name
                    && existing.should_run()
                    && !removed.contains(existing.id.as_str())
                    && !plan
                        .node_stops
                        .values()
                        .flatten()
                        .any(|s| s.alloc_id == existing.id)
            });
            if conflict {
                return Err("conflicting allocation exists for the instance");
            }
        }
        Ok(())
    }

    fn preemption_evals(
        &self,
        snapshot: &StateSnapshot,
        preemptions: &[PlanStop],
    ) -> Vec<Evaluation> {
        let mut jobs: HashMap<JobId, Evaluation> = HashMap::new();
        for stop in preemptions {
            let Some(alloc) = snapshot.alloc(&stop.alloc_id) else {
                continue;
            };
            if jobs.contains_key(&alloc.job_id) {
                continue;
            }
            let Some(job) = snapshot.job(&alloc.job_id) else {
                continue;
            };
            let eval = Evaluation::new(&job, TriggeredBy::Preemption);
            jobs.insert(alloc.job_id.clone(), eval);
        }
        jobs.into_values().collect()
    }
}
