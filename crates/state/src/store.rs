//! The in-process stand-in for the raft-backed state store.
//!
//! Writes go through [`StateStore::apply`], which assigns the next
//! monotonic index and commits the whole entry atomically. Readers take
//! [`StateStore::snapshot`]: an `Arc` of immutable state that never blocks
//! writers. Controllers follow changes through [`StateStore::subscribe`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::alloc::{AllocDeploymentStatus, Allocation, ClientStatus, DesiredStatus};
use crate::deploy::{Deployment, DeploymentStatus};
use crate::eval::Evaluation;
use crate::job::{Job, JobId, JobStatus};
use crate::node::{Node, NodeStatus, SchedulingEligibility};
use crate::plan::PlanCommit;

/// Prior job versions retained for reverts and diffing.
const JOB_VERSION_RETENTION: usize = 6;

/// Buffered events per subscriber before lagging.
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("unknown job: {0}")]
    UnknownJob(JobId),
    #[error("unknown allocation: {0}")]
    UnknownAlloc(String),
    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),
    #[error("allocation {alloc} references missing group {group} of job {job}")]
    InvalidAllocGroup {
        alloc: String,
        job: JobId,
        group: String,
    },
}

/// Table a committed entry touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Job,
    Eval,
    Alloc,
    Deployment,
    Node,
}

/// One committed change, published to subscribers in commit order.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: Topic,
    /// Commit index of the entry that produced this event.
    pub index: u64,
    /// Primary key of the touched record.
    pub key: String,
}

/// A client-side allocation status report.
#[derive(Debug, Clone)]
pub struct ClientAllocUpdate {
    pub alloc_id: String,
    pub client_status: ClientStatus,
}

/// Replicated-log entry variants.
#[derive(Debug, Clone)]
pub enum LogEntry {
    UpsertNode(Node),
    UpdateNodeStatus {
        node_id: String,
        status: NodeStatus,
        timestamp: DateTime<Utc>,
    },
    UpdateNodeDrain {
        node_id: String,
        drain: bool,
        deadline: Option<DateTime<Utc>>,
    },
    UpdateNodeEligibility {
        node_id: String,
        eligibility: SchedulingEligibility,
    },
    UpsertJob(Job),
    DeregisterJob {
        job_id: JobId,
    },
    UpdateJobStability {
        job_id: JobId,
        version: u64,
        stable: bool,
    },
    UpsertEvals(Vec<Evaluation>),
    UpsertAllocs(Vec<Allocation>),
    UpdateAllocDesiredStatus {
        alloc_id: String,
        desired_status: DesiredStatus,
        description: String,
    },
    UpdateAllocsFromClient(Vec<ClientAllocUpdate>),
    UpsertDeployment(Deployment),
    UpdateDeploymentStatus {
        deployment_id: String,
        status: DeploymentStatus,
        description: String,
    },
    UpdateDeploymentPromotion {
        deployment_id: String,
        /// Restrict promotion to these groups; `None` promotes all.
        groups: Option<Vec<String>>,
    },
    UpdateDeploymentAllocHealth {
        deployment_id: String,
        healthy: Vec<String>,
        unhealthy: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// Atomic commit of a plan's accepted subset.
    ApplyPlanResults(PlanCommit),
}

#[derive(Clone, Default)]
struct StateData {
    latest_index: u64,
    jobs: BTreeMap<JobId, Arc<Job>>,
    job_versions: BTreeMap<JobId, BTreeMap<u64, Arc<Job>>>,
    nodes: BTreeMap<String, Arc<Node>>,
    allocs: BTreeMap<String, Arc<Allocation>>,
    evals: BTreeMap<String, Arc<Evaluation>>,
    deployments: BTreeMap<String, Arc<Deployment>>,
}

/// Point-in-time, immutable view of the cluster state.
#[derive(Clone)]
pub struct StateSnapshot {
    data: Arc<StateData>,
}

impl StateSnapshot {
    pub fn latest_index(&self) -> u64 {
        self.data.latest_index
    }

    pub fn job(&self, id: &JobId) -> Option<Arc<Job>> {
        self.data.jobs.get(id).cloned()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Arc<Job>> {
        self.data.jobs.values()
    }

    /// A specific historical (or current) version of a job.
    pub fn job_version(&self, id: &JobId, version: u64) -> Option<Arc<Job>> {
        if let Some(current) = self.data.jobs.get(id) {
            if current.version == version {
                return Some(current.clone());
            }
        }
        self.data
            .job_versions
            .get(id)
            .and_then(|versions| versions.get(&version))
            .cloned()
    }

    /// Most recent stable version strictly before `before_version`.
    pub fn latest_stable_job(&self, id: &JobId, before_version: u64) -> Option<Arc<Job>> {
        self.data
            .job_versions
            .get(id)
            .into_iter()
            .flat_map(|versions| versions.values())
            .filter(|job| job.stable && job.version < before_version)
            .max_by_key(|job| job.version)
            .cloned()
    }

    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.data.nodes.get(id).cloned()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.data.nodes.values()
    }

    /// Nodes accepting new placements.
    pub fn ready_nodes(&self) -> Vec<Arc<Node>> {
        self.data
            .nodes
            .values()
            .filter(|n| n.ready())
            .cloned()
            .collect()
    }

    pub fn alloc(&self, id: &str) -> Option<Arc<Allocation>> {
        self.data.allocs.get(id).cloned()
    }

    pub fn allocs(&self) -> impl Iterator<Item = &Arc<Allocation>> {
        self.data.allocs.values()
    }

    pub fn allocs_for_job(&self, job_id: &JobId) -> Vec<Arc<Allocation>> {
        self.data
            .allocs
            .values()
            .filter(|a| &a.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn allocs_on_node(&self, node_id: &str) -> Vec<Arc<Allocation>> {
        self.data
            .allocs
            .values()
            .filter(|a| a.node_id == node_id)
            .cloned()
            .collect()
    }

    pub fn allocs_for_deployment(&self, deployment_id: &str) -> Vec<Arc<Allocation>> {
        self.data
            .allocs
            .values()
            .filter(|a| a.deployment_id.as_deref() == Some(deployment_id))
            .cloned()
            .collect()
    }

    pub fn eval(&self, id: &str) -> Option<Arc<Evaluation>> {
        self.data.evals.get(id).cloned()
    }

    pub fn evals(&self) -> impl Iterator<Item = &Arc<Evaluation>> {
        self.data.evals.values()
    }

    /// Evals a new leader must re-seed its broker from.
    pub fn non_terminal_evals(&self) -> Vec<Arc<Evaluation>> {
        self.data
            .evals
            .values()
            .filter(|e| !e.is_terminal())
            .cloned()
            .collect()
    }

    pub fn deployment(&self, id: &str) -> Option<Arc<Deployment>> {
        self.data.deployments.get(id).cloned()
    }

    pub fn deployments(&self) -> impl Iterator<Item = &Arc<Deployment>> {
        self.data.deployments.values()
    }

    /// Newest deployment for a job, active or not.
    pub fn latest_deployment_for_job(&self, job_id: &JobId) -> Option<Arc<Deployment>> {
        self.data
            .deployments
            .values()
            .filter(|d| &d.job_id == job_id)
            .max_by_key(|d| d.create_index)
            .cloned()
    }

    pub fn active_deployments(&self) -> Vec<Arc<Deployment>> {
        self.data
            .deployments
            .values()
            .filter(|d| d.active())
            .cloned()
            .collect()
    }
}

struct StoreInner {
    data: RwLock<Arc<StateData>>,
    event_tx: broadcast::Sender<Event>,
    index_tx: watch::Sender<u64>,
}

/// Handle to the replicated state. Cheap to clone.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (index_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                data: RwLock::new(Arc::new(StateData::default())),
                event_tx,
                index_tx,
            }),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            data: self.inner.data.read().clone(),
        }
    }

    pub fn latest_index(&self) -> u64 {
        self.inner.data.read().latest_index
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.event_tx.subscribe()
    }

    /// Wait until the committed index reaches `index`.
    pub async fn wait_for_index(&self, index: u64) {
        let mut rx = self.inner.index_tx.subscribe();
        loop {
            if *rx.borrow() >= index {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Linearizable append. Returns the commit index; an entry that touches
    /// nothing returns the current index without advancing it.
    pub fn apply(&self, entry: LogEntry) -> Result<u64, StateError> {
        let mut guard = self.inner.data.write();
        let mut data = StateData::clone(&guard);
        let index = data.latest_index + 1;

        let events = apply_entry(&mut data, index, entry)?;
        if events.is_empty() {
            return Ok(data.latest_index);
        }

        data.latest_index = index;
        *guard = Arc::new(data);
        drop(guard);

        for (topic, key) in events {
            let _ = self.inner.event_tx.send(Event { topic, index, key });
        }
        let _ = self.inner.index_tx.send(index);
        Ok(index)
    }

    /// Sweep tombstones: dead jobs, terminal evals and allocations whose
    /// last modification predates `older_than`.
    pub fn gc(&self, older_than: u64) -> usize {
        let mut guard = self.inner.data.write();
        let mut data = StateData::clone(&guard);
        let mut removed = 0;

        let dead_jobs: Vec<JobId> = data
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Dead && j.modify_index < older_than)
            .map(|j| j.id.clone())
            .collect();
        for id in dead_jobs {
            let allocs_alive = data
                .allocs
                .values()
                .any(|a| a.job_id == id && !a.terminal());
            if allocs_alive {
                continue;
            }
            data.jobs.remove(&id);
            data.job_versions.remove(&id);
            removed += 1;
        }

        let stale_evals: Vec<String> = data
            .evals
            .values()
            .filter(|e| e.is_terminal() && e.modify_index < older_than)
            .map(|e| e.id.clone())
            .collect();
        removed += stale_evals.len();
        for id in stale_evals {
            data.evals.remove(&id);
        }

        let stale_allocs: Vec<String> = data
            .allocs
            .values()
            .filter(|a| a.terminal() && a.modify_index < older_than)
            .map(|a| a.id.clone())
            .collect();
        removed += stale_allocs.len();
        for id in stale_allocs {
            data.allocs.remove(&id);
        }

        if removed > 0 {
            *guard = Arc::new(data);
        }
        removed
    }
}

fn apply_entry(
    data: &mut StateData,
    index: u64,
    entry: LogEntry,
) -> Result<Vec<(Topic, String)>, StateError> {
    let mut events = Vec::new();
    match entry {
        LogEntry::UpsertNode(mut node) => {
            if let Some(prev) = data.nodes.get(&node.id) {
                node.create_index = prev.create_index;
            } else {
                node.create_index = index;
            }
            node.modify_index = index;
            events.push((Topic::Node, node.id.clone()));
            data.nodes.insert(node.id.clone(), Arc::new(node));
        }
        LogEntry::UpdateNodeStatus {
            node_id,
            status,
            timestamp,
        } => {
            let node = data
                .nodes
                .get(&node_id)
                .ok_or_else(|| StateError::UnknownNode(node_id.clone()))?;
            let mut node = Node::clone(node);
            node.status = status;
            node.status_updated_at = timestamp;
            node.modify_index = index;
            events.push((Topic::Node, node_id.clone()));
            data.nodes.insert(node_id, Arc::new(node));
        }
        LogEntry::UpdateNodeDrain {
            node_id,
            drain,
            deadline,
        } => {
            let node = data
                .nodes
                .get(&node_id)
                .ok_or_else(|| StateError::UnknownNode(node_id.clone()))?;
            let mut node = Node::clone(node);
            node.drain = drain;
            node.drain_deadline = deadline;
            // Draining implies ineligibility for new work.
            if drain {
                node.scheduling_eligibility = SchedulingEligibility::Ineligible;
            }
            node.modify_index = index;
            events.push((Topic::Node, node_id.clone()));
            data.nodes.insert(node_id, Arc::new(node));
        }
        LogEntry::UpdateNodeEligibility {
            node_id,
            eligibility,
        } => {
            let node = data
                .nodes
                .get(&node_id)
                .ok_or_else(|| StateError::UnknownNode(node_id.clone()))?;
            let mut node = Node::clone(node);
            node.scheduling_eligibility = eligibility;
            node.modify_index = index;
            events.push((Topic::Node, node_id.clone()));
            data.nodes.insert(node_id, Arc::new(node));
        }
        LogEntry::UpsertJob(mut job) => {
            if let Some(prev) = data.jobs.get(&job.id) {
                job.version = prev.version + 1;
                job.create_index = prev.create_index;
                let versions = data.job_versions.entry(job.id.clone()).or_default();
                versions.insert(prev.version, prev.clone());
                while versions.len() > JOB_VERSION_RETENTION {
                    let oldest = *versions.keys().next().unwrap_or(&0);
                    versions.remove(&oldest);
                }
            } else {
                job.version = 0;
                job.create_index = index;
            }
            job.modify_index = index;
            if !job.stop {
                job.status = JobStatus::Pending;
            }
            events.push((Topic::Job, format!("{}", job.id)));
            data.jobs.insert(job.id.clone(), Arc::new(job));
        }
        LogEntry::DeregisterJob { job_id } => {
            let job = data
                .jobs
                .get(&job_id)
                .ok_or_else(|| StateError::UnknownJob(job_id.clone()))?;
            let mut job = Job::clone(job);
            job.stop = true;
            job.status = JobStatus::Dead;
            job.modify_index = index;
            events.push((Topic::Job, format!("{job_id}")));
            data.jobs.insert(job_id, Arc::new(job));
        }
        LogEntry::UpdateJobStability {
            job_id,
            version,
            stable,
        } => {
            if let Some(current) = data.jobs.get(&job_id) {
                if current.version == version {
                    let mut job = Job::clone(current);
                    job.stable = stable;
                    job.modify_index = index;
                    events.push((Topic::Job, format!("{job_id}")));
                    data.jobs.insert(job_id.clone(), Arc::new(job));
                }
            }
            if let Some(versions) = data.job_versions.get_mut(&job_id) {
                if let Some(old) = versions.get(&version) {
                    let mut job = Job::clone(old);
                    job.stable = stable;
                    versions.insert(version, Arc::new(job));
                    if events.is_empty() {
                        events.push((Topic::Job, format!("{job_id}")));
                    }
                }
            }
        }
        LogEntry::UpsertEvals(evals) => {
            for mut eval in evals {
                if let Some(prev) = data.evals.get(&eval.id) {
                    eval.create_index = prev.create_index;
                } else {
                    eval.create_index = index;
                }
                eval.modify_index = index;
                events.push((Topic::Eval, eval.id.clone()));
                data.evals.insert(eval.id.clone(), Arc::new(eval));
            }
        }
        LogEntry::UpsertAllocs(allocs) => {
            for alloc in &allocs {
                validate_alloc(data, alloc)?;
            }
            for mut alloc in allocs {
                if let Some(prev) = data.allocs.get(&alloc.id) {
                    alloc.create_index = prev.create_index;
                } else {
                    alloc.create_index = index;
                }
                alloc.modify_index = index;
                events.push((Topic::Alloc, alloc.id.clone()));
                data.allocs.insert(alloc.id.clone(), Arc::new(alloc));
            }
        }
        LogEntry::UpdateAllocDesiredStatus {
            alloc_id,
            desired_status,
            description,
        } => {
            let alloc = data
                .allocs
                .get(&alloc_id)
                .ok_or_else(|| StateError::UnknownAlloc(alloc_id.clone()))?;
            let mut alloc = Allocation::clone(alloc);
            alloc.desired_status = desired_status;
            alloc.desired_description = description;
            alloc.modify_index = index;
            events.push((Topic::Alloc, alloc_id.clone()));
            data.allocs.insert(alloc_id, Arc::new(alloc));
        }
        LogEntry::UpdateAllocsFromClient(updates) => {
            for update in updates {
                let alloc = data
                    .allocs
                    .get(&update.alloc_id)
                    .ok_or_else(|| StateError::UnknownAlloc(update.alloc_id.clone()))?;
                let mut alloc = Allocation::clone(alloc);
                alloc.client_status = update.client_status;
                alloc.modify_index = index;
                events.push((Topic::Alloc, update.alloc_id.clone()));
                let deployment_id = alloc.deployment_id.clone();
                data.allocs.insert(update.alloc_id, Arc::new(alloc));
                if let Some(deployment_id) = deployment_id {
                    refresh_deployment_counts(data, &deployment_id, index);
                }
            }
        }
        LogEntry::UpsertDeployment(mut deployment) => {
            if let Some(prev) = data.deployments.get(&deployment.id) {
                deployment.create_index = prev.create_index;
            } else {
                deployment.create_index = index;
            }
            deployment.modify_index = index;
            events.push((Topic::Deployment, deployment.id.clone()));
            data.deployments
                .insert(deployment.id.clone(), Arc::new(deployment));
        }
        LogEntry::UpdateDeploymentStatus {
            deployment_id,
            status,
            description,
        } => {
            let deployment = data
                .deployments
                .get(&deployment_id)
                .ok_or_else(|| StateError::UnknownDeployment(deployment_id.clone()))?;
            let mut deployment = Deployment::clone(deployment);
            deployment.status = status;
            deployment.status_description = description;
            deployment.modify_index = index;
            events.push((Topic::Deployment, deployment_id.clone()));
            data.deployments.insert(deployment_id, Arc::new(deployment));
        }
        LogEntry::UpdateDeploymentPromotion {
            deployment_id,
            groups,
        } => {
            let deployment = data
                .deployments
                .get(&deployment_id)
                .ok_or_else(|| StateError::UnknownDeployment(deployment_id.clone()))?;
            let mut deployment = Deployment::clone(deployment);
            for (name, state) in deployment.groups.iter_mut() {
                let wanted = groups
                    .as_ref()
                    .map(|gs| gs.iter().any(|g| g == name))
                    .unwrap_or(true);
                if wanted {
                    state.promoted = true;
                }
            }
            deployment.modify_index = index;
            events.push((Topic::Deployment, deployment_id.clone()));
            data.deployments.insert(deployment_id, Arc::new(deployment));
        }
        LogEntry::UpdateDeploymentAllocHealth {
            deployment_id,
            healthy,
            unhealthy,
            timestamp,
        } => {
            if !data.deployments.contains_key(&deployment_id) {
                return Err(StateError::UnknownDeployment(deployment_id));
            }
            for (alloc_id, is_healthy) in healthy
                .iter()
                .map(|id| (id, true))
                .chain(unhealthy.iter().map(|id| (id, false)))
            {
                let alloc = data
                    .allocs
                    .get(alloc_id)
                    .ok_or_else(|| StateError::UnknownAlloc(alloc_id.clone()))?;
                let mut alloc = Allocation::clone(alloc);
                alloc.deployment_status = Some(AllocDeploymentStatus {
                    healthy: Some(is_healthy),
                    timestamp,
                });
                alloc.modify_index = index;
                events.push((Topic::Alloc, alloc_id.clone()));
                data.allocs.insert(alloc_id.clone(), Arc::new(alloc));
            }
            refresh_deployment_counts(data, &deployment_id, index);
            if !healthy.is_empty() {
                extend_progress_deadline(data, &deployment_id, timestamp, index);
            }
            events.push((Topic::Deployment, deployment_id));
        }
        LogEntry::ApplyPlanResults(commit) => {
            if commit.is_empty() {
                return Ok(Vec::new());
            }
            for alloc in &commit.allocs {
                validate_alloc(data, alloc)?;
            }
            for mut alloc in commit.allocs {
                if let Some(prev) = data.allocs.get(&alloc.id) {
                    alloc.create_index = prev.create_index;
                } else {
                    alloc.create_index = index;
                }
                alloc.modify_index = index;
                // Link reschedule lineage both ways.
                if let Some(prev_id) = alloc.previous_allocation.clone() {
                    if let Some(prev) = data.allocs.get(&prev_id) {
                        let mut prev = Allocation::clone(prev);
                        prev.next_allocation = Some(alloc.id.clone());
                        prev.modify_index = index;
                        events.push((Topic::Alloc, prev_id.clone()));
                        data.allocs.insert(prev_id, Arc::new(prev));
                    }
                }
                if let Some(job) = data.jobs.get(&alloc.job_id) {
                    if job.status == JobStatus::Pending {
                        let mut job = Job::clone(job);
                        job.status = JobStatus::Running;
                        job.modify_index = index;
                        events.push((Topic::Job, format!("{}", job.id)));
                        data.jobs.insert(job.id.clone(), Arc::new(job));
                    }
                }
                events.push((Topic::Alloc, alloc.id.clone()));
                data.allocs.insert(alloc.id.clone(), Arc::new(alloc));
            }
            for stop in commit.stops {
                let alloc = data
                    .allocs
                    .get(&stop.alloc_id)
                    .ok_or_else(|| StateError::UnknownAlloc(stop.alloc_id.clone()))?;
                let mut alloc = Allocation::clone(alloc);
                alloc.desired_status = DesiredStatus::Stop;
                alloc.desired_description = stop.description;
                alloc.modify_index = index;
                events.push((Topic::Alloc, stop.alloc_id.clone()));
                data.allocs.insert(stop.alloc_id, Arc::new(alloc));
            }
            for evict in commit.preemptions {
                let alloc = data
                    .allocs
                    .get(&evict.alloc_id)
                    .ok_or_else(|| StateError::UnknownAlloc(evict.alloc_id.clone()))?;
                let mut alloc = Allocation::clone(alloc);
                alloc.desired_status = DesiredStatus::Evict;
                alloc.desired_description = evict.description;
                alloc.modify_index = index;
                events.push((Topic::Alloc, evict.alloc_id.clone()));
                data.allocs.insert(evict.alloc_id, Arc::new(alloc));
            }
            if let Some(mut deployment) = commit.deployment {
                if let Some(prev) = data.deployments.get(&deployment.id) {
                    deployment.create_index = prev.create_index;
                } else {
                    deployment.create_index = index;
                }
                deployment.modify_index = index;
                let id = deployment.id.clone();
                data.deployments.insert(id.clone(), Arc::new(deployment));
                refresh_deployment_counts(data, &id, index);
                events.push((Topic::Deployment, id));
            } else {
                // Counters move when placements land on an existing rollout.
                let touched: Vec<String> = data
                    .allocs
                    .values()
                    .filter(|a| a.modify_index == index)
                    .filter_map(|a| a.deployment_id.clone())
                    .collect();
                for id in touched {
                    refresh_deployment_counts(data, &id, index);
                }
            }
            for mut eval in commit.evals {
                if let Some(prev) = data.evals.get(&eval.id) {
                    eval.create_index = prev.create_index;
                } else {
                    eval.create_index = index;
                }
                eval.modify_index = index;
                events.push((Topic::Eval, eval.id.clone()));
                data.evals.insert(eval.id.clone(), Arc::new(eval));
            }
        }
    }
    Ok(events)
}

fn validate_alloc(data: &StateData, alloc: &Allocation) -> Result<(), StateError> {
    if !data.nodes.contains_key(&alloc.node_id) {
        return Err(StateError::UnknownNode(alloc.node_id.clone()));
    }
    let job = data
        .jobs
        .get(&alloc.job_id)
        .ok_or_else(|| StateError::UnknownJob(alloc.job_id.clone()))?;
    let in_current = job.group(&alloc.task_group).is_some();
    let in_version = data
        .job_versions
        .get(&alloc.job_id)
        .and_then(|versions| versions.get(&alloc.job_version))
        .map(|j| j.group(&alloc.task_group).is_some())
        .unwrap_or(false);
    if !in_current && !in_version {
        return Err(StateError::InvalidAllocGroup {
            alloc: alloc.id.clone(),
            job: alloc.job_id.clone(),
            group: alloc.task_group.clone(),
        });
    }
    Ok(())
}

/// Recompute a deployment's placed/healthy/unhealthy counters and canary
/// list from its allocations.
fn refresh_deployment_counts(data: &mut StateData, deployment_id: &str, index: u64) {
    let Some(deployment) = data.deployments.get(deployment_id) else {
        return;
    };
    let mut deployment = Deployment::clone(deployment);
    for (group, state) in deployment.groups.iter_mut() {
        let mut placed = 0u32;
        let mut healthy = 0u32;
        let mut unhealthy = 0u32;
        let mut canaries = Vec::new();
        for alloc in data.allocs.values() {
            if alloc.deployment_id.as_deref() != Some(deployment_id)
                || alloc.task_group != *group
            {
                continue;
            }
            // A terminal alloc whose replacement exists has handed its slot
            // over; counting both would overstate `placed`.
            if alloc.client_status.is_terminal() && alloc.next_allocation.is_some() {
                continue;
            }
            placed += 1;
            if alloc.canary {
                canaries.push(alloc.id.clone());
            }
            match alloc.deployment_healthy() {
                Some(true) => healthy += 1,
                Some(false) => unhealthy += 1,
                None => {}
            }
        }
        state.placed = placed;
        state.healthy = healthy;
        state.unhealthy = unhealthy;
        canaries.sort();
        state.placed_canaries = canaries;
    }
    deployment.modify_index = index;
    data.deployments
        .insert(deployment_id.to_string(), Arc::new(deployment));
}

/// Forward progress observed: push the group deadlines out.
fn extend_progress_deadline(
    data: &mut StateData,
    deployment_id: &str,
    now: DateTime<Utc>,
    index: u64,
) {
    let Some(deployment) = data.deployments.get(deployment_id) else {
        return;
    };
    let mut deployment = Deployment::clone(deployment);
    for state in deployment.groups.values_mut() {
        let deadline = chrono::Duration::from_std(state.progress_deadline)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        state.require_progress_by = Some(now + deadline);
    }
    deployment.modify_index = index;
    data.deployments
        .insert(deployment_id.to_string(), Arc::new(deployment));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::TriggeredBy;
    use crate::job::{JobType, Resources, Task, TaskGroup};
    use std::collections::HashMap;

    fn test_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            datacenter: "dc1".to_string(),
            node_class: String::new(),
            attributes: HashMap::new(),
            resources: Resources::new(4000, 8192, 100_000),
            reserved: Resources::default(),
            host_volumes: HashMap::new(),
            status: NodeStatus::Ready,
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain: false,
            drain_deadline: None,
            status_updated_at: Utc::now(),
            create_index: 0,
            modify_index: 0,
        }
    }

    fn test_job(id: &str) -> Job {
        Job {
            id: JobId::default_ns(id),
            job_type: JobType::Service,
            priority: 50,
            datacenters: vec!["dc1".to_string()],
            constraints: Vec::new(),
            affinities: Vec::new(),
            spreads: Vec::new(),
            task_groups: vec![TaskGroup {
                name: "api".to_string(),
                count: 1,
                tasks: vec![Task {
                    name: "main".to_string(),
                    driver: "exec".to_string(),
                    config_hash: 1,
                    env: HashMap::new(),
                    resources: Resources::new(100, 128, 10),
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
            update: None,
            reschedule: None,
            migrate: None,
            version: 0,
            stop: false,
            stable: false,
            status: JobStatus::Pending,
            create_index: 0,
            modify_index: 0,
        }
    }

    fn test_alloc(id: &str, job: &JobId, node: &str) -> Allocation {
        Allocation {
            id: id.to_string(),
            job_id: job.clone(),
            job_version: 0,
            task_group: "api".to_string(),
            name: format!("{}.api[0]", job.id),
            index: 0,
            node_id: node.to_string(),
            resources: Resources::new(100, 128, 10),
            ports: Vec::new(),
            task_env: HashMap::new(),
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status: ClientStatus::Pending,
            previous_allocation: None,
            next_allocation: None,
            deployment_id: None,
            canary: false,
            deployment_status: None,
            follow_up_eval_id: None,
            reschedule_events: Vec::new(),
            created_at: Utc::now(),
            create_index: 0,
            modify_index: 0,
        }
    }

    #[test]
    fn indices_are_monotonic_and_stamped() {
        let store = StateStore::new();
        let i1 = store.apply(LogEntry::UpsertNode(test_node("n1"))).unwrap();
        let i2 = store.apply(LogEntry::UpsertJob(test_job("web"))).unwrap();
        assert!(i2 > i1);

        let snap = store.snapshot();
        let job = snap.job(&JobId::default_ns("web")).unwrap();
        assert_eq!(job.create_index, i2);
        assert_eq!(job.modify_index, i2);
        assert_eq!(snap.latest_index(), i2);
    }

    #[test]
    fn reregistration_bumps_version_and_retains_prior() {
        let store = StateStore::new();
        store.apply(LogEntry::UpsertJob(test_job("web"))).unwrap();
        let mut v2 = test_job("web");
        v2.task_groups[0].count = 3;
        store.apply(LogEntry::UpsertJob(v2)).unwrap();

        let snap = store.snapshot();
        let id = JobId::default_ns("web");
        assert_eq!(snap.job(&id).unwrap().version, 1);
        let old = snap.job_version(&id, 0).unwrap();
        assert_eq!(old.task_groups[0].count, 1);
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let store = StateStore::new();
        store.apply(LogEntry::UpsertNode(test_node("n1"))).unwrap();
        let before = store.snapshot();
        store.apply(LogEntry::UpsertNode(test_node("n2"))).unwrap();
        assert_eq!(before.nodes().count(), 1);
        assert_eq!(store.snapshot().nodes().count(), 2);
    }

    #[test]
    fn alloc_validation_rejects_unknown_node_and_group() {
        let store = StateStore::new();
        store.apply(LogEntry::UpsertJob(test_job("web"))).unwrap();
        let id = JobId::default_ns("web");

        let err = store
            .apply(LogEntry::UpsertAllocs(vec![test_alloc("a1", &id, "ghost")]))
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownNode(_)));

        store.apply(LogEntry::UpsertNode(test_node("n1"))).unwrap();
        let mut bad_group = test_alloc("a1", &id, "n1");
        bad_group.task_group = "nope".to_string();
        let err = store
            .apply(LogEntry::UpsertAllocs(vec![bad_group]))
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidAllocGroup { .. }));
    }

    #[test]
    fn empty_plan_commit_advances_no_index() {
        let store = StateStore::new();
        store.apply(LogEntry::UpsertNode(test_node("n1"))).unwrap();
        let before = store.latest_index();
        let idx = store
            .apply(LogEntry::ApplyPlanResults(PlanCommit::default()))
            .unwrap();
        assert_eq!(idx, before);
        assert_eq!(store.latest_index(), before);
    }

    #[test]
    fn plan_commit_marks_pending_job_running() {
        let store = StateStore::new();
        store.apply(LogEntry::UpsertNode(test_node("n1"))).unwrap();
        store.apply(LogEntry::UpsertJob(test_job("web"))).unwrap();
        let id = JobId::default_ns("web");
        store
            .apply(LogEntry::ApplyPlanResults(PlanCommit {
                allocs: vec![test_alloc("a1", &id, "n1")],
                ..PlanCommit::default()
            }))
            .unwrap();
        assert_eq!(store.snapshot().job(&id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn events_carry_commit_index() {
        let store = StateStore::new();
        let mut rx = store.subscribe();
        let idx = store.apply(LogEntry::UpsertNode(test_node("n1"))).unwrap();
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.index, idx);
        assert_eq!(ev.topic, Topic::Node);
        assert_eq!(ev.key, "n1");
    }

    #[test]
    fn deregister_tombstones_until_gc() {
        let store = StateStore::new();
        store.apply(LogEntry::UpsertJob(test_job("web"))).unwrap();
        let id = JobId::default_ns("web");
        store
            .apply(LogEntry::DeregisterJob { job_id: id.clone() })
            .unwrap();

        let snap = store.snapshot();
        let job = snap.job(&id).unwrap();
        assert!(job.stop);
        assert_eq!(job.status, JobStatus::Dead);

        store.gc(u64::MAX);
        assert!(store.snapshot().job(&id).is_none());
    }

    #[tokio::test]
    async fn wait_for_index_resolves_on_commit() {
        let store = StateStore::new();
        let target = store.latest_index() + 1;
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_index(target).await })
        };
        store.apply(LogEntry::UpsertNode(test_node("n1"))).unwrap();
        waiter.await.unwrap();
    }
}
