//! The reconciler: a pure diff of desired state against current
//! allocations.
//!
//! Given identical inputs the reconciler produces identical output,
//! including generated ids, so it never reads the wall clock or a random
//! source. All time comes in through `now`; derived ids are hashes of the
//! triggering eval and the allocation they concern.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use stevedore_state::{
    Allocation, ClientStatus, DelayFunction, Deployment, DeploymentGroupState, DeploymentStatus,
    DesiredStatus, EvalStatus, Evaluation, Job, JobType, Node, NodeStatus, ReschedulePolicy,
    TaskGroup, TriggeredBy,
};

/// Everything the reconciler is allowed to look at.
pub struct ReconcileInput<'a> {
    /// Eval being processed; used to recognize follow-up reschedules and to
    /// derive deterministic ids.
    pub eval: &'a Evaluation,
    pub job: &'a Job,
    /// Prior job versions still referenced by live allocations.
    pub prior_versions: &'a HashMap<u64, Arc<Job>>,
    /// Latest deployment for the job, any status.
    pub deployment: Option<&'a Deployment>,
    pub existing: &'a [Arc<Allocation>],
    pub nodes: &'a HashMap<String, Arc<Node>>,
    /// Ids of non-terminal evals; a reschedule waiting on a follow-up eval
    /// that no longer exists is retried instead of held.
    pub pending_evals: &'a HashSet<String>,
    pub now: DateTime<Utc>,
    /// Batch-mode semantics: terminally successful allocations are left
    /// alone rather than replaced.
    pub batch: bool,
}

/// A placement the scheduler should try to make.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRequest {
    pub group: String,
    pub name: String,
    pub index: u32,
    pub canary: bool,
    pub deployment_id: Option<String>,
    /// Allocation this placement replaces, for lineage.
    pub previous: Option<Arc<Allocation>>,
    /// Record a reschedule event on the replacement.
    pub reschedule: bool,
}

/// An existing allocation to stop.
#[derive(Debug, Clone)]
pub struct StopRequest {
    pub alloc: Arc<Allocation>,
    pub description: String,
}

/// Per-group summary of what the reconciler decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DesiredUpdates {
    pub place: u32,
    pub stop: u32,
    pub migrate: u32,
    pub in_place_update: u32,
    pub destructive_update: u32,
    pub canary: u32,
    pub ignore: u32,
}

/// The reconciler's intent set.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub place: Vec<PlacementRequest>,
    pub stop: Vec<StopRequest>,
    /// Allocations updated in place (new job version, disconnect markers,
    /// follow-up linkage).
    pub inplace_update: Vec<Allocation>,
    /// Deployment to create or carry along with the plan.
    pub deployment: Option<Deployment>,
    /// Delayed reschedule evals to persist alongside the plan.
    pub follow_up_evals: Vec<Evaluation>,
    /// Per-group count of failed allocations whose reschedule policy is
    /// exhausted.
    pub exhausted: HashMap<String, u32>,
    pub desired: HashMap<String, DesiredUpdates>,
}

/// Diff one job's desired state against its current allocations.
pub fn reconcile(input: &ReconcileInput<'_>) -> Reconciliation {
    let mut out = Reconciliation::default();

    if input.job.stopped() {
        let description = if input.job.stop {
            "job deregistered"
        } else {
            "job stopped"
        };
        let mut allocs: Vec<&Arc<Allocation>> =
            input.existing.iter().filter(|a| a.should_run()).collect();
        allocs.sort_by(|a, b| a.id.cmp(&b.id));
        for alloc in allocs {
            let entry = out.desired.entry(alloc.task_group.clone()).or_default();
            entry.stop += 1;
            out.stop.push(StopRequest {
                alloc: (*alloc).clone(),
                description: description.to_string(),
            });
        }
        return out;
    }

    // One active deployment matching the current job version may carry over;
    // anything else is the watcher's to cancel.
    let mut deployment = input
        .deployment
        .filter(|d| d.active() && d.job_version == input.job.version)
        .cloned();

    for group in &input.job.task_groups {
        reconcile_group(input, group, &mut deployment, &mut out);
    }

    out.deployment = deployment;
    out
}

fn reconcile_group(
    input: &ReconcileInput<'_>,
    group: &TaskGroup,
    deployment: &mut Option<Deployment>,
    out: &mut Reconciliation,
) {
    let job = input.job;
    let mut desired = DesiredUpdates::default();

    let mut group_allocs: Vec<Arc<Allocation>> = input
        .existing
        .iter()
        .filter(|a| a.task_group == group.name)
        .cloned()
        .collect();
    group_allocs.sort_by(|a, b| (a.index, &a.id).cmp(&(b.index, &b.id)));

    // Classification pass.
    let mut live: Vec<Arc<Allocation>> = Vec::new();
    let mut failed: Vec<Arc<Allocation>> = Vec::new();
    let mut lost: Vec<Arc<Allocation>> = Vec::new();
    let mut migrating: Vec<Arc<Allocation>> = Vec::new();
    let mut reconnecting: Vec<Arc<Allocation>> = Vec::new();
    // Slots held by allocs that are neither running nor replaceable yet:
    // within disconnect grace, waiting on a reschedule delay, or exhausted.
    let mut reserved_indices: Vec<u32> = Vec::new();

    for alloc in &group_allocs {
        if alloc.desired_status != DesiredStatus::Run {
            continue;
        }
        match alloc.client_status {
            ClientStatus::Complete => {
                // Run-to-completion work that finished keeps its slot; a
                // complete service alloc vacates it instead.
                if input.batch {
                    desired.ignore += 1;
                    reserved_indices.push(alloc.index);
                }
            }
            ClientStatus::Failed => failed.push(alloc.clone()),
            ClientStatus::Lost => {
                // Terminal; slot refills through the count logic.
            }
            ClientStatus::Unknown => match input.nodes.get(&alloc.node_id) {
                Some(node) if node.status == NodeStatus::Ready => {
                    reconnecting.push(alloc.clone());
                }
                Some(node) if node.status == NodeStatus::Disconnected => {
                    if within_disconnect_grace(group, node, input.now) {
                        reserved_indices.push(alloc.index);
                        desired.ignore += 1;
                    } else {
                        lost.push(alloc.clone());
                    }
                }
                _ => lost.push(alloc.clone()),
            },
            ClientStatus::Pending | ClientStatus::Running => {
                match input.nodes.get(&alloc.node_id) {
                    None => lost.push(alloc.clone()),
                    Some(node) => match node.status {
                        NodeStatus::Down => lost.push(alloc.clone()),
                        NodeStatus::Disconnected => {
                            if within_disconnect_grace(group, node, input.now) {
                                // Mark unknown; keep the slot.
                                let mut unknown = Allocation::clone(alloc);
                                unknown.client_status = ClientStatus::Unknown;
                                out.inplace_update.push(unknown);
                                reserved_indices.push(alloc.index);
                                desired.ignore += 1;
                            } else {
                                lost.push(alloc.clone());
                            }
                        }
                        _ if node.drain => migrating.push(alloc.clone()),
                        _ => live.push(alloc.clone()),
                    },
                }
            }
        }
    }

    // Lost allocations are stopped and replaced immediately.
    for alloc in &lost {
        desired.stop += 1;
        desired.place += 1;
        out.stop.push(StopRequest {
            alloc: alloc.clone(),
            description: "alloc lost on unreachable node".to_string(),
        });
        out.place.push(PlacementRequest {
            group: group.name.clone(),
            name: alloc.name.clone(),
            index: alloc.index,
            canary: false,
            deployment_id: alloc.deployment_id.clone(),
            previous: Some(alloc.clone()),
            reschedule: false,
        });
    }

    // Reconnected allocations resume running unless a replacement took over.
    for alloc in &reconnecting {
        let replaced = group_allocs
            .iter()
            .any(|a| a.previous_allocation.as_deref() == Some(&alloc.id) && a.should_run());
        if replaced {
            desired.stop += 1;
            out.stop.push(StopRequest {
                alloc: alloc.clone(),
                description: "alloc superseded by replacement after reconnect".to_string(),
            });
        } else {
            let mut resumed = Allocation::clone(alloc);
            resumed.client_status = ClientStatus::Running;
            out.inplace_update.push(resumed);
            live.push(alloc.clone());
        }
    }

    // Failed allocations go through the reschedule policy.
    for alloc in &failed {
        reschedule_failed(input, group, alloc, &mut desired, &mut reserved_indices, out);
    }

    // Drain migrations, bounded by the migrate stanza.
    let strategy = job.migrate_for(&group.name);
    let parallel = strategy.max_parallel.max(1) as usize;
    for (i, alloc) in migrating.iter().enumerate() {
        if i < parallel {
            desired.migrate += 1;
            out.stop.push(StopRequest {
                alloc: alloc.clone(),
                description: "alloc migrating due to node drain".to_string(),
            });
            out.place.push(PlacementRequest {
                group: group.name.clone(),
                name: alloc.name.clone(),
                index: alloc.index,
                canary: false,
                deployment_id: alloc.deployment_id.clone(),
                previous: Some(alloc.clone()),
                reschedule: false,
            });
        } else {
            // Beyond max_parallel: keep running this pass.
            live.push(alloc.clone());
        }
    }

    // Split live allocations into up-to-date, in-place updatable and
    // destructively changed.
    let mut continuing: Vec<Arc<Allocation>> = Vec::new();
    let mut destructive: Vec<Arc<Allocation>> = Vec::new();
    live.sort_by(|a, b| (a.index, &a.id).cmp(&(b.index, &b.id)));
    for alloc in &live {
        if alloc.job_version == job.version {
            desired.ignore += 1;
            continuing.push(alloc.clone());
            continue;
        }
        let old_group = input
            .prior_versions
            .get(&alloc.job_version)
            .and_then(|j| j.group(&group.name));
        let needs_destructive = match old_group {
            Some(old) => groups_differ_destructively(old, group),
            // Version fell out of retention: replace to be safe.
            None => true,
        };
        if needs_destructive {
            destructive.push(alloc.clone());
        } else {
            desired.in_place_update += 1;
            let mut updated = Allocation::clone(alloc);
            updated.job_version = job.version;
            out.inplace_update.push(updated);
            continuing.push(alloc.clone());
        }
    }

    // Destructive updates: gated by the deployment when the job has one.
    let update = job.update_for(&group.name).cloned();
    let deployment_relevant =
        job.supports_deployments() && update.is_some() && group.count > 0;

    if deployment_relevant && deployment.is_none() && !destructive.is_empty() {
        *deployment = Some(new_deployment(input, job));
    }

    match (&update, deployment.as_ref()) {
        (Some(update), Some(dep)) if deployment_relevant => {
            let state = dep.groups.get(&group.name);
            let promoted = state.map(|s| s.promoted).unwrap_or(true);
            if !promoted && update.canary > 0 {
                // Canary phase: place canaries, leave old versions running.
                let existing_canaries = group_allocs
                    .iter()
                    .filter(|a| {
                        a.canary
                            && a.should_run()
                            && a.deployment_id.as_deref() == Some(dep.id.as_str())
                    })
                    .count() as u32;
                let want = update.canary.saturating_sub(existing_canaries);
                for i in 0..want {
                    let index = group.count + existing_canaries + i;
                    desired.canary += 1;
                    out.place.push(PlacementRequest {
                        group: group.name.clone(),
                        name: alloc_name(job, group, index),
                        index,
                        canary: true,
                        deployment_id: Some(dep.id.clone()),
                        previous: None,
                        reschedule: false,
                    });
                }
                desired.ignore += destructive.len() as u32;
                continuing.extend(destructive.iter().cloned());
            } else {
                // Rolling phase: at most max_parallel replacements in flight.
                let in_flight = group_allocs
                    .iter()
                    .filter(|a| {
                        a.deployment_id.as_deref() == Some(dep.id.as_str())
                            && a.should_run()
                            && a.deployment_healthy() != Some(true)
                    })
                    .count() as u32;
                let budget = update.max_parallel.saturating_sub(in_flight) as usize;
                for (i, alloc) in destructive.iter().enumerate() {
                    if i < budget {
                        desired.destructive_update += 1;
                        out.stop.push(StopRequest {
                            alloc: alloc.clone(),
                            description: "alloc replaced by rolling update".to_string(),
                        });
                        out.place.push(PlacementRequest {
                            group: group.name.clone(),
                            name: alloc.name.clone(),
                            index: alloc.index,
                            canary: false,
                            deployment_id: Some(dep.id.clone()),
                            previous: Some(alloc.clone()),
                            reschedule: false,
                        });
                    } else {
                        desired.ignore += 1;
                        continuing.push(alloc.clone());
                    }
                }
            }
        }
        _ => {
            // No deployment gating: replace everything now.
            for alloc in &destructive {
                desired.destructive_update += 1;
                out.stop.push(StopRequest {
                    alloc: alloc.clone(),
                    description: "alloc replaced by job update".to_string(),
                });
                out.place.push(PlacementRequest {
                    group: group.name.clone(),
                    name: alloc.name.clone(),
                    index: alloc.index,
                    canary: false,
                    deployment_id: None,
                    previous: Some(alloc.clone()),
                    reschedule: false,
                });
            }
        }
    }

    // Count math: replacements net zero, so the occupied slots are the
    // continuing allocs, the reserved slots, and the placements emitted for
    // this group (minus canaries, which ride above the count).
    let placements: Vec<u32> = out
        .place
        .iter()
        .filter(|p| p.group == group.name && !p.canary)
        .map(|p| p.index)
        .collect();
    let occupied = continuing.len() + reserved_indices.len() + placements.len();
    let target = group.count as usize;

    if occupied < target {
        let mut taken: Vec<u32> = continuing.iter().map(|a| a.index).collect();
        taken.extend(&reserved_indices);
        taken.extend(&placements);
        taken.sort_unstable();
        let mut next = 0u32;
        for _ in occupied..target {
            while taken.binary_search(&next).is_ok() {
                next += 1;
            }
            taken.insert(taken.binary_search(&next).unwrap_err(), next);
            desired.place += 1;
            out.place.push(PlacementRequest {
                group: group.name.clone(),
                name: alloc_name(job, group, next),
                index: next,
                canary: false,
                deployment_id: deployment
                    .as_ref()
                    .filter(|_| deployment_relevant)
                    .map(|d| d.id.clone()),
                previous: None,
                reschedule: false,
            });
        }
    } else if occupied > target {
        // Scale down: stop old versions first, then highest indices.
        let mut surplus = occupied - target;
        let mut by_preference: Vec<Arc<Allocation>> = continuing.clone();
        by_preference.sort_by_key(|a| (a.job_version == job.version, std::cmp::Reverse(a.index)));
        for alloc in by_preference {
            if surplus == 0 {
                break;
            }
            desired.stop += 1;
            if desired.ignore > 0 {
                desired.ignore -= 1;
            }
            out.stop.push(StopRequest {
                alloc,
                description: "alloc not needed due to job update".to_string(),
            });
            surplus -= 1;
        }
    }

    out.desired.insert(group.name.clone(), desired);
}

fn within_disconnect_grace(group: &TaskGroup, node: &Node, now: DateTime<Utc>) -> bool {
    let Some(grace) = group.max_client_disconnect else {
        return false;
    };
    let Ok(grace) = chrono::Duration::from_std(grace) else {
        return false;
    };
    node.status_updated_at + grace > now
}

fn reschedule_failed(
    input: &ReconcileInput<'_>,
    group: &TaskGroup,
    alloc: &Arc<Allocation>,
    desired: &mut DesiredUpdates,
    reserved_indices: &mut Vec<u32>,
    out: &mut Reconciliation,
) {
    // The follow-up eval for a delayed reschedule is running now: place.
    if alloc.follow_up_eval_id.as_deref() == Some(input.eval.id.as_str()) {
        desired.place += 1;
        out.place.push(PlacementRequest {
            group: group.name.clone(),
            name: alloc.name.clone(),
            index: alloc.index,
            canary: false,
            deployment_id: alloc.deployment_id.clone(),
            previous: Some(alloc.clone()),
            reschedule: true,
        });
        return;
    }
    // Waiting on a different follow-up eval: hold the slot, unless that
    // eval is gone (e.g. cancelled by coalescing), in which case retry.
    if let Some(follow_up) = &alloc.follow_up_eval_id {
        if input.pending_evals.contains(follow_up) {
            reserved_indices.push(alloc.index);
            desired.ignore += 1;
            return;
        }
    }

    let policy = input
        .job
        .reschedule_for(&group.name)
        .cloned()
        .unwrap_or_else(|| default_reschedule_policy(input.job.job_type));

    let within_budget = policy.unlimited
        || alloc.reschedule_attempts_in(policy.interval, input.now) < policy.attempts;
    if !within_budget || (policy.attempts == 0 && !policy.unlimited) {
        *out.exhausted.entry(group.name.clone()).or_insert(0) += 1;
        reserved_indices.push(alloc.index);
        desired.ignore += 1;
        return;
    }

    let attempt = alloc.reschedule_events.len() as u32;
    let delay = reschedule_delay(&policy, attempt);
    if delay.is_zero() {
        desired.place += 1;
        out.place.push(PlacementRequest {
            group: group.name.clone(),
            name: alloc.name.clone(),
            index: alloc.index,
            canary: false,
            deployment_id: alloc.deployment_id.clone(),
            previous: Some(alloc.clone()),
            reschedule: true,
        });
        return;
    }

    // Delay first: emit a follow-up eval and link the alloc to it.
    let wait_until =
        input.now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    let mut follow_up = Evaluation::new(input.job, TriggeredBy::AllocFailure);
    follow_up.id = derived_id(&input.eval.id, &alloc.id);
    follow_up.status = EvalStatus::Pending;
    follow_up.wait_until = Some(wait_until);
    follow_up.previous_eval = Some(input.eval.id.clone());

    let mut updated = Allocation::clone(alloc);
    updated.follow_up_eval_id = Some(follow_up.id.clone());
    out.inplace_update.push(updated);
    out.follow_up_evals.push(follow_up);
    reserved_indices.push(alloc.index);
    desired.ignore += 1;
}

/// Delay before reschedule attempt `attempt` (zero-based), per the policy's
/// delay function.
pub fn reschedule_delay(policy: &ReschedulePolicy, attempt: u32) -> std::time::Duration {
    let base = policy.delay;
    let raw = match policy.delay_function {
        DelayFunction::Constant => base,
        DelayFunction::Exponential => {
            let factor = 2u32.saturating_pow(attempt.min(31));
            base.saturating_mul(factor)
        }
        DelayFunction::Fibonacci => {
            let (mut a, mut b) = (1u64, 1u64);
            for _ in 0..attempt {
                let next = a.saturating_add(b);
                a = b;
                b = next;
            }
            std::time::Duration::from_secs_f64((base.as_secs_f64() * a as f64).min(f64::MAX))
        }
    };
    if policy.max_delay > std::time::Duration::ZERO && raw > policy.max_delay {
        policy.max_delay
    } else {
        raw
    }
}

/// Built-in policies for jobs that do not declare one.
pub fn default_reschedule_policy(job_type: JobType) -> ReschedulePolicy {
    match job_type {
        JobType::Service | JobType::System => ReschedulePolicy {
            attempts: 0,
            interval: std::time::Duration::ZERO,
            delay: std::time::Duration::from_secs(30),
            delay_function: DelayFunction::Exponential,
            max_delay: std::time::Duration::from_secs(3600),
            unlimited: true,
        },
        JobType::Batch | JobType::Sysbatch => ReschedulePolicy {
            attempts: 1,
            interval: std::time::Duration::from_secs(24 * 3600),
            delay: std::time::Duration::from_secs(5),
            delay_function: DelayFunction::Constant,
            max_delay: std::time::Duration::ZERO,
            unlimited: false,
        },
    }
}

/// Whether replacing allocations is required to roll from `old` to `new`.
pub fn groups_differ_destructively(old: &TaskGroup, new: &TaskGroup) -> bool {
    if old.tasks.len() != new.tasks.len() {
        return true;
    }
    let old_tasks: BTreeMap<&str, _> = old.tasks.iter().map(|t| (t.name.as_str(), t)).collect();
    for task in &new.tasks {
        let Some(old_task) = old_tasks.get(task.name.as_str()) else {
            return true;
        };
        if old_task.driver != task.driver
            || old_task.config_hash != task.config_hash
            || old_task.env != task.env
            || old_task.resources != task.resources
        {
            return true;
        }
    }
    old.ports != new.ports || old.volumes != new.volumes
}

fn alloc_name(job: &Job, group: &TaskGroup, index: u32) -> String {
    format!("{}.{}[{}]", job.id.id, group.name, index)
}

fn new_deployment(input: &ReconcileInput<'_>, job: &Job) -> Deployment {
    let mut groups = HashMap::new();
    for tg in &job.task_groups {
        if let Some(update) = job.update_for(&tg.name) {
            let mut state = DeploymentGroupState::from_update(update, tg.count);
            state.require_progress_by = Some(
                input.now
                    + chrono::Duration::from_std(update.progress_deadline)
                        .unwrap_or_else(|_| chrono::Duration::seconds(600)),
            );
            groups.insert(tg.name.clone(), state);
        }
    }
    Deployment {
        id: derived_id(&input.eval.id, &format!("deployment-v{}", job.version)),
        job_id: job.id.clone(),
        job_version: job.version,
        status: DeploymentStatus::Running,
        status_description: "deployment is running".to_string(),
        groups,
        create_index: 0,
        modify_index: 0,
    }
}

/// Deterministic id derived from the eval and a discriminator, so repeated
/// reconciliation of the same snapshot emits identical intents.
fn derived_id(eval_id: &str, discriminator: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(eval_id.as_bytes());
    hasher.update(b"/");
    hasher.update(discriminator.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(32);
    for byte in &digest[..16] {
        use std::fmt::Write as _;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use stevedore_state::{
        JobId, JobStatus, RescheduleEvent, Resources, SchedulingEligibility, Task, UpdateStrategy,
    };

    fn node(id: &str, status: NodeStatus) -> Arc<Node> {
        Arc::new(Node {
            id: id.to_string(),
            datacenter: "dc1".to_string(),
            node_class: String::new(),
            attributes: HashMap::new(),
            resources: Resources::new(8000, 16_384, 100_000),
            reserved: Resources::default(),
            host_volumes: HashMap::new(),
            status,
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain: false,
            drain_deadline: None,
            status_updated_at: Utc::now(),
            create_index: 0,
            modify_index: 0,
        })
    }

    fn task(config_hash: u64) -> Task {
        Task {
            name: "main".to_string(),
            driver: "exec".to_string(),
            config_hash,
            env: HashMap::new(),
            resources: Resources::new(500, 256, 0),
        }
    }

    fn job(count: u32, config_hash: u64) -> Job {
        Job {
            id: JobId::default_ns("web"),
            job_type: JobType::Service,
            priority: 50,
            datacenters: Vec::new(),
            constraints: Vec::new(),
            affinities: Vec::new(),
            spreads: Vec::new(),
            task_groups: vec![TaskGroup {
                name: "api".to_string(),
                count,
                tasks: vec![task(config_hash)],
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
            status: JobStatus::Running,
            create_index: 0,
            modify_index: 1,
        }
    }

    fn alloc(id: &str, job: &Job, index: u32, node: &str) -> Arc<Allocation> {
        Arc::new(Allocation {
            id: id.to_string(),
            job_id: job.id.clone(),
            job_version: job.version,
            task_group: "api".to_string(),
            name: format!("web.api[{index}]"),
            index,
            node_id: node.to_string(),
            resources: Resources::new(500, 256, 0),
            ports: Vec::new(),
            task_env: HashMap::new(),
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status: ClientStatus::Running,
            previous_allocation: None,
            next_allocation: None,
            deployment_id: None,
            canary: false,
            deployment_status: None,
            follow_up_eval_id: None,
            reschedule_events: Vec::new(),
            created_at: Utc::now(),
            create_index: 1,
            modify_index: 1,
        })
    }

    fn eval(job: &Job) -> Evaluation {
        let mut ev = Evaluation::new(job, TriggeredBy::JobRegister);
        ev.id = "eval-fixed".to_string();
        ev
    }

    struct Fixture {
        job: Job,
        eval: Evaluation,
        prior: HashMap<u64, Arc<Job>>,
        nodes: HashMap<String, Arc<Node>>,
        existing: Vec<Arc<Allocation>>,
        pending_evals: HashSet<String>,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new(job: Job) -> Self {
            let eval = eval(&job);
            let nodes = HashMap::from([
                ("n1".to_string(), node("n1", NodeStatus::Ready)),
                ("n2".to_string(), node("n2", NodeStatus::Ready)),
            ]);
            Self {
                job,
                eval,
                prior: HashMap::new(),
                nodes,
                existing: Vec::new(),
                pending_evals: HashSet::new(),
                now: Utc::now(),
            }
        }

        fn run(&self) -> Reconciliation {
            reconcile(&ReconcileInput {
                eval: &self.eval,
                job: &self.job,
                prior_versions: &self.prior,
                deployment: None,
                existing: &self.existing,
                nodes: &self.nodes,
                pending_evals: &self.pending_evals,
                now: self.now,
                batch: self.job.job_type == JobType::Batch,
            })
        }
    }

    #[test]
    fn fresh_job_places_count() {
        let fx = Fixture::new(job(3, 1));
        let out = fx.run();
        assert_eq!(out.place.len(), 3);
        assert!(out.stop.is_empty());
        let indices: Vec<u32> = out.place.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(out.place[0].name, "web.api[0]");
    }

    #[test]
    fn steady_state_is_all_ignore() {
        let mut fx = Fixture::new(job(2, 1));
        fx.existing = vec![alloc("a0", &fx.job, 0, "n1"), alloc("a1", &fx.job, 1, "n2")];
        let out = fx.run();
        assert!(out.place.is_empty());
        assert!(out.stop.is_empty());
        assert_eq!(out.desired["api"].ignore, 2);
    }

    #[test]
    fn reconcile_twice_is_identical() {
        let mut fx = Fixture::new(job(2, 1));
        let mut failed = Allocation::clone(&alloc("a0", &fx.job, 0, "n1"));
        failed.client_status = ClientStatus::Failed;
        fx.existing = vec![Arc::new(failed), alloc("a1", &fx.job, 1, "n2")];
        fx.job.reschedule = Some(ReschedulePolicy {
            attempts: 3,
            interval: Duration::from_secs(300),
            delay: Duration::from_secs(10),
            delay_function: DelayFunction::Exponential,
            max_delay: Duration::from_secs(120),
            unlimited: false,
        });

        let a = fx.run();
        let b = fx.run();
        assert_eq!(a.place, b.place);
        assert_eq!(a.desired, b.desired);
        assert_eq!(
            a.follow_up_evals.iter().map(|e| &e.id).collect::<Vec<_>>(),
            b.follow_up_evals.iter().map(|e| &e.id).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn scale_down_stops_highest_indices() {
        let mut fx = Fixture::new(job(1, 1));
        fx.existing = vec![
            alloc("a0", &fx.job, 0, "n1"),
            alloc("a1", &fx.job, 1, "n2"),
            alloc("a2", &fx.job, 2, "n1"),
        ];
        let out = fx.run();
        assert!(out.place.is_empty());
        assert_eq!(out.stop.len(), 2);
        let mut stopped: Vec<u32> = out.stop.iter().map(|s| s.alloc.index).collect();
        stopped.sort_unstable();
        assert_eq!(stopped, vec![1, 2]);
    }

    #[test]
    fn stopped_job_stops_everything() {
        let mut fx = Fixture::new(job(2, 1));
        fx.existing = vec![alloc("a0", &fx.job, 0, "n1"), alloc("a1", &fx.job, 1, "n2")];
        fx.job.stop = true;
        let out = fx.run();
        assert!(out.place.is_empty());
        assert_eq!(out.stop.len(), 2);
        assert!(out.stop.iter().all(|s| s.description == "job deregistered"));
    }

    #[test]
    fn lost_node_replaces_allocs() {
        let mut fx = Fixture::new(job(2, 1));
        fx.existing = vec![alloc("a0", &fx.job, 0, "n1"), alloc("a1", &fx.job, 1, "n2")];
        fx.nodes
            .insert("n1".to_string(), node("n1", NodeStatus::Down));
        let out = fx.run();
        assert_eq!(out.stop.len(), 1);
        assert_eq!(out.place.len(), 1);
        assert_eq!(out.place[0].index, 0);
        assert_eq!(
            out.place[0].previous.as_ref().map(|a| a.id.as_str()),
            Some("a0")
        );
    }

    #[test]
    fn disconnected_within_grace_is_held() {
        let mut fx = Fixture::new(job(1, 1));
        fx.job.task_groups[0].max_client_disconnect = Some(Duration::from_secs(300));
        fx.existing = vec![alloc("a0", &fx.job, 0, "n1")];
        fx.nodes
            .insert("n1".to_string(), node("n1", NodeStatus::Disconnected));
        let out = fx.run();
        assert!(out.place.is_empty());
        assert!(out.stop.is_empty());
        // Marked unknown in place.
        assert_eq!(out.inplace_update.len(), 1);
        assert_eq!(out.inplace_update[0].client_status, ClientStatus::Unknown);
    }

    #[test]
    fn disconnected_past_grace_is_replaced() {
        let mut fx = Fixture::new(job(1, 1));
        fx.job.task_groups[0].max_client_disconnect = Some(Duration::from_secs(300));
        fx.existing = vec![alloc("a0", &fx.job, 0, "n1")];
        let mut n = Node::clone(&node("n1", NodeStatus::Disconnected));
        n.status_updated_at = fx.now - chrono::Duration::seconds(600);
        fx.nodes.insert("n1".to_string(), Arc::new(n));
        let out = fx.run();
        assert_eq!(out.stop.len(), 1);
        assert_eq!(out.place.len(), 1);
    }

    #[test]
    fn destructive_change_without_update_stanza_replaces_all() {
        let mut fx = Fixture::new(job(2, 2));
        fx.job.version = 1;
        let old = job(2, 1);
        let mut a0 = Allocation::clone(&alloc("a0", &old, 0, "n1"));
        a0.job_version = 0;
        let mut a1 = Allocation::clone(&alloc("a1", &old, 1, "n2"));
        a1.job_version = 0;
        fx.existing = vec![Arc::new(a0), Arc::new(a1)];
        fx.prior.insert(0, Arc::new(old));
        let out = fx.run();
        assert_eq!(out.stop.len(), 2);
        assert_eq!(out.place.len(), 2);
        assert_eq!(out.desired["api"].destructive_update, 2);
    }

    #[test]
    fn nondestructive_change_updates_in_place() {
        // Count change only: same tasks.
        let mut fx = Fixture::new(job(3, 1));
        fx.job.version = 1;
        let old = job(2, 1);
        let mut a0 = Allocation::clone(&alloc("a0", &old, 0, "n1"));
        a0.job_version = 0;
        let mut a1 = Allocation::clone(&alloc("a1", &old, 1, "n2"));
        a1.job_version = 0;
        fx.existing = vec![Arc::new(a0), Arc::new(a1)];
        fx.prior.insert(0, Arc::new(old));
        let out = fx.run();
        assert!(out.stop.is_empty());
        assert_eq!(out.inplace_update.len(), 2);
        assert!(out.inplace_update.iter().all(|a| a.job_version == 1));
        // Scale-up placement for the third instance.
        assert_eq!(out.place.len(), 1);
        assert_eq!(out.place[0].index, 2);
    }

    #[test]
    fn rolling_update_respects_max_parallel() {
        let mut fx = Fixture::new(job(5, 2));
        fx.job.version = 1;
        fx.job.update = Some(UpdateStrategy {
            max_parallel: 2,
            min_healthy_time: Duration::from_secs(10),
            ..UpdateStrategy::default()
        });
        let mut old = job(5, 1);
        old.update = fx.job.update.clone();
        for i in 0..5 {
            let mut a = Allocation::clone(&alloc(&format!("a{i}"), &old, i, "n1"));
            a.job_version = 0;
            fx.existing.push(Arc::new(a));
        }
        fx.prior.insert(0, Arc::new(old));
        let out = fx.run();
        assert_eq!(out.desired["api"].destructive_update, 2);
        assert_eq!(out.stop.len(), 2);
        assert_eq!(out.place.len(), 2);
        assert!(out.deployment.is_some());
        let dep = out.deployment.as_ref().unwrap();
        assert_eq!(dep.job_version, 1);
        assert!(out.place.iter().all(|p| p.deployment_id.as_deref() == Some(dep.id.as_str())));
    }

    #[test]
    fn canary_phase_places_only_canaries() {
        let mut fx = Fixture::new(job(5, 2));
        fx.job.version = 1;
        fx.job.update = Some(UpdateStrategy {
            max_parallel: 2,
            canary: 1,
            ..UpdateStrategy::default()
        });
        let mut old = job(5, 1);
        old.update = fx.job.update.clone();
        for i in 0..5 {
            let mut a = Allocation::clone(&alloc(&format!("a{i}"), &old, i, "n1"));
            a.job_version = 0;
            fx.existing.push(Arc::new(a));
        }
        fx.prior.insert(0, Arc::new(old));
        let out = fx.run();
        assert_eq!(out.stop.len(), 0, "canaries must not stop old allocs");
        assert_eq!(out.place.len(), 1);
        assert!(out.place[0].canary);
        assert_eq!(out.place[0].index, 5);
        assert_eq!(out.desired["api"].canary, 1);
    }

    #[test]
    fn exponential_reschedule_delays() {
        let policy = ReschedulePolicy {
            attempts: 3,
            interval: Duration::from_secs(300),
            delay: Duration::from_secs(10),
            delay_function: DelayFunction::Exponential,
            max_delay: Duration::from_secs(120),
            unlimited: false,
        };
        assert_eq!(reschedule_delay(&policy, 0), Duration::from_secs(10));
        assert_eq!(reschedule_delay(&policy, 1), Duration::from_secs(20));
        assert_eq!(reschedule_delay(&policy, 2), Duration::from_secs(40));
        assert_eq!(reschedule_delay(&policy, 5), Duration::from_secs(120));
    }

    #[test]
    fn fibonacci_reschedule_delays() {
        let policy = ReschedulePolicy {
            attempts: 5,
            interval: Duration::from_secs(600),
            delay: Duration::from_secs(5),
            delay_function: DelayFunction::Fibonacci,
            max_delay: Duration::ZERO,
            unlimited: false,
        };
        let secs: Vec<u64> = (0..5)
            .map(|n| reschedule_delay(&policy, n).as_secs())
            .collect();
        assert_eq!(secs, vec![5, 5, 10, 15, 25]);
    }

    #[test]
    fn failed_alloc_with_delay_gets_follow_up_eval() {
        let mut fx = Fixture::new(job(1, 1));
        fx.job.reschedule = Some(ReschedulePolicy {
            attempts: 3,
            interval: Duration::from_secs(300),
            delay: Duration::from_secs(10),
            delay_function: DelayFunction::Exponential,
            max_delay: Duration::from_secs(120),
            unlimited: false,
        });
        let mut failed = Allocation::clone(&alloc("a0", &fx.job, 0, "n1"));
        failed.client_status = ClientStatus::Failed;
        fx.existing = vec![Arc::new(failed)];
        let out = fx.run();
        assert!(out.place.is_empty());
        assert_eq!(out.follow_up_evals.len(), 1);
        let follow = &out.follow_up_evals[0];
        assert_eq!(
            follow.wait_until,
            Some(fx.now + chrono::Duration::seconds(10))
        );
        assert_eq!(out.inplace_update.len(), 1);
        assert_eq!(
            out.inplace_update[0].follow_up_eval_id.as_deref(),
            Some(follow.id.as_str())
        );
    }

    #[test]
    fn follow_up_eval_triggers_placement() {
        let mut fx = Fixture::new(job(1, 1));
        let mut failed = Allocation::clone(&alloc("a0", &fx.job, 0, "n1"));
        failed.client_status = ClientStatus::Failed;
        failed.follow_up_eval_id = Some("eval-fixed".to_string());
        fx.existing = vec![Arc::new(failed)];
        let out = fx.run();
        assert_eq!(out.place.len(), 1);
        assert!(out.place[0].reschedule);
        assert_eq!(
            out.place[0].previous.as_ref().map(|a| a.id.as_str()),
            Some("a0")
        );
    }

    #[test]
    fn exhausted_reschedule_holds_slot() {
        let mut fx = Fixture::new(job(1, 1));
        fx.job.job_type = JobType::Batch;
        fx.job.reschedule = Some(ReschedulePolicy {
            attempts: 1,
            interval: Duration::from_secs(300),
            delay: Duration::ZERO,
            delay_function: DelayFunction::Constant,
            max_delay: Duration::ZERO,
            unlimited: false,
        });
        let mut failed = Allocation::clone(&alloc("a0", &fx.job, 0, "n1"));
        failed.client_status = ClientStatus::Failed;
        failed.reschedule_events = vec![RescheduleEvent {
            time: fx.now - chrono::Duration::seconds(30),
            prev_alloc_id: "old".to_string(),
            prev_node_id: "n1".to_string(),
        }];
        fx.existing = vec![Arc::new(failed)];
        let out = fx.run();
        assert!(out.place.is_empty());
        assert_eq!(out.exhausted.get("api"), Some(&1));
    }

    #[test]
    fn batch_complete_allocs_are_ignored() {
        let mut fx = Fixture::new(job(2, 1));
        fx.job.job_type = JobType::Batch;
        let mut done = Allocation::clone(&alloc("a0", &fx.job, 0, "n1"));
        done.client_status = ClientStatus::Complete;
        fx.existing = vec![Arc::new(done), alloc("a1", &fx.job, 1, "n2")];
        let out = fx.run();
        // The completed alloc is not replaced; only the missing slot is... it
        // is complete so its slot stays satisfied for batch.
        assert!(out.place.is_empty());
        assert!(out.stop.is_empty());
    }

    #[test]
    fn drain_migrates_up_to_max_parallel() {
        let mut fx = Fixture::new(job(3, 1));
        fx.job.migrate = Some(stevedore_state::MigrateStrategy {
            max_parallel: 1,
            ..stevedore_state::MigrateStrategy::default()
        });
        let mut draining = Node::clone(&node("n1", NodeStatus::Ready));
        draining.drain = true;
        fx.nodes.insert("n1".to_string(), Arc::new(draining));
        fx.existing = vec![
            alloc("a0", &fx.job, 0, "n1"),
            alloc("a1", &fx.job, 1, "n1"),
            alloc("a2", &fx.job, 2, "n2"),
        ];
        let out = fx.run();
        assert_eq!(out.desired["api"].migrate, 1);
        assert_eq!(out.stop.len(), 1);
        assert_eq!(out.place.len(), 1);
        assert_eq!(
            out.stop[0].description,
            "alloc migrating due to node drain"
        );
    }
}
