//! The system scheduler: one instance per feasible node.
//!
//! No counts, no deployments. Per-node feasibility decides placement, and
//! the sysbatch variant leaves terminally successful allocations alone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use stevedore_state::{
    Allocation, ClientStatus, EvalStatus, Evaluation, Job, Node, Plan, PlacementMetrics,
    StateSnapshot,
};

use crate::feasibility::{FeasibilityFailure, PlacementContext, check_node};
use crate::generic::{build_task_env, no_op_outcome};
use crate::reconcile::{DesiredUpdates, groups_differ_destructively};
use crate::scheduler::{
    Scheduler, SchedulerConfig, SchedulerError, SchedulerOutcome, validate_job,
};

pub(crate) struct SystemScheduler {
    sysbatch: bool,
    config: SchedulerConfig,
}

impl SystemScheduler {
    pub(crate) fn system(config: SchedulerConfig) -> Self {
        Self {
            sysbatch: false,
            config,
        }
    }

    pub(crate) fn sysbatch(config: SchedulerConfig) -> Self {
        Self {
            sysbatch: true,
            config,
        }
    }
}

impl Scheduler for SystemScheduler {
    fn process(
        &mut self,
        eval: &Evaluation,
        snapshot: &StateSnapshot,
        now: DateTime<Utc>,
    ) -> Result<SchedulerOutcome, SchedulerError> {
        let Some(job) = snapshot.job(&eval.job_id) else {
            return Ok(no_op_outcome(eval, snapshot, "job not found"));
        };
        validate_job(&job)?;

        let nodes: HashMap<String, Arc<Node>> = snapshot
            .nodes()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();
        let existing = snapshot.allocs_for_job(&eval.job_id);
        let mut plan = Plan::new(eval, snapshot.latest_index());
        let mut desired_updates: HashMap<String, DesiredUpdates> = HashMap::new();

        if job.stopped() {
            for alloc in existing.iter().filter(|a| a.should_run()) {
                desired_updates
                    .entry(alloc.task_group.clone())
                    .or_default()
                    .stop += 1;
                plan.push_stop(&alloc.node_id, &alloc.id, "job stopped");
            }
            let mut updated_eval = eval.clone();
            updated_eval.status = EvalStatus::Complete;
            updated_eval.snapshot_index = Some(snapshot.latest_index());
            let plan = if plan.is_empty() { None } else { Some(plan) };
            return Ok(SchedulerOutcome {
                plan,
                updated_eval,
                follow_up_evals: Vec::new(),
                blocked_eval: None,
                desired_updates,
            });
        }

        let live_cluster: Vec<Arc<Allocation>> = snapshot
            .allocs()
            .filter(|a| a.should_run())
            .cloned()
            .collect();
        let job_live: Vec<Arc<Allocation>> = live_cluster
            .iter()
            .filter(|a| a.job_id == job.id)
            .cloned()
            .collect();

        let mut ready: Vec<Arc<Node>> = nodes.values().filter(|n| n.ready()).cloned().collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));
        let ready_ids: HashSet<&str> = ready.iter().map(|n| n.id.as_str()).collect();

        let mut failed: HashMap<String, PlacementMetrics> = HashMap::new();
        let mut queued: HashMap<String, u32> = HashMap::new();

        for group in &job.task_groups {
            let desired = desired_updates.entry(group.name.clone()).or_default();
            let mut metrics = PlacementMetrics::default();

            // Live allocs of this group by node.
            let mut by_node: HashMap<&str, &Arc<Allocation>> = HashMap::new();
            let mut done_nodes: HashSet<&str> = HashSet::new();
            for alloc in existing.iter().filter(|a| a.task_group == group.name) {
                if self.sysbatch && alloc.client_status == ClientStatus::Complete {
                    done_nodes.insert(alloc.node_id.as_str());
                    desired.ignore += 1;
                    continue;
                }
                if alloc.should_run() {
                    by_node.insert(alloc.node_id.as_str(), alloc);
                }
            }

            // Stop instances on nodes that are gone or no longer eligible.
            for (node_id, alloc) in &by_node {
                if !ready_ids.contains(node_id) {
                    desired.stop += 1;
                    plan.push_stop(node_id, &alloc.id, "node is no longer eligible");
                }
            }

            let mut ctx =
                PlacementContext::new(&job, group, &nodes, &live_cluster, &job_live);
            let mut taken_indices: Vec<u32> = existing
                .iter()
                .filter(|a| a.task_group == group.name && a.should_run())
                .map(|a| a.index)
                .collect();
            taken_indices.sort_unstable();

            for node in &ready {
                if done_nodes.contains(node.id.as_str()) {
                    continue;
                }
                if let Some(alloc) = by_node.get(node.id.as_str()) {
                    // Running the current version: nothing to do.
                    if alloc.job_version == job.version {
                        desired.ignore += 1;
                        continue;
                    }
                    let old_group = snapshot
                        .job_version(&job.id, alloc.job_version)
                        .and_then(|j| j.group(&group.name).cloned());
                    let destructive = old_group
                        .map(|old| groups_differ_destructively(&old, group))
                        .unwrap_or(true);
                    if !destructive {
                        desired.in_place_update += 1;
                        let mut updated = Allocation::clone(alloc);
                        updated.job_version = job.version;
                        plan.push_alloc(updated);
                        continue;
                    }
                    desired.destructive_update += 1;
                    plan.push_stop(&node.id, &alloc.id, "alloc replaced by job update");
                    // The replacement reuses the stopped alloc's room.
                    if let Some(used) = ctx.used.get_mut(node.id.as_str()) {
                        used.resources.subtract(&alloc.resources);
                        for port in &alloc.ports {
                            used.ports.remove(&port.port);
                        }
                    }
                }

                metrics.nodes_evaluated += 1;
                match check_node(node, &ctx) {
                    Ok(()) => {}
                    Err(FeasibilityFailure::Constraint(desc)) => {
                        metrics.filtered_by(desc);
                        continue;
                    }
                    Err(FeasibilityFailure::Exhausted(dim)) => {
                        metrics.exhausted(dim);
                        *queued.entry(group.name.clone()).or_insert(0) += 1;
                        continue;
                    }
                }

                let previous = by_node.get(node.id.as_str()).map(|a| (*a).clone());
                // A destructive replacement keeps its predecessor's slot.
                let index = match &previous {
                    Some(prev) => prev.index,
                    None => next_free_index(&mut taken_indices),
                };
                let alloc = build_system_alloc(
                    &job, group, node, index, previous, now, &self.config,
                );
                ctx.charge(
                    &node.id,
                    &alloc.resources,
                    &alloc.ports.iter().map(|p| p.port).collect::<Vec<_>>(),
                );
                desired.place += 1;
                plan.push_alloc(alloc);
            }

            if metrics.coalesced_failures > 0
                || !metrics.constraint_filtered.is_empty()
                || !metrics.dimension_exhausted.is_empty()
            {
                failed.insert(group.name.clone(), metrics);
            }
        }

        let mut updated_eval = eval.clone();
        updated_eval.status = EvalStatus::Complete;
        updated_eval.snapshot_index = Some(snapshot.latest_index());
        updated_eval.failed_tg_allocs = failed;
        updated_eval.queued_allocs = queued;

        let plan = if plan.is_empty() { None } else { Some(plan) };
        Ok(SchedulerOutcome {
            plan,
            updated_eval,
            follow_up_evals: Vec::new(),
            blocked_eval: None,
            desired_updates,
        })
    }
}

fn next_free_index(taken: &mut Vec<u32>) -> u32 {
    let mut next = 0u32;
    while taken.binary_search(&next).is_ok() {
        next += 1;
    }
    taken.insert(taken.binary_search(&next).unwrap_err(), next);
    next
}

fn build_system_alloc(
    job: &Arc<Job>,
    group: &stevedore_state::TaskGroup,
    node: &Arc<Node>,
    index: u32,
    previous: Option<Arc<Allocation>>,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> Allocation {
    // System groups rarely ask for ports; assign statics as requested and
    // dynamics from the low end of the range.
    let mut ports = Vec::new();
    let mut next_dynamic = config.dynamic_port_range.0;
    for request in &group.ports {
        let port = request.static_port.unwrap_or_else(|| {
            let p = next_dynamic;
            next_dynamic += 1;
            p
        });
        ports.push(stevedore_state::AllocatedPort {
            label: request.label.clone(),
            port,
        });
    }

    let id = uuid::Uuid::new_v4().to_string();
    let task_env = build_task_env(job, &group.tasks, &id, node, &ports);

    Allocation {
        id,
        job_id: job.id.clone(),
        job_version: job.version,
        task_group: group.name.clone(),
        name: format!("{}.{}[{index}]", job.id.id, group.name),
        index,
        node_id: node.id.clone(),
        resources: group.resources(),
        ports,
        task_env,
        desired_status: stevedore_state::DesiredStatus::Run,
        desired_description: String::new(),
        client_status: ClientStatus::Pending,
        previous_allocation: previous.as_ref().map(|a| a.id.clone()),
        next_allocation: None,
        deployment_id: None,
        canary: false,
        deployment_status: None,
        follow_up_eval_id: None,
        reschedule_events: Vec::new(),
        created_at: now,
        create_index: 0,
        modify_index: 0,
    }
}
