//! The generic scheduler behind the service and batch variants.
//!
//! One pass: reconcile, then for every placement intent filter and rank
//! nodes, falling back to preemption when nothing fits, and assemble the
//! plan with its follow-up and blocked evals.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use stevedore_state::{
    AllocatedPort, Allocation, ClientStatus, DesiredStatus, EvalStatus, Evaluation, Job, JobId,
    JobType, Node, Plan, PlacementMetrics, RescheduleEvent, StateSnapshot, Task, TaskGroup,
    TriggeredBy,
};

use crate::feasibility::{FeasibilityFailure, PlacementContext, check_node};
use crate::preempt::find_preemptible;
use crate::rank::rank_nodes;
use crate::reconcile::{PlacementRequest, Reconciliation, ReconcileInput, reconcile};
use crate::scheduler::{
    Scheduler, SchedulerConfig, SchedulerError, SchedulerOutcome, validate_job,
};

pub(crate) struct GenericScheduler {
    batch: bool,
    config: SchedulerConfig,
}

impl GenericScheduler {
    pub(crate) fn service(config: SchedulerConfig) -> Self {
        Self {
            batch: false,
            config,
        }
    }

    pub(crate) fn batch(config: SchedulerConfig) -> Self {
        Self {
            batch: true,
            config,
        }
    }
}

impl Scheduler for GenericScheduler {
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
        let mut prior_versions: HashMap<u64, Arc<Job>> = HashMap::new();
        for alloc in &existing {
            if alloc.job_version != job.version
                && !prior_versions.contains_key(&alloc.job_version)
            {
                if let Some(prior) = snapshot.job_version(&job.id, alloc.job_version) {
                    prior_versions.insert(alloc.job_version, prior);
                }
            }
        }
        let deployment = snapshot.latest_deployment_for_job(&eval.job_id);
        let pending_evals: HashSet<String> = snapshot
            .non_terminal_evals()
            .iter()
            .map(|e| e.id.clone())
            .collect();

        let recon = reconcile(&ReconcileInput {
            eval,
            job: &job,
            prior_versions: &prior_versions,
            deployment: deployment.as_deref(),
            existing: &existing,
            nodes: &nodes,
            pending_evals: &pending_evals,
            now,
            batch: self.batch,
        });

        let mut plan = Plan::new(eval, snapshot.latest_index());
        plan.deployment = recon.deployment.clone();
        for stop in &recon.stop {
            plan.push_stop(&stop.alloc.node_id, &stop.alloc.id, &stop.description);
        }
        for updated in &recon.inplace_update {
            plan.push_alloc(updated.clone());
        }

        let placer = Placer::new(
            &self.config,
            &job,
            &nodes,
            snapshot,
            &recon,
            eval,
            now,
        );
        let placed = placer.place_all(&mut plan);

        let mut updated_eval = eval.clone();
        updated_eval.status = EvalStatus::Complete;
        updated_eval.status_description = String::new();
        updated_eval.snapshot_index = Some(snapshot.latest_index());
        updated_eval.failed_tg_allocs = placed.failed;
        updated_eval.queued_allocs = placed.queued.clone();

        let mut follow_up_evals = recon.follow_up_evals.clone();
        if placed.spilled > 0 {
            let mut spill = Evaluation::new(&job, TriggeredBy::QueuedAllocs);
            spill.previous_eval = Some(eval.id.clone());
            debug!(
                eval = %eval.id,
                job = %job.id,
                spilled = placed.spilled,
                "plan reached its allocation cap; spilling remainder"
            );
            follow_up_evals.push(spill);
        }

        // Service jobs park a blocked eval so unplaced work retries when the
        // cluster changes.
        let mut blocked_eval = None;
        let unplaced: u32 = placed.queued.values().sum::<u32>()
            + recon.exhausted.values().sum::<u32>();
        if !self.batch && unplaced > 0 {
            let blocked = eval.blocked_successor(snapshot.latest_index());
            updated_eval.blocked_eval = Some(blocked.id.clone());
            blocked_eval = Some(blocked);
        }

        let plan = if plan.is_empty() { None } else { Some(plan) };
        Ok(SchedulerOutcome {
            plan,
            updated_eval,
            follow_up_evals,
            blocked_eval,
            desired_updates: recon.desired.clone(),
        })
    }
}

pub(crate) fn no_op_outcome(
    eval: &Evaluation,
    snapshot: &StateSnapshot,
    description: &str,
) -> SchedulerOutcome {
    let mut updated_eval = eval.clone();
    updated_eval.status = EvalStatus::Complete;
    updated_eval.status_description = description.to_string();
    updated_eval.snapshot_index = Some(snapshot.latest_index());
    SchedulerOutcome {
        plan: None,
        updated_eval,
        follow_up_evals: Vec::new(),
        blocked_eval: None,
        desired_updates: HashMap::new(),
    }
}

pub(crate) struct Placed {
    pub(crate) failed: HashMap<String, PlacementMetrics>,
    pub(crate) queued: HashMap<String, u32>,
    pub(crate) spilled: u32,
}

/// Carries the mutable placement state for one pass: cluster usage net of
/// this plan's stops, plus everything placed so far.
pub(crate) struct Placer<'a> {
    config: &'a SchedulerConfig,
    job: &'a Arc<Job>,
    nodes: &'a HashMap<String, Arc<Node>>,
    eval: &'a Evaluation,
    now: DateTime<Utc>,
    live_cluster: Vec<Arc<Allocation>>,
    job_live: Vec<Arc<Allocation>>,
    requests: Vec<PlacementRequest>,
    job_info: HashMap<JobId, (u8, JobType)>,
}

impl<'a> Placer<'a> {
    pub(crate) fn new(
        config: &'a SchedulerConfig,
        job: &'a Arc<Job>,
        nodes: &'a HashMap<String, Arc<Node>>,
        snapshot: &StateSnapshot,
        recon: &Reconciliation,
        eval: &'a Evaluation,
        now: DateTime<Utc>,
    ) -> Self {
        let stopped: HashSet<&str> = recon
            .stop
            .iter()
            .map(|s| s.alloc.id.as_str())
            .collect();
        let live_cluster: Vec<Arc<Allocation>> = snapshot
            .allocs()
            .filter(|a| a.should_run() && !stopped.contains(a.id.as_str()))
            .cloned()
            .collect();
        let job_live: Vec<Arc<Allocation>> = live_cluster
            .iter()
            .filter(|a| a.job_id == job.id)
            .cloned()
            .collect();
        let job_info: HashMap<JobId, (u8, JobType)> = snapshot
            .jobs()
            .map(|j| (j.id.clone(), (j.priority, j.job_type)))
            .collect();
        Self {
            config,
            job,
            nodes,
            eval,
            now,
            live_cluster,
            job_live,
            requests: recon.place.clone(),
            job_info,
        }
    }

    pub(crate) fn place_all(mut self, plan: &mut Plan) -> Placed {
        let mut failed: HashMap<String, PlacementMetrics> = HashMap::new();
        let mut queued: HashMap<String, u32> = HashMap::new();
        let mut spilled = 0u32;

        let requests = std::mem::take(&mut self.requests);
        let job = self.job;
        for group in &job.task_groups {
            let group_requests: Vec<&PlacementRequest> =
                requests.iter().filter(|r| r.group == group.name).collect();
            if group_requests.is_empty() {
                continue;
            }
            let mut ctx = PlacementContext::new(
                self.job,
                group,
                self.nodes,
                &self.live_cluster,
                &self.job_live,
            );

            for request in group_requests {
                if plan.alloc_count() >= self.config.max_allocs_per_plan {
                    spilled += 1;
                    *queued.entry(group.name.clone()).or_insert(0) += 1;
                    continue;
                }
                match self.place_one(plan, group, request, &mut ctx) {
                    Ok(()) => {}
                    Err(metrics) => {
                        *queued.entry(group.name.clone()).or_insert(0) += 1;
                        let entry = failed.entry(group.name.clone()).or_default();
                        merge_metrics(entry, metrics);
                        entry.coalesced_failures += 1;
                    }
                }
            }
        }

        Placed {
            failed,
            queued,
            spilled,
        }
    }

    fn place_one(
        &mut self,
        plan: &mut Plan,
        group: &TaskGroup,
        request: &PlacementRequest,
        ctx: &mut PlacementContext<'_>,
    ) -> Result<(), PlacementMetrics> {
        let mut metrics = PlacementMetrics::default();
        let mut feasible: Vec<Arc<Node>> = Vec::new();
        let mut resource_blocked: Vec<Arc<Node>> = Vec::new();

        let mut ready: Vec<Arc<Node>> = self
            .nodes
            .values()
            .filter(|n| n.ready())
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));

        for node in ready {
            metrics.nodes_evaluated += 1;
            match check_node(&node, ctx) {
                Ok(()) => feasible.push(node),
                Err(FeasibilityFailure::Constraint(desc)) => metrics.filtered_by(desc),
                Err(FeasibilityFailure::Exhausted(dim)) => {
                    metrics.exhausted(dim);
                    resource_blocked.push(node);
                }
            }
        }

        let ranked = rank_nodes(&self.eval.id, feasible, ctx);
        for candidate in &ranked {
            if let Some(ports) = self.assign_ports(group, &candidate.node, ctx) {
                let alloc = self.build_alloc(group, request, &candidate.node, ports);
                ctx.charge(
                    &candidate.node.id,
                    &alloc.resources,
                    &alloc.ports.iter().map(|p| p.port).collect::<Vec<_>>(),
                );
                self.live_cluster.push(Arc::new(alloc.clone()));
                self.job_live.push(Arc::new(alloc.clone()));
                plan.push_alloc(alloc);
                return Ok(());
            }
            metrics.exhausted("ports");
        }

        // Nothing feasible: try to make room by evicting lower-priority work.
        if let Some((node, victims)) = self.try_preempt(group, &resource_blocked, ctx) {
            for victim in &victims {
                plan.push_preemption(&node.id, &victim.id);
                self.live_cluster.retain(|a| a.id != victim.id);
            }
            // Free the victims' resources in the shared context.
            if let Some(used) = ctx.used.get_mut(&node.id) {
                for victim in &victims {
                    used.resources.subtract(&victim.resources);
                    for port in &victim.ports {
                        used.ports.remove(&port.port);
                    }
                }
            }
            if let Some(ports) = self.assign_ports(group, &node, ctx) {
                let alloc = self.build_alloc(group, request, &node, ports);
                ctx.charge(
                    &node.id,
                    &alloc.resources,
                    &alloc.ports.iter().map(|p| p.port).collect::<Vec<_>>(),
                );
                self.live_cluster.push(Arc::new(alloc.clone()));
                self.job_live.push(Arc::new(alloc.clone()));
                plan.push_alloc(alloc);
                return Ok(());
            }
        }

        Err(metrics)
    }

    /// Find a resource-blocked node whose lower-priority allocations can be
    /// evicted to fit the group.
    fn try_preempt(
        &self,
        group: &TaskGroup,
        resource_blocked: &[Arc<Node>],
        ctx: &PlacementContext<'_>,
    ) -> Option<(Arc<Node>, Vec<Arc<Allocation>>)> {
        let ask = group.resources();
        for node in resource_blocked {
            let node_allocs: Vec<Arc<Allocation>> = self
                .live_cluster
                .iter()
                .filter(|a| a.node_id == node.id)
                .cloned()
                .collect();
            let mut free = node.available();
            if let Some(used) = ctx.used.get(&node.id) {
                free.subtract(&used.resources);
            }
            if let Some(victims) = find_preemptible(
                &ask,
                self.job.priority,
                &node_allocs,
                &self.job_info,
                &free,
                self.config,
            ) {
                return Some((node.clone(), victims));
            }
        }
        None
    }

    /// Bind the group's requested ports on the node; `None` when a dynamic
    /// port cannot be found.
    fn assign_ports(
        &self,
        group: &TaskGroup,
        node: &Node,
        ctx: &PlacementContext<'_>,
    ) -> Option<Vec<AllocatedPort>> {
        let mut assigned: Vec<AllocatedPort> = Vec::new();
        let in_use: HashSet<u16> = ctx
            .used
            .get(&node.id)
            .map(|u| u.ports.clone())
            .unwrap_or_default();
        let mut taken = in_use;
        for request in &group.ports {
            let port = match request.static_port {
                Some(port) => {
                    if taken.contains(&port) {
                        return None;
                    }
                    port
                }
                None => {
                    let (lo, hi) = self.config.dynamic_port_range;
                    (lo..=hi).find(|p| !taken.contains(p))?
                }
            };
            taken.insert(port);
            assigned.push(AllocatedPort {
                label: request.label.clone(),
                port,
            });
        }
        Some(assigned)
    }

    fn build_alloc(
        &self,
        group: &TaskGroup,
        request: &PlacementRequest,
        node: &Node,
        ports: Vec<AllocatedPort>,
    ) -> Allocation {
        let id = Uuid::new_v4().to_string();
        let mut reschedule_events = Vec::new();
        if let Some(previous) = &request.previous {
            reschedule_events = previous.reschedule_events.clone();
            if request.reschedule {
                reschedule_events.push(RescheduleEvent {
                    time: self.now,
                    prev_alloc_id: previous.id.clone(),
                    prev_node_id: previous.node_id.clone(),
                });
            }
        }
        let task_env = build_task_env(self.job, &group.tasks, &id, node, &ports);
        Allocation {
            id,
            job_id: self.job.id.clone(),
            job_version: self.job.version,
            task_group: group.name.clone(),
            name: request.name.clone(),
            index: request.index,
            node_id: node.id.clone(),
            resources: group.resources(),
            ports,
            task_env,
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status: ClientStatus::Pending,
            previous_allocation: request.previous.as_ref().map(|a| a.id.clone()),
            next_allocation: None,
            deployment_id: request.deployment_id.clone(),
            canary: request.canary,
            deployment_status: None,
            follow_up_eval_id: None,
            reschedule_events,
            created_at: self.now,
            create_index: 0,
            modify_index: 0,
        }
    }
}

fn merge_metrics(into: &mut PlacementMetrics, from: PlacementMetrics) {
    into.nodes_evaluated += from.nodes_evaluated;
    for (constraint, count) in from.constraint_filtered {
        *into.constraint_filtered.entry(constraint).or_insert(0) += count;
    }
    for (dimension, count) in from.dimension_exhausted {
        *into.dimension_exhausted.entry(dimension).or_insert(0) += count;
    }
}

/// The driver contract: every task sees its identity, limits and bound
/// ports in its environment. Every scheduler family builds its allocation
/// env through here.
pub(crate) fn build_task_env(
    job: &Job,
    tasks: &[Task],
    alloc_id: &str,
    node: &Node,
    ports: &[AllocatedPort],
) -> HashMap<String, HashMap<String, String>> {
    let address = node
        .attribute("network.ip-address")
        .unwrap_or("127.0.0.1")
        .to_string();
    let mut all = HashMap::new();
    for task in tasks {
        let mut env = task.env.clone();
        env.insert("STEVEDORE_ALLOC_ID".to_string(), alloc_id.to_string());
        env.insert("STEVEDORE_JOB_NAME".to_string(), job.id.id.clone());
        env.insert("STEVEDORE_TASK_NAME".to_string(), task.name.clone());
        env.insert(
            "STEVEDORE_CPU_LIMIT".to_string(),
            task.resources.cpu_mhz.to_string(),
        );
        env.insert(
            "STEVEDORE_MEMORY_LIMIT".to_string(),
            task.resources.memory_mb.to_string(),
        );
        for port in ports {
            let label = port.label.to_uppercase();
            env.insert(
                format!("STEVEDORE_PORT_{label}"),
                port.port.to_string(),
            );
            env.insert(
                format!("STEVEDORE_ADDR_{label}"),
                format!("{address}:{}", port.port),
            );
        }
        all.insert(task.name.clone(), env);
    }
    all
}
