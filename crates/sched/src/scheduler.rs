//! The scheduler contract and shared configuration.

use std::collections::HashMap;

use thiserror::Error;

use stevedore_state::{Evaluation, JobId, JobType, Plan, StateSnapshot};

use crate::generic::GenericScheduler;
use crate::system::SystemScheduler;

/// Tunables shared by all scheduler variants.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cap on allocations created by one plan; the remainder spills into a
    /// follow-up eval.
    pub max_allocs_per_plan: usize,
    /// Minimum priority gap before preemption is considered.
    pub preemption_priority_delta: u8,
    /// Job types whose allocations may be preempted.
    pub preemptable_types: Vec<JobType>,
    /// Dynamic host port range, inclusive.
    pub dynamic_port_range: (u16, u16),
}

impl SchedulerConfig {
    pub const DEFAULT_MAX_ALLOCS_PER_PLAN: usize = 128;
    pub const DEFAULT_PREEMPTION_PRIORITY_DELTA: u8 = 10;
    pub const DEFAULT_DYNAMIC_PORT_RANGE: (u16, u16) = (20000, 32000);
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_allocs_per_plan: Self::DEFAULT_MAX_ALLOCS_PER_PLAN,
            preemption_priority_delta: Self::DEFAULT_PREEMPTION_PRIORITY_DELTA,
            preemptable_types: vec![JobType::Batch, JobType::Service],
            dynamic_port_range: Self::DEFAULT_DYNAMIC_PORT_RANGE,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job is malformed; the eval fails permanently and is never
    /// retried.
    #[error("invalid job {0}: {1}")]
    InvalidJob(JobId, String),
    /// Something went wrong that a retry against a fresh snapshot may fix;
    /// the worker nacks the eval.
    #[error("scheduling failed: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Fatal errors fail the eval instead of nacking it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SchedulerError::InvalidJob(..))
    }
}

/// What one `process` pass decided.
#[derive(Debug)]
pub struct SchedulerOutcome {
    /// Plan to submit; `None` when the eval required no changes.
    pub plan: Option<Plan>,
    /// The eval, updated to its final state (status, metrics,
    /// snapshot_index).
    pub updated_eval: Evaluation,
    /// Delayed or spilled evals to persist after the plan commits.
    pub follow_up_evals: Vec<Evaluation>,
    /// Blocked eval to park in the broker until the cluster changes.
    pub blocked_eval: Option<Evaluation>,
    /// Per-group intent summary, for logging and annotations.
    pub desired_updates: HashMap<String, crate::reconcile::DesiredUpdates>,
}

/// The capability contract every scheduler variant implements.
pub trait Scheduler: Send {
    /// Compute a plan that moves the cluster toward the job's desired
    /// state, from the given snapshot. `now` is the injected clock reading;
    /// schedulers never consult the wall clock themselves.
    fn process(
        &mut self,
        eval: &Evaluation,
        snapshot: &StateSnapshot,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<SchedulerOutcome, SchedulerError>;
}

/// Reject jobs that cannot be scheduled at all. These fail the eval
/// permanently.
pub(crate) fn validate_job(job: &stevedore_state::Job) -> Result<(), SchedulerError> {
    if job.priority > 100 {
        return Err(SchedulerError::InvalidJob(
            job.id.clone(),
            format!("priority {} exceeds 100", job.priority),
        ));
    }
    if job.task_groups.is_empty() {
        return Err(SchedulerError::InvalidJob(
            job.id.clone(),
            "job has no task groups".to_string(),
        ));
    }
    let mut names: Vec<&str> = job.task_groups.iter().map(|g| g.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    if names.len() != job.task_groups.len() {
        return Err(SchedulerError::InvalidJob(
            job.id.clone(),
            "duplicate task group names".to_string(),
        ));
    }
    for group in &job.task_groups {
        if group.tasks.is_empty() {
            return Err(SchedulerError::InvalidJob(
                job.id.clone(),
                format!("task group {} has no tasks", group.name),
            ));
        }
    }
    Ok(())
}

/// Instantiate the scheduler for a job type.
pub fn scheduler_for(job_type: JobType, config: SchedulerConfig) -> Box<dyn Scheduler> {
    match job_type {
        JobType::Service => Box::new(GenericScheduler::service(config)),
        JobType::Batch => Box::new(GenericScheduler::batch(config)),
        JobType::System => Box::new(SystemScheduler::system(config)),
        JobType::Sysbatch => Box::new(SystemScheduler::sysbatch(config)),
    }
}
