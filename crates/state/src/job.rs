//! Job submissions: the declarative description of a workload.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Namespace-qualified job identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub namespace: String,
    pub id: String,
}

impl JobId {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    /// Job id in the default namespace.
    pub fn default_ns(id: impl Into<String>) -> Self {
        Self::new("default", id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Which scheduler processes the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Long-running workloads with rolling updates and deployments.
    Service,
    /// Run-to-completion workloads.
    Batch,
    /// One instance per feasible node.
    System,
    /// One run-to-completion instance per feasible node.
    Sysbatch,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Service => "service",
            JobType::Batch => "batch",
            JobType::System => "system",
            JobType::Sysbatch => "sysbatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Dead,
}

/// A versioned, immutable-per-version job descriptor.
///
/// Versioning and index stamping are performed by the state store on
/// registration; submitters leave `version`, `stable` and the index fields
/// at their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Scheduling priority, 0..=100. Higher preempts lower.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Datacenters the job may be placed in. Empty means any.
    #[serde(default)]
    pub datacenters: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub affinities: Vec<Affinity>,
    #[serde(default)]
    pub spreads: Vec<Spread>,
    pub task_groups: Vec<TaskGroup>,
    /// Rolling-update policy inherited by groups that do not override it.
    #[serde(default)]
    pub update: Option<UpdateStrategy>,
    /// Failure rescheduling policy inherited by groups.
    #[serde(default)]
    pub reschedule: Option<ReschedulePolicy>,
    /// Drain migration policy inherited by groups.
    #[serde(default)]
    pub migrate: Option<MigrateStrategy>,
    /// Monotonic version, assigned by the store on each registration.
    #[serde(default)]
    pub version: u64,
    /// Set on deregistration; the scheduler stops all allocations.
    #[serde(default)]
    pub stop: bool,
    /// Marked by the deployment watcher when a version rolls out successfully.
    #[serde(default)]
    pub stable: bool,
    #[serde(default = "default_job_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

fn default_priority() -> u8 {
    50
}

fn default_job_status() -> JobStatus {
    JobStatus::Pending
}

impl Job {
    pub fn group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }

    /// Effective update strategy for a group: group override, else job-level.
    pub fn update_for(&self, group: &str) -> Option<&UpdateStrategy> {
        self.group(group)
            .and_then(|tg| tg.update.as_ref())
            .or(self.update.as_ref())
    }

    pub fn reschedule_for(&self, group: &str) -> Option<&ReschedulePolicy> {
        self.group(group)
            .and_then(|tg| tg.reschedule.as_ref())
            .or(self.reschedule.as_ref())
    }

    pub fn migrate_for(&self, group: &str) -> MigrateStrategy {
        self.group(group)
            .and_then(|tg| tg.migrate.clone())
            .or_else(|| self.migrate.clone())
            .unwrap_or_default()
    }

    /// Whether the job should have no running allocations.
    pub fn stopped(&self) -> bool {
        self.stop || self.status == JobStatus::Dead
    }

    /// Whether this job type is tracked by deployments.
    pub fn supports_deployments(&self) -> bool {
        self.job_type == JobType::Service
    }
}

/// Unit of co-location: a set of tasks scheduled onto one node together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    /// Desired number of instances. Ignored by system/sysbatch jobs.
    #[serde(default = "default_count")]
    pub count: u32,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub affinities: Vec<Affinity>,
    #[serde(default)]
    pub spreads: Vec<Spread>,
    /// Network ports the group needs on its node.
    #[serde(default)]
    pub ports: Vec<PortRequest>,
    /// Host volumes the group mounts.
    #[serde(default)]
    pub volumes: Vec<VolumeRequest>,
    #[serde(default)]
    pub update: Option<UpdateStrategy>,
    #[serde(default)]
    pub reschedule: Option<ReschedulePolicy>,
    #[serde(default)]
    pub migrate: Option<MigrateStrategy>,
    /// Grace period before allocations on a disconnected node are replaced.
    #[serde(default)]
    pub max_client_disconnect: Option<Duration>,
}

fn default_count() -> u32 {
    1
}

impl TaskGroup {
    /// Aggregate resources requested by the group's tasks.
    pub fn resources(&self) -> Resources {
        let mut total = Resources::default();
        for task in &self.tasks {
            total.add(&task.resources);
        }
        total
    }
}

/// A single task within a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    /// Task driver name (exec, docker, ...). Drivers are external; only the
    /// name participates in scheduling.
    pub driver: String,
    /// Hash of the driver configuration. A change is task-destructive.
    #[serde(default)]
    pub config_hash: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub resources: Resources,
}

/// Requested compute resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu_mhz: u64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
}

impl Resources {
    pub fn new(cpu_mhz: u64, memory_mb: u64, disk_mb: u64) -> Self {
        Self {
            cpu_mhz,
            memory_mb,
            disk_mb,
        }
    }

    pub fn add(&mut self, other: &Resources) {
        self.cpu_mhz += other.cpu_mhz;
        self.memory_mb += other.memory_mb;
        self.disk_mb += other.disk_mb;
    }

    pub fn subtract(&mut self, other: &Resources) {
        self.cpu_mhz = self.cpu_mhz.saturating_sub(other.cpu_mhz);
        self.memory_mb = self.memory_mb.saturating_sub(other.memory_mb);
        self.disk_mb = self.disk_mb.saturating_sub(other.disk_mb);
    }

    /// Whether `ask` fits inside `self`; on failure names the first
    /// exhausted dimension.
    pub fn fits(&self, ask: &Resources) -> Result<(), &'static str> {
        if ask.cpu_mhz > self.cpu_mhz {
            return Err("cpu");
        }
        if ask.memory_mb > self.memory_mb {
            return Err("memory");
        }
        if ask.disk_mb > self.disk_mb {
            return Err("disk");
        }
        Ok(())
    }
}

/// A network port the group needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    pub label: String,
    /// Fixed host port; `None` asks for a dynamic port.
    #[serde(default)]
    pub static_port: Option<u16>,
}

/// A host volume the group mounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub name: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Hard placement constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Attribute key, e.g. `node.datacenter`, `node.class`, `kernel.name`.
    pub attribute: String,
    pub operand: ConstraintOperand,
    #[serde(default)]
    pub value: String,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.attribute, self.operand.as_str(), self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOperand {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    /// Value is a regular expression the attribute must match.
    Regexp,
    /// Dotted-numeric version comparison, e.g. `>= 1.4`.
    Version,
    /// No two allocations of the same job on one node.
    DistinctHosts,
    /// At most `value` allocations per distinct value of `attribute`.
    DistinctProperty,
    SetContains,
    IsSet,
    IsNotSet,
}

impl ConstraintOperand {
    pub fn as_str(self) -> &'static str {
        match self {
            ConstraintOperand::Eq => "=",
            ConstraintOperand::Ne => "!=",
            ConstraintOperand::Gt => ">",
            ConstraintOperand::Lt => "<",
            ConstraintOperand::Ge => ">=",
            ConstraintOperand::Le => "<=",
            ConstraintOperand::Regexp => "regexp",
            ConstraintOperand::Version => "version",
            ConstraintOperand::DistinctHosts => "distinct_hosts",
            ConstraintOperand::DistinctProperty => "distinct_property",
            ConstraintOperand::SetContains => "set_contains",
            ConstraintOperand::IsSet => "is_set",
            ConstraintOperand::IsNotSet => "is_not_set",
        }
    }
}

/// Soft placement preference; weight −100..=100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    pub attribute: String,
    pub operand: ConstraintOperand,
    #[serde(default)]
    pub value: String,
    pub weight: i8,
}

/// Even-distribution target over an attribute's values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spread {
    pub attribute: String,
    #[serde(default = "default_spread_weight")]
    pub weight: i8,
    /// Per-value desired percentages. Empty means spread evenly.
    #[serde(default)]
    pub targets: Vec<SpreadTarget>,
}

fn default_spread_weight() -> i8 {
    50
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadTarget {
    pub value: String,
    pub percent: u8,
}

/// Rolling-update policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStrategy {
    /// Maximum destructive updates in flight per group.
    pub max_parallel: u32,
    #[serde(default)]
    pub health_check: HealthCheckMode,
    /// How long a replacement must stay healthy before it counts.
    #[serde(default = "default_min_healthy_time")]
    pub min_healthy_time: Duration,
    /// Deadline for a replacement to become healthy before it is marked
    /// unhealthy.
    #[serde(default = "default_healthy_deadline")]
    pub healthy_deadline: Duration,
    /// Deadline for the group to make forward progress before the
    /// deployment fails.
    #[serde(default = "default_progress_deadline")]
    pub progress_deadline: Duration,
    /// Re-register the prior stable job version if the deployment fails.
    #[serde(default)]
    pub auto_revert: bool,
    /// Promote automatically once all canaries are healthy.
    #[serde(default)]
    pub auto_promote: bool,
    /// Number of canary placements before the rolling phase.
    #[serde(default)]
    pub canary: u32,
}

fn default_min_healthy_time() -> Duration {
    Duration::from_secs(10)
}

fn default_healthy_deadline() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_progress_deadline() -> Duration {
    Duration::from_secs(10 * 60)
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            health_check: HealthCheckMode::default(),
            min_healthy_time: default_min_healthy_time(),
            healthy_deadline: default_healthy_deadline(),
            progress_deadline: default_progress_deadline(),
            auto_revert: false,
            auto_promote: false,
            canary: 0,
        }
    }
}

/// How allocation health is judged during updates and migrations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckMode {
    /// Service checks must pass (task states stand in when no checks exist).
    Checks,
    /// All tasks running.
    #[default]
    TaskStates,
    /// Health is only set through the operator API.
    Manual,
}

/// Failure rescheduling policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReschedulePolicy {
    /// Attempts allowed within `interval`. Ignored when `unlimited`.
    pub attempts: u32,
    pub interval: Duration,
    /// Base delay before a replacement is scheduled.
    pub delay: Duration,
    #[serde(default)]
    pub delay_function: DelayFunction,
    /// Cap applied to the computed delay. Zero means uncapped.
    #[serde(default)]
    pub max_delay: Duration,
    #[serde(default)]
    pub unlimited: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayFunction {
    Constant,
    #[default]
    Exponential,
    Fibonacci,
}

/// Drain migration policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateStrategy {
    pub max_parallel: u32,
    #[serde(default)]
    pub health_check: HealthCheckMode,
    #[serde(default = "default_min_healthy_time")]
    pub min_healthy_time: Duration,
    #[serde(default = "default_healthy_deadline")]
    pub healthy_deadline: Duration,
}

impl Default for MigrateStrategy {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            health_check: HealthCheckMode::default(),
            min_healthy_time: default_min_healthy_time(),
            healthy_deadline: default_healthy_deadline(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_group_override() -> Job {
        Job {
            id: JobId::default_ns("web"),
            job_type: JobType::Service,
            priority: 50,
            datacenters: vec!["dc1".to_string()],
            constraints: Vec::new(),
            affinities: Vec::new(),
            spreads: Vec::new(),
            task_groups: vec![
                TaskGroup {
                    name: "api".to_string(),
                    count: 2,
                    tasks: Vec::new(),
                    constraints: Vec::new(),
                    affinities: Vec::new(),
                    spreads: Vec::new(),
                    ports: Vec::new(),
                    volumes: Vec::new(),
                    update: Some(UpdateStrategy {
                        max_parallel: 4,
                        ..UpdateStrategy::default()
                    }),
                    reschedule: None,
                    migrate: None,
                    max_client_disconnect: None,
                },
                TaskGroup {
                    name: "cache".to_string(),
                    count: 1,
                    tasks: Vec::new(),
                    constraints: Vec::new(),
                    affinities: Vec::new(),
                    spreads: Vec::new(),
                    ports: Vec::new(),
                    volumes: Vec::new(),
                    update: None,
                    reschedule: None,
                    migrate: None,
                    max_client_disconnect: None,
                },
            ],
            update: Some(UpdateStrategy::default()),
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

    #[test]
    fn group_update_overrides_job_update() {
        let job = job_with_group_override();
        assert_eq!(job.update_for("api").unwrap().max_parallel, 4);
        assert_eq!(job.update_for("cache").unwrap().max_parallel, 1);
        assert!(job.update_for("missing").is_some()); // falls back to job-level
    }

    #[test]
    fn resources_fit_names_exhausted_dimension() {
        let free = Resources::new(1000, 512, 0);
        assert_eq!(free.fits(&Resources::new(500, 1024, 0)), Err("memory"));
        assert_eq!(free.fits(&Resources::new(2000, 128, 0)), Err("cpu"));
        assert!(free.fits(&Resources::new(1000, 512, 0)).is_ok());
    }

    #[test]
    fn group_resources_aggregate_tasks() {
        let tg = TaskGroup {
            name: "g".to_string(),
            count: 1,
            tasks: vec![
                Task {
                    name: "a".to_string(),
                    driver: "exec".to_string(),
                    config_hash: 1,
                    env: HashMap::new(),
                    resources: Resources::new(100, 64, 10),
                },
                Task {
                    name: "b".to_string(),
                    driver: "exec".to_string(),
                    config_hash: 2,
                    env: HashMap::new(),
                    resources: Resources::new(200, 64, 0),
                },
            ],
            constraints: Vec::new(),
            affinities: Vec::new(),
            spreads: Vec::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            update: None,
            reschedule: None,
            migrate: None,
            max_client_disconnect: None,
        };
        assert_eq!(tg.resources(), Resources::new(300, 128, 10));
    }
}
