//! Evaluations: the unit of scheduling work.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{Job, JobId, JobType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    Pending,
    /// Parked until the cluster changes; retried on state index advance.
    Blocked,
    Complete,
    Failed,
    Cancelled,
}

impl EvalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Cancelled
        )
    }
}

/// What caused the evaluation to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggeredBy {
    JobRegister,
    JobDeregister,
    PeriodicJob,
    NodeUpdate,
    NodeDrain,
    AllocFailure,
    AllocStop,
    DeploymentWatcher,
    FailedFollowUp,
    MaxPlanAttempts,
    RollingUpdate,
    Preemption,
    Reconnect,
    QueuedAllocs,
}

/// Why placements for one task group could not be made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementMetrics {
    pub nodes_evaluated: u32,
    /// Nodes removed by a hard constraint, keyed by constraint description.
    #[serde(default)]
    pub constraint_filtered: HashMap<String, u32>,
    /// Nodes that ran out of a resource dimension, keyed by dimension.
    #[serde(default)]
    pub dimension_exhausted: HashMap<String, u32>,
    /// Placements still wanted when the metrics were recorded.
    pub coalesced_failures: u32,
}

impl PlacementMetrics {
    pub fn filtered_by(&mut self, constraint: String) {
        *self.constraint_filtered.entry(constraint).or_insert(0) += 1;
    }

    pub fn exhausted(&mut self, dimension: &str) {
        *self
            .dimension_exhausted
            .entry(dimension.to_string())
            .or_insert(0) += 1;
    }
}

/// A unit of scheduling work for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub priority: u8,
    /// Scheduler family that must process this eval.
    pub sched_type: JobType,
    pub triggered_by: TriggeredBy,
    pub job_id: JobId,
    /// Modify index of the job at trigger time; a Complete eval must have
    /// seen a snapshot at least this fresh.
    pub job_modify_index: u64,
    /// Set for node-triggered evals.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub deployment_id: Option<String>,
    pub status: EvalStatus,
    #[serde(default)]
    pub status_description: String,
    /// Earliest dispatch time; held in the broker's delay pool until then.
    #[serde(default)]
    pub wait_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_eval: Option<String>,
    #[serde(default)]
    pub next_eval: Option<String>,
    /// Blocked eval created because this one left placements unfilled.
    #[serde(default)]
    pub blocked_eval: Option<String>,
    /// Per-group failure metrics when placement was not possible.
    #[serde(default)]
    pub failed_tg_allocs: HashMap<String, PlacementMetrics>,
    /// Per-group count of placements that remain wanted.
    #[serde(default)]
    pub queued_allocs: HashMap<String, u32>,
    /// State index the scheduler computed against.
    #[serde(default)]
    pub snapshot_index: Option<u64>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Evaluation {
    /// New pending eval for a job, with a fresh id.
    pub fn new(job: &Job, triggered_by: TriggeredBy) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            priority: job.priority,
            sched_type: job.job_type,
            triggered_by,
            job_id: job.id.clone(),
            job_modify_index: job.modify_index,
            node_id: None,
            deployment_id: None,
            status: EvalStatus::Pending,
            status_description: String::new(),
            wait_until: None,
            previous_eval: None,
            next_eval: None,
            blocked_eval: None,
            failed_tg_allocs: HashMap::new(),
            queued_allocs: HashMap::new(),
            snapshot_index: None,
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Successor created after this eval exhausted its nack budget.
    pub fn failed_follow_up(&self, wait_until: DateTime<Utc>) -> Evaluation {
        Evaluation {
            id: Uuid::new_v4().to_string(),
            triggered_by: TriggeredBy::FailedFollowUp,
            status: EvalStatus::Pending,
            status_description: String::new(),
            wait_until: Some(wait_until),
            previous_eval: Some(self.id.clone()),
            next_eval: None,
            blocked_eval: None,
            failed_tg_allocs: HashMap::new(),
            queued_allocs: HashMap::new(),
            snapshot_index: None,
            create_index: 0,
            modify_index: 0,
            ..self.clone()
        }
    }

    /// Blocked successor retried when the cluster changes past
    /// `snapshot_index`.
    pub fn blocked_successor(&self, snapshot_index: u64) -> Evaluation {
        Evaluation {
            id: Uuid::new_v4().to_string(),
            triggered_by: TriggeredBy::QueuedAllocs,
            status: EvalStatus::Blocked,
            status_description: "created to place remaining allocations".to_string(),
            wait_until: None,
            previous_eval: Some(self.id.clone()),
            next_eval: None,
            blocked_eval: None,
            snapshot_index: Some(snapshot_index),
            create_index: 0,
            modify_index: 0,
            ..self.clone()
        }
    }
}
