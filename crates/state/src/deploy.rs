//! Deployments: trackers for rolling out one job version.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{Job, JobId, UpdateStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Initializing,
    Running,
    Paused,
    Successful,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Successful | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }
}

/// Rollout state for one task group.
///
/// Invariant: `healthy + unhealthy <= placed <= desired_total + desired_canaries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentGroupState {
    pub desired_total: u32,
    pub desired_canaries: u32,
    /// Allocation ids of placed canaries.
    #[serde(default)]
    pub placed_canaries: Vec<String>,
    pub placed: u32,
    pub healthy: u32,
    pub unhealthy: u32,
    pub promoted: bool,
    pub auto_revert: bool,
    pub auto_promote: bool,
    pub progress_deadline: Duration,
    /// A healthy allocation must appear before this instant or the group
    /// fails.
    #[serde(default)]
    pub require_progress_by: Option<DateTime<Utc>>,
}

impl DeploymentGroupState {
    pub fn from_update(update: &UpdateStrategy, desired_total: u32) -> Self {
        Self {
            desired_total,
            desired_canaries: update.canary,
            placed_canaries: Vec::new(),
            placed: 0,
            healthy: 0,
            unhealthy: 0,
            promoted: update.canary == 0,
            auto_revert: update.auto_revert,
            auto_promote: update.auto_promote,
            progress_deadline: update.progress_deadline,
            require_progress_by: None,
        }
    }

    /// All desired instances placed and healthy.
    pub fn complete(&self) -> bool {
        self.promoted && self.healthy >= self.desired_total
    }
}

/// A rollout of one job version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub job_id: JobId,
    pub job_version: u64,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_description: String,
    pub groups: HashMap<String, DeploymentGroupState>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Deployment {
    /// New running deployment covering the job's groups that carry an
    /// update strategy.
    pub fn new(job: &Job, now: DateTime<Utc>) -> Self {
        let mut groups = HashMap::new();
        for tg in &job.task_groups {
            if let Some(update) = job.update_for(&tg.name) {
                let mut state = DeploymentGroupState::from_update(update, tg.count);
                state.require_progress_by = Some(
                    now + chrono::Duration::from_std(update.progress_deadline)
                        .unwrap_or_else(|_| chrono::Duration::seconds(600)),
                );
                groups.insert(tg.name.clone(), state);
            }
        }
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            job_version: job.version,
            status: DeploymentStatus::Running,
            status_description: "deployment is running".to_string(),
            groups,
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Whether any group still waits on canary promotion.
    pub fn requires_promotion(&self) -> bool {
        self.groups
            .values()
            .any(|g| g.desired_canaries > 0 && !g.promoted)
    }

    /// Whether every group has rolled out completely.
    pub fn complete(&self) -> bool {
        self.groups.values().all(DeploymentGroupState::complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, JobType, TaskGroup};

    fn job_with_update(canary: u32) -> Job {
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
                count: 5,
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
            }],
            update: Some(UpdateStrategy {
                canary,
                ..UpdateStrategy::default()
            }),
            reschedule: None,
            migrate: None,
            version: 2,
            stop: false,
            stable: false,
            status: JobStatus::Running,
            create_index: 0,
            modify_index: 0,
        }
    }

    #[test]
    fn canary_groups_start_unpromoted() {
        let d = Deployment::new(&job_with_update(1), Utc::now());
        assert!(d.requires_promotion());
        assert!(!d.groups["api"].promoted);
        assert_eq!(d.groups["api"].desired_total, 5);
        assert_eq!(d.groups["api"].desired_canaries, 1);
    }

    #[test]
    fn no_canary_groups_start_promoted() {
        let d = Deployment::new(&job_with_update(0), Utc::now());
        assert!(!d.requires_promotion());
        assert!(d.groups["api"].promoted);
    }

    #[test]
    fn complete_requires_all_healthy() {
        let mut d = Deployment::new(&job_with_update(0), Utc::now());
        assert!(!d.complete());
        let g = d.groups.get_mut("api").unwrap();
        g.placed = 5;
        g.healthy = 5;
        assert!(d.complete());
    }
}
