//! Allocations: the authoritative binding of a task group instance to a node.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, Resources};

/// What the scheduler wants the allocation to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    Run,
    Stop,
    /// Stopped to make room for a higher-priority placement.
    Evict,
}

/// What the node reports the allocation is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
    /// The node is disconnected; last known state was running.
    Unknown,
}

impl ClientStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClientStatus::Complete | ClientStatus::Failed | ClientStatus::Lost
        )
    }
}

/// Health of an allocation within its deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocDeploymentStatus {
    /// `None` until the deployment watcher decides.
    pub healthy: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

/// A past reschedule of this allocation lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleEvent {
    pub time: DateTime<Utc>,
    pub prev_alloc_id: String,
    pub prev_node_id: String,
}

/// One port bound on the allocation's node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedPort {
    pub label: String,
    pub port: u16,
}

/// The placement record. `id`, `job_id`, `job_version`, `task_group`,
/// `node_id` and `create_index` are immutable once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub job_id: JobId,
    pub job_version: u64,
    pub task_group: String,
    /// Human-readable instance name, `job.group[index]`.
    pub name: String,
    /// Instance index within the group, 0..count.
    pub index: u32,
    pub node_id: String,
    /// Aggregate resources committed on the node.
    pub resources: Resources,
    #[serde(default)]
    pub ports: Vec<AllocatedPort>,
    /// Driver contract variables, keyed by task name.
    #[serde(default)]
    pub task_env: HashMap<String, HashMap<String, String>>,
    pub desired_status: DesiredStatus,
    #[serde(default)]
    pub desired_description: String,
    pub client_status: ClientStatus,
    /// Lineage link set on reschedules.
    #[serde(default)]
    pub previous_allocation: Option<String>,
    #[serde(default)]
    pub next_allocation: Option<String>,
    #[serde(default)]
    pub deployment_id: Option<String>,
    /// Whether this placement is a deployment canary.
    #[serde(default)]
    pub canary: bool,
    #[serde(default)]
    pub deployment_status: Option<AllocDeploymentStatus>,
    /// Eval that will retry this allocation after a reschedule delay.
    #[serde(default)]
    pub follow_up_eval_id: Option<String>,
    #[serde(default)]
    pub reschedule_events: Vec<RescheduleEvent>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Allocation {
    /// Terminal from the cluster's perspective: the scheduler has stopped it
    /// or the client has reported a terminal state.
    pub fn terminal(&self) -> bool {
        self.desired_status != DesiredStatus::Run || self.client_status.is_terminal()
    }

    /// Still expected to be running on its node.
    pub fn should_run(&self) -> bool {
        self.desired_status == DesiredStatus::Run && !self.client_status.is_terminal()
    }

    /// Whether the deployment watcher has marked this allocation healthy.
    pub fn deployment_healthy(&self) -> Option<bool> {
        self.deployment_status.as_ref().and_then(|s| s.healthy)
    }

    /// Reschedule attempts recorded within the trailing `interval` before `now`.
    pub fn reschedule_attempts_in(
        &self,
        interval: std::time::Duration,
        now: DateTime<Utc>,
    ) -> u32 {
        let Ok(window) = chrono::Duration::from_std(interval) else {
            return self.reschedule_events.len() as u32;
        };
        let cutoff = now - window;
        self.reschedule_events
            .iter()
            .filter(|ev| ev.time > cutoff)
            .count() as u32
    }
}
