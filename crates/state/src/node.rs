//! Worker node registrations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Initializing,
    Ready,
    Down,
    /// Heartbeats stopped; allocations may still be running.
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingEligibility {
    #[default]
    Eligible,
    Ineligible,
}

/// A host volume offered by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostVolume {
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// A worker registration, keyed by stable `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub datacenter: String,
    #[serde(default)]
    pub node_class: String,
    /// Fingerprinted attributes consulted by constraint predicates.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub resources: Resources,
    /// Resources set aside for the host; never schedulable.
    #[serde(default)]
    pub reserved: Resources,
    #[serde(default)]
    pub host_volumes: HashMap<String, HostVolume>,
    pub status: NodeStatus,
    #[serde(default)]
    pub scheduling_eligibility: SchedulingEligibility,
    #[serde(default)]
    pub drain: bool,
    #[serde(default)]
    pub drain_deadline: Option<DateTime<Utc>>,
    /// Last status transition, used for disconnect grace accounting.
    #[serde(default = "Utc::now")]
    pub status_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Node {
    /// Whether new work may be placed here.
    pub fn ready(&self) -> bool {
        self.status == NodeStatus::Ready
            && self.scheduling_eligibility == SchedulingEligibility::Eligible
            && !self.drain
    }

    /// Resources available to the scheduler: total minus reserved.
    pub fn available(&self) -> Resources {
        let mut avail = self.resources;
        avail.subtract(&self.reserved);
        avail
    }

    /// Resolve an attribute key, including the synthetic `node.*` keys.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match key {
            "node.id" => Some(&self.id),
            "node.datacenter" => Some(&self.datacenter),
            "node.class" => Some(&self.node_class),
            _ => self.attributes.get(key).map(String::as_str),
        }
    }
}
