//! Plans: a scheduler's proposed changes, scoped to a snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::alloc::Allocation;
use crate::deploy::Deployment;
use crate::eval::Evaluation;
use crate::job::JobId;

/// A stop (or evict) of one existing allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStop {
    pub alloc_id: String,
    pub description: String,
}

/// A scheduler's proposal. Ephemeral; only the committed effects persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub eval_id: String,
    pub job_id: JobId,
    pub priority: u8,
    /// State index the plan was computed from.
    pub snapshot_index: u64,
    /// Allocations to create or update, keyed by node.
    pub node_allocs: HashMap<String, Vec<Allocation>>,
    /// Allocations to stop, keyed by node.
    pub node_stops: HashMap<String, Vec<PlanStop>>,
    /// Allocation ids to evict for preemption, keyed by node.
    pub node_preemptions: HashMap<String, Vec<String>>,
    /// Deployment created or updated alongside the placements.
    pub deployment: Option<Deployment>,
}

impl Plan {
    pub fn new(eval: &Evaluation, snapshot_index: u64) -> Self {
        Self {
            eval_id: eval.id.clone(),
            job_id: eval.job_id.clone(),
            priority: eval.priority,
            snapshot_index,
            node_allocs: HashMap::new(),
            node_stops: HashMap::new(),
            node_preemptions: HashMap::new(),
            deployment: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node_allocs.is_empty()
            && self.node_stops.is_empty()
            && self.node_preemptions.is_empty()
            && self.deployment.is_none()
    }

    pub fn push_alloc(&mut self, alloc: Allocation) {
        self.node_allocs
            .entry(alloc.node_id.clone())
            .or_default()
            .push(alloc);
    }

    pub fn push_stop(&mut self, node_id: &str, alloc_id: &str, description: &str) {
        self.node_stops
            .entry(node_id.to_string())
            .or_default()
            .push(PlanStop {
                alloc_id: alloc_id.to_string(),
                description: description.to_string(),
            });
    }

    pub fn push_preemption(&mut self, node_id: &str, alloc_id: &str) {
        self.node_preemptions
            .entry(node_id.to_string())
            .or_default()
            .push(alloc_id.to_string());
    }

    /// Nodes the plan touches in any way.
    pub fn touched_nodes(&self) -> impl Iterator<Item = &String> {
        let mut nodes: Vec<&String> = self
            .node_allocs
            .keys()
            .chain(self.node_stops.keys())
            .chain(self.node_preemptions.keys())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes.into_iter()
    }

    /// Total allocations the plan would create or update.
    pub fn alloc_count(&self) -> usize {
        self.node_allocs.values().map(Vec::len).sum()
    }
}

/// The accepted subset of a plan, committed as one log entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanCommit {
    pub allocs: Vec<Allocation>,
    pub stops: Vec<PlanStop>,
    /// Allocation ids transitioned to `Evict`.
    pub preemptions: Vec<PlanStop>,
    pub deployment: Option<Deployment>,
    /// Follow-up evals riding in the same commit (e.g. for preempted jobs).
    pub evals: Vec<Evaluation>,
}

impl PlanCommit {
    pub fn is_empty(&self) -> bool {
        self.allocs.is_empty()
            && self.stops.is_empty()
            && self.preemptions.is_empty()
            && self.deployment.is_none()
            && self.evals.is_empty()
    }
}

/// The applier's verdict on a submitted plan.
#[derive(Debug, Clone)]
pub struct PlanResult {
    /// Allocations committed, with their assigned indices.
    pub accepted_allocs: Vec<Allocation>,
    /// Nodes whose portion of the plan was rejected.
    pub rejected_nodes: Vec<String>,
    /// Commit index of the accepted subset, if anything committed.
    pub index: u64,
    /// Minimum snapshot index the worker should re-plan from after a
    /// rejection.
    pub refresh_index: Option<u64>,
}

impl PlanResult {
    /// Whether every part of the plan was accepted.
    pub fn fully_accepted(&self) -> bool {
        self.rejected_nodes.is_empty()
    }
}
