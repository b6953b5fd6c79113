//! Scoring of feasible nodes.
//!
//! The score is a weighted sum of bin-packing fit, spread balance, node
//! affinity, job anti-affinity and a deterministic noise term so that
//! servers processing the same eval id break ties the same way.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use stevedore_state::{Node, Resources};

use crate::feasibility::{PlacementContext, operand_matches};

/// Penalty per live allocation of the same job already on the node.
const JOB_ANTI_AFFINITY_PENALTY: f64 = 0.2;

/// Magnitude of the deterministic tie-break noise.
const NOISE_SCALE: f64 = 1e-3;

/// A feasible node with its composite score.
#[derive(Debug, Clone)]
pub struct RankedNode {
    pub node: Arc<Node>,
    pub score: f64,
}

/// Score and order candidate nodes, best first.
pub fn rank_nodes(
    eval_id: &str,
    candidates: Vec<Arc<Node>>,
    ctx: &PlacementContext<'_>,
) -> Vec<RankedNode> {
    let ask = ctx.group.resources();
    let spread_counts = spread_value_counts(ctx);
    let total_job_allocs: u32 = ctx.job_allocs_by_node.values().sum();

    let mut ranked: Vec<RankedNode> = candidates
        .into_iter()
        .map(|node| {
            let mut score = binpack_score(&node, ctx, &ask);
            score += affinity_score(&node, ctx);
            score += spread_score(&node, ctx, &spread_counts, total_job_allocs);
            let same_job = ctx
                .job_allocs_by_node
                .get(&node.id)
                .copied()
                .unwrap_or(0);
            score -= f64::from(same_job) * JOB_ANTI_AFFINITY_PENALTY;
            score += tie_break_noise(eval_id, &node.id);
            RankedNode { node, score }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
    ranked
}

/// Bin-packing: prefer nodes that end up fuller, normalized to [0, 1].
fn binpack_score(node: &Node, ctx: &PlacementContext<'_>, ask: &Resources) -> f64 {
    let avail = node.available();
    let mut used = ctx
        .used
        .get(&node.id)
        .map(|u| u.resources)
        .unwrap_or_default();
    used.add(ask);

    let dim = |used: u64, total: u64| -> f64 {
        if total == 0 {
            return 0.0;
        }
        (used as f64 / total as f64).min(1.0)
    };
    let mut dims = vec![
        dim(used.cpu_mhz, avail.cpu_mhz),
        dim(used.memory_mb, avail.memory_mb),
    ];
    if ask.disk_mb > 0 {
        dims.push(dim(used.disk_mb, avail.disk_mb));
    }
    dims.iter().sum::<f64>() / dims.len() as f64
}

/// Sum of matching affinity weights, scaled to [-1, 1] per stanza.
fn affinity_score(node: &Node, ctx: &PlacementContext<'_>) -> f64 {
    let mut score = 0.0;
    for affinity in ctx.job.affinities.iter().chain(&ctx.group.affinities) {
        let matched = node
            .attribute(&affinity.attribute)
            .map(|actual| operand_matches(affinity.operand, actual, &affinity.value))
            .unwrap_or(false);
        if matched {
            score += f64::from(affinity.weight) / 100.0;
        }
    }
    score
}

/// Count this job's live allocations per spread-attribute value.
fn spread_value_counts(ctx: &PlacementContext<'_>) -> HashMap<(String, String), u32> {
    let mut counts = HashMap::new();
    for spread in ctx.job.spreads.iter().chain(&ctx.group.spreads) {
        for (node_id, n) in ctx.job_allocs_by_node.iter() {
            let Some(value) = ctx
                .nodes
                .get(node_id)
                .and_then(|node| node.attribute(&spread.attribute))
            else {
                continue;
            };
            *counts
                .entry((spread.attribute.clone(), value.to_string()))
                .or_insert(0) += *n;
        }
    }
    counts
}

/// Positive when the node's spread value is under its target share,
/// negative when over.
fn spread_score(
    node: &Node,
    ctx: &PlacementContext<'_>,
    counts: &HashMap<(String, String), u32>,
    total_job_allocs: u32,
) -> f64 {
    let mut score = 0.0;
    for spread in ctx.job.spreads.iter().chain(&ctx.group.spreads) {
        let Some(value) = node.attribute(&spread.attribute) else {
            continue;
        };
        let desired = if let Some(target) = spread.targets.iter().find(|t| t.value == value) {
            f64::from(target.percent) / 100.0
        } else if !spread.targets.is_empty() {
            // Untargeted values share whatever is left.
            let assigned: u32 = spread.targets.iter().map(|t| u32::from(t.percent)).sum();
            (f64::from(100u32.saturating_sub(assigned)) / 100.0).max(0.0)
        } else {
            let distinct = distinct_attribute_values(ctx, &spread.attribute).max(1);
            1.0 / distinct as f64
        };
        let actual = if total_job_allocs == 0 {
            0.0
        } else {
            let have = counts
                .get(&(spread.attribute.clone(), value.to_string()))
                .copied()
                .unwrap_or(0);
            f64::from(have) / f64::from(total_job_allocs)
        };
        score += (desired - actual) * f64::from(spread.weight) / 100.0;
    }
    score
}

fn distinct_attribute_values(ctx: &PlacementContext<'_>, attribute: &str) -> usize {
    let mut values: Vec<&str> = ctx
        .nodes
        .values()
        .filter_map(|n| n.attribute(attribute))
        .collect();
    values.sort();
    values.dedup();
    values.len()
}

/// Deterministic noise in [0, NOISE_SCALE), stable across servers.
fn tie_break_noise(eval_id: &str, node_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(eval_id.as_bytes());
    hasher.update(node_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let raw = u64::from_be_bytes(bytes);
    (raw as f64 / u64::MAX as f64) * NOISE_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use stevedore_state::{
        Affinity, ConstraintOperand, Job, JobId, JobStatus, JobType, NodeStatus,
        SchedulingEligibility, Spread, Task, TaskGroup,
    };

    fn node(id: &str, cpu: u64, mem: u64, rack: &str) -> Arc<Node> {
        Arc::new(Node {
            id: id.to_string(),
            datacenter: "dc1".to_string(),
            node_class: String::new(),
            attributes: HashMap::from([("rack".to_string(), rack.to_string())]),
            resources: Resources::new(cpu, mem, 100_000),
            reserved: Resources::default(),
            host_volumes: HashMap::new(),
            status: NodeStatus::Ready,
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain: false,
            drain_deadline: None,
            status_updated_at: chrono::Utc::now(),
            create_index: 0,
            modify_index: 0,
        })
    }

    fn job() -> Job {
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
                count: 2,
                tasks: vec![Task {
                    name: "main".to_string(),
                    driver: "exec".to_string(),
                    config_hash: 1,
                    env: HashMap::new(),
                    resources: Resources::new(500, 256, 0),
                }],
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
            status: JobStatus::Pending,
            create_index: 0,
            modify_index: 0,
        }
    }

    #[test]
    fn ranking_is_deterministic_for_same_eval() {
        let j = job();
        let nodes: HashMap<String, Arc<Node>> = [
            node("n1", 4000, 8192, "r1"),
            node("n2", 4000, 8192, "r1"),
            node("n3", 4000, 8192, "r1"),
        ]
        .into_iter()
        .map(|n| (n.id.clone(), n))
        .collect();
        let ctx = PlacementContext::new(&j, &j.task_groups[0], &nodes, &[], &[]);
        let candidates: Vec<Arc<Node>> = nodes.values().cloned().collect();

        let a = rank_nodes("eval-1", candidates.clone(), &ctx);
        let b = rank_nodes("eval-1", candidates.clone(), &ctx);
        let ids = |r: &[RankedNode]| r.iter().map(|n| n.node.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));

        // Identical nodes, different eval: order may differ but the set is
        // complete and the noise never dominates a real score difference.
        let c = rank_nodes("eval-2", candidates, &ctx);
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn binpack_prefers_fuller_node() {
        let j = job();
        let nodes: HashMap<String, Arc<Node>> = [
            node("big", 16_000, 65_536, "r1"),
            node("small", 1000, 512, "r1"),
        ]
        .into_iter()
        .map(|n| (n.id.clone(), n))
        .collect();
        let ctx = PlacementContext::new(&j, &j.task_groups[0], &nodes, &[], &[]);
        let ranked = rank_nodes("e", nodes.values().cloned().collect(), &ctx);
        assert_eq!(ranked[0].node.id, "small");
    }

    #[test]
    fn anti_affinity_pushes_job_off_crowded_node() {
        let j = job();
        let nodes: HashMap<String, Arc<Node>> = [
            node("n1", 4000, 8192, "r1"),
            node("n2", 4000, 8192, "r1"),
        ]
        .into_iter()
        .map(|n| (n.id.clone(), n))
        .collect();
        let mut ctx = PlacementContext::new(&j, &j.task_groups[0], &nodes, &[], &[]);
        ctx.charge("n1", &Resources::new(500, 256, 0), &[]);
        let ranked = rank_nodes("e", nodes.values().cloned().collect(), &ctx);
        assert_eq!(ranked[0].node.id, "n2");
    }

    #[test]
    fn affinity_weight_attracts() {
        let mut j = job();
        j.affinities.push(Affinity {
            attribute: "rack".to_string(),
            operand: ConstraintOperand::Eq,
            value: "r2".to_string(),
            weight: 100,
        });
        let nodes: HashMap<String, Arc<Node>> = [
            node("n1", 4000, 8192, "r1"),
            node("n2", 4000, 8192, "r2"),
        ]
        .into_iter()
        .map(|n| (n.id.clone(), n))
        .collect();
        let ctx = PlacementContext::new(&j, &j.task_groups[0], &nodes, &[], &[]);
        let ranked = rank_nodes("e", nodes.values().cloned().collect(), &ctx);
        assert_eq!(ranked[0].node.id, "n2");
    }

    #[test]
    fn spread_balances_across_attribute() {
        let mut j = job();
        j.spreads.push(Spread {
            attribute: "rack".to_string(),
            weight: 100,
            targets: Vec::new(),
        });
        let nodes: HashMap<String, Arc<Node>> = [
            node("n1", 4000, 8192, "r1"),
            node("n2", 4000, 8192, "r2"),
        ]
        .into_iter()
        .map(|n| (n.id.clone(), n))
        .collect();
        let mut ctx = PlacementContext::new(&j, &j.task_groups[0], &nodes, &[], &[]);
        // One alloc already on rack r1.
        ctx.charge("n1", &Resources::new(500, 256, 0), &[]);
        let ranked = rank_nodes("e", nodes.values().cloned().collect(), &ctx);
        assert_eq!(ranked[0].node.id, "n2");
    }
}
