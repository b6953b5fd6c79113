//! Hard-constraint filtering of candidate nodes.
//!
//! Feasibility is a short-circuiting conjunction: the first failing
//! predicate rejects the node and names itself, so the evaluation can
//! record per-constraint diagnostics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use stevedore_state::{
    Allocation, Constraint, ConstraintOperand, Job, Node, Resources, TaskGroup,
};

/// Why a node was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeasibilityFailure {
    /// A hard constraint filtered the node; carries the constraint
    /// description for metrics.
    Constraint(String),
    /// A resource dimension was exhausted.
    Exhausted(&'static str),
}

/// Per-node usage the filter charges placements against: already-committed
/// allocations plus placements proposed earlier in the same pass.
#[derive(Debug, Clone, Default)]
pub struct NodeUsed {
    pub resources: Resources,
    pub ports: HashSet<u16>,
}

/// Shared placement state for one scheduling pass over one task group.
pub struct PlacementContext<'a> {
    pub job: &'a Job,
    pub group: &'a TaskGroup,
    pub nodes: &'a HashMap<String, Arc<Node>>,
    /// Live allocation count of this job per node, including proposals.
    pub job_allocs_by_node: HashMap<String, u32>,
    /// Resource and port usage per node, including proposals.
    pub used: HashMap<String, NodeUsed>,
}

impl<'a> PlacementContext<'a> {
    /// Build the context from the job's surviving allocations and the
    /// cluster-wide live usage.
    pub fn new(
        job: &'a Job,
        group: &'a TaskGroup,
        nodes: &'a HashMap<String, Arc<Node>>,
        live_allocs: &[Arc<Allocation>],
        job_live_allocs: &[Arc<Allocation>],
    ) -> Self {
        let mut used: HashMap<String, NodeUsed> = HashMap::new();
        for alloc in live_allocs {
            let entry = used.entry(alloc.node_id.clone()).or_default();
            entry.resources.add(&alloc.resources);
            entry.ports.extend(alloc.ports.iter().map(|p| p.port));
        }
        let mut job_allocs_by_node: HashMap<String, u32> = HashMap::new();
        for alloc in job_live_allocs {
            *job_allocs_by_node.entry(alloc.node_id.clone()).or_insert(0) += 1;
        }
        Self {
            job,
            group,
            nodes,
            job_allocs_by_node,
            used,
        }
    }

    /// Charge a proposed placement so later placements in the same pass
    /// see it.
    pub fn charge(&mut self, node_id: &str, resources: &Resources, ports: &[u16]) {
        let entry = self.used.entry(node_id.to_string()).or_default();
        entry.resources.add(resources);
        entry.ports.extend(ports.iter().copied());
        *self
            .job_allocs_by_node
            .entry(node_id.to_string())
            .or_insert(0) += 1;
    }

    fn used_on(&self, node_id: &str) -> Option<&NodeUsed> {
        self.used.get(node_id)
    }

    /// Count of this job's live allocations on nodes whose `attribute`
    /// equals `value`.
    fn job_allocs_with_property(&self, attribute: &str, value: &str) -> u32 {
        self.job_allocs_by_node
            .iter()
            .filter(|(node_id, _)| {
                self.nodes
                    .get(*node_id)
                    .and_then(|n| n.attribute(attribute))
                    .map(|v| v == value)
                    .unwrap_or(false)
            })
            .map(|(_, count)| *count)
            .sum()
    }
}

/// Check every hard requirement of the group against one node.
pub fn check_node(node: &Node, ctx: &PlacementContext<'_>) -> Result<(), FeasibilityFailure> {
    if !ctx.job.datacenters.is_empty() && !ctx.job.datacenters.contains(&node.datacenter) {
        return Err(FeasibilityFailure::Constraint(format!(
            "missing datacenter {}",
            node.datacenter
        )));
    }

    for constraint in ctx.job.constraints.iter().chain(&ctx.group.constraints) {
        check_constraint(constraint, node, ctx)?;
    }

    for volume in &ctx.group.volumes {
        match node.host_volumes.get(&volume.name) {
            None => {
                return Err(FeasibilityFailure::Constraint(format!(
                    "missing host volume {}",
                    volume.name
                )));
            }
            Some(hv) if hv.read_only && !volume.read_only => {
                return Err(FeasibilityFailure::Constraint(format!(
                    "host volume {} is read-only",
                    volume.name
                )));
            }
            Some(_) => {}
        }
    }

    let used = ctx.used_on(&node.id);

    // Static ports must be free on the node.
    for port in &ctx.group.ports {
        if let Some(static_port) = port.static_port {
            let in_use = used.map(|u| u.ports.contains(&static_port)).unwrap_or(false);
            if in_use {
                return Err(FeasibilityFailure::Exhausted("ports"));
            }
        }
    }

    let mut free = node.available();
    if let Some(used) = used {
        free.subtract(&used.resources);
    }
    free.fits(&ctx.group.resources())
        .map_err(FeasibilityFailure::Exhausted)?;

    Ok(())
}

fn check_constraint(
    constraint: &Constraint,
    node: &Node,
    ctx: &PlacementContext<'_>,
) -> Result<(), FeasibilityFailure> {
    let fail = || FeasibilityFailure::Constraint(constraint.to_string());

    match constraint.operand {
        ConstraintOperand::DistinctHosts => {
            let here = ctx
                .job_allocs_by_node
                .get(&node.id)
                .copied()
                .unwrap_or(0);
            if here > 0 {
                return Err(fail());
            }
        }
        ConstraintOperand::DistinctProperty => {
            let Some(value) = node.attribute(&constraint.attribute) else {
                return Err(fail());
            };
            let limit: u32 = constraint.value.parse().unwrap_or(1);
            if ctx.job_allocs_with_property(&constraint.attribute, value) >= limit {
                return Err(fail());
            }
        }
        ConstraintOperand::IsSet => {
            if node.attribute(&constraint.attribute).is_none() {
                return Err(fail());
            }
        }
        ConstraintOperand::IsNotSet => {
            if node.attribute(&constraint.attribute).is_some() {
                return Err(fail());
            }
        }
        _ => {
            let Some(actual) = node.attribute(&constraint.attribute) else {
                return Err(fail());
            };
            if !operand_matches(constraint.operand, actual, &constraint.value) {
                return Err(fail());
            }
        }
    }
    Ok(())
}

/// Evaluate a value-comparing operand. Also used by affinity scoring.
pub fn operand_matches(operand: ConstraintOperand, actual: &str, expected: &str) -> bool {
    match operand {
        ConstraintOperand::Eq => actual == expected,
        ConstraintOperand::Ne => actual != expected,
        ConstraintOperand::Gt => compare_values(actual, expected) == std::cmp::Ordering::Greater,
        ConstraintOperand::Lt => compare_values(actual, expected) == std::cmp::Ordering::Less,
        ConstraintOperand::Ge => compare_values(actual, expected) != std::cmp::Ordering::Less,
        ConstraintOperand::Le => compare_values(actual, expected) != std::cmp::Ordering::Greater,
        ConstraintOperand::Regexp => regex::Regex::new(expected)
            .map(|re| re.is_match(actual))
            .unwrap_or(false),
        ConstraintOperand::Version => check_version_constraint(actual, expected),
        ConstraintOperand::SetContains => {
            let wanted: Vec<&str> = expected.split(',').map(str::trim).collect();
            let have: HashSet<&str> = actual.split(',').map(str::trim).collect();
            wanted.iter().all(|w| have.contains(w))
        }
        // Presence operands are handled by the caller.
        ConstraintOperand::DistinctHosts
        | ConstraintOperand::DistinctProperty
        | ConstraintOperand::IsSet
        | ConstraintOperand::IsNotSet => false,
    }
}

/// Numeric comparison when both sides parse, lexicographic otherwise.
fn compare_values(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Check a version expression like `>= 1.4` or `>= 1.4, < 2` against a
/// dotted-numeric version.
fn check_version_constraint(actual: &str, expression: &str) -> bool {
    expression.split(',').all(|clause| {
        let clause = clause.trim();
        let (op, wanted) = split_version_clause(clause);
        let ord = compare_versions(actual, wanted);
        match op {
            ">=" => ord != std::cmp::Ordering::Less,
            "<=" => ord != std::cmp::Ordering::Greater,
            ">" => ord == std::cmp::Ordering::Greater,
            "<" => ord == std::cmp::Ordering::Less,
            "!=" => ord != std::cmp::Ordering::Equal,
            _ => ord == std::cmp::Ordering::Equal,
        }
    })
}

fn split_version_clause(clause: &str) -> (&str, &str) {
    for op in [">=", "<=", "!=", ">", "<", "="] {
        if let Some(rest) = clause.strip_prefix(op) {
            return (op, rest.trim());
        }
    }
    ("=", clause)
}

/// Compare dotted-numeric versions segment by segment; missing segments
/// count as zero.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|seg| {
                seg.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (va, vb) = (parse(a), parse(b));
    let len = va.len().max(vb.len());
    for i in 0..len {
        let (x, y) = (
            va.get(i).copied().unwrap_or(0),
            vb.get(i).copied().unwrap_or(0),
        );
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}
