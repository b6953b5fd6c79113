//! Preemption: evicting lower-priority allocations to make room.

use std::collections::HashMap;
use std::sync::Arc;

use stevedore_state::{Allocation, JobId, JobType, Resources};

use crate::scheduler::SchedulerConfig;

/// Pick allocations on a node whose eviction frees enough resources for
/// `ask`. Only allocations at least `preemption_priority_delta` below the
/// asking priority, belonging to preemptable job types, are candidates.
/// Returns the cheapest sufficient set, preferring fewer and
/// lower-priority victims; `None` when no sufficient set exists.
pub fn find_preemptible(
    ask: &Resources,
    ask_priority: u8,
    node_allocs: &[Arc<Allocation>],
    job_info: &HashMap<JobId, (u8, JobType)>,
    free: &Resources,
    cfg: &SchedulerConfig,
) -> Option<Vec<Arc<Allocation>>> {
    let mut candidates: Vec<(u8, Arc<Allocation>)> = node_allocs
        .iter()
        .filter(|a| a.should_run())
        .filter_map(|a| {
            let (priority, job_type) = job_info.get(&a.job_id)?;
            if !cfg.preemptable_types.contains(job_type) {
                return None;
            }
            if ask_priority < priority.saturating_add(cfg.preemption_priority_delta) {
                return None;
            }
            Some((*priority, a.clone()))
        })
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let fits_after = |evicted: &[&Arc<Allocation>]| -> bool {
        let mut avail = *free;
        for alloc in evicted {
            avail.add(&alloc.resources);
        }
        avail.fits(ask).is_ok()
    };

    // Prefer a single victim: the lowest-priority, smallest sufficient one.
    candidates.sort_by(|a, b| {
        (a.0, a.1.resources.cpu_mhz + a.1.resources.memory_mb, &a.1.id)
            .cmp(&(b.0, b.1.resources.cpu_mhz + b.1.resources.memory_mb, &b.1.id))
    });
    for (_, candidate) in &candidates {
        if fits_after(&[candidate]) {
            return Some(vec![candidate.clone()]);
        }
    }

    // Otherwise accumulate victims lowest-priority first.
    let mut chosen: Vec<Arc<Allocation>> = Vec::new();
    for (_, candidate) in &candidates {
        chosen.push(candidate.clone());
        let refs: Vec<&Arc<Allocation>> = chosen.iter().collect();
        if fits_after(&refs) {
            return Some(chosen);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use stevedore_state::{ClientStatus, DesiredStatus};

    fn alloc(id: &str, job: &str, cpu: u64, mem: u64) -> Arc<Allocation> {
        Arc::new(Allocation {
            id: id.to_string(),
            job_id: JobId::default_ns(job),
            job_version: 0,
            task_group: "g".to_string(),
            name: format!("{job}.g[0]"),
            index: 0,
            node_id: "n1".to_string(),
            resources: Resources::new(cpu, mem, 0),
            ports: Vec::new(),
            task_env: HashMap::new(),
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status: ClientStatus::Running,
            previous_allocation: None,
            next_allocation: None,
            deployment_id: None,
            canary: false,
            deployment_status: None,
            follow_up_eval_id: None,
            reschedule_events: Vec::new(),
            created_at: Utc::now(),
            create_index: 0,
            modify_index: 0,
        })
    }

    fn setup() -> (Vec<Arc<Allocation>>, HashMap<JobId, (u8, JobType)>) {
        let allocs = vec![
            alloc("a1", "j1", 1000, 1024),
            alloc("a2", "j2", 1000, 1024),
            alloc("a3", "j3", 1000, 1024),
        ];
        let jobs = HashMap::from([
            (JobId::default_ns("j1"), (30u8, JobType::Service)),
            (JobId::default_ns("j2"), (30u8, JobType::Service)),
            (JobId::default_ns("j3"), (30u8, JobType::Service)),
        ]);
        (allocs, jobs)
    }

    #[test]
    fn single_lowest_priority_victim_suffices() {
        let (allocs, jobs) = setup();
        let cfg = SchedulerConfig::default();
        let chosen = find_preemptible(
            &Resources::new(1000, 1024, 0),
            80,
            &allocs,
            &jobs,
            &Resources::default(),
            &cfg,
        )
        .expect("preemption should find a victim");
        assert_eq!(chosen.len(), 1);
    }

    #[test]
    fn priority_delta_gates_candidates() {
        let (allocs, jobs) = setup();
        let cfg = SchedulerConfig::default();
        // 35 < 30 + delta(10): nothing is preemptible.
        let chosen = find_preemptible(
            &Resources::new(1000, 1024, 0),
            35,
            &allocs,
            &jobs,
            &Resources::default(),
            &cfg,
        );
        assert!(chosen.is_none());
    }

    #[test]
    fn accumulates_victims_when_one_is_not_enough() {
        let (allocs, jobs) = setup();
        let cfg = SchedulerConfig::default();
        let chosen = find_preemptible(
            &Resources::new(2000, 2048, 0),
            80,
            &allocs,
            &jobs,
            &Resources::default(),
            &cfg,
        )
        .expect("two victims free enough");
        assert_eq!(chosen.len(), 2);
    }

    #[test]
    fn non_preemptable_types_are_skipped() {
        let (allocs, mut jobs) = setup();
        let mut cfg = SchedulerConfig::default();
        cfg.preemptable_types = vec![JobType::Batch];
        jobs.insert(JobId::default_ns("j1"), (30, JobType::Service));
        let chosen = find_preemptible(
            &Resources::new(1000, 1024, 0),
            80,
            &allocs,
            &jobs,
            &Resources::default(),
            &cfg,
        );
        assert!(chosen.is_none());
    }
}
