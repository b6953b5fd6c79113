//! The evaluation broker: an ordered, deduplicated, leased work queue.
//!
//! At most one evaluation per job is ever outstanding. A second eval for
//! the same job coalesces into a single pending successor (newest wins)
//! that dispatches once the current one is acked. Leases expire into
//! implicit nacks; too many nacks fail the eval and spawn a delayed
//! follow-up. All queues live in memory on the leader only and are rebuilt
//! from the state store on leadership gain.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use stevedore_state::{EvalStatus, Evaluation, JobId, JobType, SharedClock, StateSnapshot};

/// Broker tunables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Lease duration before an unacked eval is implicitly nacked.
    pub nack_timeout: Duration,
    /// Nacks (explicit or implicit) before the eval fails permanently.
    pub max_nacks: u32,
    /// First requeue delay after a nack; doubles per subsequent nack.
    pub initial_nack_delay: Duration,
    /// Cap on the nack requeue delay.
    pub max_nack_delay: Duration,
    /// Delay before a failed eval's follow-up becomes dispatchable.
    pub failed_follow_up_delay: Duration,
    /// Cap on evals held by the broker; enqueue beyond it fails upstream.
    pub pending_cap: usize,
}

impl BrokerConfig {
    /// Default lease duration.
    pub const DEFAULT_NACK_TIMEOUT: Duration = Duration::from_secs(60);
    /// Default nack budget.
    pub const DEFAULT_MAX_NACKS: u32 = 3;
    /// Default first requeue delay.
    pub const DEFAULT_INITIAL_NACK_DELAY: Duration = Duration::from_secs(1);
    /// Default requeue delay cap.
    pub const DEFAULT_MAX_NACK_DELAY: Duration = Duration::from_secs(60);
    /// Default failed follow-up delay.
    pub const DEFAULT_FAILED_FOLLOW_UP_DELAY: Duration = Duration::from_secs(60);
    /// Default pending cap.
    pub const DEFAULT_PENDING_CAP: usize = 8192;
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            nack_timeout: Self::DEFAULT_NACK_TIMEOUT,
            max_nacks: Self::DEFAULT_MAX_NACKS,
            initial_nack_delay: Self::DEFAULT_INITIAL_NACK_DELAY,
            max_nack_delay: Self::DEFAULT_MAX_NACK_DELAY,
            failed_follow_up_delay: Self::DEFAULT_FAILED_FOLLOW_UP_DELAY,
            pending_cap: Self::DEFAULT_PENDING_CAP,
        }
    }
}

/// Broker failures surfaced to callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker is disabled; only the leader runs an enabled broker.
    #[error("broker is disabled (not the leader)")]
    NotLeader,
    /// The pending cap was reached; the upstream operation fails rather
    /// than dropping work.
    #[error("pending evaluation limit reached")]
    CapacityExceeded,
    /// No outstanding lease for that eval.
    #[error("no lease for evaluation {0}")]
    UnknownLease(String),
    /// The lease is held under a different token.
    #[error("lease token mismatch for evaluation {0}")]
    TokenMismatch(String),
}

/// Opaque lease token bound to one dequeued eval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

/// What an ack released.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Coalesced successor now dispatched for the same job.
    pub successor: Option<Evaluation>,
}

/// What a nack decided. Returned evals must be persisted by the caller;
/// queueing is already handled.
#[derive(Debug)]
pub enum NackOutcome {
    /// Requeued with a backoff delay.
    Requeued {
        /// Delay before the eval becomes dispatchable again.
        delay: Duration,
    },
    /// A newer coalesced eval supersedes the nacked one, which is dropped.
    Superseded {
        /// The nacked eval, now in cancelled status.
        cancelled: Evaluation,
    },
    /// Nack budget exhausted: the eval fails; a delayed follow-up with a
    /// fresh id takes its place unless a newer eval already superseded it.
    Failed {
        /// The eval, now in failed status.
        failed: Evaluation,
        /// Replacement eval gated on `wait_until`.
        follow_up: Option<Evaluation>,
    },
}

/// Queue depths for the status surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Evals ready for dispatch.
    pub ready: usize,
    /// Evals waiting on `wait_until` or a nack delay.
    pub delayed: usize,
    /// Evals parked until the cluster changes.
    pub blocked: usize,
    /// Evals currently leased to workers.
    pub leased: usize,
}

#[derive(Debug)]
enum JobSlot {
    /// Dispatchable; a matching entry sits in the ready heap.
    Ready { eval: Evaluation, seq: u64 },
    /// Held back until `ready_at`.
    Waiting {
        eval: Evaluation,
        ready_at: DateTime<Utc>,
    },
    /// Leased to a worker.
    Leased {
        eval: Evaluation,
        token: String,
        expires_at: DateTime<Utc>,
        successor: Option<Evaluation>,
    },
}

#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: u8,
    create_index: u64,
    seq: u64,
    job: JobId,
}

impl ReadyEntry {
    fn order_key(&self) -> (u8, Reverse<u64>, Reverse<u64>) {
        (self.priority, Reverse(self.create_index), Reverse(self.seq))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then FIFO by create index and
        // enqueue sequence.
        self.order_key().cmp(&other.order_key())
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn cancel(mut eval: Evaluation) -> Evaluation {
    eval.status = EvalStatus::Cancelled;
    eval.status_description = "superseded by a newer evaluation for the job".to_string();
    eval
}

#[derive(Default)]
struct BrokerInner {
    enabled: bool,
    seq: u64,
    ready: HashMap<JobType, BinaryHeap<ReadyEntry>>,
    slots: HashMap<JobId, JobSlot>,
    blocked: HashMap<JobId, Evaluation>,
    nack_counts: HashMap<String, u32>,
}

impl BrokerInner {
    fn held_count(&self) -> usize {
        self.slots.len() + self.blocked.len()
    }

    fn push_ready(&mut self, eval: Evaluation) {
        self.seq += 1;
        let seq = self.seq;
        let entry = ReadyEntry {
            priority: eval.priority,
            create_index: eval.create_index,
            seq,
            job: eval.job_id.clone(),
        };
        self.ready.entry(eval.sched_type).or_default().push(entry);
        self.slots
            .insert(eval.job_id.clone(), JobSlot::Ready { eval, seq });
    }

    /// Queue a pending eval, honoring its `wait_until`.
    fn insert_pending(&mut self, eval: Evaluation, now: DateTime<Utc>) {
        match eval.wait_until {
            Some(at) if at > now => {
                self.slots
                    .insert(eval.job_id.clone(), JobSlot::Waiting { eval, ready_at: at });
            }
            _ => self.push_ready(eval),
        }
    }

    /// Move waiting slots whose time has come into the ready heap.
    fn promote_waiting(&mut self, now: DateTime<Utc>) {
        let due: Vec<JobId> = self
            .slots
            .iter()
            .filter_map(|(job, slot)| match slot {
                JobSlot::Waiting { ready_at, .. } if *ready_at <= now => Some(job.clone()),
                _ => None,
            })
            .collect();
        for job in due {
            if let Some(JobSlot::Waiting { eval, .. }) = self.slots.remove(&job) {
                self.push_ready(eval);
            }
        }
    }

    /// Pop the best valid entry across the requested scheduler types.
    fn pop_ready(&mut self, schedulers: &[JobType]) -> Option<Evaluation> {
        // Drop heap entries whose slot moved on (lazy deletion).
        for sched in schedulers {
            loop {
                let stale = match self.ready.get(sched).and_then(|h| h.peek()) {
                    None => break,
                    Some(top) => !matches!(
                        self.slots.get(&top.job),
                        Some(JobSlot::Ready { seq, .. }) if *seq == top.seq
                    ),
                };
                if !stale {
                    break;
                }
                if let Some(heap) = self.ready.get_mut(sched) {
                    heap.pop();
                }
            }
        }

        let mut best: Option<(JobType, (u8, Reverse<u64>, Reverse<u64>))> = None;
        for sched in schedulers {
            if let Some(top) = self.ready.get(sched).and_then(|h| h.peek()) {
                let key = top.order_key();
                let better = match &best {
                    None => true,
                    Some((_, current)) => key > *current,
                };
                if better {
                    best = Some((*sched, key));
                }
            }
        }
        let (sched, _) = best?;
        let entry = self.ready.get_mut(&sched)?.pop()?;
        match self.slots.remove(&entry.job) {
            Some(JobSlot::Ready { eval, seq }) if seq == entry.seq => Some(eval),
            Some(other) => {
                self.slots.insert(entry.job, other);
                None
            }
            None => None,
        }
    }
}

/// The leader-side evaluation queue. Cheap to share behind an `Arc`.
pub struct EvalBroker {
    inner: Mutex<BrokerInner>,
    notify: Notify,
    config: BrokerConfig,
    clock: SharedClock,
}

impl EvalBroker {
    /// New broker, initially disabled.
    pub fn new(config: BrokerConfig, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(BrokerInner::default()),
            notify: Notify::new(),
            config,
            clock,
        }
    }

    /// Enable on leadership gain; disabling flushes every queue.
    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        inner.enabled = enabled;
        if !enabled {
            *inner = BrokerInner::default();
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Whether the broker currently accepts work.
    pub fn enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Rebuild queues from non-terminal evals in the store, on leadership
    /// gain.
    pub fn restore(&self, snapshot: &StateSnapshot) -> usize {
        let mut restored = 0;
        for eval in snapshot.non_terminal_evals() {
            let eval = Evaluation::clone(&eval);
            let ok = match eval.status {
                EvalStatus::Pending => self.enqueue(eval).is_ok(),
                EvalStatus::Blocked => {
                    self.block(eval);
                    true
                }
                _ => false,
            };
            if ok {
                restored += 1;
            }
        }
        restored
    }

    /// Add a pending eval. Idempotent on eval id; a second eval for a job
    /// with one outstanding coalesces into the newest-wins successor.
    /// Returns evals superseded by coalescing, to be persisted as
    /// cancelled.
    pub fn enqueue(&self, eval: Evaluation) -> Result<Vec<Evaluation>, BrokerError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return Err(BrokerError::NotLeader);
        }

        let job_key = eval.job_id.clone();
        let mut cancelled = Vec::new();

        if let Some(slot) = inner.slots.remove(&job_key) {
            match slot {
                JobSlot::Ready { eval: existing, seq } => {
                    if existing.id == eval.id {
                        inner
                            .slots
                            .insert(job_key, JobSlot::Ready { eval: existing, seq });
                        return Ok(cancelled);
                    }
                    if eval.job_modify_index >= existing.job_modify_index {
                        cancelled.push(cancel(existing));
                        inner.insert_pending(eval, now);
                    } else {
                        inner
                            .slots
                            .insert(job_key, JobSlot::Ready { eval: existing, seq });
                    }
                }
                JobSlot::Waiting {
                    eval: existing,
                    ready_at,
                } => {
                    if existing.id == eval.id {
                        inner.slots.insert(
                            job_key,
                            JobSlot::Waiting {
                                eval: existing,
                                ready_at,
                            },
                        );
                        return Ok(cancelled);
                    }
                    if eval.job_modify_index >= existing.job_modify_index {
                        cancelled.push(cancel(existing));
                        inner.insert_pending(eval, now);
                    } else {
                        inner.slots.insert(
                            job_key,
                            JobSlot::Waiting {
                                eval: existing,
                                ready_at,
                            },
                        );
                    }
                }
                JobSlot::Leased {
                    eval: leased,
                    token,
                    expires_at,
                    mut successor,
                } => {
                    if leased.id != eval.id {
                        successor = match successor.take() {
                            Some(existing) if existing.id == eval.id => Some(existing),
                            Some(existing) => {
                                if eval.job_modify_index >= existing.job_modify_index {
                                    cancelled.push(cancel(existing));
                                    Some(eval)
                                } else {
                                    Some(existing)
                                }
                            }
                            None => Some(eval),
                        };
                    }
                    inner.slots.insert(
                        job_key,
                        JobSlot::Leased {
                            eval: leased,
                            token,
                            expires_at,
                            successor,
                        },
                    );
                    return Ok(cancelled);
                }
            }
            drop(inner);
            self.notify.notify_waiters();
            return Ok(cancelled);
        }

        if inner.held_count() >= self.config.pending_cap {
            return Err(BrokerError::CapacityExceeded);
        }
        inner.insert_pending(eval, now);
        drop(inner);
        self.notify.notify_waiters();
        Ok(cancelled)
    }

    /// Block until an eval for one of `schedulers` is available or
    /// `timeout` elapses. The returned lease token must accompany the
    /// matching ack or nack.
    pub async fn dequeue(
        &self,
        schedulers: &[JobType],
        timeout: Duration,
    ) -> Option<(Evaluation, LeaseToken)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(leased) = self.try_dequeue(schedulers) {
                return Some(leased);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    fn try_dequeue(&self, schedulers: &[JobType]) -> Option<(Evaluation, LeaseToken)> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return None;
        }
        inner.promote_waiting(now);
        let eval = inner.pop_ready(schedulers)?;
        let token = Uuid::new_v4().to_string();
        let expires_at = now
            + chrono::Duration::from_std(self.config.nack_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        inner.slots.insert(
            eval.job_id.clone(),
            JobSlot::Leased {
                eval: eval.clone(),
                token: token.clone(),
                expires_at,
                successor: None,
            },
        );
        Some((eval, LeaseToken(token)))
    }

    /// Release a lease after successful processing. Dispatches the
    /// coalesced successor, if any.
    pub fn ack(&self, eval_id: &str, token: &LeaseToken) -> Result<AckOutcome, BrokerError> {
        let mut inner = self.inner.lock();
        let job = Self::leased_job(&inner, eval_id, token)?;
        let Some(JobSlot::Leased { successor, .. }) = inner.slots.remove(&job) else {
            return Err(BrokerError::UnknownLease(eval_id.to_string()));
        };
        inner.nack_counts.remove(eval_id);
        let mut outcome = AckOutcome::default();
        if let Some(successor) = successor {
            outcome.successor = Some(successor.clone());
            inner.push_ready(successor);
            drop(inner);
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    /// Release a lease after a failure. The eval requeues with backoff
    /// until the nack budget runs out, then fails with a follow-up.
    pub fn nack(&self, eval_id: &str, token: &LeaseToken) -> Result<NackOutcome, BrokerError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let job = Self::leased_job(&inner, eval_id, token)?;
        let outcome = Self::nack_locked(&self.config, &mut inner, &job, now);
        drop(inner);
        self.notify.notify_waiters();
        outcome
    }

    /// Extend a lease while the worker makes slow forward progress.
    pub fn pause_nack_timeout(
        &self,
        eval_id: &str,
        token: &LeaseToken,
    ) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let job = Self::leased_job(&inner, eval_id, token)?;
        if let Some(JobSlot::Leased { expires_at, .. }) = inner.slots.get_mut(&job) {
            *expires_at = now
                + chrono::Duration::from_std(self.config.nack_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
        }
        Ok(())
    }

    /// Park an eval until the state index passes its snapshot index.
    pub fn block(&self, mut eval: Evaluation) {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return;
        }
        eval.status = EvalStatus::Blocked;
        inner.blocked.insert(eval.job_id.clone(), eval);
    }

    /// Re-examine blocked evals now that the state index reached `index`.
    /// Unblocked evals are returned (now pending) and re-enqueued.
    pub fn unblock(&self, index: u64) -> Vec<Evaluation> {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return Vec::new();
        }
        let due: Vec<JobId> = inner
            .blocked
            .iter()
            .filter(|(_, eval)| eval.snapshot_index.is_none_or(|si| index > si))
            .map(|(job, _)| job.clone())
            .collect();
        let mut released = Vec::new();
        for job in due {
            if inner.slots.contains_key(&job) {
                // An eval for the job is already outstanding; leave the
                // blocked one parked.
                continue;
            }
            if let Some(mut eval) = inner.blocked.remove(&job) {
                eval.status = EvalStatus::Pending;
                released.push(eval.clone());
                inner.push_ready(eval);
            }
        }
        if !released.is_empty() {
            drop(inner);
            self.notify.notify_waiters();
        }
        released
    }

    /// Expire leases past their deadline (implicit nack) and promote due
    /// waiting evals. Returns outcomes whose evals the caller must persist.
    pub fn tick(&self) -> Vec<NackOutcome> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return Vec::new();
        }
        inner.promote_waiting(now);
        let expired: Vec<JobId> = inner
            .slots
            .iter()
            .filter_map(|(job, slot)| match slot {
                JobSlot::Leased { expires_at, .. } if *expires_at <= now => Some(job.clone()),
                _ => None,
            })
            .collect();
        let mut outcomes = Vec::new();
        for job in expired {
            if let Ok(outcome) = Self::nack_locked(&self.config, &mut inner, &job, now) {
                outcomes.push(outcome);
            }
        }
        drop(inner);
        if !outcomes.is_empty() {
            self.notify.notify_waiters();
        }
        outcomes
    }

    /// Queue depths.
    pub fn stats(&self) -> BrokerStats {
        let inner = self.inner.lock();
        let mut stats = BrokerStats {
            blocked: inner.blocked.len(),
            ..BrokerStats::default()
        };
        for slot in inner.slots.values() {
            match slot {
                JobSlot::Ready { .. } => stats.ready += 1,
                JobSlot::Waiting { .. } => stats.delayed += 1,
                JobSlot::Leased { .. } => stats.leased += 1,
            }
        }
        stats
    }

    fn leased_job(
        inner: &BrokerInner,
        eval_id: &str,
        token: &LeaseToken,
    ) -> Result<JobId, BrokerError> {
        for (job, slot) in inner.slots.iter() {
            if let JobSlot::Leased {
                eval, token: held, ..
            } = slot
            {
                if eval.id == eval_id {
                    if held != &token.0 {
                        return Err(BrokerError::TokenMismatch(eval_id.to_string()));
                    }
                    return Ok(job.clone());
                }
            }
        }
        Err(BrokerError::UnknownLease(eval_id.to_string()))
    }

    fn nack_locked(
        config: &BrokerConfig,
        inner: &mut BrokerInner,
        job: &JobId,
        now: DateTime<Utc>,
    ) -> Result<NackOutcome, BrokerError> {
        let Some(JobSlot::Leased {
            eval, successor, ..
        }) = inner.slots.remove(job)
        else {
            return Err(BrokerError::UnknownLease(format!("{job}")));
        };

        let nacks = {
            let count = inner.nack_counts.entry(eval.id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if nacks >= config.max_nacks {
            inner.nack_counts.remove(&eval.id);
            let mut failed = eval.clone();
            failed.status = EvalStatus::Failed;
            failed.status_description =
                format!("evaluation exceeded {} nacks", config.max_nacks);
            if let Some(successor) = successor {
                // A newer eval already covers the job; no follow-up needed.
                inner.push_ready(successor);
                return Ok(NackOutcome::Failed {
                    failed,
                    follow_up: None,
                });
            }
            let wait_until = now
                + chrono::Duration::from_std(config.failed_follow_up_delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            let follow_up = eval.failed_follow_up(wait_until);
            inner.slots.insert(
                job.clone(),
                JobSlot::Waiting {
                    eval: follow_up.clone(),
                    ready_at: wait_until,
                },
            );
            return Ok(NackOutcome::Failed {
                failed,
                follow_up: Some(follow_up),
            });
        }

        if let Some(successor) = successor {
            // The nacked eval is superseded by the newer coalesced one.
            inner.push_ready(successor);
            return Ok(NackOutcome::Superseded {
                cancelled: cancel(eval),
            });
        }

        let factor = 2u32.saturating_pow(nacks.saturating_sub(1));
        let mut delay = config.initial_nack_delay.saturating_mul(factor);
        if delay > config.max_nack_delay {
            delay = config.max_nack_delay;
        }
        let ready_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
        inner
            .slots
            .insert(job.clone(), JobSlot::Waiting { eval, ready_at });
        Ok(NackOutcome::Requeued { delay })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stevedore_state::{Clock, Job, JobStatus, ManualClock, TriggeredBy};

    fn broker(cfg: BrokerConfig) -> (ManualClock, EvalBroker) {
        let manual = ManualClock::new(Utc::now());
        let shared: SharedClock = Arc::new(manual.clone());
        let broker = EvalBroker::new(cfg, shared);
        broker.set_enabled(true);
        (manual, broker)
    }

    fn job(id: &str, priority: u8) -> Job {
        Job {
            id: stevedore_state::JobId::default_ns(id),
            job_type: JobType::Service,
            priority,
            datacenters: Vec::new(),
            constraints: Vec::new(),
            affinities: Vec::new(),
            spreads: Vec::new(),
            task_groups: Vec::new(),
            update: None,
            reschedule: None,
            migrate: None,
            version: 0,
            stop: false,
            stable: false,
            status: JobStatus::Pending,
            create_index: 1,
            modify_index: 1,
        }
    }

    fn eval(job_id: &str, priority: u8, create_index: u64) -> Evaluation {
        let mut ev = Evaluation::new(&job(job_id, priority), TriggeredBy::JobRegister);
        ev.create_index = create_index;
        ev
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let (_manual, broker) = broker(BrokerConfig::default());
        broker.enqueue(eval("low", 20, 1)).unwrap();
        broker.enqueue(eval("high", 90, 2)).unwrap();
        broker.enqueue(eval("mid-a", 50, 3)).unwrap();
        broker.enqueue(eval("mid-b", 50, 4)).unwrap();

        let types = [JobType::Service];
        let mut order = Vec::new();
        for _ in 0..4 {
            let (ev, token) = broker
                .dequeue(&types, Duration::from_millis(10))
                .await
                .expect("eval available");
            order.push(ev.job_id.id.clone());
            broker.ack(&ev.id, &token).unwrap();
        }
        assert_eq!(order, vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[tokio::test]
    async fn per_job_serialization_and_coalescing() {
        let (_manual, broker) = broker(BrokerConfig::default());
        let first = eval("web", 50, 1);
        broker.enqueue(first.clone()).unwrap();

        let types = [JobType::Service];
        let (leased, token) = broker
            .dequeue(&types, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(leased.id, first.id);

        // Two more evals while leased: only the newest survives as the
        // successor.
        let mut second = eval("web", 50, 2);
        second.job_modify_index = 5;
        let mut third = eval("web", 50, 3);
        third.job_modify_index = 9;
        broker.enqueue(second.clone()).unwrap();
        let cancelled = broker.enqueue(third.clone()).unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, second.id);
        assert_eq!(cancelled[0].status, EvalStatus::Cancelled);

        // Nothing else dispatchable while the job is leased.
        assert!(
            broker
                .dequeue(&types, Duration::from_millis(5))
                .await
                .is_none()
        );

        let outcome = broker.ack(&leased.id, &token).unwrap();
        assert_eq!(
            outcome.successor.as_ref().map(|e| e.id.as_str()),
            Some(third.id.as_str())
        );

        let (next, token) = broker
            .dequeue(&types, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(next.id, third.id);
        broker.ack(&next.id, &token).unwrap();
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_idempotent() {
        let (_manual, broker) = broker(BrokerConfig::default());
        let ev = eval("web", 50, 1);
        broker.enqueue(ev.clone()).unwrap();
        let cancelled = broker.enqueue(ev.clone()).unwrap();
        assert!(cancelled.is_empty());
        assert_eq!(broker.stats().ready, 1);
    }

    #[tokio::test]
    async fn nack_requeues_with_backoff_then_fails() {
        let config = BrokerConfig {
            max_nacks: 2,
            initial_nack_delay: Duration::from_secs(1),
            ..BrokerConfig::default()
        };
        let (manual, broker) = broker(config);
        let ev = eval("web", 50, 1);
        broker.enqueue(ev.clone()).unwrap();
        let types = [JobType::Service];

        let (got, token) = broker
            .dequeue(&types, Duration::from_millis(10))
            .await
            .unwrap();
        match broker.nack(&got.id, &token).unwrap() {
            NackOutcome::Requeued { delay } => assert_eq!(delay, Duration::from_secs(1)),
            other => panic!("expected requeue, got {other:?}"),
        }

        // Not dispatchable until the delay passes.
        assert!(
            broker
                .dequeue(&types, Duration::from_millis(5))
                .await
                .is_none()
        );
        manual.advance(Duration::from_secs(2));
        let (got, token) = broker
            .dequeue(&types, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got.id, ev.id);

        // Second nack hits the budget.
        match broker.nack(&got.id, &token).unwrap() {
            NackOutcome::Failed { failed, follow_up } => {
                assert_eq!(failed.id, ev.id);
                assert_eq!(failed.status, EvalStatus::Failed);
                let follow_up = follow_up.expect("no successor, so a follow-up");
                assert_ne!(follow_up.id, ev.id);
                assert_eq!(follow_up.triggered_by, TriggeredBy::FailedFollowUp);
                assert!(follow_up.wait_until.is_some());
            }
            other => panic!("expected failure, got {other:?}"),
        }

        // The follow-up dispatches after its delay.
        manual.advance(Duration::from_secs(120));
        let (follow, token) = broker
            .dequeue(&types, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(follow.triggered_by, TriggeredBy::FailedFollowUp);
        broker.ack(&follow.id, &token).unwrap();
    }

    #[tokio::test]
    async fn lease_expiry_is_an_implicit_nack() {
        let config = BrokerConfig {
            nack_timeout: Duration::from_secs(30),
            ..BrokerConfig::default()
        };
        let (manual, broker) = broker(config);
        broker.enqueue(eval("web", 50, 1)).unwrap();
        let types = [JobType::Service];
        let (got, _token) = broker
            .dequeue(&types, Duration::from_millis(10))
            .await
            .unwrap();

        manual.advance(Duration::from_secs(31));
        let outcomes = broker.tick();
        assert!(
            outcomes
                .iter()
                .any(|o| matches!(o, NackOutcome::Requeued { .. }))
        );

        // Requeued with backoff; dispatchable after the delay.
        manual.advance(Duration::from_secs(2));
        let (again, token) = broker
            .dequeue(&types, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(again.id, got.id);
        broker.ack(&again.id, &token).unwrap();
    }

    #[tokio::test]
    async fn pause_extends_the_lease() {
        let config = BrokerConfig {
            nack_timeout: Duration::from_secs(30),
            ..BrokerConfig::default()
        };
        let (manual, broker) = broker(config);
        broker.enqueue(eval("web", 50, 1)).unwrap();
        let types = [JobType::Service];
        let (got, token) = broker
            .dequeue(&types, Duration::from_millis(10))
            .await
            .unwrap();

        manual.advance(Duration::from_secs(25));
        broker.pause_nack_timeout(&got.id, &token).unwrap();
        manual.advance(Duration::from_secs(10));
        assert!(broker.tick().is_empty(), "lease was extended");
        broker.ack(&got.id, &token).unwrap();
    }

    #[tokio::test]
    async fn wait_until_gates_dispatch() {
        let (manual, broker) = broker(BrokerConfig::default());
        let mut ev = eval("web", 50, 1);
        ev.wait_until = Some(manual.now() + chrono::Duration::seconds(60));
        broker.enqueue(ev.clone()).unwrap();
        let types = [JobType::Service];

        assert!(
            broker
                .dequeue(&types, Duration::from_millis(5))
                .await
                .is_none()
        );
        manual.advance(Duration::from_secs(61));
        let (got, token) = broker
            .dequeue(&types, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got.id, ev.id);
        broker.ack(&got.id, &token).unwrap();
    }

    #[tokio::test]
    async fn blocked_evals_release_on_index_advance() {
        let (_manual, broker) = broker(BrokerConfig::default());
        let mut ev = eval("web", 50, 1);
        ev.snapshot_index = Some(10);
        broker.block(ev.clone());
        assert_eq!(broker.stats().blocked, 1);

        assert!(
            broker.unblock(10).is_empty(),
            "index must pass the threshold"
        );
        let released = broker.unblock(11);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].status, EvalStatus::Pending);

        let types = [JobType::Service];
        let (got, token) = broker
            .dequeue(&types, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got.id, ev.id);
        broker.ack(&got.id, &token).unwrap();
    }

    #[tokio::test]
    async fn capacity_cap_fails_enqueue() {
        let config = BrokerConfig {
            pending_cap: 2,
            ..BrokerConfig::default()
        };
        let (_manual, broker) = broker(config);
        broker.enqueue(eval("a", 50, 1)).unwrap();
        broker.enqueue(eval("b", 50, 2)).unwrap();
        assert_eq!(
            broker.enqueue(eval("c", 50, 3)).unwrap_err(),
            BrokerError::CapacityExceeded
        );
    }

    #[tokio::test]
    async fn disabled_broker_rejects_and_flushes() {
        let (_manual, broker) = broker(BrokerConfig::default());
        broker.enqueue(eval("a", 50, 1)).unwrap();
        broker.set_enabled(false);
        assert_eq!(broker.stats(), BrokerStats::default());
        assert_eq!(
            broker.enqueue(eval("b", 50, 2)).unwrap_err(),
            BrokerError::NotLeader
        );
    }

    #[tokio::test]
    async fn dequeue_filters_by_scheduler_type() {
        let (_manual, broker) = broker(BrokerConfig::default());
        let mut batch_eval = eval("batch-job", 50, 1);
        batch_eval.sched_type = JobType::Batch;
        broker.enqueue(batch_eval.clone()).unwrap();

        assert!(
            broker
                .dequeue(&[JobType::Service], Duration::from_millis(5))
                .await
                .is_none()
        );
        let (got, token) = broker
            .dequeue(
                &[JobType::Service, JobType::Batch],
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert_eq!(got.id, batch_eval.id);
        broker.ack(&got.id, &token).unwrap();
    }
}
