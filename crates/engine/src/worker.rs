//! Long-running scheduling workers.
//!
//! Each worker loops: dequeue an eval, snapshot at least as fresh as the
//! eval's job, run the matching scheduler, submit the plan, and ack or
//! nack. Plan rejections re-plan against a newer snapshot up to
//! `max_plan_attempts` before nacking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use stevedore_sched::{SchedulerConfig, scheduler_for};
use stevedore_state::{
    EvalStatus, Evaluation, JobId, JobType, LogEntry, SharedClock, StateStore,
};

use crate::applier::{ApplierHandle, ApplyError};
use crate::broker::{EvalBroker, LeaseToken, NackOutcome};

/// How long one dequeue call waits before re-checking for shutdown.
const DEQUEUE_WAIT: Duration = Duration::from_secs(5);

/// Status notifications from workers to the engine loop.
pub(crate) enum WorkerEvent {
    EvalStarted {
        worker_idx: usize,
        eval_id: String,
        job_id: JobId,
    },
    EvalCompleted {
        worker_idx: usize,
        eval_id: String,
        job_id: JobId,
        placed: usize,
    },
    EvalFailed {
        worker_idx: usize,
        eval_id: String,
        message: String,
    },
    EvalNacked {
        worker_idx: usize,
        eval_id: String,
    },
    Idle {
        worker_idx: usize,
    },
}

pub(crate) struct WorkerContext {
    pub(crate) worker_idx: usize,
    pub(crate) store: StateStore,
    pub(crate) broker: Arc<EvalBroker>,
    pub(crate) applier: ApplierHandle,
    pub(crate) clock: SharedClock,
    pub(crate) scheduler_config: SchedulerConfig,
    pub(crate) max_plan_attempts: u32,
    pub(crate) schedulers: Vec<JobType>,
    pub(crate) events: mpsc::UnboundedSender<WorkerEvent>,
}

pub(crate) async fn run_worker(ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            leased = ctx.broker.dequeue(&ctx.schedulers, DEQUEUE_WAIT) => {
                let Some((eval, token)) = leased else { continue };
                process_eval(&ctx, eval, token).await;
                let _ = ctx.events.send(WorkerEvent::Idle {
                    worker_idx: ctx.worker_idx,
                });
            }
        }
    }
}

async fn process_eval(ctx: &WorkerContext, eval: Evaluation, token: LeaseToken) {
    let _ = ctx.events.send(WorkerEvent::EvalStarted {
        worker_idx: ctx.worker_idx,
        eval_id: eval.id.clone(),
        job_id: eval.job_id.clone(),
    });
    debug!(worker = ctx.worker_idx, eval = %eval.id, job = %eval.job_id, "processing evaluation");

    // The snapshot must be at least as fresh as the job the eval refers to.
    ctx.store.wait_for_index(eval.job_modify_index).await;
    let mut snapshot = ctx.store.snapshot();
    let mut scheduler = scheduler_for(eval.sched_type, ctx.scheduler_config.clone());

    let mut attempts = 0u32;
    let mut placed = 0usize;
    let outcome = loop {
        let now = ctx.clock.now();
        let outcome = match scheduler.process(&eval, &snapshot, now) {
            Ok(outcome) => outcome,
            Err(err) if err.is_fatal() => {
                warn!(eval = %eval.id, error = %err, "evaluation failed permanently");
                let mut failed = eval.clone();
                failed.status = EvalStatus::Failed;
                failed.status_description = err.to_string();
                failed.snapshot_index = Some(snapshot.latest_index());
                let _ = ctx.store.apply(LogEntry::UpsertEvals(vec![failed]));
                let _ = ctx.broker.ack(&eval.id, &token);
                let _ = ctx.events.send(WorkerEvent::EvalFailed {
                    worker_idx: ctx.worker_idx,
                    eval_id: eval.id.clone(),
                    message: err.to_string(),
                });
                return;
            }
            Err(err) => {
                warn!(eval = %eval.id, error = %err, "scheduling error; nacking");
                nack(ctx, &eval, &token);
                return;
            }
        };

        let Some(plan) = outcome.plan.clone() else {
            break outcome;
        };
        match ctx.applier.submit(plan).await {
            Ok(result) if result.fully_accepted() => {
                placed = result.accepted_allocs.len();
                break outcome;
            }
            Ok(result) => {
                attempts += 1;
                if attempts >= ctx.max_plan_attempts {
                    warn!(
                        eval = %eval.id,
                        attempts,
                        rejected = result.rejected_nodes.len(),
                        "plan rejected too many times; nacking"
                    );
                    nack(ctx, &eval, &token);
                    return;
                }
                // Re-plan against a snapshot at least as fresh as the
                // applier's view.
                if let Some(refresh) = result.refresh_index {
                    ctx.store.wait_for_index(refresh).await;
                }
                snapshot = ctx.store.snapshot();
                debug!(
                    eval = %eval.id,
                    attempt = attempts,
                    rejected = result.rejected_nodes.len(),
                    "plan partially rejected; re-planning"
                );
            }
            Err(ApplyError::NotLeader) => {
                // Leadership moved mid-flight; the new leader rebuilds the
                // eval from the store.
                debug!(eval = %eval.id, "plan submission failed: not the leader");
                let _ = ctx.broker.nack(&eval.id, &token);
                return;
            }
            Err(err) => {
                warn!(eval = %eval.id, error = %err, "plan submission failed; nacking");
                nack(ctx, &eval, &token);
                return;
            }
        }
    };

    // Persist the eval's final state together with its follow-ups.
    let mut evals = vec![outcome.updated_eval.clone()];
    evals.extend(outcome.follow_up_evals.iter().cloned());
    if let Some(blocked) = &outcome.blocked_eval {
        evals.push(blocked.clone());
    }
    if let Err(err) = ctx.store.apply(LogEntry::UpsertEvals(evals)) {
        warn!(eval = %eval.id, error = %err, "failed to persist eval results; nacking");
        nack(ctx, &eval, &token);
        return;
    }

    // Release the lease before queueing same-job successors so they do not
    // coalesce against this eval.
    let _ = ctx.broker.ack(&eval.id, &token);
    for follow_up in outcome.follow_up_evals {
        match ctx.broker.enqueue(follow_up) {
            Ok(cancelled) if !cancelled.is_empty() => {
                let _ = ctx.store.apply(LogEntry::UpsertEvals(cancelled));
            }
            _ => {}
        }
    }
    if let Some(blocked) = outcome.blocked_eval {
        ctx.broker.block(blocked);
    }

    let _ = ctx.events.send(WorkerEvent::EvalCompleted {
        worker_idx: ctx.worker_idx,
        eval_id: eval.id.clone(),
        job_id: eval.job_id.clone(),
        placed,
    });
}

fn nack(ctx: &WorkerContext, eval: &Evaluation, token: &LeaseToken) {
    match ctx.broker.nack(&eval.id, token) {
        Ok(NackOutcome::Failed { failed, follow_up }) => {
            let mut evals = vec![failed];
            evals.extend(follow_up);
            let _ = ctx.store.apply(LogEntry::UpsertEvals(evals));
        }
        Ok(NackOutcome::Superseded { cancelled }) => {
            let _ = ctx.store.apply(LogEntry::UpsertEvals(vec![cancelled]));
        }
        Ok(NackOutcome::Requeued { .. }) | Err(_) => {}
    }
    let _ = ctx.events.send(WorkerEvent::EvalNacked {
        worker_idx: ctx.worker_idx,
        eval_id: eval.id.clone(),
    });
}
