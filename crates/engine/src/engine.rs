//! Engine runtime: leadership swaps, the worker pool and housekeeping.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use stevedore_state::{JobType, LogEntry, SharedClock, StateStore, Topic};

use crate::api::{
    EngineConfig, EngineEvent, EngineHandle, StatusSnapshot, WorkerSnapshot, WorkerState,
};
use crate::applier::applier_channel;
use crate::broker::{EvalBroker, NackOutcome};
use crate::watcher::DeploymentWatcher;
use crate::worker::{WorkerContext, WorkerEvent, run_worker};

pub(crate) enum Control {
    SetLeader(bool),
    Stop,
}

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    pub(crate) control_tx: mpsc::UnboundedSender<Control>,
    pub(crate) stop_requested: AtomicBool,
    pub(crate) store: StateStore,
    pub(crate) broker: Arc<EvalBroker>,
    pub(crate) clock: SharedClock,
}

pub(crate) fn start_engine_with(
    config: EngineConfig,
    store: StateStore,
    clock: SharedClock,
) -> EngineHandle {
    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::initial(config.worker_count));
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let broker = Arc::new(EvalBroker::new(config.broker.clone(), clock.clone()));
    let inner = Arc::new(EngineInner {
        event_tx,
        snapshot_rx,
        control_tx,
        stop_requested: AtomicBool::new(false),
        store,
        broker,
        clock,
    });

    if config.start_as_leader {
        let _ = inner.control_tx.send(Control::SetLeader(true));
    }
    let join = tokio::spawn(run_engine(inner.clone(), snapshot_tx, control_rx, config));
    EngineHandle { inner, join }
}

struct LeaderState {
    shutdown_tx: watch::Sender<bool>,
    applier_join: JoinHandle<()>,
    watcher_join: JoinHandle<()>,
    workers: JoinSet<()>,
}

async fn run_engine(
    inner: Arc<EngineInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    config: EngineConfig,
) {
    let (worker_event_tx, mut worker_event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let mut worker_states: Vec<WorkerState> = vec![WorkerState::Idle; config.worker_count];
    let mut evals_processed: Vec<u64> = vec![0; config.worker_count];
    let mut leader: Option<LeaderState> = None;

    // Blocked evals release only when cluster capacity changes (nodes or
    // allocations), never on our own eval bookkeeping writes.
    let mut store_events = inner.store.subscribe();
    let mut capacity_index: u64 = 0;

    let mut tick = tokio::time::interval(config.tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let _ = inner.event_tx.send(EngineEvent::Started);
    push_snapshot(&inner, &snapshot_tx, leader.is_some(), &worker_states, &evals_processed);

    loop {
        tokio::select! {
            ctrl = control_rx.recv() => {
                match ctrl {
                    None | Some(Control::Stop) => break,
                    Some(Control::SetLeader(true)) => {
                        if leader.is_none() {
                            leader = Some(become_leader(&inner, &config, worker_event_tx.clone()));
                            let _ = inner.event_tx.send(EngineEvent::LeadershipChanged { leader: true });
                        }
                    }
                    Some(Control::SetLeader(false)) => {
                        if let Some(state) = leader.take() {
                            step_down(&inner, state).await;
                            let _ = inner.event_tx.send(EngineEvent::LeadershipChanged { leader: false });
                        }
                    }
                }
                push_snapshot(&inner, &snapshot_tx, leader.is_some(), &worker_states, &evals_processed);
            }
            event = worker_event_rx.recv() => {
                let Some(event) = event else { continue };
                handle_worker_event(&inner, event, &mut worker_states, &mut evals_processed);
                push_snapshot(&inner, &snapshot_tx, leader.is_some(), &worker_states, &evals_processed);
            }
            event = store_events.recv() => {
                match event {
                    Ok(event) => {
                        if matches!(event.topic, Topic::Node | Topic::Alloc) {
                            capacity_index = capacity_index.max(event.index);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        capacity_index = inner.store.latest_index();
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
            _ = tick.tick() => {
                if leader.is_some() {
                    housekeeping(&inner, capacity_index);
                }
                push_snapshot(&inner, &snapshot_tx, leader.is_some(), &worker_states, &evals_processed);
            }
        }
    }

    if let Some(state) = leader.take() {
        step_down(&inner, state).await;
    }
    let _ = inner.event_tx.send(EngineEvent::Stopped);
    push_snapshot(&inner, &snapshot_tx, false, &worker_states, &evals_processed);
}

fn become_leader(
    inner: &Arc<EngineInner>,
    config: &EngineConfig,
    worker_event_tx: mpsc::UnboundedSender<WorkerEvent>,
) -> LeaderState {
    inner.broker.set_enabled(true);
    let restored = inner.broker.restore(&inner.store.snapshot());
    info!(restored, "gained leadership; broker restored from state store");

    let (applier_handle, applier_task) = applier_channel(
        inner.store.clone(),
        inner.broker.clone(),
        config.applier.clone(),
    );
    let applier_join = tokio::spawn(applier_task.run());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = DeploymentWatcher::new(
        inner.store.clone(),
        inner.broker.clone(),
        inner.clock.clone(),
        config.watcher.clone(),
    );
    let watcher_join = tokio::spawn(watcher.run(shutdown_rx.clone()));

    let mut workers = JoinSet::new();
    for worker_idx in 0..config.worker_count {
        let ctx = WorkerContext {
            worker_idx,
            store: inner.store.clone(),
            broker: inner.broker.clone(),
            applier: applier_handle.clone(),
            clock: inner.clock.clone(),
            scheduler_config: config.scheduler.clone(),
            max_plan_attempts: config.max_plan_attempts,
            schedulers: vec![
                JobType::Service,
                JobType::Batch,
                JobType::System,
                JobType::Sysbatch,
            ],
            events: worker_event_tx.clone(),
        };
        workers.spawn(run_worker(ctx, shutdown_rx.clone()));
    }

    LeaderState {
        shutdown_tx,
        applier_join,
        watcher_join,
        workers,
    }
}

/// Step-down is a single atomic swap: flush the broker, cancel workers and
/// the watcher, and kill the applier so in-flight submissions fail with a
/// not-leader error.
async fn step_down(inner: &Arc<EngineInner>, mut state: LeaderState) {
    inner.broker.set_enabled(false);
    let _ = state.shutdown_tx.send(true);
    state.applier_join.abort();
    while state.workers.join_next().await.is_some() {}
    state.watcher_join.abort();
    debug!("stepped down; all scheduling state flushed");
}

fn handle_worker_event(
    inner: &Arc<EngineInner>,
    event: WorkerEvent,
    worker_states: &mut [WorkerState],
    evals_processed: &mut [u64],
) {
    match event {
        WorkerEvent::EvalStarted {
            worker_idx,
            eval_id,
            job_id,
        } => {
            if let Some(state) = worker_states.get_mut(worker_idx) {
                *state = WorkerState::Scheduling {
                    eval_id: eval_id.clone(),
                    job_id: job_id.clone(),
                };
            }
            let _ = inner.event_tx.send(EngineEvent::EvalStarted {
                worker_idx,
                eval_id,
                job_id,
            });
        }
        WorkerEvent::EvalCompleted {
            worker_idx,
            eval_id,
            job_id,
            placed,
        } => {
            if let Some(count) = evals_processed.get_mut(worker_idx) {
                *count += 1;
            }
            let _ = inner.event_tx.send(EngineEvent::EvalCompleted {
                worker_idx,
                eval_id,
                job_id,
                placed,
            });
        }
        WorkerEvent::EvalFailed {
            worker_idx,
            eval_id,
            message,
        } => {
            if let Some(count) = evals_processed.get_mut(worker_idx) {
                *count += 1;
            }
            let _ = inner.event_tx.send(EngineEvent::EvalFailed {
                worker_idx,
                eval_id,
                message,
            });
        }
        WorkerEvent::EvalNacked { worker_idx, eval_id } => {
            if let Some(count) = evals_processed.get_mut(worker_idx) {
                *count += 1;
            }
            let _ = inner
                .event_tx
                .send(EngineEvent::EvalNacked { worker_idx, eval_id });
        }
        WorkerEvent::Idle { worker_idx } => {
            if let Some(state) = worker_states.get_mut(worker_idx) {
                *state = WorkerState::Idle;
            }
        }
    }
}

/// Leader-side periodic work: expire leases, promote delayed evals, and
/// release blocked evals when cluster capacity has changed past their
/// snapshot.
fn housekeeping(inner: &Arc<EngineInner>, capacity_index: u64) {
    for outcome in inner.broker.tick() {
        match outcome {
            NackOutcome::Failed { failed, follow_up } => {
                let mut evals = vec![failed];
                evals.extend(follow_up);
                let _ = inner.store.apply(LogEntry::UpsertEvals(evals));
            }
            NackOutcome::Superseded { cancelled } => {
                let _ = inner.store.apply(LogEntry::UpsertEvals(vec![cancelled]));
            }
            NackOutcome::Requeued { .. } => {}
        }
    }

    let released = inner.broker.unblock(capacity_index);
    if !released.is_empty() {
        debug!(count = released.len(), "unblocked evaluations after state change");
        let _ = inner.store.apply(LogEntry::UpsertEvals(released));
    }
}

fn push_snapshot(
    inner: &Arc<EngineInner>,
    snapshot_tx: &watch::Sender<StatusSnapshot>,
    leader: bool,
    worker_states: &[WorkerState],
    evals_processed: &[u64],
) {
    let workers = worker_states
        .iter()
        .enumerate()
        .map(|(worker_idx, state)| WorkerSnapshot {
            worker_idx,
            state: state.clone(),
            evals_processed: evals_processed.get(worker_idx).copied().unwrap_or(0),
        })
        .collect();
    let snapshot = StatusSnapshot {
        leader,
        stop_requested: inner
            .stop_requested
            .load(std::sync::atomic::Ordering::SeqCst),
        broker: inner.broker.stats(),
        workers,
    };
    let _ = snapshot_tx.send(snapshot);
}
