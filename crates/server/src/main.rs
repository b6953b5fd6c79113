mod cli;
mod shutdown;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stevedore_engine::{EngineConfig, EngineEvent, EngineHandle, start_engine_with};
use stevedore_state::{
    ClientAllocUpdate, ClientStatus, Job, Node, SharedClock, StateStore, SystemClock,
};

use crate::cli::{Cli, Command};
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { job } => validate(&job),
        Command::Simulate {
            nodes,
            jobs,
            workers,
            timeout,
        } => simulate(&nodes, &jobs, workers as usize, timeout).await,
        Command::Agent {
            nodes,
            jobs,
            workers,
        } => agent(&nodes, &jobs, workers as usize).await,
    }
}

fn load_job(path: &Path) -> anyhow::Result<Job> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read job file {}", path.display()))?;
    let job: Job =
        serde_json::from_str(&raw).with_context(|| format!("parse job file {}", path.display()))?;
    Ok(job)
}

fn load_nodes(path: &Path) -> anyhow::Result<Vec<Node>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read node file {}", path.display()))?;
    let nodes: Vec<Node> =
        serde_json::from_str(&raw).with_context(|| format!("parse node file {}", path.display()))?;
    if nodes.is_empty() {
        anyhow::bail!("node file {} contains no nodes", path.display());
    }
    Ok(nodes)
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let job = load_job(path)?;
    if job.task_groups.is_empty() {
        anyhow::bail!("job {} has no task groups", job.id);
    }
    for group in &job.task_groups {
        if group.tasks.is_empty() {
            anyhow::bail!("task group {} has no tasks", group.name);
        }
    }
    println!(
        "{}: {} job, {} group(s), priority {}",
        job.id,
        job.job_type.as_str(),
        job.task_groups.len(),
        job.priority
    );
    Ok(())
}

fn start(nodes: &[Node], jobs: &[Job], workers: usize) -> anyhow::Result<EngineHandle> {
    let store = StateStore::new();
    let clock: SharedClock = Arc::new(SystemClock);
    let engine = start_engine_with(
        EngineConfig {
            worker_count: workers.max(1),
            ..EngineConfig::default()
        },
        store,
        clock,
    );
    for node in nodes {
        engine
            .register_node(node.clone())
            .with_context(|| format!("register node {}", node.id))?;
    }
    for job in jobs {
        let eval_id = engine
            .register_job(job.clone())
            .with_context(|| format!("register job {}", job.id))?;
        info!(job = %job.id, eval = %eval_id, "job registered");
    }
    Ok(engine)
}

/// Play the client side: report every pending allocation as running so
/// health-gated rollouts can make progress without real task drivers.
fn report_pending_running(engine: &EngineHandle) -> usize {
    let snapshot = engine.store().snapshot();
    let updates: Vec<ClientAllocUpdate> = snapshot
        .allocs()
        .filter(|a| a.should_run() && a.client_status == ClientStatus::Pending)
        .map(|a| ClientAllocUpdate {
            alloc_id: a.id.clone(),
            client_status: ClientStatus::Running,
        })
        .collect();
    let count = updates.len();
    if count > 0 {
        if let Err(err) = engine.update_allocs_from_client(updates) {
            warn!(error = %err, "failed to report allocations running");
        }
    }
    count
}

fn quiescent(engine: &EngineHandle) -> bool {
    let status = engine.snapshot();
    let broker_idle = status.broker.ready == 0
        && status.broker.delayed == 0
        && status.broker.leased == 0;
    let workers_idle = status
        .workers
        .iter()
        .all(|w| w.state == stevedore_engine::WorkerState::Idle);
    broker_idle && workers_idle
}

fn print_report(engine: &EngineHandle) {
    let snapshot = engine.store().snapshot();

    println!("\n== allocations ==");
    let mut allocs: Vec<_> = snapshot.allocs().collect();
    allocs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    for alloc in allocs {
        println!(
            "{:<28} node={:<12} desired={:<6} client={:<8} cpu={} mem={}",
            alloc.name,
            alloc.node_id,
            format!("{:?}", alloc.desired_status).to_lowercase(),
            format!("{:?}", alloc.client_status).to_lowercase(),
            alloc.resources.cpu_mhz,
            alloc.resources.memory_mb,
        );
    }

    println!("\n== evaluations ==");
    let mut evals: Vec<_> = snapshot.evals().collect();
    evals.sort_by_key(|e| e.create_index);
    for eval in evals {
        println!(
            "{:<38} job={:<16} status={:<9} trigger={:?}",
            eval.id,
            eval.job_id.to_string(),
            format!("{:?}", eval.status).to_lowercase(),
            eval.triggered_by,
        );
        for (group, metrics) in &eval.failed_tg_allocs {
            println!(
                "  group {group}: {} node(s) evaluated, filtered: {:?}, exhausted: {:?}",
                metrics.nodes_evaluated, metrics.constraint_filtered, metrics.dimension_exhausted,
            );
        }
    }

    let deployments: Vec<_> = snapshot.deployments().collect();
    if !deployments.is_empty() {
        println!("\n== deployments ==");
        for deployment in deployments {
            println!(
                "{:<34} job={:<16} version={} status={:?}",
                deployment.id, deployment.job_id.to_string(), deployment.job_version, deployment.status,
            );
            for (group, state) in &deployment.groups {
                println!(
                    "  group {group}: desired={} placed={} healthy={} unhealthy={} promoted={}",
                    state.desired_total, state.placed, state.healthy, state.unhealthy, state.promoted,
                );
            }
        }
    }
}

async fn simulate(
    nodes_path: &Path,
    job_paths: &[std::path::PathBuf],
    workers: usize,
    timeout: u64,
) -> anyhow::Result<()> {
    let nodes = load_nodes(nodes_path)?;
    let jobs: Vec<Job> = job_paths
        .iter()
        .map(|p| load_job(p))
        .collect::<anyhow::Result<_>>()?;
    let engine = start(&nodes, &jobs, workers)?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout.max(1));
    let mut settle = tokio::time::interval(Duration::from_millis(200));
    let mut settled_rounds = 0;
    loop {
        settle.tick().await;
        report_pending_running(&engine);
        if quiescent(&engine) {
            settled_rounds += 1;
            // A couple of quiet rounds in a row: delayed evals and watcher
            // follow-ups have had their chance.
            if settled_rounds >= 3 {
                break;
            }
        } else {
            settled_rounds = 0;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("simulation did not settle before the timeout");
            break;
        }
    }

    print_report(&engine);
    engine.request_stop();
    engine.wait().await;
    Ok(())
}

async fn agent(
    nodes_path: &Path,
    job_paths: &[std::path::PathBuf],
    workers: usize,
) -> anyhow::Result<()> {
    let nodes = load_nodes(nodes_path)?;
    let jobs: Vec<Job> = job_paths
        .iter()
        .map(|p| load_job(p))
        .collect::<anyhow::Result<_>>()?;
    let engine = start(&nodes, &jobs, workers)?;
    let mut events = engine.subscribe();

    info!(
        workers,
        nodes = nodes.len(),
        jobs = jobs.len(),
        "stevedore agent running"
    );

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    // Stand-in client heartbeat: report placed allocations as running.
    let mut client_tick = tokio::time::interval(Duration::from_secs(1));
    client_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            ev = shutdown_rx.recv() => {
                match ev {
                    Some(ShutdownEvent::Graceful) => {
                        info!("stop requested; draining (press CTRL+C again to exit immediately)");
                        engine.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        warn!("immediate exit");
                        std::process::exit(130);
                    }
                    None => {}
                }
            }
            _ = client_tick.tick() => {
                report_pending_running(&engine);
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                match evt {
                    EngineEvent::EvalCompleted { eval_id, job_id, placed, .. } => {
                        info!(eval = %eval_id, job = %job_id, placed, "evaluation complete");
                    }
                    EngineEvent::EvalFailed { eval_id, message, .. } => {
                        warn!(eval = %eval_id, message, "evaluation failed");
                    }
                    EngineEvent::Warning { message } => warn!("{message}"),
                    EngineEvent::Stopped => break,
                    _ => {}
                }
            }
        }
    }

    engine.wait().await;
    Ok(())
}
