//! dispatchd — the dispatch engine daemon.
//!
//! Single binary that assembles the dispatch stack:
//! - Worker registry
//! - Health monitor
//! - Throttle controller
//! - Dispatch matcher
//!
//! The `simulate` command drives the engine against a synthetic worker
//! fleet: workers report randomized health, one of them runs hot so the
//! throttle and restart paths get exercised.
//!
//! # Usage
//!
//! ```text
//! dispatchd simulate --workers 4 --tick-ms 250
//! dispatchd check-policy --policy dispatch.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn};

use dispatch_engine::{
    load_policy, now_ms, AssignmentOutcome, DispatchEngine, HealthSample, Priority, RestartFn,
    ThrottlePolicy, Worker, WorkerFilter,
};

const CAPABILITIES: [&str; 3] = ["dry_van", "reefer", "flatbed"];

#[derive(Parser)]
#[command(name = "dispatchd", about = "Capacity-aware dispatch daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine against a simulated worker fleet.
    Simulate {
        /// Policy file (TOML). Defaults apply when omitted.
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Number of simulated workers.
        #[arg(long, default_value = "4")]
        workers: u32,

        /// Simulation tick in milliseconds.
        #[arg(long, default_value = "250")]
        tick_ms: u64,

        /// Stop after this many seconds; 0 runs until Ctrl-C.
        #[arg(long, default_value = "0")]
        duration: u64,
    },

    /// Parse a policy file and print the effective configuration.
    CheckPolicy {
        #[arg(long)]
        policy: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dispatchd=debug,dispatch=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            policy,
            workers,
            tick_ms,
            duration,
        } => run_simulation(policy, workers, tick_ms, duration).await,
        Command::CheckPolicy { policy } => {
            let policy = load_policy(&policy)?;
            println!("{policy:#?}");
            Ok(())
        }
    }
}

async fn run_simulation(
    policy_path: Option<PathBuf>,
    workers: u32,
    tick_ms: u64,
    duration: u64,
) -> anyhow::Result<()> {
    info!("dispatch daemon starting in simulation mode");

    let policy = match policy_path {
        Some(path) => {
            let policy = load_policy(&path)?;
            info!(path = %path.display(), "policy loaded");
            policy
        }
        None => ThrottlePolicy::default(),
    };

    // Restart requests go to a simulated lifecycle collaborator that
    // "restarts" the worker after a short delay.
    let (restart_tx, mut restart_rx) = mpsc::unbounded_channel::<String>();
    let restart_fn: RestartFn = Arc::new(move |worker_id| {
        let tx = restart_tx.clone();
        Box::pin(async move {
            tx.send(worker_id)
                .map_err(|e| anyhow::anyhow!("restart channel closed: {e}"))
        })
    });

    let engine = DispatchEngine::with_restart_fn(policy, restart_fn);

    for i in 0..workers {
        let capability = CAPABILITIES[i as usize % CAPABILITIES.len()];
        engine
            .register_worker(Worker::new(format!("worker-{i}"), [capability], 4))
            .await?;
    }
    info!(workers, "simulated fleet registered");

    let shutdown_tx = engine.spawn_background();
    let mut shutdown_rx = shutdown_tx.subscribe();

    let restarter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(worker_id) = restart_rx.recv().await {
                info!(%worker_id, "lifecycle collaborator restarting worker");
                tokio::time::sleep(Duration::from_millis(750)).await;
                match engine.restart_completed(&worker_id).await {
                    Ok(_) => info!(%worker_id, "worker restarted"),
                    Err(e) => warn!(%worker_id, error = %e, "restart completion failed"),
                }
            }
        })
    };

    let sampler = {
        let engine = engine.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = 0u64;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(tick_ms)) => {
                        tick += 1;
                        feed_samples(&engine, tick).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    let driver = {
        let engine = engine.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut seq = 0u64;
            let mut open: Vec<String> = Vec::new();
            let mut tick = 0u64;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(tick_ms)) => {
                        tick += 1;
                        drive_work(&engine, &mut seq, &mut open).await;
                        if tick % 10 == 0 {
                            log_fleet(&engine).await;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    if duration > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(duration)) => {
                info!(duration, "simulation window elapsed");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
    }
    let _ = shutdown_tx.send(true);
    let _ = shutdown_rx.changed().await;

    let _ = sampler.await;
    let _ = driver.await;
    restarter.abort();

    log_fleet(&engine).await;
    info!("dispatch daemon stopped");
    Ok(())
}

/// One round of synthetic health. `worker-0` runs hot in bursts so the
/// throttle controller has something to do.
async fn feed_samples(engine: &DispatchEngine, tick: u64) {
    let snapshot = engine.list_workers(&WorkerFilter::default()).await;
    for worker in snapshot {
        let (cpu, errors) = {
            let mut rng = rand::thread_rng();
            let hot = worker.id == "worker-0" && (tick / 40) % 2 == 1;
            if hot {
                (rng.gen_range(85.0..99.0), rng.gen_range(0.05..0.30))
            } else {
                (rng.gen_range(20.0..65.0), rng.gen_range(0.0..0.05))
            }
        };
        let sample = HealthSample {
            cpu_pct: cpu,
            memory_pct: cpu * 0.8,
            queue_depth: worker.in_flight,
            response_ms: 80.0 + cpu * 4.0,
            error_rate: errors,
            taken_at_ms: now_ms(),
        };
        if let Err(e) = engine.ingest_health_sample(&worker.id, sample).await {
            warn!(worker_id = %worker.id, error = %e, "sample rejected");
        }
    }
}

/// Submit a few items, dispatch a batch, and settle some open assignments.
async fn drive_work(engine: &DispatchEngine, seq: &mut u64, open: &mut Vec<String>) {
    let (submissions, settlements) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(1..=3u32), rng.gen_range(1..=4usize))
    };

    for _ in 0..submissions {
        let (capability, priority) = {
            let mut rng = rand::thread_rng();
            let capability = CAPABILITIES[rng.gen_range(0..CAPABILITIES.len())];
            let priority = match rng.gen_range(0..10u32) {
                0 => Priority::Urgent,
                1..=3 => Priority::High,
                4..=8 => Priority::Normal,
                _ => Priority::Low,
            };
            (capability, priority)
        };
        *seq += 1;
        let id = format!("job-{seq}");
        if let Err(e) = engine.submit_work(&id, capability, priority).await {
            warn!(item_id = %id, error = %e, "submission rejected");
        }
    }

    for assignment in engine.dispatch_batch(8).await {
        open.push(assignment.id);
    }

    for _ in 0..settlements.min(open.len()) {
        let assignment_id = open.remove(0);
        let outcome = {
            let mut rng = rand::thread_rng();
            match rng.gen_range(0..20u32) {
                0 => AssignmentOutcome::Rejected,
                1..=2 => AssignmentOutcome::Failed,
                _ => AssignmentOutcome::Completed,
            }
        };
        if let Err(e) = engine.report_outcome(&assignment_id, outcome).await {
            warn!(%assignment_id, error = %e, "outcome rejected");
        }
    }
}

async fn log_fleet(engine: &DispatchEngine) {
    let pending = engine.pending_count().await;
    for worker in engine.list_workers(&WorkerFilter::default()).await {
        info!(
            worker_id = %worker.id,
            health = ?worker.health,
            in_flight = worker.in_flight,
            effective_limit = worker.effective_limit,
            completed = worker.completed_total,
            "fleet status"
        );
    }
    info!(pending, "queue status");
}
