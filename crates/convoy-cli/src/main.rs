use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use convoy_core::app::{
    CoordinatorBuilder, Engine, EngineLimits, MessageRouter, OverallState, StatusReport,
    WorkerEndpoint,
};
use convoy_core::config::CoordinatorConfig;
use convoy_core::domain::{DefaultDecider, Roster, TaskManifest};
use convoy_core::ports::{Clock, SystemClock, UlidGenerator};
use convoy_core::store::{LegacySource, Snapshot, migrate};
use tokio::sync::watch;
use tracing::{info, warn};

mod sim;
mod telemetry;

use sim::SimProfile;

#[derive(Debug, Parser)]
#[command(name = "convoy", version, about = "Dependency-aware task coordinator")]
struct Cli {
    /// TOML configuration file; defaults apply when absent.
    #[arg(short, long, global = true, default_value = "convoy.toml")]
    config: PathBuf,

    /// Overrides `logging.level` from the configuration.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the coordinator with simulated workers until the task set settles.
    Run {
        /// Task manifest (JSON).
        #[arg(long)]
        tasks: PathBuf,
        /// Worker roster (JSON).
        #[arg(long)]
        roster: PathBuf,
        #[arg(long, default_value_t = 0.1)]
        failure_rate: f64,
        #[arg(long, default_value_t = 0.0)]
        stall_rate: f64,
        /// Nominal job length in milliseconds.
        #[arg(long, default_value_t = 200)]
        work_ms: u64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Validate a task manifest and print its topological order.
    Check {
        tasks: PathBuf,
        /// Also verify that every task's capabilities are covered.
        #[arg(long)]
        roster: Option<PathBuf>,
    },
    /// Consolidate legacy task lists into one snapshot.
    Migrate {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Summarise a snapshot file.
    Status {
        snapshot: PathBuf,
        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CoordinatorConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    telemetry::init_tracing(&config.logging)?;

    match cli.command {
        Command::Run {
            tasks,
            roster,
            failure_rate,
            stall_rate,
            work_ms,
            seed,
        } => {
            for (name, rate) in [("failure-rate", failure_rate), ("stall-rate", stall_rate)] {
                if !(0.0..=1.0).contains(&rate) {
                    bail!("--{name} must be within 0..=1, got {rate}");
                }
            }
            let profile = SimProfile {
                failure_rate,
                stall_rate,
                work: Duration::from_millis(work_ms),
            };
            run(config, &tasks, &roster, profile, seed).await
        }
        Command::Check { tasks, roster } => check(config, &tasks, roster.as_deref()).await,
        Command::Migrate { sources, output } => migrate_files(&sources, &output),
        Command::Status { snapshot, json } => status(config, &snapshot, json),
    }
}

async fn run(
    config: CoordinatorConfig,
    tasks: &Path,
    roster: &Path,
    profile: SimProfile,
    seed: u64,
) -> Result<()> {
    let manifest = TaskManifest::load(tasks)
        .with_context(|| format!("failed to read tasks from {}", tasks.display()))?;
    let roster = Roster::load(roster)
        .with_context(|| format!("failed to read roster from {}", roster.display()))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Endpoints subscribe before the coordinator can hand out the first assignment.
    let router = MessageRouter::with_backlog_limit(config.channel_capacity, config.max_backlog);
    let (sim_tx, sim_rx) = watch::channel(false);
    let mut sims = Vec::new();
    for (i, worker) in roster.workers.iter().enumerate() {
        let endpoint = WorkerEndpoint::connect(&router, worker.id.clone(), clock.clone());
        sims.push(tokio::spawn(sim::run_worker(
            endpoint,
            profile,
            seed.wrapping_add(i as u64),
            sim_rx.clone(),
        )));
    }

    let (handle, runtime) = CoordinatorBuilder::new(config)
        .clock(clock.clone())
        .router(router)
        .roster(roster.workers.clone())
        .tasks(manifest.tasks)
        .require_capability_coverage()
        .spawn()
        .await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => {
                let report = handle.status_report().await?;
                if matches!(report.state, OverallState::Drained | OverallState::Stuck) {
                    info!(state = ?report.state, "task set settled");
                    break;
                }
            }
        }
    }

    let _ = sim_tx.send(true);
    for sim in sims {
        let _ = sim.await;
    }
    let engine = runtime.shutdown_and_join().await?;
    print_report(&engine.status_report());
    for alert in engine.alerts() {
        println!(
            "alert {} [{:?}] {} {}: {}",
            alert.id, alert.severity, alert.reason, alert.task_id, alert.message
        );
    }
    Ok(())
}

async fn check(config: CoordinatorConfig, tasks: &Path, roster: Option<&Path>) -> Result<()> {
    let manifest = TaskManifest::load(tasks)
        .with_context(|| format!("failed to read tasks from {}", tasks.display()))?;
    let mut builder = CoordinatorBuilder::new(CoordinatorConfig {
        snapshot_path: None,
        ..config
    })
    .tasks(manifest.tasks);
    if let Some(roster) = roster {
        let roster = Roster::load(roster)
            .with_context(|| format!("failed to read roster from {}", roster.display()))?;
        builder = builder.roster(roster.workers).require_capability_coverage();
    }
    let engine = builder.build_engine().await?;

    println!("topological order:");
    for (i, id) in engine.topo_order().iter().enumerate() {
        let deps = engine
            .task(id)
            .map(|t| t.dependencies.iter().map(|d| d.as_str()).collect::<Vec<_>>())
            .unwrap_or_default();
        if deps.is_empty() {
            println!("  {:>3}. {id}", i + 1);
        } else {
            println!("  {:>3}. {id} (after {})", i + 1, deps.join(", "));
        }
    }
    let ready = engine.ready_set();
    let ready: Vec<&str> = ready.iter().map(|id| id.as_str()).collect();
    println!("ready now: {}", ready.join(", "));
    Ok(())
}

fn migrate_files(sources: &[PathBuf], output: &Path) -> Result<()> {
    let mut loaded = Vec::with_capacity(sources.len());
    for path in sources {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        // Same-named files from different directories fall back to the full path.
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|stem| !loaded.iter().any(|l: &LegacySource| &l.name == stem))
            .unwrap_or_else(|| path.display().to_string());
        loaded.push(
            LegacySource::from_json(name, &raw)
                .with_context(|| format!("failed to parse {}", path.display()))?,
        );
    }

    let migration = migrate(&loaded, chrono::Utc::now())?;
    std::fs::write(output, migration.snapshot.to_json()?)
        .with_context(|| format!("failed to write {}", output.display()))?;

    let report = &migration.report;
    println!(
        "migrated {}/{} tasks ({:.1}%) into {}",
        report.migrated,
        report.total,
        report.success_rate(),
        output.display()
    );
    for issue in &report.renamed {
        println!("  renamed  {}:{} {}", issue.source, issue.task, issue.detail);
    }
    for issue in &report.dropped_references {
        println!("  dropped  {}:{} {}", issue.source, issue.task, issue.detail);
    }
    for issue in &report.failed {
        println!("  failed   {}:{} {}", issue.source, issue.task, issue.detail);
    }
    Ok(())
}

fn status(config: CoordinatorConfig, path: &Path, json: bool) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let snapshot = Snapshot::from_json(&raw)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut engine = Engine::new(
        clock.clone(),
        Arc::new(UlidGenerator::new(clock)),
        Arc::new(DefaultDecider::new(config.max_retries)),
        EngineLimits::from(&config),
    );
    engine.restore(snapshot)?;

    let report = engine.status_report();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &StatusReport) {
    let c = &report.counts;
    println!("state: {:?}", report.state);
    println!(
        "tasks: {} total | {} pending | {} blocked | {} assigned | {} in progress | {} completed | {} failed | {} on hold | {} cancelled",
        c.total(),
        c.pending,
        c.blocked,
        c.assigned,
        c.in_progress,
        c.completed,
        c.failed,
        c.on_hold,
        c.cancelled
    );
    for task in &report.tasks {
        let worker = task
            .assigned_worker
            .as_ref()
            .map(|w| format!(" @ {w}"))
            .unwrap_or_default();
        println!(
            "  {:<16} {:<12} {:<8} attempts={}{}",
            task.id.as_str(),
            task.status.to_string(),
            task.priority.to_string(),
            task.attempt_count,
            worker
        );
        if let Some(error) = &task.last_error {
            println!("  {:<16} last error: {error}", "");
        }
    }
    for worker in &report.workers {
        println!(
            "  worker {:<12} load {}/{} {:?}",
            worker.id.as_str(),
            worker.current_load,
            worker.capacity,
            worker.availability
        );
    }
}
