use std::path::PathBuf;
use std::sync::Arc;

use balsam_core::config::Config;
use balsam_core::runner_group::RunnerGroup;
use balsam_core::store::TaskStore;
use balsam_core::store_memory::MemoryStore;
use balsam_core::task_source::{SourceStrategy, TaskSource};
use balsam_core::transition_pool::TransitionPool;
use balsam_core::worker_pool::WorkerGroup;
use balsam_launcher::main_loop::{self, MainLoopDeps, ShutdownCoordinator};
use clap::{ArgGroup, Parser};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Start Balsam Job Launcher.
#[derive(Parser, Debug)]
#[command(name = "balsam-launcher", author, version, about, long_about = None)]
#[command(group(ArgGroup::new("source").required(true).args(["consume_all", "wf_name", "job_file"])))]
struct Cli {
    /// Continuously run all tasks from the store
    #[arg(long)]
    consume_all: bool,

    /// Continuously run tasks of the specified workflow
    #[arg(long, value_name = "NAME")]
    wf_name: Option<String>,

    /// File of Balsam task UUIDs
    #[arg(long, value_name = "PATH")]
    job_file: Option<PathBuf>,

    /// DEFAULT host only: defaults to 0 (use outer scheduler's node count)
    #[arg(long, default_value_t = 0)]
    num_workers: u32,

    /// BG/Q only: number of nodes per sub-block
    #[arg(long, default_value_t = 1)]
    nodes_per_worker: u32,

    /// For non-MPI tasks, how many to pack per worker
    #[arg(long, default_value_t = 4)]
    max_ranks_per_node: u32,

    /// Wall-time limit in minutes; 0 means inherit from the allocation
    #[arg(long, default_value_t = 0.0)]
    time_limit_minutes: f64,

    #[arg(long)]
    daemon: bool,

    /// Postgres connection string; falls back to DATABASE_URL, then MemoryStore
    #[arg(long)]
    database_url: Option<String>,

    /// Path to the balsam-mpi-ensemble binary
    #[arg(long, default_value = "balsam-mpi-ensemble")]
    ensemble_exe: String,
}

fn parse_job_file(path: &PathBuf) -> anyhow::Result<Vec<Uuid>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| Ok(Uuid::parse_str(l)?))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let database_url = cli.database_url.clone().or_else(|| std::env::var("DATABASE_URL").ok());
    let store: Arc<dyn TaskStore> = match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to PostgreSQL");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = balsam_core::store_postgres::PostgresTaskStore::new(pool);
            pg.migrate().await?;
            tracing::info!("using PostgresTaskStore (migrations applied)");
            if std::env::var("BALSAM_MIGRATE_ONLY").is_ok() {
                tracing::info!("BALSAM_MIGRATE_ONLY set, exiting after migration");
                return Ok(());
            }
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("--database-url set but postgres feature not enabled, using MemoryStore");
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("using MemoryStore (no database URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let strategy = if cli.consume_all {
        SourceStrategy::ConsumeAll
    } else if let Some(wf) = &cli.wf_name {
        SourceStrategy::Workflow(wf.clone())
    } else if let Some(path) = &cli.job_file {
        SourceStrategy::File(parse_job_file(path)?)
    } else {
        unreachable!("clap ArgGroup enforces exactly one source flag")
    };

    let config = Config {
        num_workers: cli.num_workers,
        nodes_per_worker: cli.nodes_per_worker,
        max_ranks_per_node: cli.max_ranks_per_node,
        time_limit_minutes: cli.time_limit_minutes,
        daemon: cli.daemon,
        ..Config::default()
    }
    .with_env_overrides();

    let workers = WorkerGroup::setup_default(
        if config.num_workers > 0 { config.num_workers } else { 1 },
        config.max_ranks_per_node,
    );

    main_loop::detect_dead_runners(store.as_ref()).await?;

    let source = TaskSource::new(store.clone(), strategy);
    let transition_pool = TransitionPool::new(store.clone(), 4);
    let runner_group = RunnerGroup::new(config.max_concurrent_runners);

    let shutdown = ShutdownCoordinator::default();
    spawn_signal_handlers(shutdown.clone());

    let mut deps = MainLoopDeps {
        store: store.clone(),
        source,
        transition_pool,
        runner_group,
        workers,
        config,
        ensemble_exe: cli.ensemble_exe,
    };

    main_loop::run(&mut deps, shutdown).await?;

    main_loop::on_exit(store.as_ref(), &mut deps.runner_group, &mut deps.workers, deps.transition_pool).await?;

    Ok(())
}

/// Installs SIGINT/SIGTERM/SIGHUP handlers that set the shutdown flag.
/// Handlers only flip an atomic; the main loop checks it.
fn spawn_signal_handlers(shutdown: ShutdownCoordinator) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("install SIGHUP handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
        }
        tracing::info!("received shutdown signal");
        shutdown.request();
    });
}
