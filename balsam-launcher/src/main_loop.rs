//! Main Loop (C8), grounded on `launcher.py`'s `main()`/`create_runner`/
//! `on_exit`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use balsam_core::config::Config;
use balsam_core::runner_group::RunnerGroup;
use balsam_core::store::TaskStore;
use balsam_core::task::TaskState;
use balsam_core::task_source::TaskSource;
use balsam_core::transition_pool::TransitionPool;
use balsam_core::worker_pool::WorkerGroup;

/// Idempotent shutdown flag: signal handlers and the main loop both check
/// it rather than running cleanup more than once.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    flag: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// A bounded delay generator: progressive backoff, capped, reset to the
/// floor whenever the loop makes progress.
struct DelaySleeper {
    floor_ms: u64,
    cap_ms: u64,
    current_ms: u64,
}

impl DelaySleeper {
    fn new() -> Self {
        Self { floor_ms: 100, cap_ms: 2000, current_ms: 100 }
    }

    async fn tick(&mut self, made_progress: bool) {
        if made_progress {
            self.current_ms = self.floor_ms;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(self.current_ms)).await;
        self.current_ms = (self.current_ms * 2).min(self.cap_ms);
    }
}

fn remaining_minutes(start: Instant, limit_minutes: f64) -> f64 {
    if limit_minutes <= 0.0 {
        return f64::MAX;
    }
    let elapsed_min = start.elapsed().as_secs_f64() / 60.0;
    (limit_minutes - elapsed_min).max(0.0)
}

/// Every task found in `RUNNING` at start is assumed orphaned by a crashed
/// prior launcher and flipped to `RESTART_READY`.
pub async fn detect_dead_runners(store: &dyn TaskStore) -> anyhow::Result<()> {
    let running = store.by_states(&[TaskState::Running]).await?;
    for mut task in running {
        tracing::info!(task = %task.cute_id(), "detected dead runner, marking RESTART_READY");
        let expected_version = task.version;
        task.set_state(TaskState::RestartReady, "Detected dead runner");
        save_ignoring_conflict(store, &task, expected_version).await?;
    }
    Ok(())
}

async fn check_parents(store: &dyn TaskStore, task_id: uuid::Uuid) -> anyhow::Result<()> {
    let Some(mut task) = store.load_task(task_id).await? else { return Ok(()) };
    let parents = store.by_ids(&task.parents).await?;
    let ready = parents.iter().all(|p| p.state == TaskState::JobFinished);

    if ready || !task.wait_for_parents {
        let expected_version = task.version;
        task.set_state(TaskState::Ready, "dependencies satisfied");
        save_ignoring_conflict(store, &task, expected_version).await?;
    } else if task.state != TaskState::AwaitingParents {
        let msg = format!("{} parents", parents.len());
        let expected_version = task.version;
        task.set_state(TaskState::AwaitingParents, &msg);
        save_ignoring_conflict(store, &task, expected_version).await?;
    }
    Ok(())
}

/// Optimistic-lock save: a conflict means another writer already advanced
/// this task (e.g. to USER_KILLED), so dropping the write is correct here
/// rather than treated as a loop-ending error.
async fn save_ignoring_conflict(store: &dyn TaskStore, task: &balsam_core::task::Task, expected_version: u64) -> anyhow::Result<()> {
    match store.compare_and_save(task, expected_version).await {
        Ok(()) => Ok(()),
        Err(balsam_core::error::BalsamError::VersionConflict { task_id }) => {
            tracing::debug!(task = %task_id, "dependency update lost race to a concurrent writer, dropping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Throttle for runner creation: don't spawn an Ensemble Runner
/// too eagerly while more serial tasks are still staging/preprocessing,
/// unless enough time has passed or the ensemble is already saturated.
async fn should_create_runner(
    source: &TaskSource,
    runnable: &[balsam_core::task::Task],
    workers: &WorkerGroup,
    last_runner_created: Instant,
    config: &Config,
) -> anyhow::Result<bool> {
    if runnable.is_empty() {
        return Ok(false);
    }
    let almost_runnable = source.almost_runnable_exists().await?;
    let runner_ready = last_runner_created.elapsed() > config.runner_creation_period;

    let num_serial = runnable
        .iter()
        .filter(|t| t.resources.num_nodes == 1 && t.resources.ranks_per_node == 1)
        .count() as u32;
    let max_rpn = workers.workers.first().map(|w| w.max_ranks_per_node).unwrap_or(1);
    let total_nodes: u32 = workers.workers.iter().map(|w| w.num_nodes).sum();
    let max_serial_per_ensemble = 2 * total_nodes * max_rpn;
    let ensemble_ready = num_serial >= max_serial_per_ensemble || num_serial == 0;

    Ok(runner_ready || !almost_runnable || ensemble_ready)
}

pub struct MainLoopDeps {
    pub store: Arc<dyn TaskStore>,
    pub source: TaskSource,
    pub transition_pool: TransitionPool,
    pub runner_group: RunnerGroup,
    pub workers: WorkerGroup,
    pub config: Config,
    pub ensemble_exe: String,
}

/// Runs the service loop until all tasks reach an END state, the wall-time
/// budget is exhausted, or shutdown is requested.
pub async fn run(deps: &mut MainLoopDeps, shutdown: ShutdownCoordinator) -> anyhow::Result<()> {
    let start = Instant::now();
    let mut last_runner_created = Instant::now() - deps.config.runner_creation_period;
    let mut sleeper = DelaySleeper::new();

    loop {
        if shutdown.requested() {
            tracing::info!("shutdown requested, leaving main loop");
            break;
        }

        let minutes_left = remaining_minutes(start, deps.config.time_limit_minutes);
        if minutes_left <= 0.0 {
            tracing::info!("wall-time budget exhausted, leaving main loop");
            break;
        }

        let mut progress = false;

        let statuses = deps.transition_pool.get_statuses().await;
        if !statuses.is_empty() {
            progress = true;
        }

        let waiting = deps.source.by_states(balsam_core::task::TaskState::WAITING_STATES).await?;
        for task in &waiting {
            check_parents(deps.store.as_ref(), task.id).await?;
        }

        let transition_sources = deps.source.by_states(balsam_core::task::TaskState::TRANSITION_SOURCE_STATES).await?;
        let queued = deps.transition_pool.transitions_pk_list().await;
        for task in transition_sources {
            if !queued.contains(&task.id) {
                tracing::info!(task = %task.cute_id(), state = task.state.as_str(), "queued transition");
                deps.transition_pool.add_job(task.id, task.state).await;
                progress = true;
            }
        }

        let any_finished = deps
            .runner_group
            .update_and_remove_finished(deps.store.as_ref(), &mut deps.workers, false)
            .await?;
        if any_finished {
            progress = true;
        }

        let runnable = deps.source.get_runnable(minutes_left, false).await?;
        let running = deps.runner_group.running_task_ids();
        let runnable: Vec<_> = runnable.into_iter().filter(|t| !running.contains(&t.id)).collect();

        if should_create_runner(&deps.source, &runnable, &deps.workers, last_runner_created, &deps.config).await? {
            match deps
                .runner_group
                .create_next_runner(&runnable, &mut deps.workers, deps.config.nodes_per_worker, &deps.ensemble_exe)
                .await
            {
                Ok(()) => {
                    last_runner_created = Instant::now();
                    progress = true;
                }
                Err(balsam_core::error::BalsamError::ExceededMaxRunners(n)) => {
                    tracing::info!(max = n, "exceeded max concurrent runners; waiting");
                }
                Err(balsam_core::error::BalsamError::NoAvailableWorkers) => {
                    tracing::info!("not enough idle workers to start any new runs");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let all_tasks = deps.source.all().await?;
        if !all_tasks.is_empty() && all_tasks.iter().all(|t| t.state.is_end()) {
            tracing::info!("no tasks to process, exiting main loop");
            break;
        }

        sleeper.tick(progress).await;
    }

    Ok(())
}

/// Exit cleanup: drains in-flight runners with a timeout,
/// then ends the transition pool. Safe to call once; the caller is
/// responsible for checking `ShutdownCoordinator` first.
pub async fn on_exit(
    store: &dyn TaskStore,
    runner_group: &mut RunnerGroup,
    workers: &mut WorkerGroup,
    transition_pool: TransitionPool,
) -> anyhow::Result<()> {
    tracing::debug!("on_exit: timing out runner group");
    runner_group.update_and_remove_finished(store, workers, true).await?;

    tracing::debug!("on_exit: ending transition pool");
    transition_pool.end_and_wait().await;

    tracing::info!("launcher exit graceful");
    Ok(())
}
