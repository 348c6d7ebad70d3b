use std::sync::Arc;

use balsam_core::config::Config;
use balsam_core::runner_group::RunnerGroup;
use balsam_core::store::TaskStore;
use balsam_core::store_memory::MemoryStore;
use balsam_core::task::{ResourceDemand, Staging, Task, TaskState, WorkSpec};
use balsam_core::task_source::{SourceStrategy, TaskSource};
use balsam_core::transition_pool::TransitionPool;
use balsam_core::worker_pool::WorkerGroup;
use balsam_launcher::main_loop::{self, MainLoopDeps, ShutdownCoordinator};

fn task(name: &str, parents: Vec<uuid::Uuid>, wait_for_parents: bool) -> Task {
    Task {
        id: uuid::Uuid::now_v7(),
        name: name.into(),
        workflow: Some("dag".into()),
        parents,
        wait_for_parents,
        resources: ResourceDemand {
            num_nodes: 1,
            ranks_per_node: 1,
            threads_per_rank: 1,
            threads_per_core: 1,
            serial_node_packing_count: 1,
            // Kept well above any time budget in this file so get_runnable
            // never admits these tasks into a Runner; the test only drives
            // the store/dependency/transition-pool wiring, not subprocesses.
            wall_time_minutes: 10_000.0,
        },
        work: WorkSpec::DirectCommand("true".into()),
        staging: Staging::default(),
        environ_vars: String::new(),
        pre_script: None,
        post_script: None,
        post_error_handler: false,
        post_timeout_handler: false,
        auto_timeout_retry: false,
        state: TaskState::Created,
        state_history: String::new(),
        version: 0,
        work_root: std::env::temp_dir(),
    }
}

/// A (no parents) and B (parents=[A], wait_for_parents=true): B must stay
/// gated in AWAITING_PARENTS while A is independently staged/preprocessed.
#[tokio::test]
async fn child_waits_for_parent_while_parent_stages_independently() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let a = task("a", vec![], false);
    let b = task("b", vec![a.id], true);
    store.save_task(&a).await.unwrap();
    store.save_task(&b).await.unwrap();

    let config = Config { time_limit_minutes: 0.02, ..Config::default() };
    let source = TaskSource::new(store.clone(), SourceStrategy::Workflow("dag".into()));
    let transition_pool = TransitionPool::new(store.clone(), 2);
    let runner_group = RunnerGroup::new(config.max_concurrent_runners);
    let workers = WorkerGroup::setup_default(1, 4);
    let shutdown = ShutdownCoordinator::default();

    let mut deps = MainLoopDeps {
        store: store.clone(),
        source,
        transition_pool,
        runner_group,
        workers,
        config,
        ensemble_exe: "balsam-mpi-ensemble".into(),
    };

    // time_limit_minutes is small enough that the loop exits on its own
    // once the wall-time budget is exhausted.
    main_loop::run(&mut deps, shutdown).await.unwrap();

    let a_after = store.load_task(a.id).await.unwrap().unwrap();
    let b_after = store.load_task(b.id).await.unwrap().unwrap();

    assert!(
        matches!(a_after.state, TaskState::StagedIn | TaskState::Preprocessed),
        "parent with no dependencies should progress past CREATED, got {:?}",
        a_after.state
    );
    assert_eq!(
        b_after.state,
        TaskState::AwaitingParents,
        "child must stay gated until its parent reaches JOB_FINISHED"
    );
    assert!(b_after.state_history.contains("parents"));

    main_loop::on_exit(store.as_ref(), &mut deps.runner_group, &mut deps.workers, deps.transition_pool)
        .await
        .unwrap();
}

/// Once a parent is manually driven to JOB_FINISHED, the next tick should
/// flip the child out of AWAITING_PARENTS and on into the transition table
/// (READY -> STAGED_IN), exercising the READY source state directly.
#[tokio::test]
async fn child_unblocks_once_parent_reaches_job_finished() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let a = task("a", vec![], false);
    let b = task("b", vec![a.id], true);
    store.save_task(&a).await.unwrap();
    store.save_task(&b).await.unwrap();

    let mut a_done = a.clone();
    a_done.set_state(TaskState::JobFinished, "test fixture: pre-finished");
    store.save_task(&a_done).await.unwrap();

    let config = Config { time_limit_minutes: 0.02, ..Config::default() };
    let source = TaskSource::new(store.clone(), SourceStrategy::Workflow("dag".into()));
    let transition_pool = TransitionPool::new(store.clone(), 2);
    let runner_group = RunnerGroup::new(config.max_concurrent_runners);
    let workers = WorkerGroup::setup_default(1, 4);
    let shutdown = ShutdownCoordinator::default();

    let mut deps = MainLoopDeps {
        store: store.clone(),
        source,
        transition_pool,
        runner_group,
        workers,
        config,
        ensemble_exe: "balsam-mpi-ensemble".into(),
    };

    main_loop::run(&mut deps, shutdown).await.unwrap();

    let b_after = store.load_task(b.id).await.unwrap().unwrap();
    assert!(
        matches!(b_after.state, TaskState::Ready | TaskState::StagedIn | TaskState::Preprocessed),
        "child should leave AWAITING_PARENTS once its parent is JOB_FINISHED, got {:?}",
        b_after.state
    );

    main_loop::on_exit(store.as_ref(), &mut deps.runner_group, &mut deps.workers, deps.transition_pool)
        .await
        .unwrap();
}

/// A task found in RUNNING at launcher start is assumed orphaned by a
/// crashed prior launcher and flipped to RESTART_READY.
#[tokio::test]
async fn crash_recovery_marks_orphaned_running_task_restart_ready() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let mut orphan = task("orphan", vec![], false);
    orphan.set_state(TaskState::Running, "pretend a prior launcher started this");
    store.save_task(&orphan).await.unwrap();

    main_loop::detect_dead_runners(store.as_ref()).await.unwrap();

    let after = store.load_task(orphan.id).await.unwrap().unwrap();
    assert_eq!(after.state, TaskState::RestartReady);
    assert!(after.state_history.contains("Detected dead runner"));
}
