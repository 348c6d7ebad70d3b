//! Transition Pool (C4): a bounded set of worker tasks executing per-task
//! lifecycle steps that may block on I/O (file staging, pre/post scripts),
//! off the main loop.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::Result;
use crate::store::TaskStore;
use crate::task::{Task, TaskState};

#[derive(Debug)]
pub enum WorkItem {
    Job(Uuid, TaskState),
    End,
}

pub struct TransitionResult {
    pub task_id: Uuid,
    pub ok: bool,
}

/// Transition table: `source_state -> success_state`, modulo the
/// branching outcomes of `handle_timeout`/`handle_error`.
fn success_state_for(source: TaskState) -> Option<TaskState> {
    use TaskState::*;
    match source {
        Created | LauncherQueued | Ready => Some(StagedIn),
        StagedIn => Some(Preprocessed),
        RunDone => Some(Postprocessed),
        Postprocessed => Some(JobFinished),
        RunTimeout | RunError => None, // branches; resolved in handle_timeout/handle_error
        _ => None,
    }
}

async fn run_stage_in(task: &Task) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(task.work_dir()).await?;
    Ok(())
}

async fn run_preprocess(task: &Task) -> anyhow::Result<()> {
    if let Some(script) = &task.pre_script {
        run_script(task, script).await?;
    }
    Ok(())
}

async fn run_postprocess(task: &Task, timeout: bool, error: bool) -> anyhow::Result<()> {
    if let Some(script) = &task.post_script {
        let envs = task.get_envs(timeout, error);
        let status = tokio::process::Command::new("/bin/bash")
            .arg("-c")
            .arg(script)
            .current_dir(task.work_dir())
            .envs(envs)
            .status()
            .await?;
        anyhow::ensure!(status.success(), "post script exited with {:?}", status.code());
    }
    Ok(())
}

async fn run_stage_out(task: &Task) -> anyhow::Result<()> {
    let _ = &task.staging.stage_out_globs;
    Ok(())
}

async fn run_script(task: &Task, script: &str) -> anyhow::Result<()> {
    let envs = task.get_envs(false, false);
    let status = tokio::process::Command::new("/bin/bash")
        .arg("-c")
        .arg(script)
        .current_dir(task.work_dir())
        .envs(envs)
        .status()
        .await?;
    anyhow::ensure!(status.success(), "script exited with {:?}", status.code());
    Ok(())
}

/// `handle_timeout`: post-timeout handler, else auto-retry, else `FAILED`.
fn resolve_timeout(task: &Task) -> TaskState {
    if task.post_timeout_handler {
        TaskState::Postprocessed
    } else if task.auto_timeout_retry {
        TaskState::RestartReady
    } else {
        TaskState::Failed
    }
}

/// `handle_error`: symmetric to `handle_timeout`.
fn resolve_error(task: &Task) -> TaskState {
    if task.post_error_handler {
        TaskState::Postprocessed
    } else if task.auto_timeout_retry {
        TaskState::RestartReady
    } else {
        TaskState::Failed
    }
}

async fn apply_transition(store: &dyn TaskStore, lock: &Mutex<()>, task_id: Uuid, source: TaskState) -> Result<()> {
    let Some(mut task) = store.load_task(task_id).await? else { return Ok(()) };
    if task.state != source {
        return Ok(());
    }

    let outcome: anyhow::Result<TaskState> = match source {
        TaskState::Created | TaskState::LauncherQueued | TaskState::Ready => {
            run_stage_in(&task).await.map(|_| TaskState::StagedIn)
        }
        TaskState::StagedIn => run_preprocess(&task).await.map(|_| TaskState::Preprocessed),
        TaskState::RunDone => run_postprocess(&task, false, false).await.map(|_| TaskState::Postprocessed),
        TaskState::Postprocessed => run_stage_out(&task).await.map(|_| TaskState::JobFinished),
        TaskState::RunTimeout => {
            let next = resolve_timeout(&task);
            run_postprocess(&task, true, false).await.map(|_| next)
        }
        TaskState::RunError => {
            let next = resolve_error(&task);
            run_postprocess(&task, false, true).await.map(|_| next)
        }
        other => Ok(success_state_for(other).unwrap_or(other)),
    };

    let _guard = lock.lock().await;
    let expected_version = task.version;
    match outcome {
        Ok(next) => {
            task.set_state(next, "transition complete");
        }
        Err(e) => {
            task.set_state(TaskState::Failed, &format!("transition error: {e}"));
        }
    }
    match store.compare_and_save(&task, expected_version).await {
        Ok(()) => Ok(()),
        Err(crate::error::BalsamError::VersionConflict { task_id }) => {
            tracing::debug!(task = %task_id, "transition lost race to a concurrent writer, dropping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Bounded pool of transition workers plus the lock shared with the main
/// loop for composite writes to a task's history.
pub struct TransitionPool {
    tx: mpsc::UnboundedSender<WorkItem>,
    results_rx: Mutex<mpsc::UnboundedReceiver<TransitionResult>>,
    pub lock: Arc<Mutex<()>>,
    handles: Vec<JoinHandle<()>>,
    queued: Arc<Mutex<Vec<Uuid>>>,
}

impl TransitionPool {
    pub fn new(store: Arc<dyn TaskStore>, num_workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<WorkItem>();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let lock = Arc::new(Mutex::new(()));
        let queued = Arc::new(Mutex::new(Vec::new()));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..num_workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                let store = store.clone();
                let lock = lock.clone();
                let results_tx = results_tx.clone();
                let queued = queued.clone();
                tokio::spawn(async move {
                    loop {
                        let item = { rx.lock().await.recv().await };
                        match item {
                            Some(WorkItem::Job(id, source)) => {
                                let ok = apply_transition(store.as_ref(), &lock, id, source).await.is_ok();
                                queued.lock().await.retain(|q| *q != id);
                                let _ = results_tx.send(TransitionResult { task_id: id, ok });
                            }
                            Some(WorkItem::End) | None => break,
                        }
                    }
                })
            })
            .collect();

        Self { tx, results_rx: Mutex::new(results_rx), lock, handles, queued }
    }

    pub async fn add_job(&self, task_id: Uuid, state: TaskState) {
        self.queued.lock().await.push(task_id);
        let _ = self.tx.send(WorkItem::Job(task_id, state));
    }

    pub async fn transitions_pk_list(&self) -> Vec<Uuid> {
        self.queued.lock().await.clone()
    }

    /// Drains all results currently available without blocking.
    pub async fn get_statuses(&self) -> Vec<TransitionResult> {
        let mut rx = self.results_rx.lock().await;
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    /// Send `End` to every worker and join them.
    pub async fn end_and_wait(self) {
        for _ in &self.handles {
            let _ = self.tx.send(WorkItem::End);
        }
        for h in self.handles {
            let _ = h.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use crate::task::{ResourceDemand, Staging, WorkSpec};
    use std::time::Duration;

    fn task(state: TaskState) -> Task {
        Task {
            id: Uuid::now_v7(),
            name: "t".into(),
            workflow: None,
            parents: vec![],
            wait_for_parents: false,
            resources: ResourceDemand {
                num_nodes: 1,
                ranks_per_node: 1,
                threads_per_rank: 1,
                threads_per_core: 1,
                serial_node_packing_count: 1,
                wall_time_minutes: 5.0,
            },
            work: WorkSpec::DirectCommand("true".into()),
            staging: Staging::default(),
            environ_vars: String::new(),
            pre_script: None,
            post_script: None,
            post_error_handler: false,
            post_timeout_handler: false,
            auto_timeout_retry: false,
            state,
            state_history: String::new(),
            version: 0,
            work_root: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn stage_in_transitions_to_staged_in() {
        let store = Arc::new(MemoryStore::new());
        let t = task(TaskState::Created);
        store.save_task(&t).await.unwrap();

        let pool = TransitionPool::new(store.clone(), 2);
        pool.add_job(t.id, TaskState::Created).await;

        let mut found = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !pool.get_statuses().await.is_empty() {
                found = true;
                break;
            }
        }
        assert!(found, "transition never completed");
        let updated = store.load_task(t.id).await.unwrap().unwrap();
        assert_eq!(updated.state, TaskState::StagedIn);
    }

    #[test]
    fn resolve_timeout_prefers_handler_over_retry() {
        let mut t = task(TaskState::RunTimeout);
        t.post_timeout_handler = true;
        t.auto_timeout_retry = true;
        assert_eq!(resolve_timeout(&t), TaskState::Postprocessed);
    }

    #[test]
    fn resolve_timeout_falls_back_to_failed() {
        let t = task(TaskState::RunTimeout);
        assert_eq!(resolve_timeout(&t), TaskState::Failed);
    }
}
