//! Runner (C5): one supervised subprocess, grounded on `runners.py`'s
//! `MPIRunner`/`MPIEnsembleRunner`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::mpi_command::{build_mpi_command, MpiLaunchSpec};
use crate::store::TaskStore;
use crate::task::{Task, TaskState};
use crate::worker_pool::Worker;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    /// nonzero retcode or signal (negative), with the message to attach.
    Error(String),
    Timeout,
}

/// A line emitted by the Ensemble program's stdout: `<uuid> <STATE> <msg>`.
fn parse_ensemble_line(line: &str) -> Option<(Uuid, String, String)> {
    let mut parts = line.splitn(3, ' ');
    let id = Uuid::parse_str(parts.next()?).ok()?;
    let state = parts.next()?.to_string();
    let msg = parts.next().unwrap_or("").to_string();
    Some((id, state, msg))
}

/// Optimistic-lock save: a conflict means another writer (commonly a
/// USER_KILLED request) already advanced this task, so dropping the
/// write here is correct rather than fatal to the runner.
async fn save_ignoring_conflict(store: &dyn TaskStore, task: &Task, expected_version: u64) -> anyhow::Result<()> {
    match store.compare_and_save(task, expected_version).await {
        Ok(()) => Ok(()),
        Err(crate::error::BalsamError::VersionConflict { task_id }) => {
            tracing::debug!(task = %task_id, "runner update lost race to a concurrent writer, dropping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

enum RunnerKind {
    MpiSingle { task_id: Uuid },
    Ensemble { task_ids: Vec<Uuid> },
}

/// One supervised subprocess: either a single MPI job or an MPI Ensemble
/// launch packing many serial tasks.
pub struct Runner {
    kind: RunnerKind,
    pub workers: Vec<Worker>,
    child: Child,
    stdout_lines: Arc<Mutex<Vec<String>>>,
    finished: bool,
    timed_out: bool,
}

impl Runner {
    pub fn running_task_ids(&self) -> Vec<Uuid> {
        match &self.kind {
            RunnerKind::MpiSingle { task_id } => vec![*task_id],
            RunnerKind::Ensemble { task_ids } => task_ids.clone(),
        }
    }

    /// Launches exactly one task via the MPI Command Builder; stdout/stderr
    /// redirected to `<workdir>/<name>.out`.
    pub async fn spawn_mpi_single(task: &Task, workers: Vec<Worker>, app_command: &str) -> anyhow::Result<Self> {
        let envs = task.get_envs(false, false);
        let spec = MpiLaunchSpec {
            workers: &workers,
            command: app_command,
            envs: &envs,
            num_ranks: task.resources.num_ranks().max(1),
            ranks_per_node: task.resources.ranks_per_node.max(1),
            threads_per_rank: task.resources.threads_per_rank.max(1),
            threads_per_core: task.resources.threads_per_core.max(1),
        };
        let argv = build_mpi_command(&spec);
        let out_path = task.work_dir().join(format!("{}.out", task.name));
        tokio::fs::create_dir_all(task.work_dir()).await?;
        let out_file = std::fs::File::create(&out_path)?;
        let err_file = out_file.try_clone()?;

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]).stdout(out_file).stderr(err_file);
        let child = cmd.spawn()?;

        Ok(Self {
            kind: RunnerKind::MpiSingle { task_id: task.id },
            workers,
            child,
            stdout_lines: Arc::new(Mutex::new(Vec::new())),
            finished: false,
            timed_out: false,
        })
    }

    /// Writes the manifest file (`<uuid> <workdir> <packing_count> <cmd>`
    /// per line) and launches the MPI Ensemble Dispatcher binary over
    /// `workers`.
    pub async fn spawn_ensemble(
        tasks: &[Task],
        workers: Vec<Worker>,
        ensemble_exe: &str,
        envs: &BTreeMap<String, String>,
    ) -> anyhow::Result<Self> {
        let manifest = tempfile::NamedTempFile::new()?;
        {
            use std::io::Write;
            let mut f = manifest.as_file();
            for t in tasks {
                writeln!(
                    f,
                    "{} {} {} {}",
                    t.id,
                    t.work_dir().display(),
                    t.resources.serial_node_packing_count.max(1),
                    t.resolve_work(None)
                )?;
            }
        }
        let manifest_path: PathBuf = manifest.path().to_path_buf();
        let spec = MpiLaunchSpec {
            workers: &workers,
            command: &format!("{} {}", ensemble_exe, manifest_path.display()),
            envs,
            num_ranks: workers.iter().map(|w| w.max_ranks_per_node * w.num_nodes).sum(),
            ranks_per_node: workers.first().map(|w| w.max_ranks_per_node).unwrap_or(1),
            threads_per_rank: 1,
            threads_per_core: 1,
        };
        let argv = build_mpi_command(&spec);
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]).stdout(std::process::Stdio::piped()).stderr(std::process::Stdio::null());
        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stdout_lines = Arc::new(Mutex::new(Vec::new()));
        let lines_handle = stdout_lines.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                lines_handle.lock().await.push(line);
            }
        });

        // manifest file must outlive the process; leak the guard into the runner's lifetime
        std::mem::forget(manifest);

        Ok(Self {
            kind: RunnerKind::Ensemble { task_ids: tasks.iter().map(|t| t.id).collect() },
            workers,
            child,
            stdout_lines,
            finished: false,
            timed_out: false,
        })
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Polls the subprocess (non-blocking) and the ensemble's stdout
    /// monitor, applying state updates through `store`.
    pub async fn update_jobs(&mut self, store: &dyn TaskStore) -> anyhow::Result<bool> {
        let mut any_finished = false;

        match &self.kind {
            RunnerKind::Ensemble { .. } => {
                let lines: Vec<String> = {
                    let mut buf = self.stdout_lines.lock().await;
                    std::mem::take(&mut *buf)
                };
                for line in lines {
                    if let Some((id, state, msg)) = parse_ensemble_line(&line) {
                        if let Some(mut task) = store.load_task(id).await? {
                            let next = match state.as_str() {
                                "RUN_DONE" => Some(TaskState::RunDone),
                                "RUN_ERROR" => Some(TaskState::RunError),
                                "RUNNING" => Some(TaskState::Running),
                                _ => None,
                            };
                            if let Some(next) = next {
                                let expected_version = task.version;
                                task.set_state(next, &msg);
                                save_ignoring_conflict(store, &task, expected_version).await?;
                                any_finished = true;
                            }
                        }
                    }
                }
            }
            RunnerKind::MpiSingle { task_id } => {
                if let Some(status) = self.child.try_wait()? {
                    self.finished = true;
                    any_finished = true;
                    if let Some(mut task) = store.load_task(*task_id).await? {
                        let expected_version = task.version;
                        let outcome = classify_exit(status, self.timed_out);
                        apply_outcome(&mut task, outcome);
                        save_ignoring_conflict(store, &task, expected_version).await?;
                    }
                }
            }
        }

        if matches!(self.kind, RunnerKind::Ensemble { .. }) {
            if let Some(_status) = self.child.try_wait()? {
                self.finished = true;
            }
        }

        Ok(any_finished)
    }

    /// Sends SIGTERM and marks any still-RUNNING task of this runner RUN_TIMEOUT.
    pub async fn timeout(&mut self, store: &dyn TaskStore) -> anyhow::Result<()> {
        self.timed_out = true;
        if let Some(pid) = self.child.id() {
            unsafe {
                libc_kill(pid as i32, 15);
            }
        }
        for id in self.running_task_ids() {
            if let Some(mut task) = store.load_task(id).await? {
                if task.state == TaskState::Running {
                    let expected_version = task.version;
                    task.set_state(TaskState::RunTimeout, "runner timed out");
                    save_ignoring_conflict(store, &task, expected_version).await?;
                }
            }
        }
        Ok(())
    }
}

fn classify_exit(status: std::process::ExitStatus, timed_out: bool) -> JobOutcome {
    if timed_out {
        return JobOutcome::Timeout;
    }
    match status.code() {
        Some(0) => JobOutcome::Done,
        Some(code) => JobOutcome::Error(code.to_string()),
        None => JobOutcome::Error("killed by signal".to_string()),
    }
}

fn apply_outcome(task: &mut Task, outcome: JobOutcome) {
    match outcome {
        JobOutcome::Done => {
            task.set_state(TaskState::RunDone, "exit 0");
        }
        JobOutcome::Error(msg) => {
            task.set_state(TaskState::RunError, &msg);
        }
        JobOutcome::Timeout => {
            task.set_state(TaskState::RunTimeout, "timed out");
        }
    }
}

/// Minimal SIGTERM wrapper kept local rather than adding a `nix`/`libc`
/// dependency the rest of the workspace has no other use for.
unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    let _ = kill(pid, sig);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ensemble_status_line() {
        let (id, state, msg) = parse_ensemble_line(&format!("{} RUN_DONE 1.23", Uuid::nil())).unwrap();
        assert_eq!(id, Uuid::nil());
        assert_eq!(state, "RUN_DONE");
        assert_eq!(msg, "1.23");
    }

    #[test]
    fn apply_outcome_error_carries_message() {
        let mut t = crate::task::Task {
            id: Uuid::now_v7(),
            name: "t".into(),
            workflow: None,
            parents: vec![],
            wait_for_parents: false,
            resources: crate::task::ResourceDemand::default(),
            work: crate::task::WorkSpec::DirectCommand("true".into()),
            staging: crate::task::Staging::default(),
            environ_vars: String::new(),
            pre_script: None,
            post_script: None,
            post_error_handler: false,
            post_timeout_handler: false,
            auto_timeout_retry: false,
            state: TaskState::Running,
            state_history: String::new(),
            version: 0,
            work_root: std::env::temp_dir(),
        };
        apply_outcome(&mut t, JobOutcome::Error("255".into()));
        assert_eq!(t.state, TaskState::RunError);
        assert!(t.state_history.contains("255"));
    }
}
