//! Task entity and the Balsam state machine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every label a task's `state` field may take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    LauncherQueued,
    AwaitingParents,
    Ready,
    StagedIn,
    Preprocessed,
    Running,
    RunDone,
    RunError,
    RunTimeout,
    RestartReady,
    Postprocessed,
    JobFinished,
    Failed,
    UserKilled,
    ParentKilled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::LauncherQueued => "LAUNCHER_QUEUED",
            TaskState::AwaitingParents => "AWAITING_PARENTS",
            TaskState::Ready => "READY",
            TaskState::StagedIn => "STAGED_IN",
            TaskState::Preprocessed => "PREPROCESSED",
            TaskState::Running => "RUNNING",
            TaskState::RunDone => "RUN_DONE",
            TaskState::RunError => "RUN_ERROR",
            TaskState::RunTimeout => "RUN_TIMEOUT",
            TaskState::RestartReady => "RESTART_READY",
            TaskState::Postprocessed => "POSTPROCESSED",
            TaskState::JobFinished => "JOB_FINISHED",
            TaskState::Failed => "FAILED",
            TaskState::UserKilled => "USER_KILLED",
            TaskState::ParentKilled => "PARENT_KILLED",
        }
    }

    /// States from which a runner still has a subprocess in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    /// States handled by the Transition Pool.
    pub fn is_processable(&self) -> bool {
        matches!(
            self,
            TaskState::Created
                | TaskState::LauncherQueued
                | TaskState::StagedIn
                | TaskState::RunDone
                | TaskState::Postprocessed
                | TaskState::RunTimeout
                | TaskState::RunError
        )
    }

    /// States eligible for the next Runner.
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskState::Preprocessed | TaskState::RestartReady)
    }

    /// Terminal states: no further transition is expected.
    pub fn is_end(&self) -> bool {
        matches!(
            self,
            TaskState::JobFinished
                | TaskState::Failed
                | TaskState::UserKilled
                | TaskState::ParentKilled
        )
    }

    /// `USER_KILLED` is the sole absorbing state.
    pub fn is_absorbing(&self) -> bool {
        matches!(self, TaskState::UserKilled)
    }

    pub const WAITING_STATES: &'static [TaskState] =
        &[TaskState::Created, TaskState::LauncherQueued, TaskState::AwaitingParents];

    pub const TRANSITION_SOURCE_STATES: &'static [TaskState] = &[
        TaskState::Created,
        TaskState::LauncherQueued,
        TaskState::Ready,
        TaskState::StagedIn,
        TaskState::RunDone,
        TaskState::Postprocessed,
        TaskState::RunTimeout,
        TaskState::RunError,
    ];

    pub const RUNNABLE_STATES: &'static [TaskState] =
        &[TaskState::Preprocessed, TaskState::RestartReady];

    pub const END_STATES: &'static [TaskState] = &[
        TaskState::JobFinished,
        TaskState::Failed,
        TaskState::UserKilled,
        TaskState::ParentKilled,
    ];

    /// Tasks not yet runnable but whose predecessor is actively preparing them —
    /// used by admission to decide whether waiting a tick is worthwhile.
    pub const ALMOST_RUNNABLE_STATES: &'static [TaskState] =
        &[TaskState::StagedIn, TaskState::Created, TaskState::LauncherQueued, TaskState::Ready];
}

/// Either a named application (resolved through `ApplicationDefinition`) or a
/// direct command string.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkSpec {
    Application { name: String, args: String },
    DirectCommand(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Staging {
    pub stage_in_url: Option<String>,
    pub input_globs: Vec<String>,
    pub stage_out_url: Option<String>,
    pub stage_out_globs: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceDemand {
    pub num_nodes: u32,
    pub ranks_per_node: u32,
    pub threads_per_rank: u32,
    pub threads_per_core: u32,
    pub serial_node_packing_count: u32,
    pub wall_time_minutes: f64,
}

impl ResourceDemand {
    pub fn num_ranks(&self) -> u32 {
        self.num_nodes * self.ranks_per_node
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub workflow: Option<String>,

    pub parents: Vec<Uuid>,
    pub wait_for_parents: bool,

    pub resources: ResourceDemand,
    pub work: WorkSpec,
    pub staging: Staging,

    /// Colon-separated `K=V` pairs, parsed lazily by `get_envs`.
    pub environ_vars: String,
    pub pre_script: Option<String>,
    pub post_script: Option<String>,
    pub post_error_handler: bool,
    pub post_timeout_handler: bool,
    pub auto_timeout_retry: bool,

    pub state: TaskState,
    pub state_history: String,

    /// Optimistic-lock counter; incremented on every successful save.
    pub version: u64,

    pub work_root: PathBuf,
}

impl Task {
    /// Working directory is a pure function of (work root, workflow, name, id).
    pub fn work_dir(&self) -> PathBuf {
        let wf = self.workflow.as_deref().unwrap_or("none");
        self.work_root
            .join(wf)
            .join(format!("{}_{}", self.name, self.id))
    }

    /// `[<name> | <uuid8>]`, used in every log line (glossary: Cute ID).
    pub fn cute_id(&self) -> String {
        format!("[{} | {}]", self.name, &self.id.to_string()[..8])
    }

    /// Append one history line with a monotonic timestamp.
    pub fn append_history(&mut self, state: TaskState, message: &str) {
        let line = format!("[{} {}] {}\n", Utc::now().to_rfc3339(), state.as_str(), message);
        self.state_history.push_str(&line);
    }

    /// Transition to `new_state`, honoring the `USER_KILLED` absorbing invariant.
    /// Returns `false` without effect if the current state is absorbing.
    pub fn set_state(&mut self, new_state: TaskState, message: &str) -> bool {
        if self.state.is_absorbing() && new_state != TaskState::UserKilled {
            return false;
        }
        self.state = new_state;
        self.append_history(new_state, message);
        self.version += 1;
        true
    }

    /// Resolves the command line, falling back to the application's defaults
    /// when the task itself doesn't override pre/post scripts.
    pub fn resolve_work(&self, app: Option<&ApplicationDefinition>) -> String {
        match &self.work {
            WorkSpec::DirectCommand(cmd) => shellexpand_user(cmd),
            WorkSpec::Application { name, args } => {
                let exe = app
                    .filter(|a| &a.name == name)
                    .map(|a| a.executable.clone())
                    .unwrap_or_else(|| name.clone());
                shellexpand_user(&format!("{} {}", exe, args))
            }
        }
    }

    pub fn pre_script_or_default(&self, app: Option<&ApplicationDefinition>) -> Option<String> {
        self.pre_script
            .clone()
            .or_else(|| app.and_then(|a| a.default_preprocess.clone()))
    }

    pub fn post_script_or_default(&self, app: Option<&ApplicationDefinition>) -> Option<String> {
        self.post_script
            .clone()
            .or_else(|| app.and_then(|a| a.default_postprocess.clone()))
    }

    /// Environment construction: `BALSAM`/`DJANGO`/`PYTHON` prefixed
    /// process vars, overlaid with the task's own `environ_vars`, plus the
    /// injected job-identity and conditional flags.
    pub fn get_envs(&self, timeout: bool, error: bool) -> BTreeMap<String, String> {
        const ENV_PREFIXES_TO_PASS_ON: &[&str] = &["BALSAM", "DJANGO", "PYTHON"];

        let mut envs: BTreeMap<String, String> = std::env::vars()
            .filter(|(k, _)| ENV_PREFIXES_TO_PASS_ON.iter().any(|p| k.contains(p)))
            .collect();

        for (k, v) in parse_envstring(&self.environ_vars) {
            envs.insert(k, v);
        }

        envs.insert("BALSAM_JOB_ID".into(), self.id.to_string());
        envs.insert(
            "BALSAM_PARENT_IDS".into(),
            self.parents.iter().map(Uuid::to_string).collect::<Vec<_>>().join(":"),
        );

        if self.resources.threads_per_rank > 1 {
            envs.insert("OMP_NUM_THREADS".into(), self.resources.threads_per_rank.to_string());
        }
        if timeout {
            envs.insert("BALSAM_JOB_TIMEOUT".into(), "TRUE".into());
        }
        if error {
            envs.insert("BALSAM_JOB_ERROR".into(), "TRUE".into());
        }
        envs
    }
}

/// Parses `"K1=V1:K2=V2"` into a map; malformed segments are skipped.
fn parse_envstring(s: &str) -> BTreeMap<String, String> {
    s.split(':')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn shellexpand_user(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            if let Some(rest) = word.strip_prefix('~') {
                if let Some(home) = std::env::var_os("HOME") {
                    return format!("{}{}", home.to_string_lossy(), rest);
                }
            }
            word.to_string()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplicationDefinition {
    pub name: String,
    pub executable: String,
    pub default_preprocess: Option<String>,
    pub default_postprocess: Option<String>,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            id: Uuid::now_v7(),
            name: "sim".into(),
            workflow: Some("demo".into()),
            parents: vec![],
            wait_for_parents: true,
            resources: ResourceDemand {
                num_nodes: 1,
                ranks_per_node: 1,
                threads_per_rank: 1,
                threads_per_core: 1,
                serial_node_packing_count: 1,
                wall_time_minutes: 10.0,
            },
            work: WorkSpec::DirectCommand("echo hi".into()),
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
            work_root: PathBuf::from("/tmp/balsam"),
        }
    }

    #[test]
    fn state_groupings_are_disjoint() {
        use TaskState::*;
        let all = [
            Created, LauncherQueued, AwaitingParents, Ready, StagedIn, Preprocessed, Running,
            RunDone, RunError, RunTimeout, RestartReady, Postprocessed, JobFinished, Failed,
            UserKilled, ParentKilled,
        ];
        for s in all {
            let flags = [s.is_active(), s.is_processable(), s.is_runnable(), s.is_end()];
            let count = flags.iter().filter(|b| **b).count();
            assert!(count <= 1, "state {:?} belongs to more than one grouping", s);
        }
    }

    #[test]
    fn user_killed_is_absorbing() {
        let mut t = sample_task();
        t.set_state(TaskState::Running, "started");
        t.set_state(TaskState::UserKilled, "killed by user");
        let applied = t.set_state(TaskState::RunDone, "late completion");
        assert!(!applied);
        assert_eq!(t.state, TaskState::UserKilled);
    }

    #[test]
    fn history_is_append_only_and_versioned() {
        let mut t = sample_task();
        t.set_state(TaskState::Ready, "deps satisfied");
        t.set_state(TaskState::StagedIn, "staged");
        assert_eq!(t.version, 2);
        assert_eq!(t.state_history.lines().count(), 2);
    }

    #[test]
    fn get_envs_injects_job_identity() {
        let t = sample_task();
        let envs = t.get_envs(false, false);
        assert_eq!(envs.get("BALSAM_JOB_ID").unwrap(), &t.id.to_string());
        assert!(!envs.contains_key("OMP_NUM_THREADS"));
    }

    #[test]
    fn get_envs_sets_omp_threads_when_multithreaded() {
        let mut t = sample_task();
        t.resources.threads_per_rank = 4;
        let envs = t.get_envs(false, false);
        assert_eq!(envs.get("OMP_NUM_THREADS").unwrap(), "4");
    }

    #[test]
    fn work_dir_is_pure_function_of_identity() {
        let t = sample_task();
        let expected = t.work_root.join("demo").join(format!("sim_{}", t.id));
        assert_eq!(t.work_dir(), expected);
    }
}
