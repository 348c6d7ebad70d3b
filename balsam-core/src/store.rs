use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{BalsamError, Result};
use crate::task::{ApplicationDefinition, Task, TaskState};

/// Persistence trait for all Task state.
///
/// The Launcher operates exclusively through this trait, so the store
/// backend (in-memory for tests, Postgres for production, or an sqlite
/// single-writer proxy) is pluggable.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_task(&self, task: &Task) -> Result<()>;
    async fn load_task(&self, id: Uuid) -> Result<Option<Task>>;
    async fn delete_task(&self, id: Uuid) -> Result<()>;

    async fn by_states(&self, states: &[TaskState]) -> Result<Vec<Task>>;
    async fn by_workflow(&self, workflow: &str) -> Result<Vec<Task>>;
    async fn by_ids(&self, ids: &[Uuid]) -> Result<Vec<Task>>;
    async fn all(&self) -> Result<Vec<Task>>;

    /// Tasks in the RUNNABLE group with `wall_time_minutes <= minutes_left`,
    /// optionally restricted to serial (`num_nodes==1 && ranks_per_node==1`).
    async fn get_runnable(&self, minutes_left: f64, serial_only: bool) -> Result<Vec<Task>>;

    /// Optimistic-lock save honoring the `USER_KILLED` absorbing-state rule.
    /// A version mismatch against an already-`USER_KILLED` row is silently
    /// dropped rather than erroring, unless the write itself targets
    /// `USER_KILLED`; any other version mismatch returns `VersionConflict`.
    async fn compare_and_save(&self, task: &Task, expected_version: u64) -> Result<()>;

    /// Single UPDATE skipping any row currently in `USER_KILLED`.
    async fn batch_update_state(&self, ids: &[Uuid], new_state: TaskState, msg: &str) -> Result<()>;

    async fn save_application(&self, app: &ApplicationDefinition) -> Result<()>;
    async fn load_application(&self, name: &str) -> Result<Option<ApplicationDefinition>>;
}

pub(crate) fn version_conflict(task_id: Uuid) -> BalsamError {
    BalsamError::VersionConflict { task_id }
}
