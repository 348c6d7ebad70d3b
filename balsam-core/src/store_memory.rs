use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{version_conflict, TaskStore};
use crate::task::{ApplicationDefinition, Task, TaskState};

struct Inner {
    tasks: HashMap<Uuid, Task>,
    applications: HashMap<String, ApplicationDefinition>,
}

/// In-memory `TaskStore` for tests and the non-database launcher mode.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                tasks: HashMap::new(),
                applications: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut w = self.inner.write().await;
        w.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_task(&self, id: Uuid) -> Result<Option<Task>> {
        let r = self.inner.read().await;
        Ok(r.tasks.get(&id).cloned())
    }

    async fn delete_task(&self, id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.tasks.remove(&id);
        Ok(())
    }

    async fn by_states(&self, states: &[TaskState]) -> Result<Vec<Task>> {
        let r = self.inner.read().await;
        Ok(r.tasks.values().filter(|t| states.contains(&t.state)).cloned().collect())
    }

    async fn by_workflow(&self, workflow: &str) -> Result<Vec<Task>> {
        let r = self.inner.read().await;
        Ok(r.tasks
            .values()
            .filter(|t| t.workflow.as_deref() == Some(workflow))
            .cloned()
            .collect())
    }

    async fn by_ids(&self, ids: &[Uuid]) -> Result<Vec<Task>> {
        let r = self.inner.read().await;
        Ok(ids.iter().filter_map(|id| r.tasks.get(id).cloned()).collect())
    }

    async fn all(&self) -> Result<Vec<Task>> {
        let r = self.inner.read().await;
        Ok(r.tasks.values().cloned().collect())
    }

    async fn get_runnable(&self, minutes_left: f64, serial_only: bool) -> Result<Vec<Task>> {
        let r = self.inner.read().await;
        let mut runnable: Vec<Task> = r
            .tasks
            .values()
            .filter(|t| TaskState::RUNNABLE_STATES.contains(&t.state))
            .filter(|t| t.resources.wall_time_minutes <= minutes_left)
            .filter(|t| !serial_only || (t.resources.num_nodes == 1 && t.resources.ranks_per_node == 1))
            .cloned()
            .collect();
        if serial_only {
            runnable.sort_by(|a, b| b.resources.serial_node_packing_count.cmp(&a.resources.serial_node_packing_count));
        }
        Ok(runnable)
    }

    async fn compare_and_save(&self, task: &Task, expected_version: u64) -> Result<()> {
        let mut w = self.inner.write().await;
        match w.tasks.get(&task.id) {
            Some(current) if current.version != expected_version => {
                if current.state.is_absorbing() && task.state != TaskState::UserKilled {
                    return Ok(());
                }
                if current.state.is_absorbing() && task.state == TaskState::UserKilled {
                    w.tasks.insert(task.id, task.clone());
                    return Ok(());
                }
                Err(version_conflict(task.id))
            }
            _ => {
                w.tasks.insert(task.id, task.clone());
                Ok(())
            }
        }
    }

    async fn batch_update_state(&self, ids: &[Uuid], new_state: TaskState, msg: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        for id in ids {
            if let Some(task) = w.tasks.get_mut(id) {
                if task.state != TaskState::UserKilled {
                    task.set_state(new_state, msg);
                }
            }
        }
        Ok(())
    }

    async fn save_application(&self, app: &ApplicationDefinition) -> Result<()> {
        let mut w = self.inner.write().await;
        w.applications.insert(app.name.clone(), app.clone());
        Ok(())
    }

    async fn load_application(&self, name: &str) -> Result<Option<ApplicationDefinition>> {
        let r = self.inner.read().await;
        Ok(r.applications.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ResourceDemand, Staging, WorkSpec};
    use std::path::PathBuf;

    fn task(state: TaskState) -> Task {
        Task {
            id: Uuid::now_v7(),
            name: "t".into(),
            workflow: Some("wf".into()),
            parents: vec![],
            wait_for_parents: true,
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
            work_root: PathBuf::from("/tmp"),
        }
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let store = MemoryStore::new();
        let t = task(TaskState::Created);
        store.save_task(&t).await.unwrap();
        let loaded = store.load_task(t.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, t.id);
    }

    #[tokio::test]
    async fn by_states_filters_correctly() {
        let store = MemoryStore::new();
        store.save_task(&task(TaskState::Created)).await.unwrap();
        store.save_task(&task(TaskState::Preprocessed)).await.unwrap();
        let runnable = store.by_states(&[TaskState::Preprocessed]).await.unwrap();
        assert_eq!(runnable.len(), 1);
    }

    #[tokio::test]
    async fn compare_and_save_drops_write_over_user_killed() {
        let store = MemoryStore::new();
        let mut t = task(TaskState::Running);
        store.save_task(&t).await.unwrap();

        let mut killed = t.clone();
        killed.set_state(TaskState::UserKilled, "killed");
        store.save_task(&killed).await.unwrap();

        t.set_state(TaskState::RunDone, "late completion");
        store.compare_and_save(&t, 0).await.unwrap();

        let current = store.load_task(t.id).await.unwrap().unwrap();
        assert_eq!(current.state, TaskState::UserKilled);
    }

    #[tokio::test]
    async fn batch_update_state_skips_user_killed_rows() {
        let store = MemoryStore::new();
        let mut killed = task(TaskState::UserKilled);
        killed.state_history = "killed".into();
        let runnable = task(TaskState::Preprocessed);
        store.save_task(&killed).await.unwrap();
        store.save_task(&runnable).await.unwrap();

        store
            .batch_update_state(&[killed.id, runnable.id], TaskState::Running, "batch")
            .await
            .unwrap();

        assert_eq!(store.load_task(killed.id).await.unwrap().unwrap().state, TaskState::UserKilled);
        assert_eq!(store.load_task(runnable.id).await.unwrap().unwrap().state, TaskState::Running);
    }
}
