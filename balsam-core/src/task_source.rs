//! Task Source (C3): pull interface over the durable store.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::store::TaskStore;
use crate::task::{Task, TaskState};

/// Selects which tasks this Launcher invocation is responsible for.
pub enum SourceStrategy {
    /// Fixed membership read from a newline-delimited UUID list at start.
    File(Vec<Uuid>),
    /// Filters by exact workflow label.
    Workflow(String),
    /// No filter — every task in the store.
    ConsumeAll,
}

pub struct TaskSource {
    store: Arc<dyn TaskStore>,
    strategy: SourceStrategy,
}

impl TaskSource {
    pub fn new(store: Arc<dyn TaskStore>, strategy: SourceStrategy) -> Self {
        Self { store, strategy }
    }

    async fn scope(&self) -> Result<Vec<Task>> {
        match &self.strategy {
            SourceStrategy::File(ids) => self.store.by_ids(ids).await,
            SourceStrategy::Workflow(wf) => self.store.by_workflow(wf).await,
            SourceStrategy::ConsumeAll => self.store.all().await,
        }
    }

    /// Tasks currently in any of `states`, restricted to this source's scope.
    pub async fn by_states(&self, states: &[TaskState]) -> Result<Vec<Task>> {
        let scoped = self.scope().await?;
        Ok(scoped.into_iter().filter(|t| states.contains(&t.state)).collect())
    }

    /// Tasks in the RUNNABLE group whose `wall_time_minutes <= minutes_left`,
    /// ordered by `-serial_node_packing_count` when `serial_only`.
    pub async fn get_runnable(&self, minutes_left: f64, serial_only: bool) -> Result<Vec<Task>> {
        let scoped_ids: Vec<Uuid> = self.scope().await?.into_iter().map(|t| t.id).collect();
        let mut runnable = self.store.get_runnable(minutes_left, serial_only).await?;
        runnable.retain(|t| scoped_ids.contains(&t.id));
        Ok(runnable)
    }

    /// Tasks likely to become runnable imminently — used by admission to
    /// decide whether waiting a tick for more work is worthwhile.
    pub async fn almost_runnable_exists(&self) -> Result<bool> {
        let scoped = self.scope().await?;
        Ok(scoped.iter().any(|t| TaskState::ALMOST_RUNNABLE_STATES.contains(&t.state)))
    }

    pub async fn all(&self) -> Result<Vec<Task>> {
        self.scope().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use crate::task::{ResourceDemand, Staging, WorkSpec};
    use std::path::PathBuf;

    fn task(workflow: &str, state: TaskState) -> Task {
        Task {
            id: Uuid::now_v7(),
            name: "t".into(),
            workflow: Some(workflow.into()),
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
    async fn workflow_strategy_returns_exactly_that_workflow() {
        let store = Arc::new(MemoryStore::new());
        store.save_task(&task("alpha", TaskState::Created)).await.unwrap();
        store.save_task(&task("beta", TaskState::Created)).await.unwrap();

        let source = TaskSource::new(store, SourceStrategy::Workflow("alpha".into()));
        let tasks = source.all().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].workflow.as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn consume_all_returns_full_set() {
        let store = Arc::new(MemoryStore::new());
        store.save_task(&task("alpha", TaskState::Created)).await.unwrap();
        store.save_task(&task("beta", TaskState::Created)).await.unwrap();

        let source = TaskSource::new(store, SourceStrategy::ConsumeAll);
        assert_eq!(source.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn file_strategy_returns_exactly_listed_ids() {
        let store = Arc::new(MemoryStore::new());
        let t1 = task("alpha", TaskState::Created);
        let t2 = task("beta", TaskState::Created);
        store.save_task(&t1).await.unwrap();
        store.save_task(&t2).await.unwrap();

        let source = TaskSource::new(store, SourceStrategy::File(vec![t1.id]));
        let tasks = source.all().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, t1.id);
    }
}
