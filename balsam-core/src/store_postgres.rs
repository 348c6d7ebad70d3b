use anyhow::Context;
use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{BalsamError, Result};
use crate::store::{version_conflict, TaskStore};
use crate::task::{ApplicationDefinition, ResourceDemand, Staging, Task, TaskState, WorkSpec};

fn map_anyhow(e: anyhow::Error) -> BalsamError {
    BalsamError::TransientStore(e)
}

fn state_to_str(s: TaskState) -> &'static str {
    s.as_str()
}

fn state_from_str(s: &str) -> anyhow::Result<TaskState> {
    use TaskState::*;
    Ok(match s {
        "CREATED" => Created,
        "LAUNCHER_QUEUED" => LauncherQueued,
        "AWAITING_PARENTS" => AwaitingParents,
        "READY" => Ready,
        "STAGED_IN" => StagedIn,
        "PREPROCESSED" => Preprocessed,
        "RUNNING" => Running,
        "RUN_DONE" => RunDone,
        "RUN_ERROR" => RunError,
        "RUN_TIMEOUT" => RunTimeout,
        "RESTART_READY" => RestartReady,
        "POSTPROCESSED" => Postprocessed,
        "JOB_FINISHED" => JobFinished,
        "FAILED" => Failed,
        "USER_KILLED" => UserKilled,
        "PARENT_KILLED" => ParentKilled,
        other => anyhow::bail!("unknown task state {other}"),
    })
}

/// PostgreSQL-backed `TaskStore`. Compound Task fields (resources, work
/// specification, staging globs) are stored as JSONB; the state, version
/// and identity columns are plain SQL types queryable without deserializing
/// the JSONB payload.
pub struct PostgresTaskStore {
    pool: sqlx::PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run balsam-core migrations")?;
        Ok(())
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> anyhow::Result<Task> {
        use sqlx::Row;
        let resources: serde_json::Value = row.get("resources");
        let work: serde_json::Value = row.get("work");
        let staging: serde_json::Value = row.get("staging");
        let parents: serde_json::Value = row.get("parents");

        Ok(Task {
            id: row.get("id"),
            name: row.get("name"),
            workflow: row.get("workflow"),
            parents: serde_json::from_value(parents).context("parents")?,
            wait_for_parents: row.get("wait_for_parents"),
            resources: serde_json::from_value::<ResourceDemand>(resources).context("resources")?,
            work: serde_json::from_value::<WorkSpec>(work).context("work")?,
            staging: serde_json::from_value::<Staging>(staging).context("staging")?,
            environ_vars: row.get("environ_vars"),
            pre_script: row.get("pre_script"),
            post_script: row.get("post_script"),
            post_error_handler: row.get("post_error_handler"),
            post_timeout_handler: row.get("post_timeout_handler"),
            auto_timeout_retry: row.get("auto_timeout_retry"),
            state: state_from_str(row.get::<String, _>("state").as_str())?,
            state_history: row.get("state_history"),
            version: row.get::<i64, _>("version") as u64,
            work_root: row.get::<String, _>("work_root").into(),
        })
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.save_task_inner(task).await.map_err(map_anyhow)
    }

    async fn load_task(&self, id: Uuid) -> Result<Option<Task>> {
        self.load_task_inner(id).await.map_err(map_anyhow)
    }

    async fn delete_task(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_task")
            .map_err(map_anyhow)?;
        Ok(())
    }

    async fn by_states(&self, states: &[TaskState]) -> Result<Vec<Task>> {
        let labels: Vec<&str> = states.iter().map(|s| state_to_str(*s)).collect();
        let rows = sqlx::query("SELECT * FROM tasks WHERE state = ANY($1)")
            .bind(&labels)
            .fetch_all(&self.pool)
            .await
            .context("by_states")
            .map_err(map_anyhow)?;
        rows.iter().map(Self::row_to_task).collect::<anyhow::Result<_>>().map_err(map_anyhow)
    }

    async fn by_workflow(&self, workflow: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE workflow = $1")
            .bind(workflow)
            .fetch_all(&self.pool)
            .await
            .context("by_workflow")
            .map_err(map_anyhow)?;
        rows.iter().map(Self::row_to_task).collect::<anyhow::Result<_>>().map_err(map_anyhow)
    }

    async fn by_ids(&self, ids: &[Uuid]) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .context("by_ids")
            .map_err(map_anyhow)?;
        rows.iter().map(Self::row_to_task).collect::<anyhow::Result<_>>().map_err(map_anyhow)
    }

    async fn all(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks")
            .fetch_all(&self.pool)
            .await
            .context("all")
            .map_err(map_anyhow)?;
        rows.iter().map(Self::row_to_task).collect::<anyhow::Result<_>>().map_err(map_anyhow)
    }

    async fn get_runnable(&self, minutes_left: f64, serial_only: bool) -> Result<Vec<Task>> {
        let labels: Vec<&str> = TaskState::RUNNABLE_STATES.iter().map(|s| state_to_str(*s)).collect();
        let rows = if serial_only {
            sqlx::query(
                "SELECT * FROM tasks WHERE state = ANY($1)
                 AND (resources->>'wall_time_minutes')::float8 <= $2
                 AND (resources->>'num_nodes')::int = 1
                 AND (resources->>'ranks_per_node')::int = 1
                 ORDER BY (resources->>'serial_node_packing_count')::int DESC",
            )
            .bind(&labels)
            .bind(minutes_left)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                "SELECT * FROM tasks WHERE state = ANY($1)
                 AND (resources->>'wall_time_minutes')::float8 <= $2",
            )
            .bind(&labels)
            .bind(minutes_left)
            .fetch_all(&self.pool)
            .await
        }
        .context("get_runnable")
        .map_err(map_anyhow)?;
        rows.iter().map(Self::row_to_task).collect::<anyhow::Result<_>>().map_err(map_anyhow)
    }

    async fn compare_and_save(&self, task: &Task, expected_version: u64) -> Result<()> {
        let current = self.load_task(task.id).await?;
        if let Some(current) = current {
            if current.version != expected_version {
                if current.state.is_absorbing() && task.state != TaskState::UserKilled {
                    return Ok(());
                }
                if !(current.state.is_absorbing() && task.state == TaskState::UserKilled) {
                    return Err(version_conflict(task.id));
                }
            }
        }
        self.save_task(task).await
    }

    async fn batch_update_state(&self, ids: &[Uuid], new_state: TaskState, msg: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET state = $1, version = version + 1,
             state_history = state_history || $2
             WHERE id = ANY($3) AND state <> 'USER_KILLED'",
        )
        .bind(state_to_str(new_state))
        .bind(format!("[{} {}] {}\n", chrono::Utc::now().to_rfc3339(), state_to_str(new_state), msg))
        .bind(ids)
        .execute(&self.pool)
        .await
        .context("batch_update_state")
        .map_err(map_anyhow)?;
        Ok(())
    }

    async fn save_application(&self, app: &ApplicationDefinition) -> Result<()> {
        sqlx::query(
            "INSERT INTO applications (name, executable, default_preprocess, default_postprocess, description)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (name) DO UPDATE SET
                executable = EXCLUDED.executable,
                default_preprocess = EXCLUDED.default_preprocess,
                default_postprocess = EXCLUDED.default_postprocess,
                description = EXCLUDED.description",
        )
        .bind(&app.name)
        .bind(&app.executable)
        .bind(&app.default_preprocess)
        .bind(&app.default_postprocess)
        .bind(&app.description)
        .execute(&self.pool)
        .await
        .context("save_application")
        .map_err(map_anyhow)?;
        Ok(())
    }

    async fn load_application(&self, name: &str) -> Result<Option<ApplicationDefinition>> {
        use sqlx::Row;
        let row = sqlx::query("SELECT * FROM applications WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("load_application")
            .map_err(map_anyhow)?;
        Ok(row.map(|r| ApplicationDefinition {
            name: r.get("name"),
            executable: r.get("executable"),
            default_preprocess: r.get("default_preprocess"),
            default_postprocess: r.get("default_postprocess"),
            description: r.get("description"),
        }))
    }
}

impl PostgresTaskStore {
    async fn save_task_inner(&self, task: &Task) -> anyhow::Result<()> {
        let resources = serde_json::to_value(&task.resources)?;
        let work = serde_json::to_value(&task.work)?;
        let staging = serde_json::to_value(&task.staging)?;
        let parents = serde_json::to_value(&task.parents)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, name, workflow, parents, wait_for_parents, resources, work,
                staging, environ_vars, pre_script, post_script, post_error_handler,
                post_timeout_handler, auto_timeout_retry, state, state_history,
                version, work_root
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                workflow = EXCLUDED.workflow,
                parents = EXCLUDED.parents,
                wait_for_parents = EXCLUDED.wait_for_parents,
                resources = EXCLUDED.resources,
                work = EXCLUDED.work,
                staging = EXCLUDED.staging,
                environ_vars = EXCLUDED.environ_vars,
                pre_script = EXCLUDED.pre_script,
                post_script = EXCLUDED.post_script,
                post_error_handler = EXCLUDED.post_error_handler,
                post_timeout_handler = EXCLUDED.post_timeout_handler,
                auto_timeout_retry = EXCLUDED.auto_timeout_retry,
                state = EXCLUDED.state,
                state_history = EXCLUDED.state_history,
                version = EXCLUDED.version,
                work_root = EXCLUDED.work_root
            "#,
        )
        .bind(task.id)
        .bind(&task.name)
        .bind(&task.workflow)
        .bind(&parents)
        .bind(task.wait_for_parents)
        .bind(&resources)
        .bind(&work)
        .bind(&staging)
        .bind(&task.environ_vars)
        .bind(&task.pre_script)
        .bind(&task.post_script)
        .bind(task.post_error_handler)
        .bind(task.post_timeout_handler)
        .bind(task.auto_timeout_retry)
        .bind(state_to_str(task.state))
        .bind(&task.state_history)
        .bind(task.version as i64)
        .bind(task.work_root.to_string_lossy().to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_task_inner(&self, id: Uuid) -> anyhow::Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }
}
