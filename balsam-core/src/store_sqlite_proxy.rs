use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BalsamError, Result};
use crate::store::TaskStore;
use crate::task::{ApplicationDefinition, Task, TaskState};

/// Line-delimited JSON request sent to the single-writer process.
/// The writer performs the actual save and replies with the refreshed row.
#[derive(Serialize)]
struct SaveRequest<'a> {
    task: &'a Task,
    update_fields: Option<&'a [&'a str]>,
}

#[derive(Deserialize)]
struct SaveReply {
    ok: bool,
    error: Option<String>,
    task: Option<Task>,
}

/// Client for the sqlite single-writer proxy: a separate process owns the
/// sqlite file and this struct is the only way the Launcher touches it,
/// over a loopback TCP connection, one line-delimited JSON request/ACK
/// round trip per save.
pub struct SqliteProxyTaskStore {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
    delegate: Arc<dyn TaskStore>,
}

impl SqliteProxyTaskStore {
    /// `delegate` answers the read-only query methods (`by_states`, etc.)
    /// against a local read replica or cache; only `save_task` and
    /// `compare_and_save` are proxied to the writer.
    pub fn new(addr: impl Into<String>, delegate: Arc<dyn TaskStore>) -> Self {
        Self { addr: addr.into(), conn: Mutex::new(None), delegate }
    }

    async fn ensure_connected(&self) -> anyhow::Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr)
                .await
                .with_context(|| format!("connecting to sqlite writer at {}", self.addr))?;
            *guard = Some(stream);
        }
        Ok(())
    }

    async fn send_save(&self, task: &Task) -> anyhow::Result<Task> {
        self.ensure_connected().await?;
        let mut guard = self.conn.lock().await;
        let stream = guard.as_mut().expect("connected above");

        let req = SaveRequest { task, update_fields: None };
        let mut line = serde_json::to_string(&req)?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await.context("writing save request")?;
        stream.flush().await?;

        let mut reader = BufReader::new(&mut *stream);
        let mut resp_line = String::new();
        reader.read_line(&mut resp_line).await.context("reading save ack")?;

        let reply: SaveReply = serde_json::from_str(&resp_line).context("parsing save ack")?;
        if !reply.ok {
            anyhow::bail!("sqlite writer rejected save: {}", reply.error.unwrap_or_default());
        }
        reply.task.ok_or_else(|| anyhow::anyhow!("sqlite writer ack missing refreshed task"))
    }
}

#[async_trait]
impl TaskStore for SqliteProxyTaskStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.send_save(task).await.map(|_| ()).map_err(BalsamError::TransientStore)
    }

    async fn load_task(&self, id: Uuid) -> Result<Option<Task>> {
        self.delegate.load_task(id).await
    }

    async fn delete_task(&self, id: Uuid) -> Result<()> {
        self.delegate.delete_task(id).await
    }

    async fn by_states(&self, states: &[TaskState]) -> Result<Vec<Task>> {
        self.delegate.by_states(states).await
    }

    async fn by_workflow(&self, workflow: &str) -> Result<Vec<Task>> {
        self.delegate.by_workflow(workflow).await
    }

    async fn by_ids(&self, ids: &[Uuid]) -> Result<Vec<Task>> {
        self.delegate.by_ids(ids).await
    }

    async fn all(&self) -> Result<Vec<Task>> {
        self.delegate.all().await
    }

    async fn get_runnable(&self, minutes_left: f64, serial_only: bool) -> Result<Vec<Task>> {
        self.delegate.get_runnable(minutes_left, serial_only).await
    }

    /// Block on the writer's ACK, then refresh from it — the proxy's only
    /// job is serializing this round trip through the single writer process.
    async fn compare_and_save(&self, task: &Task, _expected_version: u64) -> Result<()> {
        let refreshed = self.send_save(task).await.map_err(BalsamError::TransientStore)?;
        self.delegate.save_task(&refreshed).await
    }

    async fn batch_update_state(&self, ids: &[Uuid], new_state: TaskState, msg: &str) -> Result<()> {
        self.delegate.batch_update_state(ids, new_state, msg).await
    }

    async fn save_application(&self, app: &ApplicationDefinition) -> Result<()> {
        self.delegate.save_application(app).await
    }

    async fn load_application(&self, name: &str) -> Result<Option<ApplicationDefinition>> {
        self.delegate.load_application(name).await
    }
}
