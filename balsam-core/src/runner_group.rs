//! Runner Group (C6): admission + packing policy, grounded on `runners.py`'s
//! `RunnerGroup.create_next_runner`.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::BalsamError;
use crate::runner::Runner;
use crate::store::TaskStore;
use crate::task::Task;
use crate::worker_pool::WorkerGroup;

pub struct RunnerGroup {
    pub runners: Vec<Runner>,
    pub max_concurrent_runners: usize,
}

impl RunnerGroup {
    pub fn new(max_concurrent_runners: usize) -> Self {
        Self { runners: Vec::new(), max_concurrent_runners }
    }

    pub fn running_task_ids(&self) -> Vec<Uuid> {
        self.runners.iter().flat_map(|r| r.running_task_ids()).collect()
    }

    /// Admission + packing policy, evaluated in order:
    /// 1. Count idle nodes/ranks.
    /// 2. Partition into serial vs. MPI-fitting.
    /// 3. Prefer an Ensemble Runner once enough serial tasks saturate idle ranks.
    /// 4. Else an MPI-single Runner for the largest fitting task.
    /// 5. Else an Ensemble Runner for whatever serial tasks exist.
    /// 6. Else `NoAvailableWorkers`.
    pub async fn create_next_runner(
        &mut self,
        runnable: &[Task],
        workers: &mut WorkerGroup,
        nodes_per_worker: u32,
        ensemble_exe: &str,
    ) -> Result<(), BalsamError> {
        if self.runners.len() >= self.max_concurrent_runners {
            return Err(BalsamError::ExceededMaxRunners(self.max_concurrent_runners));
        }

        let idle: Vec<_> = workers.idle_workers().cloned().collect();
        let nidle_nodes: u32 = idle.iter().map(|w| w.num_nodes).sum();
        let max_rpn = idle.first().map(|w| w.max_ranks_per_node).unwrap_or(1);
        let nidle_ranks = nidle_nodes * max_rpn;

        let serial: Vec<&Task> = runnable
            .iter()
            .filter(|t| t.resources.num_ranks() == 1)
            .collect();
        let mpi_fitting: Vec<&Task> = runnable
            .iter()
            .filter(|t| {
                t.resources.num_nodes <= nidle_nodes
                    && (t.resources.num_nodes > 1 || t.resources.ranks_per_node > 1)
            })
            .collect();

        if serial.len() as u32 >= nidle_ranks && nidle_ranks > 0 {
            let chosen: Vec<Task> = serial.into_iter().take(nidle_ranks as usize).cloned().collect();
            let chosen_workers = take_idle_workers(workers, idle.len());
            let runner = Runner::spawn_ensemble(&chosen, chosen_workers, ensemble_exe, &BTreeMap::new())
                .await
                .map_err(|e| BalsamError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
            self.runners.push(runner);
            return Ok(());
        }

        let largest_mpi = mpi_fitting.iter().max_by_key(|t| t.resources.num_nodes);
        let serial_node_equiv = serial.len() as u32 / max_rpn.max(1);
        if let Some(task) = largest_mpi {
            if task.resources.num_nodes > serial_node_equiv {
                let needed_workers = task.resources.num_nodes.div_ceil(nodes_per_worker.max(1)) as usize;
                let chosen_workers = take_idle_workers(workers, needed_workers);
                let app_command = task.resolve_work(None);
                let runner = Runner::spawn_mpi_single(*task, chosen_workers, &app_command)
                    .await
                    .map_err(|e| BalsamError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
                self.runners.push(runner);
                return Ok(());
            }
        }

        if !serial.is_empty() {
            let needed_workers = (serial.len() as u32)
                .div_ceil(max_rpn.max(1))
                .div_ceil(nodes_per_worker.max(1)) as usize;
            let chosen_workers = take_idle_workers(workers, needed_workers.max(1));
            let chosen: Vec<Task> = serial.into_iter().cloned().collect();
            let runner = Runner::spawn_ensemble(&chosen, chosen_workers, ensemble_exe, &BTreeMap::new())
                .await
                .map_err(|e| BalsamError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
            self.runners.push(runner);
            return Ok(());
        }

        Err(BalsamError::NoAvailableWorkers)
    }

    /// Polls every Runner; reclaims workers and drops finished Runners.
    /// On a Runner reporting finished while a task isn't in a run-terminal
    /// state, the launcher must abort with a `ConsistencyError`.
    pub async fn update_and_remove_finished(
        &mut self,
        store: &dyn TaskStore,
        workers: &mut WorkerGroup,
        timing_out: bool,
    ) -> Result<bool, BalsamError> {
        let mut any = false;
        let mut still_running = Vec::new();

        for mut runner in std::mem::take(&mut self.runners) {
            if timing_out {
                runner.timeout(store).await.map_err(map_spawn)?;
            }
            let changed = runner.update_jobs(store).await.map_err(map_spawn)?;
            any = any || changed;

            if runner.finished() || timing_out {
                for id in runner.workers.iter().map(|w| w.id) {
                    workers.set_idle(id, true);
                }
                for task_id in runner.running_task_ids() {
                    if let Some(task) = store.load_task(task_id).await.map_err(|_| {
                        BalsamError::Consistency("store unreachable during finish check".into())
                    })? {
                        let ok = matches!(
                            task.state,
                            crate::task::TaskState::RunDone
                                | crate::task::TaskState::RunError
                                | crate::task::TaskState::RunTimeout
                                | crate::task::TaskState::UserKilled
                        );
                        if !ok {
                            return Err(BalsamError::Consistency(format!(
                                "task {} finished runner but is in {:?}",
                                task.cute_id(),
                                task.state
                            )));
                        }
                    }
                }
            } else {
                still_running.push(runner);
            }
        }

        self.runners = still_running;
        Ok(any)
    }
}

fn map_spawn(e: anyhow::Error) -> BalsamError {
    BalsamError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

fn take_idle_workers(workers: &mut WorkerGroup, count: usize) -> Vec<crate::worker_pool::Worker> {
    let chosen: Vec<_> = workers.idle_workers().take(count).cloned().collect();
    for w in &chosen {
        workers.set_idle(w.id, false);
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_max_concurrent_runners() {
        let rg = RunnerGroup::new(0);
        assert_eq!(rg.max_concurrent_runners, 0);
    }
}
