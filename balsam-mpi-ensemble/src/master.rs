//! Rank 0: the master/dispatcher, grounded on `mpi_ensemble_pull.py`'s
//! `ResourceManager` and `master_main`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::protocol::{DonePayload, ErrorPayload, NewJobPayload, Tag};

const FETCH_PERIOD: Duration = Duration::from_millis(5000);
const KILLED_REFRESH_PERIOD: Duration = Duration::from_millis(10000);
const MAX_IDLE_TIME: Duration = Duration::from_secs(10);
const DELAY_PERIOD: Duration = Duration::from_secs(1);

static RUN_NEW_JOBS: AtomicBool = AtomicBool::new(true);

/// SIGUSR1 flips this off: stop taking new work, but keep draining.
pub fn install_sigusr1_handler() {
    // SAFETY: the handler only performs an atomic store, the one signal-safe
    // operation safe to perform from inside a signal handler.
    unsafe {
        signal_hook_register(libc_sigusr1(), stop_new_jobs as usize);
    }
}

extern "C" fn stop_new_jobs(_sig: i32) {
    RUN_NEW_JOBS.store(false, Ordering::SeqCst);
}

fn libc_sigusr1() -> i32 {
    10 // SIGUSR1 on Linux
}

unsafe fn signal_hook_register(sig: i32, handler: usize) {
    extern "C" {
        fn signal(signum: i32, handler: usize) -> usize;
    }
    signal(sig, handler);
}

#[derive(Clone)]
struct Assignment {
    task_id: uuid::Uuid,
    occupancy_share: f64,
}

pub struct ResourceManager<'a> {
    world: &'a SimpleCommunicator,
    host_names: Vec<String>,
    node_occupancy: HashMap<String, f64>,
    job_assignments: HashMap<i32, Assignment>,
    host_rank_map: HashMap<String, Vec<i32>>,
    runnable_cache: VecDeque<crate::protocol::ManifestEntry>,
    killed: std::collections::HashSet<uuid::Uuid>,
    last_fetch: Instant,
    last_killed_refresh: Instant,
    idle_since: Option<Instant>,
}

impl<'a> ResourceManager<'a> {
    pub fn new(world: &'a SimpleCommunicator, host_names: Vec<String>) -> Self {
        let mut host_rank_map: HashMap<String, Vec<i32>> = HashMap::new();
        for (rank, host) in host_names.iter().enumerate() {
            host_rank_map.entry(host.clone()).or_default().push(rank as i32);
        }
        let node_occupancy = host_names.iter().cloned().map(|h| (h, 0.0)).collect();

        Self {
            world,
            host_names,
            node_occupancy,
            job_assignments: HashMap::new(),
            host_rank_map,
            runnable_cache: VecDeque::new(),
            killed: Default::default(),
            last_fetch: Instant::now() - FETCH_PERIOD,
            last_killed_refresh: Instant::now() - KILLED_REFRESH_PERIOD,
            idle_since: None,
        }
    }

    /// Every `FETCH_PERIOD`, refresh the runnable serial cache, sorted
    /// descending by `packing_count` so the densest-packing tasks place
    /// first while occupancy is still wide open.
    fn maybe_refresh_runnable(&mut self, manifest: &[crate::protocol::ManifestEntry]) {
        if self.last_fetch.elapsed() < FETCH_PERIOD {
            return;
        }
        self.last_fetch = Instant::now();
        let assigned = self.assigned_ids();
        let mut cache: Vec<_> = manifest.iter().filter(|m| !assigned.contains(&m.task_id)).cloned().collect();
        cache.sort_by(|a, b| b.packing_count.cmp(&a.packing_count));
        self.runnable_cache = cache.into();
    }

    fn assigned_ids(&self) -> std::collections::HashSet<uuid::Uuid> {
        self.job_assignments.values().map(|a| a.task_id).collect()
    }

    /// Every `KILLED_REFRESH_PERIOD`, refresh the killed-task set.
    /// Caller supplies the current snapshot (source-of-truth store lookup
    /// lives in balsam-core; this binary has no direct store dependency).
    fn maybe_refresh_killed(&mut self, killed_now: impl FnOnce() -> std::collections::HashSet<uuid::Uuid>) {
        if self.last_killed_refresh.elapsed() < KILLED_REFRESH_PERIOD {
            return;
        }
        self.last_killed_refresh = Instant::now();
        self.killed = killed_now();
    }

    /// For each cached task (largest packing first), find the least-loaded
    /// host with room, and within it the lowest idle rank. Stops at the
    /// first failure to assign.
    fn allocate_next_jobs(&mut self) -> anyhow::Result<()> {
        if !RUN_NEW_JOBS.load(Ordering::SeqCst) {
            return Ok(());
        }
        while let Some(entry) = self.runnable_cache.front().cloned() {
            let share = 1.0 / entry.packing_count.max(1) as f64;
            let mut placed = false;

            let mut hosts: Vec<&String> = self.host_names.iter().collect();
            hosts.sort_by(|a, b| {
                self.node_occupancy[*a].partial_cmp(&self.node_occupancy[*b]).unwrap()
            });

            for host in hosts {
                if self.node_occupancy[host] + share >= 1.001 {
                    continue;
                }
                let idle_rank = self.host_rank_map[host]
                    .iter()
                    .find(|r| !self.job_assignments.contains_key(r))
                    .copied();
                if let Some(rank) = idle_rank {
                    *self.node_occupancy.get_mut(host).unwrap() += share;
                    self.job_assignments.insert(rank, Assignment { task_id: entry.task_id, occupancy_share: share });

                    let payload = NewJobPayload {
                        workdir: entry.workdir.clone(),
                        name: entry.task_id.to_string(),
                        cuteid: format!("[{}]", &entry.task_id.to_string()[..8]),
                        cmd: entry.command.clone(),
                        envs: Default::default(),
                    };
                    self.send_new(rank, &payload)?;
                    placed = true;
                    break;
                }
            }

            if placed {
                self.runnable_cache.pop_front();
                self.idle_since = None;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn send_new(&self, rank: i32, payload: &NewJobPayload) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.world.process_at_rank(rank).send_with_tag(&bytes[..], Tag::New as i32);
        Ok(())
    }

    /// Non-blocking test over outstanding recvs; dispatches ASK/DONE/ERROR.
    /// Returns `true` if anything was served.
    fn serve_request(&mut self) -> anyhow::Result<bool> {
        let mut served = false;
        let (msg, status) = match self.world.any_process().immediate_probe() {
            Some(s) => s,
            None => return Ok(false),
        };
        let _ = msg;
        let rank = status.source_rank();
        let Some(tag) = Tag::from_raw(status.tag()) else { return Ok(false) };

        let mut buf = vec![0u8; 65536];
        let (recv_buf, _status) = self.world.process_at_rank(rank).receive_vec_with_tag::<u8>(status.tag());
        buf = recv_buf;

        match tag {
            Tag::Ask => {
                served = true;
                if let Some(assignment) = self.job_assignments.get(&rank).cloned() {
                    if self.killed.contains(&assignment.task_id) {
                        self.world.process_at_rank(rank).send_with_tag(&[][..], Tag::Kill as i32);
                        // worker sends no reply once killed; free the assignment here
                        // rather than waiting on a Done/Error that will never arrive.
                        self.job_assignments.remove(&rank);
                        self.free_occupancy(rank, &assignment);
                    } else {
                        self.world.process_at_rank(rank).send_with_tag(&[][..], Tag::Continue as i32);
                    }
                }
            }
            Tag::Done => {
                served = true;
                let payload: DonePayload = serde_json::from_slice(&buf)?;
                if let Some(assignment) = self.job_assignments.remove(&rank) {
                    self.free_occupancy(rank, &assignment);
                    tracing::info!(task = %assignment.task_id, elapsed = payload.elapsed_seconds, "RUN_DONE");
                    println!("{} RUN_DONE {}", assignment.task_id, payload.elapsed_seconds);
                }
            }
            Tag::Error => {
                served = true;
                let payload: ErrorPayload = serde_json::from_slice(&buf)?;
                if let Some(assignment) = self.job_assignments.remove(&rank) {
                    self.free_occupancy(rank, &assignment);
                    tracing::warn!(task = %assignment.task_id, retcode = payload.retcode, "RUN_ERROR");
                    println!("{} RUN_ERROR retcode={} {}", assignment.task_id, payload.retcode, payload.tail);
                }
            }
            _ => {}
        }
        Ok(served)
    }

    fn free_occupancy(&mut self, rank: i32, assignment: &Assignment) {
        if let Some(host) = self.host_names.get(rank as usize) {
            if let Some(occ) = self.node_occupancy.get_mut(host) {
                *occ -= assignment.occupancy_share;
            }
        }
    }

    fn send_exit_all(&self) {
        for rank in 0..self.host_names.len() as i32 {
            self.world.process_at_rank(rank).send_with_tag(&[][..], Tag::Exit as i32);
        }
    }

    /// On shutdown: wait for all outstanding recvs to drain, send EXIT to
    /// every rank, then mark any still-assigned task timed out.
    pub fn shutdown_drain(&mut self) -> Vec<uuid::Uuid> {
        let deadline = Instant::now() + Duration::from_secs(15);
        while !self.job_assignments.is_empty() && Instant::now() < deadline {
            let _ = self.serve_request();
        }
        let timed_out: Vec<uuid::Uuid> = self.job_assignments.values().map(|a| a.task_id).collect();
        self.send_exit_all();
        timed_out
    }
}

/// Main tick: ~1s cadence master loop, exits when idle for
/// `MAX_IDLE_TIME` with no outstanding assignments.
pub fn master_main(
    world: &SimpleCommunicator,
    host_names: Vec<String>,
    manifest: Vec<crate::protocol::ManifestEntry>,
) -> anyhow::Result<()> {
    let mut rm = ResourceManager::new(world, host_names);
    rm.runnable_cache = manifest.clone().into();
    let mut idle_since: Option<Instant> = None;

    loop {
        rm.maybe_refresh_runnable(&manifest);
        rm.maybe_refresh_killed(Default::default);
        rm.allocate_next_jobs()?;
        let served = rm.serve_request()?;

        if !served && rm.runnable_cache.is_empty() {
            let idle_start = *idle_since.get_or_insert_with(Instant::now);
            if idle_start.elapsed() > MAX_IDLE_TIME && rm.job_assignments.is_empty() {
                break;
            }
            std::thread::sleep(DELAY_PERIOD);
        } else {
            idle_since = None;
        }
    }

    let timed_out = rm.shutdown_drain();
    for id in timed_out {
        println!("{} RUN_TIMEOUT shutdown drain", id);
    }
    Ok(())
}
