//! Worker Pool (C1): the immutable inventory of compute units in the
//! allocation, grounded on `worker.py`'s `Worker`/`WorkerGroup`.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostType {
    Default,
    Cray,
    Bgq,
}

/// One scheduling unit within the allocation (glossary: Worker).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Worker {
    pub id: u32,
    pub host_type: HostType,
    pub num_nodes: u32,
    pub max_ranks_per_node: u32,
    /// BG/Q-style sub-block addressing; unused on CRAY/DEFAULT.
    pub shape: Option<String>,
    pub block: Option<String>,
    pub corner: Option<String>,
    pub idle: bool,
}

impl Worker {
    fn new(id: u32, host_type: HostType, num_nodes: u32, max_ranks_per_node: u32) -> Self {
        Self { id, host_type, num_nodes, max_ranks_per_node, shape: None, block: None, corner: None, idle: true }
    }
}

/// The full set of Workers for one Launcher invocation; created from the
/// outer scheduler's node list at start, destroyed at shutdown.
pub struct WorkerGroup {
    pub workers: Vec<Worker>,
}

impl WorkerGroup {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn idle_workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter().filter(|w| w.idle)
    }

    pub fn num_idle_nodes(&self) -> u32 {
        self.idle_workers().map(|w| w.num_nodes).sum()
    }

    pub fn set_idle(&mut self, id: u32, idle: bool) {
        if let Some(w) = self.workers.iter_mut().find(|w| w.id == id) {
            w.idle = idle;
        }
    }

    /// CRAY-style: parses a `"1001-1005,1030,1034-1200"` range string into
    /// one single-node Worker per listed node id.
    pub fn setup_cray(workers_str: &str, max_ranks_per_node: u32) -> anyhow::Result<Self> {
        let mut ids = Vec::new();
        for segment in workers_str.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some((lo, hi)) = segment.split_once('-') {
                let lo: u32 = lo.parse()?;
                let hi: u32 = hi.parse()?;
                ids.extend(lo..=hi);
            } else {
                ids.push(segment.parse()?);
            }
        }
        let workers = ids
            .into_iter()
            .map(|id| Worker::new(id, HostType::Cray, 1, max_ranks_per_node))
            .collect();
        Ok(Self { workers })
    }

    /// BG/Q sub-block parsing is unimplemented upstream (`pass` in the
    /// original); kept as an explicit stub here rather than a silent no-op.
    pub fn setup_bgq(_workers_file: &str, _nodes_per_worker: u32) -> anyhow::Result<Self> {
        anyhow::bail!("BG/Q worker setup is not implemented")
    }

    /// DEFAULT: `num_workers` generic single-node workers.
    pub fn setup_default(num_workers: u32, max_ranks_per_node: u32) -> Self {
        let workers = (0..num_workers)
            .map(|id| Worker::new(id, HostType::Default, 1, max_ranks_per_node))
            .collect();
        Self { workers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cray_range_string_expands_to_one_worker_per_node() {
        let wg = WorkerGroup::setup_cray("1001-1003,1010", 4).unwrap();
        let ids: Vec<u32> = wg.workers.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![1001, 1002, 1003, 1010]);
    }

    #[test]
    fn default_group_creates_requested_count() {
        let wg = WorkerGroup::setup_default(8, 4);
        assert_eq!(wg.len(), 8);
        assert_eq!(wg.num_idle_nodes(), 8);
    }

    #[test]
    fn set_idle_toggles_single_worker() {
        let mut wg = WorkerGroup::setup_default(2, 4);
        wg.set_idle(0, false);
        assert_eq!(wg.num_idle_nodes(), 1);
    }
}
