//! MPI Command Builder (C2): pure, host-flavor-aware MPI launch line
//! construction. No I/O — just an argv builder.

use std::collections::BTreeMap;

use crate::worker_pool::{HostType, Worker};

pub struct MpiLaunchSpec<'a> {
    pub workers: &'a [Worker],
    pub command: &'a str,
    pub envs: &'a BTreeMap<String, String>,
    pub num_ranks: u32,
    pub ranks_per_node: u32,
    pub threads_per_rank: u32,
    pub threads_per_core: u32,
}

/// Renders a platform-correct MPI launch argv for `spec`.
pub fn build_mpi_command(spec: &MpiLaunchSpec) -> Vec<String> {
    match spec.workers.first().map(|w| w.host_type) {
        Some(HostType::Cray) => build_cray(spec),
        Some(HostType::Bgq) => build_bgq(spec),
        _ => build_default(spec),
    }
}

fn node_list(workers: &[Worker]) -> String {
    workers.iter().map(|w| w.id.to_string()).collect::<Vec<_>>().join(",")
}

fn env_flags(envs: &BTreeMap<String, String>) -> Vec<String> {
    envs.iter().flat_map(|(k, v)| vec!["-x".to_string(), format!("{k}={v}")]).collect()
}

fn build_default(spec: &MpiLaunchSpec) -> Vec<String> {
    let mut argv = vec!["mpirun".to_string(), "-n".to_string(), spec.num_ranks.to_string()];
    argv.extend(["-npernode".to_string(), spec.ranks_per_node.to_string()]);
    if spec.threads_per_rank > 1 {
        argv.extend(["-x".to_string(), format!("OMP_NUM_THREADS={}", spec.threads_per_rank)]);
    }
    argv.extend(env_flags(spec.envs));
    argv.extend(spec.command.split_whitespace().map(str::to_string));
    argv
}

fn build_cray(spec: &MpiLaunchSpec) -> Vec<String> {
    let depth = spec.threads_per_rank * spec.threads_per_core;
    let mut argv = vec![
        "aprun".to_string(),
        "-n".to_string(),
        spec.num_ranks.to_string(),
        "-N".to_string(),
        spec.ranks_per_node.to_string(),
        "-d".to_string(),
        depth.to_string(),
    ];
    if spec.threads_per_core > 1 {
        argv.push("-j".to_string());
        argv.push(spec.threads_per_core.to_string());
    }
    argv.push("-L".to_string());
    argv.push(node_list(spec.workers));
    for (k, v) in spec.envs {
        argv.push("-e".to_string());
        argv.push(format!("{k}={v}"));
    }
    argv.extend(spec.command.split_whitespace().map(str::to_string));
    argv
}

fn build_bgq(spec: &MpiLaunchSpec) -> Vec<String> {
    let mut argv = vec!["runjob".to_string(), "--ranks-per-node".to_string(), spec.ranks_per_node.to_string()];
    if let Some(w) = spec.workers.first() {
        if let Some(block) = &w.block {
            argv.extend(["--block".to_string(), block.clone()]);
        }
        if let Some(corner) = &w.corner {
            argv.extend(["--corner".to_string(), corner.clone()]);
        }
        if let Some(shape) = &w.shape {
            argv.extend(["--shape".to_string(), shape.clone()]);
        }
    }
    for (k, v) in spec.envs {
        argv.push("--envs".to_string());
        argv.push(format!("{k}={v}"));
    }
    argv.push("--".to_string());
    argv.extend(spec.command.split_whitespace().map(str::to_string));
    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_pool::WorkerGroup;

    fn envs() -> BTreeMap<String, String> {
        BTreeMap::from([("BALSAM_JOB_ID".to_string(), "abc".to_string())])
    }

    #[test]
    fn default_host_uses_mpirun() {
        let wg = WorkerGroup::setup_default(2, 4);
        let spec = MpiLaunchSpec {
            workers: &wg.workers,
            command: "./a.out --flag",
            envs: &envs(),
            num_ranks: 8,
            ranks_per_node: 4,
            threads_per_rank: 1,
            threads_per_core: 1,
        };
        let argv = build_mpi_command(&spec);
        assert_eq!(argv[0], "mpirun");
        assert!(argv.contains(&"./a.out".to_string()));
    }

    #[test]
    fn cray_host_uses_aprun_with_node_list() {
        let wg = WorkerGroup::setup_cray("1001-1002", 4).unwrap();
        let spec = MpiLaunchSpec {
            workers: &wg.workers,
            command: "./a.out",
            envs: &envs(),
            num_ranks: 2,
            ranks_per_node: 1,
            threads_per_rank: 2,
            threads_per_core: 1,
        };
        let argv = build_mpi_command(&spec);
        assert_eq!(argv[0], "aprun");
        assert!(argv.contains(&"1001,1002".to_string()));
    }
}
