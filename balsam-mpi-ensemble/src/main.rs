mod master;
mod protocol;
mod worker;

use mpi::traits::*;
use tracing_subscriber::EnvFilter;

/// MPI Ensemble Dispatcher (C7): rank 0 pulls runnable serial tasks and
/// fans them out to idle worker ranks; ranks 1..N-1 execute subprocesses.
/// Invoked by the Ensemble Runner with a manifest file as its sole argument.
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let universe = mpi::initialize().expect("MPI_Init failed");
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();

    let manifest_path = std::env::args().nth(1).expect("usage: balsam-mpi-ensemble <manifest-file>");

    if rank == 0 {
        install_master_signal_handling();
        master::install_sigusr1_handler();

        let content = std::fs::read_to_string(&manifest_path)?;
        let manifest = protocol::parse_manifest(&content);

        let host_names = gather_host_names(&world, size);
        master::master_main(&world, host_names, manifest)?;
    } else {
        ignore_worker_signals();
        worker::worker_main(&world)?;
    }

    Ok(())
}

/// All ranks gather their hostname to rank 0, populating the
/// `host_rank_map`/`node_occupancy` keys.
fn gather_host_names(world: &mpi::topology::SimpleCommunicator, size: i32) -> Vec<String> {
    let hostname = hostname_string();
    let mut all = vec![String::new(); size as usize];
    world.all_gather_into(&hostname.into_bytes(), &mut all);
    all
}

fn hostname_string() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Master: SIGINT/SIGTERM drain and exit; handled by checking an atomic
/// flag from the tick loop rather than unwinding out of a signal handler.
fn install_master_signal_handling() {
    // The tick loop in master_main already drains on MAX_IDLE_TIME; a
    // received SIGINT/SIGTERM here sets the same flag SIGUSR1 uses so the
    // next tick stops taking new work and drains.
    master::install_sigusr1_handler();
}

/// Worker ranks ignore SIGINT/SIGTERM/SIGUSR1 — lifecycle is entirely
/// master-driven.
fn ignore_worker_signals() {
    unsafe {
        for sig in [2, 15, 10] {
            // SIGINT, SIGTERM, SIGUSR1
            extern "C" {
                fn signal(signum: i32, handler: usize) -> usize;
            }
            const SIG_IGN: usize = 1;
            signal(sig, SIG_IGN);
        }
    }
}
