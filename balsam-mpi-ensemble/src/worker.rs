//! Non-zero ranks: subprocess supervision, grounded on
//! `mpi_ensemble_pull.py`'s `Worker` class.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use rand::Rng;

use crate::protocol::{DonePayload, ErrorPayload, NewJobPayload, Tag};

const CHECK_PERIOD: Duration = Duration::from_secs(10);
const KILL_GRACE: Duration = Duration::from_secs(10);
const SPAWN_RETRIES: u32 = 4;

fn jittered_backoff() -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.0..3.5);
    Duration::from_secs_f64(0.5 + jitter)
}

/// Spawns `time -p ( <cmd> )` under `/bin/bash`, retrying up to
/// `SPAWN_RETRIES` times with jittered backoff.
fn spawn_with_retry(payload: &NewJobPayload, out_path: &std::path::Path) -> anyhow::Result<Child> {
    let wrapped = format!("time -p ( {} )", payload.cmd);
    let mut last_err = None;

    for attempt in 0..SPAWN_RETRIES {
        let out_file = std::fs::File::create(out_path);
        match out_file.and_then(|f| {
            let err_f = f.try_clone()?;
            Command::new("/bin/bash")
                .arg("-c")
                .arg(&wrapped)
                .current_dir(&payload.workdir)
                .envs(&payload.envs)
                .stdout(Stdio::from(f))
                .stderr(Stdio::from(err_f))
                .spawn()
        }) {
            Ok(child) => return Ok(child),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "spawn failed, retrying");
                last_err = Some(e);
                std::thread::sleep(jittered_backoff());
            }
        }
    }
    Err(anyhow::anyhow!("spawn failed after {} attempts: {:?}", SPAWN_RETRIES, last_err))
}

/// Blocks the process until it exits or `CHECK_PERIOD` elapses, returning
/// `None` if still running.
fn poll_with_timeout(child: &mut Child, timeout: Duration) -> anyhow::Result<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn kill_gracefully(child: &mut Child) -> anyhow::Result<()> {
    if let Some(pid) = Some(child.id()) {
        unsafe {
            libc_kill(pid as i32, 15);
        }
    }
    if poll_with_timeout(child, KILL_GRACE)?.is_none() {
        child.kill()?;
        child.wait()?;
    }
    Ok(())
}

unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    let _ = kill(pid, sig);
}

/// Parses `real N.N` out of the tail of `time -p`'s stderr-redirected output.
fn parse_elapsed_seconds(out_path: &std::path::Path) -> f64 {
    let Ok(mut f) = std::fs::File::open(out_path) else { return 0.0 };
    let mut content = String::new();
    let _ = f.read_to_string(&mut content);
    content
        .lines()
        .rev()
        .find_map(|l| l.strip_prefix("real "))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0.0)
}

fn tail_lines(out_path: &std::path::Path, n: usize) -> String {
    let Ok(mut f) = std::fs::File::open(out_path) else { return String::new() };
    let mut content = String::new();
    let _ = f.read_to_string(&mut content);
    content.lines().rev().take(n).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n")
}

/// Per-rank worker loop: block on `recv` from 0, dispatch NEW/KILL/EXIT,
/// answer periodic ASK with DONE/ERROR/CONTINUE.
pub fn worker_main(world: &SimpleCommunicator) -> anyhow::Result<()> {
    let master = world.process_at_rank(0);

    loop {
        let (buf, status) = master.receive_vec::<u8>();
        let Some(tag) = Tag::from_raw(status.tag()) else { continue };

        match tag {
            Tag::Exit => break,
            Tag::New => {
                let payload: NewJobPayload = serde_json::from_slice(&buf)?;
                let out_path = std::path::Path::new(&payload.workdir).join(format!("{}.out", payload.name));

                let mut child = match spawn_with_retry(&payload, &out_path) {
                    Ok(c) => c,
                    Err(e) => {
                        let err = ErrorPayload { retcode: -1, tail: e.to_string() };
                        master.send_with_tag(&serde_json::to_vec(&err)?, Tag::Error as i32);
                        continue;
                    }
                };

                let outcome = run_until_done(world, &mut child);
                match outcome {
                    RunOutcome::Done => {
                        let elapsed = parse_elapsed_seconds(&out_path);
                        let done = DonePayload { elapsed_seconds: elapsed };
                        master.send_with_tag(&serde_json::to_vec(&done)?, Tag::Done as i32);
                    }
                    RunOutcome::Error(code) => {
                        let err = ErrorPayload { retcode: code, tail: tail_lines(&out_path, 10) };
                        master.send_with_tag(&serde_json::to_vec(&err)?, Tag::Error as i32);
                    }
                    RunOutcome::Killed => {
                        // master already knows; no reply needed once killed by its own request
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

enum RunOutcome {
    Done,
    Error(i32),
    Killed,
}

/// While the process runs: every `CHECK_PERIOD`, ASK the master whether to
/// continue or die; on `KILL`, SIGTERM then SIGKILL after the grace period.
fn run_until_done(world: &SimpleCommunicator, child: &mut Child) -> RunOutcome {
    let master = world.process_at_rank(0);
    loop {
        match poll_with_timeout(child, CHECK_PERIOD) {
            Ok(Some(status)) => {
                return match status.code() {
                    Some(0) => RunOutcome::Done,
                    Some(code) => RunOutcome::Error(code),
                    None => RunOutcome::Error(-1),
                };
            }
            Ok(None) => {
                master.send_with_tag(&[][..], Tag::Ask as i32);
                let (_buf, status) = master.receive_vec::<u8>();
                if Tag::from_raw(status.tag()) == Some(Tag::Kill) {
                    let _ = kill_gracefully(child);
                    return RunOutcome::Killed;
                }
            }
            Err(_) => return RunOutcome::Error(-1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_backoff_stays_in_expected_range() {
        for _ in 0..20 {
            let d = jittered_backoff();
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(4000));
        }
    }
}
