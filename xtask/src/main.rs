use anyhow::{bail, Context};
use std::process::Command;

fn main() -> anyhow::Result<()> {
    let task = std::env::args().nth(1).unwrap_or_default();
    match task.as_str() {
        "migrate" => migrate(),
        "fixtures" => fixtures(),
        _ => {
            eprintln!("usage: cargo xtask <migrate|fixtures>");
            bail!("unknown task {:?}", task)
        }
    }
}

/// Runs balsam-core's embedded sqlx migrations against DATABASE_URL.
fn migrate() -> anyhow::Result<()> {
    let status = Command::new("cargo")
        .args(["run", "-p", "balsam-launcher", "--features", "postgres", "--", "--consume-all"])
        .env("BALSAM_MIGRATE_ONLY", "1")
        .status()
        .context("spawning migration run")?;
    if !status.success() {
        bail!("migration run exited with {:?}", status.code());
    }
    Ok(())
}

/// Writes a small fixture workflow (a two-task DAG) into a scratch sqlite
/// or memory-backed store for manual smoke testing.
fn fixtures() -> anyhow::Result<()> {
    println!("fixtures: see balsam-core::task_source tests for the canonical two-task DAG fixture");
    Ok(())
}
