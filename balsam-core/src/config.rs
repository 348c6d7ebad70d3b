//! Config value: constructed once at startup, threaded
//! through components via `Arc<Config>`, never mutated after.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub num_workers: u32,
    pub nodes_per_worker: u32,
    pub max_ranks_per_node: u32,
    pub time_limit_minutes: f64,
    pub daemon: bool,

    pub max_concurrent_runners: usize,
    pub runner_creation_period: Duration,
    pub fetch_period: Duration,
    pub killed_refresh_period: Duration,
    pub delay_period: Duration,
    pub ensemble_max_idle: Duration,
    pub ensemble_check_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: 0,
            nodes_per_worker: 1,
            max_ranks_per_node: 4,
            time_limit_minutes: 0.0,
            daemon: false,
            max_concurrent_runners: 50,
            runner_creation_period: Duration::from_secs(5),
            fetch_period: Duration::from_secs_f64(5.0),
            killed_refresh_period: Duration::from_secs_f64(10.0),
            delay_period: Duration::from_secs_f64(1.0),
            ensemble_max_idle: Duration::from_secs_f64(10.0),
            ensemble_check_period: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Overlay `BALSAM_*` environment variables a deployment commonly tunes.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("BALSAM_MAX_CONCURRENT_RUNNERS") {
            if let Ok(n) = v.parse() {
                self.max_concurrent_runners = n;
            }
        }
        if let Ok(v) = std::env::var("BALSAM_RUNNER_CREATION_PERIOD_SECS") {
            if let Ok(n) = v.parse::<f64>() {
                self.runner_creation_period = Duration::from_secs_f64(n);
            }
        }
        self
    }
}
