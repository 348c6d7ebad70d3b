use uuid::Uuid;

/// Structured error taxonomy for library-boundary failures.
///
/// Call sites elsewhere (CLI wiring, config loading) use `anyhow::Result`
/// with `.context(...)` instead of this enum; this type exists at the
/// seams where callers need to match on a specific failure kind.
#[derive(thiserror::Error, Debug)]
pub enum BalsamError {
    #[error("transient store error: {0}")]
    TransientStore(#[source] anyhow::Error),

    #[error("optimistic lock conflict on task {task_id}")]
    VersionConflict { task_id: Uuid },

    #[error("spawn failed: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("no available workers for admission")]
    NoAvailableWorkers,

    #[error("exceeded max concurrent runners ({0})")]
    ExceededMaxRunners(usize),

    #[error("invalid state transition: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, BalsamError>;
