//! Error taxonomy for the pool core.

use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by the pool, its mailboxes, and pipelines.
///
/// Failures local to one task (`Task`) leave the worker and the pool intact.
/// Failures that compromise a worker (`WorkerDied`, `Protocol`, `Codec`)
/// terminate that worker, fail its pending requests, and return its permit;
/// the pool keeps serving.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Invalid pool configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation on a pool that has been shut down.
    #[error("pool is shut down")]
    Closed,

    /// Queue on a pipeline that has been shut down.
    #[error("pipeline is shut down")]
    PipelineClosed,

    /// The worker exited or its pipe closed with requests outstanding.
    #[error("worker died: {0}")]
    WorkerDied(String),

    /// The worker reported a task failure; carries its diagnostic.
    #[error("task failed: {0}")]
    Task(String),

    /// A frame that violates the wire protocol; fatal to its mailbox.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Frame or payload encode/decode failure; fatal to its mailbox.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// I/O error on a worker's pipes.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// True for errors that end the affected request with no way to retry
    /// it on the same worker.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PoolError::Task(_))
    }
}
