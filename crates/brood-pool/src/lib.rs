//! brood-pool: a worker-process pool with multiplexed mailboxes.
//!
//! This crate provides:
//!
//! - **Mailbox**: full-duplex, id-multiplexed messaging over a worker's
//!   stdio, with a single background demultiplexer per worker
//! - **Worker**: a child process, its mailbox, and its request budget
//! - **Pool**: bounded acquisition with a counting semaphore, lazy
//!   spawning, budget-based recycling, and early release on readability
//! - **Dispatch**: `process` (await one result), `defer` (a handle to a
//!   result), `map` (ordered fan-out/gather)
//! - **Pipeline**: producer/consumer queueing with explicit shutdown
//! - **Spawn**: the launcher seam, with a subprocess implementation and an
//!   in-process loopback for tests
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                            Pool                               │
//! │   permits: Semaphore(max_procs)     idle: [W3, W1] (warm 1st) │
//! │                                                               │
//! │   process/defer/map ──▶ acquire ──▶ Worker ──▶ Mailbox        │
//! │                                        │          │           │
//! │                                     child      demux task     │
//! │                                    (stdio)    (routes by id)  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tasks are named; each worker process resolves the name in its own
//! registry, constructs the task from the request's arguments, and runs
//! it. See the `brood-worker` crate for the child side.

pub mod codec {
    //! Re-exported wire framing (shared with the worker side).
    pub use brood_types::codec::{decode, encode};
}

pub mod error;
pub mod mailbox;
pub mod pipeline;
pub mod pool;
pub mod spawn;
pub mod testing;
pub mod worker;

pub use error::{PoolError, Result};
pub use mailbox::Mailbox;
pub use pipeline::TaskPipeline;
pub use pool::{Deferred, Pool, PoolConfig};
pub use spawn::{CommandLauncher, WorkerChannel, WorkerLauncher, WorkerProcess};
pub use worker::Worker;
