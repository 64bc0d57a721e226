//! brood-worker: the child side of a brood pool.
//!
//! A worker process reads request frames from stdin, resolves each task by
//! name in its [`TaskRegistry`], runs it, and writes a response frame to
//! stdout. Stdout belongs to the wire protocol; all logging goes to stderr.
//!
//! This crate provides:
//!
//! - **Task**: the trait a unit of work implements
//! - **TaskRegistry**: name → task lookup
//! - **WorkerRuntime**: the frame loop (stdio or arbitrary streams)
//! - **Builtins**: a small default task set (`echo`, `double`, `sum`,
//!   `sleep-ms`, `fail`)
//!
//! Embedders register their own tasks and hand the registry to the
//! runtime:
//!
//! ```ignore
//! let mut registry = TaskRegistry::new();
//! register_builtins(&mut registry);
//! registry.register(MyTask);
//! WorkerRuntime::new(registry).run_stdio().await?;
//! ```

mod builtin;
mod registry;
mod runtime;
mod task;

pub use builtin::register_builtins;
pub use registry::TaskRegistry;
pub use runtime::WorkerRuntime;
pub use task::Task;
