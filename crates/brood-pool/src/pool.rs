//! The worker pool: bounded acquisition, recycling, and dispatch.
//!
//! A [`Pool`] keeps at most `max_procs` workers alive. A counting semaphore
//! gates acquisition: every dispatched task holds one permit from send to
//! release. Idle workers sit in a deque, most recently used first, so warm
//! workers are preferred; workers are spawned on demand and retired once
//! their request budget is spent.
//!
//! # Early release
//!
//! A worker goes back into rotation as soon as its mailbox reports a frame
//! *inbound*, not after the response has been fully read and decoded:
//!
//! 1. submit the request (obtaining its id)
//! 2. await `Mailbox::readable()`
//! 3. release the worker (the permit frees immediately)
//! 4. await `Mailbox::recv(id)` for the decoded result
//!
//! Step 3 is safe while unread frames remain in the pipe: the mailbox is
//! multiplexed by id, so later clients of the same worker enqueue their own
//! requests and collect their own responses.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex, Semaphore};

use brood_types::{TaskRequest, TaskResponse};

use crate::error::{PoolError, Result};
use crate::mailbox::Mailbox;
use crate::pipeline::TaskPipeline;
use crate::spawn::WorkerLauncher;
use crate::worker::Worker;

/// Pool sizing and per-worker budget.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent workers. Must be at least 1.
    pub max_procs: usize,
    /// Requests a worker serves before it is recycled (0 = unlimited).
    pub max_reqs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_procs: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            max_reqs: 0,
        }
    }
}

impl PoolConfig {
    /// A pool of `max_procs` workers with unlimited request budgets.
    pub fn with_procs(max_procs: usize) -> Self {
        Self {
            max_procs,
            max_reqs: 0,
        }
    }

    /// Set the per-worker request budget.
    pub fn max_reqs(mut self, max_reqs: u64) -> Self {
        self.max_reqs = max_reqs;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_procs == 0 {
            return Err(PoolError::Config("max_procs must be at least 1".into()));
        }
        Ok(())
    }
}

struct PoolState {
    /// Idle workers, most recently used at the front.
    idle: VecDeque<Worker>,
    /// Mailboxes of every live worker (idle and busy), by sequence number.
    live: HashMap<u64, Arc<Mailbox>>,
    num_procs: usize,
    running: bool,
    next_seq: u64,
}

struct PoolInner {
    launcher: Arc<dyn WorkerLauncher>,
    config: PoolConfig,
    permits: Semaphore,
    state: Mutex<PoolState>,
}

/// A bounded pool of worker processes.
///
/// Cheap to clone; clones share the same workers.
///
/// ```ignore
/// let launcher = CommandLauncher::new("brood-worker")
///     .include(vec!["target/debug".into()]);
/// let pool = Pool::new(launcher, PoolConfig::with_procs(4))?;
/// let doubled = pool.process("double", vec![json!(21)]).await?;
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Build a pool over the given launcher. Workers are spawned lazily,
    /// on first demand.
    pub fn new(launcher: impl WorkerLauncher + 'static, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                launcher: Arc::new(launcher),
                permits: Semaphore::new(config.max_procs),
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    live: HashMap::new(),
                    num_procs: 0,
                    running: true,
                    next_seq: 0,
                }),
            }),
        })
    }

    /// Remaining worker permits.
    pub fn capacity(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Live workers, idle and busy.
    pub async fn worker_count(&self) -> usize {
        self.inner.state.lock().await.num_procs
    }

    /// False once `shutdown()` has begun and until `reset()`.
    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }

    /// Run one task to completion and return its result.
    pub async fn process(&self, task: &str, args: Vec<Value>) -> Result<Value> {
        self.defer(task, args).await?.wait().await
    }

    /// Dispatch one task; the returned handle resolves to its result.
    ///
    /// Suspends until a worker permit is available (that is the pool's
    /// backpressure), then sends immediately. The caller may drop the
    /// handle; the dispatched task still runs and the worker is recovered.
    pub async fn defer(&self, task: &str, args: Vec<Value>) -> Result<Deferred> {
        let request = TaskRequest::new(task, args);
        let mut worker = self.acquire().await?;
        let id = match worker.submit(&request).await {
            Ok(id) => id,
            Err(e) => {
                // The pipe is suspect; retire the worker rather than reuse it.
                self.discard(worker).await;
                self.inner.permits.add_permits(1);
                return Err(e);
            }
        };

        let mailbox = worker.mailbox();
        let seq = worker.seq();
        let pool = self.clone();
        let (tx, rx) = oneshot::channel();
        // The driver owns the worker through release, so cancelling the
        // caller can leak neither the permit nor the process.
        tokio::spawn(async move {
            mailbox.readable().await;
            pool.release(worker).await;
            let outcome = match mailbox.recv(id).await {
                Ok(body) => pool.decode_response(seq, body).await,
                Err(e) => Err(pool.map_shutdown_error(e).await),
            };
            let _ = tx.send(outcome);
        });
        Ok(Deferred { rx })
    }

    /// Apply `task` to each input concurrently; results come back in input
    /// order regardless of completion order. A result that is a JSON array
    /// is spliced flat at its position.
    ///
    /// On failure, the first error in input order is returned, after every
    /// sibling has completed (so no worker leaks). A dispatch failure is
    /// held at its input's position like any task failure, so an
    /// earlier-indexed task that fails later still wins error selection.
    pub async fn map<I>(&self, task: &str, inputs: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut handles = Vec::new();
        for input in inputs {
            handles.push(self.defer(task, vec![input]).await);
        }
        let mut out = Vec::new();
        let mut first_err: Option<PoolError> = None;
        for handle in handles {
            let outcome = match handle {
                Ok(deferred) => deferred.wait().await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(_) if first_err.is_some() => {}
                Ok(Value::Array(items)) => out.extend(items),
                Ok(value) => out.push(value),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// A producer/consumer queue over this pool.
    pub async fn pipeline(&self) -> Result<TaskPipeline> {
        if !self.inner.state.lock().await.running {
            return Err(PoolError::Closed);
        }
        Ok(TaskPipeline::new(self.clone()))
    }

    /// Terminate every worker and refuse further work.
    ///
    /// Idempotent. Requests whose response already arrived complete
    /// normally; other in-flight requests fail once their worker's pipes
    /// close. On return the pool holds no workers and `capacity()` equals
    /// `max_procs` again. Use [`reset`](Self::reset) to reopen.
    pub async fn shutdown(&self) {
        let mailboxes: Vec<Arc<Mailbox>> = {
            let mut state = self.inner.state.lock().await;
            state.running = false;
            state.live.values().cloned().collect()
        };
        // Closing every live mailbox fails the pending slots of busy
        // workers and lets each child exit on stdin EOF.
        for mailbox in mailboxes {
            mailbox.close().await;
        }

        // Quiescence: wait for every in-flight driver to release.
        let max = self.inner.config.max_procs as u32;
        match self.inner.permits.acquire_many(max).await {
            Ok(permit) => permit.forget(),
            Err(_) => return,
        }

        let workers: Vec<Worker> = {
            let mut state = self.inner.state.lock().await;
            let workers: Vec<Worker> = state.idle.drain(..).collect();
            for worker in &workers {
                state.live.remove(&worker.seq());
            }
            state.num_procs = 0;
            workers
        };
        for worker in workers {
            worker.shutdown().await;
        }
        self.inner.permits.add_permits(max as usize);
        tracing::debug!("pool shut down");
    }

    /// Reopen a shut-down pool, empty of workers.
    pub async fn reset(&self) {
        self.inner.state.lock().await.running = true;
    }

    /// Acquire protocol: permit, then an idle worker, else spawn.
    async fn acquire(&self) -> Result<Worker> {
        if !self.inner.state.lock().await.running {
            return Err(PoolError::Closed);
        }
        let permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;
        permit.forget();

        loop {
            let candidate = {
                let mut state = self.inner.state.lock().await;
                if !state.running {
                    drop(state);
                    self.inner.permits.add_permits(1);
                    return Err(PoolError::Closed);
                }
                state.idle.pop_front()
            };
            match candidate {
                Some(mut worker) => {
                    if worker.alive() {
                        return Ok(worker);
                    }
                    // Cull quietly and keep the permit for the replacement.
                    self.discard(worker).await;
                }
                None => break,
            }
        }

        match self.spawn_worker().await {
            Ok(worker) => Ok(worker),
            Err(e) => {
                self.inner.permits.add_permits(1);
                Err(e)
            }
        }
    }

    async fn spawn_worker(&self) -> Result<Worker> {
        let channel = self.inner.launcher.launch().await?;
        let mailbox = Mailbox::new(channel.input, channel.output);
        let mut state = self.inner.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        let worker = Worker::new(seq, mailbox, channel.process, self.inner.config.max_reqs);
        state.live.insert(seq, worker.mailbox());
        state.num_procs += 1;
        tracing::debug!(worker = seq, live = state.num_procs, "spawned pool worker");
        Ok(worker)
    }

    /// Release protocol: recycle a spent or dead worker, requeue the rest.
    /// Runs as soon as the worker's response is inbound, before it is read.
    async fn release(&self, mut worker: Worker) {
        let mut state = self.inner.state.lock().await;
        if state.running && worker.alive() {
            state.idle.push_front(worker);
            drop(state);
        } else {
            state.live.remove(&worker.seq());
            state.num_procs -= 1;
            let live = state.num_procs;
            drop(state);
            tracing::debug!(
                worker = worker.seq(),
                requests = worker.submitted(),
                live,
                "recycling pool worker"
            );
            // Retirement waits for the child to drain and exit; do it off
            // the release path so the permit frees now.
            tokio::spawn(worker.shutdown());
        }
        self.inner.permits.add_permits(1);
    }

    /// Remove a worker from the books without returning its permit.
    async fn discard(&self, worker: Worker) {
        let mut state = self.inner.state.lock().await;
        state.live.remove(&worker.seq());
        state.num_procs -= 1;
        drop(state);
        tokio::spawn(worker.shutdown());
    }

    /// Interpret a raw response body. A body that does not decode marks the
    /// worker as compromised and terminates it.
    async fn decode_response(&self, seq: u64, body: Value) -> Result<Value> {
        match serde_json::from_value::<TaskResponse>(body) {
            Ok(response) => response.into_result().map_err(PoolError::Task),
            Err(e) => {
                tracing::warn!(worker = seq, error = %e, "malformed response body; terminating worker");
                self.condemn(seq).await;
                Err(PoolError::Codec(e))
            }
        }
    }

    /// Close a live worker's mailbox; the next acquisition culls it.
    async fn condemn(&self, seq: u64) {
        let mailbox = self.inner.state.lock().await.live.get(&seq).cloned();
        if let Some(mailbox) = mailbox {
            mailbox.close().await;
        }
    }

    /// Once shutdown has begun, worker-side failures read as pool closure.
    async fn map_shutdown_error(&self, error: PoolError) -> PoolError {
        if matches!(error, PoolError::WorkerDied(_)) && !self.is_running().await {
            PoolError::Closed
        } else {
            error
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("max_procs", &self.inner.config.max_procs)
            .field("max_reqs", &self.inner.config.max_reqs)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Handle to a task dispatched with [`Pool::defer`].
pub struct Deferred {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Deferred {
    /// Wait for the task's result.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(PoolError::Closed),
        }
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred").finish()
    }
}
