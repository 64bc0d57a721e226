//! Producer/consumer dispatch over a pool.
//!
//! A [`TaskPipeline`] lets one side queue tasks while the other consumes
//! results in queue order. Backpressure is the pool's own: `queue` suspends
//! while every worker is busy, so the work in flight never exceeds the
//! pool's capacity. `shutdown` stops intake; whatever was queued first
//! drains to the consumer, then `next` reports end of stream.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use crate::error::{PoolError, Result};
use crate::pool::{Deferred, Pool};

struct PipelineState {
    pending: VecDeque<Deferred>,
    closed: bool,
}

/// A producer/consumer queue bound to a [`Pool`].
pub struct TaskPipeline {
    pool: Pool,
    state: Mutex<PipelineState>,
    queued: Notify,
}

impl TaskPipeline {
    pub(crate) fn new(pool: Pool) -> Self {
        Self {
            pool,
            state: Mutex::new(PipelineState {
                pending: VecDeque::new(),
                closed: false,
            }),
            queued: Notify::new(),
        }
    }

    /// Dispatch a task and append its handle to the queue.
    ///
    /// Fails with `PipelineClosed` after [`shutdown`](Self::shutdown);
    /// pool-level failures (no workers, pool shut down) pass through.
    pub async fn queue(&self, task: &str, args: Vec<Value>) -> Result<()> {
        if self.state.lock().await.closed {
            return Err(PoolError::PipelineClosed);
        }
        let deferred = self.pool.defer(task, args).await?;
        let mut state = self.state.lock().await;
        if state.closed {
            // Shutdown raced the dispatch; the task still runs, its
            // result is dropped.
            return Err(PoolError::PipelineClosed);
        }
        state.pending.push_back(deferred);
        drop(state);
        self.queued.notify_waiters();
        Ok(())
    }

    /// Await the next result in queue order.
    ///
    /// Returns `Ok(None)` once the pipeline is shut down and drained.
    /// Suspends while the pipeline is open but empty. A failed task
    /// (including tasks stranded by a pool shutdown) surfaces its error
    /// here, in its queue position.
    pub async fn next(&self) -> Result<Option<Value>> {
        loop {
            let notified = self.queued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let front = {
                let mut state = self.state.lock().await;
                match state.pending.pop_front() {
                    Some(deferred) => Some(deferred),
                    None if state.closed => return Ok(None),
                    None => None,
                }
            };
            match front {
                Some(deferred) => return deferred.wait().await.map(Some),
                None => notified.await,
            }
        }
    }

    /// Results still queued (snapshot).
    pub async fn pending(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Stop intake. Already-queued tasks remain consumable via
    /// [`next`](Self::next); further `queue` calls fail.
    pub async fn shutdown(&self) {
        self.state.lock().await.closed = true;
        self.queued.notify_waiters();
    }
}

impl std::fmt::Debug for TaskPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPipeline").finish()
    }
}
