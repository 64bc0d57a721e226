//! Worker handle: one child process plus its mailbox.
//!
//! A `Worker` does no scheduling of its own; it is a resource the pool
//! hands out, tracks, and recycles.

use std::sync::Arc;

use tokio::time::{timeout, Duration};

use brood_types::TaskRequest;

use crate::error::Result;
use crate::mailbox::Mailbox;
use crate::spawn::WorkerProcess;

/// How long a retired worker gets to exit after its stdin closes.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// A pooled child process and the channel to it.
pub struct Worker {
    seq: u64,
    mailbox: Arc<Mailbox>,
    process: Box<dyn WorkerProcess>,
    submitted: u64,
    max_reqs: u64,
}

impl Worker {
    pub(crate) fn new(
        seq: u64,
        mailbox: Mailbox,
        process: Box<dyn WorkerProcess>,
        max_reqs: u64,
    ) -> Self {
        Self {
            seq,
            mailbox: Arc::new(mailbox),
            process,
            submitted: 0,
            max_reqs,
        }
    }

    /// Pool-assigned sequence number; keys the live-worker roster.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Shared handle to this worker's mailbox.
    ///
    /// Callers hold this across release so they can still collect a
    /// response after the worker has gone back into rotation.
    pub fn mailbox(&self) -> Arc<Mailbox> {
        self.mailbox.clone()
    }

    /// Encode and enqueue one request. Counts against the request budget
    /// at submit time, so the release-time recycling check already sees
    /// the request that just went out.
    pub async fn submit(&mut self, request: &TaskRequest) -> Result<u64> {
        let body = serde_json::to_value(request)?;
        let id = self.mailbox.send(&body).await?;
        self.submitted += 1;
        Ok(id)
    }

    /// Requests submitted over this worker's lifetime.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Wait until some response frame has arrived for this worker.
    pub async fn readable(&self) {
        self.mailbox.readable().await;
    }

    /// Wait for the response to a previously submitted request.
    pub async fn recv(&self, id: u64) -> Result<serde_json::Value> {
        self.mailbox.recv(id).await
    }

    /// Whether this worker can take another request.
    pub fn alive(&mut self) -> bool {
        if self.max_reqs != 0 && self.submitted >= self.max_reqs {
            return false;
        }
        !self.mailbox.is_closed() && self.process.is_alive()
    }

    /// Close the mailbox, give the child a grace period to exit on EOF,
    /// then kill and reap it.
    pub async fn shutdown(mut self) {
        self.mailbox.close().await;
        match timeout(EXIT_GRACE, self.process.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(worker = self.seq, "worker ignored stdin EOF; killing");
                let _ = self.process.kill();
                let _ = self.process.wait().await;
            }
        }
        tracing::debug!(worker = self.seq, requests = self.submitted, "worker retired");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("seq", &self.seq)
            .field("pid", &self.process.id())
            .field("submitted", &self.submitted)
            .field("max_reqs", &self.max_reqs)
            .finish()
    }
}
