//! In-process worker stand-ins for tests.
//!
//! [`LoopbackLauncher`] satisfies the same seam as the subprocess launcher
//! but backs each "worker" with a tokio task over in-memory duplex pipes.
//! The task honors the real wire contract (decode a request frame, run
//! the handler, write a response frame) and processes requests one at a
//! time, like a real worker. Launches are counted so recycling behavior
//! can be asserted.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{split, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

use brood_types::{codec, TaskRequest, TaskResponse, SENTINEL};

use crate::error::Result;
use crate::spawn::{WorkerChannel, WorkerLauncher, WorkerProcess};

type TaskFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>>;
type Handler = dyn Fn(String, Vec<Value>) -> TaskFuture + Send + Sync;

struct LoopbackShared {
    handler: Arc<Handler>,
    launched: AtomicUsize,
    /// Task name that makes the worker hang up without responding.
    hangup_task: Option<String>,
}

/// Launches in-process workers connected by duplex pipes.
#[derive(Clone)]
pub struct LoopbackLauncher {
    shared: Arc<LoopbackShared>,
}

impl LoopbackLauncher {
    /// Build a launcher whose workers answer requests with `handler`.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        Self {
            shared: Arc::new(LoopbackShared {
                handler: Arc::new(move |task: String, args: Vec<Value>| -> TaskFuture {
                    Box::pin(handler(task, args))
                }),
                launched: AtomicUsize::new(0),
                hangup_task: None,
            }),
        }
    }

    /// Make workers drop both pipes, without responding, when they see
    /// this task name. Simulates a worker crash mid-request.
    pub fn with_hangup_task(self, name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(LoopbackShared {
                handler: self.shared.handler.clone(),
                launched: AtomicUsize::new(self.shared.launched.load(Ordering::SeqCst)),
                hangup_task: Some(name.into()),
            }),
        }
    }

    /// Workers launched so far, across all clones of this launcher.
    pub fn launched(&self) -> usize {
        self.shared.launched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLauncher for LoopbackLauncher {
    async fn launch(&self) -> Result<WorkerChannel> {
        self.shared.launched.fetch_add(1, Ordering::SeqCst);
        let (parent_side, worker_side) = tokio::io::duplex(64 * 1024);

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let (read_half, write_half) = split(worker_side);
            let mut reader = BufReader::new(read_half);
            let mut writer = write_half;
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(SENTINEL, &mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let (id, request) = match codec::decode::<TaskRequest>(&line) {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                if shared
                    .hangup_task
                    .as_deref()
                    .is_some_and(|name| name == request.task)
                {
                    return;
                }
                let response = match (shared.handler)(request.task, request.args).await {
                    Ok(value) => TaskResponse::ok(value),
                    Err(diagnostic) => TaskResponse::failed(diagnostic),
                };
                let frame = match codec::encode(id, &response) {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        let (output, input) = split(parent_side);
        Ok(WorkerChannel {
            input: Box::new(input),
            output: Box::new(output),
            process: Box::new(LoopbackProcess {
                handle: Some(handle),
            }),
        })
    }
}

struct LoopbackProcess {
    handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl WorkerProcess for LoopbackProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    async fn wait(&mut self) -> std::io::Result<()> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
        Ok(())
    }
}
