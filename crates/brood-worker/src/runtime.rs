//! The worker's side of the wire: read requests, run tasks, respond.
//!
//! The loop is sequential: one task at a time, in arrival order, so a
//! worker's resource use stays bounded and response order is predictable.
//! The parent pipelines additional requests into the pipe; they wait their
//! turn here. Task failures, unknown names, and panics all become
//! `status = 1` responses; only a broken pipe ends the loop early.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use brood_types::{codec, TaskRequest, TaskResponse, SENTINEL};

use crate::registry::TaskRegistry;

/// Runs a task registry against a frame stream until EOF.
pub struct WorkerRuntime {
    registry: TaskRegistry,
}

impl WorkerRuntime {
    pub fn new(registry: TaskRegistry) -> Self {
        Self { registry }
    }

    /// Serve stdin/stdout until stdin reaches EOF.
    pub async fn run_stdio(self) -> anyhow::Result<()> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve the given streams until the input reaches EOF.
    pub async fn run<R, W>(self, input: R, output: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(input);
        let mut writer = output;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(SENTINEL, &mut line).await?;
            if read == 0 {
                break;
            }
            let (id, request) = match codec::decode::<TaskRequest>(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    // No id to answer under; skip the frame.
                    tracing::warn!(error = %e, "dropping malformed request frame");
                    continue;
                }
            };
            tracing::debug!(id, task = %request.task, "running task");
            let response = self.execute(request).await;
            let frame = codec::encode(id, &response)?;
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }
        tracing::debug!("input closed; worker loop finished");
        Ok(())
    }

    async fn execute(&self, request: TaskRequest) -> TaskResponse {
        let task = match self.registry.get(&request.task) {
            Some(task) => task,
            None => return TaskResponse::failed(format!("{}: unknown task", request.task)),
        };
        match AssertUnwindSafe(task.run(request.args)).catch_unwind().await {
            Ok(Ok(value)) => TaskResponse::ok(value),
            Ok(Err(e)) => TaskResponse::failed(format!("{e:#}")),
            Err(_) => TaskResponse::failed(format!("{}: task panicked", request.task)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::register_builtins;
    use crate::task::Task;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::io::{split, AsyncWriteExt};
    use brood_types::STATUS_FAILED;

    struct Panicky;

    #[async_trait]
    impl Task for Panicky {
        fn name(&self) -> &str {
            "panic"
        }

        async fn run(&self, _args: Vec<Value>) -> anyhow::Result<Value> {
            panic!("boom");
        }
    }

    /// Spin up a runtime over duplex pipes; returns our end.
    fn serve() -> tokio::io::DuplexStream {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let mut registry = TaskRegistry::new();
        register_builtins(&mut registry);
        registry.register(Panicky);
        tokio::spawn(async move {
            let (reader, writer) = split(theirs);
            let _ = WorkerRuntime::new(registry).run(reader, writer).await;
        });
        ours
    }

    async fn round_trip(
        writer: &mut (impl AsyncWrite + Unpin),
        reader: &mut BufReader<impl AsyncRead + Unpin>,
        id: u64,
        request: TaskRequest,
    ) -> TaskResponse {
        let frame = codec::encode(id, &request).unwrap();
        writer.write_all(&frame).await.unwrap();
        let mut line = Vec::new();
        reader.read_until(SENTINEL, &mut line).await.unwrap();
        let (got_id, response): (u64, TaskResponse) = codec::decode(&line).unwrap();
        assert_eq!(got_id, id);
        response
    }

    #[tokio::test]
    async fn test_runs_registered_task() {
        let stream = serve();
        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);

        let response = round_trip(
            &mut writer,
            &mut reader,
            1,
            TaskRequest::new("double", vec![json!(21)]),
        )
        .await;
        assert_eq!(response.into_result(), Ok(json!(42)));
    }

    #[tokio::test]
    async fn test_unknown_task_fails_cleanly() {
        let stream = serve();
        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);

        let response = round_trip(
            &mut writer,
            &mut reader,
            1,
            TaskRequest::new("nope", vec![]),
        )
        .await;
        assert_eq!(response.status, STATUS_FAILED);
        assert_eq!(response.into_result(), Err("nope: unknown task".into()));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure_response() {
        let stream = serve();
        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);

        let response = round_trip(
            &mut writer,
            &mut reader,
            7,
            TaskRequest::new("panic", vec![]),
        )
        .await;
        assert_eq!(response.status, STATUS_FAILED);

        // The loop survives the panic.
        let response = round_trip(
            &mut writer,
            &mut reader,
            8,
            TaskRequest::new("double", vec![json!(2)]),
        )
        .await;
        assert_eq!(response.into_result(), Ok(json!(4)));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let stream = serve();
        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);

        writer.write_all(b"garbage\n").await.unwrap();
        let response = round_trip(
            &mut writer,
            &mut reader,
            2,
            TaskRequest::new("double", vec![json!(3)]),
        )
        .await;
        assert_eq!(response.into_result(), Ok(json!(6)));
    }

    #[tokio::test]
    async fn test_requests_answered_in_arrival_order() {
        let stream = serve();
        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);

        // Pipeline two requests before reading any response.
        for (id, n) in [(1u64, 10), (2u64, 20)] {
            let frame = codec::encode(id, &TaskRequest::new("double", vec![json!(n)])).unwrap();
            writer.write_all(&frame).await.unwrap();
        }
        for (id, expected) in [(1u64, 20), (2u64, 40)] {
            let mut line = Vec::new();
            reader.read_until(SENTINEL, &mut line).await.unwrap();
            let (got_id, response): (u64, TaskResponse) = codec::decode(&line).unwrap();
            assert_eq!(got_id, id);
            assert_eq!(response.into_result(), Ok(json!(expected)));
        }
    }

    #[tokio::test]
    async fn test_loop_exits_on_eof() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let mut registry = TaskRegistry::new();
        register_builtins(&mut registry);
        let handle = tokio::spawn(async move {
            let (reader, writer) = split(theirs);
            WorkerRuntime::new(registry).run(reader, writer).await
        });

        drop(ours);
        let outcome = handle.await.unwrap();
        assert!(outcome.is_ok());
    }
}
