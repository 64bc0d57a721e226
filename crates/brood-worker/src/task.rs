//! The task trait.

use async_trait::async_trait;
use serde_json::Value;

/// A unit of work a worker can run.
///
/// Tasks are registered by name. For each request the worker constructs
/// the invocation from the request's arguments and runs it; the returned
/// value (or the error's rendering) goes back over the wire.
#[async_trait]
pub trait Task: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Execute with the request's arguments.
    async fn run(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}
