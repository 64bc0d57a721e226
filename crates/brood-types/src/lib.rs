//! brood-types: the wire contract between the pool and its workers.
//!
//! Both sides of a worker's pipe pair speak newline-delimited JSON frames.
//! This crate holds everything that contract needs:
//!
//! - **Payloads**: [`TaskRequest`] (parent → worker) and [`TaskResponse`]
//!   (worker → parent)
//! - **Codec**: sentinel-terminated framing in the [`codec`] module
//! - **Constants**: the frame [`SENTINEL`] and the response status codes

pub mod codec;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Byte terminating every frame on the wire.
///
/// Frame bodies are JSON objects; serde_json escapes control characters
/// inside strings, so an encoded frame never contains this byte.
pub const SENTINEL: u8 = b'\n';

/// `status` value of a successful response.
pub const STATUS_OK: u8 = 0;

/// `status` value of a failed response.
pub const STATUS_FAILED: u8 = 1;

/// How the worker should interpret a request.
///
/// The wire reserves a kind tag so the protocol can grow. The only kind
/// today is a registered task invoked by name: the worker constructs the
/// named task from `args`, then runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Task,
}

/// Request payload: run the named task with the given arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub kind: TaskKind,
    /// Registry name of the task to run.
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            kind: TaskKind::Task,
            task: task.into(),
            args,
        }
    }
}

/// Response payload: a status code plus a value or a diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub status: u8,
    pub result: Value,
}

impl TaskResponse {
    /// A successful response carrying the task's value.
    pub fn ok(result: Value) -> Self {
        Self {
            status: STATUS_OK,
            result,
        }
    }

    /// A failed response carrying a textual diagnostic.
    pub fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            status: STATUS_FAILED,
            result: Value::String(diagnostic.into()),
        }
    }

    /// Split success from failure; failures yield their diagnostic text.
    pub fn into_result(self) -> Result<Value, String> {
        if self.status == STATUS_OK {
            Ok(self.result)
        } else {
            match self.result {
                Value::String(diagnostic) => Err(diagnostic),
                other => Err(other.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let request = TaskRequest::new("double", vec![json!(21)]);
        let encoded = serde_json::to_string(&request).unwrap();
        assert!(encoded.contains("\"kind\":\"task\""));
        let decoded: TaskRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_request_args_default_empty() {
        let decoded: TaskRequest =
            serde_json::from_str(r#"{"kind":"task","task":"ping"}"#).unwrap();
        assert!(decoded.args.is_empty());
    }

    #[test]
    fn test_response_ok_into_result() {
        let response = TaskResponse::ok(json!(42));
        assert_eq!(response.into_result(), Ok(json!(42)));
    }

    #[test]
    fn test_response_failed_carries_diagnostic() {
        let response = TaskResponse::failed("boom");
        assert_eq!(response.into_result(), Err("boom".to_string()));
    }

    #[test]
    fn test_response_round_trip() {
        let response = TaskResponse::failed("no such task");
        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: TaskResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.status, STATUS_FAILED);
        assert_eq!(decoded, response);
    }
}
