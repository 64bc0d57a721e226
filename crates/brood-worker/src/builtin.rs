//! Builtin tasks shipped with the worker binary.
//!
//! A deliberately small set: enough to smoke-test a pool end to end and to
//! serve as registration examples for embedders.

use async_trait::async_trait;
use serde_json::{json, Value};

use anyhow::bail;

use crate::registry::TaskRegistry;
use crate::task::Task;

/// Register the default task set.
pub fn register_builtins(registry: &mut TaskRegistry) {
    registry.register(Echo);
    registry.register(Double);
    registry.register(Sum);
    registry.register(SleepMs);
    registry.register(Fail);
}

/// echo — return the arguments unchanged.
struct Echo;

#[async_trait]
impl Task for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        Ok(Value::Array(args))
    }
}

/// double — twice the first argument.
struct Double;

#[async_trait]
impl Task for Double {
    fn name(&self) -> &str {
        "double"
    }

    async fn run(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        let first = match args.first() {
            Some(value) => value,
            None => bail!("double: missing argument"),
        };
        if let Some(n) = first.as_i64() {
            return Ok(json!(n * 2));
        }
        if let Some(x) = first.as_f64() {
            return Ok(json!(x * 2.0));
        }
        bail!("double: expected a number, got {first}");
    }
}

/// sum — add all numeric arguments.
struct Sum;

#[async_trait]
impl Task for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    async fn run(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        let mut integral = 0i64;
        let mut floating = 0.0f64;
        let mut any_float = false;
        for arg in &args {
            if let Some(n) = arg.as_i64() {
                integral += n;
                floating += n as f64;
            } else if let Some(x) = arg.as_f64() {
                any_float = true;
                floating += x;
            } else {
                bail!("sum: expected numbers, got {arg}");
            }
        }
        if any_float {
            Ok(json!(floating))
        } else {
            Ok(json!(integral))
        }
    }
}

/// sleep-ms — suspend for the given milliseconds, then return them.
struct SleepMs;

#[async_trait]
impl Task for SleepMs {
    fn name(&self) -> &str {
        "sleep-ms"
    }

    async fn run(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        let ms = match args.first().and_then(Value::as_u64) {
            Some(ms) => ms,
            None => bail!("sleep-ms: expected milliseconds"),
        };
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        Ok(json!(ms))
    }
}

/// fail — always fail, with the first argument as the diagnostic.
struct Fail;

#[async_trait]
impl Task for Fail {
    fn name(&self) -> &str {
        "fail"
    }

    async fn run(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        match args.first().and_then(Value::as_str) {
            Some(diagnostic) => bail!("{diagnostic}"),
            None => bail!("failure requested"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        register_builtins(&mut registry);
        registry
    }

    #[tokio::test]
    async fn test_builtins_are_registered() {
        assert_eq!(
            registry().names(),
            vec!["double", "echo", "fail", "sleep-ms", "sum"]
        );
    }

    #[tokio::test]
    async fn test_echo_returns_args() {
        let task = registry().get("echo").unwrap();
        let out = task.run(vec![json!(1), json!("two")]).await.unwrap();
        assert_eq!(out, json!([1, "two"]));
    }

    #[tokio::test]
    async fn test_double_integers_and_floats() {
        let task = registry().get("double").unwrap();
        assert_eq!(task.run(vec![json!(21)]).await.unwrap(), json!(42));
        assert_eq!(task.run(vec![json!(1.5)]).await.unwrap(), json!(3.0));
        assert!(task.run(vec![json!("x")]).await.is_err());
        assert!(task.run(vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_sum_stays_integral_when_possible() {
        let task = registry().get("sum").unwrap();
        assert_eq!(
            task.run(vec![json!(1), json!(2), json!(3)]).await.unwrap(),
            json!(6)
        );
        assert_eq!(
            task.run(vec![json!(1), json!(0.5)]).await.unwrap(),
            json!(1.5)
        );
        assert!(task.run(vec![json!(null)]).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_uses_given_diagnostic() {
        let task = registry().get("fail").unwrap();
        let err = task.run(vec![json!("custom message")]).await.unwrap_err();
        assert_eq!(err.to_string(), "custom message");
        let err = task.run(vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "failure requested");
    }
}
