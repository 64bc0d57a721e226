//! Task registry: name → task lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::task::Task;

/// The set of tasks a worker can run.
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task under its own name. A later registration under the
    /// same name replaces the earlier one.
    pub fn register(&mut self, task: impl Task + 'static) {
        let task: Arc<dyn Task> = Arc::new(task);
        self.tasks.insert(task.name().to_string(), task);
    }

    /// Look up a task by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Answer;

    #[async_trait]
    impl Task for Answer {
        fn name(&self) -> &str {
            "answer"
        }

        async fn run(&self, _args: Vec<Value>) -> anyhow::Result<Value> {
            Ok(json!(42))
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let mut registry = TaskRegistry::new();
        assert!(registry.is_empty());

        registry.register(Answer);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["answer"]);

        let task = registry.get("answer").expect("registered task");
        assert_eq!(task.run(vec![]).await.unwrap(), json!(42));
        assert!(registry.get("missing").is_none());
    }
}
