use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::TaskResult;
use crate::task::{Task, TaskType};

use super::Runtime;

/// A handler for one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, rt: Arc<Runtime>, task: Task) -> TaskResult;
}

type HandlerFn = Box<dyn Fn(Arc<Runtime>, Task) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Adapter so plain async functions can be registered as handlers.
pub struct FnHandler(HandlerFn);

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> FnHandler
    where
        F: Fn(Arc<Runtime>, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        FnHandler(Box::new(move |rt, task| Box::pin(f(rt, task))))
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn handle(&self, rt: Arc<Runtime>, task: Task) -> TaskResult {
        (self.0)(rt, task).await
    }
}

type InitFn = fn(&Runtime) -> anyhow::Result<()>;

/// Map from task type to handler, built explicitly at process init by the
/// composition root. Task types the foreman pops that have no entry here
/// indicate a code/data mismatch and are dropped, never retried.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    init_fns: Vec<InitFn>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type, handler);
    }

    pub fn register_fn<F, Fut>(&mut self, task_type: TaskType, f: F)
    where
        F: Fn(Arc<Runtime>, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnHandler::new(f)));
    }

    /// Add a function run once at startup, in registration order.
    pub fn add_init(&mut self, init: InitFn) {
        self.init_fns.push(init);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    /// Run all registered init functions.
    pub fn init(&self, rt: &Runtime) -> anyhow::Result<()> {
        for init in &self.init_fns {
            init(rt)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("task_types", &types)
            .field("init_count", &self.init_fns.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(TaskType::StartFlow, |_rt, _task| async { Ok(()) });

        assert!(registry.get(TaskType::StartFlow).is_some());
        assert!(registry.get(TaskType::StartFlowBatch).is_none());
    }

    #[test]
    fn test_later_registration_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(TaskType::StartFlow, |_rt, _task| async { Ok(()) });
        registry.register_fn(TaskType::StartFlow, |_rt, _task| async {
            Err(crate::error::TaskError::Stale)
        });

        // one entry per type, last registration replacing the first
        let debug = format!("{:?}", registry);
        assert!(debug.contains("start_flow"));
    }

    #[test]
    fn test_debug_lists_types_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(TaskType::StudioFlowStart, |_rt, _task| async { Ok(()) });
        registry.register_fn(TaskType::HandleContactEvent, |_rt, _task| async { Ok(()) });

        let debug = format!("{:?}", registry);
        let handle = debug.find("handle_contact_event").unwrap();
        let studio = debug.find("studio_flow_start").unwrap();
        assert!(handle < studio);
    }
}
