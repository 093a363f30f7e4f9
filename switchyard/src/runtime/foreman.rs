use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::TaskError;
use crate::queue::QueueName;
use crate::task::{Task, TaskPriority, TaskType};
use crate::telemetry;

use super::{HandlerRegistry, Runtime, ShutdownToken};

/// How long a worker sleeps when its queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Per-task deadline by type. Handlers run under this budget; anything still
/// going when it lapses is aborted.
pub fn task_deadline(task_type: TaskType) -> Duration {
    match task_type {
        TaskType::HandleContactEvent => Duration::from_secs(5 * 60),
        TaskType::StartFlowBatch | TaskType::StartIvrFlowBatch => Duration::from_secs(15 * 60),
        TaskType::StartFlow | TaskType::StudioFlowStart => Duration::from_secs(60 * 60),
        _ => Duration::from_secs(5 * 60),
    }
}

/// Supervisor of the worker pool draining one queue. Owns the queue name, a
/// fixed worker count and a shared stop token; on stop it cancels the token
/// and waits for all workers to return.
pub struct Foreman {
    queue: QueueName,
    workers: usize,
    registry: Arc<HandlerRegistry>,
    shutdown: ShutdownToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Foreman {
    pub fn new(queue: QueueName, workers: usize, registry: Arc<HandlerRegistry>) -> Foreman {
        Foreman {
            queue,
            workers,
            registry,
            shutdown: ShutdownToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Launch the worker pool.
    pub async fn start(&self, rt: Arc<Runtime>) {
        tracing::info!(queue = %self.queue, workers = self.workers, "foreman starting");

        let mut handles = self.handles.lock().await;
        for i in 0..self.workers {
            let worker_id = format!("{}-{}-w{}", self.queue, std::process::id(), i);
            let rt = rt.clone();
            let registry = self.registry.clone();
            let shutdown = self.shutdown.clone();
            let queue = self.queue;

            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, rt, registry, shutdown).await;
            }));
        }
    }

    /// Signal shutdown and wait for every worker to return.
    pub async fn stop(&self) {
        tracing::info!(queue = %self.queue, "foreman stopping");
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(queue = %self.queue, "worker task failed: {:?}", e),
                Err(_) => tracing::warn!(queue = %self.queue, "worker timed out during shutdown"),
            }
        }

        tracing::info!(queue = %self.queue, "foreman stopped");
    }

}

impl std::fmt::Debug for Foreman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Foreman")
            .field("queue", &self.queue)
            .field("workers", &self.workers)
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

async fn worker_loop(
    worker_id: String,
    queue: QueueName,
    rt: Arc<Runtime>,
    registry: Arc<HandlerRegistry>,
    shutdown: ShutdownToken,
) {
    loop {
        if shutdown.is_cancelled() {
            tracing::info!(worker = %worker_id, "worker shutting down");
            return;
        }

        match rt.store.pop(queue).await {
            Ok(Some(task)) => {
                process_task(&worker_id, queue, &rt, &registry, task).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
            Err(err) => {
                tracing::warn!(worker = %worker_id, queue = %queue, "pop error: {:#}", err);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Run one task: dispatch by type, enforce the per-type deadline, recover
/// panics and apply the retry policy for its error kind.
async fn process_task(
    worker_id: &str,
    queue: QueueName,
    rt: &Arc<Runtime>,
    registry: &HandlerRegistry,
    task: Task,
) {
    let task_type = task.task_type;
    let org_id = task.org_id;

    let Some(handler) = registry.get(task_type) else {
        tracing::error!(
            worker = %worker_id,
            task_type = %task_type,
            org_id = %org_id,
            "unknown task type, dropping"
        );
        return;
    };

    let deadline = task_deadline(task_type);
    let timing = telemetry::start_task(queue, task_type, task.queued_on);

    // run the handler in its own tokio task so a panic is contained
    let retry = task.clone();
    let handler_rt = rt.clone();
    let mut join = tokio::spawn(async move { handler.handle(handler_rt, task).await });

    let outcome = match tokio::time::timeout(deadline, &mut join).await {
        Err(_) => {
            join.abort();
            Err(TaskError::Transient(anyhow::anyhow!(
                "task exceeded {}s deadline",
                deadline.as_secs()
            )))
        }
        Ok(Err(join_err)) if join_err.is_panic() => {
            tracing::error!(
                worker = %worker_id,
                task_type = %task_type,
                org_id = %org_id,
                "handler panicked: {:?}",
                join_err
            );
            telemetry::record_task_panic(queue, task_type);
            timing.finish("panicked");
            return;
        }
        Ok(Err(join_err)) => Err(TaskError::Transient(join_err.into())),
        Ok(Ok(result)) => result,
    };

    match outcome {
        Ok(()) => {
            timing.finish("success");
        }
        Err(TaskError::Transient(err)) => {
            timing.finish("errored");
            let attempts = retry.error_count + 1;
            if attempts < rt.config.max_task_retries {
                tracing::error!(
                    worker = %worker_id,
                    task_type = %task_type,
                    org_id = %org_id,
                    error_count = attempts,
                    "error handling task, requeuing: {:#}",
                    err
                );
                tokio::time::sleep(Duration::from_millis(rt.config.retry_backoff_ms)).await;
                let mut requeued = retry;
                requeued.error_count = attempts;
                if let Err(push_err) = rt
                    .store
                    .push(queue, org_id, &requeued, TaskPriority::Default)
                    .await
                {
                    tracing::error!("error requeuing errored task: {:#}", push_err);
                }
            } else {
                tracing::error!(
                    worker = %worker_id,
                    task_type = %task_type,
                    org_id = %org_id,
                    "error handling task, permanent failure: {:#}",
                    err
                );
            }
        }
        Err(TaskError::DataMissing(what)) => {
            timing.finish("skipped");
            tracing::info!(task_type = %task_type, org_id = %org_id, "ignoring task: {}", what);
        }
        Err(TaskError::Stale) => {
            timing.finish("stale");
        }
        Err(TaskError::UserInput(msg)) => {
            timing.finish("rejected");
            tracing::info!(task_type = %task_type, org_id = %org_id, "user error: {}", msg);
        }
        Err(TaskError::Invariant(msg)) => {
            timing.finish("invariant");
            tracing::error!(task_type = %task_type, org_id = %org_id, "invariant violation: {}", msg);
        }
    }
}
