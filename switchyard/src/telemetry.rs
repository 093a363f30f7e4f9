//! Tracing spans and timing helpers for task processing.
//!
//! Each processed task gets an elapsed observation (handler run time) and a
//! latency observation (time since it was first queued). With the `metrics`
//! feature enabled these also feed the Prometheus collectors; without it
//! they degrade to structured logs.

use chrono::{DateTime, Utc};
use tracing::{info_span, Span};

use crate::queue::QueueName;
use crate::task::TaskType;

/// Create a tracing span for one task dispatch.
#[must_use]
pub fn task_span(queue: QueueName, task_type: TaskType, org_id: i64) -> Span {
    info_span!(
        "switchyard.task",
        queue = %queue,
        task_type = %task_type,
        org_id = org_id,
    )
}

/// Handle tracking one task's processing time.
#[derive(Debug)]
pub struct TaskTiming {
    queue: QueueName,
    task_type: TaskType,
    queued_on: DateTime<Utc>,
    started: std::time::Instant,
}

/// Begin timing a task that was just popped.
pub fn start_task(queue: QueueName, task_type: TaskType, queued_on: DateTime<Utc>) -> TaskTiming {
    TaskTiming {
        queue,
        task_type,
        queued_on,
        started: std::time::Instant::now(),
    }
}

impl TaskTiming {
    /// Record the task's elapsed and queue latency with its final status.
    pub fn finish(self, status: &str) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let latency = (Utc::now() - self.queued_on)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        tracing::debug!(
            queue = %self.queue,
            task_type = %self.task_type,
            status = status,
            elapsed = elapsed,
            latency = latency,
            "task finished"
        );

        #[cfg(feature = "metrics")]
        crate::metrics::observe_task(
            self.queue.as_str(),
            self.task_type.as_str(),
            status,
            elapsed,
            latency,
        );
    }
}

/// Record a recovered handler panic.
pub fn record_task_panic(queue: QueueName, task_type: TaskType) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_panic(queue.as_str(), task_type.as_str());

    let _ = (queue, task_type);
}

/// Record the handling time of one contact-level event.
pub fn record_contact_event(event_type: TaskType, elapsed_secs: f64, latency_secs: f64) {
    tracing::debug!(
        event_type = %event_type,
        elapsed = elapsed_secs,
        latency = latency_secs,
        "contact event handled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_contact_event(event_type.as_str(), elapsed_secs, latency_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_span_name() {
        let span = task_span(QueueName::Handler, TaskType::MsgEvent, 1);
        assert_eq!(span.metadata().unwrap().name(), "switchyard.task");
    }

    #[test]
    fn test_timing_finish_does_not_panic() {
        let timing = start_task(QueueName::Batch, TaskType::StartFlow, Utc::now());
        std::thread::sleep(std::time::Duration::from_millis(1));
        timing.finish("success");
    }
}
