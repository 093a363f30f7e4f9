//! Prometheus metrics, compiled behind the `metrics` feature flag.
//!
//! ## Counters
//! - `switchyard_tasks_total` - tasks processed, by queue, type and status
//! - `switchyard_task_panics_total` - recovered handler panics
//!
//! ## Histograms
//! - `switchyard_task_duration_seconds` - handler run time
//! - `switchyard_task_latency_seconds` - queue wait time
//! - `switchyard_contact_event_duration_seconds` - per contact-event handling
//! - `switchyard_contact_event_latency_seconds` - contact-event queue wait
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for switchyard metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static TASKS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("switchyard_tasks_total", "Total number of tasks processed");
    CounterVec::new(opts, &["queue", "task_type", "status"])
        .expect("switchyard_tasks_total metric creation failed")
});

pub static TASK_PANICS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "switchyard_task_panics_total",
        "Total number of recovered handler panics",
    );
    CounterVec::new(opts, &["queue", "task_type"])
        .expect("switchyard_task_panics_total metric creation failed")
});

pub static TASK_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "switchyard_task_duration_seconds",
        "Task handler run time in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["queue", "task_type", "status"])
        .expect("switchyard_task_duration_seconds metric creation failed")
});

pub static TASK_LATENCY_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "switchyard_task_latency_seconds",
        "Time between task enqueue and completion in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["queue", "task_type"])
        .expect("switchyard_task_latency_seconds metric creation failed")
});

pub static CONTACT_EVENT_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "switchyard_contact_event_duration_seconds",
        "Contact event handling time in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["event_type"])
        .expect("switchyard_contact_event_duration_seconds metric creation failed")
});

pub static CONTACT_EVENT_LATENCY_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "switchyard_contact_event_latency_seconds",
        "Time between contact event enqueue and handling in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["event_type"])
        .expect("switchyard_contact_event_latency_seconds metric creation failed")
});

/// Register all collectors with the global registry. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(TASKS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(TASK_PANICS_TOTAL.clone()),
        Box::new(TASK_DURATION_SECONDS.clone()),
        Box::new(TASK_LATENCY_SECONDS.clone()),
        Box::new(CONTACT_EVENT_DURATION_SECONDS.clone()),
        Box::new(CONTACT_EVENT_LATENCY_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn observe_task(queue: &str, task_type: &str, status: &str, elapsed: f64, latency: f64) {
    TASKS_TOTAL
        .with_label_values(&[queue, task_type, status])
        .inc();
    TASK_DURATION_SECONDS
        .with_label_values(&[queue, task_type, status])
        .observe(elapsed);
    TASK_LATENCY_SECONDS
        .with_label_values(&[queue, task_type])
        .observe(latency);
}

pub fn record_panic(queue: &str, task_type: &str) {
    TASK_PANICS_TOTAL.with_label_values(&[queue, task_type]).inc();
}

pub fn observe_contact_event(event_type: &str, elapsed: f64, latency: f64) {
    CONTACT_EVENT_DURATION_SECONDS
        .with_label_values(&[event_type])
        .observe(elapsed);
    CONTACT_EVENT_LATENCY_SECONDS
        .with_label_values(&[event_type])
        .observe(latency);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
    }

    #[test]
    fn test_observe_task() {
        observe_task("handler", "msg_event", "success", 0.05, 0.2);
        observe_task("batch", "start_flow", "errored", 1.5, 3.0);
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");
        observe_task("handler", "msg_event", "success", 0.05, 0.2);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("switchyard_tasks_total"));
    }
}
