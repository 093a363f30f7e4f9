//! Foreman and contact-loop integration tests on the in-memory store.
//!
//! Covers dispatch by type, bounded retry, unknown-type handling, panic
//! recovery, graceful shutdown and the contact lock contention path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

use switchyard::error::TaskError;
use switchyard::lock::{contact_lock, LeaseLock};
use switchyard::models::{ContactId, OrgId};
use switchyard::queue::{ContactSpool, QueueName, TaskQueue};
use switchyard::runtime::{Foreman, HandlerRegistry};
use switchyard::task::{Task, TaskPriority, TaskType};
use switchyard::tasks::contacts::{self, HandleEventTask};
use switchyard::{Config, Runtime};
use switchyard_testkit::{MemoryStore, MockEngine, MockSearcher};

fn test_runtime(store: Arc<MemoryStore>) -> Arc<Runtime> {
    // lazy pool: none of these tests touch the database
    let db = PgPoolOptions::new()
        .connect_lazy("postgres://localhost:5432/switchyard_test")
        .expect("lazy pool");

    let config = Config {
        contact_lock_wait_secs: 1,
        retry_backoff_ms: 50,
        ..Config::default()
    };

    Arc::new(
        Runtime::builder(config)
            .with_db(db)
            .with_store(store)
            .with_engine(Arc::new(MockEngine::new()))
            .with_searcher(Arc::new(MockSearcher::new()))
            .build()
            .expect("runtime"),
    )
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn marker_task(org: OrgId, marker: i64) -> Task {
    Task::new(TaskType::StartFlow, org, &serde_json::json!({ "marker": marker })).unwrap()
}

#[tokio::test]
async fn test_foreman_dispatches_by_type() {
    let store = Arc::new(MemoryStore::new());
    let rt = test_runtime(store.clone());

    let processed = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let processed = processed.clone();
        registry.register_fn(TaskType::StartFlow, move |_rt, _task| {
            let processed = processed.clone();
            async move {
                processed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }

    for org in [OrgId(1), OrgId(2)] {
        for i in 0..3 {
            store
                .push(QueueName::Batch, org, &marker_task(org, i), TaskPriority::Default)
                .await
                .unwrap();
        }
    }

    let foreman = Foreman::new(QueueName::Batch, 2, Arc::new(registry));
    foreman.start(rt).await;

    assert!(
        wait_until(
            || processed.load(Ordering::SeqCst) == 6,
            Duration::from_secs(5)
        )
        .await,
        "expected 6 tasks processed, got {}",
        processed.load(Ordering::SeqCst)
    );

    foreman.stop().await;
}

#[tokio::test]
async fn test_deterministic_failure_is_retried_at_most_three_times() {
    let store = Arc::new(MemoryStore::new());
    let rt = test_runtime(store.clone());

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let invocations = invocations.clone();
        registry.register_fn(TaskType::StartFlow, move |_rt, _task| {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::Transient(anyhow::anyhow!("boom")))
            }
        });
    }

    store
        .push(
            QueueName::Batch,
            OrgId(1),
            &marker_task(OrgId(1), 1),
            TaskPriority::Default,
        )
        .await
        .unwrap();

    let foreman = Foreman::new(QueueName::Batch, 1, Arc::new(registry));
    foreman.start(rt).await;

    assert!(
        wait_until(
            || invocations.load(Ordering::SeqCst) >= 3,
            Duration::from_secs(5)
        )
        .await
    );

    // let any stray requeue surface, then confirm the bound held
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(store.size(QueueName::Batch).await.unwrap(), 0);

    foreman.stop().await;
}

#[tokio::test]
async fn test_unknown_task_type_is_dropped_not_retried() {
    let store = Arc::new(MemoryStore::new());
    let rt = test_runtime(store.clone());

    // registry with no handler for start_flow
    let registry = Arc::new(HandlerRegistry::new());

    store
        .push(
            QueueName::Batch,
            OrgId(1),
            &marker_task(OrgId(1), 1),
            TaskPriority::Default,
        )
        .await
        .unwrap();

    let foreman = Foreman::new(QueueName::Batch, 1, registry);
    foreman.start(rt).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.size(QueueName::Batch).await.unwrap() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "unknown task was never drained"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.size(QueueName::Batch).await.unwrap(), 0);

    foreman.stop().await;
}

#[tokio::test]
async fn test_worker_survives_handler_panic() {
    let store = Arc::new(MemoryStore::new());
    let rt = test_runtime(store.clone());

    let processed = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let processed = processed.clone();
        registry.register_fn(TaskType::StartFlow, move |_rt, task: Task| {
            let processed = processed.clone();
            async move {
                if task.task["marker"] == 1 {
                    panic!("handler exploded");
                }
                processed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }

    store
        .push(
            QueueName::Batch,
            OrgId(1),
            &marker_task(OrgId(1), 1),
            TaskPriority::Default,
        )
        .await
        .unwrap();
    store
        .push(
            QueueName::Batch,
            OrgId(1),
            &marker_task(OrgId(1), 2),
            TaskPriority::Default,
        )
        .await
        .unwrap();

    let foreman = Foreman::new(QueueName::Batch, 1, Arc::new(registry));
    foreman.start(rt).await;

    // the panicking task is dropped, the next one still runs
    assert!(
        wait_until(
            || processed.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5)
        )
        .await
    );

    foreman.stop().await;
}

#[tokio::test]
async fn test_graceful_shutdown_finishes_in_flight_task() {
    let store = Arc::new(MemoryStore::new());
    let rt = test_runtime(store.clone());

    let completed = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let completed = completed.clone();
        registry.register_fn(TaskType::StartFlow, move |_rt, _task| {
            let completed = completed.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }

    store
        .push(
            QueueName::Batch,
            OrgId(1),
            &marker_task(OrgId(1), 1),
            TaskPriority::Default,
        )
        .await
        .unwrap();

    let foreman = Foreman::new(QueueName::Batch, 1, Arc::new(registry));
    foreman.start(rt).await;

    // give the worker time to pick the task up, then stop
    tokio::time::sleep(Duration::from_millis(50)).await;
    foreman.stop().await;

    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_lock_contention_requeues_summary_without_duplicating_events() {
    let store = Arc::new(MemoryStore::new());
    let rt = test_runtime(store.clone());

    let org = OrgId(1);
    let contact = ContactId(7);

    // simulate another worker holding this contact
    let _held = store
        .try_acquire(&contact_lock(org, contact), Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let event = Task::new(TaskType::StartFlow, org, &serde_json::json!({})).unwrap();
    store.push_event(org, contact, &event, false).await.unwrap();

    let summary = Task::new(TaskType::HandleContactEvent, org, &HandleEventTask { contact_id: contact }).unwrap();
    contacts::handle_contact_event(rt, summary).await.unwrap();

    // the summary was requeued, the event itself was not touched
    let queued = store.queued_tasks(QueueName::Handler);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].task_type, TaskType::HandleContactEvent);
    assert_eq!(store.contact_events(org, contact).len(), 1);
}

#[tokio::test]
async fn test_drain_drops_unknown_contact_event_and_releases_lock() {
    let store = Arc::new(MemoryStore::new());
    let rt = test_runtime(store.clone());

    let org = OrgId(1);
    let contact = ContactId(8);

    // start_flow is not a contact-level event type
    let bogus = Task::new(TaskType::StartFlow, org, &serde_json::json!({})).unwrap();
    store.push_event(org, contact, &bogus, false).await.unwrap();

    let summary = Task::new(TaskType::HandleContactEvent, org, &HandleEventTask { contact_id: contact }).unwrap();
    contacts::handle_contact_event(rt, summary).await.unwrap();

    assert!(store.contact_events(org, contact).is_empty());
    assert!(!store.lock_held(&contact_lock(org, contact)));
}
