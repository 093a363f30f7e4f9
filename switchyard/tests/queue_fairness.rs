//! Fairness, priority and lease-lock properties of the store.
//!
//! These run against the in-memory store, which shares its owner-scoring
//! arithmetic with the Redis scripts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use switchyard::lock::LeaseLock;
use switchyard::models::{ContactId, OrgId};
use switchyard::queue::{ContactSpool, QueueName, TaskQueue};
use switchyard::task::{Task, TaskPriority, TaskType};
use switchyard_testkit::MemoryStore;

fn noop_task(org: OrgId, marker: i64) -> Task {
    Task::new(
        TaskType::StartFlow,
        org,
        &serde_json::json!({ "marker": marker }),
    )
    .unwrap()
}

#[tokio::test]
async fn test_fairness_across_saturating_owners() {
    let store = MemoryStore::new();
    let owners: Vec<OrgId> = (1..=4).map(OrgId).collect();
    let per_owner = 50usize;

    for owner in &owners {
        for i in 0..per_owner {
            store
                .push(
                    QueueName::Batch,
                    *owner,
                    &noop_task(*owner, i as i64),
                    TaskPriority::Default,
                )
                .await
                .unwrap();
        }
    }

    // pop a window of N*K tasks and count the share each owner got
    let window = owners.len() * 40;
    let mut counts: HashMap<OrgId, usize> = HashMap::new();
    for _ in 0..window {
        let task = store.pop(QueueName::Batch).await.unwrap().unwrap();
        *counts.entry(task.org_id).or_default() += 1;
    }

    let fair_share = window / owners.len();
    for owner in &owners {
        let got = counts.get(owner).copied().unwrap_or(0);
        let deviation = (got as f64 - fair_share as f64).abs() / fair_share as f64;
        assert!(
            deviation <= 0.10,
            "owner {} got {} of fair share {}",
            owner,
            got,
            fair_share
        );
    }
}

#[tokio::test]
async fn test_fairness_independent_of_queue_depth() {
    let store = MemoryStore::new();
    let heavy = OrgId(1);
    let light = OrgId(2);

    for i in 0..1000 {
        store
            .push(QueueName::Batch, heavy, &noop_task(heavy, i), TaskPriority::Default)
            .await
            .unwrap();
    }
    for i in 0..20 {
        store
            .push(QueueName::Batch, light, &noop_task(light, i), TaskPriority::Default)
            .await
            .unwrap();
    }

    // while both owners have work, pops alternate regardless of depth
    let mut light_seen = 0;
    for _ in 0..40 {
        let task = store.pop(QueueName::Batch).await.unwrap().unwrap();
        if task.org_id == light {
            light_seen += 1;
        }
    }
    assert_eq!(light_seen, 20, "light owner should drain its full backlog");
}

#[tokio::test]
async fn test_priority_precedence_within_owner() {
    let store = MemoryStore::new();
    let owner = OrgId(1);

    store
        .push(QueueName::Batch, owner, &noop_task(owner, 1), TaskPriority::Default)
        .await
        .unwrap();
    store
        .push(QueueName::Batch, owner, &noop_task(owner, 2), TaskPriority::Default)
        .await
        .unwrap();
    // arrives last, served first
    store
        .push(QueueName::Batch, owner, &noop_task(owner, 3), TaskPriority::High)
        .await
        .unwrap();

    let first = store.pop(QueueName::Batch).await.unwrap().unwrap();
    assert_eq!(first.task["marker"], 3);
    let second = store.pop(QueueName::Batch).await.unwrap().unwrap();
    assert_eq!(second.task["marker"], 1);
}

#[tokio::test]
async fn test_high_priority_owner_jumps_ahead() {
    let store = MemoryStore::new();
    let busy = OrgId(1);
    let urgent = OrgId(2);

    for i in 0..10 {
        store
            .push(QueueName::Batch, busy, &noop_task(busy, i), TaskPriority::Default)
            .await
            .unwrap();
    }
    // pop a few so the busy owner's score has accumulated stride
    for _ in 0..3 {
        store.pop(QueueName::Batch).await.unwrap().unwrap();
    }

    store
        .push(QueueName::Batch, urgent, &noop_task(urgent, 99), TaskPriority::High)
        .await
        .unwrap();

    let next = store.pop(QueueName::Batch).await.unwrap().unwrap();
    assert_eq!(next.org_id, urgent);
}

#[tokio::test]
async fn test_empty_owner_leaves_active_index() {
    let store = MemoryStore::new();
    let owner = OrgId(1);

    store
        .push(QueueName::Handler, owner, &noop_task(owner, 1), TaskPriority::Default)
        .await
        .unwrap();

    assert_eq!(store.size(QueueName::Handler).await.unwrap(), 1);
    assert!(store.pop(QueueName::Handler).await.unwrap().is_some());
    assert!(store.pop(QueueName::Handler).await.unwrap().is_none());
    assert_eq!(store.size(QueueName::Handler).await.unwrap(), 0);
}

#[tokio::test]
async fn test_queues_are_independent() {
    let store = MemoryStore::new();
    let owner = OrgId(1);

    store
        .push(QueueName::Batch, owner, &noop_task(owner, 1), TaskPriority::Default)
        .await
        .unwrap();

    assert!(store.pop(QueueName::Handler).await.unwrap().is_none());
    assert!(store.pop(QueueName::Batch).await.unwrap().is_some());
}

#[tokio::test]
async fn test_contact_spool_order_and_head_insert() {
    let store = MemoryStore::new();
    let org = OrgId(1);
    let contact = ContactId(9);

    store
        .push_event(org, contact, &noop_task(org, 1), false)
        .await
        .unwrap();
    store
        .push_event(org, contact, &noop_task(org, 2), false)
        .await
        .unwrap();
    // a retry goes back to the head
    store
        .push_event(org, contact, &noop_task(org, 3), true)
        .await
        .unwrap();

    let order: Vec<i64> = [
        store.pop_event(org, contact).await.unwrap().unwrap(),
        store.pop_event(org, contact).await.unwrap().unwrap(),
        store.pop_event(org, contact).await.unwrap().unwrap(),
    ]
    .iter()
    .map(|t| t.task["marker"].as_i64().unwrap())
    .collect();

    assert_eq!(order, vec![3, 1, 2]);
    assert!(store.pop_event(org, contact).await.unwrap().is_none());
}

#[tokio::test]
async fn test_lease_lock_mutual_exclusion() {
    let store = MemoryStore::new();
    let ttl = Duration::from_secs(60);

    let token = store.try_acquire("lock:contact:1:1", ttl).await.unwrap();
    assert!(token.is_some());

    // second acquire attempt fails while held
    let second = store.try_acquire("lock:contact:1:1", ttl).await.unwrap();
    assert!(second.is_none());

    // other keys are unaffected
    let other = store.try_acquire("lock:contact:1:2", ttl).await.unwrap();
    assert!(other.is_some());
}

#[tokio::test]
async fn test_lease_release_requires_matching_token() {
    let store = MemoryStore::new();
    let ttl = Duration::from_secs(60);

    let token = store
        .try_acquire("lock:contact:1:1", ttl)
        .await
        .unwrap()
        .unwrap();

    // a stranger's token is a no-op
    let stranger = switchyard::lock::LeaseToken::generate();
    assert!(!store.release("lock:contact:1:1", &stranger).await.unwrap());
    assert!(store.lock_held("lock:contact:1:1"));

    assert!(store.release("lock:contact:1:1", &token).await.unwrap());
    assert!(!store.lock_held("lock:contact:1:1"));
}

#[tokio::test]
async fn test_lease_expires_and_can_be_retaken() {
    let store = MemoryStore::new();

    let first = store
        .try_acquire("lock:contact:1:1", Duration::from_millis(30))
        .await
        .unwrap();
    assert!(first.is_some());

    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = store
        .try_acquire("lock:contact:1:1", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(second.is_some(), "expired lease should be reissuable");

    // the first holder's release must not delete the reissued lease
    assert!(!store
        .release("lock:contact:1:1", &first.unwrap())
        .await
        .unwrap());
    assert!(store.lock_held("lock:contact:1:1"));
}

#[tokio::test]
async fn test_acquire_waits_for_release() {
    let store = Arc::new(MemoryStore::new());
    let ttl = Duration::from_secs(60);

    let token = store
        .try_acquire("lock:contact:1:1", ttl)
        .await
        .unwrap()
        .unwrap();

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .acquire("lock:contact:1:1", ttl, Duration::from_secs(5))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    store.release("lock:contact:1:1", &token).await.unwrap();

    let acquired = waiter.await.unwrap().unwrap();
    assert!(acquired.is_some(), "waiter should take the lock after release");
}

#[tokio::test]
async fn test_concurrent_critical_sections_never_overlap() {
    let store = Arc::new(MemoryStore::new());
    let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let max_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let active = active.clone();
        let max_seen = max_seen.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                let token = store
                    .acquire(
                        "lock:contact:5:5",
                        Duration::from_secs(60),
                        Duration::from_secs(10),
                    )
                    .await
                    .unwrap()
                    .expect("lock acquire timed out");

                let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);

                store.release("lock:contact:5:5", &token).await.unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(
        max_seen.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "two holders were inside the critical section at once"
    );
}
