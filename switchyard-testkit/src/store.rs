use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use switchyard::lock::{LeaseLock, LeaseToken};
use switchyard::models::{ContactId, OrgId};
use switchyard::queue::{
    enqueue_score, requeue_score, ContactSpool, CourierSpool, QueueName, TaskQueue,
};
use switchyard::task::{Task, TaskPriority};

#[derive(Default)]
struct QueueState {
    /// Active owner index ordered by (score, owner).
    index: BTreeSet<(i64, i64)>,
    scores: HashMap<i64, i64>,
    lists: HashMap<i64, VecDeque<Task>>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<&'static str, QueueState>,
    contacts: HashMap<(i64, i64), VecDeque<Task>>,
    courier: HashMap<Uuid, Vec<(serde_json::Value, bool)>>,
    locks: HashMap<String, (String, Instant)>,
    /// Logical clock in milliseconds; strictly monotonic so tests are
    /// deterministic regardless of wall time.
    clock: i64,
}

impl Inner {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn queue(&mut self, queue: QueueName) -> &mut QueueState {
        self.queues.entry(queue.as_str()).or_default()
    }
}

/// In-memory implementation of the full store surface, with identical
/// owner-scoring behavior to the Redis Lua scripts.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            inner: Arc::new(Mutex::new(Inner {
                clock: 1_000_000,
                ..Inner::default()
            })),
        }
    }

    /// Snapshot of all tasks queued across owners, in owner-index order.
    pub fn queued_tasks(&self, queue: QueueName) -> Vec<Task> {
        let mut inner = self.inner.lock();
        let state = inner.queue(queue);
        let mut tasks = Vec::new();
        for (_, owner) in state.index.iter() {
            if let Some(list) = state.lists.get(owner) {
                tasks.extend(list.iter().cloned());
            }
        }
        tasks
    }

    /// Snapshot of one contact's pending events.
    pub fn contact_events(&self, org: OrgId, contact: ContactId) -> Vec<Task> {
        let inner = self.inner.lock();
        inner
            .contacts
            .get(&(org.0, contact.0))
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the courier spool for one channel.
    pub fn courier_msgs(&self, channel_uuid: Uuid) -> Vec<serde_json::Value> {
        let inner = self.inner.lock();
        inner
            .courier
            .get(&channel_uuid)
            .map(|msgs| msgs.iter().map(|(v, _)| v.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether a lease is currently held.
    pub fn lock_held(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .locks
            .get(name)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }
}

#[async_trait]
impl TaskQueue for MemoryStore {
    async fn push(
        &self,
        queue: QueueName,
        owner: OrgId,
        task: &Task,
        priority: TaskPriority,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let clock = inner.tick();
        let state = inner.queue(queue);

        let list = state.lists.entry(owner.0).or_default();
        match priority {
            TaskPriority::High => list.push_front(task.clone()),
            TaskPriority::Default => list.push_back(task.clone()),
        }

        if !state.scores.contains_key(&owner.0) {
            let score = enqueue_score(clock, priority);
            state.scores.insert(owner.0, score);
            state.index.insert((score, owner.0));
        }
        Ok(())
    }

    async fn pop(&self, queue: QueueName) -> anyhow::Result<Option<Task>> {
        let mut inner = self.inner.lock();
        let clock = inner.tick();
        let state = inner.queue(queue);

        let Some(&(score, owner)) = state.index.iter().next() else {
            return Ok(None);
        };

        let Some(list) = state.lists.get_mut(&owner) else {
            state.index.remove(&(score, owner));
            state.scores.remove(&owner);
            return Ok(None);
        };

        let task = list.pop_front();
        state.index.remove(&(score, owner));
        if list.is_empty() {
            state.lists.remove(&owner);
            state.scores.remove(&owner);
        } else {
            let bumped = requeue_score(clock, score);
            state.scores.insert(owner, bumped);
            state.index.insert((bumped, owner));
        }

        Ok(task)
    }

    async fn size(&self, queue: QueueName) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock();
        let state = inner.queue(queue);
        Ok(state.lists.values().map(VecDeque::len).sum())
    }
}

#[async_trait]
impl ContactSpool for MemoryStore {
    async fn push_event(
        &self,
        org: OrgId,
        contact: ContactId,
        task: &Task,
        front: bool,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let list = inner.contacts.entry((org.0, contact.0)).or_default();
        if front {
            list.push_front(task.clone());
        } else {
            list.push_back(task.clone());
        }
        Ok(())
    }

    async fn pop_event(&self, org: OrgId, contact: ContactId) -> anyhow::Result<Option<Task>> {
        let mut inner = self.inner.lock();
        Ok(inner
            .contacts
            .get_mut(&(org.0, contact.0))
            .and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl CourierSpool for MemoryStore {
    async fn push_msg(
        &self,
        channel_uuid: Uuid,
        payload: &serde_json::Value,
        high_priority: bool,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner
            .courier
            .entry(channel_uuid)
            .or_default()
            .push((payload.clone(), high_priority));
        Ok(())
    }
}

#[async_trait]
impl LeaseLock for MemoryStore {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> anyhow::Result<Option<LeaseToken>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if let Some((_, expires)) = inner.locks.get(name) {
            if *expires > now {
                return Ok(None);
            }
        }

        let token = LeaseToken::generate();
        inner
            .locks
            .insert(name.to_string(), (token.as_str().to_string(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, name: &str, token: &LeaseToken) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();
        match inner.locks.get(name) {
            Some((held, _)) if held == token.as_str() => {
                inner.locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
