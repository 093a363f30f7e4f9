use std::fmt::Display;

use async_trait::async_trait;
use chrono::Utc;

use crate::models::{ContactId, OrgId};
use crate::task::{Task, TaskPriority};

/// The two shared queues. `Handler` carries low-latency per-contact events,
/// `Batch` carries throughput-oriented bulk work.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum QueueName {
    Handler,
    Batch,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Handler => "handler",
            QueueName::Batch => "batch",
        }
    }
}

impl Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far a continuously busy owner's score advances per pop. Any owner that
/// becomes active enters the index at the current clock and is therefore
/// served before an owner that has already accumulated stride advances.
pub const OWNER_STRIDE_MS: i64 = 10_000;

/// How far ahead of the clock a high-priority enqueue places a newly active
/// owner.
pub const HIGH_PRIORITY_BOOST_MS: i64 = OWNER_STRIDE_MS;

/// Current logical clock for queue scores, in epoch milliseconds.
pub fn score_clock() -> i64 {
    Utc::now().timestamp_millis()
}

/// Score for an owner being inserted into the active index.
pub fn enqueue_score(clock_ms: i64, priority: TaskPriority) -> i64 {
    match priority {
        TaskPriority::High => clock_ms - HIGH_PRIORITY_BOOST_MS,
        TaskPriority::Default => clock_ms,
    }
}

/// Score for an owner re-inserted after a pop left its list non-empty. The
/// stride bounds how fast a single owner can advance, which is what yields
/// the 1/N fairness share when N owners are saturating the queue.
pub fn requeue_score(clock_ms: i64, prior_score: i64) -> i64 {
    std::cmp::max(clock_ms, prior_score + OWNER_STRIDE_MS)
}

/// Fair, priority-aware multi-owner task queue over the shared KV store.
///
/// Implementors must guarantee pop-under-lock semantics: a payload is never
/// observed by two callers of [`TaskQueue::pop`].
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Push a task onto the owner's list for the queue, registering the
    /// owner in the active index if it was idle.
    async fn push(
        &self,
        queue: QueueName,
        owner: OrgId,
        task: &Task,
        priority: TaskPriority,
    ) -> anyhow::Result<()>;

    /// Pop one task from the owner with the lowest next-eligible score.
    /// Returns `None` when no owner has queued work.
    async fn pop(&self, queue: QueueName) -> anyhow::Result<Option<Task>>;

    /// Total number of queued tasks across all owners.
    async fn size(&self, queue: QueueName) -> anyhow::Result<usize>;
}

/// The per-contact event list, keyed `c:{org_id}:{contact_id}`. The list
/// holds full contact-event task bodies; the shared `handler` queue only
/// carries a summary task naming the contact.
#[async_trait]
pub trait ContactSpool: Send + Sync {
    /// Append an event for the contact; `front` inserts at the head, used
    /// for retries that must be reattempted before newer events.
    async fn push_event(
        &self,
        org: OrgId,
        contact: ContactId,
        task: &Task,
        front: bool,
    ) -> anyhow::Result<()>;

    /// Pop the next event for the contact, if any.
    async fn pop_event(&self, org: OrgId, contact: ContactId) -> anyhow::Result<Option<Task>>;
}

/// The provider-side outbound message spool, one list per channel. The
/// courier process consuming it is an external collaborator.
#[async_trait]
pub trait CourierSpool: Send + Sync {
    async fn push_msg(
        &self,
        channel_uuid: uuid::Uuid,
        payload: &serde_json::Value,
        high_priority: bool,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_score_high_jumps_ahead() {
        let clock = 1_000_000;
        assert_eq!(enqueue_score(clock, TaskPriority::Default), clock);
        assert!(enqueue_score(clock, TaskPriority::High) < clock);
    }

    #[test]
    fn test_requeue_score_advances_by_stride_under_burst() {
        // many pops inside the same clock tick keep advancing the owner
        let clock = 1_000_000;
        let s1 = requeue_score(clock, clock);
        let s2 = requeue_score(clock, s1);
        assert_eq!(s1, clock + OWNER_STRIDE_MS);
        assert_eq!(s2, clock + 2 * OWNER_STRIDE_MS);
    }

    #[test]
    fn test_requeue_score_catches_up_to_clock() {
        // an owner whose score fell far behind re-enters at the clock
        let clock = 1_000_000;
        assert_eq!(requeue_score(clock, clock - 60_000), clock);
    }
}
