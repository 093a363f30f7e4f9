use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use uuid::Uuid;

use crate::models::{ChannelId, ContactId, OrgId};

/// Token proving ownership of a held lease. Fresh random 128 bits per
/// acquisition so a release can never delete a lease that has expired and
/// been reissued to another holder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LeaseToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Name of the lock serializing all event processing for one contact.
pub fn contact_lock(org: OrgId, contact: ContactId) -> String {
    format!("lock:contact:{}:{}", org, contact)
}

/// Name of the lock serializing sends on one channel.
pub fn channel_lock(org: OrgId, channel: ChannelId) -> String {
    format!("lock:channel:{}:{}", org, channel)
}

/// Distributed per-key mutual exclusion with TTL over the shared KV store.
///
/// The TTL must be strictly longer than the longest expected critical
/// section; holders must treat losing the lease as possible and not rely on
/// holding it beyond the TTL.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Attempt to take the named lease once. Returns the token on success,
    /// `None` if another holder has it.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> anyhow::Result<Option<LeaseToken>>;

    /// Release the named lease. A release whose token does not match the
    /// current holder is a no-op; returns whether the lease was deleted.
    async fn release(&self, name: &str, token: &LeaseToken) -> anyhow::Result<bool>;

    /// Acquire with bounded waiting: busy-polls with jittered backoff until
    /// the lease is taken or `max_wait` has elapsed.
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> anyhow::Result<Option<LeaseToken>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut delay = Duration::from_millis(25);

        loop {
            if let Some(token) = self.try_acquire(name, ttl).await? {
                return Ok(Some(token));
            }
            if tokio::time::Instant::now() + delay > deadline {
                return Ok(None);
            }
            tokio::time::sleep(jittered(delay)).await;
            delay = std::cmp::min(delay * 2, Duration::from_millis(500));
        }
    }
}

/// Add up to 50% random jitter so contending acquirers don't poll in step.
fn jittered(delay: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
    delay + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = LeaseToken::generate();
        let b = LeaseToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_lock_names() {
        assert_eq!(contact_lock(OrgId(3), ContactId(9)), "lock:contact:3:9");
        assert_eq!(channel_lock(OrgId(3), ChannelId(4)), "lock:channel:3:4");
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let j = jittered(base);
            assert!(j >= base && j <= base + Duration::from_millis(50));
        }
    }
}
