use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use crate::lock::{LeaseLock, LeaseToken};
use crate::models::{ContactId, OrgId};
use crate::queue::{
    enqueue_score, score_clock, ContactSpool, CourierSpool, QueueName, TaskQueue, OWNER_STRIDE_MS,
};
use crate::task::{Task, TaskPriority};

/// Key layout:
///
/// - `q:{queue}:owners` - sorted index of active owners by next-eligible score
/// - `q:{queue}:o:{owner}` - per-owner list of task payloads (JSON)
/// - `c:{org}:{contact}` - per-contact event list (JSON payloads)
/// - `msgs:{channel_uuid}` - courier spool consumed by the send process
/// - `lock:{scope}:{key}` - current lease token, TTL set on write
///
/// The fair pop walks the owner index, pops one payload and either drops the
/// owner from the index or bumps its score; it runs as a single Lua script so
/// no payload is ever observed by two workers.
const POP_SCRIPT: &str = r#"
local owners = KEYS[1]
local clock = tonumber(ARGV[1])
local stride = tonumber(ARGV[2])
local queue = ARGV[3]

local head = redis.call("ZRANGE", owners, 0, 0, "WITHSCORES")
if #head == 0 then
    return false
end
local owner = head[1]
local score = tonumber(head[2])
local list = "q:" .. queue .. ":o:" .. owner

local payload = redis.call("LPOP", list)
if not payload then
    redis.call("ZREM", owners, owner)
    return false
end

if redis.call("LLEN", list) == 0 then
    redis.call("ZREM", owners, owner)
else
    local bumped = score + stride
    if clock > bumped then
        bumped = clock
    end
    redis.call("ZADD", owners, bumped, owner)
end
return payload
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Redis-backed implementation of the queue, spools and lease lock.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    pop_script: Script,
    release_script: Script,
}

impl RedisStore {
    /// Connect to the shared store. Fails fast when Redis is unreachable,
    /// which the composition root treats as a fatal init error.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            pop_script: Script::new(POP_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn owners_key(queue: QueueName) -> String {
        format!("q:{}:owners", queue)
    }

    fn owner_list_key(queue: QueueName, owner: OrgId) -> String {
        format!("q:{}:o:{}", queue, owner)
    }

    fn contact_key(org: OrgId, contact: ContactId) -> String {
        format!("c:{}:{}", org, contact)
    }

    fn courier_key(channel_uuid: Uuid) -> String {
        format!("msgs:{}", channel_uuid)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskQueue for RedisStore {
    async fn push(
        &self,
        queue: QueueName,
        owner: OrgId,
        task: &Task,
        priority: TaskPriority,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_string(task)?;
        let list_key = Self::owner_list_key(queue, owner);
        let score = enqueue_score(score_clock(), priority);

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        match priority {
            TaskPriority::High => pipe.lpush(&list_key, &payload).ignore(),
            TaskPriority::Default => pipe.rpush(&list_key, &payload).ignore(),
        };
        // NX keeps an already-active owner's accumulated score
        pipe.cmd("ZADD")
            .arg(Self::owners_key(queue))
            .arg("NX")
            .arg(score)
            .arg(owner.0)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn pop(&self, queue: QueueName) -> anyhow::Result<Option<Task>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = self
            .pop_script
            .key(Self::owners_key(queue))
            .arg(score_clock())
            .arg(OWNER_STRIDE_MS)
            .arg(queue.as_str())
            .invoke_async(&mut conn)
            .await?;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn size(&self, queue: QueueName) -> anyhow::Result<usize> {
        let mut conn = self.conn.clone();
        let owners: Vec<i64> = conn.zrange(Self::owners_key(queue), 0, -1).await?;

        let mut total = 0usize;
        for owner in owners {
            let len: usize = conn
                .llen(Self::owner_list_key(queue, OrgId(owner)))
                .await?;
            total += len;
        }
        Ok(total)
    }
}

#[async_trait]
impl ContactSpool for RedisStore {
    async fn push_event(
        &self,
        org: OrgId,
        contact: ContactId,
        task: &Task,
        front: bool,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_string(task)?;
        let key = Self::contact_key(org, contact);
        let mut conn = self.conn.clone();
        if front {
            let _: i64 = conn.lpush(&key, &payload).await?;
        } else {
            let _: i64 = conn.rpush(&key, &payload).await?;
        }
        Ok(())
    }

    async fn pop_event(&self, org: OrgId, contact: ContactId) -> anyhow::Result<Option<Task>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.lpop(Self::contact_key(org, contact), None).await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CourierSpool for RedisStore {
    async fn push_msg(
        &self,
        channel_uuid: Uuid,
        payload: &serde_json::Value,
        high_priority: bool,
    ) -> anyhow::Result<()> {
        let key = Self::courier_key(channel_uuid);
        let raw = serde_json::to_string(payload)?;
        let mut conn = self.conn.clone();
        if high_priority {
            let _: i64 = conn.lpush(&key, &raw).await?;
        } else {
            let _: i64 = conn.rpush(&key, &raw).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseLock for RedisStore {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> anyhow::Result<Option<LeaseToken>> {
        let token = LeaseToken::generate();
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(set.map(|_| token))
    }

    async fn release(&self, name: &str, token: &LeaseToken) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(name)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
