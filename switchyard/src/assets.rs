use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    self, Channel, ChannelId, Contact, Field, Flow, FlowId, Group, GroupId, Org, OrgId, Trigger,
};

/// Everything the engine and the handlers need to know about one org,
/// loaded in one pass and shared immutably.
#[derive(Debug)]
pub struct OrgAssets {
    pub org: Org,
    channels: Vec<Channel>,
    flows: Vec<Flow>,
    groups: Vec<Group>,
    fields: Vec<Field>,
    triggers: Vec<Trigger>,
    /// Large, effectively immutable location hierarchy, reused across
    /// refreshes on its own longer TTL.
    locations: Arc<Value>,
    locations_built: Instant,
}

impl OrgAssets {
    pub fn org_id(&self) -> OrgId {
        self.org.id
    }

    pub fn channel_by_id(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn channel_by_uuid(&self, uuid: Uuid) -> Option<&Channel> {
        self.channels.iter().find(|c| c.uuid == uuid)
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn flow_by_id(&self, id: FlowId) -> Option<&Flow> {
        self.flows.iter().find(|f| f.id == id)
    }

    pub fn flow_by_uuid(&self, uuid: Uuid) -> Option<&Flow> {
        self.flows.iter().find(|f| f.uuid == uuid)
    }

    pub fn group_by_uuid(&self, uuid: Uuid) -> Option<&Group> {
        self.groups.iter().find(|g| g.uuid == uuid)
    }

    pub fn group_by_id(&self, id: GroupId) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn locations(&self) -> &Value {
        &self.locations
    }

    /// Load a full set of assets for an org, reusing the previous set's
    /// location subtree when it is still fresh.
    pub async fn load(
        db: &PgPool,
        org_id: OrgId,
        prev: Option<&OrgAssets>,
        location_ttl: Duration,
    ) -> anyhow::Result<Option<OrgAssets>> {
        let Some(org) = models::load_org(db, org_id).await? else {
            return Ok(None);
        };

        let channels = models::load_channels(db, org_id).await?;
        let flows = models::load_flows(db, org_id).await?;
        let groups = models::load_groups(db, org_id).await?;
        let fields = models::fields::load_fields(db, org_id).await?;
        let triggers = models::load_triggers(db, org_id).await?;

        let (locations, locations_built) = match prev {
            Some(prev) if prev.locations_built.elapsed() < location_ttl => {
                (prev.locations.clone(), prev.locations_built)
            }
            _ => (Arc::new(load_locations(db, org_id).await?), Instant::now()),
        };

        Ok(Some(OrgAssets {
            org,
            channels,
            flows,
            groups,
            fields,
            triggers,
            locations,
            locations_built,
        }))
    }

    /// Assemble assets directly from already loaded parts. Used by tests.
    pub fn from_parts(
        org: Org,
        channels: Vec<Channel>,
        flows: Vec<Flow>,
        groups: Vec<Group>,
        fields: Vec<Field>,
        triggers: Vec<Trigger>,
    ) -> OrgAssets {
        OrgAssets {
            org,
            channels,
            flows,
            groups,
            fields,
            triggers,
            locations: Arc::new(Value::Null),
            locations_built: Instant::now(),
        }
    }

    /// Build the engine-facing view of a contact.
    pub fn flow_contact(&self, contact: &Contact) -> Value {
        serde_json::json!({
            "uuid": contact.uuid,
            "id": contact.id.0,
            "name": contact.name,
            "language": contact.language,
            "urns": contact.urns.iter().map(|u| u.identity()).collect::<Vec<_>>(),
            "created_on": contact.created_on,
        })
    }
}

async fn load_locations(db: &PgPool, org_id: OrgId) -> anyhow::Result<Value> {
    use sqlx::Row;

    let row = sqlx::query(
        r#"
        SELECT hierarchy
        FROM locations_hierarchy
        WHERE org_id = $1
        "#,
    )
    .bind(org_id.0)
    .fetch_optional(db)
    .await?;

    Ok(match row {
        Some(row) => row.try_get("hierarchy").unwrap_or(Value::Null),
        None => Value::Null,
    })
}

struct CacheEntry {
    assets: Arc<OrgAssets>,
    built: Instant,
}

/// Short-TTL cache of org assets. Reads are cheap clones of the shared Arc;
/// on expiry a single writer per org rebuilds while other callers keep
/// serving the stale copy.
#[derive(Clone)]
pub struct AssetCache {
    entries: Arc<Mutex<HashMap<OrgId, CacheEntry>>>,
    refreshing: Arc<Mutex<HashMap<OrgId, Arc<Mutex<()>>>>>,
    ttl: Duration,
    location_ttl: Duration,
}

impl AssetCache {
    pub fn new(ttl: Duration, location_ttl: Duration) -> AssetCache {
        AssetCache {
            entries: Arc::new(Mutex::new(HashMap::new())),
            refreshing: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            location_ttl,
        }
    }

    /// Get the cached assets for an org, reloading when the TTL has lapsed.
    /// Returns `None` when the org doesn't exist or is inactive.
    pub async fn get(&self, db: &PgPool, org_id: OrgId) -> anyhow::Result<Option<Arc<OrgAssets>>> {
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&org_id) {
                if entry.built.elapsed() < self.ttl {
                    return Ok(Some(entry.assets.clone()));
                }
            }
        }

        // one refresher per org; a second caller waits, then re-reads
        let refresh_lock = {
            let mut refreshing = self.refreshing.lock().await;
            refreshing.entry(org_id).or_default().clone()
        };
        let _guard = refresh_lock.lock().await;

        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&org_id) {
                if entry.built.elapsed() < self.ttl {
                    return Ok(Some(entry.assets.clone()));
                }
            }
        }

        let prev = {
            let entries = self.entries.lock().await;
            entries.get(&org_id).map(|e| e.assets.clone())
        };

        let loaded =
            OrgAssets::load(db, org_id, prev.as_deref(), self.location_ttl).await?;

        let Some(assets) = loaded else {
            let mut entries = self.entries.lock().await;
            entries.remove(&org_id);
            return Ok(None);
        };

        let assets = Arc::new(assets);
        let mut entries = self.entries.lock().await;
        entries.insert(
            org_id,
            CacheEntry {
                assets: assets.clone(),
                built: Instant::now(),
            },
        );
        Ok(Some(assets))
    }

    /// Drop every cached org. Used by tests and by admin-driven flushes.
    pub async fn flush(&self) {
        self.entries.lock().await.clear();
    }

    /// Seed the cache directly, bypassing the database. Used by tests.
    pub async fn seed(&self, assets: OrgAssets) -> Arc<OrgAssets> {
        let org_id = assets.org_id();
        let assets = Arc::new(assets);
        let mut entries = self.entries.lock().await;
        entries.insert(
            org_id,
            CacheEntry {
                assets: assets.clone(),
                built: Instant::now(),
            },
        );
        assets
    }

    /// Fetch from cache only, never touching the database. Returns whatever
    /// is cached regardless of TTL. Used by tests and handlers that can
    /// tolerate stale assets.
    pub async fn peek(&self, org_id: OrgId) -> Option<Arc<OrgAssets>> {
        let entries = self.entries.lock().await;
        entries.get(&org_id).map(|e| e.assets.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_org(id: i64) -> Org {
        Org {
            id: OrgId(id),
            uuid: Uuid::new_v4(),
            name: format!("Org {}", id),
            language: None,
            uses_topups: false,
            config: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_seed_and_peek() {
        let cache = AssetCache::new(Duration::from_secs(5), Duration::from_secs(3600));
        let assets = OrgAssets::from_parts(
            test_org(1),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );

        cache.seed(assets).await;
        let peeked = cache.peek(OrgId(1)).await.unwrap();
        assert_eq!(peeked.org_id(), OrgId(1));
        assert!(cache.peek(OrgId(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_flush_drops_entries() {
        let cache = AssetCache::new(Duration::from_secs(5), Duration::from_secs(3600));
        cache
            .seed(OrgAssets::from_parts(
                test_org(1),
                Vec::new(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
            ))
            .await;

        cache.flush().await;
        assert!(cache.peek(OrgId(1)).await.is_none());
    }
}
