use serde_json::Value;
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use super::{ChannelId, OrgId};

/// A messaging or voice channel owned by an org.
#[derive(Clone, Debug)]
pub struct Channel {
    pub id: ChannelId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
    pub channel_type: String,
    pub address: Option<String>,
    pub config: Value,
}

impl Channel {
    /// Look up a string value in the channel's provider config.
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

pub async fn load_channels(db: impl PgExecutor<'_>, org_id: OrgId) -> anyhow::Result<Vec<Channel>> {
    let rows = sqlx::query(
        r#"
        SELECT id, uuid, name, channel_type, address, config
        FROM channels_channel
        WHERE org_id = $1 AND is_active = TRUE
        ORDER BY id
        "#,
    )
    .bind(org_id.0)
    .fetch_all(db)
    .await?;

    let mut channels = Vec::with_capacity(rows.len());
    for row in rows {
        channels.push(Channel {
            id: ChannelId(row.try_get("id")?),
            uuid: row.try_get("uuid")?,
            org_id,
            name: row.try_get("name")?,
            channel_type: row.try_get("channel_type")?,
            address: row.try_get("address")?,
            config: row.try_get("config").unwrap_or(Value::Null),
        });
    }
    Ok(channels)
}

/// Insert a pending channel connection for an outgoing IVR call. The IVR
/// provider integration that places the call is an external collaborator.
pub async fn insert_channel_connection(
    db: impl PgExecutor<'_>,
    org_id: OrgId,
    channel_id: ChannelId,
    contact_id: super::ContactId,
    urn_id: super::UrnId,
) -> anyhow::Result<super::ChannelConnectionId> {
    let row = sqlx::query(
        r#"
        INSERT INTO channels_channelconnection
            (created_on, modified_on, status, direction, connection_type,
             org_id, channel_id, contact_id, contact_urn_id, retry_count)
        VALUES (NOW(), NOW(), 'P', 'O', 'V', $1, $2, $3, $4, 0)
        RETURNING id
        "#,
    )
    .bind(org_id.0)
    .bind(channel_id.0)
    .bind(contact_id.0)
    .bind(urn_id.0)
    .fetch_one(db)
    .await?;

    Ok(super::ChannelConnectionId(row.try_get("id")?))
}
