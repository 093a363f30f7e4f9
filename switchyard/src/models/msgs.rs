use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use super::{ChannelId, ContactId, MsgId, OrgId, SessionId, TopupId, UrnId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MsgStatus {
    Pending,
    Queued,
    Sent,
    Handled,
    Errored,
}

impl MsgStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgStatus::Pending => "P",
            MsgStatus::Queued => "Q",
            MsgStatus::Sent => "S",
            MsgStatus::Handled => "H",
            MsgStatus::Errored => "E",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MsgVisibility {
    Visible,
    Archived,
}

impl MsgVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgVisibility::Visible => "V",
            MsgVisibility::Archived => "A",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MsgType {
    Inbox,
    Flow,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Inbox => "I",
            MsgType::Flow => "F",
        }
    }
}

/// An inbound message as delivered by the channel ingest process.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct MsgIn {
    pub id: MsgId,
    pub uuid: Uuid,
    pub urn: String,
    pub urn_id: UrnId,
    pub channel_id: ChannelId,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub external_id: Option<String>,
}

/// An outgoing message produced by a sprint, not yet inserted.
#[derive(Clone, Debug)]
pub struct NewOutgoingMsg {
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub channel_id: Option<ChannelId>,
    pub channel_uuid: Option<Uuid>,
    pub urn: Option<String>,
    pub text: String,
    pub attachments: Vec<String>,
    pub quick_replies: Vec<String>,
    pub session_id: Option<SessionId>,
    pub topup_id: Option<TopupId>,
    pub high_priority: bool,
    pub created_on: DateTime<Utc>,
    /// Session timeout carried on the last message of a sprint so the
    /// courier can report the wait start back on delivery.
    pub timeout_secs: Option<i64>,
    pub id: Option<MsgId>,
}

impl NewOutgoingMsg {
    /// The payload pushed onto the courier spool after commit.
    pub fn courier_payload(&self) -> serde_json::Value {
        json!({
            "id": self.id.map(|m| m.0),
            "uuid": self.uuid,
            "org_id": self.org_id.0,
            "contact_id": self.contact_id.0,
            "urn": self.urn,
            "text": self.text,
            "attachments": self.attachments,
            "quick_replies": self.quick_replies,
            "high_priority": self.high_priority,
            "session_id": self.session_id.map(|s| s.0),
            "session_timeout": self.timeout_secs,
            "created_on": self.created_on,
        })
    }
}

/// Insert a batch of outgoing messages, filling in their assigned ids.
pub async fn insert_outgoing_msgs(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    msgs: &mut [NewOutgoingMsg],
) -> anyhow::Result<()> {
    for msg in msgs.iter_mut() {
        let row = sqlx::query(
            r#"
            INSERT INTO msgs_msg
                (uuid, org_id, contact_id, contact_urn_id, channel_id, text, attachments,
                 high_priority, created_on, modified_on, queued_on, direction, status,
                 visibility, msg_type, msg_count, error_count, next_attempt, topup_id,
                 session_id)
            VALUES ($1, $2, $3, NULL, $4, $5, $6, $7, $8, NOW(), NOW(), 'O', 'Q',
                    'V', 'F', 1, 0, NOW(), $9, $10)
            RETURNING id
            "#,
        )
        .bind(msg.uuid)
        .bind(msg.org_id.0)
        .bind(msg.contact_id.0)
        .bind(msg.channel_id.map(|c| c.0))
        .bind(&msg.text)
        .bind(&msg.attachments)
        .bind(msg.high_priority)
        .bind(msg.created_on)
        .bind(msg.topup_id.map(|t| t.0))
        .bind(msg.session_id.map(|s| s.0))
        .fetch_one(&mut **tx)
        .await?;

        msg.id = Some(MsgId(row.try_get("id")?));
    }
    Ok(())
}

/// Update an inbound message's handling state, attributing the topup that
/// was allocated for it.
pub async fn update_message(
    db: impl PgExecutor<'_>,
    msg_id: MsgId,
    status: MsgStatus,
    visibility: MsgVisibility,
    msg_type: MsgType,
    topup_id: Option<TopupId>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE msgs_msg
        SET status = $2, visibility = $3, msg_type = $4, topup_id = $5, modified_on = NOW()
        WHERE id = $1
        "#,
    )
    .bind(msg_id.0)
    .bind(status.as_str())
    .bind(visibility.as_str())
    .bind(msg_type.as_str())
    .bind(topup_id.map(|t| t.0))
    .execute(db)
    .await?;
    Ok(())
}

/// Move messages that could not be spooled back to pending so a later sweep
/// can queue them again.
pub async fn mark_messages_pending(
    db: impl PgExecutor<'_>,
    msg_ids: &[MsgId],
) -> anyhow::Result<()> {
    if msg_ids.is_empty() {
        return Ok(());
    }
    let ids: Vec<i64> = msg_ids.iter().map(|m| m.0).collect();
    sqlx::query(
        r#"
        UPDATE msgs_msg
        SET status = 'P', modified_on = NOW()
        WHERE id = ANY($1)
        "#,
    )
    .bind(&ids)
    .execute(db)
    .await?;
    Ok(())
}
