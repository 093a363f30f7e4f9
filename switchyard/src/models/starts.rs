use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use super::{ChannelId, ContactId, FlowId, FlowType, GroupId, OrgId, StartId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartStatus {
    Pending,
    Starting,
    Complete,
    Failed,
}

impl StartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartStatus::Pending => "P",
            StartStatus::Starting => "S",
            StartStatus::Complete => "C",
            StartStatus::Failed => "F",
        }
    }
}

/// A declarative work order to start a flow for a population of contacts.
/// This is both the task wire format and the persisted row's shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowStart {
    pub id: StartId,
    pub org_id: OrgId,
    pub flow_id: FlowId,
    pub flow_type: FlowType,
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub exclude_group_ids: Vec<GroupId>,
    #[serde(default)]
    pub urns: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub create_contact: bool,
    #[serde(default = "default_true")]
    pub restart_participants: bool,
    #[serde(default = "default_true")]
    pub include_active: bool,
}

fn default_true() -> bool {
    true
}

impl FlowStart {
    pub fn new(org_id: OrgId, flow_id: FlowId, flow_type: FlowType) -> FlowStart {
        FlowStart {
            id: StartId(0),
            org_id,
            flow_id,
            flow_type,
            contact_ids: Vec::new(),
            group_ids: Vec::new(),
            exclude_group_ids: Vec::new(),
            urns: Vec::new(),
            query: None,
            create_contact: false,
            restart_participants: true,
            include_active: true,
        }
    }

    /// Create one executable batch for a contiguous slice of the resolved
    /// population.
    pub fn create_batch(
        &self,
        contact_ids: Vec<ContactId>,
        is_last: bool,
        total_count: usize,
    ) -> FlowStartBatch {
        FlowStartBatch {
            start_id: self.id,
            org_id: self.org_id,
            flow_id: self.flow_id,
            flow_type: self.flow_type,
            contact_ids,
            restart_participants: self.restart_participants,
            include_active: self.include_active,
            is_last,
            total_count,
        }
    }
}

/// Up to `start_batch_size` contacts from one start, the unit of execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowStartBatch {
    pub start_id: StartId,
    pub org_id: OrgId,
    pub flow_id: FlowId,
    pub flow_type: FlowType,
    pub contact_ids: Vec<ContactId>,
    #[serde(default = "default_true")]
    pub restart_participants: bool,
    #[serde(default = "default_true")]
    pub include_active: bool,
    #[serde(default)]
    pub is_last: bool,
    #[serde(default)]
    pub total_count: usize,
}

/// Insert a new start row (used by the session_triggered hook for sub-flow
/// starts), returning its assigned id.
pub async fn insert_flow_start(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    start: &mut FlowStart,
) -> anyhow::Result<()> {
    let contact_ids = serde_json::to_value(&start.contact_ids)?;
    let group_ids = serde_json::to_value(&start.group_ids)?;
    let exclude_group_ids = serde_json::to_value(&start.exclude_group_ids)?;
    let urns = serde_json::to_value(&start.urns)?;

    let row = sqlx::query(
        r#"
        INSERT INTO flows_flowstart
            (uuid, org_id, flow_id, flow_type, contact_ids, group_ids, exclude_group_ids,
             urns, query, create_contact, restart_participants, include_active,
             status, contact_count, created_on, modified_on)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'P', 0, NOW(), NOW())
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(start.org_id.0)
    .bind(start.flow_id.0)
    .bind(start.flow_type.as_str())
    .bind(contact_ids)
    .bind(group_ids)
    .bind(exclude_group_ids)
    .bind(urns)
    .bind(start.query.as_deref())
    .bind(start.create_contact)
    .bind(start.restart_participants)
    .bind(start.include_active)
    .fetch_one(&mut **tx)
    .await?;

    start.id = StartId(row.try_get("id")?);
    Ok(())
}

/// Mark a start as starting with its final resolved contact count and the
/// ids of contacts created during URN resolution.
pub async fn mark_start_started(
    db: impl PgExecutor<'_>,
    start_id: StartId,
    contact_count: usize,
    created_contact_ids: &[ContactId],
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE flows_flowstart
        SET status = 'S', contact_count = $2, created_contact_ids = $3, modified_on = NOW()
        WHERE id = $1
        "#,
    )
    .bind(start_id.0)
    .bind(contact_count as i64)
    .bind(serde_json::to_value(created_contact_ids)?)
    .execute(db)
    .await?;
    Ok(())
}

/// Mark a start complete. Idempotent: a start that already reached a
/// terminal status is left untouched, so the zero-contact inline completion
/// and the last-batch completion can't double-fire.
pub async fn mark_start_complete(db: impl PgExecutor<'_>, start_id: StartId) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE flows_flowstart
        SET status = 'C', modified_on = NOW()
        WHERE id = $1 AND status IN ('P', 'S')
        "#,
    )
    .bind(start_id.0)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn mark_start_failed(db: impl PgExecutor<'_>, start_id: StartId) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE flows_flowstart
        SET status = 'F', modified_on = NOW()
        WHERE id = $1 AND status IN ('P', 'S')
        "#,
    )
    .bind(start_id.0)
    .execute(db)
    .await?;
    Ok(())
}

/// Persist progress metadata on a start (used by the studio sender).
pub async fn update_start_metadata(
    db: impl PgExecutor<'_>,
    start_id: StartId,
    metadata: &Value,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE flows_flowstart
        SET metadata = $2, modified_on = NOW()
        WHERE id = $1
        "#,
    )
    .bind(start_id.0)
    .bind(metadata)
    .execute(db)
    .await?;
    Ok(())
}

/// A start that drives an external studio-style provider directly instead of
/// the flow engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StudioFlowStart {
    pub id: StartId,
    pub org_id: OrgId,
    pub flow_sid: String,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
}

/// Load the `tel` URN paths for a chunk of contacts, the destination
/// addresses for provider executions.
pub async fn load_contact_phones(
    db: impl PgExecutor<'_>,
    contact_ids: &[ContactId],
) -> anyhow::Result<Vec<String>> {
    if contact_ids.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = contact_ids.iter().map(|c| c.0).collect();
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT ON (contact_id) path
        FROM contacts_contacturn
        WHERE contact_id = ANY($1) AND scheme = 'tel'
        ORDER BY contact_id, priority DESC
        "#,
    )
    .bind(&ids)
    .fetch_all(db)
    .await?;

    rows.into_iter()
        .map(|row| Ok(row.try_get("path")?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_descriptor_wire_format() {
        let raw = r#"{
            "id": 12, "org_id": 1, "flow_id": 7, "flow_type": "M",
            "contact_ids": [100, 101], "group_ids": [5], "exclude_group_ids": [],
            "urns": ["tel:+593979111111"], "query": "name ~ Ben",
            "create_contact": false, "restart_participants": true, "include_active": false
        }"#;
        let start: FlowStart = serde_json::from_str(raw).unwrap();
        assert_eq!(start.id, StartId(12));
        assert_eq!(start.flow_type, FlowType::Messaging);
        assert_eq!(start.contact_ids, vec![ContactId(100), ContactId(101)]);
        assert!(!start.include_active);
        assert_eq!(start.query.as_deref(), Some("name ~ Ben"));
    }

    #[test]
    fn test_start_descriptor_defaults() {
        let raw = r#"{"id": 1, "org_id": 1, "flow_id": 2, "flow_type": "V"}"#;
        let start: FlowStart = serde_json::from_str(raw).unwrap();
        assert!(start.restart_participants);
        assert!(start.include_active);
        assert!(!start.create_contact);
        assert!(start.contact_ids.is_empty());
        assert_eq!(start.flow_type, FlowType::Voice);
    }

    #[test]
    fn test_create_batch_carries_start_options() {
        let mut start = FlowStart::new(OrgId(1), FlowId(2), FlowType::Messaging);
        start.id = StartId(9);
        start.include_active = false;

        let batch = start.create_batch(vec![ContactId(1)], true, 121);
        assert_eq!(batch.start_id, StartId(9));
        assert!(batch.is_last);
        assert_eq!(batch.total_count, 121);
        assert!(!batch.include_active);
    }
}
