use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use super::{FlowId, OrgId};

/// Type of a flow, which determines where its starts execute and what kind
/// of session it produces.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FlowType {
    #[serde(rename = "M")]
    Messaging,
    #[serde(rename = "V")]
    Voice,
    #[serde(rename = "B")]
    Background,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Messaging => "M",
            FlowType::Voice => "V",
            FlowType::Background => "B",
        }
    }

    pub fn from_str(value: &str) -> Option<FlowType> {
        match value {
            "M" => Some(FlowType::Messaging),
            "V" => Some(FlowType::Voice),
            "B" => Some(FlowType::Background),
            _ => None,
        }
    }
}

/// A stored flow definition. The definition body is opaque to the core; only
/// the engine interprets it.
#[derive(Clone, Debug)]
pub struct Flow {
    pub id: FlowId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
    pub flow_type: FlowType,
    pub ignore_triggers: bool,
}

pub async fn load_flows(db: impl PgExecutor<'_>, org_id: OrgId) -> anyhow::Result<Vec<Flow>> {
    let rows = sqlx::query(
        r#"
        SELECT id, uuid, name, flow_type, ignore_triggers
        FROM flows_flow
        WHERE org_id = $1 AND is_active = TRUE AND is_archived = FALSE
        ORDER BY id
        "#,
    )
    .bind(org_id.0)
    .fetch_all(db)
    .await?;

    let mut flows = Vec::with_capacity(rows.len());
    for row in rows {
        let flow_type: String = row.try_get("flow_type")?;
        let Some(flow_type) = FlowType::from_str(&flow_type) else {
            continue;
        };
        flows.push(Flow {
            id: FlowId(row.try_get("id")?),
            uuid: row.try_get("uuid")?,
            org_id,
            name: row.try_get("name")?,
            flow_type,
            ignore_triggers: row.try_get("ignore_triggers")?,
        });
    }
    Ok(flows)
}
