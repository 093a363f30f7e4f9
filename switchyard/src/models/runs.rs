use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use super::{ContactId, FlowId, OrgId, RunId, SessionId, SessionType, StartId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "A")]
    Active,
    #[serde(rename = "W")]
    Waiting,
    #[serde(rename = "C")]
    Completed,
    #[serde(rename = "X")]
    Expired,
    #[serde(rename = "I")]
    Interrupted,
    #[serde(rename = "F")]
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "A",
            RunStatus::Waiting => "W",
            RunStatus::Completed => "C",
            RunStatus::Expired => "X",
            RunStatus::Interrupted => "I",
            RunStatus::Failed => "F",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Active | RunStatus::Waiting)
    }
}

/// A single visited node in a run's path.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub uuid: Uuid,
    pub node_uuid: Uuid,
    pub arrived_on: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_uuid: Option<Uuid>,
}

/// A run as produced by one engine sprint, ready to be persisted. The
/// engine emits these; the runner writes them under the contact lock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunOutput {
    pub uuid: Uuid,
    pub flow_id: FlowId,
    pub status: RunStatus,
    pub path: Vec<Step>,
    pub results: Value,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub exited_on: Option<DateTime<Utc>>,
    pub expires_on: Option<DateTime<Utc>>,
    pub responded: bool,
}

impl RunOutput {
    pub fn current_node_uuid(&self) -> Option<Uuid> {
        self.path.last().map(|s| s.node_uuid)
    }
}

/// Write the runs for a session after a sprint. Runs are keyed by UUID so a
/// resume updates existing rows and inserts rows for newly entered flows in
/// one statement.
pub async fn upsert_runs(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    org_id: OrgId,
    contact_id: ContactId,
    session_id: SessionId,
    start_id: Option<StartId>,
    runs: &[RunOutput],
) -> anyhow::Result<Vec<RunId>> {
    let mut ids = Vec::with_capacity(runs.len());
    for run in runs {
        let path = serde_json::to_value(&run.path)?;
        let row = sqlx::query(
            r#"
            INSERT INTO flows_flowrun
                (uuid, org_id, contact_id, flow_id, session_id, start_id, status,
                 created_on, modified_on, exited_on, expires_on, responded, results,
                 path, current_node_uuid)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (uuid) DO UPDATE
            SET status = EXCLUDED.status,
                modified_on = EXCLUDED.modified_on,
                exited_on = EXCLUDED.exited_on,
                expires_on = EXCLUDED.expires_on,
                responded = flows_flowrun.responded OR EXCLUDED.responded,
                results = EXCLUDED.results,
                path = EXCLUDED.path,
                current_node_uuid = EXCLUDED.current_node_uuid
            RETURNING id
            "#,
        )
        .bind(run.uuid)
        .bind(org_id.0)
        .bind(contact_id.0)
        .bind(run.flow_id.0)
        .bind(session_id.0)
        .bind(start_id.map(|s| s.0))
        .bind(run.status.as_str())
        .bind(run.created_on)
        .bind(run.modified_on)
        .bind(run.exited_on)
        .bind(run.expires_on)
        .bind(run.responded)
        .bind(serde_json::to_value(&run.results)?)
        .bind(path)
        .bind(run.current_node_uuid())
        .fetch_one(&mut **tx)
        .await?;

        ids.push(RunId(row.try_get("id")?));
    }
    Ok(ids)
}

/// Reload a run's path and results as they were written.
pub async fn load_run_state(
    db: impl PgExecutor<'_>,
    run_id: RunId,
) -> anyhow::Result<Option<(Vec<Step>, Value)>> {
    let row = sqlx::query(
        r#"
        SELECT path, results
        FROM flows_flowrun
        WHERE id = $1
        "#,
    )
    .bind(run_id.0)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let path: Value = row.try_get("path")?;
    let results: Value = row.try_get("results")?;
    Ok(Some((serde_json::from_value(path)?, results)))
}

/// The run's recorded expiration, or `None` if the run is no longer active.
/// Timed expiration events compare against this to detect drift.
pub async fn run_expiration(
    db: impl PgExecutor<'_>,
    run_id: RunId,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    let row = sqlx::query(
        r#"
        SELECT expires_on
        FROM flows_flowrun
        WHERE id = $1 AND status IN ('A', 'W')
        "#,
    )
    .bind(run_id.0)
    .fetch_optional(db)
    .await?;

    match row {
        Some(row) => Ok(row.try_get("expires_on")?),
        None => Ok(None),
    }
}

/// Contact ids among those passed in which have ever run the given flow.
/// Used when a start has `restart_participants` disabled.
pub async fn find_flow_started_overlap(
    db: impl PgExecutor<'_>,
    flow_id: FlowId,
    contacts: &[ContactId],
) -> anyhow::Result<Vec<ContactId>> {
    if contacts.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = contacts.iter().map(|c| c.0).collect();
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT contact_id
        FROM flows_flowrun
        WHERE contact_id = ANY($1) AND flow_id = $2
        "#,
    )
    .bind(&ids)
    .bind(flow_id.0)
    .fetch_all(db)
    .await?;

    rows.into_iter()
        .map(|row| Ok(ContactId(row.try_get("contact_id")?)))
        .collect()
}

/// Contact ids among those passed in with a waiting session of the given
/// type. Used when a start has `include_active` disabled. Background flows
/// check against messaging sessions since they cannot wait themselves.
pub async fn find_active_session_overlap(
    db: impl PgExecutor<'_>,
    session_type: SessionType,
    contacts: &[ContactId],
) -> anyhow::Result<Vec<ContactId>> {
    if contacts.is_empty() {
        return Ok(Vec::new());
    }
    let session_type = match session_type {
        SessionType::Background => SessionType::Messaging,
        other => other,
    };

    let ids: Vec<i64> = contacts.iter().map(|c| c.0).collect();
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT contact_id
        FROM flows_flowsession
        WHERE contact_id = ANY($1) AND session_type = $2 AND status = 'W'
        "#,
    )
    .bind(&ids)
    .bind(session_type.as_str())
    .fetch_all(db)
    .await?;

    rows.into_iter()
        .map(|row| Ok(ContactId(row.try_get("contact_id")?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_round_trips_as_json() {
        let path = vec![
            Step {
                uuid: Uuid::new_v4(),
                node_uuid: Uuid::new_v4(),
                arrived_on: Utc::now(),
                exit_uuid: Some(Uuid::new_v4()),
            },
            Step {
                uuid: Uuid::new_v4(),
                node_uuid: Uuid::new_v4(),
                arrived_on: Utc::now(),
                exit_uuid: None,
            },
        ];

        let raw = serde_json::to_string(&path).unwrap();
        let back: Vec<Step> = serde_json::from_str(&raw).unwrap();
        assert_eq!(path, back);

        // absent exit is omitted, not null
        assert!(!raw.contains("exit_uuid\":null"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Active.is_terminal());
        assert!(!RunStatus::Waiting.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Expired.is_terminal());
        assert!(RunStatus::Interrupted.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_current_node_is_last_path_step() {
        let node = Uuid::new_v4();
        let run = RunOutput {
            uuid: Uuid::new_v4(),
            flow_id: FlowId(1),
            status: RunStatus::Waiting,
            path: vec![Step {
                uuid: Uuid::new_v4(),
                node_uuid: node,
                arrived_on: Utc::now(),
                exit_uuid: None,
            }],
            results: serde_json::json!({}),
            created_on: Utc::now(),
            modified_on: Utc::now(),
            exited_on: None,
            expires_on: None,
            responded: false,
        };
        assert_eq!(run.current_node_uuid(), Some(node));
    }
}
