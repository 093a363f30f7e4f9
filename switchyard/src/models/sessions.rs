use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::{
    ChannelConnectionId, ContactId, FlowId, MsgId, OrgId, RunStatus, SessionId, StartId,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionStatus {
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

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "W",
            SessionStatus::Completed => "C",
            SessionStatus::Expired => "X",
            SessionStatus::Interrupted => "I",
            SessionStatus::Failed => "F",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Waiting)
    }

    /// The status runs still open inside this session take when it exits.
    pub fn run_exit_status(&self) -> RunStatus {
        match self {
            SessionStatus::Waiting => RunStatus::Waiting,
            SessionStatus::Completed => RunStatus::Completed,
            SessionStatus::Expired => RunStatus::Expired,
            SessionStatus::Interrupted => RunStatus::Interrupted,
            SessionStatus::Failed => RunStatus::Failed,
        }
    }
}

/// The kind of waiting a session does, which determines which inbound
/// stimulus can resume it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    #[serde(rename = "M")]
    Messaging,
    #[serde(rename = "V")]
    Voice,
    #[serde(rename = "B")]
    Background,
    #[serde(rename = "O")]
    MessagingOffline,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Messaging => "M",
            SessionType::Voice => "V",
            SessionType::Background => "B",
            SessionType::MessagingOffline => "O",
        }
    }

    pub fn from_str(value: &str) -> Option<SessionType> {
        match value {
            "M" => Some(SessionType::Messaging),
            "V" => Some(SessionType::Voice),
            "B" => Some(SessionType::Background),
            "O" => Some(SessionType::MessagingOffline),
            _ => None,
        }
    }
}

impl From<super::FlowType> for SessionType {
    fn from(value: super::FlowType) -> Self {
        match value {
            super::FlowType::Messaging => SessionType::Messaging,
            super::FlowType::Voice => SessionType::Voice,
            super::FlowType::Background => SessionType::Background,
        }
    }
}

/// The session state an engine sprint produced, ready to be persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionOutput {
    pub uuid: Uuid,
    pub status: SessionStatus,
    pub session_type: SessionType,
    pub current_flow_id: Option<FlowId>,
    pub timeout_on: Option<DateTime<Utc>>,
    pub wait_started_on: Option<DateTime<Utc>>,
    /// Serialized engine state, opaque to the core.
    pub state: Value,
    pub responded: bool,
}

/// A persisted session, the live engine state across one or more runs for a
/// contact.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub status: SessionStatus,
    pub session_type: SessionType,
    pub current_flow_id: Option<FlowId>,
    pub connection_id: Option<ChannelConnectionId>,
    pub timeout_on: Option<DateTime<Utc>>,
    pub wait_started_on: Option<DateTime<Utc>>,
    pub state: Value,

    /// The inbound message this session is currently handling, if any.
    /// Runtime-only; set by the message handler so hooks can attribute
    /// outgoing messages as replies.
    pub incoming_msg: Option<(MsgId, Option<String>)>,
}

impl Session {
    pub fn set_incoming_msg(&mut self, msg_id: MsgId, external_id: Option<String>) {
        self.incoming_msg = Some((msg_id, external_id));
    }
}

/// The contact's current waiting session of the given type, if any.
pub async fn active_session_for_contact(
    db: &sqlx::PgPool,
    org_id: OrgId,
    session_type: SessionType,
    contact_id: ContactId,
) -> anyhow::Result<Option<Session>> {
    let row = sqlx::query(
        r#"
        SELECT id, uuid, status, session_type, current_flow_id, connection_id,
               timeout_on, wait_started_on, output
        FROM flows_flowsession
        WHERE org_id = $1 AND contact_id = $2 AND session_type = $3 AND status = 'W'
        ORDER BY created_on DESC
        LIMIT 1
        "#,
    )
    .bind(org_id.0)
    .bind(contact_id.0)
    .bind(session_type.as_str())
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let status: String = row.try_get("status")?;
    let stype: String = row.try_get("session_type")?;
    Ok(Some(Session {
        id: SessionId(row.try_get("id")?),
        uuid: row.try_get("uuid")?,
        org_id,
        contact_id,
        status: match status.as_str() {
            "W" => SessionStatus::Waiting,
            "C" => SessionStatus::Completed,
            "X" => SessionStatus::Expired,
            "I" => SessionStatus::Interrupted,
            _ => SessionStatus::Failed,
        },
        session_type: SessionType::from_str(&stype).unwrap_or(SessionType::Messaging),
        current_flow_id: row.try_get::<Option<i64>, _>("current_flow_id")?.map(FlowId),
        connection_id: row
            .try_get::<Option<i64>, _>("connection_id")?
            .map(ChannelConnectionId),
        timeout_on: row.try_get("timeout_on")?,
        wait_started_on: row.try_get("wait_started_on")?,
        state: row.try_get("output").unwrap_or(Value::Null),
        incoming_msg: None,
    }))
}

/// Insert a freshly started session.
pub async fn insert_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    org_id: OrgId,
    contact_id: ContactId,
    output: &SessionOutput,
    connection_id: Option<ChannelConnectionId>,
    start_id: Option<StartId>,
) -> anyhow::Result<SessionId> {
    let ended_on: Option<DateTime<Utc>> = output.status.is_terminal().then(Utc::now);

    let row = sqlx::query(
        r#"
        INSERT INTO flows_flowsession
            (uuid, org_id, contact_id, status, session_type, responded, current_flow_id,
             connection_id, start_id, timeout_on, wait_started_on, created_on, ended_on, output)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), $12, $13)
        RETURNING id
        "#,
    )
    .bind(output.uuid)
    .bind(org_id.0)
    .bind(contact_id.0)
    .bind(output.status.as_str())
    .bind(output.session_type.as_str())
    .bind(output.responded)
    .bind(output.current_flow_id.map(|f| f.0))
    .bind(connection_id.map(|c| c.0))
    .bind(start_id.map(|s| s.0))
    .bind(output.timeout_on)
    .bind(output.wait_started_on)
    .bind(ended_on)
    .bind(&output.state)
    .fetch_one(&mut **tx)
    .await?;

    Ok(SessionId(row.try_get("id")?))
}

/// Update a session after a resume sprint. Only waiting sessions can be
/// updated; a terminal session is never mutated again.
pub async fn update_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    session_id: SessionId,
    output: &SessionOutput,
) -> anyhow::Result<()> {
    let ended_on: Option<DateTime<Utc>> = output.status.is_terminal().then(Utc::now);

    sqlx::query(
        r#"
        UPDATE flows_flowsession
        SET status = $2,
            responded = responded OR $3,
            current_flow_id = $4,
            timeout_on = $5,
            wait_started_on = $6,
            ended_on = COALESCE(ended_on, $7),
            output = $8
        WHERE id = $1 AND status = 'W'
        "#,
    )
    .bind(session_id.0)
    .bind(output.status.as_str())
    .bind(output.responded)
    .bind(output.current_flow_id.map(|f| f.0))
    .bind(output.timeout_on)
    .bind(output.wait_started_on)
    .bind(ended_on)
    .bind(&output.state)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Exit the given sessions with the given terminal status, exiting their
/// still-open runs the same way.
pub async fn exit_sessions(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    session_ids: &[SessionId],
    status: SessionStatus,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    if session_ids.is_empty() || !status.is_terminal() {
        return Ok(());
    }
    let ids: Vec<i64> = session_ids.iter().map(|s| s.0).collect();

    sqlx::query(
        r#"
        UPDATE flows_flowrun
        SET status = $2, exited_on = $3, modified_on = NOW()
        WHERE session_id = ANY($1) AND status IN ('A', 'W')
        "#,
    )
    .bind(&ids)
    .bind(status.run_exit_status().as_str())
    .bind(now)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE flows_flowsession
        SET status = $2, ended_on = $3, timeout_on = NULL
        WHERE id = ANY($1) AND status = 'W'
        "#,
    )
    .bind(&ids)
    .bind(status.as_str())
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Interrupt all waiting sessions (and their open runs) of the given type
/// for the given contacts. Called before starting those contacts in a new
/// flow.
pub async fn interrupt_contact_sessions(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    session_type: SessionType,
    contact_ids: &[ContactId],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    if contact_ids.is_empty() {
        return Ok(());
    }
    let ids: Vec<i64> = contact_ids.iter().map(|c| c.0).collect();

    sqlx::query(
        r#"
        UPDATE flows_flowrun
        SET status = 'I', exited_on = $3, modified_on = NOW()
        WHERE status IN ('A', 'W')
          AND session_id = ANY (
            SELECT id FROM flows_flowsession
            WHERE session_type = $1 AND contact_id = ANY($2) AND status = 'W'
          )
        "#,
    )
    .bind(session_type.as_str())
    .bind(&ids)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE flows_flowsession
        SET status = 'I', ended_on = $3, timeout_on = NULL
        WHERE session_type = $1 AND contact_id = ANY($2) AND status = 'W'
        "#,
    )
    .bind(session_type.as_str())
    .bind(&ids)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_exit_maps_run_statuses() {
        assert_eq!(
            SessionStatus::Interrupted.run_exit_status(),
            RunStatus::Interrupted
        );
        assert_eq!(
            SessionStatus::Completed.run_exit_status(),
            RunStatus::Completed
        );
        assert_eq!(SessionStatus::Expired.run_exit_status(), RunStatus::Expired);
    }

    #[test]
    fn test_flow_type_to_session_type() {
        use crate::models::FlowType;

        assert_eq!(SessionType::from(FlowType::Voice), SessionType::Voice);
        assert_eq!(
            SessionType::from(FlowType::Messaging),
            SessionType::Messaging
        );
    }

    #[test]
    fn test_only_waiting_is_not_terminal() {
        assert!(!SessionStatus::Waiting.is_terminal());
        for status in [
            SessionStatus::Completed,
            SessionStatus::Expired,
            SessionStatus::Interrupted,
            SessionStatus::Failed,
        ] {
            assert!(status.is_terminal());
        }
    }
}
