use serde_json::Value;
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use super::{OrgId, TopupId};

/// An organization (tenant). Orgs own every other entity and are the unit of
/// queue fairness.
#[derive(Clone, Debug)]
pub struct Org {
    pub id: OrgId,
    pub uuid: Uuid,
    pub name: String,
    pub language: Option<String>,
    pub uses_topups: bool,
    pub config: Value,
}

pub async fn load_org(db: impl PgExecutor<'_>, org_id: OrgId) -> anyhow::Result<Option<Org>> {
    let row = sqlx::query(
        r#"
        SELECT id, uuid, name, language, uses_topups, config
        FROM orgs_org
        WHERE id = $1 AND is_active = TRUE
        "#,
    )
    .bind(org_id.0)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(Org {
        id: OrgId(row.try_get("id")?),
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        language: row.try_get("language")?,
        uses_topups: row.try_get("uses_topups")?,
        config: row.try_get("config").unwrap_or(Value::Null),
    }))
}

/// Decrement one credit from the org's best topup and return its id.
///
/// Returns `None` when the org doesn't use topups or has no credit left;
/// messages are still handled in that case, just without an attribution.
pub async fn allocate_topup(
    db: impl PgExecutor<'_>,
    org: &Org,
) -> anyhow::Result<Option<TopupId>> {
    if !org.uses_topups {
        return Ok(None);
    }

    let row = sqlx::query(
        r#"
        UPDATE orgs_topup
        SET used = used + 1
        WHERE id = (
            SELECT id
            FROM orgs_topup
            WHERE org_id = $1
              AND is_active = TRUE
              AND expires_on > NOW()
              AND used < credits
            ORDER BY expires_on ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        RETURNING id
        "#,
    )
    .bind(org.id.0)
    .fetch_optional(db)
    .await?;

    Ok(row.map(|r| r.try_get("id").map(TopupId)).transpose()?)
}
