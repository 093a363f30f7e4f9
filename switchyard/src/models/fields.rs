use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use super::{FieldId, OrgId};

/// A custom contact field definition.
#[derive(Clone, Debug)]
pub struct Field {
    pub id: FieldId,
    pub uuid: Uuid,
    pub key: String,
    pub name: String,
    pub value_type: String,
}

pub async fn load_fields(db: impl PgExecutor<'_>, org_id: OrgId) -> anyhow::Result<Vec<Field>> {
    let rows = sqlx::query(
        r#"
        SELECT id, uuid, key, name, value_type
        FROM contacts_contactfield
        WHERE org_id = $1 AND is_active = TRUE
        ORDER BY key
        "#,
    )
    .bind(org_id.0)
    .fetch_all(db)
    .await?;

    let mut fields = Vec::with_capacity(rows.len());
    for row in rows {
        fields.push(Field {
            id: FieldId(row.try_get("id")?),
            uuid: row.try_get("uuid")?,
            key: row.try_get("key")?,
            name: row.try_get("name")?,
            value_type: row.try_get("value_type")?,
        });
    }
    Ok(fields)
}
