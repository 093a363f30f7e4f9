use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use super::{ContactId, GroupId, OrgId};

/// A contact group. Groups with a query are dynamic: membership is
/// recomputed whenever a contact is created or unstopped.
#[derive(Clone, Debug)]
pub struct Group {
    pub id: GroupId,
    pub uuid: Uuid,
    pub name: String,
    pub query: Option<String>,
}

impl Group {
    pub fn is_dynamic(&self) -> bool {
        self.query.as_deref().is_some_and(|q| !q.is_empty())
    }
}

pub async fn load_groups(db: impl PgExecutor<'_>, org_id: OrgId) -> anyhow::Result<Vec<Group>> {
    let rows = sqlx::query(
        r#"
        SELECT id, uuid, name, query
        FROM contacts_contactgroup
        WHERE org_id = $1 AND is_active = TRUE
        ORDER BY id
        "#,
    )
    .bind(org_id.0)
    .fetch_all(db)
    .await?;

    let mut groups = Vec::with_capacity(rows.len());
    for row in rows {
        groups.push(Group {
            id: GroupId(row.try_get("id")?),
            uuid: row.try_get("uuid")?,
            name: row.try_get("name")?,
            query: row.try_get("query")?,
        });
    }
    Ok(groups)
}

/// All member contact ids for the given groups.
pub async fn contact_ids_for_groups(
    db: impl PgExecutor<'_>,
    group_ids: &[GroupId],
) -> anyhow::Result<Vec<ContactId>> {
    if group_ids.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = group_ids.iter().map(|g| g.0).collect();
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT contact_id
        FROM contacts_contactgroup_contacts
        WHERE contactgroup_id = ANY($1)
        "#,
    )
    .bind(&ids)
    .fetch_all(db)
    .await?;

    let mut contacts = Vec::with_capacity(rows.len());
    for row in rows {
        contacts.push(ContactId(row.try_get("contact_id")?));
    }
    Ok(contacts)
}

pub async fn add_contact_to_group(
    db: impl PgExecutor<'_>,
    contact: ContactId,
    group: GroupId,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO contacts_contactgroup_contacts (contact_id, contactgroup_id)
        VALUES ($1, $2)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(contact.0)
    .bind(group.0)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn remove_contact_from_group(
    db: impl PgExecutor<'_>,
    contact: ContactId,
    group: GroupId,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        DELETE FROM contacts_contactgroup_contacts
        WHERE contact_id = $1 AND contactgroup_id = $2
        "#,
    )
    .bind(contact.0)
    .bind(group.0)
    .execute(db)
    .await?;
    Ok(())
}
