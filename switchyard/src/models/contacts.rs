use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use super::{Channel, ContactId, Group, OrgId, UrnId};
use crate::search::ContactSearcher;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContactStatus {
    Active,
    Blocked,
    Stopped,
    Archived,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Active => "A",
            ContactStatus::Blocked => "B",
            ContactStatus::Stopped => "S",
            ContactStatus::Archived => "V",
        }
    }

    pub fn from_str(value: &str) -> Option<ContactStatus> {
        match value {
            "A" => Some(ContactStatus::Active),
            "B" => Some(ContactStatus::Blocked),
            "S" => Some(ContactStatus::Stopped),
            "V" => Some(ContactStatus::Archived),
            _ => None,
        }
    }
}

/// An addressable URN belonging to a contact, ordered by priority.
#[derive(Clone, Debug)]
pub struct ContactUrn {
    pub id: UrnId,
    pub scheme: String,
    pub path: String,
    pub channel_id: Option<super::ChannelId>,
    pub priority: i32,
}

impl ContactUrn {
    /// The `scheme:path` form used on the wire.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.scheme, self.path)
    }
}

/// An addressable end party. Contacts are the serialization unit for event
/// processing.
#[derive(Clone, Debug)]
pub struct Contact {
    pub id: ContactId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: Option<String>,
    pub language: Option<String>,
    pub status: ContactStatus,
    pub created_on: DateTime<Utc>,
    pub last_seen_on: Option<DateTime<Utc>>,
    pub urns: Vec<ContactUrn>,
}

impl Contact {
    pub fn urn_for_id(&self, urn_id: UrnId) -> Option<&ContactUrn> {
        self.urns.iter().find(|u| u.id == urn_id)
    }

    /// Highest priority URN, the default destination for outgoing messages.
    pub fn preferred_urn(&self) -> Option<&ContactUrn> {
        self.urns.iter().max_by_key(|u| u.priority)
    }
}

pub async fn load_contacts(
    db: &sqlx::PgPool,
    org_id: OrgId,
    ids: &[ContactId],
) -> anyhow::Result<Vec<Contact>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let raw_ids: Vec<i64> = ids.iter().map(|c| c.0).collect();

    let rows = sqlx::query(
        r#"
        SELECT id, uuid, name, language, status, created_on, last_seen_on
        FROM contacts_contact
        WHERE org_id = $1 AND id = ANY($2) AND is_active = TRUE
        "#,
    )
    .bind(org_id.0)
    .bind(&raw_ids)
    .fetch_all(db)
    .await?;

    let mut contacts = Vec::with_capacity(rows.len());
    for row in rows {
        let status: String = row.try_get("status")?;
        contacts.push(Contact {
            id: ContactId(row.try_get("id")?),
            uuid: row.try_get("uuid")?,
            org_id,
            name: row.try_get("name")?,
            language: row.try_get("language")?,
            status: ContactStatus::from_str(&status).unwrap_or(ContactStatus::Active),
            created_on: row.try_get("created_on")?,
            last_seen_on: row.try_get("last_seen_on")?,
            urns: Vec::new(),
        });
    }

    let urn_rows = sqlx::query(
        r#"
        SELECT id, contact_id, scheme, path, channel_id, priority
        FROM contacts_contacturn
        WHERE contact_id = ANY($1)
        ORDER BY priority DESC, id
        "#,
    )
    .bind(&raw_ids)
    .fetch_all(db)
    .await?;

    for row in urn_rows {
        let contact_id = ContactId(row.try_get("contact_id")?);
        if let Some(contact) = contacts.iter_mut().find(|c| c.id == contact_id) {
            contact.urns.push(ContactUrn {
                id: UrnId(row.try_get("id")?),
                scheme: row.try_get("scheme")?,
                path: row.try_get("path")?,
                channel_id: row
                    .try_get::<Option<i64>, _>("channel_id")?
                    .map(super::ChannelId),
                priority: row.try_get("priority")?,
            });
        }
    }

    Ok(contacts)
}

/// Resolve `scheme:path` URNs to contact ids, creating a contact for any URN
/// that doesn't exist yet. Returns all resolved ids plus the subset that was
/// newly created.
pub async fn get_or_create_ids_from_urns(
    db: &sqlx::PgPool,
    org_id: OrgId,
    urns: &[String],
) -> anyhow::Result<(Vec<ContactId>, Vec<ContactId>)> {
    let mut all = Vec::with_capacity(urns.len());
    let mut created = Vec::new();

    for urn in urns {
        let Some((scheme, path)) = urn.split_once(':') else {
            anyhow::bail!("invalid URN: {}", urn);
        };

        let existing = sqlx::query(
            r#"
            SELECT contact_id
            FROM contacts_contacturn
            WHERE org_id = $1 AND scheme = $2 AND path = $3
            "#,
        )
        .bind(org_id.0)
        .bind(scheme)
        .bind(path)
        .fetch_optional(db)
        .await?;

        if let Some(row) = existing {
            all.push(ContactId(row.try_get("contact_id")?));
            continue;
        }

        let mut tx = db.begin().await?;
        let contact = insert_contact(&mut tx, org_id).await?;
        sqlx::query(
            r#"
            INSERT INTO contacts_contacturn (org_id, contact_id, scheme, path, identity, priority)
            VALUES ($1, $2, $3, $4, $5, 1000)
            "#,
        )
        .bind(org_id.0)
        .bind(contact.id.0)
        .bind(scheme)
        .bind(path)
        .bind(urn)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        all.push(contact.id);
        created.push(contact.id);
    }

    Ok((all, created))
}

/// Create a new empty contact.
pub async fn create_contact(db: &sqlx::PgPool, org_id: OrgId) -> anyhow::Result<Contact> {
    let mut tx = db.begin().await?;
    let contact = insert_contact(&mut tx, org_id).await?;
    tx.commit().await?;
    Ok(contact)
}

async fn insert_contact(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    org_id: OrgId,
) -> anyhow::Result<Contact> {
    let uuid = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO contacts_contact
            (org_id, uuid, status, is_active, created_on, modified_on)
        VALUES ($1, $2, 'A', TRUE, NOW(), NOW())
        RETURNING id, created_on
        "#,
    )
    .bind(org_id.0)
    .bind(uuid)
    .fetch_one(&mut **tx)
    .await?;

    Ok(Contact {
        id: ContactId(row.try_get("id")?),
        uuid,
        org_id,
        name: None,
        language: None,
        status: ContactStatus::Active,
        created_on: row.try_get("created_on")?,
        last_seen_on: None,
        urns: Vec::new(),
    })
}

pub async fn stop_contact(
    db: impl PgExecutor<'_>,
    org_id: OrgId,
    contact_id: ContactId,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE contacts_contact
        SET status = 'S', modified_on = NOW()
        WHERE org_id = $1 AND id = $2
        "#,
    )
    .bind(org_id.0)
    .bind(contact_id.0)
    .execute(db)
    .await?;
    Ok(())
}

/// An inbound message from a stopped contact unstops them.
pub async fn unstop_contact(db: impl PgExecutor<'_>, contact_id: ContactId) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE contacts_contact
        SET status = 'A', modified_on = NOW()
        WHERE id = $1 AND status = 'S'
        "#,
    )
    .bind(contact_id.0)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn update_last_seen_on(
    db: impl PgExecutor<'_>,
    contact_id: ContactId,
    when: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE contacts_contact
        SET last_seen_on = $2, modified_on = NOW()
        WHERE id = $1
        "#,
    )
    .bind(contact_id.0)
    .bind(when)
    .execute(db)
    .await?;
    Ok(())
}

/// Make the given URN the contact's highest priority one and pin it to the
/// channel it arrived on. Usually a no-op.
pub async fn update_preferred_urn(
    db: &sqlx::PgPool,
    contact: &Contact,
    urn_id: UrnId,
    channel: Option<&Channel>,
) -> anyhow::Result<()> {
    let already_preferred = contact.preferred_urn().is_some_and(|u| u.id == urn_id);
    let channel_id = channel.map(|c| c.id.0);

    if already_preferred {
        let affinity_current = contact
            .urn_for_id(urn_id)
            .and_then(|u| u.channel_id)
            .map(|c| c.0);
        if affinity_current == channel_id {
            return Ok(());
        }
    }

    let top: i32 = contact.urns.iter().map(|u| u.priority).max().unwrap_or(0);
    sqlx::query(
        r#"
        UPDATE contacts_contacturn
        SET priority = $2, channel_id = $3
        WHERE id = $1
        "#,
    )
    .bind(urn_id.0)
    .bind(top + 1)
    .bind(channel_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Recompute the contact's membership in every dynamic group, asking the
/// searcher whether the contact matches each group's query.
pub async fn calculate_dynamic_groups(
    db: &sqlx::PgPool,
    searcher: &dyn ContactSearcher,
    groups: &[Group],
    contact: &Contact,
) -> anyhow::Result<()> {
    for group in groups.iter().filter(|g| g.is_dynamic()) {
        let query = group.query.as_deref().unwrap_or_default();
        let matches = searcher
            .contact_matches(contact.org_id, query, contact.id)
            .await
            .map_err(|e| anyhow::anyhow!("error evaluating group {}: {}", group.uuid, e))?;

        if matches {
            super::add_contact_to_group(db, contact.id, group.id).await?;
        } else {
            super::remove_contact_from_group(db, contact.id, group.id).await?;
        }
    }
    Ok(())
}
