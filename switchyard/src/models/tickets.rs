use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use super::{ContactId, TicketId};

/// An open ticket with an external ticketing service.
#[derive(Clone, Debug)]
pub struct Ticket {
    pub id: TicketId,
    pub uuid: Uuid,
    pub contact_id: ContactId,
    pub external_id: Option<String>,
}

pub async fn load_open_tickets_for_contact(
    db: impl PgExecutor<'_>,
    contact_id: ContactId,
) -> anyhow::Result<Vec<Ticket>> {
    let rows = sqlx::query(
        r#"
        SELECT id, uuid, external_id
        FROM tickets_ticket
        WHERE contact_id = $1 AND status = 'O'
        ORDER BY opened_on
        "#,
    )
    .bind(contact_id.0)
    .fetch_all(db)
    .await?;

    let mut tickets = Vec::with_capacity(rows.len());
    for row in rows {
        tickets.push(Ticket {
            id: TicketId(row.try_get("id")?),
            uuid: row.try_get("uuid")?,
            contact_id,
            external_id: row.try_get("external_id")?,
        });
    }
    Ok(tickets)
}

/// Record an inbound message against the ticket so the ticketing service
/// sync (an external collaborator) can forward it.
pub async fn forward_incoming(
    db: impl PgExecutor<'_>,
    ticket: &Ticket,
    msg_uuid: Uuid,
    text: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tickets_ticketevent (ticket_id, event_type, msg_uuid, note, created_on)
        VALUES ($1, 'M', $2, $3, NOW())
        "#,
    )
    .bind(ticket.id.0)
    .bind(msg_uuid)
    .bind(text)
    .execute(db)
    .await?;
    Ok(())
}
