//! Scene-scoped commit hooks.
//!
//! Sprint events are applied to a per-session [`Scene`] which collects the
//! side effects they imply. Pre-commit hooks run inside the transaction that
//! persists sessions and runs; post-commit hooks run only after it commits.
//! Hooks batch across all scenes of a transaction, so a 100-contact batch
//! start does one pass per hook kind, not one per contact.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::engine::SprintEvent;
use crate::models::{
    self, Contact, ContactId, FlowStart, MsgId, MsgType, MsgVisibility, NewOutgoingMsg, SessionId,
    SessionOutput, SessionType, TopupId,
};
use crate::queue::{CourierSpool, QueueName, TaskQueue};
use crate::runtime::Runtime;
use crate::task::{Task, TaskPriority, TaskType};

/// The known hook kinds, in their batch-apply order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookKind {
    // pre-commit
    CommitMessages,
    InsertStarts,
    InsertWebhookLogs,
    UnsubscribeResthooks,
    OpenTickets,
    MarkMsgsHandled,
    UpdateLastSeen,
    // post-commit
    SendMessages,
    QueueStarts,
    SendEmails,
}

const PRE_COMMIT_ORDER: &[HookKind] = &[
    HookKind::CommitMessages,
    HookKind::InsertStarts,
    HookKind::InsertWebhookLogs,
    HookKind::UnsubscribeResthooks,
    HookKind::OpenTickets,
    HookKind::MarkMsgsHandled,
    HookKind::UpdateLastSeen,
];

const POST_COMMIT_ORDER: &[HookKind] = &[
    HookKind::SendMessages,
    HookKind::QueueStarts,
    HookKind::SendEmails,
];

/// A webhook call made by the engine during a sprint, persisted for audit.
#[derive(Clone, Debug)]
pub struct WebhookLog {
    pub url: String,
    pub status_code: u16,
    pub elapsed_ms: i64,
    pub request: String,
    pub response: String,
    pub resthook: Option<String>,
}

/// Marks an inbound message handled with the topup that was allocated for it.
#[derive(Clone, Copy, Debug)]
pub struct MarkHandled {
    pub msg_id: MsgId,
    pub visibility: MsgVisibility,
    pub msg_type: MsgType,
    pub topup_id: Option<TopupId>,
}

/// The per-session collector of commit-hook payloads.
#[derive(Debug)]
pub struct Scene {
    pub contact_id: ContactId,
    pub contact_uuid: Uuid,
    pub session_id: Option<SessionId>,
    pub session_uuid: Uuid,
    pub session_type: SessionType,
    /// Wait timeout in seconds, attached to the last outgoing message so
    /// the courier can report the wait start on delivery.
    pub session_timeout: Option<i64>,
    /// The inbound message being handled, if this scene is a reply.
    pub incoming_msg: Option<(MsgId, Option<String>)>,

    msgs: Vec<NewOutgoingMsg>,
    starts: Vec<FlowStart>,
    webhook_logs: Vec<WebhookLog>,
    resthook_unsubs: Vec<(String, String)>,
    tickets: Vec<(Uuid, String, String)>,
    mark_handled: Option<MarkHandled>,
    last_seen_on: Option<DateTime<Utc>>,
    emails: Vec<(Vec<String>, String)>,
}

impl Scene {
    pub fn new(contact: &Contact) -> Scene {
        Scene {
            contact_id: contact.id,
            contact_uuid: contact.uuid,
            session_id: None,
            session_uuid: Uuid::new_v4(),
            session_type: SessionType::Messaging,
            session_timeout: None,
            incoming_msg: None,
            msgs: Vec::new(),
            starts: Vec::new(),
            webhook_logs: Vec::new(),
            resthook_unsubs: Vec::new(),
            tickets: Vec::new(),
            mark_handled: None,
            last_seen_on: None,
            emails: Vec::new(),
        }
    }

    /// Bind the scene to its persisted session.
    pub fn attach_session(&mut self, session_id: SessionId, output: &SessionOutput) {
        self.session_id = Some(session_id);
        self.session_uuid = output.uuid;
        self.session_type = output.session_type;
        self.session_timeout = output.timeout_on.map(|timeout_on| {
            let base = output.wait_started_on.unwrap_or_else(Utc::now);
            (timeout_on - base).num_seconds().max(0)
        });
    }

    pub fn mark_msg_handled(&mut self, mark: MarkHandled) {
        self.mark_handled = Some(mark);
    }

    pub fn msgs(&self) -> &[NewOutgoingMsg] {
        &self.msgs
    }

    pub fn starts(&self) -> &[FlowStart] {
        &self.starts
    }
}

/// Apply a sprint's events to its scene, collecting the commit hooks they
/// imply. Events are applied in engine emission order.
pub fn apply_events(
    scene: &mut Scene,
    assets: &OrgAssets,
    contact: &Contact,
    events: &[SprintEvent],
) -> anyhow::Result<()> {
    for event in events {
        match event {
            SprintEvent::MsgCreated { msg } => {
                let channel = msg.channel_uuid.and_then(|u| assets.channel_by_uuid(u));
                let urn = msg
                    .urn
                    .clone()
                    .or_else(|| contact.preferred_urn().map(|u| u.identity()));

                scene.msgs.push(NewOutgoingMsg {
                    uuid: msg.uuid,
                    org_id: assets.org_id(),
                    contact_id: contact.id,
                    channel_id: channel.map(|c| c.id),
                    channel_uuid: channel.map(|c| c.uuid),
                    urn,
                    text: msg.text.clone(),
                    attachments: msg.attachments.clone(),
                    quick_replies: msg.quick_replies.clone(),
                    session_id: None,
                    topup_id: None,
                    high_priority: scene.incoming_msg.is_some(),
                    created_on: Utc::now(),
                    timeout_secs: None,
                    id: None,
                });
            }

            SprintEvent::MsgReceived { created_on, .. } => {
                scene.last_seen_on = Some(*created_on);
            }

            SprintEvent::SessionTriggered {
                flow_uuid,
                group_uuids,
                contact_ids,
                urns,
                create_contact,
                ..
            } => {
                let Some(flow) = assets.flow_by_uuid(*flow_uuid) else {
                    anyhow::bail!("unable to load flow with uuid: {}", flow_uuid);
                };

                let mut start =
                    FlowStart::new(assets.org_id(), flow.id, flow.flow_type);
                start.contact_ids = contact_ids.clone();
                start.urns = urns.clone();
                start.create_contact = *create_contact;
                start.group_ids = group_uuids
                    .iter()
                    .filter_map(|uuid| assets.group_by_uuid(*uuid))
                    .map(|g| g.id)
                    .collect();

                scene.starts.push(start);
            }

            SprintEvent::WebhookCalled {
                url,
                status_code,
                elapsed_ms,
                request,
                response,
                resthook,
            } => {
                // a 410 means the receiver wants off this resthook
                if *status_code == 410 {
                    if let Some(slug) = resthook {
                        scene.resthook_unsubs.push((slug.clone(), url.clone()));
                    }
                }
                scene.webhook_logs.push(WebhookLog {
                    url: url.clone(),
                    status_code: *status_code,
                    elapsed_ms: *elapsed_ms,
                    request: request.clone(),
                    response: response.clone(),
                    resthook: resthook.clone(),
                });
            }

            SprintEvent::EmailSent { to, subject, .. } => {
                scene.emails.push((to.clone(), subject.clone()));
            }

            SprintEvent::TicketOpened {
                ticketer_uuid,
                subject,
                body,
            } => {
                scene
                    .tickets
                    .push((*ticketer_uuid, subject.clone(), body.clone()));
            }
        }
    }
    Ok(())
}

/// Run all pre-commit hooks inside the persisting transaction, each kind
/// batched across every scene.
pub async fn apply_pre_commit(
    tx: &mut Transaction<'_, Postgres>,
    assets: &OrgAssets,
    scenes: &mut [Scene],
) -> anyhow::Result<()> {
    for kind in PRE_COMMIT_ORDER {
        match kind {
            HookKind::CommitMessages => commit_messages(tx, assets, scenes).await?,
            HookKind::InsertStarts => insert_starts(tx, scenes).await?,
            HookKind::InsertWebhookLogs => insert_webhook_logs(tx, assets, scenes).await?,
            HookKind::UnsubscribeResthooks => unsubscribe_resthooks(tx, assets, scenes).await?,
            HookKind::OpenTickets => open_tickets(tx, assets, scenes).await?,
            HookKind::MarkMsgsHandled => mark_msgs_handled(tx, scenes).await?,
            HookKind::UpdateLastSeen => update_last_seen(tx, scenes).await?,
            _ => {}
        }
    }
    Ok(())
}

/// Run all post-commit hooks. These fire only after the transaction has
/// committed; failures here are logged, not propagated, since the session
/// state is already durable.
pub async fn apply_post_commit(
    rt: &Runtime,
    assets: &OrgAssets,
    scenes: &mut [Scene],
) -> anyhow::Result<()> {
    for kind in POST_COMMIT_ORDER {
        match kind {
            HookKind::SendMessages => send_messages(rt, scenes).await?,
            HookKind::QueueStarts => queue_starts(rt, assets, scenes).await?,
            HookKind::SendEmails => send_emails(scenes),
            _ => {}
        }
    }
    Ok(())
}

async fn commit_messages(
    tx: &mut Transaction<'_, Postgres>,
    assets: &OrgAssets,
    scenes: &mut [Scene],
) -> anyhow::Result<()> {
    for scene in scenes.iter_mut() {
        if scene.msgs.is_empty() {
            continue;
        }

        for msg in scene.msgs.iter_mut() {
            msg.session_id = scene.session_id;
            msg.topup_id = models::allocate_topup(&mut **tx, &assets.org).await?;
        }
        if let (Some(timeout), Some(last)) = (scene.session_timeout, scene.msgs.last_mut()) {
            last.timeout_secs = Some(timeout);
        }

        models::insert_outgoing_msgs(tx, &mut scene.msgs).await?;
    }
    Ok(())
}

async fn insert_starts(
    tx: &mut Transaction<'_, Postgres>,
    scenes: &mut [Scene],
) -> anyhow::Result<()> {
    for scene in scenes.iter_mut() {
        for start in scene.starts.iter_mut() {
            models::insert_flow_start(tx, start).await?;
        }
    }
    Ok(())
}

async fn insert_webhook_logs(
    tx: &mut Transaction<'_, Postgres>,
    assets: &OrgAssets,
    scenes: &mut [Scene],
) -> anyhow::Result<()> {
    for scene in scenes.iter() {
        for log in &scene.webhook_logs {
            sqlx::query(
                r#"
                INSERT INTO flows_webhookresult
                    (org_id, contact_id, url, status_code, elapsed_ms, request, response, created_on)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                "#,
            )
            .bind(assets.org_id().0)
            .bind(scene.contact_id.0)
            .bind(&log.url)
            .bind(log.status_code as i32)
            .bind(log.elapsed_ms)
            .bind(&log.request)
            .bind(&log.response)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn unsubscribe_resthooks(
    tx: &mut Transaction<'_, Postgres>,
    assets: &OrgAssets,
    scenes: &[Scene],
) -> anyhow::Result<()> {
    for scene in scenes {
        for (slug, url) in &scene.resthook_unsubs {
            tracing::info!(resthook = %slug, url = %url, "unsubscribing resthook after 410");
            sqlx::query(
                r#"
                UPDATE api_resthooksubscriber s
                SET is_active = FALSE, modified_on = NOW()
                FROM api_resthook r
                WHERE s.resthook_id = r.id
                  AND r.org_id = $1
                  AND r.slug = $2
                  AND s.target_url = $3
                  AND s.is_active = TRUE
                "#,
            )
            .bind(assets.org_id().0)
            .bind(slug)
            .bind(url)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn open_tickets(
    tx: &mut Transaction<'_, Postgres>,
    assets: &OrgAssets,
    scenes: &[Scene],
) -> anyhow::Result<()> {
    for scene in scenes {
        for (ticketer_uuid, subject, body) in &scene.tickets {
            sqlx::query(
                r#"
                INSERT INTO tickets_ticket
                    (uuid, org_id, contact_id, ticketer_uuid, subject, body, status, opened_on, modified_on)
                VALUES ($1, $2, $3, $4, $5, $6, 'O', NOW(), NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(assets.org_id().0)
            .bind(scene.contact_id.0)
            .bind(ticketer_uuid)
            .bind(subject)
            .bind(body)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn mark_msgs_handled(
    tx: &mut Transaction<'_, Postgres>,
    scenes: &[Scene],
) -> anyhow::Result<()> {
    for scene in scenes {
        if let Some(mark) = scene.mark_handled {
            models::update_message(
                &mut **tx,
                mark.msg_id,
                models::MsgStatus::Handled,
                mark.visibility,
                mark.msg_type,
                mark.topup_id,
            )
            .await?;
        }
    }
    Ok(())
}

async fn update_last_seen(
    tx: &mut Transaction<'_, Postgres>,
    scenes: &[Scene],
) -> anyhow::Result<()> {
    for scene in scenes {
        if let Some(when) = scene.last_seen_on {
            models::update_last_seen_on(&mut **tx, scene.contact_id, when).await?;
        }
    }
    Ok(())
}

/// Spool committed messages to the courier. Messages for offline sessions
/// stay in the database for the org's own distribution channel; messages
/// that cannot be spooled are moved back to pending.
async fn send_messages(rt: &Runtime, scenes: &mut [Scene]) -> anyhow::Result<()> {
    let mut pending: Vec<MsgId> = Vec::new();

    for scene in scenes.iter() {
        if scene.session_type == SessionType::MessagingOffline {
            continue;
        }

        for msg in &scene.msgs {
            let Some(id) = msg.id else {
                continue;
            };
            let Some(channel_uuid) = msg.channel_uuid else {
                pending.push(id);
                continue;
            };

            if let Err(err) = rt
                .store
                .push_msg(channel_uuid, &msg.courier_payload(), msg.high_priority)
                .await
            {
                tracing::error!(msg_id = %id, "error spooling message: {:#}", err);
                pending.push(id);
            }
        }
    }

    if !pending.is_empty() {
        models::mark_messages_pending(&rt.db, &pending).await?;
    }
    Ok(())
}

/// Queue the sub-flow starts inserted pre-commit. Group starts go to the
/// batch queue at high priority so they fan out ahead of routine bulk work.
async fn queue_starts(rt: &Runtime, assets: &OrgAssets, scenes: &[Scene]) -> anyhow::Result<()> {
    for scene in scenes {
        for start in &scene.starts {
            let (queue, priority) = if start.group_ids.is_empty() {
                (QueueName::Handler, TaskPriority::Default)
            } else {
                (QueueName::Batch, TaskPriority::High)
            };

            let task = Task::new(TaskType::StartFlow, assets.org_id(), start)?;
            rt.store.push(queue, assets.org_id(), &task, priority).await?;
        }
    }
    Ok(())
}

fn send_emails(scenes: &[Scene]) {
    for scene in scenes {
        for (to, subject) in &scene.emails {
            tracing::info!(to = ?to, subject = %subject, "email queued to smtp service");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MsgOutSpec;
    use crate::models::{ContactStatus, Flow, FlowId, FlowType, Org, OrgId};
    use serde_json::Value;

    fn test_contact() -> Contact {
        Contact {
            id: ContactId(42),
            uuid: Uuid::new_v4(),
            org_id: OrgId(1),
            name: Some("Bob".to_string()),
            language: None,
            status: ContactStatus::Active,
            created_on: Utc::now(),
            last_seen_on: None,
            urns: Vec::new(),
        }
    }

    fn test_assets() -> OrgAssets {
        let flow = Flow {
            id: FlowId(7),
            uuid: Uuid::new_v4(),
            org_id: OrgId(1),
            name: "Child".to_string(),
            flow_type: FlowType::Messaging,
            ignore_triggers: false,
        };
        OrgAssets::from_parts(
            Org {
                id: OrgId(1),
                uuid: Uuid::new_v4(),
                name: "Test".to_string(),
                language: None,
                uses_topups: false,
                config: Value::Null,
            },
            Vec::new(),
            vec![flow],
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn test_msg_created_collects_outgoing() {
        let assets = test_assets();
        let contact = test_contact();
        let mut scene = Scene::new(&contact);
        scene.incoming_msg = Some((MsgId(5), None));

        let events = vec![SprintEvent::MsgCreated {
            msg: MsgOutSpec {
                uuid: Uuid::new_v4(),
                urn: Some("tel:+593979123456".to_string()),
                channel_uuid: None,
                text: "hi there".to_string(),
                attachments: Vec::new(),
                quick_replies: Vec::new(),
            },
        }];

        apply_events(&mut scene, &assets, &contact, &events).unwrap();
        assert_eq!(scene.msgs().len(), 1);
        // replies to an inbound message jump the courier queue
        assert!(scene.msgs()[0].high_priority);
    }

    #[test]
    fn test_session_triggered_builds_start() {
        let assets = test_assets();
        let flow_uuid = assets.flow_by_id(FlowId(7)).unwrap().uuid;
        let contact = test_contact();
        let mut scene = Scene::new(&contact);

        let events = vec![SprintEvent::SessionTriggered {
            flow_uuid,
            group_uuids: Vec::new(),
            contact_ids: vec![ContactId(100)],
            urns: Vec::new(),
            create_contact: false,
            parent_summary: None,
        }];

        apply_events(&mut scene, &assets, &contact, &events).unwrap();
        assert_eq!(scene.starts().len(), 1);
        assert_eq!(scene.starts()[0].flow_id, FlowId(7));
        assert_eq!(scene.starts()[0].contact_ids, vec![ContactId(100)]);
    }

    #[test]
    fn test_session_triggered_unknown_flow_errors() {
        let assets = test_assets();
        let contact = test_contact();
        let mut scene = Scene::new(&contact);

        let events = vec![SprintEvent::SessionTriggered {
            flow_uuid: Uuid::new_v4(),
            group_uuids: Vec::new(),
            contact_ids: Vec::new(),
            urns: Vec::new(),
            create_contact: false,
            parent_summary: None,
        }];

        assert!(apply_events(&mut scene, &assets, &contact, &events).is_err());
    }

    #[test]
    fn test_webhook_410_queues_resthook_unsub() {
        let assets = test_assets();
        let contact = test_contact();
        let mut scene = Scene::new(&contact);

        let events = vec![SprintEvent::WebhookCalled {
            url: "https://example.com/hook".to_string(),
            status_code: 410,
            elapsed_ms: 12,
            request: "GET / HTTP/1.1".to_string(),
            response: "HTTP/1.1 410 Gone".to_string(),
            resthook: Some("new-registration".to_string()),
        }];

        apply_events(&mut scene, &assets, &contact, &events).unwrap();
        assert_eq!(scene.webhook_logs.len(), 1);
        assert_eq!(scene.resthook_unsubs.len(), 1);
        assert_eq!(scene.resthook_unsubs[0].0, "new-registration");
    }

    #[test]
    fn test_attach_session_computes_timeout() {
        let contact = test_contact();
        let mut scene = Scene::new(&contact);
        let now = Utc::now();

        let output = SessionOutput {
            uuid: Uuid::new_v4(),
            status: crate::models::SessionStatus::Waiting,
            session_type: SessionType::Messaging,
            current_flow_id: Some(FlowId(7)),
            timeout_on: Some(now + chrono::Duration::seconds(300)),
            wait_started_on: Some(now),
            state: Value::Null,
            responded: false,
        };

        scene.attach_session(SessionId(11), &output);
        assert_eq!(scene.session_id, Some(SessionId(11)));
        assert_eq!(scene.session_timeout, Some(300));
    }
}
