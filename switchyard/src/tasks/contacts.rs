//! The per-contact serial event loop.
//!
//! `handle_contact_event` tasks on the shared handler queue carry only a
//! contact id; the actual events sit on the per-contact list in the KV
//! store. The handler takes the contact lock, drains that list one event at
//! a time and dispatches each to its typed sub-handler, so all flow-state
//! writes for a contact are serialized even across hosts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{FlowResume, FlowTrigger};
use crate::error::{TaskError, TaskResult};
use crate::hooks::{MarkHandled, Scene};
use crate::lock::{contact_lock, LeaseLock};
use crate::models::{
    self, ContactId, ContactStatus, MsgIn, MsgType, MsgVisibility, RunId, SessionId, SessionType,
    TriggerType, UrnId,
};
use crate::queue::{ContactSpool, QueueName, TaskQueue};
use crate::runner::{self, StartOptions};
use crate::runtime::Runtime;
use crate::store::Store;
use crate::task::{Task, TaskPriority, TaskType};
use crate::telemetry;

/// Payload of the summary task on the shared handler queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandleEventTask {
    pub contact_id: ContactId,
}

/// An inbound message event as written by the channel ingest process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MsgEvent {
    pub contact_id: ContactId,
    pub org_id: models::OrgId,
    pub channel_id: models::ChannelId,
    pub msg_id: models::MsgId,
    pub msg_uuid: uuid::Uuid,
    #[serde(default)]
    pub msg_external_id: Option<String>,
    pub urn: String,
    pub urn_id: UrnId,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub new_contact: bool,
    pub created_on: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopEvent {
    pub contact_id: ContactId,
    pub org_id: models::OrgId,
    pub occurred_on: DateTime<Utc>,
}

/// A channel-level event (new conversation, referral, missed call, welcome
/// message).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub contact_id: ContactId,
    pub org_id: models::OrgId,
    pub channel_id: models::ChannelId,
    pub urn_id: UrnId,
    #[serde(default)]
    pub extra: Option<Value>,
    #[serde(default)]
    pub new_contact: bool,
    pub occurred_on: DateTime<Utc>,
}

/// A scheduled timeout or expiration, validated against current session
/// state before it is honored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimedEvent {
    pub contact_id: ContactId,
    pub org_id: models::OrgId,
    pub session_id: SessionId,
    #[serde(default)]
    pub run_id: Option<RunId>,
    pub time: DateTime<Utc>,
}

/// Push a contact event onto the contact's list and make sure a summary
/// task exists for it on the handler queue. `front` requeues a retry ahead
/// of newer events.
pub async fn queue_handle_task(
    store: &dyn Store,
    contact_id: ContactId,
    task: &Task,
    front: bool,
) -> anyhow::Result<()> {
    store
        .push_event(task.org_id, contact_id, task, front)
        .await?;
    queue_contact_task(store, task.org_id, contact_id).await
}

/// Enqueue just the summary task; the contact's events are already on its
/// list.
pub async fn queue_contact_task(
    store: &dyn Store,
    org_id: models::OrgId,
    contact_id: ContactId,
) -> anyhow::Result<()> {
    let task = Task::new(
        TaskType::HandleContactEvent,
        org_id,
        &HandleEventTask { contact_id },
    )?;
    store
        .push(QueueName::Handler, org_id, &task, TaskPriority::Default)
        .await
}

pub fn new_timeout_task(
    org_id: models::OrgId,
    contact_id: ContactId,
    session_id: SessionId,
    time: DateTime<Utc>,
) -> anyhow::Result<Task> {
    Task::new(
        TaskType::TimeoutEvent,
        org_id,
        &TimedEvent {
            contact_id,
            org_id,
            session_id,
            run_id: None,
            time,
        },
    )
}

pub fn new_expiration_task(
    org_id: models::OrgId,
    contact_id: ContactId,
    session_id: SessionId,
    run_id: RunId,
    time: DateTime<Utc>,
) -> anyhow::Result<Task> {
    Task::new(
        TaskType::ExpirationEvent,
        org_id,
        &TimedEvent {
            contact_id,
            org_id,
            session_id,
            run_id: Some(run_id),
            time,
        },
    )
}

/// Handler for `handle_contact_event` tasks: lease the contact lock and
/// drain the contact's event list.
pub async fn handle_contact_event(rt: Arc<Runtime>, task: Task) -> TaskResult {
    let payload: HandleEventTask = task.decode()?;
    let org_id = task.org_id;
    let contact_id = payload.contact_id;

    let lock_name = contact_lock(org_id, contact_id);
    let ttl = Duration::from_secs(rt.config.contact_lock_ttl_secs);
    let max_wait = Duration::from_secs(rt.config.contact_lock_wait_secs);

    let Some(token) = rt.store.acquire(&lock_name, ttl, max_wait).await? else {
        // another worker is draining this contact; defer rather than race.
        // the events stay on the contact list, only the summary is requeued.
        queue_contact_task(rt.store.as_ref(), org_id, contact_id).await?;
        tracing::info!(
            org_id = %org_id,
            contact_id = %contact_id,
            "failed to get lock for contact, requeued and skipping"
        );
        return Ok(());
    };

    let result = drain_contact_events(&rt, org_id, contact_id).await;

    if let Err(err) = rt.store.release(&lock_name, &token).await {
        tracing::warn!(contact_id = %contact_id, "error releasing contact lock: {:#}", err);
    }
    result
}

async fn drain_contact_events(
    rt: &Arc<Runtime>,
    org_id: models::OrgId,
    contact_id: ContactId,
) -> TaskResult {
    loop {
        let Some(mut event) = rt.store.pop_event(org_id, contact_id).await? else {
            return Ok(());
        };

        let event_type = event.task_type;
        let started = std::time::Instant::now();
        let result = dispatch_contact_event(rt, &event).await;
        telemetry::record_contact_event(
            event_type,
            started.elapsed().as_secs_f64(),
            event.age().to_std().map(|d| d.as_secs_f64()).unwrap_or(0.0),
        );

        match result {
            Ok(()) => {}
            Err(TaskError::Transient(err)) => {
                event.error_count += 1;
                if event.error_count < rt.config.max_task_retries {
                    // back at the head so the retry runs before newer events
                    queue_handle_task(rt.store.as_ref(), contact_id, &event, true).await?;
                    tracing::error!(
                        org_id = %org_id,
                        contact_id = %contact_id,
                        event_type = %event_type,
                        error_count = event.error_count,
                        "error handling contact event, requeued: {:#}",
                        err
                    );
                    return Ok(());
                }
                tracing::error!(
                    org_id = %org_id,
                    contact_id = %contact_id,
                    event_type = %event_type,
                    "error handling contact event, permanent failure: {:#}",
                    err
                );
            }
            Err(TaskError::DataMissing(what)) => {
                tracing::info!(contact_id = %contact_id, event_type = %event_type, "ignoring event: {}", what);
            }
            Err(TaskError::Stale) => {}
            Err(TaskError::UserInput(msg)) => {
                tracing::info!(contact_id = %contact_id, event_type = %event_type, "user error: {}", msg);
            }
            Err(TaskError::Invariant(msg)) => {
                tracing::error!(contact_id = %contact_id, event_type = %event_type, "invariant violation: {}", msg);
            }
        }
    }
}

async fn dispatch_contact_event(rt: &Arc<Runtime>, event: &Task) -> TaskResult {
    match event.task_type {
        TaskType::MsgEvent => handle_msg_event(rt, event.decode()?).await,
        TaskType::StopEvent => handle_stop_event(rt, event.decode()?).await,
        TaskType::NewConversation
        | TaskType::Referral
        | TaskType::MoMiss
        | TaskType::WelcomeMessage => {
            handle_channel_event(rt, event.task_type, event.decode()?).await
        }
        TaskType::TimeoutEvent | TaskType::ExpirationEvent => {
            handle_timed_event(rt, event.task_type, event.decode()?).await
        }
        other => Err(TaskError::Invariant(format!(
            "unknown contact event type: {}",
            other
        ))),
    }
}

/// What an inbound message should do, given any matching trigger and the
/// contact's active flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MsgAction {
    StartFlow,
    Resume,
    Inbox,
}

/// The decision table for inbound messages. `active_flow_ignores` is the
/// `ignore_triggers` flag of the session's current flow, `None` when there
/// is no active session (or the session has no current flow).
pub fn resolve_msg_action(
    trigger: Option<TriggerType>,
    active_flow_ignores: Option<bool>,
) -> MsgAction {
    match (trigger, active_flow_ignores) {
        // no active flow: any matching trigger starts its flow
        (Some(_), None) => MsgAction::StartFlow,
        // keyword triggers interrupt unless the current flow opts out;
        // the catchall never interrupts an active flow
        (Some(trigger), Some(ignores)) if trigger != TriggerType::Catchall && !ignores => {
            MsgAction::StartFlow
        }
        (_, Some(_)) => MsgAction::Resume,
        (None, None) => MsgAction::Inbox,
    }
}

async fn handle_msg_event(rt: &Arc<Runtime>, event: MsgEvent) -> TaskResult {
    let assets = rt
        .assets
        .get(&rt.db, event.org_id)
        .await?
        .ok_or_else(|| TaskError::DataMissing(format!("org {}", event.org_id)))?;

    // credit the message against the org's topups up front; failing to
    // allocate is fatal for this event
    let topup = models::allocate_topup(&rt.db, &assets.org).await?;

    let contacts = models::load_contacts(&rt.db, event.org_id, &[event.contact_id]).await?;

    // contact has been deleted, mark the message handled and archived
    let Some(mut contact) = contacts.into_iter().next() else {
        models::update_message(
            &rt.db,
            event.msg_id,
            models::MsgStatus::Handled,
            MsgVisibility::Archived,
            MsgType::Inbox,
            topup,
        )
        .await?;
        return Ok(());
    };

    let channel = assets.channel_by_id(event.channel_id);

    if !contact.urns.is_empty() {
        models::update_preferred_urn(&rt.db, &contact, event.urn_id, channel).await?;
    }

    // inactive channel or blocked contact: archive and move on
    if channel.is_none() || contact.status == ContactStatus::Blocked {
        models::update_message(
            &rt.db,
            event.msg_id,
            models::MsgStatus::Handled,
            MsgVisibility::Archived,
            MsgType::Inbox,
            topup,
        )
        .await?;
        return Ok(());
    }

    let mut new_contact = event.new_contact;
    if contact.status == ContactStatus::Stopped {
        models::unstop_contact(&rt.db, contact.id).await?;
        contact.status = ContactStatus::Active;
        new_contact = true;
    }

    if new_contact {
        models::calculate_dynamic_groups(&rt.db, rt.searcher.as_ref(), assets.groups(), &contact)
            .await?;
    }

    for ticket in models::load_open_tickets_for_contact(&rt.db, contact.id).await? {
        models::forward_incoming(&rt.db, &ticket, event.msg_uuid, &event.text).await?;
    }

    let msg_in = MsgIn {
        id: event.msg_id,
        uuid: event.msg_uuid,
        urn: event.urn.clone(),
        urn_id: event.urn_id,
        channel_id: event.channel_id,
        text: event.text.clone(),
        attachments: event.attachments.clone(),
        external_id: event.msg_external_id.clone(),
    };

    let trigger = models::find_matching_msg_trigger(assets.triggers(), &event.text);

    let mut session = models::active_session_for_contact(
        &rt.db,
        event.org_id,
        SessionType::Messaging,
        contact.id,
    )
    .await?;

    let mut current_flow = None;
    let mut orphaned_session = None;
    if let Some(s) = &session {
        if let Some(flow_id) = s.current_flow_id {
            match assets.flow_by_id(flow_id) {
                Some(flow) => current_flow = Some(flow),
                None => orphaned_session = Some(s.id),
            }
        }
    }
    if let Some(session_id) = orphaned_session {
        // the flow this session is in is gone, interrupt it
        let mut tx = rt.db.begin().await?;
        models::exit_sessions(
            &mut tx,
            &[session_id],
            models::SessionStatus::Interrupted,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;
        session = None;
    }

    let action = resolve_msg_action(
        trigger.map(|t| t.trigger_type),
        current_flow.map(|f| f.ignore_triggers),
    );

    let mark = MarkHandled {
        msg_id: event.msg_id,
        visibility: MsgVisibility::Visible,
        msg_type: MsgType::Flow,
        topup_id: topup,
    };

    if action == MsgAction::StartFlow {
        let t = trigger.expect("start action implies a matched trigger");
        if let Some(flow) = assets.flow_by_id(t.flow_id) {
            // voice flows start through the batch queue, never inline
            if flow.flow_type == models::FlowType::Voice {
                runner::trigger_ivr_flow(
                    rt,
                    event.org_id,
                    flow.id,
                    vec![contact.id],
                    Some(mark),
                )
                .await?;
                return Ok(());
            }

            let flow_trigger = FlowTrigger::Msg {
                flow_id: flow.id,
                msg: msg_in.clone(),
                keyword_match: t.keyword.clone(),
            };

            let incoming = (event.msg_id, event.msg_external_id.clone());
            let modifier = move |scene: &mut Scene| {
                scene.incoming_msg = Some(incoming.clone());
                scene.mark_msg_handled(mark);
            };

            runner::start_flow_for_contacts(
                rt,
                &assets,
                vec![(contact, flow_trigger)],
                StartOptions::default(),
                Some(&modifier),
            )
            .await?;
            return Ok(());
        }
        // the trigger's flow is gone; fall through to resume or inbox
    }

    if let (Some(session), Some(_)) = (&mut session, current_flow) {
        session.set_incoming_msg(event.msg_id, event.msg_external_id.clone());
        let modifier = move |scene: &mut Scene| {
            scene.mark_msg_handled(mark);
        };
        runner::resume_flow(
            rt,
            &assets,
            &contact,
            session,
            &FlowResume::Msg { msg: msg_in },
            Some(&modifier),
        )
        .await?;
        return Ok(());
    }

    // neither triggered nor resumed: plain inbox message
    handle_as_inbox(rt, &contact, event.msg_id, topup).await
}

async fn handle_as_inbox(
    rt: &Runtime,
    contact: &models::Contact,
    msg_id: models::MsgId,
    topup: Option<models::TopupId>,
) -> TaskResult {
    let mut tx = rt.db.begin().await?;
    models::update_last_seen_on(&mut *tx, contact.id, Utc::now()).await?;
    models::update_message(
        &mut *tx,
        msg_id,
        models::MsgStatus::Handled,
        MsgVisibility::Visible,
        MsgType::Inbox,
        topup,
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

async fn handle_channel_event(
    rt: &Arc<Runtime>,
    event_type: TaskType,
    event: ChannelEvent,
) -> TaskResult {
    let assets = rt
        .assets
        .get(&rt.db, event.org_id)
        .await?
        .ok_or_else(|| TaskError::DataMissing(format!("org {}", event.org_id)))?;

    let Some(channel) = assets.channel_by_id(event.channel_id) else {
        tracing::info!(channel_id = %event.channel_id, "ignoring event, couldn't find channel");
        return Ok(());
    };

    let contacts = models::load_contacts(&rt.db, event.org_id, &[event.contact_id]).await?;
    let Some(contact) = contacts.into_iter().next() else {
        return Ok(());
    };
    if contact.status == ContactStatus::Blocked {
        return Ok(());
    }

    models::update_last_seen_on(&rt.db, contact.id, event.occurred_on).await?;

    let referrer_id = event
        .extra
        .as_ref()
        .and_then(|e| e.get("referrer_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let trigger = match event_type {
        TaskType::NewConversation => {
            models::find_matching_new_conversation_trigger(assets.triggers(), channel)
        }
        TaskType::Referral => models::find_matching_referral_trigger(
            assets.triggers(),
            channel,
            referrer_id.as_deref(),
        ),
        TaskType::MoMiss => models::find_matching_missed_call_trigger(assets.triggers()),
        TaskType::WelcomeMessage => None,
        other => {
            return Err(TaskError::Invariant(format!(
                "unknown channel event type: {}",
                other
            )))
        }
    };

    models::update_preferred_urn(&rt.db, &contact, event.urn_id, Some(channel)).await?;

    if event.new_contact {
        models::calculate_dynamic_groups(&rt.db, rt.searcher.as_ref(), assets.groups(), &contact)
            .await?;
    }

    let Some(trigger) = trigger else {
        tracing::info!(
            channel_id = %event.channel_id,
            event_type = %event_type,
            "ignoring channel event, no trigger found"
        );
        return Ok(());
    };

    let Some(flow) = assets.flow_by_id(trigger.flow_id) else {
        return Ok(());
    };

    if flow.flow_type == models::FlowType::Voice {
        runner::trigger_ivr_flow(rt, event.org_id, flow.id, vec![contact.id], None).await?;
        return Ok(());
    }

    let flow_trigger = FlowTrigger::Channel {
        flow_id: flow.id,
        channel_id: channel.id,
        event_type: event_type.as_str().to_string(),
        params: event.extra.clone(),
    };

    runner::start_flow_for_contacts(
        rt,
        &assets,
        vec![(contact, flow_trigger)],
        StartOptions::default(),
        None,
    )
    .await?;
    Ok(())
}

/// A stop request from the channel: mark the contact stopped and bump their
/// last seen, in one transaction.
async fn handle_stop_event(rt: &Arc<Runtime>, event: StopEvent) -> TaskResult {
    let mut tx = rt.db.begin().await?;
    models::stop_contact(&mut *tx, event.org_id, event.contact_id).await?;
    models::update_last_seen_on(&mut *tx, event.contact_id, event.occurred_on).await?;
    tx.commit().await?;
    Ok(())
}

/// Timeouts and expirations are honored only when the referenced session is
/// still the contact's waiting session and the recorded time still matches
/// the event's; anything else means the session moved on and the event is
/// stale.
async fn handle_timed_event(
    rt: &Arc<Runtime>,
    event_type: TaskType,
    event: TimedEvent,
) -> TaskResult {
    let assets = rt
        .assets
        .get(&rt.db, event.org_id)
        .await?
        .ok_or_else(|| TaskError::DataMissing(format!("org {}", event.org_id)))?;

    let contacts = models::load_contacts(&rt.db, event.org_id, &[event.contact_id]).await?;
    let Some(contact) = contacts.into_iter().next() else {
        return Ok(());
    };
    if contact.status != ContactStatus::Active {
        return Ok(());
    }

    let session = models::active_session_for_contact(
        &rt.db,
        event.org_id,
        SessionType::Messaging,
        contact.id,
    )
    .await?;

    let Some(session) = session else {
        tracing::info!(session_id = %event.session_id, "ignoring event, couldn't find active session");
        return Ok(());
    };
    if session.id != event.session_id {
        tracing::info!(session_id = %event.session_id, "ignoring event, session has moved on");
        return Ok(());
    }

    let resume = match event_type {
        TaskType::ExpirationEvent => {
            let Some(run_id) = event.run_id else {
                return Err(TaskError::Invariant(
                    "expiration event without run id".to_string(),
                ));
            };

            let Some(expiration) = models::run_expiration(&rt.db, run_id).await? else {
                tracing::info!(run_id = %run_id, "ignoring expiration, run no longer active");
                return Ok(());
            };
            if !times_equal(expiration, event.time) {
                tracing::info!(run_id = %run_id, "ignoring expiration, has been updated");
                return Ok(());
            }
            FlowResume::RunExpiration
        }

        TaskType::TimeoutEvent => {
            let Some(timeout_on) = session.timeout_on else {
                tracing::info!(session_id = %session.id, "ignoring session timeout, no timeout set");
                return Ok(());
            };
            if !times_equal(timeout_on, event.time) {
                tracing::info!(session_id = %session.id, "ignoring timeout, has been updated");
                return Ok(());
            }
            FlowResume::WaitTimeout
        }

        other => {
            return Err(TaskError::Invariant(format!(
                "unknown timed event type: {}",
                other
            )))
        }
    };

    runner::resume_flow(rt, &assets, &contact, &session, &resume, None).await?;
    Ok(())
}

/// Scheduled times pass through JSON serialization, so compare at
/// microsecond granularity rather than exact nanos.
fn times_equal(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.timestamp_micros() == b.timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_table() {
        use MsgAction::*;
        use TriggerType::*;

        // trigger / active flow? / flow ignores triggers -> action
        let cases = [
            (Some(Keyword), None, StartFlow),
            (Some(Catchall), None, StartFlow),
            (Some(Keyword), Some(false), StartFlow),
            (Some(Keyword), Some(true), Resume),
            (Some(Catchall), Some(false), Resume),
            (Some(Catchall), Some(true), Resume),
            (None, Some(false), Resume),
            (None, Some(true), Resume),
            (None, None, Inbox),
        ];

        for (trigger, flow, expected) in cases {
            assert_eq!(
                resolve_msg_action(trigger, flow),
                expected,
                "trigger={:?} flow={:?}",
                trigger,
                flow
            );
        }
    }

    #[test]
    fn test_timed_event_payload_round_trip() {
        let task = new_expiration_task(
            models::OrgId(1),
            ContactId(2),
            SessionId(3),
            RunId(4),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(task.task_type, TaskType::ExpirationEvent);
        let event: TimedEvent = task.decode().unwrap();
        assert_eq!(event.run_id, Some(RunId(4)));
        assert_eq!(event.session_id, SessionId(3));
    }

    #[test]
    fn test_timeout_task_has_no_run() {
        let task =
            new_timeout_task(models::OrgId(1), ContactId(2), SessionId(3), Utc::now()).unwrap();
        let event: TimedEvent = task.decode().unwrap();
        assert_eq!(event.run_id, None);
    }

    #[test]
    fn test_times_equal_ignores_sub_microsecond() {
        let a = Utc::now();
        let b = a + chrono::Duration::nanoseconds(100);
        assert!(times_equal(a, b));
        assert!(!times_equal(a, a + chrono::Duration::seconds(1)));
    }
}
