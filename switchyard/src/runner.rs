//! Start and resume orchestration.
//!
//! The runner is the only place engine sprints meet the database: it calls
//! the engine, writes sessions and runs inside one transaction, runs the
//! pre-commit hooks in that transaction and the post-commit hooks after it.
//! All of this happens under the contact lock for contact-event paths, and
//! per batch for start fan-out.

use chrono::Utc;

use crate::assets::OrgAssets;
use crate::engine::{FlowResume, FlowTrigger, Sprint};
use crate::error::TaskError;
use crate::hooks::{self, MarkHandled, Scene};
use crate::models::{
    self, ChannelConnectionId, Contact, FlowStart, FlowStartBatch, FlowType, Session, SessionId,
    StartId,
};
use crate::queue::{QueueName, TaskQueue};
use crate::runtime::Runtime;
use crate::task::{Task, TaskPriority, TaskType};

/// Hook applied to each scene before its sprint events, letting callers
/// attach bookkeeping such as marking the inbound message handled.
pub type SceneModifier = dyn Fn(&mut Scene) + Send + Sync;

/// Options for starting a group of contacts in a flow.
#[derive(Clone, Copy, Debug)]
pub struct StartOptions {
    /// Interrupt any waiting session of the same type before starting.
    pub interrupt: bool,
    pub start_id: Option<StartId>,
    pub connection_id: Option<ChannelConnectionId>,
}

impl Default for StartOptions {
    fn default() -> Self {
        StartOptions {
            interrupt: true,
            start_id: None,
            connection_id: None,
        }
    }
}

/// Start all of the given contacts in a flow. Per-contact engine failures
/// are logged and skipped; a batch write failure falls back to writing each
/// session in its own transaction so one bad contact can't sink the batch.
pub async fn start_flow_for_contacts(
    rt: &Runtime,
    assets: &OrgAssets,
    entries: Vec<(Contact, FlowTrigger)>,
    options: StartOptions,
    modifier: Option<&SceneModifier>,
) -> anyhow::Result<Vec<SessionId>> {
    let mut sprints: Vec<(Contact, Sprint)> = Vec::with_capacity(entries.len());
    for (contact, trigger) in entries {
        match rt.engine.new_session(assets, &contact, &trigger).await {
            Ok(sprint) => sprints.push((contact, sprint)),
            Err(err) => {
                tracing::error!(
                    contact_id = %contact.id,
                    flow_id = %trigger.flow_id(),
                    "error starting contact in flow: {:#}",
                    err
                );
            }
        }
    }

    if sprints.is_empty() {
        return Ok(Vec::new());
    }

    match write_sessions(rt, assets, &sprints, options, modifier).await {
        Ok(ids) => Ok(ids),
        Err(err) => {
            tracing::warn!(
                "error writing session batch, retrying contacts individually: {:#}",
                err
            );

            let mut ids = Vec::new();
            for pair in &sprints {
                match write_sessions(rt, assets, std::slice::from_ref(pair), options, modifier)
                    .await
                {
                    Ok(mut written) => ids.append(&mut written),
                    Err(err) => {
                        tracing::error!(
                            contact_id = %pair.0.id,
                            "error writing session for contact: {:#}",
                            err
                        );
                    }
                }
            }
            Ok(ids)
        }
    }
}

async fn write_sessions(
    rt: &Runtime,
    assets: &OrgAssets,
    batch: &[(Contact, Sprint)],
    options: StartOptions,
    modifier: Option<&SceneModifier>,
) -> anyhow::Result<Vec<SessionId>> {
    let org_id = assets.org_id();
    let now = Utc::now();
    let mut tx = rt.db.begin().await?;

    if options.interrupt {
        let contact_ids: Vec<_> = batch.iter().map(|(c, _)| c.id).collect();
        let session_type = batch[0].1.session.session_type;
        models::interrupt_contact_sessions(&mut tx, session_type, &contact_ids, now).await?;
    }

    let mut scenes = Vec::with_capacity(batch.len());
    let mut ids = Vec::with_capacity(batch.len());

    for (contact, sprint) in batch.iter() {
        let session_id = models::insert_session(
            &mut tx,
            org_id,
            contact.id,
            &sprint.session,
            options.connection_id,
            options.start_id,
        )
        .await?;
        models::upsert_runs(
            &mut tx,
            org_id,
            contact.id,
            session_id,
            options.start_id,
            &sprint.runs,
        )
        .await?;

        let mut scene = Scene::new(contact);
        scene.attach_session(session_id, &sprint.session);
        if let Some(modifier) = modifier {
            modifier(&mut scene);
        }
        hooks::apply_events(&mut scene, assets, contact, &sprint.events)?;

        scenes.push(scene);
        ids.push(session_id);
    }

    hooks::apply_pre_commit(&mut tx, assets, &mut scenes).await?;
    tx.commit().await?;

    if let Err(err) = hooks::apply_post_commit(rt, assets, &mut scenes).await {
        tracing::error!("error applying post commit hooks: {:#}", err);
    }

    Ok(ids)
}

/// Advance a waiting session with the given resume. Resuming a session that
/// has already reached a terminal status is a no-op with a logged warning.
pub async fn resume_flow(
    rt: &Runtime,
    assets: &OrgAssets,
    contact: &Contact,
    session: &Session,
    resume: &FlowResume,
    modifier: Option<&SceneModifier>,
) -> anyhow::Result<()> {
    if session.status.is_terminal() {
        tracing::warn!(
            session_id = %session.id,
            status = session.status.as_str(),
            "attempt to resume terminal session, ignoring"
        );
        return Ok(());
    }

    let sprint = rt.engine.resume(assets, contact, session, resume).await?;

    let mut tx = rt.db.begin().await?;
    models::update_session(&mut tx, session.id, &sprint.session).await?;
    models::upsert_runs(
        &mut tx,
        assets.org_id(),
        contact.id,
        session.id,
        None,
        &sprint.runs,
    )
    .await?;

    let mut scene = Scene::new(contact);
    scene.attach_session(session.id, &sprint.session);
    scene.incoming_msg = session.incoming_msg.clone();
    if let Some(modifier) = modifier {
        modifier(&mut scene);
    }
    hooks::apply_events(&mut scene, assets, contact, &sprint.events)?;

    let mut scenes = [scene];
    hooks::apply_pre_commit(&mut tx, assets, &mut scenes).await?;
    tx.commit().await?;

    if let Err(err) = hooks::apply_post_commit(rt, assets, &mut scenes).await {
        tracing::error!("error applying post commit hooks: {:#}", err);
    }

    Ok(())
}

/// Execute one batch of a flow start: load the contacts, start them all and
/// complete the owning start if this was its last batch.
pub async fn start_flow_batch(rt: &Runtime, batch: &FlowStartBatch) -> Result<(), TaskError> {
    let assets = rt
        .assets
        .get(&rt.db, batch.org_id)
        .await?
        .ok_or_else(|| TaskError::DataMissing(format!("org {}", batch.org_id)))?;

    let Some(flow) = assets.flow_by_id(batch.flow_id) else {
        tracing::info!(flow_id = %batch.flow_id, "flow for batch no longer exists, failing start");
        models::mark_start_failed(&rt.db, batch.start_id).await?;
        return Ok(());
    };
    let flow_id = flow.id;

    let contacts = models::load_contacts(&rt.db, batch.org_id, &batch.contact_ids).await?;
    let entries: Vec<(Contact, FlowTrigger)> = contacts
        .into_iter()
        .map(|contact| {
            (
                contact,
                FlowTrigger::Start {
                    flow_id,
                    start_id: Some(batch.start_id),
                    parent_summary: None,
                },
            )
        })
        .collect();

    let options = StartOptions {
        interrupt: true,
        start_id: Some(batch.start_id),
        connection_id: None,
    };
    start_flow_for_contacts(rt, &assets, entries, options, None).await?;

    if batch.is_last {
        models::mark_start_complete(&rt.db, batch.start_id).await?;
    }
    Ok(())
}

/// Defer a voice flow to the batch queue: persist a start row for it and
/// enqueue the fan-out task. Voice sessions are never started inline from
/// the contact event loop.
pub async fn trigger_ivr_flow(
    rt: &Runtime,
    org_id: models::OrgId,
    flow_id: models::FlowId,
    contact_ids: Vec<models::ContactId>,
    mark_handled: Option<MarkHandled>,
) -> anyhow::Result<()> {
    let mut start = FlowStart::new(org_id, flow_id, FlowType::Voice);
    start.contact_ids = contact_ids;

    let mut tx = rt.db.begin().await?;
    models::insert_flow_start(&mut tx, &mut start).await?;
    if let Some(mark) = mark_handled {
        models::update_message(
            &mut *tx,
            mark.msg_id,
            models::MsgStatus::Handled,
            mark.visibility,
            mark.msg_type,
            mark.topup_id,
        )
        .await?;
    }
    tx.commit().await?;

    let task = Task::new(TaskType::StartFlow, org_id, &start)?;
    rt.store
        .push(QueueName::Batch, org_id, &task, TaskPriority::Default)
        .await?;
    Ok(())
}
